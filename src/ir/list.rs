//! The editable method-item sequence.
//!
//! Items live in an arena addressed by [`MieId`]; the textual order is a
//! doubly-linked chain through the arena. Links between items (targets to
//! their branch, try markers to their catch chain, positions to their parent)
//! are ids, so no item owns another. Erased slots stay empty and ids are
//! never reused within one list.
//!
//! Items may also be allocated detached: they are addressable but not part
//! of the textual order (parent positions of inlined code, blocks of an
//! editable CFG).

use std::collections::HashMap;
use std::fmt;

use crate::dex::debug::DexDebugInstruction;
use crate::dex::instruction::DexInstruction;
use crate::ir::instruction::IRInstruction;
use crate::model::pool::{DexMethodRef, DexString, DexType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MieId(u32);

impl MieId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Simple,
    Case(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    pub src: MieId,
    pub kind: TargetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TryKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryEntry {
    pub kind: TryKind,
    pub catch_start: MieId,
}

/// One link of a catch chain; `catch_type` is `None` for a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    pub catch_type: Option<DexType>,
    pub next: Option<MieId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IRPosition {
    pub line: u32,
    pub file: Option<DexString>,
    pub method: Option<DexMethodRef>,
    pub parent: Option<MieId>,
}

impl IRPosition {
    pub fn new(line: u32, method: Option<DexMethodRef>) -> IRPosition {
        IRPosition { line, file: None, method, parent: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodItem {
    Opcode(IRInstruction),
    DexOpcode(DexInstruction),
    Target(BranchTarget),
    Try(TryEntry),
    Catch(CatchEntry),
    Position(IRPosition),
    Debug(DexDebugInstruction),
    Fallthrough,
}

impl MethodItem {
    pub fn insn(&self) -> Option<&IRInstruction> {
        match self {
            MethodItem::Opcode(insn) => Some(insn),
            _ => None,
        }
    }

    pub fn insn_mut(&mut self) -> Option<&mut IRInstruction> {
        match self {
            MethodItem::Opcode(insn) => Some(insn),
            _ => None,
        }
    }

    pub fn is_opcode(&self) -> bool {
        matches!(self, MethodItem::Opcode(_))
    }
}

#[derive(Debug, Clone)]
struct Node {
    item: MethodItem,
    prev: Option<MieId>,
    next: Option<MieId>,
    linked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IRList {
    nodes: Vec<Option<Node>>,
    head: Option<MieId>,
    tail: Option<MieId>,
    len: usize,
}

pub struct Iter<'a> {
    list: &'a IRList,
    cursor: Option<MieId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (MieId, &'a MethodItem);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.list.node(id)?;
        self.cursor = node.next;
        Some((id, &node.item))
    }
}

impl IRList {
    pub fn new() -> IRList {
        IRList::default()
    }

    fn node(&self, id: MieId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: MieId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    /// Number of linked items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<MieId> {
        self.head
    }

    pub fn tail(&self) -> Option<MieId> {
        self.tail
    }

    pub fn contains(&self, id: MieId) -> bool {
        self.node(id).is_some()
    }

    pub fn is_linked(&self, id: MieId) -> bool {
        self.node(id).map_or(false, |n| n.linked)
    }

    pub fn get(&self, id: MieId) -> Option<&MethodItem> {
        self.node(id).map(|n| &n.item)
    }

    pub fn get_mut(&mut self, id: MieId) -> Option<&mut MethodItem> {
        self.node_mut(id).map(|n| &mut n.item)
    }

    pub fn insn(&self, id: MieId) -> Option<&IRInstruction> {
        self.get(id).and_then(|i| i.insn())
    }

    pub fn insn_mut(&mut self, id: MieId) -> Option<&mut IRInstruction> {
        self.get_mut(id).and_then(|i| i.insn_mut())
    }

    pub fn next_of(&self, id: MieId) -> Option<MieId> {
        self.node(id).and_then(|n| n.next)
    }

    pub fn prev_of(&self, id: MieId) -> Option<MieId> {
        self.node(id).and_then(|n| n.prev)
    }

    /// Allocates a detached item.
    pub fn alloc(&mut self, item: MethodItem) -> MieId {
        let id = MieId(self.nodes.len() as u32);
        self.nodes.push(Some(Node { item, prev: None, next: None, linked: false }));
        id
    }

    fn link_between(&mut self, id: MieId, prev: Option<MieId>, next: Option<MieId>) {
        if let Some(node) = self.node_mut(id) {
            node.prev = prev;
            node.next = next;
            node.linked = true;
        }
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    pub fn push_back(&mut self, item: MethodItem) -> MieId {
        let id = self.alloc(item);
        let tail = self.tail;
        self.link_between(id, tail, None);
        id
    }

    pub fn push_front(&mut self, item: MethodItem) -> MieId {
        let id = self.alloc(item);
        let head = self.head;
        self.link_between(id, None, head);
        id
    }

    /// Inserts before `pos`; `None` appends.
    pub fn insert_before(&mut self, pos: Option<MieId>, item: MethodItem) -> MieId {
        match pos {
            None => self.push_back(item),
            Some(pos) => {
                let id = self.alloc(item);
                let prev = self.prev_of(pos);
                self.link_between(id, prev, Some(pos));
                id
            }
        }
    }

    pub fn insert_after(&mut self, pos: MieId, item: MethodItem) -> MieId {
        let id = self.alloc(item);
        let next = self.next_of(pos);
        self.link_between(id, Some(pos), next);
        id
    }

    /// Links a detached item before `pos`; `None` appends.
    pub fn link_before(&mut self, pos: Option<MieId>, id: MieId) {
        if !self.contains(id) || self.is_linked(id) {
            return;
        }
        match pos {
            None => {
                let tail = self.tail;
                self.link_between(id, tail, None);
            }
            Some(pos) => {
                let prev = self.prev_of(pos);
                self.link_between(id, prev, Some(pos));
            }
        }
    }

    /// Takes an item out of the textual order but keeps it addressable.
    pub fn unlink(&mut self, id: MieId) {
        let Some(node) = self.node(id) else {
            return;
        };
        if !node.linked {
            return;
        }
        let (prev, next) = (node.prev, node.next);
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = None;
            node.linked = false;
        }
        self.len -= 1;
    }

    /// Erases an item and returns it.
    pub fn remove(&mut self, id: MieId) -> Option<MethodItem> {
        self.unlink(id);
        self.nodes.get_mut(id.index()).and_then(|n| n.take()).map(|n| n.item)
    }

    pub fn replace(&mut self, id: MieId, item: MethodItem) -> Option<MethodItem> {
        self.get_mut(id).map(|slot| std::mem::replace(slot, item))
    }

    /// Rebuilds the textual order from `order`. Every previously linked item
    /// missing from `order` becomes detached.
    pub fn relink(&mut self, order: &[MieId]) {
        for node in self.nodes.iter_mut().flatten() {
            node.prev = None;
            node.next = None;
            node.linked = false;
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        for id in order {
            let tail = self.tail;
            self.link_between(*id, tail, None);
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cursor: self.head }
    }

    pub fn ids(&self) -> Vec<MieId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn instructions(&self) -> impl Iterator<Item = (MieId, &IRInstruction)> {
        self.iter().filter_map(|(id, item)| item.insn().map(|i| (id, i)))
    }

    /// Every live item, linked or not, in allocation order.
    pub fn all_items(&self) -> impl Iterator<Item = (MieId, &MethodItem)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| n.as_ref().map(|n| (MieId(i as u32), &n.item)))
    }

    pub fn count_opcodes(&self) -> usize {
        self.instructions().count()
    }

    /// The next linked instruction after `id`, skipping non-instruction items.
    pub fn next_insn(&self, id: MieId) -> Option<MieId> {
        let mut cursor = self.next_of(id);
        while let Some(c) = cursor {
            if self.get(c).map_or(false, |i| i.is_opcode()) {
                return Some(c);
            }
            cursor = self.next_of(c);
        }
        None
    }

    /// Target items that point at `src`.
    pub fn targets_of(&self, src: MieId) -> Vec<(MieId, TargetKind)> {
        self.iter()
            .filter_map(|(id, item)| match item {
                MethodItem::Target(t) if t.src == src => Some((id, t.kind)),
                _ => None,
            })
            .collect()
    }

    /// Removes an instruction together with its pseudo move-result and every
    /// Target that refers to it.
    pub fn remove_opcode(&mut self, id: MieId) -> Option<IRInstruction> {
        let has_pseudo = self.insn(id).map_or(false, |i| i.has_move_result_pseudo());
        if has_pseudo {
            if let Some(next) = self.next_of(id) {
                if self.insn(next).map_or(false, |i| i.opcode().is_move_result_pseudo()) {
                    self.remove(next);
                }
            }
        }
        for (target, _) in self.targets_of(id) {
            self.remove(target);
        }
        match self.remove(id) {
            Some(MethodItem::Opcode(insn)) => Some(insn),
            _ => None,
        }
    }

    /// Copies every live item into a fresh, compacted arena. Links are
    /// remapped; a parent position outside the copied set becomes `None`.
    /// Branch targets and try markers whose branch or catch chain is gone
    /// are left out of the copy and of the returned map.
    pub fn deep_copy(&self) -> (IRList, HashMap<MieId, MieId>) {
        let mut copy = IRList::new();
        let mut remap = HashMap::new();
        for (old, item) in self.iter() {
            remap.insert(old, copy.push_back(item.clone()));
        }
        for (old, item) in self.all_items() {
            if !self.is_linked(old) {
                remap.insert(old, copy.alloc(item.clone()));
            }
        }
        let pairs: Vec<(MieId, MieId)> = remap.iter().map(|(old, new)| (*old, *new)).collect();
        let mut dangling = Vec::new();
        for (old, id) in pairs {
            match copy.get_mut(id) {
                Some(MethodItem::Target(t)) => match remap.get(&t.src) {
                    Some(src) => t.src = *src,
                    None => dangling.push(old),
                },
                Some(MethodItem::Try(t)) => match remap.get(&t.catch_start) {
                    Some(c) => t.catch_start = *c,
                    None => dangling.push(old),
                },
                Some(MethodItem::Catch(c)) => c.next = c.next.and_then(|n| remap.get(&n).copied()),
                Some(MethodItem::Position(p)) => p.parent = p.parent.and_then(|n| remap.get(&n).copied()),
                _ => {}
            }
        }
        for old in dangling {
            if let Some(id) = remap.remove(&old) {
                copy.remove(id);
            }
        }
        (copy, remap)
    }

    /// Drops links to positions that live in another body.
    pub fn sever_foreign_parents(&mut self) {
        let ids: Vec<MieId> = self.all_items().map(|(id, _)| id).collect();
        for id in ids {
            let parent = match self.get(id) {
                Some(MethodItem::Position(p)) => p.parent,
                _ => None,
            };
            if let Some(parent) = parent {
                if !matches!(self.get(parent), Some(MethodItem::Position(_))) {
                    if let Some(MethodItem::Position(p)) = self.get_mut(id) {
                        p.parent = None;
                    }
                }
            }
        }
    }
}

impl fmt::Display for IRList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, item) in self.iter() {
            match item {
                MethodItem::Opcode(insn) => writeln!(f, "{} {}", id, insn)?,
                MethodItem::DexOpcode(insn) => writeln!(f, "{} [dex] {}", id, insn)?,
                MethodItem::Target(t) => writeln!(f, "{} TARGET {:?} <- {}", id, t.kind, t.src)?,
                MethodItem::Try(t) => writeln!(f, "{} TRY_{:?} {}", id, t.kind, t.catch_start)?,
                MethodItem::Catch(c) => writeln!(
                    f,
                    "{} CATCH {}",
                    id,
                    c.catch_type.map_or_else(|| "<any>".to_string(), |t| t.to_string())
                )?,
                MethodItem::Position(p) => writeln!(f, "{} POSITION {}", id, p.line)?,
                MethodItem::Debug(d) => writeln!(f, "{} DEBUG {:?}", id, d)?,
                MethodItem::Fallthrough => writeln!(f, "{} FALLTHROUGH", id)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode::IROpcode;

    fn op(o: IROpcode) -> MethodItem {
        MethodItem::Opcode(IRInstruction::new(o))
    }

    #[test]
    fn insertion_and_removal_keep_order() {
        let mut list = IRList::new();
        let a = list.push_back(op(IROpcode::Nop));
        let c = list.push_back(op(IROpcode::ReturnVoid));
        let b = list.insert_before(Some(c), op(IROpcode::Const));
        let z = list.push_front(MethodItem::Fallthrough);
        assert_eq!(list.ids(), vec![z, a, b, c]);
        list.remove(a);
        assert_eq!(list.ids(), vec![z, b, c]);
        assert_eq!(list.len(), 3);
        assert!(list.get(a).is_none());
        assert_eq!(list.next_insn(z), Some(b));
    }

    #[test]
    fn removing_a_branch_drops_its_targets() {
        let mut list = IRList::new();
        let goto = list.push_back(op(IROpcode::Goto));
        list.push_back(MethodItem::Target(BranchTarget { src: goto, kind: TargetKind::Simple }));
        list.push_back(op(IROpcode::ReturnVoid));
        list.remove_opcode(goto);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn deep_copy_relinks_positions_within_the_body() {
        let mut list = IRList::new();
        let parent = list.push_back(MethodItem::Position(IRPosition::new(1, None)));
        let mut child = IRPosition::new(2, None);
        child.parent = Some(parent);
        let child_id = list.push_back(MethodItem::Position(child));
        list.push_back(op(IROpcode::ReturnVoid));
        list.remove(parent);

        let (copy, remap) = list.deep_copy();
        match copy.get(remap[&child_id]) {
            Some(MethodItem::Position(p)) => assert_eq!(p.parent, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deep_copy_drops_links_into_removed_items() {
        let mut list = IRList::new();
        let goto = list.push_back(op(IROpcode::Goto));
        let target = list.push_back(MethodItem::Target(BranchTarget { src: goto, kind: TargetKind::Simple }));
        let catch = list.alloc(MethodItem::Catch(CatchEntry { catch_type: None, next: None }));
        let start = list.push_back(MethodItem::Try(TryEntry { kind: TryKind::Start, catch_start: catch }));
        let nop = list.push_back(op(IROpcode::Nop));
        let end = list.push_back(MethodItem::Try(TryEntry { kind: TryKind::End, catch_start: catch }));
        list.push_back(op(IROpcode::ReturnVoid));
        list.remove(goto);
        list.remove(catch);

        let (copy, remap) = list.deep_copy();
        for gone in [target, start, end] {
            assert!(!remap.contains_key(&gone));
        }
        assert_eq!(copy.len(), 2);
        assert!(matches!(copy.get(remap[&nop]), Some(MethodItem::Opcode(_))));
        assert!(copy.iter().all(|(_, item)| matches!(item, MethodItem::Opcode(_))));
    }

    #[test]
    fn relink_detaches_missing_items() {
        let mut list = IRList::new();
        let a = list.push_back(op(IROpcode::Nop));
        let b = list.push_back(op(IROpcode::ReturnVoid));
        list.relink(&[b]);
        assert_eq!(list.ids(), vec![b]);
        assert!(list.contains(a) && !list.is_linked(a));
    }
}
