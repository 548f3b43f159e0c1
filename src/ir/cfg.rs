//! Basic blocks and typed edges over a method body.
//!
//! A non-editable graph is a view: blocks list the [`MieId`]s of the
//! underlying [`IRList`], which stays authoritative. An editable graph takes
//! over the body. Targets, try markers, catch markers and gotos are turned
//! into edges and dropped from the list, and [`ControlFlowGraph::linearize`]
//! regenerates them.

use std::collections::{HashMap, HashSet};

use log::trace;
use serde::Serialize;

use crate::dex::error::DexError;
use crate::ir::instruction::IRInstruction;
use crate::ir::list::{BranchTarget, CatchEntry, IRList, MethodItem, MieId, TargetKind, TryEntry, TryKind};
use crate::ir::opcode::IROpcode;
use crate::model::pool::DexType;

pub type BlockId = u32;
pub type EdgeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Fallthrough or unconditional jump.
    Goto,
    /// Taken side of a conditional branch, or one switch case.
    Branch(Option<i32>),
    /// To the handler at `index` in the catch chain.
    Throw { catch_type: Option<DexType>, index: u32 },
    /// To the synthetic exit block.
    Ghost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub src: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    id: BlockId,
    items: Vec<MieId>,
    preds: Vec<EdgeId>,
    succs: Vec<EdgeId>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn items(&self) -> &[MieId] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The last instruction of the block, if any.
    pub fn last_insn(&self, list: &IRList) -> Option<MieId> {
        self.items.iter().rev().copied().find(|id| list.insn(*id).is_some())
    }

    pub fn insns<'a>(&'a self, list: &'a IRList) -> impl Iterator<Item = (MieId, &'a IRInstruction)> + 'a {
        self.items.iter().filter_map(move |id| list.insn(*id).map(|insn| (*id, insn)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EdgeCounts {
    pub goto: usize,
    pub branch: usize,
    pub throw: usize,
    pub ghost: usize,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: Vec<Block>,
    edges: Vec<Option<Edge>>,
    order: Vec<BlockId>,
    exit: Option<BlockId>,
    ghost_exit: Option<BlockId>,
    editable: bool,
}

fn ends_block(op: IROpcode) -> bool {
    op.is_branch() || op.is_return() || op.is_throw()
}

impl ControlFlowGraph {
    fn empty(editable: bool) -> ControlFlowGraph {
        ControlFlowGraph { blocks: Vec::new(), edges: Vec::new(), order: Vec::new(), exit: None, ghost_exit: None, editable }
    }

    fn new_block(&mut self) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block { id, ..Block::default() });
        id
    }

    fn push_block(&mut self) -> BlockId {
        let id = self.new_block();
        self.order.push(id);
        id
    }

    /// Partitions `list` into blocks. In editable mode the list is emptied
    /// and its control-flow items are erased.
    pub fn build(list: &mut IRList, editable: bool) -> Result<ControlFlowGraph, DexError> {
        let mut cfg = Self::partition(list, editable)?;
        if editable {
            for block in cfg.blocks.iter_mut() {
                let mut kept = Vec::with_capacity(block.items.len());
                for id in block.items.drain(..) {
                    let drop = match list.get(id) {
                        Some(MethodItem::Target(_) | MethodItem::Try(_) | MethodItem::Catch(_) | MethodItem::Fallthrough) => true,
                        Some(MethodItem::Opcode(insn)) => insn.opcode().is_goto(),
                        _ => false,
                    };
                    if drop {
                        list.remove(id);
                    } else {
                        kept.push(id);
                    }
                }
                block.items = kept;
            }
            list.relink(&[]);
        }
        cfg.calculate_exit_block(list);
        trace!(
            target: "CFG",
            "built {} blocks with {} edges (editable: {})",
            cfg.order.len(),
            cfg.edges.iter().flatten().count(),
            editable
        );
        Ok(cfg)
    }

    /// A non-editable graph over a list borrowed immutably, for analyses
    /// that only read the body.
    pub fn view(list: &IRList) -> Result<ControlFlowGraph, DexError> {
        let mut cfg = Self::partition(list, false)?;
        cfg.calculate_exit_block(list);
        Ok(cfg)
    }

    fn partition(list: &IRList, editable: bool) -> Result<ControlFlowGraph, DexError> {
        let mut cfg = ControlFlowGraph::empty(editable);
        let mut label_block: HashMap<MieId, BlockId> = HashMap::new();
        let mut try_of_block: HashMap<BlockId, MieId> = HashMap::new();
        let mut targets_by_src: HashMap<MieId, Vec<(MieId, TargetKind)>> = HashMap::new();
        let mut active_try: Option<MieId> = None;
        let mut current = cfg.push_block();
        let mut has_insn = false;

        for (id, item) in list.iter() {
            let is_label = matches!(item, MethodItem::Target(_) | MethodItem::Catch(_) | MethodItem::Try(_));
            if is_label && has_insn {
                current = cfg.push_block();
                has_insn = false;
            }
            cfg.blocks[current as usize].items.push(id);
            match item {
                MethodItem::Try(t) => {
                    active_try = match t.kind {
                        TryKind::Start => Some(t.catch_start),
                        TryKind::End => None,
                    };
                }
                MethodItem::Catch(_) => {
                    label_block.insert(id, current);
                }
                MethodItem::Target(t) => {
                    label_block.insert(id, current);
                    targets_by_src.entry(t.src).or_default().push((id, t.kind));
                }
                MethodItem::Opcode(insn) => {
                    if !has_insn {
                        if let Some(c) = active_try {
                            try_of_block.insert(current, c);
                        }
                    }
                    has_insn = true;
                    let op = insn.opcode();
                    let pseudo_follows = list
                        .next_of(id)
                        .and_then(|n| list.insn(n))
                        .map_or(false, |n| n.opcode().is_move_result_pseudo());
                    let throws_out = active_try.is_some() && op.can_throw() && !pseudo_follows;
                    let pseudo_in_try = active_try.is_some() && op.is_move_result_pseudo();
                    if (ends_block(op) || throws_out || pseudo_in_try) && list.next_of(id).is_some() {
                        current = cfg.push_block();
                        has_insn = false;
                    }
                }
                _ => {}
            }
        }

        let order = cfg.order.clone();
        for (k, b) in order.iter().enumerate() {
            let next = order.get(k + 1).copied();
            let last = cfg.blocks[*b as usize].last_insn(list);
            let last_op = last.and_then(|id| list.insn(id)).map(|i| i.opcode());
            let target_block = |target: MieId| -> Result<BlockId, DexError> {
                match label_block.get(&target) {
                    Some(b) => Ok(*b),
                    None => violation!("target {} is not part of the body", target),
                }
            };
            match (last, last_op) {
                (Some(src), Some(op)) if op.is_branch() => {
                    let targets = targets_by_src.get(&src).cloned().unwrap_or_default();
                    if targets.is_empty() && !op.is_switch() {
                        violation!("{} at {} has no target", op.name(), src);
                    }
                    for (target, kind) in targets {
                        let edge_kind = match (op.is_goto(), kind) {
                            (true, _) => EdgeKind::Goto,
                            (false, TargetKind::Simple) => EdgeKind::Branch(None),
                            (false, TargetKind::Case(key)) => EdgeKind::Branch(Some(key)),
                        };
                        let t = target_block(target)?;
                        cfg.connect(*b, t, edge_kind);
                    }
                    if !op.is_goto() {
                        if let Some(n) = next {
                            cfg.connect(*b, n, EdgeKind::Goto);
                        }
                    }
                }
                (_, Some(op)) if op.is_return() || op.is_throw() => {}
                _ => {
                    if let Some(n) = next {
                        cfg.connect(*b, n, EdgeKind::Goto);
                    }
                }
            }

            let throws = cfg.blocks[*b as usize].insns(list).any(|(_, insn)| insn.opcode().can_throw());
            if let (true, Some(head)) = (throws, try_of_block.get(b).copied()) {
                let mut cursor = Some(head);
                let mut index = 0;
                let mut seen = HashSet::new();
                while let Some(c) = cursor {
                    if !seen.insert(c) {
                        violation!("catch chain starting at {} is cyclic", head);
                    }
                    let entry = match list.get(c) {
                        Some(MethodItem::Catch(entry)) => *entry,
                        _ => violation!("try marker refers to {} which is not a catch", c),
                    };
                    let t = target_block(c)?;
                    cfg.connect(*b, t, EdgeKind::Throw { catch_type: entry.catch_type, index });
                    index += 1;
                    cursor = entry.next;
                }
            }
        }

        Ok(cfg)
    }

    fn connect(&mut self, src: BlockId, target: BlockId, kind: EdgeKind) -> EdgeId {
        let id = self.edges.len() as EdgeId;
        self.edges.push(Some(Edge { src, target, kind }));
        self.blocks[src as usize].succs.push(id);
        self.blocks[target as usize].preds.push(id);
        id
    }

    fn disconnect(&mut self, id: EdgeId) -> Option<Edge> {
        let edge = self.edges.get_mut(id as usize).and_then(|e| e.take())?;
        self.blocks[edge.src as usize].succs.retain(|e| *e != id);
        self.blocks[edge.target as usize].preds.retain(|e| *e != id);
        Some(edge)
    }

    pub fn editable(&self) -> bool {
        self.editable
    }

    fn check_editable(&self) -> Result<(), DexError> {
        if !self.editable {
            violation!("mutation of a non-editable CFG");
        }
        Ok(())
    }

    fn check_block(&self, b: BlockId) -> Result<(), DexError> {
        if (b as usize) >= self.blocks.len() {
            violation!("no block B{}", b);
        }
        Ok(())
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.order.first().copied()
    }

    pub fn exit_block(&self) -> Option<BlockId> {
        self.exit
    }

    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    pub fn block(&self, b: BlockId) -> Option<&Block> {
        self.blocks.get(b as usize)
    }

    /// Blocks in layout order, without the synthetic exit block.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().map(move |b| &self.blocks[*b as usize])
    }

    pub fn edge(&self, e: EdgeId) -> Option<&Edge> {
        self.edges.get(e as usize).and_then(|e| e.as_ref())
    }

    pub fn preds(&self, b: BlockId) -> Vec<&Edge> {
        self.block(b).map_or_else(Vec::new, |blk| blk.preds.iter().filter_map(|e| self.edge(*e)).collect())
    }

    pub fn succs(&self, b: BlockId) -> Vec<&Edge> {
        self.block(b).map_or_else(Vec::new, |blk| blk.succs.iter().filter_map(|e| self.edge(*e)).collect())
    }

    pub fn pred_ids(&self, b: BlockId) -> Vec<EdgeId> {
        self.block(b).map_or_else(Vec::new, |blk| blk.preds.clone())
    }

    pub fn succ_ids(&self, b: BlockId) -> Vec<EdgeId> {
        self.block(b).map_or_else(Vec::new, |blk| blk.succs.clone())
    }

    pub fn block_of(&self, id: MieId) -> Option<BlockId> {
        self.order.iter().copied().find(|b| self.blocks[*b as usize].items.contains(&id))
    }

    pub fn edge_counts(&self) -> EdgeCounts {
        let mut counts = EdgeCounts::default();
        for edge in self.edges.iter().flatten() {
            match edge.kind {
                EdgeKind::Goto => counts.goto += 1,
                EdgeKind::Branch(_) => counts.branch += 1,
                EdgeKind::Throw { .. } => counts.throw += 1,
                EdgeKind::Ghost => counts.ghost += 1,
            }
        }
        counts
    }

    /// Blocks reachable from the entry, in reverse post-order.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let Some(entry) = self.entry_block() else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut post = Vec::with_capacity(self.order.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry);
        while let Some((b, i)) = stack.pop() {
            let succs = &self.blocks[b as usize].succs;
            if let Some(e) = succs.get(i) {
                stack.push((b, i + 1));
                if let Some(edge) = self.edge(*e) {
                    if edge.kind != EdgeKind::Ghost && visited.insert(edge.target) {
                        stack.push((edge.target, 0));
                    }
                }
            } else {
                post.push(b);
            }
        }
        post.reverse();
        post
    }

    /// Connects every returning or throwing block to a single exit. A lone
    /// exiting block is itself the exit; otherwise a synthetic block with
    /// ghost edges is used.
    pub fn calculate_exit_block(&mut self, list: &IRList) -> Option<BlockId> {
        if let Some(ghost) = self.ghost_exit {
            for e in self.blocks[ghost as usize].preds.clone() {
                self.disconnect(e);
            }
        }
        let exits: Vec<BlockId> = self
            .order
            .iter()
            .copied()
            .filter(|b| {
                self.blocks[*b as usize]
                    .last_insn(list)
                    .and_then(|id| list.insn(id))
                    .map_or(false, |i| i.opcode().is_return() || i.opcode().is_throw())
            })
            .collect();
        self.exit = match exits.len() {
            0 => None,
            1 => Some(exits[0]),
            _ => {
                let ghost = match self.ghost_exit {
                    Some(g) => g,
                    None => {
                        let g = self.new_block();
                        self.ghost_exit = Some(g);
                        g
                    }
                };
                for b in exits {
                    self.connect(b, ghost, EdgeKind::Ghost);
                }
                Some(ghost)
            }
        };
        self.exit
    }

    pub fn add_edge(&mut self, src: BlockId, target: BlockId, kind: EdgeKind) -> Result<EdgeId, DexError> {
        self.check_editable()?;
        self.check_block(src)?;
        self.check_block(target)?;
        if kind == EdgeKind::Goto && self.succs(src).iter().any(|e| e.kind == EdgeKind::Goto) {
            violation!("B{} already has a goto successor", src);
        }
        Ok(self.connect(src, target, kind))
    }

    pub fn remove_edge(&mut self, edge: EdgeId) -> Result<Edge, DexError> {
        self.check_editable()?;
        match self.disconnect(edge) {
            Some(e) => Ok(e),
            None => violation!("no edge {}", edge),
        }
    }

    /// Moves every item after `after` into a new block placed right after
    /// `block`, which then falls through to it.
    pub fn split_block(&mut self, list: &IRList, block: BlockId, after: MieId) -> Result<BlockId, DexError> {
        self.check_editable()?;
        self.check_block(block)?;
        let Some(pos) = self.blocks[block as usize].items.iter().position(|id| *id == after) else {
            violation!("{} is not in B{}", after, block);
        };
        let rest = self.blocks[block as usize].items.split_off(pos + 1);
        if rest.first().and_then(|id| list.insn(*id)).map_or(false, |i| i.opcode().is_move_result_pseudo()) {
            self.blocks[block as usize].items.extend(rest);
            violation!("splitting B{} would separate {} from its move-result-pseudo", block, after);
        }
        let new = self.new_block();
        self.blocks[new as usize].items = rest;
        let succs = std::mem::take(&mut self.blocks[block as usize].succs);
        for e in &succs {
            if let Some(edge) = self.edges[*e as usize].as_mut() {
                edge.src = new;
            }
        }
        self.blocks[new as usize].succs = succs;
        let at = self.order.iter().position(|b| *b == block).map_or(self.order.len(), |i| i + 1);
        self.order.insert(at, new);
        self.connect(block, new, EdgeKind::Goto);
        trace!(target: "CFG", "split B{} after {} into B{}", block, after, new);
        Ok(new)
    }

    fn locate(&self, id: MieId) -> Result<(BlockId, usize), DexError> {
        for b in &self.order {
            if let Some(i) = self.blocks[*b as usize].items.iter().position(|x| *x == id) {
                return Ok((*b, i));
            }
        }
        violation!("{} is not in any block", id)
    }

    /// Replaces a non-branch instruction with `replacement`.
    pub fn replace_instruction(
        &mut self,
        list: &mut IRList,
        id: MieId,
        replacement: Vec<IRInstruction>,
    ) -> Result<Vec<MieId>, DexError> {
        self.check_editable()?;
        let (b, i) = self.locate(id)?;
        match list.insn(id) {
            Some(insn) if insn.opcode().is_branch() => violation!("cannot replace branch {}", insn),
            Some(_) => {}
            None => violation!("{} is not an instruction", id),
        }
        if let Some(insn) = replacement.iter().find(|i| i.opcode().is_branch()) {
            violation!("replacement {} would need new edges", insn);
        }
        let new_ids: Vec<MieId> = replacement.into_iter().map(|insn| list.alloc(MethodItem::Opcode(insn))).collect();
        self.blocks[b as usize].items.splice(i..=i, new_ids.iter().copied());
        list.remove(id);
        Ok(new_ids)
    }

    pub fn insert_before(&mut self, list: &mut IRList, id: MieId, insns: Vec<IRInstruction>) -> Result<Vec<MieId>, DexError> {
        self.check_editable()?;
        let (b, i) = self.locate(id)?;
        if let Some(insn) = insns.iter().find(|i| i.opcode().is_branch()) {
            violation!("inserted {} would need new edges", insn);
        }
        let new_ids: Vec<MieId> = insns.into_iter().map(|insn| list.alloc(MethodItem::Opcode(insn))).collect();
        self.blocks[b as usize].items.splice(i..i, new_ids.iter().copied());
        Ok(new_ids)
    }

    /// Removes a non-branch instruction along with its move-result-pseudo.
    pub fn remove_instruction(&mut self, list: &mut IRList, id: MieId) -> Result<(), DexError> {
        self.check_editable()?;
        let (b, i) = self.locate(id)?;
        let Some(insn) = list.insn(id) else {
            violation!("{} is not an instruction", id);
        };
        if insn.opcode().is_branch() {
            violation!("cannot remove branch {}; remove its edges instead", insn);
        }
        let items = &mut self.blocks[b as usize].items;
        let pseudo = items.get(i + 1).copied().filter(|n| list.insn(*n).map_or(false, |x| x.opcode().is_move_result_pseudo()));
        if let Some(p) = pseudo {
            items.remove(i + 1);
            list.remove(p);
        }
        items.remove(i);
        list.remove(id);
        Ok(())
    }

    fn goto_succ(&self, b: BlockId) -> Option<BlockId> {
        self.succs(b).into_iter().find(|e| e.kind == EdgeKind::Goto).map(|e| e.target)
    }

    fn throw_list(&self, b: BlockId) -> Vec<(u32, Option<DexType>, BlockId)> {
        let mut throws: Vec<(u32, Option<DexType>, BlockId)> = self
            .succs(b)
            .into_iter()
            .filter_map(|e| match e.kind {
                EdgeKind::Throw { catch_type, index } => Some((index, catch_type, e.target)),
                _ => None,
            })
            .collect();
        throws.sort_by_key(|t| t.0);
        throws
    }

    /// Rebuilds the textual order of `list` from the graph. A non-editable
    /// graph leaves the list untouched.
    pub fn linearize(self, list: &mut IRList) -> Result<(), DexError> {
        if !self.editable {
            return Ok(());
        }
        let order = self.order.clone();
        let mut gotos: HashMap<BlockId, MieId> = HashMap::new();
        for (k, b) in order.iter().enumerate() {
            if let Some(s) = self.goto_succ(*b) {
                if order.get(k + 1) != Some(&s) {
                    gotos.insert(*b, list.alloc(MethodItem::Opcode(IRInstruction::new(IROpcode::Goto))));
                }
            }
        }

        let mut chains: HashMap<Vec<(Option<DexType>, BlockId)>, MieId> = HashMap::new();
        let mut chain_of: HashMap<BlockId, MieId> = HashMap::new();
        let mut handler_catches: HashMap<BlockId, Vec<MieId>> = HashMap::new();
        for b in &order {
            let throws: Vec<(Option<DexType>, BlockId)> = self.throw_list(*b).into_iter().map(|(_, t, h)| (t, h)).collect();
            if throws.is_empty() {
                continue;
            }
            let head = match chains.get(&throws) {
                Some(head) => *head,
                None => {
                    let ids: Vec<MieId> = throws
                        .iter()
                        .map(|(ty, _)| list.alloc(MethodItem::Catch(CatchEntry { catch_type: *ty, next: None })))
                        .collect();
                    for w in ids.windows(2) {
                        if let Some(MethodItem::Catch(c)) = list.get_mut(w[0]) {
                            c.next = Some(w[1]);
                        }
                    }
                    for (id, (_, handler)) in ids.iter().zip(&throws) {
                        handler_catches.entry(*handler).or_default().push(*id);
                    }
                    chains.insert(throws, ids[0]);
                    ids[0]
                }
            };
            chain_of.insert(*b, head);
        }

        let mut seq: Vec<MieId> = Vec::new();
        let mut active: Option<MieId> = None;
        for b in &order {
            let chain = chain_of.get(b).copied();
            if chain != active {
                if let Some(a) = active {
                    seq.push(list.alloc(MethodItem::Try(TryEntry { kind: TryKind::End, catch_start: a })));
                }
                if let Some(c) = chain {
                    seq.push(list.alloc(MethodItem::Try(TryEntry { kind: TryKind::Start, catch_start: c })));
                }
                active = chain;
            }
            if let Some(catches) = handler_catches.get(b) {
                seq.extend(catches.iter().copied());
            }
            for e in self.preds(*b) {
                let src = match e.kind {
                    EdgeKind::Branch(_) => match self.blocks[e.src as usize].last_insn(list) {
                        Some(src) if list.insn(src).map_or(false, |i| i.opcode().is_branch()) => src,
                        _ => violation!("branch edge B{} -> B{} has no branch instruction", e.src, e.target),
                    },
                    EdgeKind::Goto => match gotos.get(&e.src) {
                        Some(g) => *g,
                        None => continue,
                    },
                    _ => continue,
                };
                let kind = match e.kind {
                    EdgeKind::Branch(Some(key)) => TargetKind::Case(key),
                    _ => TargetKind::Simple,
                };
                seq.push(list.alloc(MethodItem::Target(BranchTarget { src, kind })));
            }
            seq.extend(self.blocks[*b as usize].items.iter().copied());
            if let Some(g) = gotos.get(b) {
                seq.push(*g);
            }
        }
        if let Some(a) = active {
            seq.push(list.alloc(MethodItem::Try(TryEntry { kind: TryKind::End, catch_start: a })));
        }
        list.relink(&seq);
        trace!(target: "CFG", "linearized {} blocks into {} items", order.len(), seq.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::code::{AsmItem, IRCode};

    fn insn(op: IROpcode) -> IRInstruction {
        IRInstruction::new(op)
    }

    fn diamond() -> IRCode {
        IRCode::from_instructions(
            2,
            vec![
                AsmItem::Insn(insn(IROpcode::LoadParam).with_dest(1)),
                AsmItem::branch(insn(IROpcode::IfEqz).with_srcs(&[1]), "else"),
                AsmItem::Insn(insn(IROpcode::Const).with_dest(0).with_literal(1)),
                AsmItem::branch(insn(IROpcode::Goto), "join"),
                AsmItem::label("else"),
                AsmItem::Insn(insn(IROpcode::Const).with_dest(0).with_literal(2)),
                AsmItem::label("join"),
                AsmItem::Insn(insn(IROpcode::Return).with_srcs(&[0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn diamond_edges() {
        let mut code = diamond();
        let cfg = code.build_cfg(false).unwrap();
        assert_eq!(cfg.num_blocks(), 4);
        let counts = cfg.edge_counts();
        assert_eq!(counts, EdgeCounts { goto: 3, branch: 1, throw: 0, ghost: 0 });
        let rpo = cfg.reverse_post_order();
        assert_eq!(rpo.first().copied(), cfg.entry_block());
        assert_eq!(rpo.len(), 4);
        assert_eq!(cfg.exit_block(), rpo.last().copied());
    }

    #[test]
    fn editable_round_trip_restores_branches() {
        let mut code = diamond();
        let before = code.list().count_opcodes();
        code.build_cfg(true).unwrap();
        assert_eq!(code.list().len(), 0);
        code.clear_cfg().unwrap();
        assert_eq!(code.list().count_opcodes(), before);
        let targets = code.list().iter().filter(|(_, i)| matches!(i, MethodItem::Target(_))).count();
        assert_eq!(targets, 2);
    }

    #[test]
    fn split_and_replace() {
        let mut code = diamond();
        let first = code.list().head().unwrap();
        code.build_cfg(true).unwrap();
        let (list, cfg) = code.parts_mut();
        let cfg = cfg.unwrap();
        let entry = cfg.entry_block().unwrap();
        let new = cfg.split_block(list, entry, first).unwrap();
        assert_eq!(cfg.succs(entry).len(), 1);
        assert_eq!(cfg.succs(entry)[0].target, new);
        let replaced =
            cfg.replace_instruction(list, first, vec![insn(IROpcode::LoadParam).with_dest(1), insn(IROpcode::Nop)]);
        assert_eq!(replaced.unwrap().len(), 2);
        code.clear_cfg().unwrap();
        assert_eq!(code.list().count_opcodes(), 7);
    }

    #[test]
    fn multiple_returns_get_a_ghost_exit() {
        let mut code = IRCode::from_instructions(
            1,
            vec![
                AsmItem::Insn(insn(IROpcode::LoadParam).with_dest(0)),
                AsmItem::branch(insn(IROpcode::IfEqz).with_srcs(&[0]), "other"),
                AsmItem::Insn(insn(IROpcode::ReturnVoid)),
                AsmItem::label("other"),
                AsmItem::Insn(insn(IROpcode::ReturnVoid)),
            ],
        )
        .unwrap();
        let cfg = code.build_cfg(false).unwrap();
        assert_eq!(cfg.edge_counts().ghost, 2);
        let exit = cfg.exit_block().unwrap();
        assert!(cfg.blocks().all(|b| b.id() != exit));
    }

    #[test]
    fn throw_edges_follow_the_catch_chain() {
        let exception = DexType::make("Ljava/lang/Exception;");
        let mut code = IRCode::from_instructions(
            2,
            vec![
                AsmItem::try_start("t"),
                AsmItem::Insn(insn(IROpcode::NewInstance).with_ref(crate::dex::instruction::DexRef::Type(exception))),
                AsmItem::Insn(insn(IROpcode::MoveResultPseudoObject).with_dest(0)),
                AsmItem::try_end("t"),
                AsmItem::Insn(insn(IROpcode::ReturnVoid)),
                AsmItem::catch("t", Some(exception)),
                AsmItem::catch("t", None),
                AsmItem::Insn(insn(IROpcode::MoveException).with_dest(1)),
                AsmItem::Insn(insn(IROpcode::ReturnVoid)),
            ],
        )
        .unwrap();
        let cfg = code.build_cfg(true).unwrap();
        assert_eq!(cfg.edge_counts().throw, 2);
        code.clear_cfg().unwrap();
        let catches = code.list().iter().filter(|(_, i)| matches!(i, MethodItem::Catch(_))).count();
        assert_eq!(catches, 2);
        let tries = code.list().iter().filter(|(_, i)| matches!(i, MethodItem::Try(_))).count();
        assert_eq!(tries, 2);
    }

    #[test]
    fn non_editable_graphs_reject_edits() {
        let mut code = diamond();
        let cfg = code.build_cfg(false).unwrap();
        let entry = cfg.entry_block().unwrap();
        assert!(cfg.add_edge(entry, entry, EdgeKind::Goto).is_err());
    }
}
