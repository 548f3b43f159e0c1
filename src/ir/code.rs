//! A method body in Method-IR form.

use std::collections::HashMap;

use crate::dex::debug::DexDebugItem;
use crate::dex::error::DexError;
use crate::ir::cfg::ControlFlowGraph;
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::list::{BranchTarget, CatchEntry, IRList, IRPosition, MethodItem, MieId, TargetKind, TryEntry, TryKind};
use crate::model::pool::DexType;

#[derive(Debug, Clone)]
pub struct IRCode {
    registers_size: u32,
    list: IRList,
    /// Parameter names and the starting line; positions live in the list.
    debug_item: Option<DexDebugItem>,
    cfg: Option<ControlFlowGraph>,
}

/// One line of a hand-assembled body, see [`IRCode::from_instructions`].
#[derive(Debug, Clone)]
pub enum AsmItem {
    Insn(IRInstruction),
    /// A goto, if or switch with its labels; `None` marks the simple target.
    Branch(IRInstruction, Vec<(Option<i32>, String)>),
    Label(String),
    TryStart(String),
    TryEnd(String),
    /// One handler of the named catch chain; handlers link in textual order.
    Catch(String, Option<DexType>),
    Position(u32),
}

impl AsmItem {
    pub fn branch(insn: IRInstruction, label: &str) -> AsmItem {
        AsmItem::Branch(insn, vec![(None, label.to_string())])
    }

    pub fn switch(insn: IRInstruction, cases: &[(i32, &str)]) -> AsmItem {
        AsmItem::Branch(insn, cases.iter().map(|(k, l)| (Some(*k), l.to_string())).collect())
    }

    pub fn label(name: &str) -> AsmItem {
        AsmItem::Label(name.to_string())
    }

    pub fn try_start(chain: &str) -> AsmItem {
        AsmItem::TryStart(chain.to_string())
    }

    pub fn try_end(chain: &str) -> AsmItem {
        AsmItem::TryEnd(chain.to_string())
    }

    pub fn catch(chain: &str, catch_type: Option<DexType>) -> AsmItem {
        AsmItem::Catch(chain.to_string(), catch_type)
    }
}

impl IRCode {
    pub fn new(registers_size: u32) -> IRCode {
        IRCode { registers_size, list: IRList::new(), debug_item: None, cfg: None }
    }

    pub fn with_list(registers_size: u32, list: IRList, debug_item: Option<DexDebugItem>) -> IRCode {
        IRCode { registers_size, list, debug_item, cfg: None }
    }

    /// Assembles a body from a flat item list. Labels attach to the item
    /// that follows them; every branch label becomes a Target placed there.
    pub fn from_instructions(registers_size: u32, items: Vec<AsmItem>) -> Result<IRCode, DexError> {
        let mut list = IRList::new();
        let mut anchors: HashMap<String, Option<MieId>> = HashMap::new();
        let mut pending: Vec<String> = Vec::new();
        let mut branches: Vec<(MieId, Vec<(Option<i32>, String)>)> = Vec::new();
        let mut chains: HashMap<String, Vec<MieId>> = HashMap::new();
        let mut markers: Vec<(MieId, String)> = Vec::new();

        for item in items {
            let id = match item {
                AsmItem::Label(name) => {
                    pending.push(name);
                    continue;
                }
                AsmItem::Insn(insn) => list.push_back(MethodItem::Opcode(insn)),
                AsmItem::Branch(insn, labels) => {
                    if !insn.opcode().is_branch() {
                        fail!("{} does not take labels", insn.opcode().name());
                    }
                    let id = list.push_back(MethodItem::Opcode(insn));
                    branches.push((id, labels));
                    id
                }
                AsmItem::TryStart(chain) | AsmItem::TryEnd(chain) if chain.is_empty() => {
                    fail!("try marker without a chain name")
                }
                AsmItem::TryStart(chain) => {
                    let id = list.push_back(MethodItem::Fallthrough);
                    list.replace(id, MethodItem::Try(TryEntry { kind: TryKind::Start, catch_start: id }));
                    markers.push((id, chain));
                    id
                }
                AsmItem::TryEnd(chain) => {
                    let id = list.push_back(MethodItem::Fallthrough);
                    list.replace(id, MethodItem::Try(TryEntry { kind: TryKind::End, catch_start: id }));
                    markers.push((id, chain));
                    id
                }
                AsmItem::Catch(chain, catch_type) => {
                    let id = list.push_back(MethodItem::Catch(CatchEntry { catch_type, next: None }));
                    chains.entry(chain).or_default().push(id);
                    id
                }
                AsmItem::Position(line) => list.push_back(MethodItem::Position(IRPosition::new(line, None))),
            };
            for name in pending.drain(..) {
                anchors.insert(name, Some(id));
            }
        }
        for name in pending.drain(..) {
            anchors.insert(name, None);
        }

        for ids in chains.values() {
            for w in ids.windows(2) {
                if let Some(MethodItem::Catch(c)) = list.get_mut(w[0]) {
                    c.next = Some(w[1]);
                }
            }
        }
        for (id, chain) in markers {
            let Some(head) = chains.get(&chain).and_then(|ids| ids.first()).copied() else {
                fail!("try marker names unknown catch chain {}", chain);
            };
            if let Some(MethodItem::Try(t)) = list.get_mut(id) {
                t.catch_start = head;
            }
        }
        for (src, labels) in branches {
            for (key, label) in labels {
                let Some(anchor) = anchors.get(&label).copied() else {
                    fail!("undefined label {}", label);
                };
                let kind = key.map_or(TargetKind::Simple, TargetKind::Case);
                list.insert_before(anchor, MethodItem::Target(BranchTarget { src, kind }));
            }
        }
        Ok(IRCode::with_list(registers_size, list, None))
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = size;
    }

    /// Reserves `width` fresh registers and returns the first.
    pub fn allocate_temp(&mut self, width: u32) -> Reg {
        let r = self.registers_size;
        self.registers_size += width;
        r
    }

    pub fn list(&self) -> &IRList {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut IRList {
        &mut self.list
    }

    pub fn debug_item(&self) -> Option<&DexDebugItem> {
        self.debug_item.as_ref()
    }

    pub fn set_debug_item(&mut self, item: Option<DexDebugItem>) {
        self.debug_item = item;
    }

    pub fn cfg(&self) -> Option<&ControlFlowGraph> {
        self.cfg.as_ref()
    }

    pub fn cfg_mut(&mut self) -> Option<&mut ControlFlowGraph> {
        self.cfg.as_mut()
    }

    /// Split borrow for graph edits that also touch the arena.
    pub fn parts_mut(&mut self) -> (&mut IRList, Option<&mut ControlFlowGraph>) {
        (&mut self.list, self.cfg.as_mut())
    }

    pub fn editable_cfg_built(&self) -> bool {
        self.cfg.as_ref().map_or(false, |c| c.editable())
    }

    /// Builds (or rebuilds) the graph. An existing editable graph is
    /// linearized first.
    pub fn build_cfg(&mut self, editable: bool) -> Result<&mut ControlFlowGraph, DexError> {
        self.clear_cfg()?;
        let cfg = ControlFlowGraph::build(&mut self.list, editable)?;
        Ok(self.cfg.insert(cfg))
    }

    /// Drops the graph, writing an editable one back into the list.
    pub fn clear_cfg(&mut self) -> Result<(), DexError> {
        if let Some(cfg) = self.cfg.take() {
            cfg.linearize(&mut self.list)?;
        }
        Ok(())
    }

    pub fn count_opcodes(&self) -> usize {
        self.list.count_opcodes()
    }

    /// The load-param instructions of the prologue, in order.
    pub fn param_instructions(&self) -> Vec<MieId> {
        self.list
            .instructions()
            .take_while(|(_, insn)| insn.opcode().is_load_param())
            .map(|(id, _)| id)
            .collect()
    }

    /// Independent copy of the body. Without an editable graph the arena is
    /// compacted; position parents outside the body are cut either way.
    pub fn deep_copy(&self) -> IRCode {
        if self.editable_cfg_built() {
            let mut copy = self.clone();
            copy.list.sever_foreign_parents();
            return copy;
        }
        let (list, _) = self.list.deep_copy();
        IRCode { registers_size: self.registers_size, list, debug_item: self.debug_item.clone(), cfg: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::opcode::IROpcode;

    #[test]
    fn labels_become_targets() {
        let code = IRCode::from_instructions(
            1,
            vec![
                AsmItem::Insn(IRInstruction::new(IROpcode::LoadParam).with_dest(0)),
                AsmItem::switch(IRInstruction::new(IROpcode::Switch).with_srcs(&[0]), &[(1, "a"), (2, "a")]),
                AsmItem::label("a"),
                AsmItem::Insn(IRInstruction::new(IROpcode::ReturnVoid)),
            ],
        )
        .unwrap();
        let cases: Vec<TargetKind> = code
            .list()
            .iter()
            .filter_map(|(_, i)| match i {
                MethodItem::Target(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(cases, vec![TargetKind::Case(1), TargetKind::Case(2)]);
        assert_eq!(code.param_instructions().len(), 1);
    }

    #[test]
    fn unknown_labels_are_rejected() {
        let result = IRCode::from_instructions(0, vec![AsmItem::branch(IRInstruction::new(IROpcode::Goto), "nowhere")]);
        assert!(result.is_err());
    }

    #[test]
    fn deep_copy_is_independent() {
        let original = IRCode::from_instructions(
            2,
            vec![AsmItem::Position(7), AsmItem::Insn(IRInstruction::new(IROpcode::ReturnVoid))],
        )
        .unwrap();
        let mut copy = original.deep_copy();
        let head = copy.list().head().unwrap();
        copy.list_mut().remove(head);
        assert_eq!(original.list().len(), 2);
        assert_eq!(copy.list().len(), 1);
        assert_eq!(copy.allocate_temp(2), 2);
        assert_eq!(copy.registers_size(), 4);
    }
}
