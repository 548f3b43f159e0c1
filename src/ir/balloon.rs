//! Dex-IR to Method-IR.
//!
//! Every instruction first becomes a list item keyed by its address. Branch
//! targets, try regions, catch chains and debug entries are then inserted
//! before the item at their address, and only after that are the
//! instructions themselves rewritten into IR form.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::config::DexOptions;
use crate::dex::code::{DexCatch, DexCode};
use crate::dex::debug::{DexDebugEntryKind, DexDebugItem};
use crate::dex::error::DexError;
use crate::dex::instruction::{DexInstruction, DexOpcodeData, DexRef};
use crate::dex::opcodes::DexOpcode;
use crate::ir::code::IRCode;
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::list::{BranchTarget, CatchEntry, IRList, IRPosition, MethodItem, MieId, TargetKind, TryEntry, TryKind};
use crate::ir::opcode::IROpcode;
use crate::model::pool::DexMethodRef;

struct Layout {
    at: HashMap<u32, MieId>,
    placeholders: HashSet<MieId>,
    end: u32,
}

impl Layout {
    fn item_at(&self, addr: u32, what: &str) -> Result<MieId, DexError> {
        match self.at.get(&addr) {
            Some(id) => Ok(*id),
            None => fail!("{} address {} is not an instruction boundary", what, addr),
        }
    }

    /// Like `item_at`, but the end of the stream maps to `None`.
    fn item_or_end(&self, addr: u32, what: &str) -> Result<Option<MieId>, DexError> {
        if addr == self.end {
            Ok(None)
        } else {
            self.item_at(addr, what).map(Some)
        }
    }
}

/// Converts `code` into Method-IR for `method`.
pub fn balloon(code: &DexCode, method: DexMethodRef, is_static: bool, options: &DexOptions) -> Result<IRCode, DexError> {
    balloon_code(code, method, is_static, options).map_err(|e| e.in_method(&method.to_string()))
}

fn balloon_code(code: &DexCode, method: DexMethodRef, is_static: bool, options: &DexOptions) -> Result<IRCode, DexError> {
    let mut list = IRList::new();
    let addrs = code.addresses();
    let mut layout = Layout {
        at: HashMap::with_capacity(code.insns.len()),
        placeholders: HashSet::new(),
        end: code.size_in_code_units() as u32,
    };
    let mut by_addr: HashMap<u32, usize> = HashMap::with_capacity(code.insns.len());
    let mut ids = Vec::with_capacity(code.insns.len());
    for (i, (insn, addr)) in code.insns.iter().zip(&addrs).enumerate() {
        let next_is_payload = code.insns.get(i + 1).map_or(false, |n| n.opcode().is_payload());
        let placeholder = insn.opcode().is_payload() || (insn.opcode() == DexOpcode::Nop && next_is_payload);
        let id = list.push_back(if placeholder { MethodItem::Fallthrough } else { MethodItem::DexOpcode(insn.clone()) });
        if placeholder {
            layout.placeholders.insert(id);
        }
        layout.at.insert(*addr, id);
        by_addr.insert(*addr, i);
        ids.push(id);
    }

    let mut fill_data: HashMap<MieId, DexOpcodeData> = HashMap::new();
    for (i, insn) in code.insns.iter().enumerate() {
        let op = insn.opcode();
        let (addr, src) = (addrs[i], ids[i]);
        if op.is_branch() {
            let target = layout.item_at(addr.wrapping_add(insn.offset as u32), "branch target")?;
            list.insert_before(Some(target), MethodItem::Target(BranchTarget { src, kind: TargetKind::Simple }));
        } else if op.is_switch() || op == DexOpcode::FillArrayData {
            let payload_addr = addr.wrapping_add(insn.offset as u32);
            let data = by_addr
                .get(&payload_addr)
                .and_then(|p| code.insns[*p].data.as_deref())
                .ok_or_else(|| err!("{} at {} has no payload at {}", op.name(), addr, payload_addr))?;
            match (op, data) {
                (DexOpcode::FillArrayData, DexOpcodeData::FillArrayData { .. }) => {
                    fill_data.insert(src, data.clone());
                }
                (DexOpcode::PackedSwitch, DexOpcodeData::PackedSwitch { .. })
                | (DexOpcode::SparseSwitch, DexOpcodeData::SparseSwitch { .. }) => {
                    for (key, rel) in data.switch_cases() {
                        let target = layout.item_at(addr.wrapping_add(rel as u32), "switch target")?;
                        list.insert_before(Some(target), MethodItem::Target(BranchTarget { src, kind: TargetKind::Case(key) }));
                    }
                }
                _ => fail!("{} at {} points at a {}", op.name(), addr, data.opcode().name()),
            }
        }
    }

    insert_tries(&mut list, code, &layout)?;
    if let Some(debug) = &code.debug_item {
        insert_debug(&mut list, debug, &layout, method);
    }

    let create_init_class = options.create_init_class_insns;
    let mut merged: HashSet<MieId> = HashSet::new();
    for (i, insn) in code.insns.iter().enumerate() {
        let id = ids[i];
        if layout.placeholders.contains(&id) || merged.contains(&id) {
            continue;
        }
        let (mut ir, mut pseudo_dest) = to_ir(insn, addrs[i])?;
        if let Some(data) = fill_data.remove(&id) {
            ir.set_data(data);
        }
        if ir.opcode() == IROpcode::FilledNewArray {
            let next = code.insns.get(i + 1).filter(|n| IROpcode::from_dex_opcode(n.opcode()).map_or(false, |o| o.is_move_result()));
            if let Some(next) = next {
                pseudo_dest = next.regs.first().map(|r| *r as Reg);
                merged.insert(ids[i + 1]);
                list.remove(ids[i + 1]);
            }
        }
        if create_init_class {
            if let Some(owner) = init_class_owner(&ir) {
                if owner != method.class() {
                    let init = IRInstruction::new(IROpcode::InitClass).with_ref(DexRef::Type(owner));
                    list.insert_before(Some(id), MethodItem::Opcode(init));
                }
            }
        }
        let pseudo = match (ir.opcode().move_result_pseudo_for(), pseudo_dest) {
            (Some(op), Some(dest)) => Some(IRInstruction::new(op).with_dest(dest)),
            _ => None,
        };
        list.replace(id, MethodItem::Opcode(ir));
        if let Some(pseudo) = pseudo {
            list.insert_after(id, MethodItem::Opcode(pseudo));
        }
    }

    for id in &layout.placeholders {
        list.remove(*id);
    }

    insert_load_params(&mut list, code, method, is_static)?;

    let debug_item = code
        .debug_item
        .as_ref()
        .map(|d| DexDebugItem { line_start: d.line_start, param_names: d.param_names.clone(), ..DexDebugItem::default() });
    trace!(target: "MTRANS", "ballooned {}: {} insns into {} items", method, code.insns.len(), list.len());
    Ok(IRCode::with_list(code.registers_size as u32, list, debug_item))
}

fn insert_tries(list: &mut IRList, code: &DexCode, layout: &Layout) -> Result<(), DexError> {
    let mut tries: Vec<_> = code.tries.iter().collect();
    tries.sort_by_key(|t| t.start_addr);
    let mut chains: HashMap<&[DexCatch], MieId> = HashMap::new();
    let mut to_link: Vec<(MieId, u32)> = Vec::new();
    for t in tries {
        let head = match chains.get(t.catches.as_slice()) {
            Some(head) => *head,
            None => {
                if t.catches.is_empty() {
                    fail!("try item at {} has no handlers", t.start_addr);
                }
                let items: Vec<MieId> = t
                    .catches
                    .iter()
                    .map(|c| {
                        let id = list.alloc(MethodItem::Catch(CatchEntry { catch_type: c.ty, next: None }));
                        to_link.push((id, c.addr));
                        id
                    })
                    .collect();
                for w in items.windows(2) {
                    if let Some(MethodItem::Catch(c)) = list.get_mut(w[0]) {
                        c.next = Some(w[1]);
                    }
                }
                chains.insert(t.catches.as_slice(), items[0]);
                items[0]
            }
        };
        let start = layout.item_at(t.start_addr, "try start")?;
        let end = layout.item_or_end(t.end_addr(), "try end")?;
        list.insert_before(Some(start), MethodItem::Try(TryEntry { kind: TryKind::Start, catch_start: head }));
        list.insert_before(end, MethodItem::Try(TryEntry { kind: TryKind::End, catch_start: head }));
    }
    // handlers go in only after every region is bracketed
    for (id, addr) in to_link {
        let handler = layout.item_at(addr, "handler")?;
        list.link_before(Some(handler), id);
    }
    Ok(())
}

fn insert_debug(list: &mut IRList, debug: &DexDebugItem, layout: &Layout, method: DexMethodRef) {
    // Parents stay off the instruction stream; only child positions point at them.
    let mut parent_ids: Vec<MieId> = Vec::with_capacity(debug.parents.len());
    for (slot, p) in debug.parents.iter().enumerate() {
        let parent = p.parent.filter(|n| (*n as usize) < slot).and_then(|n| parent_ids.get(n as usize).copied());
        let position = IRPosition { line: p.line, file: p.file, method: p.method, parent };
        parent_ids.push(list.alloc(MethodItem::Position(position)));
    }
    for entry in &debug.entries {
        let target = layout.at.get(&entry.addr).copied().filter(|id| !layout.placeholders.contains(id));
        let Some(target) = target else {
            trace!(target: "MTRANS", "{}: debug entry at {} has no instruction", method, entry.addr);
            continue;
        };
        let item = match entry.kind {
            DexDebugEntryKind::Position(pos) => MethodItem::Position(IRPosition {
                line: pos.line,
                file: pos.file,
                method: pos.method.or(Some(method)),
                parent: pos.parent.and_then(|n| parent_ids.get(n as usize).copied()),
            }),
            DexDebugEntryKind::Instruction(insn) => MethodItem::Debug(insn),
        };
        list.insert_before(Some(target), item);
    }
}

fn insert_load_params(list: &mut IRList, code: &DexCode, method: DexMethodRef, is_static: bool) -> Result<(), DexError> {
    let args = method.proto().args();
    let width: u32 = args.iter().map(|t| if t.is_wide() { 2 } else { 1 }).sum::<u32>() + if is_static { 0 } else { 1 };
    if width != code.ins_size as u32 {
        fail!("ins_size {} does not match the {} parameter registers of the prototype", code.ins_size, width);
    }
    let Some(mut reg) = (code.registers_size as u32).checked_sub(width) else {
        fail!("{} parameter registers exceed the frame of {}", width, code.registers_size);
    };
    let mut params = Vec::with_capacity(args.len() + 1);
    if !is_static {
        params.push(IRInstruction::new(IROpcode::LoadParamObject).with_dest(reg));
        reg += 1;
    }
    for t in args.iter() {
        let op = if t.is_wide() {
            IROpcode::LoadParamWide
        } else if t.is_object() {
            IROpcode::LoadParamObject
        } else {
            IROpcode::LoadParam
        };
        params.push(IRInstruction::new(op).with_dest(reg));
        reg += if t.is_wide() { 2 } else { 1 };
    }
    for insn in params.into_iter().rev() {
        list.push_front(MethodItem::Opcode(insn));
    }
    Ok(())
}

fn is_2addr(op: DexOpcode) -> bool {
    (DexOpcode::AddInt2Addr.value()..=DexOpcode::RemDouble2Addr.value()).contains(&op.value())
}

/// The class a static access may initialize.
fn init_class_owner(ir: &IRInstruction) -> Option<crate::model::pool::DexType> {
    let op = ir.opcode();
    if op.is_an_sget() || op.is_an_sput() {
        ir.get_field().map(|f| f.class())
    } else if op == IROpcode::InvokeStatic {
        ir.get_method().map(|m| m.class())
    } else {
        None
    }
}

/// Rewrites one instruction. Returns the IR form and, for producers with a
/// pseudo result, the register that result goes to.
fn to_ir(insn: &DexInstruction, addr: u32) -> Result<(IRInstruction, Option<Reg>), DexError> {
    let dop = insn.opcode();
    let Some(op) = IROpcode::from_dex_opcode(dop) else {
        fail!("{} at {} has no IR form", dop.name(), addr);
    };
    let regs: Vec<Reg> = insn.regs.iter().map(|r| *r as Reg).collect();
    let mut ir = IRInstruction::new(op).with_ref(insn.reference).with_literal(insn.literal);

    let mut dest = None;
    if dop.is_range() {
        let expanded: Vec<Reg> = insn.srcs().iter().map(|r| *r as Reg).collect();
        ir.set_srcs(&expanded);
    } else if is_2addr(dop) {
        dest = regs.first().copied();
        ir.set_srcs(&regs);
    } else if dop == DexOpcode::CheckCast {
        dest = regs.first().copied();
        ir.set_srcs(&regs);
    } else if dop.has_dest() {
        dest = regs.first().copied();
        ir.set_srcs(regs.get(1..).unwrap_or(&[]));
    } else {
        ir.set_srcs(&regs);
    }

    if op.is_invoke() {
        // one register per argument; a wide argument keeps its low half
        let raw: Vec<Reg> = ir.srcs().to_vec();
        let mut args = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            let arg = args.len();
            args.push(raw[i]);
            i += if ir.invoke_arg_is_wide(arg) { 2 } else { 1 };
        }
        ir.set_srcs(&args);
    }

    if op.has_move_result_pseudo() {
        return Ok((ir, dest));
    }
    if let Some(d) = dest {
        ir.set_dest(d);
    }
    Ok((ir, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::code::DexTryItem;
    use crate::dex::debug::{DexDebugEntry, DexPosition};
    use crate::model::pool::{DexProto, DexString, DexType, DexTypeList};

    fn method(args: &[&str], ret: &str) -> DexMethodRef {
        let args = DexTypeList::make(args.iter().map(|a| DexType::make(a)).collect());
        DexMethodRef::make(DexType::make("Lballoon/T;"), DexString::make("m"), DexProto::make(DexType::make(ret), args))
    }

    fn opcodes(code: &IRCode) -> Vec<IROpcode> {
        code.list().instructions().map(|(_, i)| i.opcode()).collect()
    }

    #[test]
    fn parameters_and_pseudo_results() {
        let m = method(&["J", "Ljava/lang/Object;"], "Ljava/lang/Object;");
        let code = DexCode {
            registers_size: 5,
            ins_size: 4,
            outs_size: 0,
            insns: vec![
                DexInstruction::new(DexOpcode::CheckCast)
                    .with_regs(&[4])
                    .with_ref(DexRef::Type(DexType::make("Ljava/lang/String;"))),
                DexInstruction::new(DexOpcode::ReturnObject).with_regs(&[4]),
            ],
            tries: vec![],
            debug_item: None,
        };
        let ir = balloon(&code, m, false, &DexOptions::default()).unwrap();
        assert_eq!(
            opcodes(&ir),
            vec![
                IROpcode::LoadParamObject,
                IROpcode::LoadParamWide,
                IROpcode::LoadParamObject,
                IROpcode::CheckCast,
                IROpcode::MoveResultPseudoObject,
                IROpcode::ReturnObject
            ]
        );
        let dests: Vec<Option<Reg>> = ir.list().instructions().map(|(_, i)| i.dest()).collect();
        assert_eq!(dests[..3], [Some(1), Some(2), Some(4)]);
        assert_eq!(dests[4], Some(4));
    }

    #[test]
    fn switch_payloads_become_case_targets() {
        let m = method(&[], "V");
        let code = DexCode {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![
                DexInstruction::new(DexOpcode::PackedSwitch).with_regs(&[0]).with_offset(6),
                DexInstruction::new(DexOpcode::ReturnVoid),
                DexInstruction::new(DexOpcode::ReturnVoid),
                DexInstruction::new(DexOpcode::Nop),
                DexInstruction::payload(DexOpcodeData::PackedSwitch { first_key: 3, targets: vec![3, 4] }),
            ],
            tries: vec![],
            debug_item: None,
        };
        let ir = balloon(&code, m, true, &DexOptions::default()).unwrap();
        let cases: Vec<TargetKind> = ir
            .list()
            .iter()
            .filter_map(|(_, i)| match i {
                MethodItem::Target(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(cases, vec![TargetKind::Case(3), TargetKind::Case(4)]);
        assert_eq!(opcodes(&ir), vec![IROpcode::Switch, IROpcode::ReturnVoid, IROpcode::ReturnVoid]);
        assert!(!ir.list().iter().any(|(_, i)| matches!(i, MethodItem::Fallthrough)));
    }

    #[test]
    fn tries_catches_and_positions() {
        let m = method(&[], "V");
        let code = DexCode {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![
                DexInstruction::new(DexOpcode::Nop),
                DexInstruction::new(DexOpcode::ReturnVoid),
                DexInstruction::new(DexOpcode::MoveException).with_regs(&[0]),
                DexInstruction::new(DexOpcode::ReturnVoid),
            ],
            tries: vec![DexTryItem {
                start_addr: 0,
                insn_count: 1,
                catches: vec![DexCatch { ty: None, addr: 2 }],
            }],
            debug_item: Some(DexDebugItem {
                line_start: 10,
                param_names: vec![],
                entries: vec![
                    DexDebugEntry { addr: 0, kind: DexDebugEntryKind::Position(DexPosition::new(10, None)) },
                    DexDebugEntry { addr: 9, kind: DexDebugEntryKind::Position(DexPosition::new(11, None)) },
                ],
                ..DexDebugItem::default()
            }),
        };
        let ir = balloon(&code, m, true, &DexOptions::default()).unwrap();
        let kinds: Vec<&str> = ir
            .list()
            .iter()
            .map(|(_, i)| match i {
                MethodItem::Try(t) if t.kind == TryKind::Start => "start",
                MethodItem::Try(_) => "end",
                MethodItem::Catch(_) => "catch",
                MethodItem::Position(_) => "pos",
                MethodItem::Opcode(_) => "op",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["start", "pos", "op", "end", "op", "catch", "op", "op"]);
        assert_eq!(ir.debug_item().map(|d| d.line_start), Some(10));
    }

    #[test]
    fn filled_new_array_absorbs_its_move_result() {
        let m = method(&[], "V");
        let code = DexCode {
            registers_size: 3,
            ins_size: 0,
            outs_size: 0,
            insns: vec![
                DexInstruction::new(DexOpcode::FilledNewArray)
                    .with_regs(&[0, 1])
                    .with_ref(DexRef::Type(DexType::make("[I"))),
                DexInstruction::new(DexOpcode::MoveResultObject).with_regs(&[2]),
                DexInstruction::new(DexOpcode::ReturnVoid),
            ],
            tries: vec![],
            debug_item: None,
        };
        let ir = balloon(&code, m, true, &DexOptions::default()).unwrap();
        assert_eq!(opcodes(&ir), vec![IROpcode::FilledNewArray, IROpcode::MoveResultPseudoObject, IROpcode::ReturnVoid]);
    }

    #[test]
    fn init_class_only_when_enabled() {
        let m = method(&[], "V");
        let field = crate::model::pool::DexFieldRef::make(DexType::make("Lother/C;"), DexString::make("f"), DexType::make("I"));
        let code = DexCode {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![
                DexInstruction::new(DexOpcode::Sget).with_regs(&[0]).with_ref(DexRef::Field(field)),
                DexInstruction::new(DexOpcode::ReturnVoid),
            ],
            tries: vec![],
            debug_item: None,
        };
        let plain = balloon(&code, m, true, &DexOptions::default()).unwrap();
        assert_eq!(opcodes(&plain)[0], IROpcode::Sget);
        let options = DexOptions { create_init_class_insns: true, ..DexOptions::default() };
        let with_init = balloon(&code, m, true, &options).unwrap();
        assert_eq!(opcodes(&with_init)[..2], [IROpcode::InitClass, IROpcode::Sget]);
    }

    #[test]
    fn mismatched_ins_size_is_rejected() {
        let m = method(&["I"], "V");
        let code = DexCode {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![DexInstruction::new(DexOpcode::ReturnVoid)],
            tries: vec![],
            debug_item: None,
        };
        assert!(balloon(&code, m, true, &DexOptions::default()).is_err());
    }
}
