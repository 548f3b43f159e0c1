//! Method-IR to Dex-IR.
//!
//! Sync runs in five stages:
//! 1. Lower every IR instruction to the narrowest Dex form its operands fit.
//! 2. Assign addresses and relax branches until no size changes.
//! 3. Append switch and array payloads.
//! 4. Emit debug positions.
//! 5. Emit try regions.
//!
//! Any IR invariant that does not hold is a structural violation naming
//! the method.

use std::collections::HashMap;

use log::trace;
use num_traits::ToPrimitive;

use crate::dex::code::{DexCatch, DexCode, DexTryItem};
use crate::dex::debug::{DexDebugEntry, DexDebugEntryKind, DexDebugInstruction, DexDebugItem, DexPosition};
use crate::dex::error::{DexError, ErrorKind};
use crate::dex::id_tables::IndexAssigner;
use crate::dex::instruction::{DexInstruction, DexOpcodeData};
use crate::dex::opcodes::DexOpcode;
use crate::ir::code::IRCode;
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::list::{IRList, IRPosition, MethodItem, MieId, TargetKind, TryKind};
use crate::ir::opcode::IROpcode;
use crate::model::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType};

const MAX_TRY_WIDTH: u32 = 0xffff;

type Label = usize;

#[derive(Debug)]
enum Branch {
    None,
    Simple(Label),
    Switch(Vec<(i32, Label)>),
    Fill(DexOpcodeData),
}

#[derive(Debug)]
struct Lowered {
    insn: DexInstruction,
    branch: Branch,
}

impl Lowered {
    fn plain(insn: DexInstruction) -> Lowered {
        Lowered { insn, branch: Branch::None }
    }
}

#[derive(Debug)]
enum Entry {
    Insn(Lowered),
    Label(Label),
    TryStart(MieId),
    TryEnd(MieId),
    Position(IRPosition),
    Debug(DexDebugInstruction),
}

/// Index assigner that only lets the encoder check operand widths.
struct NullIds;

impl IndexAssigner for NullIds {
    fn string_idx(&self, _: DexString) -> Result<u32, DexError> {
        Ok(0)
    }
    fn type_idx(&self, _: DexType) -> Result<u32, DexError> {
        Ok(0)
    }
    fn proto_idx(&self, _: DexProto) -> Result<u32, DexError> {
        Ok(0)
    }
    fn field_idx(&self, _: DexFieldRef) -> Result<u32, DexError> {
        Ok(0)
    }
    fn method_idx(&self, _: DexMethodRef) -> Result<u32, DexError> {
        Ok(0)
    }
}

/// Converts `code` back into a [`DexCode`]. An editable CFG must have been
/// linearized first.
pub fn sync(code: &IRCode, method: DexMethodRef) -> Result<DexCode, DexError> {
    sync_code(code, method).map_err(|e| e.in_method(&method.to_string()))
}

fn sync_code(code: &IRCode, method: DexMethodRef) -> Result<DexCode, DexError> {
    if code.editable_cfg_built() {
        violation!("the body is held by an editable CFG");
    }
    let list = code.list();
    validate(list)?;

    let mut labels: HashMap<MieId, Label> = HashMap::new();
    let mut targets: HashMap<MieId, Vec<(TargetKind, Label)>> = HashMap::new();
    for (id, item) in list.iter() {
        match item {
            MethodItem::Target(t) => {
                let label = labels.len();
                labels.insert(id, label);
                targets.entry(t.src).or_default().push((t.kind, label));
            }
            MethodItem::Catch(_) => {
                let label = labels.len();
                labels.insert(id, label);
            }
            _ => {}
        }
    }

    let mut entries = Vec::with_capacity(list.len());
    let mut param_regs: Vec<(Reg, u32)> = Vec::new();
    let mut outs_size = 0usize;
    let mut prev: Option<&IRInstruction> = None;
    for (id, item) in list.iter() {
        match item {
            MethodItem::Target(_) | MethodItem::Catch(_) => entries.push(Entry::Label(labels[&id])),
            MethodItem::Try(t) => entries.push(match t.kind {
                TryKind::Start => Entry::TryStart(t.catch_start),
                TryKind::End => Entry::TryEnd(t.catch_start),
            }),
            MethodItem::Position(pos) => {
                if position_is_useful(list, id) {
                    entries.push(Entry::Position(*pos));
                }
            }
            MethodItem::Debug(d) => entries.push(Entry::Debug(*d)),
            MethodItem::Fallthrough => {}
            MethodItem::DexOpcode(insn) => violation!("unlowered dex instruction {} at {}", insn, id),
            MethodItem::Opcode(insn) => {
                let op = insn.opcode();
                if op.is_load_param() {
                    let dest = insn.dest().unwrap_or(0);
                    param_regs.push((dest, if op == IROpcode::LoadParamWide { 2 } else { 1 }));
                } else if op.is_move_result_pseudo() {
                    if prev.map_or(false, |p| p.opcode() == IROpcode::FilledNewArray) {
                        let dest = reg_operand(insn.dest(), insn)?;
                        entries.push(Entry::Insn(Lowered::plain(DexInstruction::new(DexOpcode::MoveResultObject).with_regs(&[dest]))));
                    }
                } else if op != IROpcode::InitClass {
                    let pseudo_dest = if op.has_move_result_pseudo() {
                        list.next_of(id).and_then(|n| list.insn(n)).and_then(|n| n.dest())
                    } else {
                        None
                    };
                    if op.is_invoke() {
                        outs_size = outs_size.max(expand_args(insn).len());
                    }
                    for lowered in lower(insn, pseudo_dest, targets.get(&id).map(|v| v.as_slice()).unwrap_or(&[]))? {
                        entries.push(Entry::Insn(lowered));
                    }
                }
                prev = Some(insn);
                continue;
            }
        }
        if !matches!(item, MethodItem::Position(_) | MethodItem::Debug(_)) {
            prev = None;
        }
    }

    let mut next_label = labels.len();
    let (addrs, label_addrs) = relax(&mut entries, &mut next_label)?;

    let mut insns = Vec::new();
    let mut insn_starts = Vec::new();
    let mut payloads: Vec<(usize, u32, DexOpcodeData)> = Vec::new();
    let mut debug_entries = Vec::new();
    let mut last_position: Option<IRPosition> = None;
    let mut parents: Vec<DexPosition> = Vec::new();
    let mut interned_parents: HashMap<MieId, u32> = HashMap::new();
    let mut regions: Vec<(u32, u32, MieId)> = Vec::new();
    let mut open: Option<(MieId, u32)> = None;
    for (entry, addr) in entries.into_iter().zip(addrs.iter().copied()) {
        match entry {
            Entry::Insn(mut lowered) => {
                match lowered.branch {
                    Branch::None => {}
                    Branch::Simple(label) => lowered.insn.offset = label_addrs[label] as i32 - addr as i32,
                    Branch::Switch(cases) => {
                        let data = switch_payload(cases, &label_addrs, addr)?;
                        lowered.insn.set_opcode(match data {
                            DexOpcodeData::PackedSwitch { .. } => DexOpcode::PackedSwitch,
                            _ => DexOpcode::SparseSwitch,
                        });
                        payloads.push((insns.len(), addr, data));
                    }
                    Branch::Fill(data) => payloads.push((insns.len(), addr, data)),
                }
                insn_starts.push(addr);
                insns.push(lowered.insn);
            }
            Entry::Label(_) => {}
            Entry::TryStart(c) => open = Some((c, addr)),
            Entry::TryEnd(c) => {
                if let Some((start_chain, start)) = open.take() {
                    if start_chain != c {
                        violation!("try end at {} closes a different region", addr);
                    }
                    if addr > start {
                        regions.push((start, addr, c));
                    }
                }
            }
            Entry::Position(pos) => {
                if last_position != Some(pos) {
                    let parent = match pos.parent {
                        Some(p) => intern_parent(list, p, &mut parents, &mut interned_parents)?,
                        None => None,
                    };
                    let position = DexPosition {
                        line: pos.line,
                        file: pos.file,
                        method: pos.method.filter(|m| *m != method),
                        parent,
                    };
                    debug_entries.push(DexDebugEntry { addr, kind: DexDebugEntryKind::Position(position) });
                    last_position = Some(pos);
                }
            }
            Entry::Debug(d) => debug_entries.push(DexDebugEntry { addr, kind: DexDebugEntryKind::Instruction(d) }),
        }
    }

    let code_end: u32 = insns.iter().map(|i| i.size() as u32).sum();
    let mut cursor = code_end as u64;
    for (index, addr, data) in payloads {
        if cursor % 2 == 1 {
            insns.push(DexInstruction::new(DexOpcode::Nop));
            cursor += 1;
        }
        insns[index].offset = (cursor - addr as u64) as i32;
        cursor += data.size_in_code_units() as u64;
        insns.push(DexInstruction::payload(data));
    }
    if cursor > u32::MAX as u64 {
        violation!("code of {} units does not fit the code_item", cursor);
    }

    let mut scratch = Vec::new();
    for insn in &insns {
        scratch.clear();
        insn.encode(&mut scratch, &NullIds).map_err(|e| match e.kind() {
            ErrorKind::StructuralViolation { .. } => e,
            _ => DexError::structural(e.to_string()),
        })?;
    }

    let tries = emit_tries(list, &regions, &insn_starts, &labels, &label_addrs)?;
    let (registers_size, ins_size) = frame(code, &param_regs)?;
    let debug_item = match code.debug_item() {
        Some(d) => Some(DexDebugItem {
            line_start: d.line_start,
            param_names: d.param_names.clone(),
            entries: debug_entries,
            parents,
        }),
        None if debug_entries.is_empty() => None,
        None => Some(DexDebugItem {
            line_start: debug_entries
                .iter()
                .find_map(|e| match e.kind {
                    DexDebugEntryKind::Position(p) => Some(p.line),
                    _ => None,
                })
                .unwrap_or(0),
            param_names: vec![None; method.proto().args().len()],
            entries: debug_entries,
            parents,
        }),
    };
    trace!(target: "MTRANS", "synced {}: {} code units, {} tries", method, cursor, tries.len());
    Ok(DexCode {
        registers_size,
        ins_size,
        outs_size: outs_size.min(u16::MAX as usize) as u16,
        insns,
        tries,
        debug_item,
    })
}

/// Checks the invariants every pass must leave behind.
fn validate(list: &IRList) -> Result<(), DexError> {
    let mut open: Option<MieId> = None;
    let mut simple_targets: HashMap<MieId, usize> = HashMap::new();
    let mut prev: Option<&MethodItem> = None;
    for (id, item) in list.iter() {
        match item {
            MethodItem::Target(t) => {
                let src_op = list.insn(t.src).map(|i| i.opcode());
                match (src_op, t.kind) {
                    (Some(op), TargetKind::Simple) if op.is_goto() || op.is_conditional_branch() => {
                        *simple_targets.entry(t.src).or_default() += 1;
                    }
                    (Some(IROpcode::Switch), TargetKind::Case(_)) => {}
                    _ => violation!("target {} refers to {} which is not a matching branch", id, t.src),
                }
                if !list.is_linked(t.src) {
                    violation!("target {} refers to a removed branch", id);
                }
            }
            MethodItem::Try(t) => {
                if !matches!(list.get(t.catch_start), Some(MethodItem::Catch(_))) {
                    violation!("try marker {} has no catch chain", id);
                }
                match (t.kind, open) {
                    (TryKind::Start, None) => open = Some(t.catch_start),
                    (TryKind::Start, Some(_)) => violation!("try start {} inside another try region", id),
                    (TryKind::End, Some(c)) if c == t.catch_start => open = None,
                    (TryKind::End, _) => violation!("try end {} does not match an open region", id),
                }
            }
            MethodItem::DexOpcode(insn) => violation!("unlowered dex instruction {} at {}", insn, id),
            MethodItem::Opcode(insn) if insn.opcode().is_move_result_pseudo() => {
                let primary = match prev {
                    Some(MethodItem::Opcode(p)) => p.opcode().move_result_pseudo_for(),
                    _ => None,
                };
                if primary != Some(insn.opcode()) {
                    violation!("{} at {} does not follow its producer", insn.opcode().name(), id);
                }
            }
            _ => {}
        }
        if let Some(MethodItem::Opcode(p)) = prev {
            let needs_pseudo = p.opcode().has_move_result_pseudo() && p.opcode() != IROpcode::FilledNewArray;
            let has_pseudo = matches!(item, MethodItem::Opcode(i) if i.opcode().is_move_result_pseudo());
            if needs_pseudo && !has_pseudo {
                violation!("{} is not followed by its move-result-pseudo", p);
            }
        }
        prev = Some(item);
    }
    if let Some(MethodItem::Opcode(p)) = prev {
        if p.opcode().has_move_result_pseudo() && p.opcode() != IROpcode::FilledNewArray {
            violation!("{} is not followed by its move-result-pseudo", p);
        }
    }
    if open.is_some() {
        violation!("unclosed try region");
    }
    for (id, insn) in list.instructions() {
        let op = insn.opcode();
        if (op.is_goto() || op.is_conditional_branch()) && simple_targets.get(&id).copied() != Some(1) {
            violation!("{} at {} needs exactly one target", op.name(), id);
        }
    }
    Ok(())
}

/// Copies the parent chain starting at `id` into `parents`, outermost caller
/// first, and returns the slot of `id`. A link to anything but a position
/// ends the chain.
fn intern_parent(
    list: &IRList,
    id: MieId,
    parents: &mut Vec<DexPosition>,
    interned: &mut HashMap<MieId, u32>,
) -> Result<Option<u32>, DexError> {
    let mut chain: Vec<(MieId, IRPosition)> = Vec::new();
    let mut cursor = Some(id);
    while let Some(c) = cursor {
        if interned.contains_key(&c) {
            break;
        }
        let Some(MethodItem::Position(p)) = list.get(c) else {
            break;
        };
        if chain.iter().any(|(seen, _)| *seen == c) {
            violation!("position parent chain through {} is cyclic", c);
        }
        chain.push((c, *p));
        cursor = p.parent;
    }
    for (c, p) in chain.into_iter().rev() {
        let parent = p.parent.and_then(|n| interned.get(&n).copied());
        interned.insert(c, parents.len() as u32);
        parents.push(DexPosition { line: p.line, file: p.file, method: p.method, parent });
    }
    Ok(interned.get(&id).copied())
}

/// A position counts only when the next instruction follows it with no
/// other position in between.
fn position_is_useful(list: &IRList, id: MieId) -> bool {
    let mut cursor = list.next_of(id);
    while let Some(c) = cursor {
        match list.get(c) {
            Some(MethodItem::Opcode(_)) => return true,
            Some(MethodItem::Position(_)) | None => return false,
            _ => cursor = list.next_of(c),
        }
    }
    false
}

fn reg_operand(reg: Option<Reg>, insn: &IRInstruction) -> Result<u16, DexError> {
    match reg.map(u16::try_from) {
        Some(Ok(r)) => Ok(r),
        Some(Err(_)) => violation!("{} uses a register beyond v65535", insn),
        None => violation!("{} is missing a register operand", insn),
    }
}

fn src_operands(insn: &IRInstruction) -> Result<Vec<u16>, DexError> {
    insn.srcs().iter().map(|r| reg_operand(Some(*r), insn)).collect()
}

/// Invoke sources with the high half of every wide argument added back.
fn expand_args(insn: &IRInstruction) -> Vec<Reg> {
    let mut regs = Vec::with_capacity(insn.srcs_size() + 2);
    for (i, r) in insn.srcs().iter().enumerate() {
        regs.push(*r);
        if insn.opcode().is_invoke() && insn.invoke_arg_is_wide(i) {
            regs.push(*r + 1);
        }
    }
    regs
}

fn lower_move(op: IROpcode, dest: u16, src: u16) -> DexInstruction {
    let (narrow, from16, wide) = match op {
        IROpcode::MoveWide => (DexOpcode::MoveWide, DexOpcode::MoveWideFrom16, DexOpcode::MoveWide16),
        IROpcode::MoveObject => (DexOpcode::MoveObject, DexOpcode::MoveObjectFrom16, DexOpcode::MoveObject16),
        _ => (DexOpcode::Move, DexOpcode::MoveFrom16, DexOpcode::Move16),
    };
    let opcode = if dest <= 0xf && src <= 0xf {
        narrow
    } else if dest <= 0xff {
        from16
    } else {
        wide
    };
    DexInstruction::new(opcode).with_regs(&[dest, src])
}

fn lower_const(insn: &IRInstruction, dest: u16) -> Result<DexInstruction, DexError> {
    let lit = insn.literal();
    let Some(v) = lit.to_i32() else {
        violation!("{} literal does not fit 32 bits", insn);
    };
    let opcode = if dest <= 0xf && (-8..=7).contains(&v) {
        DexOpcode::Const4
    } else if v.to_i16().is_some() {
        DexOpcode::Const16
    } else if v & 0xffff == 0 {
        DexOpcode::ConstHigh16
    } else {
        DexOpcode::Const
    };
    Ok(DexInstruction::new(opcode).with_regs(&[dest]).with_literal(v as i64))
}

fn lower_const_wide(insn: &IRInstruction, dest: u16) -> DexInstruction {
    let lit = insn.literal();
    let opcode = if lit.to_i16().is_some() {
        DexOpcode::ConstWide16
    } else if lit.to_i32().is_some() {
        DexOpcode::ConstWide32
    } else if lit & 0xffff_ffff_ffff == 0 {
        DexOpcode::ConstWideHigh16
    } else {
        DexOpcode::ConstWide
    };
    DexInstruction::new(opcode).with_regs(&[dest]).with_literal(lit)
}

fn lower_invoke_like(insn: &IRInstruction, dest_op: (DexOpcode, DexOpcode)) -> Result<DexInstruction, DexError> {
    let regs = expand_args(insn);
    let (plain, range) = dest_op;
    if regs.len() <= 5 && regs.iter().all(|r| *r <= 0xf) {
        let regs: Vec<u16> = regs.iter().map(|r| *r as u16).collect();
        return Ok(DexInstruction::new(plain).with_regs(&regs).with_ref(insn.reference()));
    }
    let first = regs.first().copied().unwrap_or(0);
    let contiguous = regs.iter().enumerate().all(|(i, r)| *r == first + i as Reg);
    if !contiguous {
        violation!("{} needs a range form but its registers are not contiguous", insn);
    }
    let Ok(base) = u16::try_from(first) else {
        violation!("{} range starts beyond v65535", insn);
    };
    Ok(DexInstruction::new(range).with_range(base, regs.len() as u16).with_ref(insn.reference()))
}

fn lower(insn: &IRInstruction, pseudo_dest: Option<Reg>, targets: &[(TargetKind, Label)]) -> Result<Vec<Lowered>, DexError> {
    let op = insn.opcode();
    let dest = || reg_operand(insn.dest(), insn);
    let src = |i: usize| reg_operand(insn.srcs().get(i).copied(), insn);
    let simple_target = || targets.iter().find(|(k, _)| *k == TargetKind::Simple).map(|(_, l)| *l);

    let lowered = match op {
        IROpcode::Move | IROpcode::MoveWide | IROpcode::MoveObject => Lowered::plain(lower_move(op, dest()?, src(0)?)),
        IROpcode::Const => Lowered::plain(lower_const(insn, dest()?)?),
        IROpcode::ConstWide => Lowered::plain(lower_const_wide(insn, dest()?)),
        IROpcode::CheckCast => {
            let s = src(0)?;
            let d = reg_operand(pseudo_dest, insn)?;
            let check = DexInstruction::new(DexOpcode::CheckCast).with_regs(&[d]).with_ref(insn.reference());
            if d != s {
                return Ok(vec![
                    Lowered::plain(lower_move(IROpcode::MoveObject, d, s)),
                    Lowered::plain(check),
                ]);
            }
            Lowered::plain(check)
        }
        IROpcode::InvokeVirtual
        | IROpcode::InvokeSuper
        | IROpcode::InvokeDirect
        | IROpcode::InvokeStatic
        | IROpcode::InvokeInterface => {
            let (Some(plain), Some(range)) = (op.invoke_opcode(false), op.invoke_opcode(true)) else {
                violation!("{} has no encoding", insn);
            };
            Lowered::plain(lower_invoke_like(insn, (plain, range))?)
        }
        IROpcode::FilledNewArray => {
            Lowered::plain(lower_invoke_like(insn, (DexOpcode::FilledNewArray, DexOpcode::FilledNewArrayRange))?)
        }
        IROpcode::Goto => {
            let Some(label) = simple_target() else {
                violation!("goto without a target");
            };
            Lowered { insn: DexInstruction::new(DexOpcode::Goto), branch: Branch::Simple(label) }
        }
        IROpcode::Switch => {
            let cases = targets
                .iter()
                .filter_map(|(k, l)| match k {
                    TargetKind::Case(key) => Some((*key, *l)),
                    TargetKind::Simple => None,
                })
                .collect();
            Lowered { insn: DexInstruction::new(DexOpcode::PackedSwitch).with_regs(&[src(0)?]), branch: Branch::Switch(cases) }
        }
        IROpcode::FillArrayData => {
            let Some(data) = insn.data().cloned() else {
                violation!("{} has no array data", insn);
            };
            Lowered { insn: DexInstruction::new(DexOpcode::FillArrayData).with_regs(&[src(0)?]), branch: Branch::Fill(data) }
        }
        _ if op.is_conditional_branch() => {
            let (Some(dop), Some(label)) = (op.to_dex_opcode(), simple_target()) else {
                violation!("{} without a target", insn);
            };
            Lowered { insn: DexInstruction::new(dop).with_regs(&src_operands(insn)?), branch: Branch::Simple(label) }
        }
        _ if op.is_binop() => {
            let (d, a, b) = (dest()?, src(0)?, src(1)?);
            let two_addr = op.binop_2addr();
            match two_addr {
                Some(o) if d == a && d <= 0xf && b <= 0xf => Lowered::plain(DexInstruction::new(o).with_regs(&[d, b])),
                Some(o) if op.is_commutative() && d == b && d <= 0xf && a <= 0xf => {
                    Lowered::plain(DexInstruction::new(o).with_regs(&[d, a]))
                }
                _ => {
                    let Some(o) = op.to_dex_opcode() else {
                        violation!("{} has no encoding", insn);
                    };
                    Lowered::plain(DexInstruction::new(o).with_regs(&[d, a, b]))
                }
            }
        }
        _ if op.is_binop_lit() => {
            let (d, s, lit) = (dest()?, src(0)?, insn.literal());
            let opcode = match (op.lit8_opcode(), op.lit16_opcode()) {
                (Some(o), _) if lit.to_i8().is_some() => o,
                (_, Some(o)) if lit.to_i16().is_some() => o,
                _ => violation!("{} literal has no encoding", insn),
            };
            Lowered::plain(DexInstruction::new(opcode).with_regs(&[d, s]).with_literal(lit))
        }
        _ => {
            let Some(dop) = op.to_dex_opcode() else {
                violation!("{} has no dex encoding", insn);
            };
            let mut regs = Vec::with_capacity(insn.srcs_size() + 1);
            if op.has_move_result_pseudo() {
                regs.push(reg_operand(pseudo_dest, insn)?);
            } else if let Some(d) = insn.dest() {
                regs.push(reg_operand(Some(d), insn)?);
            }
            regs.extend(src_operands(insn)?);
            Lowered::plain(DexInstruction::new(dop).with_regs(&regs).with_ref(insn.reference()))
        }
    };
    Ok(vec![lowered])
}

fn invert(op: DexOpcode) -> DexOpcode {
    match op {
        DexOpcode::IfEq => DexOpcode::IfNe,
        DexOpcode::IfNe => DexOpcode::IfEq,
        DexOpcode::IfLt => DexOpcode::IfGe,
        DexOpcode::IfGe => DexOpcode::IfLt,
        DexOpcode::IfGt => DexOpcode::IfLe,
        DexOpcode::IfLe => DexOpcode::IfGt,
        DexOpcode::IfEqz => DexOpcode::IfNez,
        DexOpcode::IfNez => DexOpcode::IfEqz,
        DexOpcode::IfLtz => DexOpcode::IfGez,
        DexOpcode::IfGez => DexOpcode::IfLtz,
        DexOpcode::IfGtz => DexOpcode::IfLez,
        DexOpcode::IfLez => DexOpcode::IfGtz,
        other => other,
    }
}

fn goto_rank(op: DexOpcode) -> u8 {
    match op {
        DexOpcode::Goto => 0,
        DexOpcode::Goto16 => 1,
        _ => 2,
    }
}

fn assign_addresses(entries: &[Entry], labels: usize) -> (Vec<u32>, Vec<u32>) {
    let mut addrs = Vec::with_capacity(entries.len());
    let mut label_addrs = vec![0u32; labels];
    let mut addr = 0u32;
    for entry in entries {
        addrs.push(addr);
        match entry {
            Entry::Insn(l) => addr = addr.saturating_add(l.insn.size() as u32),
            Entry::Label(label) => label_addrs[*label] = addr,
            _ => {}
        }
    }
    (addrs, label_addrs)
}

/// Grows gotos and splits out-of-range conditionals until addresses settle.
/// Sizes only ever grow, so the loop terminates.
fn relax(entries: &mut Vec<Entry>, next_label: &mut Label) -> Result<(Vec<u32>, Vec<u32>), DexError> {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let (addrs, label_addrs) = assign_addresses(entries, *next_label);
        let mut changed = false;
        // Splits are applied after the scan so `addrs` stays aligned with `entries`.
        let mut splits: Vec<(usize, Label, Label)> = Vec::new();
        for (i, entry) in entries.iter_mut().enumerate() {
            let Entry::Insn(Lowered { insn, branch: Branch::Simple(label) }) = entry else {
                continue;
            };
            let offset = label_addrs[*label] as i64 - addrs[i] as i64;
            let op = insn.opcode();
            if op.is_goto() {
                let needed = if offset == 0 || offset.to_i16().is_none() {
                    DexOpcode::Goto32
                } else if offset.to_i8().is_none() {
                    DexOpcode::Goto16
                } else {
                    DexOpcode::Goto
                };
                if goto_rank(needed) > goto_rank(op) {
                    insn.set_opcode(needed);
                    changed = true;
                }
            } else if op.is_conditional_branch() && offset.to_i16().is_none() {
                let skip = *next_label;
                *next_label += 1;
                insn.set_opcode(invert(op));
                splits.push((i, std::mem::replace(label, skip), skip));
            }
        }
        for (i, original, skip) in splits.into_iter().rev() {
            let goto = Lowered { insn: DexInstruction::new(DexOpcode::Goto32), branch: Branch::Simple(original) };
            entries.insert(i + 1, Entry::Insn(goto));
            entries.insert(i + 2, Entry::Label(skip));
            changed = true;
        }
        if !changed {
            trace!(target: "MTRANS", "branch relaxation settled after {} round(s)", rounds);
            return Ok((addrs, label_addrs));
        }
    }
}

fn switch_payload(mut cases: Vec<(i32, Label)>, label_addrs: &[u32], switch_addr: u32) -> Result<DexOpcodeData, DexError> {
    cases.sort_by_key(|(k, _)| *k);
    if let Some(w) = cases.windows(2).find(|w| w[0].0 == w[1].0) {
        violation!("switch at {} has duplicate case key {}", switch_addr, w[0].0);
    }
    let targets: Vec<i32> = cases.iter().map(|(_, l)| label_addrs[*l] as i32 - switch_addr as i32).collect();
    let contiguous = cases.windows(2).all(|w| w[0].0.checked_add(1) == Some(w[1].0));
    Ok(if contiguous {
        DexOpcodeData::PackedSwitch { first_key: cases.first().map_or(0, |c| c.0), targets }
    } else {
        DexOpcodeData::SparseSwitch { keys: cases.iter().map(|c| c.0).collect(), targets }
    })
}

fn emit_tries(
    list: &IRList,
    regions: &[(u32, u32, MieId)],
    insn_starts: &[u32],
    labels: &HashMap<MieId, Label>,
    label_addrs: &[u32],
) -> Result<Vec<DexTryItem>, DexError> {
    let mut tries = Vec::new();
    for (start, end, head) in regions {
        let mut catches = Vec::new();
        let mut cursor = Some(*head);
        while let Some(c) = cursor {
            let Some(MethodItem::Catch(entry)) = list.get(c) else {
                violation!("catch chain link {} is not a catch", c);
            };
            let Some(label) = labels.get(&c) else {
                violation!("catch {} is not part of the body", c);
            };
            catches.push(DexCatch { ty: entry.catch_type, addr: label_addrs[*label] });
            if catches.len() > list.len() {
                violation!("catch chain starting at {} is cyclic", head);
            }
            cursor = entry.next;
        }
        if let Some(pos) = catches.iter().position(|c| c.ty.is_none()) {
            if pos != catches.len() - 1 {
                violation!("catch-all at position {} is not last in its chain", pos);
            }
        }

        let mut s = *start;
        while end - s > MAX_TRY_WIDTH {
            let want = s + MAX_TRY_WIDTH;
            let idx = insn_starts.partition_point(|a| *a <= want);
            let cut = match idx.checked_sub(1).map(|i| insn_starts[i]) {
                Some(cut) if cut > s => cut,
                _ => violation!("no instruction boundary to split the try region at {}", s),
            };
            tries.push(DexTryItem { start_addr: s, insn_count: (cut - s) as u16, catches: catches.clone() });
            s = cut;
        }
        tries.push(DexTryItem { start_addr: s, insn_count: (end - s) as u16, catches });
    }
    tries.sort_by_key(|t| t.start_addr);
    Ok(tries)
}

/// Frame sizes; parameters must occupy the last registers.
fn frame(code: &IRCode, params: &[(Reg, u32)]) -> Result<(u16, u16), DexError> {
    let Ok(registers_size) = u16::try_from(code.registers_size()) else {
        violation!("{} registers exceed the frame limit", code.registers_size());
    };
    let ins: u32 = params.iter().map(|(_, w)| *w).sum();
    let mut expected = code.registers_size().checked_sub(ins).unwrap_or(u32::MAX);
    for (reg, width) in params {
        if *reg != expected {
            violation!("load-param v{} is not in the parameter area starting at v{}", reg, code.registers_size() - ins.min(code.registers_size()));
        }
        expected += width;
    }
    Ok((registers_size, ins as u16))
}
