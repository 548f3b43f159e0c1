use crate::config::DexOptions;
use crate::dex::code::DexCode;
use crate::dex::id_tables::tests::FixedIds;
use crate::dex::opcodes::DexOpcode;
use crate::ir::code::{AsmItem, IRCode};
use crate::ir::instruction::IRInstruction;
use crate::ir::list::{IRList, IRPosition, MethodItem};
use crate::ir::opcode::IROpcode;
use crate::ir::{balloon, sync};
use crate::model::pool::{DexMethodRef, DexType};

fn static_void() -> DexMethodRef {
    DexMethodRef::make_from_descriptor("Lscenario/Sync;.run:()V").unwrap()
}

fn insn(op: IROpcode) -> AsmItem {
    AsmItem::Insn(IRInstruction::new(op))
}

fn nops(count: usize) -> impl Iterator<Item = AsmItem> {
    (0..count).map(|_| insn(IROpcode::Nop))
}

fn branch_over_nops(count: usize) -> DexCode {
    let mut items = vec![AsmItem::branch(IRInstruction::new(IROpcode::IfEq).with_srcs(&[0, 1]), "end")];
    items.extend(nops(count));
    items.push(AsmItem::label("end"));
    items.push(insn(IROpcode::ReturnVoid));
    let code = IRCode::from_instructions(2, items).unwrap();
    sync(&code, static_void()).unwrap()
}

#[test]
fn far_conditional_branches_are_relaxed() {
    let dex = branch_over_nops(40_000);
    assert_eq!(dex.insns[0].opcode(), DexOpcode::IfNe);
    assert_eq!(dex.insns[0].regs.as_slice(), &[0, 1]);
    // if-ne skips itself and the goto/32.
    assert_eq!(dex.insns[0].offset, 5);
    assert_eq!(dex.insns[1].opcode(), DexOpcode::Goto32);
    assert_eq!(dex.insns[1].offset, 3 + 40_000);
    assert!(dex.insns[2..40_002].iter().all(|i| i.opcode() == DexOpcode::Nop));
    assert_eq!(dex.insns[40_002].opcode(), DexOpcode::ReturnVoid);
    assert_eq!(dex.insns.len(), 40_003);
}

#[test]
fn conditional_branches_in_range_stay_single() {
    let dex = branch_over_nops(20_000);
    assert_eq!(dex.insns[0].opcode(), DexOpcode::IfEq);
    assert_eq!(dex.insns[0].offset, 2 + 20_000);
    assert_eq!(dex.insns.len(), 20_002);
}

#[test]
fn relaxation_keeps_later_branches_aligned() {
    // loop: a far conditional forward, then a trailing goto back to the top.
    let mut items = vec![
        AsmItem::label("top"),
        AsmItem::branch(IRInstruction::new(IROpcode::IfEq).with_srcs(&[0, 1]), "end"),
    ];
    items.extend(nops(40_000));
    items.push(AsmItem::label("end"));
    items.push(AsmItem::branch(IRInstruction::new(IROpcode::Goto), "top"));
    let code = IRCode::from_instructions(2, items).unwrap();
    let dex = sync(&code, static_void()).unwrap();

    assert_eq!(dex.insns.len(), 40_003);
    assert_eq!(dex.insns[0].opcode(), DexOpcode::IfNe);
    assert_eq!(dex.insns[0].offset, 5);
    assert_eq!(dex.insns[1].opcode(), DexOpcode::Goto32);
    assert_eq!(dex.insns[1].offset, 3 + 40_000);
    let back = &dex.insns[40_002];
    assert_eq!(back.opcode(), DexOpcode::Goto32);
    assert_eq!(back.offset, -(5 + 40_000));
    assert_eq!(dex.addresses()[40_002], 40_005);
}

fn switch_code(keys: &[i32]) -> DexCode {
    let labels: Vec<String> = keys.iter().map(|k| format!("case{}", k)).collect();
    let cases: Vec<(i32, &str)> = keys.iter().copied().zip(labels.iter().map(String::as_str)).collect();
    let mut items = vec![AsmItem::switch(IRInstruction::new(IROpcode::Switch).with_srcs(&[0]), &cases)];
    items.push(insn(IROpcode::ReturnVoid));
    for label in &labels {
        items.push(AsmItem::label(label));
        items.push(insn(IROpcode::Nop));
        items.push(insn(IROpcode::ReturnVoid));
    }
    let code = IRCode::from_instructions(1, items).unwrap();
    sync(&code, static_void()).unwrap()
}

fn payload_bytes(dex: &DexCode, opcode: DexOpcode) -> usize {
    let payload = dex.insns.iter().find(|i| i.opcode() == opcode).unwrap();
    payload.size() * 2
}

#[test]
fn contiguous_keys_use_packed_payloads() {
    let dex = switch_code(&[0, 1, 2, 3]);
    assert_eq!(dex.insns[0].opcode(), DexOpcode::PackedSwitch);
    assert_eq!(payload_bytes(&dex, DexOpcode::PackedSwitchPayload), 24);
}

#[test]
fn sparse_keys_use_sparse_payloads() {
    let dex = switch_code(&[0, 100, 200]);
    assert_eq!(dex.insns[0].opcode(), DexOpcode::SparseSwitch);
    assert_eq!(payload_bytes(&dex, DexOpcode::SparseSwitchPayload), 28);

    // Payloads start on an even address.
    let addrs = dex.addresses();
    let at = dex.insns.iter().position(|i| i.opcode() == DexOpcode::SparseSwitchPayload).unwrap();
    assert_eq!(addrs[at] % 2, 0);
    assert_eq!(dex.insns[0].offset as u32, addrs[at]);
}

#[test]
fn wide_try_regions_are_split() {
    let mut items = vec![AsmItem::try_start("t")];
    items.extend(nops(100_000));
    items.push(AsmItem::try_end("t"));
    items.push(insn(IROpcode::ReturnVoid));
    items.push(AsmItem::catch("t", Some(DexType::make("Ljava/lang/Exception;"))));
    items.push(insn(IROpcode::ReturnVoid));
    let code = IRCode::from_instructions(1, items).unwrap();
    let dex = sync(&code, static_void()).unwrap();

    assert!(dex.tries.len() >= 2);
    let addrs = dex.addresses();
    for pair in dex.tries.windows(2) {
        assert_eq!(pair[0].end_addr(), pair[1].start_addr);
        assert_eq!(pair[0].catches, pair[1].catches);
    }
    for t in &dex.tries {
        assert!(addrs.binary_search(&t.start_addr).is_ok());
    }
    assert_eq!(dex.tries[0].start_addr, 0);
    assert_eq!(dex.tries.iter().map(|t| t.insn_count as u32).sum::<u32>(), 100_000);
    assert_eq!(dex.tries[0].catches[0].addr, 100_001);

    // Both items share one encoded handler list.
    let mut shared = Vec::new();
    let mut single = Vec::new();
    dex.write(&mut shared, &FixedIds::default(), 0).unwrap();
    let one = DexCode { tries: dex.tries[..1].to_vec(), ..dex.clone() };
    one.write(&mut single, &FixedIds::default(), 0).unwrap();
    assert_eq!(shared.len() - single.len(), 8 * (dex.tries.len() - 1));
}

#[test]
fn balloon_then_sync_keeps_the_branch_shape() {
    let dex = branch_over_nops(40_000);
    let code = balloon(&dex, static_void(), true, &DexOptions::default()).unwrap();
    let again = sync(&code, static_void()).unwrap();
    assert_eq!(again.insns.len(), dex.insns.len());
    assert_eq!(again.insns[0].opcode(), DexOpcode::IfNe);
    assert_eq!(again.insns[1].opcode(), DexOpcode::Goto32);
    assert_eq!(again.insns[1].offset, dex.insns[1].offset);
}

#[test]
fn inlined_position_chains_survive_sync_and_balloon() {
    let outer = static_void();
    let middle = DexMethodRef::make_from_descriptor("Lscenario/Middle;.step:()V").unwrap();
    let inner = DexMethodRef::make_from_descriptor("Lscenario/Inner;.work:()V").unwrap();

    let mut list = IRList::new();
    let top = list.alloc(MethodItem::Position(IRPosition::new(100, Some(outer))));
    let mut mid = IRPosition::new(20, Some(middle));
    mid.parent = Some(top);
    let mid = list.alloc(MethodItem::Position(mid));
    let mut leaf = IRPosition::new(5, Some(inner));
    leaf.parent = Some(mid);
    list.push_back(MethodItem::Position(leaf));
    list.push_back(MethodItem::Opcode(IRInstruction::new(IROpcode::ReturnVoid)));
    let dex = sync(&IRCode::with_list(1, list, None), outer).unwrap();

    let debug = dex.debug_item.as_ref().unwrap();
    assert_eq!(debug.parents.len(), 2);
    assert_eq!((debug.parents[0].line, debug.parents[0].parent), (100, None));
    assert_eq!((debug.parents[1].line, debug.parents[1].parent), (20, Some(0)));
    let (addr, pos) = debug.positions().next().unwrap();
    assert_eq!((addr, pos.line, pos.parent, pos.method), (0, 5, Some(1), Some(inner)));

    let code = balloon(&dex, outer, true, &DexOptions::default()).unwrap();
    let positions = |id| match code.list().get(id) {
        Some(MethodItem::Position(p)) => *p,
        other => panic!("expected a position, got {:?}", other),
    };
    let leaf = code
        .list()
        .iter()
        .find_map(|(_, item)| match item {
            MethodItem::Position(p) => Some(*p),
            _ => None,
        })
        .unwrap();
    assert_eq!((leaf.line, leaf.method), (5, Some(inner)));
    let mid = positions(leaf.parent.unwrap());
    assert_eq!((mid.line, mid.method), (20, Some(middle)));
    let top = positions(mid.parent.unwrap());
    assert_eq!((top.line, top.method, top.parent), (100, Some(outer), None));
}
