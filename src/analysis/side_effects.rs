//! Per-method side-effect summaries, computed bottom-up on top of the
//! escape analysis.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use dashmap::DashMap;
use log::{debug, trace};
use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::call_graph::CallGraph;
use crate::analysis::escape::{object_init, FixpointIterator, Pointer, PointerSet};
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::list::MieId;
use crate::ir::opcode::IROpcode;
use crate::model::access::DexAccessFlags;
use crate::model::class::{DexClass, DexMethod};
use crate::model::pool::DexMethodRef;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Effects: u8 {
        const THROWS = 0x1;
        const LOCKS = 0x2;
        /// Writes to memory another method may observe.
        const WRITE_MAY_ESCAPE = 0x4;
        const UNKNOWN_INVOKE = 0x8;
        /// The body could not be analyzed.
        const NO_OPTIMIZE = 0x10;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SideEffectSummary {
    pub effects: Effects,
    /// Parameters whose fields or elements the method may write.
    pub modified_params: BTreeSet<u16>,
}

impl SideEffectSummary {
    pub fn no_optimize() -> SideEffectSummary {
        SideEffectSummary { effects: Effects::NO_OPTIMIZE, modified_params: BTreeSet::new() }
    }

    /// No effects and no parameter writes.
    pub fn is_pure(&self) -> bool {
        self.effects.is_empty() && self.modified_params.is_empty()
    }
}

struct Builder<'a> {
    fp: &'a FixpointIterator,
    summary: SideEffectSummary,
}

impl<'a> Builder<'a> {
    /// Records a write through the object held in `reg` before `id`.
    fn classify_write(&mut self, id: MieId, reg: Reg) {
        let Some(env) = self.fp.environment_at(id) else {
            return;
        };
        self.classify(&env.get(reg));
    }

    fn classify(&mut self, target: &PointerSet) {
        if target.is_unknown() {
            self.summary.effects |= Effects::WRITE_MAY_ESCAPE;
        }
        for p in target.pointers() {
            match p {
                Pointer::Param(i) => {
                    self.summary.modified_params.insert(*i);
                }
                Pointer::Alloc(_) if self.fp.may_have_escaped(*p) => {
                    self.summary.effects |= Effects::WRITE_MAY_ESCAPE;
                }
                Pointer::Alloc(_) => {}
            }
        }
    }

    fn invoke(
        &mut self,
        caller: DexMethodRef,
        id: MieId,
        insn: &IRInstruction,
        call_graph: &CallGraph,
        summaries: &DashMap<DexMethodRef, SideEffectSummary>,
    ) {
        let callee = match insn.opcode() {
            IROpcode::InvokeSuper | IROpcode::InvokeInterface => None,
            IROpcode::InvokeVirtual => call_graph.callee_at(caller, id),
            _ => call_graph.callee_at(caller, id).or_else(|| insn.get_method()),
        }
        .and_then(|c| summaries.get(&c).map(|s| s.value().clone()));
        let Some(callee) = callee else {
            self.summary.effects |= Effects::UNKNOWN_INVOKE;
            return;
        };
        self.summary.effects |= callee.effects;
        for p in &callee.modified_params {
            if let Some(r) = insn.srcs().get(*p as usize) {
                self.classify_write(id, *r);
            }
        }
    }
}

/// Summarizes one method from its converged escape states and the summaries
/// of its callees computed so far.
pub fn analyze_method(
    method: &DexMethod,
    fp: &FixpointIterator,
    call_graph: &CallGraph,
    summaries: &DashMap<DexMethodRef, SideEffectSummary>,
) -> SideEffectSummary {
    let Some(code) = method.get_code() else {
        return SideEffectSummary::no_optimize();
    };
    let caller = method.get_ref();
    let mut b = Builder { fp, summary: SideEffectSummary::default() };
    if method.access().intersects(DexAccessFlags::SYNCHRONIZED | DexAccessFlags::DECLARED_SYNCHRONIZED) {
        b.summary.effects |= Effects::LOCKS;
    }
    for (id, insn) in code.list().instructions() {
        let op = insn.opcode();
        match op {
            IROpcode::Throw => b.summary.effects |= Effects::THROWS,
            IROpcode::MonitorEnter | IROpcode::MonitorExit => b.summary.effects |= Effects::LOCKS,
            _ if op.is_an_sput() => b.summary.effects |= Effects::WRITE_MAY_ESCAPE,
            _ if op.is_an_iput() || op.is_an_aput() => {
                if let Some(obj) = insn.srcs().get(1) {
                    b.classify_write(id, *obj);
                }
            }
            IROpcode::FillArrayData => {
                if let Some(array) = insn.srcs().first() {
                    b.classify_write(id, *array);
                }
            }
            _ if op.is_invoke() => b.invoke(caller, id, insn, call_graph, summaries),
            _ => {}
        }
    }
    trace!(target: "SIDEEFF", "{}: {:?} {:?}", caller, b.summary.effects, b.summary.modified_params);
    b.summary
}

/// Summarizes every method in `call_graph`, callees first. A callee that has
/// no summary yet, because it sits on a cycle or has no body, counts as an
/// unknown invoke. `Object.<init>` is seeded as pure, and methods in scope
/// without a Method-IR body as [`Effects::NO_OPTIMIZE`].
///
/// Methods of one [`CallGraph::bottom_up_levels`] level run in parallel and
/// publish together once the level is done.
pub fn analyze_scope(
    scope: &[&DexClass],
    call_graph: &CallGraph,
    escape: &DashMap<DexMethodRef, FixpointIterator>,
    summaries: &DashMap<DexMethodRef, SideEffectSummary>,
) {
    summaries.entry(object_init()).or_default();
    let defs: HashMap<DexMethodRef, &DexMethod> =
        scope.iter().flat_map(|c| c.get_all_methods()).map(|m| (m.get_ref(), m)).collect();
    // Concrete bodies outside Method-IR (native, or never ballooned).
    for (mref, m) in &defs {
        if m.get_code().is_none() && !m.is_abstract() {
            summaries.entry(*mref).or_insert_with(SideEffectSummary::no_optimize);
        }
    }
    let mut pure = 0;
    for level in call_graph.bottom_up_levels() {
        let results: Vec<(DexMethodRef, SideEffectSummary)> = level
            .par_iter()
            .filter_map(|mref| {
                let method = defs.get(mref)?;
                let summary = match escape.get(mref) {
                    Some(fp) => analyze_method(method, fp.value(), call_graph, summaries),
                    None => SideEffectSummary::no_optimize(),
                };
                Some((*mref, summary))
            })
            .collect();
        for (mref, summary) in results {
            if summary.is_pure() {
                pure += 1;
            }
            summaries.insert(mref, summary);
        }
    }
    debug!(target: "SIDEEFF", "{} methods summarized, {} without side effects", summaries.len(), pure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::escape;
    use crate::analysis::override_graph::build_graph;
    use crate::dex::instruction::DexRef;
    use crate::ir::code::{AsmItem, IRCode};
    use crate::model::pool::{DexFieldRef, DexType};

    fn op(op: IROpcode) -> IRInstruction {
        IRInstruction::new(op)
    }

    fn add(cls: &mut DexClass, desc: &str, access: DexAccessFlags, insns: Vec<IRInstruction>) -> DexMethodRef {
        let mref = DexMethodRef::make_from_descriptor(desc).unwrap();
        let mut m = DexMethod::new(mref);
        m.make_concrete(access | DexAccessFlags::STATIC, None, false).unwrap();
        m.set_code(IRCode::from_instructions(3, insns.into_iter().map(AsmItem::Insn).collect()).unwrap());
        cls.add_method(m).unwrap();
        mref
    }

    fn run(cls: &DexClass) -> HashMap<DexMethodRef, SideEffectSummary> {
        let scope = vec![cls];
        let cg = CallGraph::build(&scope, &build_graph(&scope));
        let iterators = escape::analyze_scope(&scope, &cg, &DashMap::new()).unwrap();
        let summaries = DashMap::new();
        analyze_scope(&scope, &cg, &iterators, &summaries);
        summaries.into_iter().collect()
    }

    #[test]
    fn writes_are_classified_by_target() {
        let public = DexAccessFlags::PUBLIC;
        let field = DexRef::Field(DexFieldRef::make_from_descriptor("Lse/A;.f:I").unwrap());
        let mut cls = DexClass::new(DexType::make("Lse/A;"), "side-effects-test").unwrap();
        let local = add(
            &mut cls,
            "Lse/A;.local:()V",
            public,
            vec![
                op(IROpcode::NewInstance).with_ref(DexRef::Type(DexType::make("Lse/A;"))),
                op(IROpcode::MoveResultPseudoObject).with_dest(0),
                op(IROpcode::Const).with_dest(1),
                op(IROpcode::Iput).with_srcs(&[1, 0]).with_ref(field),
                op(IROpcode::ReturnVoid),
            ],
        );
        let set = add(
            &mut cls,
            "Lse/A;.set:(Lse/A;I)V",
            public,
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::LoadParam).with_dest(1),
                op(IROpcode::Iput).with_srcs(&[1, 0]).with_ref(field),
                op(IROpcode::ReturnVoid),
            ],
        );
        let publish = add(
            &mut cls,
            "Lse/A;.publish:(I)V",
            public,
            vec![
                op(IROpcode::LoadParam).with_dest(1),
                op(IROpcode::Sput).with_srcs(&[1]).with_ref(DexRef::Field(DexFieldRef::make_from_descriptor("Lse/A;.g:I").unwrap())),
                op(IROpcode::ReturnVoid),
            ],
        );
        let caller = add(
            &mut cls,
            "Lse/A;.caller:(Lse/A;)V",
            public | DexAccessFlags::DECLARED_SYNCHRONIZED,
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::Const).with_dest(1),
                op(IROpcode::InvokeStatic).with_srcs(&[0, 1]).with_ref(DexRef::Method(set)),
                op(IROpcode::ReturnVoid),
            ],
        );

        let summaries = run(&cls);
        assert!(summaries[&local].is_pure());
        assert_eq!(summaries[&set], SideEffectSummary { effects: Effects::empty(), modified_params: BTreeSet::from([0]) });
        assert_eq!(summaries[&publish].effects, Effects::WRITE_MAY_ESCAPE);
        assert_eq!(summaries[&caller].effects, Effects::LOCKS);
        assert_eq!(summaries[&caller].modified_params, BTreeSet::from([0]));
    }

    #[test]
    fn unresolved_calls_are_unknown_invokes() {
        let mut cls = DexClass::new(DexType::make("Lse/B;"), "side-effects-test").unwrap();
        let external = DexMethodRef::make_from_descriptor("Lext/Lib;.run:()V").unwrap();
        let calls = add(
            &mut cls,
            "Lse/B;.calls:()V",
            DexAccessFlags::PUBLIC,
            vec![op(IROpcode::InvokeStatic).with_ref(DexRef::Method(external)), op(IROpcode::ReturnVoid)],
        );
        let raises = add(
            &mut cls,
            "Lse/B;.raises:(Ljava/lang/Throwable;)V",
            DexAccessFlags::PUBLIC,
            vec![op(IROpcode::LoadParamObject).with_dest(0), op(IROpcode::Throw).with_srcs(&[0])],
        );
        let native = DexMethodRef::make_from_descriptor("Lse/B;.peek:()V").unwrap();
        let mut m = DexMethod::new(native);
        m.make_concrete(DexAccessFlags::PUBLIC | DexAccessFlags::STATIC | DexAccessFlags::NATIVE, None, false).unwrap();
        cls.add_method(m).unwrap();
        let wraps = add(
            &mut cls,
            "Lse/B;.wraps:()V",
            DexAccessFlags::PUBLIC,
            vec![op(IROpcode::InvokeStatic).with_ref(DexRef::Method(native)), op(IROpcode::ReturnVoid)],
        );

        let summaries = run(&cls);
        assert_eq!(summaries[&calls].effects, Effects::UNKNOWN_INVOKE);
        assert_eq!(summaries[&raises].effects, Effects::THROWS);
        assert_eq!(summaries[&native].effects, Effects::NO_OPTIMIZE);
        assert_eq!(summaries[&wraps].effects, Effects::NO_OPTIMIZE);
    }
}
