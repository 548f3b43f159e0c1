//! Intraprocedural pointer and escape analysis with bottom-up summaries.
//!
//! Each method is interpreted forward over its CFG. The abstract state maps
//! registers (and the pending result of the last producer) to sets of
//! allocation sites, and records which of those sites may have escaped.
//! Parameters are allocation sites of their own. A method's summary says
//! which parameters may escape and which may be returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use log::{debug, trace, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::call_graph::CallGraph;
use crate::config::DexOptions;
use crate::dex::error::DexError;
use crate::ir::cfg::{BlockId, ControlFlowGraph, EdgeKind};
use crate::ir::code::IRCode;
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::list::{IRList, MieId};
use crate::ir::opcode::IROpcode;
use crate::model::class::{DexClass, DexMethod};
use crate::model::pool::{DexMethodRef, DexProto, DexString, DexType, DexTypeList};

/// Marks "a newly allocated object" in a returned-parameter set.
pub const FRESH_RETURN: u16 = u16::MAX;

const MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pointer {
    /// The value of the parameter with this index.
    Param(u16),
    /// The object produced by the instruction, or returned fresh by the call.
    Alloc(MieId),
}

/// A may-set of pointers. `unknown` stands for values from outside the
/// method body, such as heap loads or results of unanalyzed calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerSet {
    pointers: BTreeSet<Pointer>,
    unknown: bool,
}

impl PointerSet {
    pub fn singleton(p: Pointer) -> PointerSet {
        PointerSet { pointers: BTreeSet::from([p]), unknown: false }
    }

    pub fn unknown() -> PointerSet {
        PointerSet { pointers: BTreeSet::new(), unknown: true }
    }

    pub fn pointers(&self) -> &BTreeSet<Pointer> {
        &self.pointers
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty() && !self.unknown
    }

    /// Set union; returns whether `self` grew.
    pub fn join_with(&mut self, other: &PointerSet) -> bool {
        let before = (self.pointers.len(), self.unknown);
        self.pointers.extend(other.pointers.iter().copied());
        self.unknown |= other.unknown;
        before != (self.pointers.len(), self.unknown)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscapeEnvironment {
    registers: BTreeMap<Reg, PointerSet>,
    result: PointerSet,
    escaped: BTreeSet<Pointer>,
}

impl EscapeEnvironment {
    pub fn get(&self, reg: Reg) -> PointerSet {
        self.registers.get(&reg).cloned().unwrap_or_default()
    }

    /// The value a following move-result would read.
    pub fn result(&self) -> &PointerSet {
        &self.result
    }

    pub fn may_have_escaped(&self, p: Pointer) -> bool {
        self.escaped.contains(&p)
    }

    fn set(&mut self, reg: Reg, value: PointerSet) {
        if value.is_empty() {
            self.registers.remove(&reg);
        } else {
            self.registers.insert(reg, value);
        }
    }

    fn escape(&mut self, reg: Reg) {
        if let Some(ps) = self.registers.get(&reg) {
            self.escaped.extend(ps.pointers.iter().copied());
        }
    }

    pub fn join_with(&mut self, other: &EscapeEnvironment) -> bool {
        let mut changed = false;
        for (reg, ps) in &other.registers {
            changed |= self.registers.entry(*reg).or_default().join_with(ps);
        }
        changed |= self.result.join_with(&other.result);
        let before = self.escaped.len();
        self.escaped.extend(other.escaped.iter().copied());
        changed || self.escaped.len() != before
    }
}

/// A set of parameter indices, possibly including [`FRESH_RETURN`], or Top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParamSet {
    Top,
    Set(BTreeSet<u16>),
}

impl Default for ParamSet {
    fn default() -> ParamSet {
        ParamSet::Set(BTreeSet::new())
    }
}

impl ParamSet {
    pub fn of(params: &[u16]) -> ParamSet {
        ParamSet::Set(params.iter().copied().collect())
    }

    pub fn is_top(&self) -> bool {
        matches!(self, ParamSet::Top)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscapeSummary {
    pub escaping_parameters: BTreeSet<u16>,
    pub returned_parameters: ParamSet,
}

/// The converged states of one method, kept for passes that need pointer
/// information at individual instructions.
#[derive(Debug, Clone, Default)]
pub struct FixpointIterator {
    states: HashMap<MieId, EscapeEnvironment>,
    escaped: BTreeSet<Pointer>,
    returned: PointerSet,
    params: Vec<u16>,
}

impl FixpointIterator {
    /// The state just before the instruction `id`, if it is reachable.
    pub fn environment_at(&self, id: MieId) -> Option<&EscapeEnvironment> {
        self.states.get(&id)
    }

    /// Whether `p` escapes anywhere in the method.
    pub fn may_have_escaped(&self, p: Pointer) -> bool {
        self.escaped.contains(&p)
    }

    pub fn returned(&self) -> &PointerSet {
        &self.returned
    }

    pub fn summary(&self) -> EscapeSummary {
        let escaping_parameters =
            self.params.iter().copied().filter(|i| self.escaped.contains(&Pointer::Param(*i))).collect();
        let returned_parameters = if self.returned.unknown || self.returned.pointers.iter().any(|p| self.escaped.contains(p)) {
            ParamSet::Top
        } else {
            ParamSet::Set(
                self.returned
                    .pointers
                    .iter()
                    .map(|p| match p {
                        Pointer::Param(i) => *i,
                        Pointer::Alloc(_) => FRESH_RETURN,
                    })
                    .collect(),
            )
        };
        EscapeSummary { escaping_parameters, returned_parameters }
    }
}

pub fn object_init() -> DexMethodRef {
    DexMethodRef::make(
        DexType::make("Ljava/lang/Object;"),
        DexString::make("<init>"),
        DexProto::make(DexType::make("V"), DexTypeList::empty()),
    )
}

struct Analyzer<'s> {
    method: DexMethodRef,
    call_graph: &'s CallGraph,
    summaries: &'s DashMap<DexMethodRef, EscapeSummary>,
    escape_check_cast: bool,
    params: HashMap<MieId, u16>,
}

impl<'s> Analyzer<'s> {
    fn callee(&self, id: MieId, insn: &IRInstruction) -> Option<EscapeSummary> {
        let callee = self.call_graph.callee_at(self.method, id).or_else(|| {
            matches!(insn.opcode(), IROpcode::InvokeDirect | IROpcode::InvokeStatic).then(|| insn.get_method()).flatten()
        })?;
        self.summaries.get(&callee).map(|s| s.value().clone())
    }

    fn transfer(&self, id: MieId, insn: &IRInstruction, env: &mut EscapeEnvironment) {
        use IROpcode::*;
        let op = insn.opcode();
        let src = |i: usize| insn.srcs().get(i).copied();
        match op {
            LoadParamObject => {
                if let (Some(d), Some(i)) = (insn.dest(), self.params.get(&id)) {
                    env.set(d, PointerSet::singleton(Pointer::Param(*i)));
                }
            }
            MoveObject => {
                if let (Some(d), Some(s)) = (insn.dest(), src(0)) {
                    let v = env.get(s);
                    env.set(d, v);
                }
            }
            MoveResultObject | MoveResultPseudoObject => {
                if let Some(d) = insn.dest() {
                    let v = env.result.clone();
                    env.set(d, v);
                }
            }
            MoveException => {
                if let Some(d) = insn.dest() {
                    env.set(d, PointerSet::unknown());
                }
            }
            NewInstance | NewArray | ConstString | ConstClass => {
                env.result = PointerSet::singleton(Pointer::Alloc(id));
            }
            FilledNewArray => {
                let holds_refs = insn.get_type().and_then(|t| t.component_type()).is_some_and(|c| c.is_object());
                if holds_refs {
                    for r in insn.srcs() {
                        env.escape(*r);
                    }
                }
                env.result = PointerSet::singleton(Pointer::Alloc(id));
            }
            CheckCast => {
                if let Some(s) = src(0) {
                    if self.escape_check_cast {
                        env.escape(s);
                    }
                    env.result = env.get(s);
                }
            }
            IgetObject | AgetObject | SgetObject => env.result = PointerSet::unknown(),
            IputObject | AputObject | SputObject | Throw => {
                if let Some(s) = src(0) {
                    env.escape(s);
                }
            }
            _ if op.is_invoke() => self.invoke(id, insn, env),
            _ => {
                if op.has_move_result_pseudo() {
                    env.result = PointerSet::default();
                }
                if let Some(d) = insn.dest() {
                    env.set(d, PointerSet::default());
                }
            }
        }
    }

    fn invoke(&self, id: MieId, insn: &IRInstruction, env: &mut EscapeEnvironment) {
        let Some(summary) = self.callee(id, insn) else {
            for r in insn.srcs() {
                env.escape(*r);
            }
            env.result = PointerSet::unknown();
            return;
        };
        for p in &summary.escaping_parameters {
            if let Some(r) = insn.srcs().get(*p as usize) {
                env.escape(*r);
            }
        }
        env.result = match &summary.returned_parameters {
            ParamSet::Top => PointerSet::unknown(),
            ParamSet::Set(params) => {
                let mut out = PointerSet::default();
                for p in params {
                    if *p == FRESH_RETURN {
                        out.pointers.insert(Pointer::Alloc(id));
                    } else if let Some(r) = insn.srcs().get(*p as usize) {
                        out.join_with(&env.get(*r));
                    }
                }
                out
            }
        };
    }

    /// Runs one block from `state`. Returns the state at the end and the
    /// join of every state from which an instruction may throw.
    fn run_block(
        &self,
        cfg: &ControlFlowGraph,
        list: &IRList,
        b: BlockId,
        mut state: EscapeEnvironment,
        mut record: Option<&mut HashMap<MieId, EscapeEnvironment>>,
    ) -> (EscapeEnvironment, EscapeEnvironment) {
        let mut thrown = EscapeEnvironment::default();
        let Some(block) = cfg.block(b) else {
            return (state, thrown);
        };
        for (id, insn) in block.insns(list) {
            if let Some(rec) = record.as_mut() {
                rec.insert(id, state.clone());
            }
            let throws = insn.opcode().can_throw();
            if throws {
                thrown.join_with(&state);
            }
            self.transfer(id, insn, &mut state);
            if throws {
                thrown.escaped.extend(state.escaped.iter().copied());
            }
        }
        (state, thrown)
    }

    fn run(&self, code: &IRCode) -> Result<FixpointIterator, DexError> {
        if code.editable_cfg_built() {
            violation!("escape analysis needs a linear body");
        }
        let list = code.list();
        let cfg = ControlFlowGraph::view(list)?;
        let rpo = cfg.reverse_post_order();
        let mut entry: HashMap<BlockId, EscapeEnvironment> = HashMap::new();
        if let Some(e) = cfg.entry_block() {
            entry.insert(e, EscapeEnvironment::default());
        }

        let mut changed = true;
        let mut passes = 0;
        while changed {
            changed = false;
            passes += 1;
            for b in &rpo {
                let Some(state) = entry.get(b).cloned() else {
                    continue;
                };
                let (out, thrown) = self.run_block(&cfg, list, *b, state, None);
                for edge in cfg.succs(*b) {
                    let incoming = match edge.kind {
                        EdgeKind::Ghost => continue,
                        EdgeKind::Throw { .. } => &thrown,
                        _ => &out,
                    };
                    match entry.get_mut(&edge.target) {
                        Some(existing) => changed |= existing.join_with(incoming),
                        None => {
                            entry.insert(edge.target, incoming.clone());
                            changed = true;
                        }
                    }
                }
            }
        }

        let mut result = FixpointIterator {
            params: self.params.values().copied().collect(),
            ..FixpointIterator::default()
        };
        result.params.sort_unstable();
        for b in &rpo {
            let Some(state) = entry.get(b).cloned() else {
                continue;
            };
            let (out, thrown) = self.run_block(&cfg, list, *b, state, Some(&mut result.states));
            result.escaped.extend(out.escaped.iter().copied());
            result.escaped.extend(thrown.escaped.iter().copied());
        }
        for (id, insn) in list.instructions() {
            if insn.opcode() == IROpcode::ReturnObject {
                if let (Some(state), Some(r)) = (result.states.get(&id), insn.srcs().first()) {
                    result.returned.join_with(&state.get(*r));
                }
            }
        }
        trace!(target: "ESCAPE", "{}: converged after {} passes over {} blocks", self.method, passes, rpo.len());
        Ok(result)
    }
}

fn param_indices(code: &IRCode) -> HashMap<MieId, u16> {
    code.param_instructions().into_iter().enumerate().map(|(i, id)| (id, i as u16)).collect()
}

/// Analyzes one method against the summaries known so far.
pub fn analyze_method(
    method: &DexMethod,
    call_graph: &CallGraph,
    summaries: &DashMap<DexMethodRef, EscapeSummary>,
    options: &DexOptions,
) -> Result<Option<FixpointIterator>, DexError> {
    let Some(code) = method.get_code() else {
        return Ok(None);
    };
    let analyzer = Analyzer {
        method: method.get_ref(),
        call_graph,
        summaries,
        escape_check_cast: options.escape_check_cast,
        params: param_indices(code),
    };
    analyzer.run(code).map(Some).map_err(|e| e.in_method(&method.to_string()))
}

pub fn analyze_scope(
    scope: &[&DexClass],
    call_graph: &CallGraph,
    summaries: &DashMap<DexMethodRef, EscapeSummary>,
) -> Result<DashMap<DexMethodRef, FixpointIterator>, DexError> {
    analyze_scope_with(scope, call_graph, summaries, &DexOptions::default())
}

/// Computes summaries bottom-up along `call_graph`, repeating until no
/// summary changes. `summaries` may be seeded by the caller; the
/// `Object.<init>` entry is added if missing.
///
/// Each level of [`CallGraph::bottom_up_levels`] runs on the worker pool
/// against the summaries published by earlier levels. A level publishes only
/// once all of its methods are done, so results do not depend on scheduling.
pub fn analyze_scope_with(
    scope: &[&DexClass],
    call_graph: &CallGraph,
    summaries: &DashMap<DexMethodRef, EscapeSummary>,
    options: &DexOptions,
) -> Result<DashMap<DexMethodRef, FixpointIterator>, DexError> {
    summaries.entry(object_init()).or_default();
    let defs: HashMap<DexMethodRef, &DexMethod> =
        scope.iter().flat_map(|c| c.get_all_methods()).map(|m| (m.get_ref(), m)).collect();
    let levels = call_graph.bottom_up_levels();
    let iterators = DashMap::with_capacity(defs.len());
    let pool = options.thread_pool()?;

    for round in 1..=MAX_ROUNDS {
        let mut changed = false;
        for level in &levels {
            let results: Vec<Option<(DexMethodRef, FixpointIterator)>> = pool.install(|| {
                level
                    .par_iter()
                    .filter_map(|mref| defs.get(mref).map(|m| (*mref, *m)))
                    .map(|(mref, method)| {
                        analyze_method(method, call_graph, summaries, options).map(|fp| fp.map(|fp| (mref, fp)))
                    })
                    .collect::<Result<Vec<_>, DexError>>()
            })?;
            for (mref, fp) in results.into_iter().flatten() {
                let summary = fp.summary();
                if summaries.get(&mref).map_or(true, |known| *known != summary) {
                    summaries.insert(mref, summary);
                    changed = true;
                }
                iterators.insert(mref, fp);
            }
        }
        if !changed {
            debug!(target: "ESCAPE", "{} methods summarized in {} rounds", iterators.len(), round);
            return Ok(iterators);
        }
    }
    warn!(target: "ESCAPE", "summaries still changing after {} rounds; keeping the last ones", MAX_ROUNDS);
    Ok(iterators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::override_graph::build_graph;
    use crate::dex::instruction::DexRef;
    use crate::ir::code::AsmItem;
    use crate::model::access::DexAccessFlags;
    use crate::model::pool::DexFieldRef;

    fn op(op: IROpcode) -> IRInstruction {
        IRInstruction::new(op)
    }

    fn method_ref(desc: &str) -> DexMethodRef {
        DexMethodRef::make_from_descriptor(desc).unwrap()
    }

    fn add(cls: &mut DexClass, desc: &str, insns: Vec<IRInstruction>) -> DexMethodRef {
        let mref = method_ref(desc);
        let mut m = DexMethod::new(mref);
        m.make_concrete(DexAccessFlags::PUBLIC | DexAccessFlags::STATIC, None, false).unwrap();
        m.set_code(IRCode::from_instructions(2, insns.into_iter().map(AsmItem::Insn).collect()).unwrap());
        cls.add_method(m).unwrap();
        mref
    }

    fn summarize(cls: &DexClass, options: &DexOptions) -> HashMap<DexMethodRef, EscapeSummary> {
        let scope = vec![cls];
        let cg = CallGraph::build(&scope, &build_graph(&scope));
        let summaries = DashMap::new();
        analyze_scope_with(&scope, &cg, &summaries, options).unwrap();
        summaries.into_iter().collect()
    }

    #[test]
    fn identity_leak_and_fresh_summaries() {
        let mut cls = DexClass::new(DexType::make("Lesc/S;"), "escape-test").unwrap();
        let field = DexFieldRef::make_from_descriptor("Lesc/S;.sField:Ljava/lang/Object;").unwrap();
        let id = add(
            &mut cls,
            "Lesc/S;.id:(Ljava/lang/Object;)Ljava/lang/Object;",
            vec![op(IROpcode::LoadParamObject).with_dest(0), op(IROpcode::ReturnObject).with_srcs(&[0])],
        );
        let leak = add(
            &mut cls,
            "Lesc/S;.leak:(Ljava/lang/Object;)V",
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::SputObject).with_srcs(&[0]).with_ref(DexRef::Field(field)),
                op(IROpcode::ReturnVoid),
            ],
        );
        let fresh = add(
            &mut cls,
            "Lesc/S;.fresh:()Ljava/lang/Object;",
            vec![
                op(IROpcode::NewInstance).with_ref(DexRef::Type(DexType::make("Ljava/lang/Object;"))),
                op(IROpcode::MoveResultPseudoObject).with_dest(0),
                op(IROpcode::InvokeDirect).with_srcs(&[0]).with_ref(DexRef::Method(object_init())),
                op(IROpcode::ReturnObject).with_srcs(&[0]),
            ],
        );
        let wrap = add(
            &mut cls,
            "Lesc/S;.wrap:(Ljava/lang/Object;)Ljava/lang/Object;",
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::InvokeStatic).with_srcs(&[0]).with_ref(DexRef::Method(id)),
                op(IROpcode::MoveResultObject).with_dest(1),
                op(IROpcode::ReturnObject).with_srcs(&[1]),
            ],
        );

        let summaries = summarize(&cls, &DexOptions::default());
        assert_eq!(
            summaries[&id],
            EscapeSummary { escaping_parameters: BTreeSet::new(), returned_parameters: ParamSet::of(&[0]) }
        );
        assert_eq!(
            summaries[&leak],
            EscapeSummary { escaping_parameters: BTreeSet::from([0]), returned_parameters: ParamSet::of(&[]) }
        );
        assert_eq!(
            summaries[&fresh],
            EscapeSummary { escaping_parameters: BTreeSet::new(), returned_parameters: ParamSet::of(&[FRESH_RETURN]) }
        );
        assert_eq!(summaries[&wrap].returned_parameters, ParamSet::of(&[0]));
    }

    #[test]
    fn unknown_calls_escape_their_arguments() {
        let mut cls = DexClass::new(DexType::make("Lesc/T;"), "escape-test").unwrap();
        let external = method_ref("Lext/Sink;.take:(Ljava/lang/Object;)Ljava/lang/Object;");
        let pass = add(
            &mut cls,
            "Lesc/T;.pass:(Ljava/lang/Object;)Ljava/lang/Object;",
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::InvokeStatic).with_srcs(&[0]).with_ref(DexRef::Method(external)),
                op(IROpcode::MoveResultObject).with_dest(1),
                op(IROpcode::ReturnObject).with_srcs(&[1]),
            ],
        );
        let summaries = summarize(&cls, &DexOptions::default());
        assert_eq!(summaries[&pass].escaping_parameters, BTreeSet::from([0]));
        assert!(summaries[&pass].returned_parameters.is_top());
    }

    #[test]
    fn check_cast_escapes_only_when_asked() {
        let mut cls = DexClass::new(DexType::make("Lesc/U;"), "escape-test").unwrap();
        let cast = add(
            &mut cls,
            "Lesc/U;.cast:(Ljava/lang/Object;)Ljava/lang/String;",
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::CheckCast).with_srcs(&[0]).with_ref(DexRef::Type(DexType::make("Ljava/lang/String;"))),
                op(IROpcode::MoveResultPseudoObject).with_dest(1),
                op(IROpcode::ReturnObject).with_srcs(&[1]),
            ],
        );
        let relaxed = summarize(&cls, &DexOptions::default());
        assert!(relaxed[&cast].escaping_parameters.is_empty());
        assert_eq!(relaxed[&cast].returned_parameters, ParamSet::of(&[0]));

        let strict = summarize(&cls, &DexOptions { escape_check_cast: true, ..DexOptions::default() });
        assert_eq!(strict[&cast].escaping_parameters, BTreeSet::from([0]));
        assert!(strict[&cast].returned_parameters.is_top());
    }

    #[test]
    fn call_chains_agree_across_worker_counts() {
        let mut cls = DexClass::new(DexType::make("Lesc/Chain;"), "escape-test").unwrap();
        let sink = DexFieldRef::make_from_descriptor("Lesc/Chain;.sink:Ljava/lang/Object;").unwrap();
        let mut chain = vec![add(
            &mut cls,
            "Lesc/Chain;.m0:(Ljava/lang/Object;)V",
            vec![
                op(IROpcode::LoadParamObject).with_dest(0),
                op(IROpcode::SputObject).with_srcs(&[0]).with_ref(DexRef::Field(sink)),
                op(IROpcode::ReturnVoid),
            ],
        )];
        for i in 1..6 {
            let next = *chain.last().unwrap();
            chain.push(add(
                &mut cls,
                &format!("Lesc/Chain;.m{}:(Ljava/lang/Object;)V", i),
                vec![
                    op(IROpcode::LoadParamObject).with_dest(0),
                    op(IROpcode::InvokeStatic).with_srcs(&[0]).with_ref(DexRef::Method(next)),
                    op(IROpcode::ReturnVoid),
                ],
            ));
        }
        let keep = add(
            &mut cls,
            "Lesc/Chain;.keep:(Ljava/lang/Object;)V",
            vec![op(IROpcode::LoadParamObject).with_dest(0), op(IROpcode::ReturnVoid)],
        );

        let serial = summarize(&cls, &DexOptions { max_worker_threads: Some(1), ..DexOptions::default() });
        let parallel = summarize(&cls, &DexOptions { max_worker_threads: Some(4), ..DexOptions::default() });
        assert_eq!(serial, parallel);
        for m in &chain {
            assert_eq!(parallel[m].escaping_parameters, BTreeSet::from([0]));
        }
        assert!(parallel[&keep].escaping_parameters.is_empty());
    }
}
