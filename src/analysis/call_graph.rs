//! A call graph restricted to call sites with one statically known target.
//!
//! Static and direct invokes are resolved through the class hierarchy. A
//! virtual invoke contributes an edge only when its resolved target is
//! concrete and nothing in scope overrides it. Super and interface invokes
//! never do.

use std::collections::{HashMap, HashSet};

use log::debug;
use rayon::prelude::*;

use crate::analysis::override_graph::MethodOverrideGraph;
use crate::ir::list::MieId;
use crate::ir::opcode::IROpcode;
use crate::model::class::{DexClass, DexMethod};
use crate::model::pool::DexMethodRef;
use crate::model::resolver::{MethodSearch, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// The invoke instruction in the caller's body.
    pub insn: MieId,
    pub callee: DexMethodRef,
}

#[derive(Debug, Default)]
pub struct CallGraph {
    /// Every method with a Method-IR body, in ref order.
    methods: Vec<DexMethodRef>,
    callees: HashMap<DexMethodRef, Vec<CallSite>>,
    callers: HashMap<DexMethodRef, Vec<DexMethodRef>>,
}

/// The def an invoke can only ever reach, if there is exactly one.
pub fn resolve_unique_callee<'a>(
    resolver: &Resolver<'a>,
    overrides: &MethodOverrideGraph,
    op: IROpcode,
    mref: DexMethodRef,
) -> Option<&'a DexMethod> {
    let search = match op {
        IROpcode::InvokeStatic => MethodSearch::Static,
        IROpcode::InvokeDirect => MethodSearch::Direct,
        IROpcode::InvokeVirtual => MethodSearch::Virtual,
        _ => return None,
    };
    let def = resolver.resolve_method(mref, search)?;
    if op == IROpcode::InvokeVirtual && (def.is_abstract() || overrides.is_overridden(def.get_ref())) {
        return None;
    }
    Some(def)
}

impl CallGraph {
    pub fn build(scope: &[&DexClass], overrides: &MethodOverrideGraph) -> CallGraph {
        let resolver = Resolver::new(scope);
        let mut per_method: Vec<(DexMethodRef, Vec<CallSite>)> = scope
            .par_iter()
            .flat_map_iter(|&c| c.get_all_methods())
            .filter_map(|m| {
                let code = m.get_code()?;
                let sites = code
                    .list()
                    .instructions()
                    .filter(|(_, insn)| insn.opcode().is_invoke())
                    .filter_map(|(id, insn)| {
                        let target = insn.get_method()?;
                        let def = resolve_unique_callee(&resolver, overrides, insn.opcode(), target)?;
                        Some(CallSite { insn: id, callee: def.get_ref() })
                    })
                    .collect();
                Some((m.get_ref(), sites))
            })
            .collect();
        per_method.sort_by(|a, b| a.0.cmp(&b.0));

        let mut graph = CallGraph::default();
        for (caller, sites) in per_method {
            for site in &sites {
                let callers = graph.callers.entry(site.callee).or_default();
                if !callers.contains(&caller) {
                    callers.push(caller);
                }
            }
            graph.methods.push(caller);
            graph.callees.insert(caller, sites);
        }
        debug!(
            target: "MAIN",
            "call graph: {} methods, {} resolved call sites",
            graph.methods.len(),
            graph.callees.values().map(Vec::len).sum::<usize>()
        );
        graph
    }

    pub fn methods(&self) -> &[DexMethodRef] {
        &self.methods
    }

    pub fn contains(&self, method: DexMethodRef) -> bool {
        self.callees.contains_key(&method)
    }

    pub fn callees(&self, caller: DexMethodRef) -> &[CallSite] {
        self.callees.get(&caller).map_or(&[], |v| v.as_slice())
    }

    pub fn callers(&self, callee: DexMethodRef) -> &[DexMethodRef] {
        self.callers.get(&callee).map_or(&[], |v| v.as_slice())
    }

    /// The resolved target of the invoke at `insn` in `caller`.
    pub fn callee_at(&self, caller: DexMethodRef, insn: MieId) -> Option<DexMethodRef> {
        self.callees(caller).iter().find(|s| s.insn == insn).map(|s| s.callee)
    }

    /// Methods with callees before callers, where cycles allow it.
    pub fn bottom_up_order(&self) -> Vec<DexMethodRef> {
        let mut visited = HashSet::new();
        let mut post = Vec::with_capacity(self.methods.len());
        for root in &self.methods {
            if !visited.insert(*root) {
                continue;
            }
            let mut stack: Vec<(DexMethodRef, usize)> = vec![(*root, 0)];
            while let Some((m, i)) = stack.pop() {
                if let Some(site) = self.callees(m).get(i) {
                    stack.push((m, i + 1));
                    if self.contains(site.callee) && visited.insert(site.callee) {
                        stack.push((site.callee, 0));
                    }
                } else {
                    post.push(m);
                }
            }
        }
        post
    }

    /// [`bottom_up_order`](Self::bottom_up_order) cut into levels. A callee
    /// reached by a forward edge always sits in an earlier level than its
    /// caller, so one level can be summarized in parallel.
    pub fn bottom_up_levels(&self) -> Vec<Vec<DexMethodRef>> {
        let mut level_of: HashMap<DexMethodRef, usize> = HashMap::with_capacity(self.methods.len());
        let mut levels: Vec<Vec<DexMethodRef>> = Vec::new();
        for m in self.bottom_up_order() {
            let level = self.callees(m).iter().filter_map(|s| level_of.get(&s.callee)).map(|l| l + 1).max().unwrap_or(0);
            level_of.insert(m, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(m);
        }
        levels
    }

    /// Callers before callees.
    pub fn reverse_post_order(&self) -> Vec<DexMethodRef> {
        let mut order = self.bottom_up_order();
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::override_graph::build_graph;
    use crate::dex::instruction::DexRef;
    use crate::ir::code::IRCode;
    use crate::ir::instruction::IRInstruction;
    use crate::ir::list::MethodItem;
    use crate::model::access::DexAccessFlags;
    use crate::model::pool::DexType;

    fn calls(targets: &[(IROpcode, &str)]) -> IRCode {
        let mut code = IRCode::new(1);
        code.list_mut().push_back(MethodItem::Opcode(IRInstruction::new(IROpcode::LoadParamObject).with_dest(0)));
        for (op, t) in targets {
            let mref = DexMethodRef::make_from_descriptor(t).unwrap();
            let insn = IRInstruction::new(*op).with_srcs(&[0]).with_ref(DexRef::Method(mref));
            code.list_mut().push_back(MethodItem::Opcode(insn));
        }
        code.list_mut().push_back(MethodItem::Opcode(IRInstruction::new(IROpcode::ReturnVoid)));
        code
    }

    fn add(cls: &mut DexClass, desc: &str, access: DexAccessFlags, is_virtual: bool, code: IRCode) {
        let mut m = DexMethod::new(DexMethodRef::make_from_descriptor(desc).unwrap());
        m.make_concrete(access, None, is_virtual).unwrap();
        m.set_code(code);
        cls.add_method(m).unwrap();
    }

    #[test]
    fn only_unique_targets_become_edges() {
        let public = DexAccessFlags::PUBLIC;
        let mut base = DexClass::new(DexType::make("Lcg/Base;"), "cg-test").unwrap();
        base.set_access(public);
        add(
            &mut base,
            "Lcg/Base;.top:()V",
            public,
            true,
            calls(&[(IROpcode::InvokeVirtual, "Lcg/Base;.poly:()V"), (IROpcode::InvokeVirtual, "Lcg/Base;.leaf:()V")]),
        );
        add(&mut base, "Lcg/Base;.poly:()V", public, true, calls(&[]));
        add(&mut base, "Lcg/Base;.leaf:()V", public, true, calls(&[(IROpcode::InvokeStatic, "Lcg/Sub;.util:()V")]));
        let mut sub = DexClass::new(DexType::make("Lcg/Sub;"), "cg-test").unwrap();
        sub.set_super_class(Some(base.get_type()));
        add(&mut sub, "Lcg/Sub;.poly:()V", public, true, calls(&[]));
        add(&mut sub, "Lcg/Sub;.util:()V", public | DexAccessFlags::STATIC, false, calls(&[]));

        let scope = vec![&base, &sub];
        let overrides = build_graph(&scope);
        let cg = CallGraph::build(&scope, &overrides);

        let top = DexMethodRef::make_from_descriptor("Lcg/Base;.top:()V").unwrap();
        let leaf = DexMethodRef::make_from_descriptor("Lcg/Base;.leaf:()V").unwrap();
        let util = DexMethodRef::make_from_descriptor("Lcg/Sub;.util:()V").unwrap();
        let callees: Vec<DexMethodRef> = cg.callees(top).iter().map(|s| s.callee).collect();
        assert_eq!(callees, vec![leaf]);
        assert_eq!(cg.callers(util), &[leaf]);

        let order = cg.bottom_up_order();
        let pos = |m: DexMethodRef| order.iter().position(|x| *x == m).unwrap();
        assert!(pos(util) < pos(leaf));
        assert!(pos(leaf) < pos(top));
        assert_eq!(order.len(), 5);
        assert_eq!(cg.reverse_post_order().first(), order.last());

        let levels = cg.bottom_up_levels();
        let level = |m: DexMethodRef| levels.iter().position(|l| l.contains(&m)).unwrap();
        assert_eq!((level(util), level(leaf), level(top)), (0, 1, 2));
        assert_eq!(levels.iter().map(Vec::len).sum::<usize>(), 5);
    }

    #[test]
    fn cycles_break_at_the_back_edge() {
        let st = DexAccessFlags::PUBLIC | DexAccessFlags::STATIC;
        let mut cls = DexClass::new(DexType::make("Lcg/Loop;"), "cg-test").unwrap();
        add(&mut cls, "Lcg/Loop;.ping:()V", st, false, calls(&[(IROpcode::InvokeStatic, "Lcg/Loop;.pong:()V")]));
        add(&mut cls, "Lcg/Loop;.pong:()V", st, false, calls(&[(IROpcode::InvokeStatic, "Lcg/Loop;.ping:()V")]));
        let scope = vec![&cls];
        let cg = CallGraph::build(&scope, &build_graph(&scope));

        let ping = DexMethodRef::make_from_descriptor("Lcg/Loop;.ping:()V").unwrap();
        let pong = DexMethodRef::make_from_descriptor("Lcg/Loop;.pong:()V").unwrap();
        assert_eq!(cg.bottom_up_order(), vec![pong, ping]);
        assert_eq!(cg.bottom_up_levels(), vec![vec![pong], vec![ping]]);
    }
}
