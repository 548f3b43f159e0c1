//! The method-override graph.
//!
//! Nodes are virtual methods; an edge runs from an overridden (or
//! implemented interface) method to each method that directly overrides or
//! implements it. Every class is analyzed after its supertypes, carrying two
//! signature maps down the hierarchy:
//!
//! - `implemented`: the methods that currently occupy a signature;
//! - `unimplemented`: interface methods still waiting for an implementation.
//!
//! The maps are persistent so a subclass starts from a cheap copy of its
//! parent's. Edges from a superinterface method to an implementation are not
//! added when an intermediate interface redeclares the signature; walk the
//! graph transitively to see every implementation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use crate::model::class::{DexClass, DexMethod};
use crate::model::pool::{DexMethodRef, DexProto, DexString, DexType};

type Signature = (DexString, DexProto);
type MethodSet = im::HashSet<DexMethodRef>;
type SignatureMap = im::HashMap<Signature, MethodSet>;

#[derive(Debug, Clone, Default)]
struct SignatureMaps {
    implemented: SignatureMap,
    unimplemented: SignatureMap,
}

/// One method's immediate neighbours in the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodOverrideNode {
    /// Methods this one directly overrides or implements.
    pub parents: BTreeSet<DexMethodRef>,
    /// Methods that directly override or implement this one.
    pub children: BTreeSet<DexMethodRef>,
    pub is_interface: bool,
}

#[derive(Debug, Default)]
pub struct MethodOverrideGraph {
    nodes: HashMap<DexMethodRef, MethodOverrideNode>,
}

impl MethodOverrideGraph {
    pub fn node(&self, method: DexMethodRef) -> Option<&MethodOverrideNode> {
        self.nodes.get(&method)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.children.len()).sum()
    }

    /// Whether any method in scope overrides or implements `method`.
    pub fn is_overridden(&self, method: DexMethodRef) -> bool {
        self.nodes.get(&method).is_some_and(|n| !n.children.is_empty())
    }
}

/// Builds the graph, analyzing classes on the rayon pool. Each class's maps
/// are computed once and shared with its subtypes.
pub fn build_graph(scope: &[&DexClass]) -> MethodOverrideGraph {
    let builder = GraphBuilder {
        classes: scope.iter().map(|c| (c.get_type(), *c)).collect(),
        maps: DashMap::new(),
        nodes: DashMap::new(),
    };
    scope.par_iter().for_each(|cls| {
        builder.maps_for(cls.get_type(), &mut Vec::new());
    });
    let graph = MethodOverrideGraph { nodes: builder.nodes.into_iter().collect() };
    debug!(target: "OVERRIDE", "override graph: {} nodes, {} edges", graph.len(), graph.edge_count());
    graph
}

/// Every method that overrides or implements `method`, directly or not,
/// in a stable order.
pub fn get_overriding_methods(graph: &MethodOverrideGraph, method: DexMethodRef) -> Vec<DexMethodRef> {
    transitive(graph, method, |n| &n.children)
}

/// Every method that `method` overrides or implements, directly or not.
pub fn get_overridden_methods(graph: &MethodOverrideGraph, method: DexMethodRef) -> Vec<DexMethodRef> {
    transitive(graph, method, |n| &n.parents)
}

fn transitive<F>(graph: &MethodOverrideGraph, method: DexMethodRef, next: F) -> Vec<DexMethodRef>
where
    F: Fn(&MethodOverrideNode) -> &BTreeSet<DexMethodRef>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut pending = vec![method];
    while let Some(m) = pending.pop() {
        let Some(node) = graph.node(m) else {
            continue;
        };
        for n in next(node) {
            if seen.insert(*n) {
                out.push(*n);
                pending.push(*n);
            }
        }
    }
    out.sort();
    out
}

struct GraphBuilder<'a> {
    classes: HashMap<DexType, &'a DexClass>,
    maps: DashMap<DexType, Arc<SignatureMaps>>,
    nodes: DashMap<DexMethodRef, MethodOverrideNode>,
}

fn signature(m: &DexMethod) -> Signature {
    (m.name(), m.proto())
}

impl<'a> GraphBuilder<'a> {
    fn add_edge(&self, parent: DexMethodRef, child: DexMethodRef) {
        if parent == child {
            return;
        }
        self.nodes.entry(parent).or_default().children.insert(child);
        self.nodes.entry(child).or_default().parents.insert(parent);
    }

    fn add_node(&self, method: DexMethodRef, is_interface: bool) {
        self.nodes.entry(method).or_default().is_interface = is_interface;
    }

    /// Whether a method of `child_class` can override `parent`.
    fn can_override(&self, parent: DexMethodRef, child_class: DexType) -> bool {
        let Some(cls) = self.classes.get(&parent.class()) else {
            return false;
        };
        let Some(def) = cls.find_method(parent) else {
            return false;
        };
        let access = def.access();
        if access.is_public() || access.is_protected() {
            return true;
        }
        access.is_package_private() && !cls.is_external() && parent.class().same_package(child_class)
    }

    /// The signature maps of `ty`, computed on first use. Types outside the
    /// scope contribute nothing.
    fn maps_for(&self, ty: DexType, visiting: &mut Vec<DexType>) -> Arc<SignatureMaps> {
        if let Some(m) = self.maps.get(&ty).map(|m| Arc::clone(&m)) {
            return m;
        }
        let Some(cls) = self.classes.get(&ty).copied() else {
            return Arc::new(SignatureMaps::default());
        };
        if visiting.contains(&ty) {
            debug!(target: "OVERRIDE", "cyclic hierarchy through {}", ty);
            return Arc::new(SignatureMaps::default());
        }
        visiting.push(ty);
        let maps = if cls.is_interface() { self.interface_maps(cls, visiting) } else { self.class_maps(cls, visiting) };
        visiting.pop();
        let maps = Arc::new(maps);
        self.maps.insert(ty, Arc::clone(&maps));
        maps
    }

    fn interface_maps(&self, cls: &DexClass, visiting: &mut Vec<DexType>) -> SignatureMaps {
        let mut implemented = SignatureMap::new();
        for sup in cls.interfaces().iter() {
            let parent = self.maps_for(*sup, visiting);
            implemented = union(implemented, &parent.implemented);
        }
        for m in cls.get_vmethods() {
            let sig = signature(m);
            self.add_node(m.get_ref(), true);
            if let Some(parents) = implemented.get(&sig) {
                for p in parents {
                    self.add_edge(*p, m.get_ref());
                }
            }
            implemented.insert(sig, MethodSet::unit(m.get_ref()));
        }
        SignatureMaps { implemented, unimplemented: SignatureMap::new() }
    }

    fn class_maps(&self, cls: &DexClass, visiting: &mut Vec<DexType>) -> SignatureMaps {
        let mut maps = match cls.super_class() {
            Some(sup) => (*self.maps_for(sup, visiting)).clone(),
            None => SignatureMaps::default(),
        };
        for iface in cls.interfaces().iter() {
            let parent = self.maps_for(*iface, visiting);
            maps.unimplemented = union(maps.unimplemented, &parent.implemented);
        }

        let ty = cls.get_type();
        for m in cls.get_vmethods() {
            let sig = signature(m);
            let mref = m.get_ref();
            self.add_node(mref, false);
            let mut occupants = maps.implemented.get(&sig).cloned().unwrap_or_default();
            for p in occupants.clone() {
                if self.can_override(p, ty) {
                    self.add_edge(p, mref);
                    occupants.remove(&p);
                }
            }
            occupants.insert(mref);
            maps.implemented.insert(sig, occupants);
        }

        // Interface methods are satisfied by whatever now occupies the
        // signature, declared here or inherited.
        let pending: Vec<Signature> =
            maps.unimplemented.keys().filter(|sig| maps.implemented.contains_key(*sig)).cloned().collect();
        for sig in pending {
            let (Some(ifaces), Some(impls)) = (maps.unimplemented.get(&sig), maps.implemented.get(&sig)) else {
                continue;
            };
            for i in ifaces {
                for m in impls {
                    self.add_edge(*i, *m);
                }
            }
            maps.unimplemented.remove(&sig);
        }
        maps
    }
}

fn union(mut into: SignatureMap, from: &SignatureMap) -> SignatureMap {
    for (sig, methods) in from {
        let merged = match into.get(sig) {
            Some(existing) => existing.clone().union(methods.clone()),
            None => methods.clone(),
        };
        into.insert(*sig, merged);
    }
    into
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::access::DexAccessFlags;
    use crate::model::pool::DexTypeList;

    fn class(name: &str, sup: Option<&str>, ifaces: &[&str], access: DexAccessFlags) -> DexClass {
        let mut c = DexClass::new(DexType::make(name), "override-test").unwrap();
        c.set_super_class(sup.map(DexType::make));
        c.set_interfaces(DexTypeList::make(ifaces.iter().map(|i| DexType::make(i)).collect()));
        c.set_access(access);
        c
    }

    fn virt(c: &mut DexClass, desc: &str, access: DexAccessFlags) -> DexMethodRef {
        let mref = DexMethodRef::make_from_descriptor(desc).unwrap();
        let mut m = DexMethod::new(mref);
        m.make_concrete(access, None, true).unwrap();
        c.add_method(m).unwrap();
        mref
    }

    #[test]
    fn package_private_methods_do_not_link_across_packages() {
        let mut x = class("Lovr/a/X;", None, &[], DexAccessFlags::PUBLIC);
        let xm = virt(&mut x, "Lovr/a/X;.m:()V", DexAccessFlags::empty());
        let mut other = class("Lovr/b/Y;", Some("Lovr/a/X;"), &[], DexAccessFlags::PUBLIC);
        virt(&mut other, "Lovr/b/Y;.m:()V", DexAccessFlags::PUBLIC);
        let mut same = class("Lovr/a/Y;", Some("Lovr/a/X;"), &[], DexAccessFlags::PUBLIC);
        let same_m = virt(&mut same, "Lovr/a/Y;.m:()V", DexAccessFlags::PUBLIC);

        let graph = build_graph(&[&x, &other]);
        assert!(get_overriding_methods(&graph, xm).is_empty());

        let graph = build_graph(&[&x, &same]);
        assert_eq!(get_overriding_methods(&graph, xm), vec![same_m]);
        assert_eq!(get_overridden_methods(&graph, same_m), vec![xm]);
    }

    #[test]
    fn inherited_implementations_satisfy_later_interfaces() {
        let abstract_iface = DexAccessFlags::PUBLIC | DexAccessFlags::INTERFACE | DexAccessFlags::ABSTRACT;
        let mut i = class("Lovr/I;", None, &[], abstract_iface);
        let i_run = virt(&mut i, "Lovr/I;.run:()V", DexAccessFlags::PUBLIC | DexAccessFlags::ABSTRACT);
        let mut j = class("Lovr/J;", None, &["Lovr/I;"], abstract_iface);
        let jm = virt(&mut j, "Lovr/J;.run:()V", DexAccessFlags::PUBLIC | DexAccessFlags::ABSTRACT);
        let mut base = class("Lovr/Base;", None, &[], DexAccessFlags::PUBLIC);
        let base_m = virt(&mut base, "Lovr/Base;.run:()V", DexAccessFlags::PUBLIC);
        let derived = class("Lovr/Derived;", Some("Lovr/Base;"), &["Lovr/J;"], DexAccessFlags::PUBLIC);

        let graph = build_graph(&[&derived, &base, &j, &i]);
        // J.run redeclares I.run, so I.run only reaches Base.run through it.
        assert_eq!(graph.node(i_run).unwrap().children.iter().copied().collect::<Vec<_>>(), vec![jm]);
        assert_eq!(graph.node(jm).unwrap().children.iter().copied().collect::<Vec<_>>(), vec![base_m]);
        assert_eq!(get_overriding_methods(&graph, i_run), {
            let mut v = vec![jm, base_m];
            v.sort();
            v
        });
        assert!(graph.node(i_run).unwrap().is_interface);
        assert!(graph.is_overridden(jm));
        assert!(!graph.is_overridden(base_m));
    }
}
