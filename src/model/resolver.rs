//! Ref to def resolution over a class scope.

use std::collections::{HashMap, HashSet};

use crate::dex::error::{DexError, ErrorKind};
use crate::model::class::{DexClass, DexField, DexMethod};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexType};

/// Where a method lookup may look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodSearch {
    /// Direct methods of the named class only.
    Direct,
    /// Static methods of the class and its superclasses.
    Static,
    /// Virtual methods of the class and its superclasses, then interfaces.
    Virtual,
    /// Like `Virtual`, but starting at the superclass.
    Super,
    /// Methods declared on the interface hierarchy.
    Interface,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldSearch {
    Static,
    Instance,
    Any,
}

pub struct Resolver<'a> {
    classes: HashMap<DexType, &'a DexClass>,
}

impl<'a> Resolver<'a> {
    pub fn new(scope: &[&'a DexClass]) -> Resolver<'a> {
        Resolver { classes: scope.iter().map(|c| (c.get_type(), *c)).collect() }
    }

    pub fn type_class(&self, ty: DexType) -> Option<&'a DexClass> {
        self.classes.get(&ty).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// The class followed by each superclass that is in scope.
    pub fn superclass_chain(&self, ty: DexType) -> Vec<&'a DexClass> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.type_class(ty);
        while let Some(cls) = cursor {
            if !seen.insert(cls.get_type()) {
                break;
            }
            chain.push(cls);
            cursor = cls.super_class().and_then(|s| self.type_class(s));
        }
        chain
    }

    /// Whether `child` is `parent` or extends or implements it.
    pub fn is_subtype(&self, parent: DexType, child: DexType) -> bool {
        let mut pending = vec![child];
        let mut seen = HashSet::new();
        while let Some(t) = pending.pop() {
            if t == parent {
                return true;
            }
            if !seen.insert(t) {
                continue;
            }
            if let Some(cls) = self.type_class(t) {
                pending.extend(cls.super_class());
                pending.extend(cls.interfaces().iter().copied());
            }
        }
        false
    }

    pub fn resolve_field(&self, fref: DexFieldRef, search: FieldSearch) -> Option<&'a DexField> {
        let matches = |f: &&DexField| {
            f.name() == fref.name()
                && f.ty() == fref.ty()
                && match search {
                    FieldSearch::Static => f.is_static(),
                    FieldSearch::Instance => !f.is_static(),
                    FieldSearch::Any => true,
                }
        };
        for cls in self.superclass_chain(fref.class()) {
            if let Some(f) = cls.get_all_fields().find(matches) {
                return Some(f);
            }
            // Static fields may also come from implemented interfaces.
            if search != FieldSearch::Instance {
                for iface in self.interface_closure(cls.get_type()) {
                    if let Some(f) = iface.get_sfields().iter().find(matches) {
                        return Some(f);
                    }
                }
            }
        }
        None
    }

    pub fn resolve_method(&self, mref: DexMethodRef, search: MethodSearch) -> Option<&'a DexMethod> {
        let same = |m: &&DexMethod| m.name() == mref.name() && m.proto() == mref.proto();
        match search {
            MethodSearch::Direct => {
                self.type_class(mref.class()).and_then(|c| c.get_dmethods().iter().find(same))
            }
            MethodSearch::Static => self
                .superclass_chain(mref.class())
                .into_iter()
                .find_map(|c| c.get_dmethods().iter().filter(|m| m.is_static()).find(same)),
            MethodSearch::Virtual => self.resolve_virtual(mref.class(), mref),
            MethodSearch::Super => {
                let parent = self.type_class(mref.class()).and_then(|c| c.super_class())?;
                self.resolve_virtual(parent, mref)
            }
            MethodSearch::Interface => self
                .type_class(mref.class())
                .into_iter()
                .chain(self.interface_closure(mref.class()))
                .find_map(|c| c.get_vmethods().iter().find(same)),
            MethodSearch::Any => self
                .superclass_chain(mref.class())
                .into_iter()
                .find_map(|c| c.get_all_methods().find(same))
                .or_else(|| self.resolve_method(mref, MethodSearch::Interface)),
        }
    }

    /// Like [`Resolver::resolve_method`] but reports a miss as an error.
    pub fn resolve_method_or_fail(&self, mref: DexMethodRef, search: MethodSearch) -> Result<&'a DexMethod, DexError> {
        self.resolve_method(mref, search).ok_or_else(|| {
            DexError::from_kind(ErrorKind::ResolutionFailure(format!("{} ({:?} search)", mref, search)))
        })
    }

    fn resolve_virtual(&self, start: DexType, mref: DexMethodRef) -> Option<&'a DexMethod> {
        let same = |m: &&DexMethod| m.name() == mref.name() && m.proto() == mref.proto();
        self.superclass_chain(start)
            .into_iter()
            .find_map(|c| c.get_vmethods().iter().find(same))
            .or_else(|| self.interface_closure(start).into_iter().find_map(|c| c.get_vmethods().iter().find(same)))
    }

    /// Every interface reachable from `ty` through its superclasses and
    /// superinterfaces, nearest first.
    pub fn interface_closure(&self, ty: DexType) -> Vec<&'a DexClass> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<DexType> = Vec::new();
        for cls in self.superclass_chain(ty) {
            pending.extend(cls.interfaces().iter().copied());
        }
        let mut i = 0;
        while i < pending.len() {
            let t = pending[i];
            i += 1;
            if !seen.insert(t) {
                continue;
            }
            if let Some(cls) = self.type_class(t) {
                out.push(cls);
                pending.extend(cls.interfaces().iter().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::access::DexAccessFlags;
    use crate::model::pool::DexTypeList;

    fn class(name: &str, sup: Option<&str>, ifaces: &[&str], access: DexAccessFlags) -> DexClass {
        let mut c = DexClass::new(DexType::make(name), "resolver-test").unwrap();
        c.set_super_class(sup.map(DexType::make));
        c.set_interfaces(DexTypeList::make(ifaces.iter().map(|i| DexType::make(i)).collect()));
        c.set_access(access);
        c
    }

    fn add(c: &mut DexClass, desc: &str, access: DexAccessFlags, is_virtual: bool) {
        let mut m = DexMethod::new(DexMethodRef::make_from_descriptor(desc).unwrap());
        m.make_concrete(access, None, is_virtual).unwrap();
        c.add_method(m).unwrap();
    }

    #[test]
    fn virtual_lookup_walks_supers_then_interfaces() {
        let mut iface = class("Lres/I;", None, &[], DexAccessFlags::INTERFACE | DexAccessFlags::ABSTRACT);
        add(&mut iface, "Lres/I;.dflt:()V", DexAccessFlags::PUBLIC, true);
        let mut base = class("Lres/Base;", None, &["Lres/I;"], DexAccessFlags::PUBLIC);
        add(&mut base, "Lres/Base;.run:()V", DexAccessFlags::PUBLIC, true);
        add(&mut base, "Lres/Base;.make:()V", DexAccessFlags::PUBLIC | DexAccessFlags::STATIC, false);
        let derived = class("Lres/Derived;", Some("Lres/Base;"), &[], DexAccessFlags::PUBLIC);

        let scope = vec![&iface, &base, &derived];
        let r = Resolver::new(&scope);
        let run = DexMethodRef::make_from_descriptor("Lres/Derived;.run:()V").unwrap();
        assert_eq!(r.resolve_method(run, MethodSearch::Virtual).unwrap().class(), base.get_type());
        assert!(r.resolve_method(run, MethodSearch::Direct).is_none());

        let dflt = DexMethodRef::make_from_descriptor("Lres/Derived;.dflt:()V").unwrap();
        assert_eq!(r.resolve_method(dflt, MethodSearch::Virtual).unwrap().class(), iface.get_type());

        let make = DexMethodRef::make_from_descriptor("Lres/Derived;.make:()V").unwrap();
        assert!(r.resolve_method(make, MethodSearch::Static).is_some());
        assert!(r.resolve_method(make, MethodSearch::Virtual).is_none());

        let sup = DexMethodRef::make_from_descriptor("Lres/Base;.run:()V").unwrap();
        assert!(r.resolve_method(sup, MethodSearch::Super).is_none());
        assert!(r.resolve_method_or_fail(sup, MethodSearch::Super).is_err());

        assert!(r.is_subtype(iface.get_type(), derived.get_type()));
        assert!(!r.is_subtype(derived.get_type(), base.get_type()));
    }
}
