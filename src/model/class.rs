//! Concrete definitions: classes and the fields and methods they own.
//!
//! Refs from the pool become defs through `make_concrete`, which may happen
//! once per ref while the def is alive. Classes publish their type in a
//! process-wide index on creation and withdraw it when dropped, so a type
//! never has two live definitions.

use std::fmt;

use dashmap::DashMap;
use log::{trace, warn};
use once_cell::sync::Lazy;

use crate::config::DexOptions;
use crate::dex::annotations::{DexAnnotationSet, ParamAnnotations};
use crate::dex::code::DexCode;
use crate::dex::encoded_values::EncodedValue;
use crate::dex::error::{DexError, ErrorKind};
use crate::ir::balloon;
use crate::ir::code::IRCode;
use crate::ir::sync;
use crate::model::access::DexAccessFlags;
use crate::model::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType, DexTypeList};

/// Types with a live definition, mapped to the location that defined them.
static CLASS_INDEX: Lazy<DashMap<DexType, String>> = Lazy::new(DashMap::new);
static CONCRETE_METHODS: Lazy<DashMap<DexMethodRef, usize>> = Lazy::new(DashMap::new);
static CONCRETE_FIELDS: Lazy<DashMap<DexFieldRef, usize>> = Lazy::new(DashMap::new);

/// Where the live definition of `ty` came from, if there is one.
pub fn class_location(ty: DexType) -> Option<String> {
    CLASS_INDEX.get(&ty).map(|l| l.clone())
}

pub fn is_defined(ty: DexType) -> bool {
    CLASS_INDEX.contains_key(&ty)
}

pub fn defined_class_count() -> usize {
    CLASS_INDEX.len()
}

fn claim<K: std::hash::Hash + Eq>(registry: &DashMap<K, usize>, key: K, exclusive: bool) -> bool {
    let mut count = registry.entry(key).or_insert(0);
    if exclusive && *count > 0 {
        return false;
    }
    *count += 1;
    true
}

fn release<K: std::hash::Hash + Eq>(registry: &DashMap<K, usize>, key: &K) {
    registry.remove_if_mut(key, |_, count| {
        *count = count.saturating_sub(1);
        *count == 0
    });
}

// ---------------------------------------------------------------------------
// Fields

#[derive(Debug)]
pub struct DexField {
    fref: DexFieldRef,
    access: DexAccessFlags,
    concrete: bool,
    external: bool,
    annotations: Option<DexAnnotationSet>,
    static_value: Option<EncodedValue>,
}

impl DexField {
    pub fn new(fref: DexFieldRef) -> DexField {
        DexField { fref, access: DexAccessFlags::empty(), concrete: false, external: false, annotations: None, static_value: None }
    }

    /// Promotes the ref to a definition.
    pub fn make_concrete(&mut self, access: DexAccessFlags, value: Option<EncodedValue>) -> Result<(), DexError> {
        if self.concrete || !claim(&CONCRETE_FIELDS, self.fref, true) {
            return Err(DexError::from_kind(ErrorKind::DuplicateField(self.fref.to_string())));
        }
        self.concrete = true;
        self.access = access;
        self.static_value = value;
        Ok(())
    }

    /// Marks the field as defined outside the program being optimized.
    pub fn set_external(&mut self) {
        self.external = true;
    }

    pub fn get_ref(&self) -> DexFieldRef {
        self.fref
    }

    pub fn class(&self) -> DexType {
        self.fref.class()
    }

    pub fn name(&self) -> DexString {
        self.fref.name()
    }

    pub fn ty(&self) -> DexType {
        self.fref.ty()
    }

    pub fn access(&self) -> DexAccessFlags {
        self.access
    }

    pub fn set_access(&mut self, access: DexAccessFlags) {
        self.access = access;
    }

    pub fn is_static(&self) -> bool {
        self.access.is_static()
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn annotations(&self) -> Option<&DexAnnotationSet> {
        self.annotations.as_ref()
    }

    pub fn set_annotations(&mut self, annotations: Option<DexAnnotationSet>) {
        self.annotations = annotations;
    }

    pub fn static_value(&self) -> Option<&EncodedValue> {
        self.static_value.as_ref()
    }

    pub fn set_static_value(&mut self, value: Option<EncodedValue>) {
        self.static_value = value;
    }
}

impl Drop for DexField {
    fn drop(&mut self) {
        if self.concrete {
            release(&CONCRETE_FIELDS, &self.fref);
        }
    }
}

impl fmt::Display for DexField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fref)
    }
}

// ---------------------------------------------------------------------------
// Methods

#[derive(Debug)]
pub struct DexMethod {
    mref: DexMethodRef,
    access: DexAccessFlags,
    is_virtual: bool,
    concrete: bool,
    external: bool,
    annotations: Option<DexAnnotationSet>,
    param_annotations: ParamAnnotations,
    dex_code: Option<DexCode>,
    ir_code: Option<IRCode>,
}

impl DexMethod {
    pub fn new(mref: DexMethodRef) -> DexMethod {
        DexMethod {
            mref,
            access: DexAccessFlags::empty(),
            is_virtual: false,
            concrete: false,
            external: false,
            annotations: None,
            param_annotations: ParamAnnotations::new(),
            dex_code: None,
            ir_code: None,
        }
    }

    /// Promotes the ref to a definition. Fails if this ref already has a
    /// live concrete definition.
    pub fn make_concrete(&mut self, access: DexAccessFlags, code: Option<DexCode>, is_virtual: bool) -> Result<(), DexError> {
        if self.concrete || !claim(&CONCRETE_METHODS, self.mref, true) {
            return Err(DexError::from_kind(ErrorKind::DuplicateMethod(self.mref.to_string())));
        }
        self.concrete = true;
        self.access = access;
        self.is_virtual = is_virtual;
        self.dex_code = code;
        self.ir_code = None;
        Ok(())
    }

    pub fn set_external(&mut self) {
        self.external = true;
    }

    /// Clones this method under a new owner and name, with independent
    /// copies of its code and annotations. The copy is concrete even when
    /// it ends up with the same ref as the source.
    pub fn make_method_from(&self, new_owner: DexType, new_name: DexString) -> Result<DexMethod, DexError> {
        if !self.concrete {
            fail!("cannot copy {}, it is not concrete", self.mref);
        }
        let mref = DexMethodRef::make(new_owner, new_name, self.mref.proto());
        claim(&CONCRETE_METHODS, mref, false);
        trace!(target: "MTRANS", "copied {} to {}", self.mref, mref);
        Ok(DexMethod {
            mref,
            access: self.access,
            is_virtual: self.is_virtual,
            concrete: true,
            external: self.external,
            annotations: self.annotations.clone(),
            param_annotations: self.param_annotations.clone(),
            dex_code: self.dex_code.clone(),
            ir_code: self.ir_code.as_ref().map(|c| c.deep_copy()),
        })
    }

    pub fn get_ref(&self) -> DexMethodRef {
        self.mref
    }

    pub fn class(&self) -> DexType {
        self.mref.class()
    }

    pub fn name(&self) -> DexString {
        self.mref.name()
    }

    pub fn proto(&self) -> DexProto {
        self.mref.proto()
    }

    pub fn access(&self) -> DexAccessFlags {
        self.access
    }

    pub fn set_access(&mut self, access: DexAccessFlags) {
        self.access = access;
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn set_virtual(&mut self, is_virtual: bool) {
        self.is_virtual = is_virtual;
    }

    pub fn is_static(&self) -> bool {
        self.access.is_static()
    }

    pub fn is_abstract(&self) -> bool {
        self.access.is_abstract()
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn annotations(&self) -> Option<&DexAnnotationSet> {
        self.annotations.as_ref()
    }

    pub fn set_annotations(&mut self, annotations: Option<DexAnnotationSet>) {
        self.annotations = annotations;
    }

    pub fn param_annotations(&self) -> &ParamAnnotations {
        &self.param_annotations
    }

    pub fn param_annotations_mut(&mut self) -> &mut ParamAnnotations {
        &mut self.param_annotations
    }

    pub fn dex_code(&self) -> Option<&DexCode> {
        self.dex_code.as_ref()
    }

    /// Installs a linear body, dropping any Method-IR body.
    pub fn set_dex_code(&mut self, code: Option<DexCode>) {
        self.dex_code = code;
        self.ir_code = None;
    }

    pub fn get_code(&self) -> Option<&IRCode> {
        self.ir_code.as_ref()
    }

    pub fn get_code_mut(&mut self) -> Option<&mut IRCode> {
        self.ir_code.as_mut()
    }

    /// Installs a Method-IR body, dropping any linear body.
    pub fn set_code(&mut self, code: IRCode) {
        self.ir_code = Some(code);
        self.dex_code = None;
    }

    /// Whether the method has a body in either form.
    pub fn has_code(&self) -> bool {
        self.dex_code.is_some() || self.ir_code.is_some()
    }

    pub fn balloon(&mut self) -> Result<(), DexError> {
        self.balloon_with(&DexOptions::default())
    }

    /// Converts the linear body into Method-IR.
    pub fn balloon_with(&mut self, options: &DexOptions) -> Result<(), DexError> {
        if self.ir_code.is_some() {
            return Err(DexError::structural("method is already ballooned".to_string()).in_method(&self.mref.to_string()));
        }
        let Some(code) = self.dex_code.as_ref() else {
            return Err(DexError::structural("method has no code to balloon".to_string()).in_method(&self.mref.to_string()));
        };
        let ir = balloon::balloon(code, self.mref, self.is_static(), options)?;
        self.set_code(ir);
        Ok(())
    }

    /// Converts the Method-IR body back into linear form, writing back an
    /// editable graph first.
    pub fn sync(&mut self) -> Result<(), DexError> {
        let Some(code) = self.ir_code.as_mut() else {
            return Err(DexError::structural("method has no IR to sync".to_string()).in_method(&self.mref.to_string()));
        };
        code.clear_cfg().map_err(|e| e.in_method(&self.mref.to_string()))?;
        let dex = sync::sync(code, self.mref)?;
        self.set_dex_code(Some(dex));
        Ok(())
    }
}

impl Drop for DexMethod {
    fn drop(&mut self) {
        if self.concrete {
            release(&CONCRETE_METHODS, &self.mref);
        }
    }
}

impl fmt::Display for DexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mref)
    }
}

// ---------------------------------------------------------------------------
// Classes

#[derive(Debug)]
pub struct DexClass {
    ty: DexType,
    super_class: Option<DexType>,
    interfaces: DexTypeList,
    source_file: Option<DexString>,
    access: DexAccessFlags,
    sfields: Vec<DexField>,
    ifields: Vec<DexField>,
    dmethods: Vec<DexMethod>,
    vmethods: Vec<DexMethod>,
    annotations: Option<DexAnnotationSet>,
    deobfuscated_name: Option<DexString>,
    external: bool,
    location: String,
}

fn method_key(m: &DexMethod) -> (DexString, DexProto) {
    (m.name(), m.proto())
}

fn field_key(f: &DexField) -> (DexString, DexType) {
    (f.name(), f.ty())
}

impl DexClass {
    /// Creates an empty class and publishes it in the class index.
    pub fn new(ty: DexType, location: &str) -> Result<DexClass, DexError> {
        match CLASS_INDEX.entry(ty) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(DexError::from_kind(ErrorKind::DuplicateClass(format!(
                    "{} in {} (first defined in {})",
                    ty,
                    location,
                    e.get()
                ))));
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(location.to_string());
            }
        }
        Ok(DexClass {
            ty,
            super_class: None,
            interfaces: DexTypeList::empty(),
            source_file: None,
            access: DexAccessFlags::empty(),
            sfields: Vec::new(),
            ifields: Vec::new(),
            dmethods: Vec::new(),
            vmethods: Vec::new(),
            annotations: None,
            deobfuscated_name: None,
            external: false,
            location: location.to_string(),
        })
    }

    pub fn get_type(&self) -> DexType {
        self.ty
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn super_class(&self) -> Option<DexType> {
        self.super_class
    }

    pub fn set_super_class(&mut self, super_class: Option<DexType>) {
        self.super_class = super_class;
    }

    pub fn interfaces(&self) -> DexTypeList {
        self.interfaces
    }

    pub fn set_interfaces(&mut self, interfaces: DexTypeList) {
        self.interfaces = interfaces;
    }

    pub fn source_file(&self) -> Option<DexString> {
        self.source_file
    }

    pub fn set_source_file(&mut self, source_file: Option<DexString>) {
        self.source_file = source_file;
    }

    pub fn access(&self) -> DexAccessFlags {
        self.access
    }

    pub fn set_access(&mut self, access: DexAccessFlags) {
        self.access = access;
    }

    pub fn is_interface(&self) -> bool {
        self.access.is_interface()
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn set_external(&mut self) {
        self.external = true;
    }

    pub fn annotations(&self) -> Option<&DexAnnotationSet> {
        self.annotations.as_ref()
    }

    pub fn set_annotations(&mut self, annotations: Option<DexAnnotationSet>) {
        self.annotations = annotations;
    }

    pub fn deobfuscated_name(&self) -> DexString {
        self.deobfuscated_name.unwrap_or_else(|| self.ty.name())
    }

    /// Records the original name of an obfuscated class. Names that differ
    /// from the type become an alias of it; an alias already taken by
    /// another type is refused with a warning and `false`.
    pub fn set_deobfuscated_name(&mut self, name: &str) -> bool {
        let name = DexString::make(name);
        if name != self.ty.name() {
            if let Err(e) = self.ty.set_alias(name) {
                warn!("[class] not renaming {}: {}", self.ty, e);
                return false;
            }
        }
        self.deobfuscated_name = Some(name);
        true
    }

    pub fn get_sfields(&self) -> &[DexField] {
        &self.sfields
    }

    pub fn get_ifields(&self) -> &[DexField] {
        &self.ifields
    }

    pub fn get_dmethods(&self) -> &[DexMethod] {
        &self.dmethods
    }

    pub fn get_vmethods(&self) -> &[DexMethod] {
        &self.vmethods
    }

    pub fn get_all_fields(&self) -> impl Iterator<Item = &DexField> {
        self.sfields.iter().chain(self.ifields.iter())
    }

    pub fn get_all_methods(&self) -> impl Iterator<Item = &DexMethod> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    pub fn get_all_methods_mut(&mut self) -> impl Iterator<Item = &mut DexMethod> {
        self.dmethods.iter_mut().chain(self.vmethods.iter_mut())
    }

    pub fn find_method(&self, mref: DexMethodRef) -> Option<&DexMethod> {
        self.get_all_methods().find(|m| m.get_ref() == mref)
    }

    pub fn find_method_mut(&mut self, mref: DexMethodRef) -> Option<&mut DexMethod> {
        self.get_all_methods_mut().find(|m| m.get_ref() == mref)
    }

    pub fn find_field(&self, fref: DexFieldRef) -> Option<&DexField> {
        self.get_all_fields().find(|f| f.get_ref() == fref)
    }

    /// Adds a method, keeping each list in (name, proto) order.
    pub fn add_method(&mut self, method: DexMethod) -> Result<(), DexError> {
        if method.class() != self.ty {
            return Err(DexError::structural(format!("method belongs to {}, not {}", method.class(), self.ty))
                .in_method(&method.to_string()));
        }
        if !method.is_concrete() && !method.is_external() {
            return Err(DexError::structural("method is neither concrete nor external".to_string())
                .in_method(&method.to_string()));
        }
        if self.find_method(method.get_ref()).is_some() {
            return Err(DexError::from_kind(ErrorKind::DuplicateMethod(method.to_string())));
        }
        let list = if method.is_virtual() { &mut self.vmethods } else { &mut self.dmethods };
        let key = method_key(&method);
        let at = list.partition_point(|m| method_key(m) < key);
        list.insert(at, method);
        Ok(())
    }

    /// Removes and returns the method with ref `mref`.
    pub fn remove_method(&mut self, mref: DexMethodRef) -> Result<DexMethod, DexError> {
        for list in [&mut self.dmethods, &mut self.vmethods] {
            if let Some(i) = list.iter().position(|m| m.get_ref() == mref) {
                return Ok(list.remove(i));
            }
        }
        Err(DexError::from_kind(ErrorKind::ResolutionFailure(format!("{} is not a member of {}", mref, self.ty))))
    }

    /// Adds a field to the static or instance list according to its flags.
    pub fn add_field(&mut self, field: DexField) -> Result<(), DexError> {
        if field.class() != self.ty {
            fail!("field {} does not belong to {}", field, self.ty);
        }
        if !field.is_concrete() && !field.is_external() {
            fail!("field {} is neither concrete nor external", field);
        }
        if self.find_field(field.get_ref()).is_some() {
            return Err(DexError::from_kind(ErrorKind::DuplicateField(field.to_string())));
        }
        let list = if field.is_static() { &mut self.sfields } else { &mut self.ifields };
        let key = field_key(&field);
        let at = list.partition_point(|f| field_key(f) < key);
        list.insert(at, field);
        Ok(())
    }

    pub fn remove_field(&mut self, fref: DexFieldRef) -> Result<DexField, DexError> {
        for list in [&mut self.sfields, &mut self.ifields] {
            if let Some(i) = list.iter().position(|f| f.get_ref() == fref) {
                return Ok(list.remove(i));
            }
        }
        Err(DexError::from_kind(ErrorKind::ResolutionFailure(format!("{} is not a member of {}", fref, self.ty))))
    }

    /// Balloons every method that still has a linear body.
    pub fn balloon_all(&mut self, options: &DexOptions) -> Result<(), DexError> {
        for m in self.get_all_methods_mut() {
            if m.dex_code().is_some() {
                m.balloon_with(options)?;
            }
        }
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<(), DexError> {
        for m in self.get_all_methods_mut() {
            if m.get_code().is_some() {
                m.sync()?;
            }
        }
        Ok(())
    }
}

impl Drop for DexClass {
    fn drop(&mut self) {
        CLASS_INDEX.remove_if(&self.ty, |_, location| *location == self.location);
    }
}

impl fmt::Display for DexClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)
    }
}

// ---------------------------------------------------------------------------
// Stores and scopes

/// The classes loaded from one logical store, for example one APK's dex files.
#[derive(Debug, Default)]
pub struct DexStore {
    name: String,
    classes: Vec<DexClass>,
}

impl DexStore {
    pub fn new(name: &str) -> DexStore {
        DexStore { name: name.to_string(), classes: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_classes(&mut self, classes: Vec<DexClass>) {
        self.classes.extend(classes);
    }

    pub fn classes(&self) -> &[DexClass] {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut Vec<DexClass> {
        &mut self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// A flat view over the classes of several stores.
pub type Scope<'a> = Vec<&'a DexClass>;

pub fn build_class_scope(stores: &[DexStore]) -> Scope<'_> {
    stores.iter().flat_map(|s| s.classes.iter()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::instruction::DexInstruction;
    use crate::dex::opcodes::DexOpcode;

    fn method_ref(class: &str, name: &str) -> DexMethodRef {
        DexMethodRef::make_from_descriptor(&format!("{}.{}:()V", class, name)).unwrap()
    }

    fn concrete(mref: DexMethodRef, is_virtual: bool) -> DexMethod {
        let mut m = DexMethod::new(mref);
        let code = DexCode {
            registers_size: 1,
            ins_size: 1,
            insns: vec![DexInstruction::new(DexOpcode::ReturnVoid)],
            ..DexCode::default()
        };
        m.make_concrete(DexAccessFlags::PUBLIC, Some(code), is_virtual).unwrap();
        m
    }

    #[test]
    fn methods_stay_sorted_and_unique() {
        let ty = DexType::make("Lmodel/Sorted;");
        let mut cls = DexClass::new(ty, "test").unwrap();
        for name in ["c", "a", "b"] {
            cls.add_method(concrete(method_ref("Lmodel/Sorted;", name), true)).unwrap();
        }
        let names: Vec<&str> = cls.get_vmethods().iter().map(|m| m.name().as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let foreign = concrete(method_ref("Lmodel/Other;", "x"), false);
        assert!(cls.add_method(foreign).is_err());

        let removed = cls.remove_method(method_ref("Lmodel/Sorted;", "b")).unwrap();
        assert_eq!(removed.name().as_str(), "b");
        assert!(cls.remove_method(method_ref("Lmodel/Sorted;", "b")).is_err());
    }

    #[test]
    fn make_concrete_happens_once_per_ref() {
        let mref = method_ref("Lmodel/Once;", "m");
        let first = concrete(mref, false);
        let mut second = DexMethod::new(mref);
        let err = second.make_concrete(DexAccessFlags::PUBLIC, None, false).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DuplicateMethod(_)));
        drop(first);
        second.make_concrete(DexAccessFlags::PUBLIC, None, false).unwrap();
    }

    #[test]
    fn class_index_rejects_second_definition() {
        let ty = DexType::make("Lmodel/Twice;");
        let first = DexClass::new(ty, "a.dex").unwrap();
        assert!(is_defined(ty));
        let err = DexClass::new(ty, "b.dex").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DuplicateClass(_)));
        assert_eq!(class_location(ty).as_deref(), Some("a.dex"));
        drop(first);
        assert!(!is_defined(ty));
    }

    #[test]
    fn balloon_and_sync_swap_bodies() {
        let mut m = concrete(method_ref("Lmodel/Swap;", "run"), true);
        assert!(m.sync().is_err());
        m.balloon().unwrap();
        assert!(m.dex_code().is_none());
        assert!(m.get_code().is_some());
        assert!(m.balloon().is_err());
        m.sync().unwrap();
        let code = m.dex_code().unwrap();
        assert_eq!(code.insns.len(), 1);
        assert_eq!((code.registers_size, code.ins_size), (1, 1));
    }

    #[test]
    fn copies_are_distinct_even_under_the_same_ref() {
        let mref = method_ref("Lmodel/Copy;", "m");
        let mut original = concrete(mref, false);
        original.balloon().unwrap();
        let copy = original.make_method_from(mref.class(), mref.name()).unwrap();
        assert_eq!(copy.get_ref(), mref);
        original.get_code_mut().unwrap().list_mut().push_back(crate::ir::list::MethodItem::Fallthrough);
        assert_ne!(copy.get_code().unwrap().list().len(), original.get_code().unwrap().list().len());
        drop(original);
        drop(copy);
        assert!(!CONCRETE_METHODS.contains_key(&mref));
    }

    #[test]
    fn deobfuscated_names_become_aliases() {
        let ty = DexType::make("Lmodel/a;");
        let mut cls = DexClass::new(ty, "test").unwrap();
        assert!(cls.set_deobfuscated_name("Lmodel/Original;"));
        assert_eq!(DexType::get("Lmodel/Original;"), Some(ty));
        assert_eq!(cls.deobfuscated_name().as_str(), "Lmodel/Original;");

        let other = DexClass::new(DexType::make("Lmodel/b;"), "test");
        let mut other = other.unwrap();
        assert!(!other.set_deobfuscated_name("Lmodel/Original;"));
    }
}
