//! Process-wide interned ref entities.
//!
//! Every ref is a `Copy` handle around a `&'static` content block. Two handles
//! are equal exactly when they point at the same block, and the pool makes sure
//! that equal content always maps to the same block. Content blocks are leaked
//! on creation and live for the rest of the process.
//!
//! The index for each kind is a sharded `DashMap`; `make` takes the shard's
//! write lock through the entry API so concurrent callers with equal content
//! observe a single winner.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use log::warn;
use once_cell::sync::Lazy;
use serde::{Serialize, Serializer};

use crate::dex::error::{DexError, ErrorKind};
use crate::model::descriptors;

macro_rules! interned_identity {
    ($handle:ident, $data:ident) => {
        #[derive(Clone, Copy)]
        pub struct $handle(&'static $data);

        impl PartialEq for $handle {
            fn eq(&self, other: &Self) -> bool {
                std::ptr::eq(self.0, other.0)
            }
        }

        impl Eq for $handle {}

        impl Hash for $handle {
            fn hash<H: Hasher>(&self, state: &mut H) {
                std::ptr::hash(self.0, state)
            }
        }

        impl PartialOrd for $handle {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

pub struct DexStringData {
    text: Box<str>,
    utf16_size: u32,
}

pub struct DexTypeData {
    name: DexString,
}

pub struct DexTypeListData {
    types: Box<[DexType]>,
}

pub struct DexProtoData {
    rtype: DexType,
    args: DexTypeList,
    shorty: DexString,
}

pub struct DexFieldRefData {
    class: DexType,
    name: DexString,
    ty: DexType,
}

pub struct DexMethodRefData {
    class: DexType,
    name: DexString,
    proto: DexProto,
}

interned_identity!(DexString, DexStringData);
interned_identity!(DexType, DexTypeData);
interned_identity!(DexTypeList, DexTypeListData);
interned_identity!(DexProto, DexProtoData);
interned_identity!(DexFieldRef, DexFieldRefData);
interned_identity!(DexMethodRef, DexMethodRefData);

#[derive(Default)]
struct RefPool {
    strings: DashMap<Box<str>, DexString>,
    // Primary descriptors and registered aliases both resolve here.
    types: DashMap<DexString, DexType>,
    aliases: DashMap<DexType, DexString>,
    type_lists: DashMap<Vec<DexType>, DexTypeList>,
    protos: DashMap<(DexType, DexTypeList), DexProto>,
    fields: DashMap<(DexType, DexString, DexType), DexFieldRef>,
    methods: DashMap<(DexType, DexString, DexProto), DexMethodRef>,
}

static POOL: Lazy<RefPool> = Lazy::new(RefPool::default);

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Counts of interned entities, mostly useful for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub strings: usize,
    pub types: usize,
    pub type_lists: usize,
    pub protos: usize,
    pub fields: usize,
    pub methods: usize,
}

pub fn pool_stats() -> PoolStats {
    PoolStats {
        strings: POOL.strings.len(),
        types: POOL.types.len() - POOL.aliases.len(),
        type_lists: POOL.type_lists.len(),
        protos: POOL.protos.len(),
        fields: POOL.fields.len(),
        methods: POOL.methods.len(),
    }
}

// ---------------------------------------------------------------------------
// Strings

impl DexString {
    pub fn make(text: &str) -> DexString {
        if let Some(existing) = Self::get(text) {
            return existing;
        }
        *POOL.strings.entry(Box::from(text)).or_insert_with(|| {
            DexString(leak(DexStringData {
                text: Box::from(text),
                utf16_size: text.encode_utf16().count() as u32,
            }))
        })
    }

    pub fn get(text: &str) -> Option<DexString> {
        POOL.strings.get(text).map(|s| *s)
    }

    /// Interns a string from its on-disk MUTF-8 bytes.
    pub fn make_from_mutf8(bytes: &[u8]) -> DexString {
        match cesu8::from_java_cesu8(bytes) {
            Ok(text) => Self::make(&text),
            Err(_) => {
                warn!("[strings] invalid MUTF-8 sequence, decoding lossily: {:02x?}", bytes);
                Self::make(&String::from_utf8_lossy(bytes))
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        &self.0.text
    }

    /// Length in UTF-16 code units, as stored in `string_data_item`.
    pub fn utf16_size(self) -> u32 {
        self.0.utf16_size
    }

    pub fn to_mutf8(self) -> Vec<u8> {
        cesu8::to_java_cesu8(self.as_str()).into_owned()
    }
}

impl Ord for DexString {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        // UTF-8 byte order is code point order, which is what the format requires.
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Types

impl DexType {
    pub fn make(descriptor: &str) -> DexType {
        Self::make_from(DexString::make(descriptor))
    }

    pub fn make_from(name: DexString) -> DexType {
        if let Some(existing) = POOL.types.get(&name) {
            return *existing;
        }
        *POOL.types.entry(name).or_insert_with(|| DexType(leak(DexTypeData { name })))
    }

    pub fn get(descriptor: &str) -> Option<DexType> {
        DexString::get(descriptor).and_then(|s| POOL.types.get(&s).map(|t| *t))
    }

    /// The primary descriptor, never an alias.
    pub fn name(self) -> DexString {
        self.0.name
    }

    pub fn as_str(self) -> &'static str {
        self.0.name.as_str()
    }

    pub fn alias(self) -> Option<DexString> {
        POOL.aliases.get(&self).map(|a| *a)
    }

    /// Registers `alias` as a second name for this type. A type holds at most
    /// one alias, and an alias may not shadow a name that already resolves to
    /// a different type.
    pub fn set_alias(self, alias: DexString) -> Result<(), DexError> {
        if alias == self.name() {
            return Ok(());
        }
        match POOL.types.entry(alias) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                if *e.get() != self {
                    return Err(DexError::from_kind(ErrorKind::ResolutionFailure(format!(
                        "alias {} of {} already names {}",
                        alias,
                        self,
                        e.get()
                    ))));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(self);
            }
        }
        if let Some(previous) = POOL.aliases.insert(self, alias) {
            if previous != alias {
                POOL.types.remove(&previous);
            }
        }
        Ok(())
    }

    pub fn is_void(self) -> bool {
        self.as_str() == "V"
    }

    pub fn is_primitive(self) -> bool {
        let s = self.as_str();
        s.len() == 1 && s != "V"
    }

    pub fn is_array(self) -> bool {
        self.as_str().starts_with('[')
    }

    pub fn is_class(self) -> bool {
        self.as_str().starts_with('L')
    }

    /// Reference types: classes and arrays.
    pub fn is_object(self) -> bool {
        self.is_class() || self.is_array()
    }

    pub fn is_wide(self) -> bool {
        matches!(self.as_str(), "J" | "D")
    }

    pub fn shorty_char(self) -> char {
        descriptors::shorty_char(self.as_str())
    }

    /// Strips one array dimension.
    pub fn component_type(self) -> Option<DexType> {
        self.as_str().strip_prefix('[').map(DexType::make)
    }

    /// Strips every array dimension.
    pub fn element_type(self) -> DexType {
        let s = self.as_str();
        DexType::make(s.trim_start_matches('['))
    }

    pub fn array_of(self) -> DexType {
        DexType::make(&format!("[{}", self.as_str()))
    }

    /// `Lfoo/bar/Baz;` is in package `Lfoo/bar`. Arrays and primitives have no package.
    pub fn package_name(self) -> &'static str {
        let s = self.as_str();
        if !s.starts_with('L') {
            return "";
        }
        match s.rfind('/') {
            Some(ix) => &s[..ix],
            None => "L",
        }
    }

    pub fn same_package(self, other: DexType) -> bool {
        self.package_name() == other.package_name()
    }
}

impl Ord for DexType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(&other.name())
    }
}

impl fmt::Display for DexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Type lists

impl DexTypeList {
    pub fn make(types: Vec<DexType>) -> DexTypeList {
        if let Some(existing) = Self::get(&types) {
            return existing;
        }
        let boxed: Box<[DexType]> = types.clone().into_boxed_slice();
        *POOL
            .type_lists
            .entry(types)
            .or_insert_with(|| DexTypeList(leak(DexTypeListData { types: boxed })))
    }

    pub fn empty() -> DexTypeList {
        Self::make(Vec::new())
    }

    pub fn get(types: &[DexType]) -> Option<DexTypeList> {
        POOL.type_lists.get(types).map(|l| *l)
    }

    pub fn types(self) -> &'static [DexType] {
        &self.0.types
    }

    pub fn len(self) -> usize {
        self.0.types.len()
    }

    pub fn is_empty(self) -> bool {
        self.0.types.is_empty()
    }

    pub fn iter(self) -> std::slice::Iter<'static, DexType> {
        self.0.types.iter()
    }

    /// Register slots taken by the list when passed as arguments.
    pub fn size_in_words(self) -> usize {
        self.iter().map(|t| if t.is_wide() { 2 } else { 1 }).sum()
    }

    pub fn push_front(self, t: DexType) -> DexTypeList {
        let mut v = Vec::with_capacity(self.len() + 1);
        v.push(t);
        v.extend_from_slice(self.types());
        DexTypeList::make(v)
    }
}

impl Ord for DexTypeList {
    fn cmp(&self, other: &Self) -> Ordering {
        self.types().cmp(other.types())
    }
}

impl fmt::Debug for DexTypeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types()).finish()
    }
}

// ---------------------------------------------------------------------------
// Protos

impl DexProto {
    pub fn make(rtype: DexType, args: DexTypeList) -> DexProto {
        if let Some(existing) = Self::get(rtype, args) {
            return existing;
        }
        *POOL.protos.entry((rtype, args)).or_insert_with(|| {
            let mut shorty = String::with_capacity(args.len() + 1);
            shorty.push(rtype.shorty_char());
            shorty.extend(args.iter().map(|t| t.shorty_char()));
            DexProto(leak(DexProtoData { rtype, args, shorty: DexString::make(&shorty) }))
        })
    }

    pub fn get(rtype: DexType, args: DexTypeList) -> Option<DexProto> {
        POOL.protos.get(&(rtype, args)).map(|p| *p)
    }

    /// Parses `(args)ret` and interns every type along the way.
    pub fn make_from_descriptor(descriptor: &str) -> Result<DexProto, DexError> {
        let (rtype, args) = descriptors::parse_proto(descriptor)?;
        Ok(Self::make(
            DexType::make(rtype),
            DexTypeList::make(args.into_iter().map(DexType::make).collect()),
        ))
    }

    pub fn rtype(self) -> DexType {
        self.0.rtype
    }

    pub fn args(self) -> DexTypeList {
        self.0.args
    }

    pub fn shorty(self) -> DexString {
        self.0.shorty
    }

    pub fn is_void(self) -> bool {
        self.0.rtype.is_void()
    }
}

impl Ord for DexProto {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rtype().cmp(&other.rtype()).then_with(|| self.args().cmp(&other.args()))
    }
}

impl fmt::Display for DexProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for t in self.args().iter() {
            f.write_str(t.as_str())?;
        }
        write!(f, "){}", self.rtype())
    }
}

impl fmt::Debug for DexProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Field refs

impl DexFieldRef {
    pub fn make(class: DexType, name: DexString, ty: DexType) -> DexFieldRef {
        if let Some(existing) = Self::get(class, name, ty) {
            return existing;
        }
        *POOL
            .fields
            .entry((class, name, ty))
            .or_insert_with(|| DexFieldRef(leak(DexFieldRefData { class, name, ty })))
    }

    pub fn get(class: DexType, name: DexString, ty: DexType) -> Option<DexFieldRef> {
        POOL.fields.get(&(class, name, ty)).map(|f| *f)
    }

    /// Parses `Lcls;.name:type`.
    pub fn make_from_descriptor(descriptor: &str) -> Result<DexFieldRef, DexError> {
        let parsed = descriptors::parse_field_descriptor(descriptor)?;
        Ok(Self::make(
            DexType::make(parsed.class),
            DexString::make(parsed.name),
            DexType::make(parsed.ty),
        ))
    }

    pub fn class(self) -> DexType {
        self.0.class
    }

    pub fn name(self) -> DexString {
        self.0.name
    }

    pub fn ty(self) -> DexType {
        self.0.ty
    }
}

impl Ord for DexFieldRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class()
            .cmp(&other.class())
            .then_with(|| self.name().cmp(&other.name()))
            .then_with(|| self.ty().cmp(&other.ty()))
    }
}

impl fmt::Display for DexFieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class(), self.name(), self.ty())
    }
}

impl fmt::Debug for DexFieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Method refs

impl DexMethodRef {
    pub fn make(class: DexType, name: DexString, proto: DexProto) -> DexMethodRef {
        if let Some(existing) = Self::get(class, name, proto) {
            return existing;
        }
        *POOL
            .methods
            .entry((class, name, proto))
            .or_insert_with(|| DexMethodRef(leak(DexMethodRefData { class, name, proto })))
    }

    pub fn get(class: DexType, name: DexString, proto: DexProto) -> Option<DexMethodRef> {
        POOL.methods.get(&(class, name, proto)).map(|m| *m)
    }

    /// Parses `Lcls;.name:(args)ret`.
    pub fn make_from_descriptor(descriptor: &str) -> Result<DexMethodRef, DexError> {
        let parsed = descriptors::parse_method_descriptor(descriptor)?;
        Ok(Self::make(
            DexType::make(parsed.class),
            DexString::make(parsed.name),
            DexProto::make(
                DexType::make(parsed.rtype),
                DexTypeList::make(parsed.args.into_iter().map(DexType::make).collect()),
            ),
        ))
    }

    pub fn class(self) -> DexType {
        self.0.class
    }

    pub fn name(self) -> DexString {
        self.0.name
    }

    pub fn proto(self) -> DexProto {
        self.0.proto
    }

    pub fn is_init(self) -> bool {
        self.name().as_str() == "<init>"
    }

    pub fn is_clinit(self) -> bool {
        self.name().as_str() == "<clinit>"
    }

    /// Same name and proto, ignoring the owner.
    pub fn same_signature(self, other: DexMethodRef) -> bool {
        self.name() == other.name() && self.proto() == other.proto()
    }
}

impl Ord for DexMethodRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class()
            .cmp(&other.class())
            .then_with(|| self.name().cmp(&other.name()))
            .then_with(|| self.proto().cmp(&other.proto()))
    }
}

impl fmt::Display for DexMethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class(), self.name(), self.proto())
    }
}

impl fmt::Debug for DexMethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

macro_rules! serialize_as_display {
    ($($handle:ident),*) => {
        $(
            impl Serialize for $handle {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }
        )*
    };
}

serialize_as_display!(DexString, DexType, DexProto, DexFieldRef, DexMethodRef);

// ---------------------------------------------------------------------------
// Convenience entry points

pub fn make_string(text: &str) -> DexString {
    DexString::make(text)
}

pub fn get_string(text: &str) -> Option<DexString> {
    DexString::get(text)
}

pub fn make_type(descriptor: &str) -> DexType {
    DexType::make(descriptor)
}

pub fn get_type(descriptor: &str) -> Option<DexType> {
    DexType::get(descriptor)
}

/// Frequently used framework types.
pub mod known_types {
    use super::DexType;

    pub fn java_lang_object() -> DexType {
        DexType::make("Ljava/lang/Object;")
    }

    pub fn java_lang_string() -> DexType {
        DexType::make("Ljava/lang/String;")
    }

    pub fn java_lang_class() -> DexType {
        DexType::make("Ljava/lang/Class;")
    }

    pub fn java_lang_throwable() -> DexType {
        DexType::make("Ljava/lang/Throwable;")
    }

    pub fn void() -> DexType {
        DexType::make("V")
    }

    pub fn int() -> DexType {
        DexType::make("I")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_intern_by_content() {
        let a = DexString::make("pool.strings_intern_by_content");
        let b = DexString::make(&String::from("pool.strings_intern_by_content"));
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
        assert_eq!(DexString::get("pool.strings_intern_by_content"), Some(a));
        assert_eq!(DexString::get("pool.never_made"), None);
    }

    #[test]
    fn utf16_size_counts_surrogate_pairs() {
        assert_eq!(DexString::make("abc").utf16_size(), 3);
        assert_eq!(DexString::make("\u{1F600}").utf16_size(), 2);
        let nul = DexString::make("a\0b");
        assert_eq!(nul.to_mutf8(), vec![b'a', 0xc0, 0x80, b'b']);
        assert_eq!(DexString::make_from_mutf8(&[b'a', 0xc0, 0x80, b'b']), nul);
    }

    #[test]
    fn protos_compute_shorty() {
        let p = DexProto::make_from_descriptor("(I[JLjava/lang/String;D)Z").unwrap();
        assert_eq!(p.shorty().as_str(), "ZILLD");
        assert_eq!(p.args().size_in_words(), 5);
        assert_eq!(p.to_string(), "(I[JLjava/lang/String;D)Z");
        assert_eq!(DexProto::make_from_descriptor("(I[JLjava/lang/String;D)Z").unwrap(), p);
    }

    #[test]
    fn method_refs_round_trip_descriptors() {
        let m = DexMethodRef::make_from_descriptor("Lpool/A;.run:(II)V").unwrap();
        assert_eq!(m.to_string(), "Lpool/A;.run:(II)V");
        assert_eq!(m.class().package_name(), "Lpool");
        let f = DexFieldRef::make_from_descriptor("Lpool/A;.count:J").unwrap();
        assert_eq!(f.to_string(), "Lpool/A;.count:J");
        assert!(f.ty().is_wide());
    }

    #[test]
    fn ordering_follows_content() {
        let a = DexType::make("Lpool/order/A;");
        let b = DexType::make("Lpool/order/B;");
        assert!(a < b);
        let short = DexTypeList::make(vec![a]);
        let long = DexTypeList::make(vec![a, b]);
        assert!(short < long);
    }

    #[test]
    fn aliases_resolve_and_reject_collisions() {
        let t = DexType::make("Lpool/alias/a;");
        let other = DexType::make("Lpool/alias/Taken;");
        t.set_alias(DexString::make("Lpool/alias/Readable;")).unwrap();
        assert_eq!(DexType::get("Lpool/alias/Readable;"), Some(t));
        assert_eq!(t.name().as_str(), "Lpool/alias/a;");
        assert!(t.set_alias(other.name()).is_err());
        assert_eq!(t.alias().map(|s| s.as_str()), Some("Lpool/alias/Readable;"));
    }

    #[test]
    fn type_predicates() {
        let arr = DexType::make("[[I");
        assert!(arr.is_array() && arr.is_object());
        assert_eq!(arr.component_type(), Some(DexType::make("[I")));
        assert_eq!(arr.element_type(), DexType::make("I"));
        assert!(DexType::make("I").is_primitive());
        assert!(!DexType::make("V").is_primitive());
        assert_eq!(DexType::make("LTop;").package_name(), "L");
    }
}
