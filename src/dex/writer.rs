//! Writing a set of classes as one DEX file.
//!
//! Every method must be in linear form. The writer collects the refs the
//! classes use, sorts them the way the format requires and lays out the
//! data section. Equal type lists, annotations, annotation sets and static
//! value arrays are written once and shared.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, info};

use crate::config::DexOptions;
use crate::dex::annotations::{DexAnnotation, DexAnnotationSet, ParamAnnotations};
use crate::dex::encoded_values::{write_encoded_array, EncodedValue};
use crate::dex::error::DexError;
use crate::dex::header::{finalize_file, DexHeader, DexVersion, Section, ENDIAN_CONSTANT, HEADER_SIZE};
use crate::dex::id_tables::{IndexAssigner, RefCollector};
use crate::dex::{align_buffer, write_u2, write_u4, write_uleb128, write_x, NO_INDEX};
use crate::model::class::{DexClass, DexField, DexMethod};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType, DexTypeList};

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_REF_LIST: u16 = 0x1002;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

/// Every ref reachable from the written classes, expanded into the strings
/// and types it is built from.
#[derive(Default)]
struct RefSet {
    strings: HashSet<DexString>,
    types: HashSet<DexType>,
    protos: HashSet<DexProto>,
    fields: HashSet<DexFieldRef>,
    methods: HashSet<DexMethodRef>,
}

impl RefCollector for RefSet {
    fn string(&mut self, s: DexString) {
        self.strings.insert(s);
    }

    fn type_ref(&mut self, t: DexType) {
        if self.types.insert(t) {
            self.strings.insert(t.name());
        }
    }

    fn proto(&mut self, p: DexProto) {
        if self.protos.insert(p) {
            self.strings.insert(p.shorty());
            self.type_ref(p.rtype());
            for t in p.args().iter() {
                self.type_ref(*t);
            }
        }
    }

    fn field(&mut self, f: DexFieldRef) {
        if self.fields.insert(f) {
            self.type_ref(f.class());
            self.strings.insert(f.name());
            self.type_ref(f.ty());
        }
    }

    fn method(&mut self, m: DexMethodRef) {
        if self.methods.insert(m) {
            self.type_ref(m.class());
            self.strings.insert(m.name());
            self.proto(m.proto());
        }
    }
}

/// Compares strings by UTF-16 code units, the order of the string_ids table.
pub(crate) fn utf16_cmp(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// The final index of every ref, in the order the id tables are written.
struct Indices {
    strings: Vec<DexString>,
    string_map: HashMap<DexString, u32>,
    types: Vec<DexType>,
    type_map: HashMap<DexType, u32>,
    protos: Vec<DexProto>,
    proto_map: HashMap<DexProto, u32>,
    fields: Vec<DexFieldRef>,
    field_map: HashMap<DexFieldRef, u32>,
    methods: Vec<DexMethodRef>,
    method_map: HashMap<DexMethodRef, u32>,
}

fn index_map<T: Copy + Eq + std::hash::Hash>(items: &[T]) -> HashMap<T, u32> {
    items.iter().enumerate().map(|(i, t)| (*t, i as u32)).collect()
}

fn missing(what: &str, item: &dyn std::fmt::Display) -> DexError {
    err!("{} {} was not collected for writing", what, item)
}

impl Indices {
    fn assign(refs: RefSet) -> Result<Indices, DexError> {
        let mut strings: Vec<DexString> = refs.strings.into_iter().collect();
        strings.sort_by(|a, b| utf16_cmp(a.as_str(), b.as_str()));
        let string_map = index_map(&strings);

        let sidx = |s: DexString| string_map.get(&s).copied().ok_or_else(|| missing("string", &s));
        let mut types: Vec<DexType> = refs.types.into_iter().collect();
        let mut keyed = Vec::with_capacity(types.len());
        for t in types.drain(..) {
            keyed.push((sidx(t.name())?, t));
        }
        keyed.sort_by_key(|(k, _)| *k);
        let types: Vec<DexType> = keyed.into_iter().map(|(_, t)| t).collect();
        let type_map = index_map(&types);

        let tidx = |t: DexType| type_map.get(&t).copied().ok_or_else(|| missing("type", &t));
        let mut keyed = Vec::with_capacity(refs.protos.len());
        for p in refs.protos {
            let args = p.args().iter().map(|t| tidx(*t)).collect::<Result<Vec<u32>, DexError>>()?;
            keyed.push(((tidx(p.rtype())?, args), p));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let protos: Vec<DexProto> = keyed.into_iter().map(|(_, p)| p).collect();
        let proto_map = index_map(&protos);

        let mut keyed = Vec::with_capacity(refs.fields.len());
        for f in refs.fields {
            keyed.push(((tidx(f.class())?, sidx(f.name())?, tidx(f.ty())?), f));
        }
        keyed.sort_by_key(|(k, _)| *k);
        let fields: Vec<DexFieldRef> = keyed.into_iter().map(|(_, f)| f).collect();
        let field_map = index_map(&fields);

        let mut keyed = Vec::with_capacity(refs.methods.len());
        for m in refs.methods {
            let proto = proto_map.get(&m.proto()).copied().ok_or_else(|| missing("proto", &m.proto()))?;
            keyed.push(((tidx(m.class())?, sidx(m.name())?, proto), m));
        }
        keyed.sort_by_key(|(k, _)| *k);
        let methods: Vec<DexMethodRef> = keyed.into_iter().map(|(_, m)| m).collect();
        let method_map = index_map(&methods);

        for (what, count) in [
            ("type", types.len()),
            ("proto", protos.len()),
            ("field ref", fields.len()),
            ("method ref", methods.len()),
        ] {
            if count > u16::MAX as usize + 1 {
                fail!("{} {}s do not fit in one dex file", count, what);
            }
        }

        Ok(Indices {
            strings,
            string_map,
            types,
            type_map,
            protos,
            proto_map,
            fields,
            field_map,
            methods,
            method_map,
        })
    }
}

impl IndexAssigner for Indices {
    fn string_idx(&self, s: DexString) -> Result<u32, DexError> {
        self.string_map.get(&s).copied().ok_or_else(|| missing("string", &s))
    }

    fn type_idx(&self, t: DexType) -> Result<u32, DexError> {
        self.type_map.get(&t).copied().ok_or_else(|| missing("type", &t))
    }

    fn proto_idx(&self, p: DexProto) -> Result<u32, DexError> {
        self.proto_map.get(&p).copied().ok_or_else(|| missing("proto", &p))
    }

    fn field_idx(&self, f: DexFieldRef) -> Result<u32, DexError> {
        self.field_map.get(&f).copied().ok_or_else(|| missing("field", &f))
    }

    fn method_idx(&self, m: DexMethodRef) -> Result<u32, DexError> {
        self.method_map.get(&m).copied().ok_or_else(|| missing("method", &m))
    }
}

/// Offsets of the shared annotation structures already written.
#[derive(Default)]
struct AnnotationOffsets {
    items: HashMap<Vec<u8>, u32>,
    sets: HashMap<Vec<u32>, u32>,
    ref_lists: HashMap<Vec<u32>, u32>,
}

impl AnnotationOffsets {
    fn encode_item(annotation: &DexAnnotation, ids: &Indices) -> Result<Vec<u8>, DexError> {
        let mut bytes = Vec::new();
        annotation.write(&mut bytes, ids)?;
        Ok(bytes)
    }

    fn set_key(&self, set: &DexAnnotationSet, ids: &Indices) -> Result<Vec<u32>, DexError> {
        let mut sorted = Vec::with_capacity(set.len());
        for a in set.annotations() {
            sorted.push((ids.type_idx(a.annotation.ty)?, a));
        }
        sorted.sort_by_key(|(t, _)| *t);
        let mut key = Vec::with_capacity(sorted.len());
        for (_, a) in sorted {
            let bytes = Self::encode_item(a, ids)?;
            match self.items.get(&bytes) {
                Some(off) => key.push(*off),
                None => fail!("annotation {} was not laid out", a.annotation.ty),
            }
        }
        Ok(key)
    }

    /// The offset of an annotation_set_item, or 0 for an absent or empty set.
    fn set_off(&self, set: Option<&DexAnnotationSet>, ids: &Indices) -> Result<u32, DexError> {
        match set {
            Some(set) if !set.is_empty() => {
                let key = self.set_key(set, ids)?;
                self.sets.get(&key).copied().ok_or_else(|| err!("annotation set was not laid out"))
            }
            _ => Ok(0),
        }
    }

    fn ref_list_key(&self, params: &ParamAnnotations, ids: &Indices) -> Result<Vec<u32>, DexError> {
        let len = params.keys().next_back().map_or(0, |last| *last as usize + 1);
        let mut key = Vec::with_capacity(len);
        for i in 0..len {
            key.push(self.set_off(params.get(&(i as u16)), ids)?);
        }
        Ok(key)
    }
}

struct MapItem {
    type_code: u16,
    size: u32,
    off: u32,
}

/// Builds the bytes of one DEX file from a set of classes.
pub struct DexWriter<'a> {
    classes: Vec<&'a DexClass>,
    version: DexVersion,
}

impl<'a> DexWriter<'a> {
    /// External classes in `classes` are skipped.
    pub fn new(classes: &[&'a DexClass], options: &DexOptions) -> DexWriter<'a> {
        let version = if options.support_dex_v37 { DexVersion::V037 } else { DexVersion::V035 };
        DexWriter { classes: classes.iter().copied().filter(|c| !c.is_external()).collect(), version }
    }

    fn collect_refs(&self) -> Result<RefSet, DexError> {
        let mut refs = RefSet::default();
        for cls in &self.classes {
            refs.type_ref(cls.get_type());
            if let Some(s) = cls.super_class() {
                refs.type_ref(s);
            }
            for t in cls.interfaces().iter() {
                refs.type_ref(*t);
            }
            if let Some(f) = cls.source_file() {
                refs.string(f);
            }
            if let Some(a) = cls.annotations() {
                a.collect_refs(&mut refs);
            }
            for f in cls.get_all_fields() {
                refs.field(f.get_ref());
                if let Some(a) = f.annotations() {
                    a.collect_refs(&mut refs);
                }
                if let Some(v) = f.static_value() {
                    v.collect_refs(&mut refs);
                }
            }
            for m in cls.get_all_methods() {
                if m.get_code().is_some() {
                    fail!(("method {} must be synced before writing", m), ("class {}", cls));
                }
                refs.method(m.get_ref());
                if let Some(a) = m.annotations() {
                    a.collect_refs(&mut refs);
                }
                for set in m.param_annotations().values() {
                    set.collect_refs(&mut refs);
                }
                if let Some(code) = m.dex_code() {
                    code.collect_refs(&mut refs);
                }
            }
        }
        Ok(refs)
    }

    /// Classes in type order, except that every superclass and interface
    /// defined here comes before its subtypes.
    fn class_order(&self, ids: &Indices) -> Vec<&'a DexClass> {
        let mut sorted = self.classes.clone();
        sorted.sort_by_key(|c| ids.type_map.get(&c.get_type()).copied().unwrap_or(u32::MAX));
        let by_type: HashMap<DexType, &'a DexClass> = sorted.iter().map(|c| (c.get_type(), *c)).collect();

        fn visit<'a>(
            cls: &'a DexClass,
            by_type: &HashMap<DexType, &'a DexClass>,
            visited: &mut HashSet<DexType>,
            out: &mut Vec<&'a DexClass>,
        ) {
            if !visited.insert(cls.get_type()) {
                return;
            }
            for parent in cls.super_class().into_iter().chain(cls.interfaces().iter().copied()) {
                if let Some(p) = by_type.get(&parent) {
                    visit(p, by_type, visited, out);
                }
            }
            out.push(cls);
        }

        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(sorted.len());
        for cls in &sorted {
            visit(cls, &by_type, &mut visited, &mut out);
        }
        out
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DexError> {
        let ids = Indices::assign(self.collect_refs()?)?;
        let classes = self.class_order(&ids);

        let count = |n: usize| n as u32;
        let string_ids = Section { size: count(ids.strings.len()), off: HEADER_SIZE };
        let type_ids = Section { size: count(ids.types.len()), off: string_ids.off + 4 * string_ids.size };
        let proto_ids = Section { size: count(ids.protos.len()), off: type_ids.off + 4 * type_ids.size };
        let field_ids = Section { size: count(ids.fields.len()), off: proto_ids.off + 12 * proto_ids.size };
        let method_ids = Section { size: count(ids.methods.len()), off: field_ids.off + 8 * field_ids.size };
        let class_defs = Section { size: count(classes.len()), off: method_ids.off + 8 * method_ids.size };
        let data_off = class_defs.off + 32 * class_defs.size;

        let mut out = vec![0u8; data_off as usize];
        let mut map = vec![MapItem { type_code: TYPE_HEADER_ITEM, size: 1, off: 0 }];
        for (type_code, s) in [
            (TYPE_STRING_ID_ITEM, string_ids),
            (TYPE_TYPE_ID_ITEM, type_ids),
            (TYPE_PROTO_ID_ITEM, proto_ids),
            (TYPE_FIELD_ID_ITEM, field_ids),
            (TYPE_METHOD_ID_ITEM, method_ids),
            (TYPE_CLASS_DEF_ITEM, class_defs),
        ] {
            if s.size > 0 {
                map.push(MapItem { type_code, size: s.size, off: s.off });
            }
        }
        let section = |map: &mut Vec<MapItem>, type_code: u16, size: usize, off: usize| {
            if size > 0 {
                map.push(MapItem { type_code, size: size as u32, off: off as u32 });
            }
        };

        // string_data_item
        let start = out.len();
        let mut string_offs = Vec::with_capacity(ids.strings.len());
        for s in &ids.strings {
            string_offs.push(out.len() as u32);
            write_uleb128(&mut out, s.utf16_size());
            write_x(&mut out, &s.to_mutf8());
            out.push(0);
        }
        section(&mut map, TYPE_STRING_DATA_ITEM, string_offs.len(), start);

        // type_list
        align_buffer(&mut out, 4);
        let start = out.len();
        let mut type_lists: HashMap<DexTypeList, u32> = HashMap::new();
        let lists = ids.protos.iter().map(|p| p.args()).chain(classes.iter().map(|c| c.interfaces()));
        for list in lists {
            if list.is_empty() || type_lists.contains_key(&list) {
                continue;
            }
            align_buffer(&mut out, 4);
            type_lists.insert(list, out.len() as u32);
            write_u4(&mut out, list.len() as u32);
            for t in list.iter() {
                write_u2(&mut out, ids.type_idx(*t)? as u16);
            }
        }
        section(&mut map, TYPE_TYPE_LIST, type_lists.len(), start);
        let list_off = |list: DexTypeList| if list.is_empty() { 0 } else { type_lists.get(&list).copied().unwrap_or(0) };

        let mut annotations = AnnotationOffsets::default();
        let mut all_sets: Vec<&DexAnnotationSet> = Vec::new();
        let mut all_param_lists: Vec<&ParamAnnotations> = Vec::new();
        for cls in &classes {
            all_sets.extend(cls.annotations());
            all_sets.extend(cls.get_all_fields().filter_map(|f| f.annotations()));
            for m in cls.get_all_methods() {
                all_sets.extend(m.annotations());
                all_sets.extend(m.param_annotations().values());
                if !m.param_annotations().is_empty() {
                    all_param_lists.push(m.param_annotations());
                }
            }
        }

        // annotation_item
        let start = out.len();
        for set in &all_sets {
            for a in set.annotations() {
                let bytes = AnnotationOffsets::encode_item(a, &ids)?;
                if !annotations.items.contains_key(&bytes) {
                    annotations.items.insert(bytes.clone(), out.len() as u32);
                    write_x(&mut out, &bytes);
                }
            }
        }
        section(&mut map, TYPE_ANNOTATION_ITEM, annotations.items.len(), start);

        // annotation_set_item
        align_buffer(&mut out, 4);
        let start = out.len();
        for set in &all_sets {
            if set.is_empty() {
                continue;
            }
            let key = annotations.set_key(set, &ids)?;
            if !annotations.sets.contains_key(&key) {
                annotations.sets.insert(key.clone(), out.len() as u32);
                write_u4(&mut out, key.len() as u32);
                for off in &key {
                    write_u4(&mut out, *off);
                }
            }
        }
        section(&mut map, TYPE_ANNOTATION_SET_ITEM, annotations.sets.len(), start);

        // annotation_set_ref_list
        let start = out.len();
        for params in &all_param_lists {
            let key = annotations.ref_list_key(params, &ids)?;
            if !annotations.ref_lists.contains_key(&key) {
                annotations.ref_lists.insert(key.clone(), out.len() as u32);
                write_u4(&mut out, key.len() as u32);
                for off in &key {
                    write_u4(&mut out, *off);
                }
            }
        }
        section(&mut map, TYPE_ANNOTATION_SET_REF_LIST, annotations.ref_lists.len(), start);

        // annotations_directory_item
        let start = out.len();
        let mut directory_offs: HashMap<DexType, u32> = HashMap::new();
        for cls in &classes {
            if let Some(off) = write_directory(&mut out, cls, &annotations, &ids)? {
                directory_offs.insert(cls.get_type(), off);
            }
        }
        section(&mut map, TYPE_ANNOTATIONS_DIRECTORY_ITEM, directory_offs.len(), start);

        // debug_info_item
        let start = out.len();
        let mut debug_offs: HashMap<DexMethodRef, u32> = HashMap::new();
        for m in classes.iter().copied().flat_map(|c| c.get_all_methods()) {
            if let Some(debug) = m.dex_code().and_then(|c| c.debug_item.as_ref()) {
                debug_offs.insert(m.get_ref(), out.len() as u32);
                debug.write(&mut out, &ids).map_err(|e| err!(e, "debug info of {}", m))?;
            }
        }
        section(&mut map, TYPE_DEBUG_INFO_ITEM, debug_offs.len(), start);

        // code_item
        align_buffer(&mut out, 4);
        let start = out.len();
        let mut code_offs: HashMap<DexMethodRef, u32> = HashMap::new();
        for m in classes.iter().copied().flat_map(|c| c.get_all_methods()) {
            if let Some(code) = m.dex_code() {
                align_buffer(&mut out, 4);
                code_offs.insert(m.get_ref(), out.len() as u32);
                let debug_off = debug_offs.get(&m.get_ref()).copied().unwrap_or(0);
                code.write(&mut out, &ids, debug_off).map_err(|e| err!(e, "code of {}", m))?;
            }
        }
        section(&mut map, TYPE_CODE_ITEM, code_offs.len(), start);

        // class_data_item
        let start = out.len();
        let mut class_data_offs: HashMap<DexType, u32> = HashMap::new();
        for cls in &classes {
            if cls.get_all_fields().next().is_none() && cls.get_all_methods().next().is_none() {
                continue;
            }
            class_data_offs.insert(cls.get_type(), out.len() as u32);
            write_class_data(&mut out, cls, &ids, &code_offs)?;
        }
        section(&mut map, TYPE_CLASS_DATA_ITEM, class_data_offs.len(), start);

        // encoded_array_item
        let start = out.len();
        let mut arrays: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut static_value_offs: HashMap<DexType, u32> = HashMap::new();
        for cls in &classes {
            let Some(bytes) = static_values(cls, &ids)? else {
                continue;
            };
            let off = match arrays.get(&bytes) {
                Some(off) => *off,
                None => {
                    let off = out.len() as u32;
                    write_x(&mut out, &bytes);
                    arrays.insert(bytes, off);
                    off
                }
            };
            static_value_offs.insert(cls.get_type(), off);
        }
        section(&mut map, TYPE_ENCODED_ARRAY_ITEM, arrays.len(), start);

        // map_list
        align_buffer(&mut out, 4);
        let map_off = out.len() as u32;
        map.push(MapItem { type_code: TYPE_MAP_LIST, size: 1, off: map_off });
        map.sort_by_key(|item| item.off);
        write_u4(&mut out, map.len() as u32);
        for item in &map {
            write_u2(&mut out, item.type_code);
            write_u2(&mut out, 0);
            write_u4(&mut out, item.size);
            write_u4(&mut out, item.off);
        }

        let mut id_bytes = Vec::with_capacity((data_off - HEADER_SIZE) as usize);
        for off in &string_offs {
            write_u4(&mut id_bytes, *off);
        }
        for t in &ids.types {
            write_u4(&mut id_bytes, ids.string_idx(t.name())?);
        }
        for p in &ids.protos {
            write_u4(&mut id_bytes, ids.string_idx(p.shorty())?);
            write_u4(&mut id_bytes, ids.type_idx(p.rtype())?);
            write_u4(&mut id_bytes, list_off(p.args()));
        }
        for f in &ids.fields {
            write_u2(&mut id_bytes, ids.type_idx(f.class())? as u16);
            write_u2(&mut id_bytes, ids.type_idx(f.ty())? as u16);
            write_u4(&mut id_bytes, ids.string_idx(f.name())?);
        }
        for m in &ids.methods {
            write_u2(&mut id_bytes, ids.type_idx(m.class())? as u16);
            write_u2(&mut id_bytes, ids.proto_idx(m.proto())? as u16);
            write_u4(&mut id_bytes, ids.string_idx(m.name())?);
        }
        for cls in &classes {
            let ty = cls.get_type();
            write_u4(&mut id_bytes, ids.type_idx(ty)?);
            write_u4(&mut id_bytes, cls.access().bits());
            write_u4(&mut id_bytes, cls.super_class().map_or(Ok(NO_INDEX), |s| ids.type_idx(s))?);
            write_u4(&mut id_bytes, list_off(cls.interfaces()));
            write_u4(&mut id_bytes, cls.source_file().map_or(Ok(NO_INDEX), |s| ids.string_idx(s))?);
            write_u4(&mut id_bytes, directory_offs.get(&ty).copied().unwrap_or(0));
            write_u4(&mut id_bytes, class_data_offs.get(&ty).copied().unwrap_or(0));
            write_u4(&mut id_bytes, static_value_offs.get(&ty).copied().unwrap_or(0));
        }
        out[HEADER_SIZE as usize..data_off as usize].copy_from_slice(&id_bytes);

        let empty = |s: Section| if s.size == 0 { Section::default() } else { s };
        let header = DexHeader {
            version: self.version,
            checksum: 0,
            signature: [0; 20],
            file_size: out.len() as u32,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link: Section::default(),
            map_off,
            string_ids: empty(string_ids),
            type_ids: empty(type_ids),
            proto_ids: empty(proto_ids),
            field_ids: empty(field_ids),
            method_ids: empty(method_ids),
            class_defs: empty(class_defs),
            data: Section { size: out.len() as u32 - data_off, off: data_off },
        };
        finalize_file(&mut out, &header);
        debug!(
            target: "MAIN",
            "laid out {} classes: {} strings, {} types, {} protos, {} fields, {} methods",
            classes.len(),
            ids.strings.len(),
            ids.types.len(),
            ids.protos.len(),
            ids.fields.len(),
            ids.methods.len()
        );
        Ok(out)
    }
}

fn write_directory(
    out: &mut Vec<u8>,
    cls: &DexClass,
    annotations: &AnnotationOffsets,
    ids: &Indices,
) -> Result<Option<u32>, DexError> {
    let class_off = annotations.set_off(cls.annotations(), ids)?;
    let mut fields = Vec::new();
    for f in cls.get_all_fields() {
        let off = annotations.set_off(f.annotations(), ids)?;
        if off != 0 {
            fields.push((ids.field_idx(f.get_ref())?, off));
        }
    }
    let mut methods = Vec::new();
    let mut params = Vec::new();
    for m in cls.get_all_methods() {
        let idx = ids.method_idx(m.get_ref())?;
        let off = annotations.set_off(m.annotations(), ids)?;
        if off != 0 {
            methods.push((idx, off));
        }
        if !m.param_annotations().is_empty() {
            let key = annotations.ref_list_key(m.param_annotations(), ids)?;
            if let Some(off) = annotations.ref_lists.get(&key) {
                params.push((idx, *off));
            }
        }
    }
    if class_off == 0 && fields.is_empty() && methods.is_empty() && params.is_empty() {
        return Ok(None);
    }
    fields.sort_unstable();
    methods.sort_unstable();
    params.sort_unstable();

    align_buffer(out, 4);
    let off = out.len() as u32;
    write_u4(out, class_off);
    write_u4(out, fields.len() as u32);
    write_u4(out, methods.len() as u32);
    write_u4(out, params.len() as u32);
    for (idx, off) in fields.iter().chain(&methods).chain(&params) {
        write_u4(out, *idx);
        write_u4(out, *off);
    }
    Ok(Some(off))
}

fn write_class_data(
    out: &mut Vec<u8>,
    cls: &DexClass,
    ids: &Indices,
    code_offs: &HashMap<DexMethodRef, u32>,
) -> Result<(), DexError> {
    let field_list = |fields: &[DexField]| -> Result<Vec<(u32, u32)>, DexError> {
        let mut v = fields
            .iter()
            .map(|f| Ok((ids.field_idx(f.get_ref())?, f.access().bits())))
            .collect::<Result<Vec<_>, DexError>>()?;
        v.sort_unstable();
        Ok(v)
    };
    let method_list = |methods: &[DexMethod]| -> Result<Vec<(u32, u32, u32)>, DexError> {
        let mut v = methods
            .iter()
            .map(|m| {
                let code_off = code_offs.get(&m.get_ref()).copied().unwrap_or(0);
                Ok((ids.method_idx(m.get_ref())?, m.access().bits(), code_off))
            })
            .collect::<Result<Vec<_>, DexError>>()?;
        v.sort_unstable();
        Ok(v)
    };
    let sfields = field_list(cls.get_sfields())?;
    let ifields = field_list(cls.get_ifields())?;
    let dmethods = method_list(cls.get_dmethods())?;
    let vmethods = method_list(cls.get_vmethods())?;

    write_uleb128(out, sfields.len() as u32);
    write_uleb128(out, ifields.len() as u32);
    write_uleb128(out, dmethods.len() as u32);
    write_uleb128(out, vmethods.len() as u32);
    for list in [&sfields, &ifields] {
        let mut prev = 0;
        for (idx, access) in list.iter() {
            write_uleb128(out, idx - prev);
            write_uleb128(out, *access);
            prev = *idx;
        }
    }
    for list in [&dmethods, &vmethods] {
        let mut prev = 0;
        for (idx, access, code_off) in list.iter() {
            write_uleb128(out, idx - prev);
            write_uleb128(out, *access);
            write_uleb128(out, *code_off);
            prev = *idx;
        }
    }
    Ok(())
}

/// The encoded static values of `cls` in field index order, with trailing
/// defaults dropped. `None` when nothing remains.
fn static_values(cls: &DexClass, ids: &Indices) -> Result<Option<Vec<u8>>, DexError> {
    let mut sfields = Vec::with_capacity(cls.get_sfields().len());
    for f in cls.get_sfields() {
        sfields.push((ids.field_idx(f.get_ref())?, f));
    }
    sfields.sort_by_key(|(idx, _)| *idx);
    let mut values: Vec<EncodedValue> = sfields
        .iter()
        .map(|(_, f)| f.static_value().cloned().unwrap_or_else(|| EncodedValue::zero_for_type(f.ty())))
        .collect();
    while values.last().is_some_and(|v| v.is_zero_default()) {
        values.pop();
    }
    if values.is_empty() {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    write_encoded_array(&values, &mut bytes, ids)?;
    Ok(Some(bytes))
}

/// Writes `classes` to `path` as a single DEX file and returns its size.
pub fn write_classes_to_dex(path: &Path, classes: &[&DexClass], options: &DexOptions) -> Result<usize, DexError> {
    let bytes = DexWriter::new(classes, options).to_bytes()?;
    std::fs::write(path, &bytes).map_err(|e| {
        let e = DexError::from(e);
        err!(e, "{}", path.display())
    })?;
    info!(target: "MAIN", "wrote {} classes ({} bytes) to {}", classes.len(), bytes.len(), path.display());
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::code::DexCode;
    use crate::dex::header::compute_checksum;
    use crate::dex::instruction::{DexInstruction, DexRef};
    use crate::dex::loader::{load_classes_from_bytes, DexStats};
    use crate::dex::opcodes::DexOpcode;
    use crate::model::access::DexAccessFlags;

    #[test]
    fn strings_sort_by_utf16_units() {
        // U+10000 is a surrogate pair starting 0xd800, below U+FFFF.
        assert_eq!(utf16_cmp("\u{10000}", "\u{ffff}"), Ordering::Less);
        assert_eq!("\u{10000}".cmp("\u{ffff}"), Ordering::Greater);
        assert_eq!(utf16_cmp("a", "ab"), Ordering::Less);
    }

    fn method(desc: &str, access: DexAccessFlags, code: Option<DexCode>, is_virtual: bool) -> DexMethod {
        let mut m = DexMethod::new(DexMethodRef::make_from_descriptor(desc).unwrap());
        m.make_concrete(access, code, is_virtual).unwrap();
        m
    }

    fn hello_code() -> DexCode {
        DexCode {
            registers_size: 1,
            insns: vec![
                DexInstruction::new(DexOpcode::ConstString)
                    .with_regs(&[0])
                    .with_ref(DexRef::String(DexString::make("hello"))),
                DexInstruction::new(DexOpcode::ReturnObject).with_regs(&[0]),
            ],
            ..DexCode::default()
        }
    }

    #[test]
    fn written_files_load_back() {
        let bytes = {
            let mut base = DexClass::new(DexType::make("Lwriter/Base;"), "writer-test").unwrap();
            base.set_super_class(Some(DexType::make("Ljava/lang/Object;")));
            base.set_access(DexAccessFlags::PUBLIC | DexAccessFlags::ABSTRACT);
            base.add_method(method("Lwriter/Base;.run:()V", DexAccessFlags::PUBLIC | DexAccessFlags::ABSTRACT, None, true))
                .unwrap();

            let mut child = DexClass::new(DexType::make("Lwriter/Child;"), "writer-test").unwrap();
            child.set_super_class(Some(DexType::make("Lwriter/Base;")));
            child.set_source_file(Some(DexString::make("Child.java")));
            let code = hello_code();
            child
                .add_method(method("Lwriter/Child;.hello:()Ljava/lang/String;", DexAccessFlags::STATIC, Some(code), false))
                .unwrap();
            let mut field = DexField::new(DexFieldRef::make_from_descriptor("Lwriter/Child;.count:I").unwrap());
            field.make_concrete(DexAccessFlags::STATIC, Some(EncodedValue::Int(7))).unwrap();
            child.add_field(field).unwrap();

            // Subtype first on input; the writer must reorder.
            DexWriter::new(&[&child, &base], &DexOptions::default()).to_bytes().unwrap()
        };
        assert_eq!(&bytes[..8], b"dex\n035\0");
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), compute_checksum(&bytes));

        let mut stats = DexStats::default();
        let classes = load_classes_from_bytes(&bytes, "written.dex", &mut stats, &DexOptions::default()).unwrap();
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].get_type(), DexType::make("Lwriter/Base;"));
        let child = &classes[1];
        assert_eq!(child.source_file(), Some(DexString::make("Child.java")));
        let hello = &child.get_dmethods()[0];
        assert_eq!(hello.dex_code().unwrap().insns.len(), 2);
        assert_eq!(child.get_sfields()[0].static_value(), Some(&EncodedValue::Int(7)));
        assert_eq!(stats.num_methods, 2);
        assert_eq!(stats.num_instructions, 2);
        assert!(classes[0].get_vmethods()[0].is_abstract());
    }

    #[test]
    fn unsynced_methods_are_rejected() {
        let mut cls = DexClass::new(DexType::make("Lwriter/Unsynced;"), "writer-test").unwrap();
        cls.add_method(method("Lwriter/Unsynced;.f:()Ljava/lang/String;", DexAccessFlags::STATIC, Some(hello_code()), false))
            .unwrap();
        cls.balloon_all(&DexOptions::default()).unwrap();
        let err = DexWriter::new(&[&cls], &DexOptions::default()).to_bytes().unwrap_err();
        assert!(err.to_string().contains("must be synced"));
        cls.sync_all().unwrap();
        assert!(DexWriter::new(&[&cls], &DexOptions::default()).to_bytes().is_ok());
    }
}
