//! Reading class definitions out of a DEX file.
//!
//! The file is memory-mapped and its header and ID tables are decoded on the
//! calling thread. Class definitions are then decoded in parallel on the
//! configured worker pool. Errors from individual classes are collected and
//! raised together after every worker has finished.

use std::collections::HashSet;
use std::fs::File;
use std::ops::AddAssign;
use std::path::Path;

use log::{info, trace};
use memmap2::Mmap;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::DexOptions;
use crate::dex::annotations::AnnotationsDirectory;
use crate::dex::code::DexCode;
use crate::dex::encoded_values::read_encoded_array;
use crate::dex::error::DexError;
use crate::dex::header::{DexHeader, DexVersion};
use crate::dex::id_tables::{read_type_list, IdTables, IndexResolver};
use crate::dex::{read_u4, read_uleb128};
use crate::model::access::DexAccessFlags;
use crate::model::class::{DexClass, DexField, DexMethod};

const CLASS_DEF_SIZE: u32 = 0x20;
const PROTO_ID_SIZE: u32 = 0x0c;

/// Counts gathered while loading; add the stats of several files with `+=`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DexStats {
    pub num_classes: usize,
    pub num_methods: usize,
    pub num_fields: usize,
    pub num_strings: usize,
    pub num_types: usize,
    pub num_protos: usize,
    pub num_field_refs: usize,
    pub num_method_refs: usize,
    pub num_instructions: usize,
    pub num_unique_type_lists: usize,
    pub num_unique_encoded_arrays: usize,
    pub num_annotations: usize,
    pub num_debug_items: usize,
    pub num_tries: usize,
}

impl AddAssign for DexStats {
    fn add_assign(&mut self, rhs: DexStats) {
        self.num_classes += rhs.num_classes;
        self.num_methods += rhs.num_methods;
        self.num_fields += rhs.num_fields;
        self.num_strings += rhs.num_strings;
        self.num_types += rhs.num_types;
        self.num_protos += rhs.num_protos;
        self.num_field_refs += rhs.num_field_refs;
        self.num_method_refs += rhs.num_method_refs;
        self.num_instructions += rhs.num_instructions;
        self.num_unique_type_lists += rhs.num_unique_type_lists;
        self.num_unique_encoded_arrays += rhs.num_unique_encoded_arrays;
        self.num_annotations += rhs.num_annotations;
        self.num_debug_items += rhs.num_debug_items;
        self.num_tries += rhs.num_tries;
    }
}

/// What one class_def contributed, folded into [`DexStats`] afterwards.
#[derive(Default)]
struct ClassStats {
    methods: usize,
    fields: usize,
    instructions: usize,
    annotations: usize,
    debug_items: usize,
    tries: usize,
    interfaces_off: u32,
    static_values_off: u32,
}

struct ClassDefItem {
    class_idx: u32,
    access_flags: u32,
    superclass_idx: u32,
    interfaces_off: u32,
    source_file_idx: u32,
    annotations_off: u32,
    class_data_off: u32,
    static_values_off: u32,
}

impl ClassDefItem {
    fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDefItem, DexError> {
        Ok(ClassDefItem {
            class_idx: read_u4(bytes, ix)?,
            access_flags: read_u4(bytes, ix)?,
            superclass_idx: read_u4(bytes, ix)?,
            interfaces_off: read_u4(bytes, ix)?,
            source_file_idx: read_u4(bytes, ix)?,
            annotations_off: read_u4(bytes, ix)?,
            class_data_off: read_u4(bytes, ix)?,
            static_values_off: read_u4(bytes, ix)?,
        })
    }
}

/// Maps `path` and decodes every class it defines.
pub fn load_classes_from_dex(path: &Path, stats: &mut DexStats, options: &DexOptions) -> Result<Vec<DexClass>, DexError> {
    let location = path.display().to_string();
    let file = File::open(path).map_err(|e| io_error(e, &location))?;
    // The mapping is read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| io_error(e, &location))?;
    let classes = load_classes_from_bytes(&mmap, &location, stats, options)?;
    info!(target: "MAIN", "loaded {} classes from {}", classes.len(), location);
    Ok(classes)
}

fn io_error(e: std::io::Error, location: &str) -> DexError {
    let e = DexError::from(e);
    err!(e, "{}", location)
}

/// Decodes a complete DEX image held in memory. `location` names the image
/// in errors and in the class index.
pub fn load_classes_from_bytes(
    bytes: &[u8],
    location: &str,
    stats: &mut DexStats,
    options: &DexOptions,
) -> Result<Vec<DexClass>, DexError> {
    let header = DexHeader::read(bytes, options.support_dex_v37).map_err(|e| err!(e, "{}", location))?;
    let ids = IdTables::read(bytes, &header).map_err(|e| err!(e, "{}", location))?;
    trace!(target: "MAIN", "{}: version {}, {} class defs", location, header.version.number(), header.class_defs.size);

    let pool = options.thread_pool()?;
    let results: Vec<Result<(DexClass, ClassStats), DexError>> = pool.install(|| {
        (0..header.class_defs.size)
            .into_par_iter()
            .map(|i| load_class(bytes, &header, &ids, i, location))
            .collect()
    });

    let mut classes = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    let mut file_stats = DexStats::default();
    let mut type_lists = HashSet::new();
    let mut encoded_arrays = HashSet::new();
    for result in results {
        match result {
            Ok((cls, s)) => {
                file_stats.num_methods += s.methods;
                file_stats.num_fields += s.fields;
                file_stats.num_instructions += s.instructions;
                file_stats.num_annotations += s.annotations;
                file_stats.num_debug_items += s.debug_items;
                file_stats.num_tries += s.tries;
                if s.interfaces_off != 0 {
                    type_lists.insert(s.interfaces_off);
                }
                if s.static_values_off != 0 {
                    encoded_arrays.insert(s.static_values_off);
                }
                classes.push(cls);
            }
            Err(e) => errors.push(err!(e, "{}", location)),
        }
    }
    DexError::aggregate(errors)?;

    let mut ix = header.proto_ids.off as usize;
    for _ in 0..header.proto_ids.size {
        let mut params_ix = ix + 8;
        let params_off = read_u4(bytes, &mut params_ix)?;
        if params_off != 0 {
            type_lists.insert(params_off);
        }
        ix += PROTO_ID_SIZE as usize;
    }

    let (strings, types, protos, fields, methods) = ids.counts();
    file_stats.num_classes = classes.len();
    file_stats.num_strings = strings;
    file_stats.num_types = types;
    file_stats.num_protos = protos;
    file_stats.num_field_refs = fields;
    file_stats.num_method_refs = methods;
    file_stats.num_unique_type_lists = type_lists.len();
    file_stats.num_unique_encoded_arrays = encoded_arrays.len();
    trace!(target: "MAIN", "{}: {:?}", location, file_stats);
    *stats += file_stats;
    Ok(classes)
}

fn load_class(
    bytes: &[u8],
    header: &DexHeader,
    ids: &IdTables,
    index: u32,
    location: &str,
) -> Result<(DexClass, ClassStats), DexError> {
    let mut ix = (header.class_defs.off + index * CLASS_DEF_SIZE) as usize;
    let def = ClassDefItem::read(bytes, &mut ix)?;
    let ty = ids.type_at(def.class_idx)?;
    build_class(bytes, header.version, ids, &def, location).map_err(|e| err!(e, "class {}", ty))
}

fn build_class(
    bytes: &[u8],
    version: DexVersion,
    ids: &IdTables,
    def: &ClassDefItem,
    location: &str,
) -> Result<(DexClass, ClassStats), DexError> {
    let ty = ids.type_at(def.class_idx)?;
    let mut cls = DexClass::new(ty, location)?;
    cls.set_access(DexAccessFlags::from_bits_retain(def.access_flags));
    cls.set_super_class(ids.optional_type(def.superclass_idx)?);
    cls.set_interfaces(read_type_list(bytes, def.interfaces_off, ids.types())?);
    cls.set_source_file(ids.optional_string(def.source_file_idx)?);

    let mut directory = if def.annotations_off != 0 {
        AnnotationsDirectory::read(bytes, def.annotations_off, ids)?
    } else {
        AnnotationsDirectory::default()
    };
    let mut stats = ClassStats {
        annotations: directory.annotation_count(),
        interfaces_off: def.interfaces_off,
        static_values_off: def.static_values_off,
        ..ClassStats::default()
    };
    cls.set_annotations(directory.class_annotations.take());

    let static_values = if def.static_values_off != 0 {
        let mut vix = def.static_values_off as usize;
        read_encoded_array(bytes, &mut vix, ids)?
    } else {
        Vec::new()
    };

    if def.class_data_off == 0 {
        return Ok((cls, stats));
    }
    let mut ix = def.class_data_off as usize;
    let static_fields = read_uleb128(bytes, &mut ix)?;
    let instance_fields = read_uleb128(bytes, &mut ix)?;
    let direct_methods = read_uleb128(bytes, &mut ix)?;
    let virtual_methods = read_uleb128(bytes, &mut ix)?;

    for (count, is_static) in [(static_fields, true), (instance_fields, false)] {
        let mut field_idx = 0u32;
        for i in 0..count {
            field_idx = field_idx.wrapping_add(read_uleb128(bytes, &mut ix)?);
            let access = DexAccessFlags::from_bits_retain(read_uleb128(bytes, &mut ix)?);
            let fref = ids.field(field_idx)?;
            if fref.class() != ty {
                fail!("field {} is listed in the class data of {}", fref, ty);
            }
            let value = if is_static { static_values.get(i as usize).cloned() } else { None };
            let mut field = DexField::new(fref);
            field.make_concrete(access, value)?;
            if let Some(pos) = directory.fields.iter().position(|(f, _)| *f == fref) {
                field.set_annotations(Some(directory.fields.swap_remove(pos).1));
            }
            cls.add_field(field)?;
            stats.fields += 1;
        }
    }

    for (count, is_virtual) in [(direct_methods, false), (virtual_methods, true)] {
        let mut method_idx = 0u32;
        for _ in 0..count {
            method_idx = method_idx.wrapping_add(read_uleb128(bytes, &mut ix)?);
            let access = DexAccessFlags::from_bits_retain(read_uleb128(bytes, &mut ix)?);
            let code_off = read_uleb128(bytes, &mut ix)?;
            let mref = ids.method(method_idx)?;
            if mref.class() != ty {
                fail!("method {} is listed in the class data of {}", mref, ty);
            }
            let code = if code_off != 0 {
                let code = DexCode::read(bytes, code_off, version, ids).map_err(|e| err!(e, "code of {}", mref))?;
                stats.instructions += code.insns.len();
                stats.tries += code.tries.len();
                stats.debug_items += usize::from(code.debug_item.is_some());
                Some(code)
            } else {
                None
            };
            let mut method = DexMethod::new(mref);
            method.make_concrete(access, code, is_virtual)?;
            if let Some(pos) = directory.methods.iter().position(|(m, _)| *m == mref) {
                method.set_annotations(Some(directory.methods.swap_remove(pos).1));
            }
            if let Some(pos) = directory.parameters.iter().position(|(m, _)| *m == mref) {
                *method.param_annotations_mut() = directory.parameters.swap_remove(pos).1;
            }
            cls.add_method(method)?;
            stats.methods += 1;
        }
    }
    Ok((cls, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::ErrorKind;

    #[test]
    fn truncated_images_are_format_errors() {
        let mut stats = DexStats::default();
        let err = load_classes_from_bytes(&[0x64, 0x65, 0x78], "short.dex", &mut stats, &DexOptions::default()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Format(_)));
        assert!(err.to_string().ends_with("short.dex"));
        assert_eq!(stats, DexStats::default());
    }

    #[test]
    fn missing_files_are_io_errors() {
        let mut stats = DexStats::default();
        let err = load_classes_from_dex(Path::new("/nonexistent/classes.dex"), &mut stats, &DexOptions::default())
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }

    #[test]
    fn stats_accumulate() {
        let mut total = DexStats { num_classes: 2, num_tries: 1, ..DexStats::default() };
        total += DexStats { num_classes: 3, num_instructions: 40, ..DexStats::default() };
        assert_eq!((total.num_classes, total.num_tries, total.num_instructions), (5, 1, 40));
    }
}
