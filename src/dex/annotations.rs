//! Annotations attached to classes, fields, methods and parameters.
//!
//! On disk these are spread over four structures:
//! - annotations_directory_item
//! - annotation_set_ref_list
//! - annotation_set_item
//! - annotation_item (visibility + encoded_annotation)
//!
//! In memory a directory is resolved into per-member [`DexAnnotationSet`]s
//! which the program model attaches to its defs.

use std::collections::BTreeMap;

use crate::dex::encoded_values::EncodedAnnotation;
use crate::dex::error::DexError;
use crate::dex::id_tables::{IndexAssigner, IndexResolver, RefCollector};
use crate::dex::{read_u1, read_u4, write_u1};
use crate::model::pool::{DexFieldRef, DexMethodRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnnotationVisibility {
    Build,
    Runtime,
    System,
}

impl AnnotationVisibility {
    fn from_u8(v: u8) -> Result<AnnotationVisibility, DexError> {
        Ok(match v {
            0 => AnnotationVisibility::Build,
            1 => AnnotationVisibility::Runtime,
            2 => AnnotationVisibility::System,
            _ => fail!("Invalid annotation visibility 0x{:02x}", v),
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            AnnotationVisibility::Build => 0,
            AnnotationVisibility::Runtime => 1,
            AnnotationVisibility::System => 2,
        }
    }
}

/// annotation_item
#[derive(Debug, Clone, PartialEq)]
pub struct DexAnnotation {
    pub visibility: AnnotationVisibility,
    pub annotation: EncodedAnnotation,
}

impl DexAnnotation {
    pub fn read(bytes: &[u8], off: u32, ids: &dyn IndexResolver) -> Result<DexAnnotation, DexError> {
        let mut ix = off as usize;
        let visibility = AnnotationVisibility::from_u8(read_u1(bytes, &mut ix)?)?;
        let annotation = EncodedAnnotation::read(bytes, &mut ix, ids)?;
        Ok(DexAnnotation { visibility, annotation })
    }

    pub fn write(&self, bytes: &mut Vec<u8>, ids: &dyn IndexAssigner) -> Result<usize, DexError> {
        Ok(write_u1(bytes, self.visibility.as_u8()) + self.annotation.write(bytes, ids)?)
    }
}

/// An ordered collection of annotations on a single element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DexAnnotationSet {
    annotations: Vec<DexAnnotation>,
}

impl DexAnnotationSet {
    pub fn new(annotations: Vec<DexAnnotation>) -> Self {
        DexAnnotationSet { annotations }
    }

    /// Reads an annotation_set_item at `off`.
    pub fn read(bytes: &[u8], off: u32, ids: &dyn IndexResolver) -> Result<DexAnnotationSet, DexError> {
        let mut ix = off as usize;
        let size = read_u4(bytes, &mut ix)?;
        let mut annotations = Vec::with_capacity(size.min(0x1000) as usize);
        for i in 0..size {
            let item_off = read_u4(bytes, &mut ix)?;
            let annotation = DexAnnotation::read(bytes, item_off, ids)
                .map_err(|e| err!(e, "annotation #{} of set at 0x{:x}", i, off))?;
            annotations.push(annotation);
        }
        Ok(DexAnnotationSet { annotations })
    }

    pub fn annotations(&self) -> &[DexAnnotation] {
        &self.annotations
    }

    pub fn add(&mut self, annotation: DexAnnotation) {
        self.annotations.push(annotation);
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Annotations in the order the format requires: by type index.
    pub fn sorted(&self) -> Vec<&DexAnnotation> {
        let mut v: Vec<&DexAnnotation> = self.annotations.iter().collect();
        v.sort_by_key(|a| a.annotation.ty);
        v
    }

    /// Merges `other` into this set; annotations of a type already present are dropped.
    pub fn combine_with(&mut self, other: &DexAnnotationSet) {
        for a in &other.annotations {
            if !self.annotations.iter().any(|x| x.annotation.ty == a.annotation.ty) {
                self.annotations.push(a.clone());
            }
        }
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        for a in &self.annotations {
            a.annotation.collect_refs(refs);
        }
    }
}

/// Parameter index to annotation set.
pub type ParamAnnotations = BTreeMap<u16, DexAnnotationSet>;

/// Reads an annotation_set_ref_list; null entries are skipped.
pub fn read_param_annotations(bytes: &[u8], off: u32, ids: &dyn IndexResolver) -> Result<ParamAnnotations, DexError> {
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut params = ParamAnnotations::new();
    for i in 0..size {
        let set_off = read_u4(bytes, &mut ix)?;
        if set_off != 0 {
            params.insert(i as u16, DexAnnotationSet::read(bytes, set_off, ids)?);
        }
    }
    Ok(params)
}

/// A decoded annotations_directory_item.
#[derive(Debug, Default)]
pub struct AnnotationsDirectory {
    pub class_annotations: Option<DexAnnotationSet>,
    pub fields: Vec<(DexFieldRef, DexAnnotationSet)>,
    pub methods: Vec<(DexMethodRef, DexAnnotationSet)>,
    pub parameters: Vec<(DexMethodRef, ParamAnnotations)>,
}

impl AnnotationsDirectory {
    pub fn read(bytes: &[u8], off: u32, ids: &dyn IndexResolver) -> Result<AnnotationsDirectory, DexError> {
        let mut ix = off as usize;
        let class_off = read_u4(bytes, &mut ix)?;
        let fields_size = read_u4(bytes, &mut ix)?;
        let methods_size = read_u4(bytes, &mut ix)?;
        let params_size = read_u4(bytes, &mut ix)?;

        let class_annotations =
            if class_off != 0 { Some(DexAnnotationSet::read(bytes, class_off, ids)?) } else { None };

        let mut fields = Vec::with_capacity(fields_size as usize);
        for _ in 0..fields_size {
            let field = ids.field(read_u4(bytes, &mut ix)?)?;
            let set_off = read_u4(bytes, &mut ix)?;
            fields.push((field, DexAnnotationSet::read(bytes, set_off, ids)?));
        }
        let mut methods = Vec::with_capacity(methods_size as usize);
        for _ in 0..methods_size {
            let method = ids.method(read_u4(bytes, &mut ix)?)?;
            let set_off = read_u4(bytes, &mut ix)?;
            methods.push((method, DexAnnotationSet::read(bytes, set_off, ids)?));
        }
        let mut parameters = Vec::with_capacity(params_size as usize);
        for _ in 0..params_size {
            let method = ids.method(read_u4(bytes, &mut ix)?)?;
            let list_off = read_u4(bytes, &mut ix)?;
            parameters.push((method, read_param_annotations(bytes, list_off, ids)?));
        }
        Ok(AnnotationsDirectory { class_annotations, fields, methods, parameters })
    }

    pub fn is_empty(&self) -> bool {
        self.class_annotations.is_none() && self.fields.is_empty() && self.methods.is_empty() && self.parameters.is_empty()
    }

    /// Total annotation_item references held by the directory.
    pub fn annotation_count(&self) -> usize {
        self.class_annotations.as_ref().map_or(0, |s| s.len())
            + self.fields.iter().map(|(_, s)| s.len()).sum::<usize>()
            + self.methods.iter().map(|(_, s)| s.len()).sum::<usize>()
            + self.parameters.iter().flat_map(|(_, p)| p.values()).map(|s| s.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::encoded_values::{AnnotationElement, EncodedValue};
    use crate::dex::id_tables::tests::FixedIds;
    use crate::dex::write_u4;
    use crate::model::pool::{DexString, DexType};

    fn annotation(ty: &str, value: i32) -> DexAnnotation {
        DexAnnotation {
            visibility: AnnotationVisibility::Runtime,
            annotation: EncodedAnnotation {
                ty: DexType::make(ty),
                elements: vec![AnnotationElement { name: DexString::make("value"), value: EncodedValue::Int(value) }],
            },
        }
    }

    #[test]
    fn set_items_resolve_offsets() {
        let ids = FixedIds::default();
        let a = annotation("Lannotations/A;", 3);
        let b = annotation("Lannotations/B;", 4);

        // [set: size, off_a, off_b][item a][item b]
        let mut bytes = vec![0u8; 12];
        let off_a = bytes.len() as u32;
        a.write(&mut bytes, &ids).unwrap();
        let off_b = bytes.len() as u32;
        b.write(&mut bytes, &ids).unwrap();
        let mut head = Vec::new();
        write_u4(&mut head, 2);
        write_u4(&mut head, off_a);
        write_u4(&mut head, off_b);
        bytes[..12].copy_from_slice(&head);

        let set = DexAnnotationSet::read(&bytes, 0, &ids).unwrap();
        assert_eq!(set.annotations(), &[a, b]);
    }

    #[test]
    fn bad_visibility_is_a_format_error() {
        let ids = FixedIds::default();
        assert!(DexAnnotation::read(&[0x07, 0x00, 0x00], 0, &ids).is_err());
    }

    #[test]
    fn combine_keeps_first_of_each_type() {
        let mut set = DexAnnotationSet::new(vec![annotation("Lannotations/A;", 1)]);
        set.combine_with(&DexAnnotationSet::new(vec![annotation("Lannotations/A;", 2), annotation("Lannotations/C;", 3)]));
        assert_eq!(set.len(), 2);
        assert_eq!(set.annotations()[0], annotation("Lannotations/A;", 1));
    }
}
