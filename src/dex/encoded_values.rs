//! `encoded_value`, `encoded_array` and `encoded_annotation`.
//!
//! Values hold pool refs rather than raw indices, so they stay valid across
//! files. Decoding goes through an [`IndexResolver`] and encoding through an
//! [`IndexAssigner`].

use crate::dex::error::DexError;
use crate::dex::id_tables::{IndexAssigner, IndexResolver, RefCollector};
use crate::dex::{read_u1, read_uleb128, read_x, write_u1, write_uleb128, write_x};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

#[derive(Debug, PartialEq, Clone)]
pub struct AnnotationElement {
    pub name: DexString,
    pub value: EncodedValue,
}

#[derive(Debug, PartialEq, Clone)]
pub struct EncodedAnnotation {
    pub ty: DexType,
    pub elements: Vec<AnnotationElement>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(DexProto),
    String(DexString),
    Type(DexType),
    Field(DexFieldRef),
    Method(DexMethodRef),
    Enum(DexFieldRef),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

/// Little-endian bytes of a sign-extended integer with redundant high bytes dropped.
fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let mut len = 8;
    while len > 1 {
        let top = bytes[len - 1];
        let next_sign = bytes[len - 2] & 0x80;
        if (top == 0x00 && next_sign == 0) || (top == 0xff && next_sign != 0) {
            len -= 1;
        } else {
            break;
        }
    }
    bytes[..len].to_vec()
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let mut len = 8;
    while len > 1 && bytes[len - 1] == 0 {
        len -= 1;
    }
    bytes[..len].to_vec()
}

/// Floating point values keep their high-order bytes; low zero bytes are dropped.
fn float_bytes(bits: u64, width: usize) -> Vec<u8> {
    let bytes = bits.to_le_bytes();
    let mut start = 0;
    while start < width - 1 && bytes[start] == 0 {
        start += 1;
    }
    bytes[start..width].to_vec()
}

fn read_signed(bytes: &[u8], ix: &mut usize, size: usize) -> Result<i64, DexError> {
    let raw = read_x(bytes, ix, size)?;
    let mut value: i64 = 0;
    for (i, b) in raw.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }
    let shift = 64 - 8 * size as u32;
    Ok((value << shift) >> shift)
}

fn read_unsigned(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u64, DexError> {
    let raw = read_x(bytes, ix, size)?;
    Ok(raw.iter().enumerate().fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i))))
}

fn read_float_bits(bytes: &[u8], ix: &mut usize, size: usize, width: usize) -> Result<u64, DexError> {
    let raw = read_x(bytes, ix, size)?;
    let mut buf = [0u8; 8];
    buf[width - size..width].copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn check_size(value_type: u8, size: usize, max: usize) -> Result<(), DexError> {
    if size > max {
        fail!("encoded value type 0x{:02x} has invalid size {}", value_type, size);
    }
    Ok(())
}

impl EncodedValue {
    pub fn read(bytes: &[u8], ix: &mut usize, ids: &dyn IndexResolver) -> Result<EncodedValue, DexError> {
        let header_byte = read_u1(bytes, ix)?;
        let value_arg = header_byte >> 5;
        let value_type = header_byte & 0x1f;
        let size = (value_arg + 1) as usize;

        Ok(match value_type {
            VALUE_BYTE => {
                check_size(value_type, size, 1)?;
                EncodedValue::Byte(read_signed(bytes, ix, size)? as i8)
            }
            VALUE_SHORT => {
                check_size(value_type, size, 2)?;
                EncodedValue::Short(read_signed(bytes, ix, size)? as i16)
            }
            VALUE_CHAR => {
                check_size(value_type, size, 2)?;
                EncodedValue::Char(read_unsigned(bytes, ix, size)? as u16)
            }
            VALUE_INT => {
                check_size(value_type, size, 4)?;
                EncodedValue::Int(read_signed(bytes, ix, size)? as i32)
            }
            VALUE_LONG => EncodedValue::Long(read_signed(bytes, ix, size)?),
            VALUE_FLOAT => {
                check_size(value_type, size, 4)?;
                EncodedValue::Float(f32::from_bits(read_float_bits(bytes, ix, size, 4)? as u32))
            }
            VALUE_DOUBLE => EncodedValue::Double(f64::from_bits(read_float_bits(bytes, ix, size, 8)?)),
            VALUE_METHOD_TYPE => {
                check_size(value_type, size, 4)?;
                EncodedValue::MethodType(ids.proto(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_METHOD_HANDLE => fail!("method handle values require DEX 039 or later"),
            VALUE_STRING => {
                check_size(value_type, size, 4)?;
                EncodedValue::String(ids.string(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_TYPE => {
                check_size(value_type, size, 4)?;
                EncodedValue::Type(ids.type_at(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_FIELD => {
                check_size(value_type, size, 4)?;
                EncodedValue::Field(ids.field(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_METHOD => {
                check_size(value_type, size, 4)?;
                EncodedValue::Method(ids.method(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_ENUM => {
                check_size(value_type, size, 4)?;
                EncodedValue::Enum(ids.field(read_unsigned(bytes, ix, size)? as u32)?)
            }
            VALUE_ARRAY => EncodedValue::Array(read_encoded_array(bytes, ix, ids)?),
            VALUE_ANNOTATION => EncodedValue::Annotation(EncodedAnnotation::read(bytes, ix, ids)?),
            VALUE_NULL => EncodedValue::Null,
            VALUE_BOOLEAN => EncodedValue::Boolean(value_arg != 0),
            _ => fail!("Unknown EncodedValue type 0x{:02x} at index {}", value_type, *ix - 1),
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>, ids: &dyn IndexAssigner) -> Result<usize, DexError> {
        fn sized(bytes: &mut Vec<u8>, value_type: u8, payload: &[u8]) -> usize {
            write_u1(bytes, (((payload.len() - 1) as u8) << 5) | value_type) + write_x(bytes, payload)
        }

        Ok(match self {
            EncodedValue::Byte(v) => sized(bytes, VALUE_BYTE, &[*v as u8]),
            EncodedValue::Short(v) => sized(bytes, VALUE_SHORT, &signed_bytes(*v as i64)),
            EncodedValue::Char(v) => sized(bytes, VALUE_CHAR, &unsigned_bytes(*v as u64)),
            EncodedValue::Int(v) => sized(bytes, VALUE_INT, &signed_bytes(*v as i64)),
            EncodedValue::Long(v) => sized(bytes, VALUE_LONG, &signed_bytes(*v)),
            EncodedValue::Float(v) => sized(bytes, VALUE_FLOAT, &float_bytes(v.to_bits() as u64, 4)),
            EncodedValue::Double(v) => sized(bytes, VALUE_DOUBLE, &float_bytes(v.to_bits(), 8)),
            EncodedValue::MethodType(p) => {
                sized(bytes, VALUE_METHOD_TYPE, &unsigned_bytes(ids.proto_idx(*p)? as u64))
            }
            EncodedValue::String(s) => sized(bytes, VALUE_STRING, &unsigned_bytes(ids.string_idx(*s)? as u64)),
            EncodedValue::Type(t) => sized(bytes, VALUE_TYPE, &unsigned_bytes(ids.type_idx(*t)? as u64)),
            EncodedValue::Field(f) => sized(bytes, VALUE_FIELD, &unsigned_bytes(ids.field_idx(*f)? as u64)),
            EncodedValue::Method(m) => sized(bytes, VALUE_METHOD, &unsigned_bytes(ids.method_idx(*m)? as u64)),
            EncodedValue::Enum(f) => sized(bytes, VALUE_ENUM, &unsigned_bytes(ids.field_idx(*f)? as u64)),
            EncodedValue::Array(values) => write_u1(bytes, VALUE_ARRAY) + write_encoded_array(values, bytes, ids)?,
            EncodedValue::Annotation(a) => write_u1(bytes, VALUE_ANNOTATION) + a.write(bytes, ids)?,
            EncodedValue::Null => write_u1(bytes, VALUE_NULL),
            EncodedValue::Boolean(b) => write_u1(bytes, ((*b as u8) << 5) | VALUE_BOOLEAN),
        })
    }

    /// The zero value a static field holds when it has no explicit initializer.
    pub fn is_zero_default(&self) -> bool {
        match self {
            EncodedValue::Byte(v) => *v == 0,
            EncodedValue::Short(v) => *v == 0,
            EncodedValue::Char(v) => *v == 0,
            EncodedValue::Int(v) => *v == 0,
            EncodedValue::Long(v) => *v == 0,
            EncodedValue::Float(v) => v.to_bits() == 0,
            EncodedValue::Double(v) => v.to_bits() == 0,
            EncodedValue::Null => true,
            EncodedValue::Boolean(b) => !*b,
            _ => false,
        }
    }

    /// Default value for a field of type `ty`.
    pub fn zero_for_type(ty: DexType) -> EncodedValue {
        match ty.as_str() {
            "Z" => EncodedValue::Boolean(false),
            "B" => EncodedValue::Byte(0),
            "S" => EncodedValue::Short(0),
            "C" => EncodedValue::Char(0),
            "I" => EncodedValue::Int(0),
            "J" => EncodedValue::Long(0),
            "F" => EncodedValue::Float(0.0),
            "D" => EncodedValue::Double(0.0),
            _ => EncodedValue::Null,
        }
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        match self {
            EncodedValue::MethodType(p) => refs.proto(*p),
            EncodedValue::String(s) => refs.string(*s),
            EncodedValue::Type(t) => refs.type_ref(*t),
            EncodedValue::Field(f) | EncodedValue::Enum(f) => refs.field(*f),
            EncodedValue::Method(m) => refs.method(*m),
            EncodedValue::Array(values) => values.iter().for_each(|v| v.collect_refs(refs)),
            EncodedValue::Annotation(a) => a.collect_refs(refs),
            _ => {}
        }
    }
}

impl EncodedAnnotation {
    pub fn read(bytes: &[u8], ix: &mut usize, ids: &dyn IndexResolver) -> Result<EncodedAnnotation, DexError> {
        let ty = ids.type_at(read_uleb128(bytes, ix)?)?;
        let size = read_uleb128(bytes, ix)?;
        let mut elements = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let name = ids.string(read_uleb128(bytes, ix)?)?;
            let value = EncodedValue::read(bytes, ix, ids)?;
            elements.push(AnnotationElement { name, value });
        }
        Ok(EncodedAnnotation { ty, elements })
    }

    pub fn write(&self, bytes: &mut Vec<u8>, ids: &dyn IndexAssigner) -> Result<usize, DexError> {
        let mut c = write_uleb128(bytes, ids.type_idx(self.ty)?);
        c += write_uleb128(bytes, self.elements.len() as u32);
        // Elements must be sorted by name index.
        let mut sorted: Vec<&AnnotationElement> = self.elements.iter().collect();
        sorted.sort_by_key(|e| e.name);
        for element in sorted {
            c += write_uleb128(bytes, ids.string_idx(element.name)?);
            c += element.value.write(bytes, ids)?;
        }
        Ok(c)
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        refs.type_ref(self.ty);
        for element in &self.elements {
            refs.string(element.name);
            element.value.collect_refs(refs);
        }
    }
}

pub fn read_encoded_array(bytes: &[u8], ix: &mut usize, ids: &dyn IndexResolver) -> Result<Vec<EncodedValue>, DexError> {
    let size = read_uleb128(bytes, ix)?;
    let mut values = Vec::with_capacity(size.min(0x10000) as usize);
    for _ in 0..size {
        values.push(EncodedValue::read(bytes, ix, ids)?);
    }
    Ok(values)
}

pub fn write_encoded_array(values: &[EncodedValue], bytes: &mut Vec<u8>, ids: &dyn IndexAssigner) -> Result<usize, DexError> {
    let mut c = write_uleb128(bytes, values.len() as u32);
    for v in values {
        c += v.write(bytes, ids)?;
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::id_tables::tests::FixedIds;

    fn encode(value: &EncodedValue) -> Vec<u8> {
        let mut out = Vec::new();
        value.write(&mut out, &FixedIds::default()).unwrap();
        out
    }

    fn decode(bytes: &[u8]) -> EncodedValue {
        let mut ix = 0;
        let v = EncodedValue::read(bytes, &mut ix, &FixedIds::default()).unwrap();
        assert_eq!(ix, bytes.len());
        v
    }

    #[test]
    fn integers_use_minimal_sign_extended_width() {
        assert_eq!(encode(&EncodedValue::Int(1)), vec![0x04, 0x01]);
        assert_eq!(encode(&EncodedValue::Int(-1)), vec![0x04, 0xff]);
        assert_eq!(encode(&EncodedValue::Int(0x80)), vec![0x24, 0x80, 0x00]);
        assert_eq!(encode(&EncodedValue::Long(-129)), vec![0x26, 0x7f, 0xff]);
        assert_eq!(decode(&[0x26, 0x7f, 0xff]), EncodedValue::Long(-129));
        assert_eq!(decode(&[0x24, 0x80, 0x00]), EncodedValue::Int(0x80));
    }

    #[test]
    fn chars_are_zero_extended() {
        assert_eq!(encode(&EncodedValue::Char(0xff)), vec![0x03, 0xff]);
        assert_eq!(decode(&[0x03, 0xff]), EncodedValue::Char(0xff));
    }

    #[test]
    fn floats_keep_high_bytes() {
        // 1.0f == 0x3f800000
        assert_eq!(encode(&EncodedValue::Float(1.0)), vec![0x30, 0x80, 0x3f]);
        assert_eq!(decode(&[0x30, 0x80, 0x3f]), EncodedValue::Float(1.0));
        assert_eq!(decode(&encode(&EncodedValue::Double(-2.5))), EncodedValue::Double(-2.5));
    }

    #[test]
    fn boolean_and_null_have_no_payload() {
        assert_eq!(encode(&EncodedValue::Boolean(true)), vec![0x3f]);
        assert_eq!(encode(&EncodedValue::Null), vec![0x1e]);
    }

    #[test]
    fn references_go_through_the_index_maps() {
        let ids = FixedIds::default();
        let s = DexString::make("encoded_values.ref");
        let v = EncodedValue::Array(vec![EncodedValue::String(s), EncodedValue::Null]);
        let mut bytes = Vec::new();
        v.write(&mut bytes, &ids).unwrap();
        assert_eq!(bytes, vec![0x1c, 0x02, 0x17, 0x00, 0x1e]);
        let mut ix = 0;
        assert_eq!(EncodedValue::read(&bytes, &mut ix, &ids).unwrap(), v);
    }

    #[test]
    fn method_handles_are_rejected() {
        let mut ix = 0;
        assert!(EncodedValue::read(&[0x16, 0x00], &mut ix, &FixedIds::default()).is_err());
    }
}
