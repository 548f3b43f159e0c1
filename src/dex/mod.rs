//! The on-disk DEX codec and the linear Dex-IR.

#[macro_use]
pub mod error;

pub mod annotations;
pub mod code;
pub mod debug;
pub mod encoded_values;
pub mod header;
pub(crate) mod id_tables;
pub mod instruction;
pub(crate) mod leb;
pub mod loader;
pub mod opcodes;
pub mod writer;

use crate::dex::error::DexError;
use crate::dex::leb::{decode_sleb128, decode_uleb128, decode_uleb128p1, encode_sleb128, encode_uleb128, encode_uleb128p1};

pub const NO_INDEX: u32 = 0xffff_ffff;

// Basic type reading and writing
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError> {
    if bytes.len() < *ix + 1 {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError> {
    if bytes.len() < *ix + 2 {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = u16::from_le_bytes([bytes[*ix], bytes[*ix + 1]]);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError> {
    if bytes.len() < *ix + 4 {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = u32::from_le_bytes([bytes[*ix], bytes[*ix + 1], bytes[*ix + 2], bytes[*ix + 3]]);
    *ix += 4;
    Ok(result)
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError> {
    match bytes.get(*ix..).and_then(decode_uleb128) {
        Some((val, size)) => {
            *ix += size;
            Ok(val)
        }
        None => fail!("Unexpected end of stream reading uleb128 at index {}", *ix),
    }
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError> {
    match bytes.get(*ix..).and_then(decode_sleb128) {
        Some((val, size)) => {
            *ix += size;
            Ok(val)
        }
        None => fail!("Unexpected end of stream reading sleb128 at index {}", *ix),
    }
}

pub(crate) fn read_uleb128p1(bytes: &[u8], ix: &mut usize) -> Result<i32, DexError> {
    match bytes.get(*ix..).and_then(decode_uleb128p1) {
        Some((val, size)) => {
            *ix += size;
            Ok(val)
        }
        None => fail!("Unexpected end of stream reading uleb128p1 at index {}", *ix),
    }
}

pub(crate) fn read_x<'a>(bytes: &'a [u8], ix: &mut usize, length: usize) -> Result<&'a [u8], DexError> {
    match bytes.get(*ix..*ix + length) {
        Some(slice) => {
            *ix += length;
            Ok(slice)
        }
        None => Err(DexError::new("buffer too short for array read")),
    }
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize {
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize {
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize {
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize {
    encode_uleb128(buffer, val)
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize {
    encode_sleb128(buffer, val)
}

pub(crate) fn write_uleb128p1(buffer: &mut Vec<u8>, val: i32) -> usize {
    encode_uleb128p1(buffer, val)
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize {
    buffer.extend_from_slice(val);
    val.len()
}

/// Pads `buffer` with zeros up to a multiple of `alignment`.
pub(crate) fn align_buffer(buffer: &mut Vec<u8>, alignment: usize) {
    let rem = buffer.len() % alignment;
    if rem != 0 {
        buffer.resize(buffer.len() + alignment - rem, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_reads_are_little_endian() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xcd, 0xab];
        let mut ix = 0;
        assert_eq!(read_u4(&bytes, &mut ix).unwrap(), 0x1234_5678);
        assert_eq!(read_u2(&bytes, &mut ix).unwrap(), 0xabcd);
        assert!(read_u1(&bytes, &mut ix).is_err());
    }

    #[test]
    fn alignment_pads_with_zeros() {
        let mut buf = vec![1, 2, 3];
        align_buffer(&mut buf, 4);
        assert_eq!(buf, vec![1, 2, 3, 0]);
        align_buffer(&mut buf, 4);
        assert_eq!(buf.len(), 4);
    }
}
