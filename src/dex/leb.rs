//! LEB128 variable-length integers as used throughout the DEX format.
//!
//! Values are at most 32 bits wide, so a valid encoding never exceeds five
//! bytes. Decoders return `None` when the input ends mid-value.

pub(crate) const MAX_LEB128_LEN: usize = 5;

pub(crate) fn encode_uleb128(buffer: &mut Vec<u8>, value: u32) -> usize {
    let mut remaining = value;
    let mut count = 0;
    loop {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0 {
            byte |= 0x80;
        }
        buffer.push(byte);
        count += 1;
        if remaining == 0 {
            return count;
        }
    }
}

pub(crate) fn encode_sleb128(buffer: &mut Vec<u8>, value: i32) -> usize {
    let mut remaining = value;
    let mut count = 0;
    loop {
        let byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        let done = (remaining == 0 && byte & 0x40 == 0) || (remaining == -1 && byte & 0x40 != 0);
        buffer.push(if done { byte } else { byte | 0x80 });
        count += 1;
        if done {
            return count;
        }
    }
}

/// `uleb128p1` stores `value + 1`, so that -1 (NO_INDEX) encodes as a single zero byte.
pub(crate) fn encode_uleb128p1(buffer: &mut Vec<u8>, value: i32) -> usize {
    encode_uleb128(buffer, value.wrapping_add(1) as u32)
}

pub(crate) fn decode_uleb128(encoded: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in encoded.iter().take(MAX_LEB128_LEN).enumerate() {
        value |= ((byte & 0x7f) as u32).wrapping_shl(7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    if encoded.len() >= MAX_LEB128_LEN {
        // The fifth byte only contributes four bits; anything past it is ignored
        // the same way the runtime ignores it.
        Some((value, MAX_LEB128_LEN))
    } else {
        None
    }
}

pub(crate) fn decode_sleb128(encoded: &[u8]) -> Option<(i32, usize)> {
    let mut value: i32 = 0;
    let mut shift = 0u32;
    for (i, &byte) in encoded.iter().take(MAX_LEB128_LEN).enumerate() {
        value |= ((byte & 0x7f) as i32).wrapping_shl(shift);
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 && byte & 0x40 != 0 {
                value |= -1i32 << shift;
            }
            return Some((value, i + 1));
        }
    }
    if encoded.len() >= MAX_LEB128_LEN {
        Some((value, MAX_LEB128_LEN))
    } else {
        None
    }
}

pub(crate) fn decode_uleb128p1(encoded: &[u8]) -> Option<(i32, usize)> {
    decode_uleb128(encoded).map(|(v, n)| ((v as i32).wrapping_sub(1), n))
}

pub(crate) fn uleb128_size(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}
