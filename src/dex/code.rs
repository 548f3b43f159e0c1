//! code_item: register frame, instruction stream, tries and handlers.

use std::collections::HashMap;

use log::warn;

use crate::dex::debug::DexDebugItem;
use crate::dex::error::DexError;
use crate::dex::header::DexVersion;
use crate::dex::id_tables::{IndexAssigner, IndexResolver, RefCollector};
use crate::dex::instruction::{decode_instructions, DexInstruction};
use crate::dex::leb::uleb128_size;
use crate::dex::{read_sleb128, read_u2, read_u4, read_uleb128, write_sleb128, write_u2, write_u4, write_uleb128, write_x};
use crate::model::pool::DexType;

/// One handler of a try region; `ty` is `None` for a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DexCatch {
    pub ty: Option<DexType>,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexTryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub catches: Vec<DexCatch>,
}

impl DexTryItem {
    pub fn end_addr(&self) -> u32 {
        self.start_addr + self.insn_count as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DexCode {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<DexInstruction>,
    pub tries: Vec<DexTryItem>,
    pub debug_item: Option<DexDebugItem>,
}

fn read_handler(bytes: &[u8], ix: &mut usize, ids: &dyn IndexResolver) -> Result<Vec<DexCatch>, DexError> {
    let size = read_sleb128(bytes, ix)?;
    let mut catches = Vec::with_capacity(size.unsigned_abs().min(0x100) as usize + 1);
    for _ in 0..size.unsigned_abs() {
        let ty = ids.type_at(read_uleb128(bytes, ix)?)?;
        let addr = read_uleb128(bytes, ix)?;
        catches.push(DexCatch { ty: Some(ty), addr });
    }
    if size <= 0 {
        catches.push(DexCatch { ty: None, addr: read_uleb128(bytes, ix)? });
    }
    Ok(catches)
}

fn encode_handler(catches: &[DexCatch], ids: &dyn IndexAssigner) -> Result<Vec<u8>, DexError> {
    let mut bytes = Vec::new();
    let typed: Vec<&DexCatch> = catches.iter().filter(|c| c.ty.is_some()).collect();
    let catch_all = catches.iter().find(|c| c.ty.is_none());
    if let Some(pos) = catches.iter().position(|c| c.ty.is_none()) {
        if pos != catches.len() - 1 {
            violation!("catch-all handler must be the last in its list");
        }
    }
    let count = typed.len() as i32;
    write_sleb128(&mut bytes, if catch_all.is_some() { -count } else { count });
    for c in typed {
        if let Some(ty) = c.ty {
            write_uleb128(&mut bytes, ids.type_idx(ty)?);
            write_uleb128(&mut bytes, c.addr);
        }
    }
    if let Some(c) = catch_all {
        write_uleb128(&mut bytes, c.addr);
    }
    Ok(bytes)
}

impl DexCode {
    pub fn read(bytes: &[u8], off: u32, version: DexVersion, ids: &dyn IndexResolver) -> Result<DexCode, DexError> {
        let mut ix = off as usize;
        let registers_size = read_u2(bytes, &mut ix)?;
        let ins_size = read_u2(bytes, &mut ix)?;
        let outs_size = read_u2(bytes, &mut ix)?;
        let tries_size = read_u2(bytes, &mut ix)?;
        let debug_info_off = read_u4(bytes, &mut ix)?;
        let insns_size = read_u4(bytes, &mut ix)? as usize;
        if ins_size > registers_size {
            fail!("ins_size {} exceeds registers_size {}", ins_size, registers_size);
        }

        let mut units = Vec::with_capacity(insns_size);
        for _ in 0..insns_size {
            units.push(read_u2(bytes, &mut ix)?);
        }
        let insns = decode_instructions(&units, version, ids)?.into_iter().map(|(_, insn)| insn).collect();

        let mut tries = Vec::with_capacity(tries_size as usize);
        if tries_size > 0 {
            if insns_size % 2 == 1 {
                let padding = read_u2(bytes, &mut ix)?;
                if padding != 0 {
                    warn!("[codeitem] non-zero padding 0x{:04x} after instructions at 0x{:x}", padding, off);
                }
            }
            let mut raw = Vec::with_capacity(tries_size as usize);
            for _ in 0..tries_size {
                let start_addr = read_u4(bytes, &mut ix)?;
                let insn_count = read_u2(bytes, &mut ix)?;
                let handler_off = read_u2(bytes, &mut ix)?;
                raw.push((start_addr, insn_count, handler_off));
            }
            let handlers_base = ix;
            let mut handlers: HashMap<u16, Vec<DexCatch>> = HashMap::new();
            for (start_addr, insn_count, handler_off) in raw {
                if start_addr as usize + insn_count as usize > insns_size {
                    fail!("try item [{}, +{}) extends past the instructions", start_addr, insn_count);
                }
                let catches = match handlers.get(&handler_off) {
                    Some(c) => c.clone(),
                    None => {
                        let mut hix = handlers_base + handler_off as usize;
                        let c = read_handler(bytes, &mut hix, ids)?;
                        handlers.insert(handler_off, c.clone());
                        c
                    }
                };
                tries.push(DexTryItem { start_addr, insn_count, catches });
            }
        }

        let debug_item = if debug_info_off != 0 {
            Some(DexDebugItem::read(bytes, debug_info_off, ids).map_err(|e| err!(e, "debug info at 0x{:x}", debug_info_off))?)
        } else {
            None
        };

        Ok(DexCode { registers_size, ins_size, outs_size, insns, tries, debug_item })
    }

    /// Total size of the instruction stream in code units.
    pub fn size_in_code_units(&self) -> usize {
        self.insns.iter().map(|i| i.size()).sum()
    }

    /// Code-unit address of every instruction, in order.
    pub fn addresses(&self) -> Vec<u32> {
        let mut addr = 0u32;
        self.insns
            .iter()
            .map(|i| {
                let a = addr;
                addr += i.size() as u32;
                a
            })
            .collect()
    }

    /// Writes the code_item at the end of `bytes`, which must be 4-aligned.
    /// Identical handler lists share one encoded_catch_handler.
    pub fn write(&self, bytes: &mut Vec<u8>, ids: &dyn IndexAssigner, debug_info_off: u32) -> Result<usize, DexError> {
        let start = bytes.len();
        let mut units = Vec::with_capacity(self.insns.len() * 2);
        for insn in &self.insns {
            insn.encode(&mut units, ids)?;
        }
        if self.tries.len() > u16::MAX as usize {
            fail!("{} try items do not fit a code_item", self.tries.len());
        }

        write_u2(bytes, self.registers_size);
        write_u2(bytes, self.ins_size);
        write_u2(bytes, self.outs_size);
        write_u2(bytes, self.tries.len() as u16);
        write_u4(bytes, debug_info_off);
        write_u4(bytes, units.len() as u32);
        for unit in &units {
            write_u2(bytes, *unit);
        }
        if self.tries.is_empty() {
            return Ok(bytes.len() - start);
        }
        if units.len() % 2 == 1 {
            write_u2(bytes, 0);
        }

        let mut unique: Vec<Vec<u8>> = Vec::new();
        let mut index_of: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut handler_for_try = Vec::with_capacity(self.tries.len());
        for t in &self.tries {
            let encoded = encode_handler(&t.catches, ids)?;
            let i = match index_of.get(&encoded) {
                Some(i) => *i,
                None => {
                    unique.push(encoded.clone());
                    index_of.insert(encoded, unique.len() - 1);
                    unique.len() - 1
                }
            };
            handler_for_try.push(i);
        }
        let mut offsets = Vec::with_capacity(unique.len());
        let mut off = uleb128_size(unique.len() as u32);
        for h in &unique {
            offsets.push(off);
            off += h.len();
        }
        for (t, h) in self.tries.iter().zip(&handler_for_try) {
            if offsets[*h] > u16::MAX as usize {
                fail!("handler list exceeds 64KiB");
            }
            write_u4(bytes, t.start_addr);
            write_u2(bytes, t.insn_count);
            write_u2(bytes, offsets[*h] as u16);
        }
        write_uleb128(bytes, unique.len() as u32);
        for h in &unique {
            write_x(bytes, h);
        }
        Ok(bytes.len() - start)
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        for insn in &self.insns {
            insn.collect_refs(refs);
        }
        for t in &self.tries {
            for c in &t.catches {
                if let Some(ty) = c.ty {
                    refs.type_ref(ty);
                }
            }
        }
        if let Some(debug) = &self.debug_item {
            debug.collect_refs(refs);
        }
    }
}
