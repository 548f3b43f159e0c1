//! debug_info_item decoding and encoding.
//!
//! Decoding runs the DEX debug state machine and yields absolute
//! (address, entry) pairs. Encoding regenerates a minimal opcode stream for
//! the same trajectory.

use crate::dex::error::DexError;
use crate::dex::id_tables::{IndexAssigner, IndexResolver, RefCollector};
use crate::dex::{read_u1, read_sleb128, read_uleb128, read_uleb128p1, write_sleb128, write_u1, write_uleb128, write_uleb128p1};
use crate::model::pool::{DexMethodRef, DexString, DexType};

const DBG_END_SEQUENCE: u8 = 0x00;
const DBG_ADVANCE_PC: u8 = 0x01;
const DBG_ADVANCE_LINE: u8 = 0x02;
const DBG_START_LOCAL: u8 = 0x03;
const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
const DBG_END_LOCAL: u8 = 0x05;
const DBG_RESTART_LOCAL: u8 = 0x06;
const DBG_SET_PROLOGUE_END: u8 = 0x07;
const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
const DBG_SET_FILE: u8 = 0x09;
const DBG_FIRST_SPECIAL: u8 = 0x0a;

pub const DBG_LINE_BASE: i32 = -4;
pub const DBG_LINE_RANGE: i32 = 15;

/// A decoded source position. `file` is `None` while the class source file
/// applies.
///
/// `method` and `parent` describe inlined code. They live only in memory:
/// `parent` indexes `DexDebugItem::parents` and is never encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DexPosition {
    pub line: u32,
    pub file: Option<DexString>,
    pub method: Option<DexMethodRef>,
    pub parent: Option<u32>,
}

impl DexPosition {
    pub fn new(line: u32, file: Option<DexString>) -> DexPosition {
        DexPosition { line, file, method: None, parent: None }
    }
}

/// Debug opcodes that do not move the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexDebugInstruction {
    StartLocal { reg: u32, name: Option<DexString>, ty: Option<DexType>, signature: Option<DexString> },
    EndLocal(u32),
    RestartLocal(u32),
    SetPrologueEnd,
    SetEpilogueBegin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexDebugEntryKind {
    Position(DexPosition),
    Instruction(DexDebugInstruction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexDebugEntry {
    pub addr: u32,
    pub kind: DexDebugEntryKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DexDebugItem {
    pub line_start: u32,
    pub param_names: Vec<Option<DexString>>,
    pub entries: Vec<DexDebugEntry>,
    /// Caller positions of inlined code. A parent's own `parent` always
    /// points to an earlier slot.
    pub parents: Vec<DexPosition>,
}

fn optional_string(ids: &dyn IndexResolver, idx: i32) -> Result<Option<DexString>, DexError> {
    if idx < 0 {
        Ok(None)
    } else {
        ids.string(idx as u32).map(Some)
    }
}

fn optional_type(ids: &dyn IndexResolver, idx: i32) -> Result<Option<DexType>, DexError> {
    if idx < 0 {
        Ok(None)
    } else {
        ids.type_at(idx as u32).map(Some)
    }
}

fn write_optional_string(bytes: &mut Vec<u8>, ids: &dyn IndexAssigner, s: Option<DexString>) -> Result<usize, DexError> {
    Ok(match s {
        Some(s) => write_uleb128p1(bytes, ids.string_idx(s)? as i32),
        None => write_uleb128p1(bytes, -1),
    })
}

impl DexDebugItem {
    pub fn read(bytes: &[u8], off: u32, ids: &dyn IndexResolver) -> Result<DexDebugItem, DexError> {
        let mut ix = off as usize;
        let line_start = read_uleb128(bytes, &mut ix)?;
        let params_size = read_uleb128(bytes, &mut ix)?;
        let mut param_names = Vec::with_capacity(params_size.min(0x100) as usize);
        for _ in 0..params_size {
            param_names.push(optional_string(ids, read_uleb128p1(bytes, &mut ix)?)?);
        }

        let mut entries = Vec::new();
        let mut addr: u32 = 0;
        let mut line: i64 = line_start as i64;
        let mut file: Option<DexString> = None;
        loop {
            let op = read_u1(bytes, &mut ix)?;
            let instruction = match op {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => {
                    addr = addr.wrapping_add(read_uleb128(bytes, &mut ix)?);
                    continue;
                }
                DBG_ADVANCE_LINE => {
                    line += read_sleb128(bytes, &mut ix)? as i64;
                    continue;
                }
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED => {
                    let reg = read_uleb128(bytes, &mut ix)?;
                    let name = optional_string(ids, read_uleb128p1(bytes, &mut ix)?)?;
                    let ty = optional_type(ids, read_uleb128p1(bytes, &mut ix)?)?;
                    let signature = if op == DBG_START_LOCAL_EXTENDED {
                        optional_string(ids, read_uleb128p1(bytes, &mut ix)?)?
                    } else {
                        None
                    };
                    DexDebugInstruction::StartLocal { reg, name, ty, signature }
                }
                DBG_END_LOCAL => DexDebugInstruction::EndLocal(read_uleb128(bytes, &mut ix)?),
                DBG_RESTART_LOCAL => DexDebugInstruction::RestartLocal(read_uleb128(bytes, &mut ix)?),
                DBG_SET_PROLOGUE_END => DexDebugInstruction::SetPrologueEnd,
                DBG_SET_EPILOGUE_BEGIN => DexDebugInstruction::SetEpilogueBegin,
                DBG_SET_FILE => {
                    file = optional_string(ids, read_uleb128p1(bytes, &mut ix)?)?;
                    continue;
                }
                special => {
                    let adjusted = (special - DBG_FIRST_SPECIAL) as i32;
                    line += (DBG_LINE_BASE + adjusted % DBG_LINE_RANGE) as i64;
                    addr = addr.wrapping_add((adjusted / DBG_LINE_RANGE) as u32);
                    if line < 0 || line > u32::MAX as i64 {
                        fail!("Debug line {} out of range at address {}", line, addr);
                    }
                    entries.push(DexDebugEntry {
                        addr,
                        kind: DexDebugEntryKind::Position(DexPosition::new(line as u32, file)),
                    });
                    continue;
                }
            };
            entries.push(DexDebugEntry { addr, kind: DexDebugEntryKind::Instruction(instruction) });
        }
        Ok(DexDebugItem { line_start, param_names, entries, parents: Vec::new() })
    }

    pub fn positions(&self) -> impl Iterator<Item = (u32, &DexPosition)> {
        self.entries.iter().filter_map(|e| match &e.kind {
            DexDebugEntryKind::Position(p) => Some((e.addr, p)),
            DexDebugEntryKind::Instruction(_) => None,
        })
    }

    /// Emits the minimal opcode stream reproducing `entries`. Consecutive
    /// positions at one address collapse to the last of them.
    pub fn write(&self, bytes: &mut Vec<u8>, ids: &dyn IndexAssigner) -> Result<usize, DexError> {
        let start = bytes.len();
        write_uleb128(bytes, self.line_start);
        write_uleb128(bytes, self.param_names.len() as u32);
        for name in &self.param_names {
            write_optional_string(bytes, ids, *name)?;
        }

        let mut addr: u32 = 0;
        let mut line: i64 = self.line_start as i64;
        let mut file: Option<DexString> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.addr < addr {
                fail!("Debug entries out of order: address {} after {}", entry.addr, addr);
            }
            match &entry.kind {
                DexDebugEntryKind::Position(pos) => {
                    let shadowed = matches!(
                        self.entries.get(i + 1),
                        Some(DexDebugEntry { addr: next, kind: DexDebugEntryKind::Position(_) }) if *next == entry.addr
                    );
                    if shadowed {
                        continue;
                    }
                    if pos.file != file {
                        write_u1(bytes, DBG_SET_FILE);
                        write_optional_string(bytes, ids, pos.file)?;
                        file = pos.file;
                    }
                    let mut line_delta = pos.line as i64 - line;
                    let mut addr_delta = entry.addr - addr;
                    if line_delta < DBG_LINE_BASE as i64 || line_delta >= (DBG_LINE_BASE + DBG_LINE_RANGE) as i64 {
                        write_u1(bytes, DBG_ADVANCE_LINE);
                        write_sleb128(bytes, line_delta as i32);
                        line_delta = 0;
                    }
                    let special = |line_delta: i64, addr_delta: u32| -> u64 {
                        (line_delta - DBG_LINE_BASE as i64) as u64
                            + DBG_LINE_RANGE as u64 * addr_delta as u64
                            + DBG_FIRST_SPECIAL as u64
                    };
                    if special(line_delta, addr_delta) > 0xff {
                        write_u1(bytes, DBG_ADVANCE_PC);
                        write_uleb128(bytes, addr_delta);
                        addr_delta = 0;
                    }
                    write_u1(bytes, special(line_delta, addr_delta) as u8);
                    line = pos.line as i64;
                    addr = entry.addr;
                }
                DexDebugEntryKind::Instruction(insn) => {
                    if entry.addr > addr {
                        write_u1(bytes, DBG_ADVANCE_PC);
                        write_uleb128(bytes, entry.addr - addr);
                        addr = entry.addr;
                    }
                    match *insn {
                        DexDebugInstruction::StartLocal { reg, name, ty, signature } => {
                            write_u1(bytes, if signature.is_some() { DBG_START_LOCAL_EXTENDED } else { DBG_START_LOCAL });
                            write_uleb128(bytes, reg);
                            write_optional_string(bytes, ids, name)?;
                            match ty {
                                Some(t) => write_uleb128p1(bytes, ids.type_idx(t)? as i32),
                                None => write_uleb128p1(bytes, -1),
                            };
                            if signature.is_some() {
                                write_optional_string(bytes, ids, signature)?;
                            }
                        }
                        DexDebugInstruction::EndLocal(reg) => {
                            write_u1(bytes, DBG_END_LOCAL);
                            write_uleb128(bytes, reg);
                        }
                        DexDebugInstruction::RestartLocal(reg) => {
                            write_u1(bytes, DBG_RESTART_LOCAL);
                            write_uleb128(bytes, reg);
                        }
                        DexDebugInstruction::SetPrologueEnd => {
                            write_u1(bytes, DBG_SET_PROLOGUE_END);
                        }
                        DexDebugInstruction::SetEpilogueBegin => {
                            write_u1(bytes, DBG_SET_EPILOGUE_BEGIN);
                        }
                    }
                }
            }
        }
        write_u1(bytes, DBG_END_SEQUENCE);
        Ok(bytes.len() - start)
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        for name in self.param_names.iter().flatten() {
            refs.string(*name);
        }
        for entry in &self.entries {
            match entry.kind {
                DexDebugEntryKind::Position(DexPosition { file: Some(f), .. }) => refs.string(f),
                DexDebugEntryKind::Instruction(DexDebugInstruction::StartLocal { name, ty, signature, .. }) => {
                    if let Some(n) = name {
                        refs.string(n);
                    }
                    if let Some(t) = ty {
                        refs.type_ref(t);
                    }
                    if let Some(s) = signature {
                        refs.string(s);
                    }
                }
                _ => {}
            }
        }
    }
}
