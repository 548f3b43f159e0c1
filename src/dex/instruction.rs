//! The linear instruction form used for I/O.
//!
//! A [`DexInstruction`] keeps its operands in format-independent fields.
//! `regs` holds register operands in the order they appear in the format
//! (destination first where the opcode writes one); 3rc instructions keep
//! their first register in `regs[0]` and the count in `range_size`.
//! Payload pseudo-instructions carry a [`DexOpcodeData`] blob instead.

use std::fmt;

use smallvec::SmallVec;

use crate::dex::error::DexError;
use crate::dex::header::DexVersion;
use crate::dex::id_tables::{IndexAssigner, IndexResolver, RefCollector};
use crate::dex::opcodes::{DexOpcode, Format, RefKind};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexString, DexType};

pub type RegList = SmallVec<[u16; 5]>;

/// The pool entity an instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DexRef {
    #[default]
    None,
    String(DexString),
    Type(DexType),
    Field(DexFieldRef),
    Method(DexMethodRef),
}

impl DexRef {
    pub fn as_string(self) -> Option<DexString> {
        match self {
            DexRef::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_type(self) -> Option<DexType> {
        match self {
            DexRef::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_field(self) -> Option<DexFieldRef> {
        match self {
            DexRef::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_method(self) -> Option<DexMethodRef> {
        match self {
            DexRef::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn collect_refs(self, refs: &mut dyn RefCollector) {
        match self {
            DexRef::None => {}
            DexRef::String(s) => refs.string(s),
            DexRef::Type(t) => refs.type_ref(t),
            DexRef::Field(f) => refs.field(f),
            DexRef::Method(m) => refs.method(m),
        }
    }
}

impl fmt::Display for DexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DexRef::None => Ok(()),
            DexRef::String(s) => write!(f, "{:?}", s.as_str()),
            DexRef::Type(t) => write!(f, "{}", t),
            DexRef::Field(x) => write!(f, "{}", x),
            DexRef::Method(m) => write!(f, "{}", m),
        }
    }
}

/// Payload contents. Switch targets are code-unit offsets relative to the
/// switch instruction, not to the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DexOpcodeData {
    PackedSwitch { first_key: i32, targets: Vec<i32> },
    SparseSwitch { keys: Vec<i32>, targets: Vec<i32> },
    FillArrayData { element_width: u16, size: u32, data: Vec<u8> },
}

impl DexOpcodeData {
    pub fn size_in_code_units(&self) -> usize {
        match self {
            DexOpcodeData::PackedSwitch { targets, .. } => 4 + targets.len() * 2,
            DexOpcodeData::SparseSwitch { targets, .. } => 2 + targets.len() * 4,
            DexOpcodeData::FillArrayData { element_width, size, .. } => {
                4 + (*element_width as usize * *size as usize + 1) / 2
            }
        }
    }

    pub fn opcode(&self) -> DexOpcode {
        match self {
            DexOpcodeData::PackedSwitch { .. } => DexOpcode::PackedSwitchPayload,
            DexOpcodeData::SparseSwitch { .. } => DexOpcode::SparseSwitchPayload,
            DexOpcodeData::FillArrayData { .. } => DexOpcode::FillArrayDataPayload,
        }
    }

    /// (key, relative target) pairs of a switch payload.
    pub fn switch_cases(&self) -> Vec<(i32, i32)> {
        match self {
            DexOpcodeData::PackedSwitch { first_key, targets } => targets
                .iter()
                .enumerate()
                .map(|(i, t)| (first_key.wrapping_add(i as i32), *t))
                .collect(),
            DexOpcodeData::SparseSwitch { keys, targets } => keys.iter().copied().zip(targets.iter().copied()).collect(),
            DexOpcodeData::FillArrayData { .. } => Vec::new(),
        }
    }

    fn decode(code: &[u16], pc: usize, opcode: DexOpcode) -> Result<DexOpcodeData, DexError> {
        require_units(code, pc, 2, opcode)?;
        let count = code[pc + 1] as usize;
        let word = |i: usize| -> i32 { (code[i] as u32 | (code[i + 1] as u32) << 16) as i32 };
        match opcode {
            DexOpcode::PackedSwitchPayload => {
                require_units(code, pc, 4 + count * 2, opcode)?;
                let first_key = word(pc + 2);
                let targets = (0..count).map(|i| word(pc + 4 + i * 2)).collect();
                Ok(DexOpcodeData::PackedSwitch { first_key, targets })
            }
            DexOpcode::SparseSwitchPayload => {
                require_units(code, pc, 2 + count * 4, opcode)?;
                let keys = (0..count).map(|i| word(pc + 2 + i * 2)).collect();
                let targets = (0..count).map(|i| word(pc + 2 + count * 2 + i * 2)).collect();
                Ok(DexOpcodeData::SparseSwitch { keys, targets })
            }
            _ => {
                require_units(code, pc, 4, opcode)?;
                let element_width = code[pc + 1];
                let size = word(pc + 2) as u32;
                let byte_len = element_width as usize * size as usize;
                require_units(code, pc, 4 + (byte_len + 1) / 2, opcode)?;
                let mut data = Vec::with_capacity(byte_len);
                for unit in &code[pc + 4..pc + 4 + (byte_len + 1) / 2] {
                    data.extend_from_slice(&unit.to_le_bytes());
                }
                data.truncate(byte_len);
                Ok(DexOpcodeData::FillArrayData { element_width, size, data })
            }
        }
    }

    fn encode(&self, out: &mut Vec<u16>) {
        let push_word = |out: &mut Vec<u16>, v: i32| {
            out.push(v as u32 as u16);
            out.push(((v as u32) >> 16) as u16);
        };
        out.push(self.opcode().value());
        match self {
            DexOpcodeData::PackedSwitch { first_key, targets } => {
                out.push(targets.len() as u16);
                push_word(out, *first_key);
                for t in targets {
                    push_word(out, *t);
                }
            }
            DexOpcodeData::SparseSwitch { keys, targets } => {
                out.push(targets.len() as u16);
                for k in keys {
                    push_word(out, *k);
                }
                for t in targets {
                    push_word(out, *t);
                }
            }
            DexOpcodeData::FillArrayData { element_width, size, data } => {
                out.push(*element_width);
                push_word(out, *size as i32);
                for pair in data.chunks(2) {
                    let hi = pair.get(1).copied().unwrap_or(0);
                    out.push(u16::from_le_bytes([pair[0], hi]));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DexInstruction {
    opcode: DexOpcode,
    pub regs: RegList,
    pub range_size: u16,
    pub literal: i64,
    /// Branch or payload offset in code units, relative to this instruction.
    pub offset: i32,
    pub reference: DexRef,
    pub data: Option<Box<DexOpcodeData>>,
}

#[inline]
fn a8(unit: u16) -> u16 {
    unit >> 8
}

#[inline]
fn a4(unit: u16) -> u16 {
    (unit >> 8) & 0x0f
}

#[inline]
fn b4(unit: u16) -> u16 {
    unit >> 12
}

#[inline]
fn s4(nibble: u16) -> i64 {
    (((nibble as u8) << 4) as i8 >> 4) as i64
}

fn require_units(code: &[u16], pc: usize, need: usize, opcode: DexOpcode) -> Result<(), DexError> {
    if pc + need > code.len() {
        fail!(
            "Truncated {} at pc {}: need {} code units, have {}",
            opcode.name(),
            pc,
            need,
            code.len().saturating_sub(pc)
        );
    }
    Ok(())
}

fn fits_unsigned(value: u16, bits: u32) -> bool {
    (value as u32) < (1 << bits)
}

impl DexInstruction {
    pub fn new(opcode: DexOpcode) -> DexInstruction {
        DexInstruction {
            opcode,
            regs: RegList::new(),
            range_size: 0,
            literal: 0,
            offset: 0,
            reference: DexRef::None,
            data: None,
        }
    }

    pub fn payload(data: DexOpcodeData) -> DexInstruction {
        let mut insn = DexInstruction::new(data.opcode());
        insn.data = Some(Box::new(data));
        insn
    }

    pub fn with_regs(mut self, regs: &[u16]) -> Self {
        self.regs = regs.iter().copied().collect();
        self
    }

    pub fn with_range(mut self, base: u16, size: u16) -> Self {
        self.regs = smallvec::smallvec![base];
        self.range_size = size;
        self
    }

    pub fn with_literal(mut self, literal: i64) -> Self {
        self.literal = literal;
        self
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_ref(mut self, reference: DexRef) -> Self {
        self.reference = reference;
        self
    }

    pub fn opcode(&self) -> DexOpcode {
        self.opcode
    }

    /// Changes the opcode in place; operands are kept.
    pub fn set_opcode(&mut self, opcode: DexOpcode) {
        self.opcode = opcode;
    }

    pub fn size(&self) -> usize {
        match &self.data {
            Some(data) => data.size_in_code_units(),
            None => self.opcode.size(),
        }
    }

    pub fn dest(&self) -> Option<u16> {
        if self.opcode.has_dest() {
            self.regs.first().copied()
        } else {
            None
        }
    }

    /// Source registers, with range forms expanded.
    pub fn srcs(&self) -> RegList {
        if self.opcode.is_range() {
            let base = self.regs.first().copied().unwrap_or(0);
            return (0..self.range_size).map(|i| base + i).collect();
        }
        match self.opcode {
            // check-cast reads and writes the same register
            DexOpcode::CheckCast => self.regs.clone(),
            _ if self.opcode.has_dest() => self.regs.iter().skip(1).copied().collect(),
            _ => self.regs.clone(),
        }
    }

    pub fn range_base(&self) -> u16 {
        self.regs.first().copied().unwrap_or(0)
    }

    /// Decodes the instruction at `pc`. Payloads decode to their own pseudo
    /// instruction so that the caller can skip over them.
    pub fn decode(
        code: &[u16],
        pc: usize,
        version: DexVersion,
        ids: &dyn IndexResolver,
    ) -> Result<DexInstruction, DexError> {
        let unit = code[pc];
        let opcode = DexOpcode::decode(unit, version).map_err(|e| err!(e, "pc {}", pc))?;
        if opcode.is_payload() {
            return Ok(DexInstruction::payload(DexOpcodeData::decode(code, pc, opcode)?));
        }
        let format = opcode.format();
        let size = opcode.size();
        require_units(code, pc, size, opcode)?;
        let u = |i: usize| code[pc + i];
        let u32_at = |i: usize| u(i) as u32 | (u(i + 1) as u32) << 16;
        let mut insn = DexInstruction::new(opcode);
        let mut ref_idx: Option<u32> = None;

        match format {
            Format::F10x => {}
            Format::F12x => insn.regs = smallvec::smallvec![a4(unit), b4(unit)],
            Format::F11n => {
                insn.regs = smallvec::smallvec![a4(unit)];
                insn.literal = s4(b4(unit));
            }
            Format::F11x => insn.regs = smallvec::smallvec![a8(unit)],
            Format::F10t => insn.offset = a8(unit) as u8 as i8 as i32,
            Format::F20t => insn.offset = u(1) as i16 as i32,
            Format::F22x => insn.regs = smallvec::smallvec![a8(unit), u(1)],
            Format::F21t => {
                insn.regs = smallvec::smallvec![a8(unit)];
                insn.offset = u(1) as i16 as i32;
            }
            Format::F21s => {
                insn.regs = smallvec::smallvec![a8(unit)];
                insn.literal = u(1) as i16 as i64;
            }
            Format::F21h => {
                insn.regs = smallvec::smallvec![a8(unit)];
                insn.literal = (u(1) as i16 as i64) << opcode.literal_shift();
            }
            Format::F21c => {
                insn.regs = smallvec::smallvec![a8(unit)];
                ref_idx = Some(u(1) as u32);
            }
            Format::F23x => insn.regs = smallvec::smallvec![a8(unit), u(1) & 0xff, u(1) >> 8],
            Format::F22b => {
                insn.regs = smallvec::smallvec![a8(unit), u(1) & 0xff];
                insn.literal = (u(1) >> 8) as u8 as i8 as i64;
            }
            Format::F22t => {
                insn.regs = smallvec::smallvec![a4(unit), b4(unit)];
                insn.offset = u(1) as i16 as i32;
            }
            Format::F22s => {
                insn.regs = smallvec::smallvec![a4(unit), b4(unit)];
                insn.literal = u(1) as i16 as i64;
            }
            Format::F22c => {
                insn.regs = smallvec::smallvec![a4(unit), b4(unit)];
                ref_idx = Some(u(1) as u32);
            }
            Format::F30t => insn.offset = u32_at(1) as i32,
            Format::F32x => insn.regs = smallvec::smallvec![u(1), u(2)],
            Format::F31i => {
                insn.regs = smallvec::smallvec![a8(unit)];
                insn.literal = u32_at(1) as i32 as i64;
            }
            Format::F31t => {
                insn.regs = smallvec::smallvec![a8(unit)];
                insn.offset = u32_at(1) as i32;
            }
            Format::F31c => {
                insn.regs = smallvec::smallvec![a8(unit)];
                ref_idx = Some(u32_at(1));
            }
            Format::F35c => {
                let count = b4(unit) as usize;
                if count > 5 {
                    fail!("{} at pc {} has {} arguments", opcode.name(), pc, count);
                }
                let args = u(2);
                let all = [args & 0xf, (args >> 4) & 0xf, (args >> 8) & 0xf, args >> 12, a4(unit)];
                insn.regs = all[..count].iter().copied().collect();
                ref_idx = Some(u(1) as u32);
            }
            Format::F3rc => {
                insn.regs = smallvec::smallvec![u(2)];
                insn.range_size = a8(unit);
                ref_idx = Some(u(1) as u32);
            }
            Format::F51l => {
                insn.regs = smallvec::smallvec![a8(unit)];
                let lo = u32_at(1) as u64;
                let hi = u32_at(3) as u64;
                insn.literal = (lo | hi << 32) as i64;
            }
            Format::PackedSwitchPayload | Format::SparseSwitchPayload | Format::ArrayPayload => {}
        }

        if let Some(idx) = ref_idx {
            insn.reference = match opcode.ref_kind() {
                RefKind::String => DexRef::String(ids.string(idx)?),
                RefKind::Type => DexRef::Type(ids.type_at(idx)?),
                RefKind::Field => DexRef::Field(ids.field(idx)?),
                RefKind::Method => DexRef::Method(ids.method(idx)?),
                RefKind::None | RefKind::Data => DexRef::None,
            };
        }
        Ok(insn)
    }

    fn ref_index(&self, ids: &dyn IndexAssigner) -> Result<u32, DexError> {
        match self.reference {
            DexRef::String(s) => ids.string_idx(s),
            DexRef::Type(t) => ids.type_idx(t),
            DexRef::Field(f) => ids.field_idx(f),
            DexRef::Method(m) => ids.method_idx(m),
            DexRef::None => fail!("{} is missing its reference operand", self.opcode.name()),
        }
    }

    fn reg(&self, i: usize, bits: u32) -> Result<u16, DexError> {
        let Some(r) = self.regs.get(i).copied() else {
            violation!("{} is missing register operand {}", self.opcode.name(), i);
        };
        if !fits_unsigned(r, bits) {
            violation!("{} register v{} does not fit in {} bits", self.opcode.name(), r, bits);
        }
        Ok(r)
    }

    fn literal_fits(&self, bits: u32) -> Result<i64, DexError> {
        let shifted = self.literal >> self.opcode.literal_shift();
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if shifted < min || shifted > max || (shifted << self.opcode.literal_shift()) != self.literal {
            violation!("{} literal {} does not fit its format", self.opcode.name(), self.literal);
        }
        Ok(shifted)
    }

    fn offset_fits(&self, bits: u32) -> Result<i32, DexError> {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if (self.offset as i64) < min || (self.offset as i64) > max {
            violation!("{} offset {} does not fit in {} bits", self.opcode.name(), self.offset, bits);
        }
        Ok(self.offset)
    }

    /// Appends the encoded code units to `out`.
    pub fn encode(&self, out: &mut Vec<u16>, ids: &dyn IndexAssigner) -> Result<(), DexError> {
        if let Some(data) = &self.data {
            data.encode(out);
            return Ok(());
        }
        let op = self.opcode.value();
        let push_u32 = |out: &mut Vec<u16>, v: u32| {
            out.push(v as u16);
            out.push((v >> 16) as u16);
        };
        match self.opcode.format() {
            Format::F10x => out.push(op),
            Format::F12x => out.push(op | self.reg(0, 4)? << 8 | self.reg(1, 4)? << 12),
            Format::F11n => {
                let lit = self.literal_fits(4)? as u16 & 0xf;
                out.push(op | self.reg(0, 4)? << 8 | lit << 12);
            }
            Format::F11x => out.push(op | self.reg(0, 8)? << 8),
            Format::F10t => out.push(op | (self.offset_fits(8)? as u8 as u16) << 8),
            Format::F20t => {
                out.push(op);
                out.push(self.offset_fits(16)? as u16);
            }
            Format::F22x => {
                out.push(op | self.reg(0, 8)? << 8);
                out.push(self.reg(1, 16)?);
            }
            Format::F21t => {
                out.push(op | self.reg(0, 8)? << 8);
                out.push(self.offset_fits(16)? as u16);
            }
            Format::F21s | Format::F21h => {
                out.push(op | self.reg(0, 8)? << 8);
                out.push(self.literal_fits(16)? as u16);
            }
            Format::F21c => {
                let idx = self.ref_index(ids)?;
                if idx > 0xffff {
                    fail!("{} index {} needs a jumbo form", self.opcode.name(), idx);
                }
                out.push(op | self.reg(0, 8)? << 8);
                out.push(idx as u16);
            }
            Format::F23x => {
                out.push(op | self.reg(0, 8)? << 8);
                out.push(self.reg(1, 8)? | self.reg(2, 8)? << 8);
            }
            Format::F22b => {
                out.push(op | self.reg(0, 8)? << 8);
                out.push(self.reg(1, 8)? | (self.literal_fits(8)? as u8 as u16) << 8);
            }
            Format::F22t => {
                out.push(op | self.reg(0, 4)? << 8 | self.reg(1, 4)? << 12);
                out.push(self.offset_fits(16)? as u16);
            }
            Format::F22s => {
                out.push(op | self.reg(0, 4)? << 8 | self.reg(1, 4)? << 12);
                out.push(self.literal_fits(16)? as u16);
            }
            Format::F22c => {
                let idx = self.ref_index(ids)?;
                if idx > 0xffff {
                    fail!("{} index {} does not fit 16 bits", self.opcode.name(), idx);
                }
                out.push(op | self.reg(0, 4)? << 8 | self.reg(1, 4)? << 12);
                out.push(idx as u16);
            }
            Format::F30t => {
                out.push(op);
                push_u32(out, self.offset as u32);
            }
            Format::F32x => {
                out.push(op);
                out.push(self.reg(0, 16)?);
                out.push(self.reg(1, 16)?);
            }
            Format::F31i => {
                out.push(op | self.reg(0, 8)? << 8);
                push_u32(out, self.literal_fits(32)? as u32);
            }
            Format::F31t => {
                out.push(op | self.reg(0, 8)? << 8);
                push_u32(out, self.offset as u32);
            }
            Format::F31c => {
                out.push(op | self.reg(0, 8)? << 8);
                push_u32(out, self.ref_index(ids)?);
            }
            Format::F35c => {
                let count = self.regs.len();
                if count > 5 {
                    violation!("{} has {} arguments", self.opcode.name(), count);
                }
                let mut nibbles = [0u16; 5];
                for i in 0..count {
                    nibbles[i] = self.reg(i, 4)?;
                }
                let idx = self.ref_index(ids)?;
                if idx > 0xffff {
                    fail!("{} index {} does not fit 16 bits", self.opcode.name(), idx);
                }
                out.push(op | nibbles[4] << 8 | (count as u16) << 12);
                out.push(idx as u16);
                out.push(nibbles[0] | nibbles[1] << 4 | nibbles[2] << 8 | nibbles[3] << 12);
            }
            Format::F3rc => {
                if self.range_size > 0xff {
                    violation!("{} range of {} registers is too long", self.opcode.name(), self.range_size);
                }
                let idx = self.ref_index(ids)?;
                if idx > 0xffff {
                    fail!("{} index {} does not fit 16 bits", self.opcode.name(), idx);
                }
                out.push(op | self.range_size << 8);
                out.push(idx as u16);
                out.push(self.range_base());
            }
            Format::F51l => {
                out.push(op | self.reg(0, 8)? << 8);
                let v = self.literal as u64;
                push_u32(out, v as u32);
                push_u32(out, (v >> 32) as u32);
            }
            Format::PackedSwitchPayload | Format::SparseSwitchPayload | Format::ArrayPayload => {
                violation!("{} has no payload data", self.opcode.name());
            }
        }
        Ok(())
    }

    pub fn collect_refs(&self, refs: &mut dyn RefCollector) {
        self.reference.collect_refs(refs);
    }
}

impl fmt::Display for DexInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.name())?;
        if self.opcode.is_range() {
            write!(f, " {{v{} .. +{}}}", self.range_base(), self.range_size)?;
        } else {
            for r in &self.regs {
                write!(f, " v{}", r)?;
            }
        }
        if self.literal != 0 {
            write!(f, " #{}", self.literal)?;
        }
        if self.opcode.format().has_offset() {
            write!(f, " {:+}", self.offset)?;
        }
        if self.reference != DexRef::None {
            write!(f, " {}", self.reference)?;
        }
        Ok(())
    }
}

/// Decodes a whole instruction stream into (pc, instruction) pairs.
pub fn decode_instructions(
    code: &[u16],
    version: DexVersion,
    ids: &dyn IndexResolver,
) -> Result<Vec<(u32, DexInstruction)>, DexError> {
    let mut out = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let insn = DexInstruction::decode(code, pc, version, ids)?;
        let size = insn.size();
        out.push((pc as u32, insn));
        pc += size.max(1);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::id_tables::tests::FixedIds;
    use crate::model::pool::DexProto;

    fn decode_one(units: &[u16], ids: &FixedIds) -> DexInstruction {
        DexInstruction::decode(units, 0, DexVersion::V035, ids).unwrap()
    }

    #[test]
    fn nibble_formats() {
        let ids = FixedIds::default();
        // const/4 v3, #-2
        let insn = decode_one(&[0xe312], &ids);
        assert_eq!(insn.opcode(), DexOpcode::Const4);
        assert_eq!(insn.regs.as_slice(), &[3]);
        assert_eq!(insn.literal, -2);
        let mut out = Vec::new();
        insn.encode(&mut out, &ids).unwrap();
        assert_eq!(out, vec![0xe312]);
    }

    #[test]
    fn high16_literals_are_shifted() {
        let ids = FixedIds::default();
        let insn = decode_one(&[0x0115, 0x4120], &ids);
        assert_eq!(insn.literal, 0x4120_0000);
        let wide = decode_one(&[0x0219, 0x8000], &ids);
        assert_eq!(wide.literal, i64::MIN);
    }

    #[test]
    fn invoke_operands() {
        let ids = FixedIds::default();
        let m = DexMethodRef::make(
            DexType::make("Linsn/A;"),
            DexString::make("f"),
            DexProto::make(DexType::make("V"), crate::model::pool::DexTypeList::make(vec![DexType::make("I")])),
        );
        let insn = DexInstruction::new(DexOpcode::InvokeVirtual)
            .with_regs(&[1, 2])
            .with_ref(DexRef::Method(m));
        let mut out = Vec::new();
        insn.encode(&mut out, &ids).unwrap();
        assert_eq!(out.len(), 3);
        let back = decode_one(&out, &ids);
        assert_eq!(back.reference, DexRef::Method(m));
        assert_eq!(back.srcs().as_slice(), &[1, 2]);

        let range = DexInstruction::new(DexOpcode::InvokeStaticRange).with_range(20, 3).with_ref(DexRef::Method(m));
        assert_eq!(range.srcs().as_slice(), &[20, 21, 22]);
    }

    #[test]
    fn oversized_operands_are_structural_violations() {
        let ids = FixedIds::default();
        let insn = DexInstruction::new(DexOpcode::Move).with_regs(&[16, 0]);
        let err = insn.encode(&mut Vec::new(), &ids).unwrap_err();
        assert!(matches!(err.kind(), crate::dex::error::ErrorKind::StructuralViolation { .. }));
        let lit = DexInstruction::new(DexOpcode::Const4).with_regs(&[0]).with_literal(9);
        assert!(lit.encode(&mut Vec::new(), &ids).is_err());
    }

    #[test]
    fn payload_sizes() {
        let packed = DexOpcodeData::PackedSwitch { first_key: 0, targets: vec![1, 2, 3, 4] };
        assert_eq!(packed.size_in_code_units() * 2, 24);
        let sparse = DexOpcodeData::SparseSwitch { keys: vec![0, 100, 200], targets: vec![1, 2, 3] };
        assert_eq!(sparse.size_in_code_units() * 2, 28);
        let fill = DexOpcodeData::FillArrayData { element_width: 1, size: 3, data: vec![1, 2, 3] };
        assert_eq!(fill.size_in_code_units(), 6);

        let mut out = Vec::new();
        DexInstruction::payload(fill.clone()).encode(&mut out, &FixedIds::default()).unwrap();
        assert_eq!(out.len(), 6);
        let back = DexInstruction::decode(&out, 0, DexVersion::V035, &FixedIds::default()).unwrap();
        assert_eq!(back.data.as_deref(), Some(&fill));
    }

    #[test]
    fn sparse_cases_pair_keys_with_targets() {
        let sparse = DexOpcodeData::SparseSwitch { keys: vec![-1, 7], targets: vec![10, 20] };
        assert_eq!(sparse.switch_cases(), vec![(-1, 10), (7, 20)]);
        let packed = DexOpcodeData::PackedSwitch { first_key: 5, targets: vec![3, 4] };
        assert_eq!(packed.switch_cases(), vec![(5, 3), (6, 4)]);
    }
}
