use std::fmt;

use smallvec::SmallVec;

use crate::dex::instruction::{DexOpcodeData, DexRef};
use crate::ir::opcode::IROpcode;
use crate::model::pool::{DexFieldRef, DexMethodRef, DexString, DexType};

pub type Reg = u32;
pub type SrcList = SmallVec<[Reg; 4]>;

/// An instruction over normalized registers. Invoke sources list one
/// register per argument; a wide argument is named by the low half of its
/// pair.
#[derive(Debug, Clone, PartialEq)]
pub struct IRInstruction {
    opcode: IROpcode,
    dest: Option<Reg>,
    srcs: SrcList,
    literal: i64,
    reference: DexRef,
    data: Option<Box<DexOpcodeData>>,
}

impl IRInstruction {
    pub fn new(opcode: IROpcode) -> IRInstruction {
        IRInstruction { opcode, dest: None, srcs: SrcList::new(), literal: 0, reference: DexRef::None, data: None }
    }

    pub fn opcode(&self) -> IROpcode {
        self.opcode
    }

    pub fn set_opcode(&mut self, opcode: IROpcode) -> &mut Self {
        self.opcode = opcode;
        self
    }

    pub fn dest(&self) -> Option<Reg> {
        self.dest
    }

    pub fn set_dest(&mut self, dest: Reg) -> &mut Self {
        self.dest = Some(dest);
        self
    }

    pub fn clear_dest(&mut self) -> &mut Self {
        self.dest = None;
        self
    }

    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    pub fn src(&self, i: usize) -> Reg {
        self.srcs[i]
    }

    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    pub fn set_srcs(&mut self, srcs: &[Reg]) -> &mut Self {
        self.srcs = srcs.iter().copied().collect();
        self
    }

    pub fn set_src(&mut self, i: usize, reg: Reg) -> &mut Self {
        self.srcs[i] = reg;
        self
    }

    pub fn literal(&self) -> i64 {
        self.literal
    }

    pub fn set_literal(&mut self, literal: i64) -> &mut Self {
        self.literal = literal;
        self
    }

    pub fn reference(&self) -> DexRef {
        self.reference
    }

    pub fn set_ref(&mut self, reference: DexRef) -> &mut Self {
        self.reference = reference;
        self
    }

    pub fn get_string(&self) -> Option<DexString> {
        self.reference.as_string()
    }

    pub fn get_type(&self) -> Option<DexType> {
        self.reference.as_type()
    }

    pub fn get_field(&self) -> Option<DexFieldRef> {
        self.reference.as_field()
    }

    pub fn get_method(&self) -> Option<DexMethodRef> {
        self.reference.as_method()
    }

    pub fn data(&self) -> Option<&DexOpcodeData> {
        self.data.as_deref()
    }

    pub fn set_data(&mut self, data: DexOpcodeData) -> &mut Self {
        self.data = Some(Box::new(data));
        self
    }

    /// Builder-style helpers used when constructing bodies by hand.
    pub fn with_dest(mut self, dest: Reg) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_srcs(mut self, srcs: &[Reg]) -> Self {
        self.srcs = srcs.iter().copied().collect();
        self
    }

    pub fn with_literal(mut self, literal: i64) -> Self {
        self.literal = literal;
        self
    }

    pub fn with_ref(mut self, reference: DexRef) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_data(mut self, data: DexOpcodeData) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn has_move_result_pseudo(&self) -> bool {
        self.opcode.has_move_result_pseudo()
    }

    /// Width in registers of argument `i` of an invoke.
    pub fn invoke_arg_is_wide(&self, i: usize) -> bool {
        let Some(m) = self.get_method() else {
            return false;
        };
        let has_this = self.opcode != IROpcode::InvokeStatic;
        match (has_this, i) {
            (true, 0) => false,
            (true, i) => m.proto().args().types().get(i - 1).map_or(false, |t| t.is_wide()),
            (false, i) => m.proto().args().types().get(i).map_or(false, |t| t.is_wide()),
        }
    }

    /// Registers written, including the high half of a wide destination.
    pub fn dest_regs(&self) -> SmallVec<[Reg; 2]> {
        match self.dest {
            Some(d) if self.opcode.dest_is_wide() => smallvec::smallvec![d, d + 1],
            Some(d) => smallvec::smallvec![d],
            None => SmallVec::new(),
        }
    }
}

impl fmt::Display for IRInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.name())?;
        if let Some(d) = self.dest {
            write!(f, " v{}", d)?;
        }
        for (i, s) in self.srcs.iter().enumerate() {
            write!(f, "{}v{}", if i == 0 && self.dest.is_none() { " " } else { ", " }, s)?;
        }
        if matches!(self.opcode, IROpcode::Const | IROpcode::ConstWide) || self.opcode.is_binop_lit() {
            write!(f, ", #{}", self.literal)?;
        }
        if self.reference != DexRef::None {
            write!(f, ", {}", self.reference)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pool::{DexProto, DexTypeList};

    #[test]
    fn wide_invoke_arguments() {
        let proto = DexProto::make(
            DexType::make("V"),
            DexTypeList::make(vec![DexType::make("J"), DexType::make("I"), DexType::make("D")]),
        );
        let m = DexMethodRef::make(DexType::make("Lir/W;"), DexString::make("f"), proto);
        let virt = IRInstruction::new(IROpcode::InvokeVirtual).with_srcs(&[0, 1, 3, 4]).with_ref(DexRef::Method(m));
        assert!(!virt.invoke_arg_is_wide(0));
        assert!(virt.invoke_arg_is_wide(1));
        assert!(!virt.invoke_arg_is_wide(2));
        assert!(virt.invoke_arg_is_wide(3));
        let stat = IRInstruction::new(IROpcode::InvokeStatic).with_srcs(&[0, 2, 3]).with_ref(DexRef::Method(m));
        assert!(stat.invoke_arg_is_wide(0));
    }

    #[test]
    fn display() {
        let insn = IRInstruction::new(IROpcode::AddIntLit).with_dest(1).with_srcs(&[2]).with_literal(-3);
        assert_eq!(insn.to_string(), "add-int/lit v1, v2, #-3");
        assert_eq!(IRInstruction::new(IROpcode::ReturnObject).with_srcs(&[4]).to_string(), "return-object v4");
    }
}
