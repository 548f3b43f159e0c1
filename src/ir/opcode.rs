//! The Method-IR opcode set.
//!
//! Unlike [`DexOpcode`], IR opcodes have no width tiers or 2addr/range
//! forms; sync picks the concrete encoding. The set adds pseudo opcodes for
//! parameter loading, throwing-producer results and class initialization.

use crate::dex::opcodes::DexOpcode;

macro_rules! ir_opcodes {
    ($( $variant:ident = $name:literal; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum IROpcode {
            $( $variant, )*
        }

        impl IROpcode {
            pub fn name(self) -> &'static str {
                match self {
                    $( IROpcode::$variant => $name, )*
                }
            }
        }
    };
}

ir_opcodes! {
    Nop = "nop";
    Move = "move";
    MoveWide = "move-wide";
    MoveObject = "move-object";
    MoveResult = "move-result";
    MoveResultWide = "move-result-wide";
    MoveResultObject = "move-result-object";
    MoveException = "move-exception";
    ReturnVoid = "return-void";
    Return = "return";
    ReturnWide = "return-wide";
    ReturnObject = "return-object";
    Const = "const";
    ConstWide = "const-wide";
    ConstString = "const-string";
    ConstClass = "const-class";
    MonitorEnter = "monitor-enter";
    MonitorExit = "monitor-exit";
    CheckCast = "check-cast";
    InstanceOf = "instance-of";
    ArrayLength = "array-length";
    NewInstance = "new-instance";
    NewArray = "new-array";
    FilledNewArray = "filled-new-array";
    FillArrayData = "fill-array-data";
    Throw = "throw";
    Goto = "goto";
    Switch = "switch";
    CmplFloat = "cmpl-float";
    CmpgFloat = "cmpg-float";
    CmplDouble = "cmpl-double";
    CmpgDouble = "cmpg-double";
    CmpLong = "cmp-long";
    IfEq = "if-eq";
    IfNe = "if-ne";
    IfLt = "if-lt";
    IfGe = "if-ge";
    IfGt = "if-gt";
    IfLe = "if-le";
    IfEqz = "if-eqz";
    IfNez = "if-nez";
    IfLtz = "if-ltz";
    IfGez = "if-gez";
    IfGtz = "if-gtz";
    IfLez = "if-lez";
    Aget = "aget";
    AgetWide = "aget-wide";
    AgetObject = "aget-object";
    AgetBoolean = "aget-boolean";
    AgetByte = "aget-byte";
    AgetChar = "aget-char";
    AgetShort = "aget-short";
    Aput = "aput";
    AputWide = "aput-wide";
    AputObject = "aput-object";
    AputBoolean = "aput-boolean";
    AputByte = "aput-byte";
    AputChar = "aput-char";
    AputShort = "aput-short";
    Iget = "iget";
    IgetWide = "iget-wide";
    IgetObject = "iget-object";
    IgetBoolean = "iget-boolean";
    IgetByte = "iget-byte";
    IgetChar = "iget-char";
    IgetShort = "iget-short";
    Iput = "iput";
    IputWide = "iput-wide";
    IputObject = "iput-object";
    IputBoolean = "iput-boolean";
    IputByte = "iput-byte";
    IputChar = "iput-char";
    IputShort = "iput-short";
    Sget = "sget";
    SgetWide = "sget-wide";
    SgetObject = "sget-object";
    SgetBoolean = "sget-boolean";
    SgetByte = "sget-byte";
    SgetChar = "sget-char";
    SgetShort = "sget-short";
    Sput = "sput";
    SputWide = "sput-wide";
    SputObject = "sput-object";
    SputBoolean = "sput-boolean";
    SputByte = "sput-byte";
    SputChar = "sput-char";
    SputShort = "sput-short";
    InvokeVirtual = "invoke-virtual";
    InvokeSuper = "invoke-super";
    InvokeDirect = "invoke-direct";
    InvokeStatic = "invoke-static";
    InvokeInterface = "invoke-interface";
    NegInt = "neg-int";
    NotInt = "not-int";
    NegLong = "neg-long";
    NotLong = "not-long";
    NegFloat = "neg-float";
    NegDouble = "neg-double";
    IntToLong = "int-to-long";
    IntToFloat = "int-to-float";
    IntToDouble = "int-to-double";
    LongToInt = "long-to-int";
    LongToFloat = "long-to-float";
    LongToDouble = "long-to-double";
    FloatToInt = "float-to-int";
    FloatToLong = "float-to-long";
    FloatToDouble = "float-to-double";
    DoubleToInt = "double-to-int";
    DoubleToLong = "double-to-long";
    DoubleToFloat = "double-to-float";
    IntToByte = "int-to-byte";
    IntToChar = "int-to-char";
    IntToShort = "int-to-short";
    AddInt = "add-int";
    SubInt = "sub-int";
    MulInt = "mul-int";
    DivInt = "div-int";
    RemInt = "rem-int";
    AndInt = "and-int";
    OrInt = "or-int";
    XorInt = "xor-int";
    ShlInt = "shl-int";
    ShrInt = "shr-int";
    UshrInt = "ushr-int";
    AddLong = "add-long";
    SubLong = "sub-long";
    MulLong = "mul-long";
    DivLong = "div-long";
    RemLong = "rem-long";
    AndLong = "and-long";
    OrLong = "or-long";
    XorLong = "xor-long";
    ShlLong = "shl-long";
    ShrLong = "shr-long";
    UshrLong = "ushr-long";
    AddFloat = "add-float";
    SubFloat = "sub-float";
    MulFloat = "mul-float";
    DivFloat = "div-float";
    RemFloat = "rem-float";
    AddDouble = "add-double";
    SubDouble = "sub-double";
    MulDouble = "mul-double";
    DivDouble = "div-double";
    RemDouble = "rem-double";
    AddIntLit = "add-int/lit";
    RsubIntLit = "rsub-int/lit";
    MulIntLit = "mul-int/lit";
    DivIntLit = "div-int/lit";
    RemIntLit = "rem-int/lit";
    AndIntLit = "and-int/lit";
    OrIntLit = "or-int/lit";
    XorIntLit = "xor-int/lit";
    ShlIntLit = "shl-int/lit";
    ShrIntLit = "shr-int/lit";
    UshrIntLit = "ushr-int/lit";
    LoadParam = "load-param";
    LoadParamWide = "load-param-wide";
    LoadParamObject = "load-param-object";
    MoveResultPseudo = "move-result-pseudo";
    MoveResultPseudoWide = "move-result-pseudo-wide";
    MoveResultPseudoObject = "move-result-pseudo-object";
    InitClass = "init-class";
}

use IROpcode::*;

// Families laid out in the same order as their contiguous DexOpcode ranges.
const CMPS: [IROpcode; 5] = [CmplFloat, CmpgFloat, CmplDouble, CmpgDouble, CmpLong];
const IFS: [IROpcode; 12] = [IfEq, IfNe, IfLt, IfGe, IfGt, IfLe, IfEqz, IfNez, IfLtz, IfGez, IfGtz, IfLez];
const ARRAY_OPS: [IROpcode; 14] = [
    Aget, AgetWide, AgetObject, AgetBoolean, AgetByte, AgetChar, AgetShort, Aput, AputWide, AputObject, AputBoolean,
    AputByte, AputChar, AputShort,
];
const IFIELD_OPS: [IROpcode; 14] = [
    Iget, IgetWide, IgetObject, IgetBoolean, IgetByte, IgetChar, IgetShort, Iput, IputWide, IputObject, IputBoolean,
    IputByte, IputChar, IputShort,
];
const SFIELD_OPS: [IROpcode; 14] = [
    Sget, SgetWide, SgetObject, SgetBoolean, SgetByte, SgetChar, SgetShort, Sput, SputWide, SputObject, SputBoolean,
    SputByte, SputChar, SputShort,
];
const INVOKES: [IROpcode; 5] = [InvokeVirtual, InvokeSuper, InvokeDirect, InvokeStatic, InvokeInterface];
const UNOPS: [IROpcode; 21] = [
    NegInt, NotInt, NegLong, NotLong, NegFloat, NegDouble, IntToLong, IntToFloat, IntToDouble, LongToInt, LongToFloat,
    LongToDouble, FloatToInt, FloatToLong, FloatToDouble, DoubleToInt, DoubleToLong, DoubleToFloat, IntToByte,
    IntToChar, IntToShort,
];
const BINOPS: [IROpcode; 32] = [
    AddInt, SubInt, MulInt, DivInt, RemInt, AndInt, OrInt, XorInt, ShlInt, ShrInt, UshrInt, AddLong, SubLong, MulLong,
    DivLong, RemLong, AndLong, OrLong, XorLong, ShlLong, ShrLong, UshrLong, AddFloat, SubFloat, MulFloat, DivFloat,
    RemFloat, AddDouble, SubDouble, MulDouble, DivDouble, RemDouble,
];
const LIT_OPS: [IROpcode; 11] =
    [AddIntLit, RsubIntLit, MulIntLit, DivIntLit, RemIntLit, AndIntLit, OrIntLit, XorIntLit, ShlIntLit, ShrIntLit, UshrIntLit];

const CMP_BASE: u16 = 0x2d;
const IF_BASE: u16 = 0x32;
const ARRAY_BASE: u16 = 0x44;
const IFIELD_BASE: u16 = 0x52;
const SFIELD_BASE: u16 = 0x60;
const INVOKE_BASE: u16 = 0x6e;
const INVOKE_RANGE_BASE: u16 = 0x74;
const UNOP_BASE: u16 = 0x7b;
const BINOP_BASE: u16 = 0x90;
const BINOP_2ADDR_BASE: u16 = 0xb0;
const LIT16_BASE: u16 = 0xd0;
const LIT8_BASE: u16 = 0xd8;

fn family(table: &[IROpcode], base: u16, value: u16) -> Option<IROpcode> {
    value.checked_sub(base).and_then(|i| table.get(i as usize)).copied()
}

fn index_in(table: &[IROpcode], op: IROpcode) -> Option<u16> {
    table.iter().position(|x| *x == op).map(|i| i as u16)
}

fn dex(value: u16) -> Option<DexOpcode> {
    DexOpcode::from_value(value)
}

impl IROpcode {
    /// Maps any concrete Dex opcode to its IR form. Payload pseudo opcodes
    /// have no IR form.
    pub fn from_dex_opcode(op: DexOpcode) -> Option<IROpcode> {
        use DexOpcode as D;
        let ir = match op {
            D::Nop => Nop,
            D::Move | D::MoveFrom16 | D::Move16 => Move,
            D::MoveWide | D::MoveWideFrom16 | D::MoveWide16 => MoveWide,
            D::MoveObject | D::MoveObjectFrom16 | D::MoveObject16 => MoveObject,
            D::MoveResult => MoveResult,
            D::MoveResultWide => MoveResultWide,
            D::MoveResultObject => MoveResultObject,
            D::MoveException => MoveException,
            D::ReturnVoid => ReturnVoid,
            D::Return => Return,
            D::ReturnWide => ReturnWide,
            D::ReturnObject => ReturnObject,
            D::Const4 | D::Const16 | D::Const | D::ConstHigh16 => Const,
            D::ConstWide16 | D::ConstWide32 | D::ConstWide | D::ConstWideHigh16 => ConstWide,
            D::ConstString | D::ConstStringJumbo => ConstString,
            D::ConstClass => ConstClass,
            D::MonitorEnter => MonitorEnter,
            D::MonitorExit => MonitorExit,
            D::CheckCast => CheckCast,
            D::InstanceOf => InstanceOf,
            D::ArrayLength => ArrayLength,
            D::NewInstance => NewInstance,
            D::NewArray => NewArray,
            D::FilledNewArray | D::FilledNewArrayRange => FilledNewArray,
            D::FillArrayData => FillArrayData,
            D::Throw => Throw,
            D::Goto | D::Goto16 | D::Goto32 => Goto,
            D::PackedSwitch | D::SparseSwitch => Switch,
            D::PackedSwitchPayload | D::SparseSwitchPayload | D::FillArrayDataPayload => return None,
            _ => {
                let v = op.value();
                return family(&CMPS, CMP_BASE, v)
                    .or_else(|| family(&IFS, IF_BASE, v))
                    .or_else(|| family(&ARRAY_OPS, ARRAY_BASE, v))
                    .or_else(|| family(&IFIELD_OPS, IFIELD_BASE, v))
                    .or_else(|| family(&SFIELD_OPS, SFIELD_BASE, v))
                    .or_else(|| family(&INVOKES, INVOKE_BASE, v))
                    .or_else(|| family(&INVOKES, INVOKE_RANGE_BASE, v))
                    .or_else(|| family(&UNOPS, UNOP_BASE, v))
                    .or_else(|| family(&BINOPS, BINOP_BASE, v))
                    .or_else(|| family(&BINOPS, BINOP_2ADDR_BASE, v))
                    .or_else(|| if v >= LIT8_BASE { family(&LIT_OPS, LIT8_BASE, v) } else { None })
                    .or_else(|| family(&LIT_OPS[..8], LIT16_BASE, v));
            }
        };
        Some(ir)
    }

    /// The Dex opcode for families with a single encoding (compare, if,
    /// field and array accessors, unary ops).
    pub fn to_dex_opcode(self) -> Option<DexOpcode> {
        use DexOpcode as D;
        let d = match self {
            Nop => D::Nop,
            MoveResult => D::MoveResult,
            MoveResultWide => D::MoveResultWide,
            MoveResultObject => D::MoveResultObject,
            MoveException => D::MoveException,
            ReturnVoid => D::ReturnVoid,
            Return => D::Return,
            ReturnWide => D::ReturnWide,
            ReturnObject => D::ReturnObject,
            ConstString => D::ConstString,
            ConstClass => D::ConstClass,
            MonitorEnter => D::MonitorEnter,
            MonitorExit => D::MonitorExit,
            CheckCast => D::CheckCast,
            InstanceOf => D::InstanceOf,
            ArrayLength => D::ArrayLength,
            NewInstance => D::NewInstance,
            NewArray => D::NewArray,
            FillArrayData => D::FillArrayData,
            Throw => D::Throw,
            _ => {
                return index_in(&CMPS, self)
                    .map(|i| CMP_BASE + i)
                    .or_else(|| index_in(&IFS, self).map(|i| IF_BASE + i))
                    .or_else(|| index_in(&ARRAY_OPS, self).map(|i| ARRAY_BASE + i))
                    .or_else(|| index_in(&IFIELD_OPS, self).map(|i| IFIELD_BASE + i))
                    .or_else(|| index_in(&SFIELD_OPS, self).map(|i| SFIELD_BASE + i))
                    .or_else(|| index_in(&UNOPS, self).map(|i| UNOP_BASE + i))
                    .or_else(|| index_in(&BINOPS, self).map(|i| BINOP_BASE + i))
                    .and_then(dex);
            }
        };
        Some(d)
    }

    pub fn invoke_opcode(self, range: bool) -> Option<DexOpcode> {
        let i = index_in(&INVOKES, self)?;
        dex(if range { INVOKE_RANGE_BASE } else { INVOKE_BASE } + i)
    }

    pub fn binop_2addr(self) -> Option<DexOpcode> {
        index_in(&BINOPS, self).and_then(|i| dex(BINOP_2ADDR_BASE + i))
    }

    pub fn lit8_opcode(self) -> Option<DexOpcode> {
        index_in(&LIT_OPS, self).and_then(|i| dex(LIT8_BASE + i))
    }

    pub fn lit16_opcode(self) -> Option<DexOpcode> {
        index_in(&LIT_OPS[..8], self).and_then(|i| dex(LIT16_BASE + i))
    }

    pub fn is_binop(self) -> bool {
        BINOPS.contains(&self)
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AddInt | MulInt | AndInt | OrInt | XorInt | AddLong | MulLong | AndLong | OrLong | XorLong | AddFloat
                | MulFloat | AddDouble | MulDouble
        )
    }

    pub fn is_binop_lit(self) -> bool {
        LIT_OPS.contains(&self)
    }

    pub fn is_unop(self) -> bool {
        UNOPS.contains(&self)
    }

    pub fn is_conditional_branch(self) -> bool {
        IFS.contains(&self)
    }

    pub fn is_testz_branch(self) -> bool {
        IFS[6..].contains(&self)
    }

    pub fn is_goto(self) -> bool {
        self == Goto
    }

    pub fn is_switch(self) -> bool {
        self == Switch
    }

    /// Instructions that refer to Target items.
    pub fn is_branch(self) -> bool {
        self.is_goto() || self.is_conditional_branch() || self.is_switch()
    }

    pub fn is_return(self) -> bool {
        matches!(self, ReturnVoid | Return | ReturnWide | ReturnObject)
    }

    pub fn is_throw(self) -> bool {
        self == Throw
    }

    pub fn is_invoke(self) -> bool {
        INVOKES.contains(&self)
    }

    pub fn is_an_aget(self) -> bool {
        ARRAY_OPS[..7].contains(&self)
    }

    pub fn is_an_aput(self) -> bool {
        ARRAY_OPS[7..].contains(&self)
    }

    pub fn is_an_iget(self) -> bool {
        IFIELD_OPS[..7].contains(&self)
    }

    pub fn is_an_iput(self) -> bool {
        IFIELD_OPS[7..].contains(&self)
    }

    pub fn is_an_sget(self) -> bool {
        SFIELD_OPS[..7].contains(&self)
    }

    pub fn is_an_sput(self) -> bool {
        SFIELD_OPS[7..].contains(&self)
    }

    pub fn is_field_op(self) -> bool {
        IFIELD_OPS.contains(&self) || SFIELD_OPS.contains(&self)
    }

    pub fn is_load_param(self) -> bool {
        matches!(self, LoadParam | LoadParamWide | LoadParamObject)
    }

    pub fn is_move_result_pseudo(self) -> bool {
        matches!(self, MoveResultPseudo | MoveResultPseudoWide | MoveResultPseudoObject)
    }

    pub fn is_move_result(self) -> bool {
        matches!(self, MoveResult | MoveResultWide | MoveResultObject)
    }

    pub fn is_move(self) -> bool {
        matches!(self, Move | MoveWide | MoveObject)
    }

    /// Throwing producers whose result travels through a pseudo move-result.
    pub fn has_move_result_pseudo(self) -> bool {
        self.is_an_aget()
            || self.is_an_iget()
            || self.is_an_sget()
            || matches!(
                self,
                ConstString | ConstClass | CheckCast | InstanceOf | ArrayLength | NewInstance | NewArray | FilledNewArray
            )
    }

    /// The pseudo move-result paired with this producer.
    pub fn move_result_pseudo_for(self) -> Option<IROpcode> {
        if !self.has_move_result_pseudo() {
            return None;
        }
        Some(match self {
            AgetWide | IgetWide | SgetWide => MoveResultPseudoWide,
            AgetObject | IgetObject | SgetObject | ConstString | ConstClass | CheckCast | NewInstance | NewArray
            | FilledNewArray => MoveResultPseudoObject,
            _ => MoveResultPseudo,
        })
    }

    /// Whether the instruction writes its own destination register.
    pub fn has_dest(self) -> bool {
        self.is_move()
            || self.is_move_result()
            || self.is_move_result_pseudo()
            || self.is_load_param()
            || self.is_unop()
            || self.is_binop()
            || self.is_binop_lit()
            || CMPS.contains(&self)
            || matches!(self, MoveException | Const | ConstWide)
    }

    pub fn dest_is_wide(self) -> bool {
        matches!(
            self,
            MoveWide
                | MoveResultWide
                | MoveResultPseudoWide
                | LoadParamWide
                | ConstWide
                | NegLong
                | NotLong
                | NegDouble
                | IntToLong
                | IntToDouble
                | LongToDouble
                | FloatToLong
                | FloatToDouble
                | DoubleToLong
        ) || BINOPS[11..22].contains(&self)
            || BINOPS[27..].contains(&self)
    }

    pub fn dest_is_object(self) -> bool {
        matches!(self, MoveObject | MoveResultObject | MoveResultPseudoObject | LoadParamObject | MoveException)
    }

    pub fn can_throw(self) -> bool {
        match self {
            InitClass => true,
            LoadParam | LoadParamWide | LoadParamObject => false,
            MoveResultPseudo | MoveResultPseudoWide | MoveResultPseudoObject => false,
            Const | ConstWide | Goto | Switch => false,
            Move | MoveWide | MoveObject => false,
            FilledNewArray => true,
            AddIntLit | RsubIntLit | MulIntLit | AndIntLit | OrIntLit | XorIntLit | ShlIntLit | ShrIntLit
            | UshrIntLit => false,
            DivIntLit | RemIntLit => true,
            _ if self.is_invoke() => true,
            _ => self.to_dex_opcode().map_or(false, |d| d.can_throw()),
        }
    }

    pub fn can_continue(self) -> bool {
        !(self.is_return() || self.is_throw() || self.is_goto())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dex_forms_collapse() {
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::MoveObject16), Some(MoveObject));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::AddLong2Addr), Some(AddLong));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::RsubInt), Some(RsubIntLit));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::UshrIntLit8), Some(UshrIntLit));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::InvokeInterfaceRange), Some(InvokeInterface));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::SputShort), Some(SputShort));
        assert_eq!(IROpcode::from_dex_opcode(DexOpcode::PackedSwitchPayload), None);
    }

    #[test]
    fn encodings_by_family() {
        assert_eq!(SputShort.to_dex_opcode(), Some(DexOpcode::SputShort));
        assert_eq!(IfLez.to_dex_opcode(), Some(DexOpcode::IfLez));
        assert_eq!(RemDouble.binop_2addr(), Some(DexOpcode::RemDouble2Addr));
        assert_eq!(ShlIntLit.lit16_opcode(), None);
        assert_eq!(XorIntLit.lit16_opcode(), Some(DexOpcode::XorIntLit16));
        assert_eq!(InvokeStatic.invoke_opcode(true), Some(DexOpcode::InvokeStaticRange));
    }

    #[test]
    fn pseudo_results() {
        assert_eq!(SgetWide.move_result_pseudo_for(), Some(MoveResultPseudoWide));
        assert_eq!(CheckCast.move_result_pseudo_for(), Some(MoveResultPseudoObject));
        assert_eq!(ArrayLength.move_result_pseudo_for(), Some(MoveResultPseudo));
        assert_eq!(InvokeStatic.move_result_pseudo_for(), None);
        assert!(DivLong.dest_is_wide() && !DivFloat.dest_is_wide() && RemDouble.dest_is_wide());
    }
}
