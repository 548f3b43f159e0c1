//! The Dalvik opcode table.
//!
//! Each opcode carries its name, instruction format, reference kind and
//! behaviour flags. Which opcode values are legal in a file depends on the
//! container version; that mapping lives in a range map keyed by opcode value.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use rangemap::RangeInclusiveMap;

use crate::dex::error::DexError;
use crate::dex::header::DexVersion;

/// Instruction formats, named after the Dalvik format IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F51l,
    PackedSwitchPayload,
    SparseSwitchPayload,
    ArrayPayload,
}

impl Format {
    /// Size in 16-bit code units, or `None` for variable-size payloads.
    pub fn size(self) -> Option<usize> {
        use Format::*;
        match self {
            F10x | F12x | F11n | F11x | F10t => Some(1),
            F20t | F22x | F21t | F21s | F21h | F21c | F23x | F22b | F22t | F22s | F22c => Some(2),
            F30t | F32x | F31i | F31t | F31c | F35c | F3rc => Some(3),
            F51l => Some(5),
            PackedSwitchPayload | SparseSwitchPayload | ArrayPayload => None,
        }
    }

    pub fn is_payload(self) -> bool {
        self.size().is_none()
    }

    /// Formats that carry a branch or payload offset.
    pub fn has_offset(self) -> bool {
        matches!(self, Format::F10t | Format::F20t | Format::F30t | Format::F21t | Format::F22t | Format::F31t)
    }

    /// Number of explicit register operands, ignoring 35c/3rc argument lists.
    pub fn register_count(self) -> usize {
        use Format::*;
        match self {
            F10x | F10t | F20t | F30t | F35c | F3rc | PackedSwitchPayload | SparseSwitchPayload | ArrayPayload => 0,
            F11n | F11x | F21t | F21s | F21h | F21c | F31i | F31t | F31c | F51l => 1,
            F12x | F22x | F22b | F22t | F22s | F22c | F32x => 2,
            F23x => 3,
        }
    }
}

/// The kind of pool entity an opcode refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    None,
    String,
    Type,
    Field,
    Method,
    /// Offset to an in-method payload.
    Data,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpcodeFlags: u32 {
        const CAN_THROW = 0x1;
        const CAN_CONTINUE = 0x2;
        /// Result is delivered through a following move-result.
        const SETS_RESULT = 0x4;
        const SETS_REGISTER = 0x8;
        const SETS_WIDE_REGISTER = 0x10;
    }
}

const C: OpcodeFlags = OpcodeFlags::CAN_CONTINUE;
const CT: OpcodeFlags = C.union(OpcodeFlags::CAN_THROW);
const CR: OpcodeFlags = C.union(OpcodeFlags::SETS_REGISTER);
const CW: OpcodeFlags = CR.union(OpcodeFlags::SETS_WIDE_REGISTER);
const CTR: OpcodeFlags = CT.union(OpcodeFlags::SETS_REGISTER);
const CTW: OpcodeFlags = CTR.union(OpcodeFlags::SETS_WIDE_REGISTER);
const CTS: OpcodeFlags = CT.union(OpcodeFlags::SETS_RESULT);
const T: OpcodeFlags = OpcodeFlags::CAN_THROW;
const NONE: OpcodeFlags = OpcodeFlags::empty();

macro_rules! dex_opcodes {
    ($( $variant:ident = $value:literal, $name:literal, $fmt:ident, $refkind:ident, $flags:expr; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum DexOpcode {
            $( $variant = $value, )*
        }

        impl DexOpcode {
            pub(crate) fn from_value(value: u16) -> Option<DexOpcode> {
                match value {
                    $( $value => Some(DexOpcode::$variant), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( DexOpcode::$variant => $name, )*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $( DexOpcode::$variant => Format::$fmt, )*
                }
            }

            pub fn ref_kind(self) -> RefKind {
                match self {
                    $( DexOpcode::$variant => RefKind::$refkind, )*
                }
            }

            pub fn flags(self) -> OpcodeFlags {
                match self {
                    $( DexOpcode::$variant => $flags, )*
                }
            }
        }
    };
}

dex_opcodes! {
    Nop = 0x00, "nop", F10x, None, C;
    Move = 0x01, "move", F12x, None, CR;
    MoveFrom16 = 0x02, "move/from16", F22x, None, CR;
    Move16 = 0x03, "move/16", F32x, None, CR;
    MoveWide = 0x04, "move-wide", F12x, None, CW;
    MoveWideFrom16 = 0x05, "move-wide/from16", F22x, None, CW;
    MoveWide16 = 0x06, "move-wide/16", F32x, None, CW;
    MoveObject = 0x07, "move-object", F12x, None, CR;
    MoveObjectFrom16 = 0x08, "move-object/from16", F22x, None, CR;
    MoveObject16 = 0x09, "move-object/16", F32x, None, CR;
    MoveResult = 0x0a, "move-result", F11x, None, CR;
    MoveResultWide = 0x0b, "move-result-wide", F11x, None, CW;
    MoveResultObject = 0x0c, "move-result-object", F11x, None, CR;
    MoveException = 0x0d, "move-exception", F11x, None, CR;
    ReturnVoid = 0x0e, "return-void", F10x, None, NONE;
    Return = 0x0f, "return", F11x, None, NONE;
    ReturnWide = 0x10, "return-wide", F11x, None, NONE;
    ReturnObject = 0x11, "return-object", F11x, None, NONE;
    Const4 = 0x12, "const/4", F11n, None, CR;
    Const16 = 0x13, "const/16", F21s, None, CR;
    Const = 0x14, "const", F31i, None, CR;
    ConstHigh16 = 0x15, "const/high16", F21h, None, CR;
    ConstWide16 = 0x16, "const-wide/16", F21s, None, CW;
    ConstWide32 = 0x17, "const-wide/32", F31i, None, CW;
    ConstWide = 0x18, "const-wide", F51l, None, CW;
    ConstWideHigh16 = 0x19, "const-wide/high16", F21h, None, CW;
    ConstString = 0x1a, "const-string", F21c, String, CTR;
    ConstStringJumbo = 0x1b, "const-string/jumbo", F31c, String, CTR;
    ConstClass = 0x1c, "const-class", F21c, Type, CTR;
    MonitorEnter = 0x1d, "monitor-enter", F11x, None, CT;
    MonitorExit = 0x1e, "monitor-exit", F11x, None, CT;
    CheckCast = 0x1f, "check-cast", F21c, Type, CTR;
    InstanceOf = 0x20, "instance-of", F22c, Type, CTR;
    ArrayLength = 0x21, "array-length", F12x, None, CTR;
    NewInstance = 0x22, "new-instance", F21c, Type, CTR;
    NewArray = 0x23, "new-array", F22c, Type, CTR;
    FilledNewArray = 0x24, "filled-new-array", F35c, Type, CTS;
    FilledNewArrayRange = 0x25, "filled-new-array/range", F3rc, Type, CTS;
    FillArrayData = 0x26, "fill-array-data", F31t, Data, CT;
    Throw = 0x27, "throw", F11x, None, T;
    Goto = 0x28, "goto", F10t, None, NONE;
    Goto16 = 0x29, "goto/16", F20t, None, NONE;
    Goto32 = 0x2a, "goto/32", F30t, None, NONE;
    PackedSwitch = 0x2b, "packed-switch", F31t, Data, C;
    SparseSwitch = 0x2c, "sparse-switch", F31t, Data, C;
    CmplFloat = 0x2d, "cmpl-float", F23x, None, CR;
    CmpgFloat = 0x2e, "cmpg-float", F23x, None, CR;
    CmplDouble = 0x2f, "cmpl-double", F23x, None, CR;
    CmpgDouble = 0x30, "cmpg-double", F23x, None, CR;
    CmpLong = 0x31, "cmp-long", F23x, None, CR;
    IfEq = 0x32, "if-eq", F22t, None, C;
    IfNe = 0x33, "if-ne", F22t, None, C;
    IfLt = 0x34, "if-lt", F22t, None, C;
    IfGe = 0x35, "if-ge", F22t, None, C;
    IfGt = 0x36, "if-gt", F22t, None, C;
    IfLe = 0x37, "if-le", F22t, None, C;
    IfEqz = 0x38, "if-eqz", F21t, None, C;
    IfNez = 0x39, "if-nez", F21t, None, C;
    IfLtz = 0x3a, "if-ltz", F21t, None, C;
    IfGez = 0x3b, "if-gez", F21t, None, C;
    IfGtz = 0x3c, "if-gtz", F21t, None, C;
    IfLez = 0x3d, "if-lez", F21t, None, C;
    Aget = 0x44, "aget", F23x, None, CTR;
    AgetWide = 0x45, "aget-wide", F23x, None, CTW;
    AgetObject = 0x46, "aget-object", F23x, None, CTR;
    AgetBoolean = 0x47, "aget-boolean", F23x, None, CTR;
    AgetByte = 0x48, "aget-byte", F23x, None, CTR;
    AgetChar = 0x49, "aget-char", F23x, None, CTR;
    AgetShort = 0x4a, "aget-short", F23x, None, CTR;
    Aput = 0x4b, "aput", F23x, None, CT;
    AputWide = 0x4c, "aput-wide", F23x, None, CT;
    AputObject = 0x4d, "aput-object", F23x, None, CT;
    AputBoolean = 0x4e, "aput-boolean", F23x, None, CT;
    AputByte = 0x4f, "aput-byte", F23x, None, CT;
    AputChar = 0x50, "aput-char", F23x, None, CT;
    AputShort = 0x51, "aput-short", F23x, None, CT;
    Iget = 0x52, "iget", F22c, Field, CTR;
    IgetWide = 0x53, "iget-wide", F22c, Field, CTW;
    IgetObject = 0x54, "iget-object", F22c, Field, CTR;
    IgetBoolean = 0x55, "iget-boolean", F22c, Field, CTR;
    IgetByte = 0x56, "iget-byte", F22c, Field, CTR;
    IgetChar = 0x57, "iget-char", F22c, Field, CTR;
    IgetShort = 0x58, "iget-short", F22c, Field, CTR;
    Iput = 0x59, "iput", F22c, Field, CT;
    IputWide = 0x5a, "iput-wide", F22c, Field, CT;
    IputObject = 0x5b, "iput-object", F22c, Field, CT;
    IputBoolean = 0x5c, "iput-boolean", F22c, Field, CT;
    IputByte = 0x5d, "iput-byte", F22c, Field, CT;
    IputChar = 0x5e, "iput-char", F22c, Field, CT;
    IputShort = 0x5f, "iput-short", F22c, Field, CT;
    Sget = 0x60, "sget", F21c, Field, CTR;
    SgetWide = 0x61, "sget-wide", F21c, Field, CTW;
    SgetObject = 0x62, "sget-object", F21c, Field, CTR;
    SgetBoolean = 0x63, "sget-boolean", F21c, Field, CTR;
    SgetByte = 0x64, "sget-byte", F21c, Field, CTR;
    SgetChar = 0x65, "sget-char", F21c, Field, CTR;
    SgetShort = 0x66, "sget-short", F21c, Field, CTR;
    Sput = 0x67, "sput", F21c, Field, CT;
    SputWide = 0x68, "sput-wide", F21c, Field, CT;
    SputObject = 0x69, "sput-object", F21c, Field, CT;
    SputBoolean = 0x6a, "sput-boolean", F21c, Field, CT;
    SputByte = 0x6b, "sput-byte", F21c, Field, CT;
    SputChar = 0x6c, "sput-char", F21c, Field, CT;
    SputShort = 0x6d, "sput-short", F21c, Field, CT;
    InvokeVirtual = 0x6e, "invoke-virtual", F35c, Method, CTS;
    InvokeSuper = 0x6f, "invoke-super", F35c, Method, CTS;
    InvokeDirect = 0x70, "invoke-direct", F35c, Method, CTS;
    InvokeStatic = 0x71, "invoke-static", F35c, Method, CTS;
    InvokeInterface = 0x72, "invoke-interface", F35c, Method, CTS;
    InvokeVirtualRange = 0x74, "invoke-virtual/range", F3rc, Method, CTS;
    InvokeSuperRange = 0x75, "invoke-super/range", F3rc, Method, CTS;
    InvokeDirectRange = 0x76, "invoke-direct/range", F3rc, Method, CTS;
    InvokeStaticRange = 0x77, "invoke-static/range", F3rc, Method, CTS;
    InvokeInterfaceRange = 0x78, "invoke-interface/range", F3rc, Method, CTS;
    NegInt = 0x7b, "neg-int", F12x, None, CR;
    NotInt = 0x7c, "not-int", F12x, None, CR;
    NegLong = 0x7d, "neg-long", F12x, None, CW;
    NotLong = 0x7e, "not-long", F12x, None, CW;
    NegFloat = 0x7f, "neg-float", F12x, None, CR;
    NegDouble = 0x80, "neg-double", F12x, None, CW;
    IntToLong = 0x81, "int-to-long", F12x, None, CW;
    IntToFloat = 0x82, "int-to-float", F12x, None, CR;
    IntToDouble = 0x83, "int-to-double", F12x, None, CW;
    LongToInt = 0x84, "long-to-int", F12x, None, CR;
    LongToFloat = 0x85, "long-to-float", F12x, None, CR;
    LongToDouble = 0x86, "long-to-double", F12x, None, CW;
    FloatToInt = 0x87, "float-to-int", F12x, None, CR;
    FloatToLong = 0x88, "float-to-long", F12x, None, CW;
    FloatToDouble = 0x89, "float-to-double", F12x, None, CW;
    DoubleToInt = 0x8a, "double-to-int", F12x, None, CR;
    DoubleToLong = 0x8b, "double-to-long", F12x, None, CW;
    DoubleToFloat = 0x8c, "double-to-float", F12x, None, CR;
    IntToByte = 0x8d, "int-to-byte", F12x, None, CR;
    IntToChar = 0x8e, "int-to-char", F12x, None, CR;
    IntToShort = 0x8f, "int-to-short", F12x, None, CR;
    AddInt = 0x90, "add-int", F23x, None, CR;
    SubInt = 0x91, "sub-int", F23x, None, CR;
    MulInt = 0x92, "mul-int", F23x, None, CR;
    DivInt = 0x93, "div-int", F23x, None, CTR;
    RemInt = 0x94, "rem-int", F23x, None, CTR;
    AndInt = 0x95, "and-int", F23x, None, CR;
    OrInt = 0x96, "or-int", F23x, None, CR;
    XorInt = 0x97, "xor-int", F23x, None, CR;
    ShlInt = 0x98, "shl-int", F23x, None, CR;
    ShrInt = 0x99, "shr-int", F23x, None, CR;
    UshrInt = 0x9a, "ushr-int", F23x, None, CR;
    AddLong = 0x9b, "add-long", F23x, None, CW;
    SubLong = 0x9c, "sub-long", F23x, None, CW;
    MulLong = 0x9d, "mul-long", F23x, None, CW;
    DivLong = 0x9e, "div-long", F23x, None, CTW;
    RemLong = 0x9f, "rem-long", F23x, None, CTW;
    AndLong = 0xa0, "and-long", F23x, None, CW;
    OrLong = 0xa1, "or-long", F23x, None, CW;
    XorLong = 0xa2, "xor-long", F23x, None, CW;
    ShlLong = 0xa3, "shl-long", F23x, None, CW;
    ShrLong = 0xa4, "shr-long", F23x, None, CW;
    UshrLong = 0xa5, "ushr-long", F23x, None, CW;
    AddFloat = 0xa6, "add-float", F23x, None, CR;
    SubFloat = 0xa7, "sub-float", F23x, None, CR;
    MulFloat = 0xa8, "mul-float", F23x, None, CR;
    DivFloat = 0xa9, "div-float", F23x, None, CR;
    RemFloat = 0xaa, "rem-float", F23x, None, CR;
    AddDouble = 0xab, "add-double", F23x, None, CW;
    SubDouble = 0xac, "sub-double", F23x, None, CW;
    MulDouble = 0xad, "mul-double", F23x, None, CW;
    DivDouble = 0xae, "div-double", F23x, None, CW;
    RemDouble = 0xaf, "rem-double", F23x, None, CW;
    AddInt2Addr = 0xb0, "add-int/2addr", F12x, None, CR;
    SubInt2Addr = 0xb1, "sub-int/2addr", F12x, None, CR;
    MulInt2Addr = 0xb2, "mul-int/2addr", F12x, None, CR;
    DivInt2Addr = 0xb3, "div-int/2addr", F12x, None, CTR;
    RemInt2Addr = 0xb4, "rem-int/2addr", F12x, None, CTR;
    AndInt2Addr = 0xb5, "and-int/2addr", F12x, None, CR;
    OrInt2Addr = 0xb6, "or-int/2addr", F12x, None, CR;
    XorInt2Addr = 0xb7, "xor-int/2addr", F12x, None, CR;
    ShlInt2Addr = 0xb8, "shl-int/2addr", F12x, None, CR;
    ShrInt2Addr = 0xb9, "shr-int/2addr", F12x, None, CR;
    UshrInt2Addr = 0xba, "ushr-int/2addr", F12x, None, CR;
    AddLong2Addr = 0xbb, "add-long/2addr", F12x, None, CW;
    SubLong2Addr = 0xbc, "sub-long/2addr", F12x, None, CW;
    MulLong2Addr = 0xbd, "mul-long/2addr", F12x, None, CW;
    DivLong2Addr = 0xbe, "div-long/2addr", F12x, None, CTW;
    RemLong2Addr = 0xbf, "rem-long/2addr", F12x, None, CTW;
    AndLong2Addr = 0xc0, "and-long/2addr", F12x, None, CW;
    OrLong2Addr = 0xc1, "or-long/2addr", F12x, None, CW;
    XorLong2Addr = 0xc2, "xor-long/2addr", F12x, None, CW;
    ShlLong2Addr = 0xc3, "shl-long/2addr", F12x, None, CW;
    ShrLong2Addr = 0xc4, "shr-long/2addr", F12x, None, CW;
    UshrLong2Addr = 0xc5, "ushr-long/2addr", F12x, None, CW;
    AddFloat2Addr = 0xc6, "add-float/2addr", F12x, None, CR;
    SubFloat2Addr = 0xc7, "sub-float/2addr", F12x, None, CR;
    MulFloat2Addr = 0xc8, "mul-float/2addr", F12x, None, CR;
    DivFloat2Addr = 0xc9, "div-float/2addr", F12x, None, CR;
    RemFloat2Addr = 0xca, "rem-float/2addr", F12x, None, CR;
    AddDouble2Addr = 0xcb, "add-double/2addr", F12x, None, CW;
    SubDouble2Addr = 0xcc, "sub-double/2addr", F12x, None, CW;
    MulDouble2Addr = 0xcd, "mul-double/2addr", F12x, None, CW;
    DivDouble2Addr = 0xce, "div-double/2addr", F12x, None, CW;
    RemDouble2Addr = 0xcf, "rem-double/2addr", F12x, None, CW;
    AddIntLit16 = 0xd0, "add-int/lit16", F22s, None, CR;
    RsubInt = 0xd1, "rsub-int", F22s, None, CR;
    MulIntLit16 = 0xd2, "mul-int/lit16", F22s, None, CR;
    DivIntLit16 = 0xd3, "div-int/lit16", F22s, None, CTR;
    RemIntLit16 = 0xd4, "rem-int/lit16", F22s, None, CTR;
    AndIntLit16 = 0xd5, "and-int/lit16", F22s, None, CR;
    OrIntLit16 = 0xd6, "or-int/lit16", F22s, None, CR;
    XorIntLit16 = 0xd7, "xor-int/lit16", F22s, None, CR;
    AddIntLit8 = 0xd8, "add-int/lit8", F22b, None, CR;
    RsubIntLit8 = 0xd9, "rsub-int/lit8", F22b, None, CR;
    MulIntLit8 = 0xda, "mul-int/lit8", F22b, None, CR;
    DivIntLit8 = 0xdb, "div-int/lit8", F22b, None, CTR;
    RemIntLit8 = 0xdc, "rem-int/lit8", F22b, None, CTR;
    AndIntLit8 = 0xdd, "and-int/lit8", F22b, None, CR;
    OrIntLit8 = 0xde, "or-int/lit8", F22b, None, CR;
    XorIntLit8 = 0xdf, "xor-int/lit8", F22b, None, CR;
    ShlIntLit8 = 0xe0, "shl-int/lit8", F22b, None, CR;
    ShrIntLit8 = 0xe1, "shr-int/lit8", F22b, None, CR;
    UshrIntLit8 = 0xe2, "ushr-int/lit8", F22b, None, CR;
    PackedSwitchPayload = 0x0100, "packed-switch-payload", PackedSwitchPayload, None, NONE;
    SparseSwitchPayload = 0x0200, "sparse-switch-payload", SparseSwitchPayload, None, NONE;
    FillArrayDataPayload = 0x0300, "array-payload", ArrayPayload, None, NONE;
}

/// First container version (as its numeric value) in which each opcode byte
/// is defined. Bytes missing from the map are unused in every version.
static OPCODE_AVAILABILITY: Lazy<RangeInclusiveMap<u8, u32>> = Lazy::new(|| {
    let mut map = RangeInclusiveMap::new();
    map.insert(0x00..=0x3d, 35);
    map.insert(0x44..=0x72, 35);
    map.insert(0x74..=0x78, 35);
    map.insert(0x7b..=0xe2, 35);
    // invoke-polymorphic and invoke-custom
    map.insert(0xfa..=0xfd, 38);
    // const-method-handle and const-method-type
    map.insert(0xfe..=0xff, 39);
    map
});

impl DexOpcode {
    /// Decodes the opcode of the instruction whose first code unit is `unit`.
    pub fn decode(unit: u16, version: DexVersion) -> Result<DexOpcode, DexError> {
        let low = (unit & 0xff) as u8;
        if low == 0 && unit != 0 {
            return match DexOpcode::from_value(unit) {
                Some(op) => Ok(op),
                None => fail!("Unknown payload ident 0x{:04x}", unit),
            };
        }
        match OPCODE_AVAILABILITY.get(&low) {
            Some(first) if *first <= version.number() => match DexOpcode::from_value(low as u16) {
                Some(op) => Ok(op),
                None => fail!("Opcode 0x{:02x} has no decoder", low),
            },
            Some(first) => fail!("Opcode 0x{:02x} requires DEX version {:03} (file is {:03})", low, first, version.number()),
            None => fail!("Unused opcode 0x{:02x}", low),
        }
    }

    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn can_throw(self) -> bool {
        self.flags().contains(OpcodeFlags::CAN_THROW)
    }

    pub fn can_continue(self) -> bool {
        self.flags().contains(OpcodeFlags::CAN_CONTINUE)
    }

    pub fn has_dest(self) -> bool {
        self.flags().contains(OpcodeFlags::SETS_REGISTER)
    }

    pub fn dest_is_wide(self) -> bool {
        self.flags().contains(OpcodeFlags::SETS_WIDE_REGISTER)
    }

    pub fn sets_result(self) -> bool {
        self.flags().contains(OpcodeFlags::SETS_RESULT)
    }

    pub fn is_goto(self) -> bool {
        matches!(self, DexOpcode::Goto | DexOpcode::Goto16 | DexOpcode::Goto32)
    }

    pub fn is_conditional_branch(self) -> bool {
        (DexOpcode::IfEq as u16..=DexOpcode::IfLez as u16).contains(&(self as u16))
    }

    pub fn is_switch(self) -> bool {
        matches!(self, DexOpcode::PackedSwitch | DexOpcode::SparseSwitch)
    }

    /// Instructions whose offset names another instruction (not a payload).
    pub fn is_branch(self) -> bool {
        self.is_goto() || self.is_conditional_branch()
    }

    pub fn is_payload(self) -> bool {
        self.format().is_payload()
    }

    pub fn is_range(self) -> bool {
        self.format() == Format::F3rc
    }

    pub fn is_invoke(self) -> bool {
        self.ref_kind() == RefKind::Method
    }

    pub fn is_return(self) -> bool {
        matches!(self, DexOpcode::ReturnVoid | DexOpcode::Return | DexOpcode::ReturnWide | DexOpcode::ReturnObject)
    }

    /// Size in code units of a non-payload instruction.
    pub fn size(self) -> usize {
        self.format().size().unwrap_or(0)
    }

    /// Whether a literal is a `high16` form, shifted into the top of the value.
    pub fn literal_shift(self) -> u32 {
        match self {
            DexOpcode::ConstHigh16 => 16,
            DexOpcode::ConstWideHigh16 => 48,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_and_formats() {
        assert_eq!(DexOpcode::decode(0x0028, DexVersion::V035).unwrap(), DexOpcode::Goto);
        assert_eq!(DexOpcode::Goto.format(), Format::F10t);
        assert_eq!(DexOpcode::InvokeStaticRange.size(), 3);
        assert_eq!(DexOpcode::ConstWide.size(), 5);
        assert_eq!(DexOpcode::decode(0x0100, DexVersion::V035).unwrap(), DexOpcode::PackedSwitchPayload);
        assert_eq!(DexOpcode::decode(0x0300, DexVersion::V035).unwrap(), DexOpcode::FillArrayDataPayload);
    }

    #[test]
    fn unused_and_future_opcodes_are_rejected() {
        assert!(DexOpcode::decode(0x3e, DexVersion::V035).is_err());
        assert!(DexOpcode::decode(0x73, DexVersion::V037).is_err());
        let err = DexOpcode::decode(0xfa, DexVersion::V037).unwrap_err();
        assert!(err.to_string().contains("requires DEX version 038"));
        assert!(DexOpcode::decode(0x0400, DexVersion::V035).is_err());
    }

    #[test]
    fn categories() {
        assert!(DexOpcode::IfLez.is_conditional_branch());
        assert!(!DexOpcode::AgetShort.is_conditional_branch());
        assert!(DexOpcode::Goto32.is_branch());
        assert!(!DexOpcode::Goto32.can_continue());
        assert!(DexOpcode::DivLong2Addr.can_throw() && DexOpcode::DivLong2Addr.dest_is_wide());
        assert!(DexOpcode::FilledNewArray.sets_result());
        assert_eq!(DexOpcode::ConstWideHigh16.literal_shift(), 48);
    }
}
