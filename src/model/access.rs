//! Java access modifiers as stored in `access_flags`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DexAccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// Which kind of member the flags belong to; some bits mean different
/// things on fields and methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Class,
    Field,
    Method,
}

impl DexAccessFlags {
    pub const VISIBILITY_MASK: DexAccessFlags = DexAccessFlags::PUBLIC
        .union(DexAccessFlags::PRIVATE)
        .union(DexAccessFlags::PROTECTED);

    pub fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }

    pub fn is_private(self) -> bool {
        self.contains(Self::PRIVATE)
    }

    pub fn is_protected(self) -> bool {
        self.contains(Self::PROTECTED)
    }

    /// None of public, private or protected.
    pub fn is_package_private(self) -> bool {
        !self.intersects(Self::VISIBILITY_MASK)
    }

    pub fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    pub fn is_final(self) -> bool {
        self.contains(Self::FINAL)
    }

    pub fn is_interface(self) -> bool {
        self.contains(Self::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.contains(Self::ABSTRACT)
    }

    pub fn is_native(self) -> bool {
        self.contains(Self::NATIVE)
    }

    pub fn is_synthetic(self) -> bool {
        self.contains(Self::SYNTHETIC)
    }

    pub fn is_constructor(self) -> bool {
        self.contains(Self::CONSTRUCTOR)
    }

    pub fn is_enum(self) -> bool {
        self.contains(Self::ENUM)
    }

    pub fn visibility(self) -> DexAccessFlags {
        self & Self::VISIBILITY_MASK
    }

    pub fn with_visibility(self, visibility: DexAccessFlags) -> DexAccessFlags {
        (self & !Self::VISIBILITY_MASK) | (visibility & Self::VISIBILITY_MASK)
    }

    pub fn set_visibility(&mut self, visibility: DexAccessFlags) {
        *self = self.with_visibility(visibility);
    }

    /// Renders the flags the way a disassembler would, in declaration order.
    pub fn to_modifier_string(self, kind: MemberKind) -> String {
        const NAMES: &[(u32, &str, &str)] = &[
            (0x1, "public", "public"),
            (0x2, "private", "private"),
            (0x4, "protected", "protected"),
            (0x8, "static", "static"),
            (0x10, "final", "final"),
            (0x20, "synchronized", "synchronized"),
            (0x40, "volatile", "bridge"),
            (0x80, "transient", "varargs"),
            (0x100, "native", "native"),
            (0x200, "interface", "interface"),
            (0x400, "abstract", "abstract"),
            (0x800, "strictfp", "strictfp"),
            (0x1000, "synthetic", "synthetic"),
            (0x2000, "annotation", "annotation"),
            (0x4000, "enum", "enum"),
            (0x10000, "constructor", "constructor"),
            (0x20000, "declared-synchronized", "declared-synchronized"),
        ];
        let bits = self.bits();
        NAMES
            .iter()
            .filter(|(bit, _, _)| bits & bit != 0)
            .filter(|(bit, _, _)| kind != MemberKind::Class || *bit != 0x20)
            .map(|(_, field_name, method_name)| match kind {
                MemberKind::Method => *method_name,
                _ => *field_name,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for DexAccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.bits())
    }
}
