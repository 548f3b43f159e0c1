//! Method-IR: the editable form of a method body, its control flow graph,
//! and the bridges to and from Dex-IR.

pub mod balloon;
pub mod cfg;
pub mod code;
pub mod instruction;
pub mod list;
pub mod opcode;
pub mod sync;

pub use balloon::balloon;
pub use code::{AsmItem, IRCode};
pub use instruction::{IRInstruction, Reg};
pub use opcode::IROpcode;
pub use sync::sync;
