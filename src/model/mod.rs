//! The program model: interned refs, access flags, and the class, field and
//! method definitions built on them.

pub mod access;
pub mod class;
pub mod descriptors;
pub mod pool;
pub mod resolver;
pub mod walk;

pub use access::DexAccessFlags;
pub use class::{build_class_scope, DexClass, DexField, DexMethod, DexStore, Scope};
pub use pool::{DexFieldRef, DexMethodRef, DexProto, DexString, DexType, DexTypeList};
pub use resolver::{MethodSearch, Resolver};
