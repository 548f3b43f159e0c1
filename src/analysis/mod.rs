//! Whole-program method analyses: override relations, a call graph over
//! statically resolved invokes, and the escape and side-effect summaries
//! computed bottom-up along it.

pub mod call_graph;
pub mod escape;
pub mod override_graph;
pub mod side_effects;

pub use call_graph::{CallGraph, CallSite};
pub use escape::{EscapeSummary, FixpointIterator, ParamSet, FRESH_RETURN};
pub use override_graph::{build_graph, MethodOverrideGraph};
pub use side_effects::{Effects, SideEffectSummary};
