//! Optimiser passes over assembly items.
//!
//! Every pass but the constant optimiser works on a single item list;
//! [`Assembly::optimise`](crate::Assembly::optimise) combines them into rounds and runs the
//! constant optimiser once at the end.

mod cfg;
pub use cfg::{BasicBlock, BlockEnd, BlockId, ControlFlowGraph};

mod constant;
pub use constant::ConstantOptimiser;

mod cse;
pub use cse::{CommonSubexpressionEliminator, CseCodeGenerator};

mod dedup;
pub use dedup::{BlockDeduplicator, apply_tag_replacement};

mod inliner;
pub use inliner::Inliner;

mod jumpdest;
pub use jumpdest::{JumpdestRemover, referenced_tags};

mod peephole;
pub use peephole::PeepholeOptimiser;
