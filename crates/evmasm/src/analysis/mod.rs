//! Symbolic analysis: expression equivalence classes and known machine state.

mod expression_classes;
pub use expression_classes::{ClassId, ClassIds, Expression, ExpressionClasses};

mod known_state;
pub use known_state::{KnownState, StoreOperation, StoreTarget};

pub(crate) mod rules;
