use crate::SourceLocation;

/// An error raised while optimising assembly items.
///
/// [`StackTooDeep`](Self::StackTooDeep) and [`ItemNotAvailable`](Self::ItemNotAvailable) only
/// mean that a code generation attempt failed; the optimiser then keeps the original items.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OptimiserError {
    #[error("stack too deep")]
    StackTooDeep,
    #[error("item not available on the stack")]
    ItemNotAvailable,
    #[error("optimiser invariant violated: {0}")]
    Invariant(&'static str),
}

impl OptimiserError {
    /// Returns `true` if the error only aborts a single optimisation attempt.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StackTooDeep | Self::ItemNotAvailable)
    }
}

/// An error raised while serialising an assembly to bytecode.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("tag {0} does not exist")]
    UnknownTag(usize),
    #[error("foreign tag {tag} of sub-assembly {sub} used as a jump destination")]
    ForeignTag { sub: usize, tag: usize },
    #[error("sub-assembly {0} does not exist")]
    UnknownSubAssembly(usize),
    #[error("data {0:#x} does not exist")]
    UnknownData(alloy_primitives::U256),
    #[error("cannot serialise {item} at {location}")]
    InvalidItem { item: String, location: SourceLocation },
    #[error("bytecode too large")]
    CodeTooLarge,
}
