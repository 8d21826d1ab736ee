use solgen_evmasm::{AssemblyError, OptimiserError, SourceLocation};

/// Result type of the code generator.
pub type Result<T, E = CompileError> = std::result::Result<T, E>;

/// A fatal error aborting the compilation of a contract.
///
/// No partial artifact is produced when any of these is returned.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A variable or temporary is out of reach of `DUP16`/`SWAP16`.
    #[error("stack too deep at {location}, try removing local variables")]
    StackTooDeep { location: SourceLocation },
    /// An invariant the generator relies on does not hold for the input tree.
    #[error("internal compiler error: {0}")]
    InternalCompilerError(String),
    /// The construct cannot be lowered yet.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error(transparent)]
    Optimiser(#[from] OptimiserError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}

impl CompileError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalCompilerError(message.into())
    }

    pub(crate) fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented(message.into())
    }
}

/// Returns an [`InternalCompilerError`](CompileError::InternalCompilerError) unless `cond`.
macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::CompileError::InternalCompilerError(format!($($msg)+)));
        }
    };
}
pub(crate) use ensure;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CompileError::StackTooDeep { location: SourceLocation::new(0, 4, 9) };
        assert!(err.to_string().starts_with("stack too deep"));
        assert_eq!(
            CompileError::unimplemented("modifiers").to_string(),
            "unimplemented: modifiers"
        );
        let err: CompileError = OptimiserError::Invariant("bad").into();
        assert_eq!(err.to_string(), "optimiser invariant violated: bad");
    }
}
