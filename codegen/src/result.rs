//! Result and error types for the lowering passes.

use thiserror::Error;

/// An error detected while transforming or emitting a listing.
///
/// All of these are fatal to the current compilation: the passes never
/// silently produce incorrect code, they raise instead.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// A block was begun whose parent is not the currently active block.
    #[error("can not begin block {block}: the active block is {active}")]
    BlockBegin { block: u32, active: u32 },

    /// Mismatched or out-of-order block end.
    #[error("malformed block nesting: {0}")]
    BlockEnd(String),

    /// A variable was referenced from a block that is not a descendant of
    /// its declaring block.
    #[error("variable v{var} is not accessible from block {block}")]
    VariableUse { var: u32, block: u32 },

    /// `activate` on a variable that is not inactive, or twice.
    #[error("variable v{var}: {reason}")]
    VariableActivation { var: u32, reason: &'static str },

    /// A constant or layout exceeds what the backend can encode, even
    /// after all normalization attempts.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The requested target is not supported by this build.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    pub(crate) fn invalid(msg: impl Into<String>) -> CodegenError {
        CodegenError::InvalidValue(msg.into())
    }
}
