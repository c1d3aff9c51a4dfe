//! Lowering errors
//!
//! Checked procedures should lower without incident; everything here is an
//! internal invariant violation (an AST shape the checker should not have
//! let through) and aborts lowering of the procedure that produced it.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LpvmError {
    #[error("internal: {0}")]
    Internal(String),

    #[error("internal: statement is not flat after unbranching: {0}")]
    NotFlat(String),

    #[error("internal: statement appended to a completed fork")]
    AppendAfterFork,

    #[error("internal: unknown foreign language {0} survived checking")]
    UnknownLang(Box<str>),
}

pub type LpvmResult<T> = Result<T, LpvmError>;
