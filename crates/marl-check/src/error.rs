//! Type and mode checking errors
//!
//! Errors are collected, not thrown: each procedure accumulates a list and
//! checking continues with best-effort fallback (types left `Any` or
//! `Invalid`, flows left `Unknown`). Only `Internal` marks an invariant
//! violation - an AST shape that upstream flattening should have removed.

use std::fmt;

use marl_ast::pos::SourcePos;
use marl_ast::types::{Determinism, TypeSpec};
use thiserror::Error;

/// What went wrong
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    #[error("type conflict for {var}: expected {expected}, found {found}")]
    TypeConflict {
        var: Box<str>,
        expected: TypeSpec,
        found: TypeSpec,
    },

    #[error("unknown variable {0}")]
    UnknownVariable(Box<str>),

    #[error("input {var} used before it is bound")]
    UninitedInput { var: Box<str> },

    #[error("argument {var} has the wrong flow direction for every mode of {name}")]
    UndefinedFlow { name: Box<str>, var: Box<str> },

    #[error("no procedure {name} takes {found} arguments")]
    ArityMismatch { name: Box<str>, found: usize },

    #[error("ambiguous call to {name}: {count} candidates remain")]
    AmbiguousCall { name: Box<str>, count: usize },

    #[error("no matching definition of {name} for these argument types")]
    NoMatch { name: Box<str> },

    #[error("call to unknown procedure {0}")]
    UnknownProc(Box<str>),

    #[error("{callee} call to {name} in a {context} context")]
    DetismViolation {
        name: Box<str>,
        callee: Determinism,
        context: Determinism,
    },

    #[error("condition tests a value of type {found}, not bool")]
    TestNotBool { found: TypeSpec },

    #[error("break or next outside a loop")]
    LoopExitOutsideLoop,

    #[error("unknown foreign language {0}")]
    UnknownForeignLang(Box<str>),

    #[error("unknown foreign {lang} operation {name}")]
    UnknownForeignOp { lang: Box<str>, name: Box<str> },

    #[error("foreign {name} takes {expected} arguments, found {found}")]
    ForeignArity {
        name: Box<str>,
        expected: usize,
        found: usize,
    },

    #[error("foreign {name} argument {index} should be {expected}, found {found}")]
    ForeignArgFamily {
        name: Box<str>,
        index: usize,
        expected: &'static str,
        found: TypeSpec,
    },

    #[error("output resource {0} is never bound")]
    ResourceNotBound(Box<str>),

    #[error("call to {name} needs resource {resource}, which is not available here")]
    ResourceUnavail { name: Box<str>, resource: Box<str> },

    #[error("output parameter {0} is never bound")]
    OutputUnbound(Box<str>),

    #[error("public procedure {name} has parameter {param} with no declared type")]
    UndeclaredType { name: Box<str>, param: Box<str> },

    #[error("internal: {0}")]
    Internal(String),
}

/// An error with the source position it was discovered at
#[derive(Debug, Clone, PartialEq)]
pub struct CheckError {
    pub kind: ErrorKind,
    pub pos: Option<SourcePos>,
}

impl CheckError {
    pub fn new(kind: ErrorKind, pos: Option<SourcePos>) -> Self {
        CheckError { kind, pos }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "{}: {}", pos, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Sort errors into reporting order: source position first, then emission
/// order (the sort is stable) for errors with no position.
pub fn sort_errors(errors: &mut [CheckError]) {
    errors.sort_by(|a, b| match (&a.pos, &b.pos) {
        (Some(pa), Some(pb)) => pa.cmp(pb),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let err = CheckError::new(
            ErrorKind::UnknownVariable("x".into()),
            Some(SourcePos::new("m.marl", 3, 7)),
        );
        assert_eq!(err.to_string(), "m.marl:3:7: unknown variable x");
    }

    #[test]
    fn test_sort_positions_first() {
        let mut errors = vec![
            CheckError::new(ErrorKind::UnknownVariable("a".into()), None),
            CheckError::new(
                ErrorKind::UnknownVariable("b".into()),
                Some(SourcePos::new("m.marl", 9, 1)),
            ),
            CheckError::new(
                ErrorKind::UnknownVariable("c".into()),
                Some(SourcePos::new("m.marl", 2, 1)),
            ),
        ];
        sort_errors(&mut errors);
        assert_eq!(
            errors[0].kind,
            ErrorKind::UnknownVariable("c".into())
        );
        assert!(errors[2].pos.is_none());
    }
}
