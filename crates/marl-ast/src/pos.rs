//! Source positions and placed nodes
//!
//! Every statement, expression, and primitive can carry an optional source
//! position so diagnostics stay anchored after several rewriting passes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a source file (1-based line and column)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePos {
    pub file: Box<str>,
    pub line: u32,
    pub col: u32,
}

impl SourcePos {
    pub fn new(file: impl Into<Box<str>>, line: u32, col: u32) -> Self {
        SourcePos {
            file: file.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// A node together with the position it came from, if known.
///
/// Generated code (lifted procedures, success flags, folded moves) has no
/// position of its own and inherits `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placed<T> {
    pub node: T,
    pub pos: Option<SourcePos>,
}

impl<T> Placed<T> {
    pub fn new(node: T, pos: Option<SourcePos>) -> Self {
        Placed { node, pos }
    }

    /// Wrap a node with no position
    pub fn unplaced(node: T) -> Self {
        Placed { node, pos: None }
    }

    /// Replace the node, keeping the position
    pub fn rewrap<U>(&self, node: U) -> Placed<U> {
        Placed {
            node,
            pos: self.pos.clone(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Placed<U> {
        Placed {
            node: f(self.node),
            pos: self.pos,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Placed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_display() {
        let pos = SourcePos::new("lists.marl", 14, 3);
        assert_eq!(pos.to_string(), "lists.marl:14:3");
    }

    #[test]
    fn test_rewrap_keeps_position() {
        let placed = Placed::new(1_i64, Some(SourcePos::new("m.marl", 2, 1)));
        let rewrapped = placed.rewrap("one");
        assert_eq!(rewrapped.pos, placed.pos);
        assert_eq!(rewrapped.node, "one");
    }
}
