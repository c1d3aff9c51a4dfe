//! Source-level statements and expressions
//!
//! This is the form the middle-end receives from upstream scope resolution.
//! Statements are a closed variant; passes pattern match at the top level
//! rather than dispatching through traits. `Case` and `For` are eliminated
//! by upstream flattening and must not reach the core passes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::flow::{FlowDirection, Param, ResourceName};
use crate::pos::Placed;
use crate::proc::ProcSpec;
use crate::types::{Determinism, ModPath, ProcModifiers, TypeSpec};

/// Set of variable names, ordered for reproducible output
pub type VarSet = BTreeSet<Box<str>>;

/// An argument or test expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exp {
    /// A variable reference with its data-flow direction
    Var { name: Box<str>, flow: FlowDirection },

    /// Integer literal
    Int(i64),

    /// Float literal
    Float(f64),

    /// String literal
    Str(Box<str>),

    /// Character literal
    Char(char),

    /// An expression with a declared or cast type
    Typed {
        exp: Box<Placed<Exp>>,
        ty: TypeSpec,
        cast: bool,
    },

    /// An anonymous procedure expression, hoisted to a `Closure` procedure
    /// during unbranching
    AnonProc {
        modifiers: ProcModifiers,
        params: Vec<Param>,
        body: Vec<Placed<Stmt>>,
    },

    /// A (possibly partial) reference to a named procedure
    ProcRef {
        spec: ProcSpec,
        args: Vec<Placed<Exp>>,
    },
}

impl Exp {
    pub fn var(name: impl Into<Box<str>>, flow: FlowDirection) -> Exp {
        Exp::Var {
            name: name.into(),
            flow,
        }
    }

    /// A variable read
    pub fn var_get(name: impl Into<Box<str>>) -> Exp {
        Exp::var(name, FlowDirection::In)
    }

    /// A variable assignment target
    pub fn var_set(name: impl Into<Box<str>>) -> Exp {
        Exp::var(name, FlowDirection::Out)
    }

    /// A variable whose direction mode checking must determine
    pub fn var_unknown(name: impl Into<Box<str>>) -> Exp {
        Exp::var(name, FlowDirection::Unknown)
    }

    /// The variable name, if this is a (possibly typed) variable
    pub fn var_name(&self) -> Option<&str> {
        match self {
            Exp::Var { name, .. } => Some(name),
            Exp::Typed { exp, .. } => exp.node.var_name(),
            _ => None,
        }
    }

    /// The flow direction, treating literals as inputs
    pub fn flow(&self) -> FlowDirection {
        match self {
            Exp::Var { flow, .. } => *flow,
            Exp::Typed { exp, .. } => exp.node.flow(),
            _ => FlowDirection::In,
        }
    }

    /// Rewrite the flow direction of a variable expression
    pub fn set_flow(&mut self, new: FlowDirection) {
        match self {
            Exp::Var { flow, .. } => *flow = new,
            Exp::Typed { exp, .. } => exp.node.set_flow(new),
            _ => {}
        }
    }
}

/// A call to a (possibly overloaded) procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Module qualifier; empty means unqualified
    pub module: ModPath,
    pub name: Box<str>,
    /// Resolved overload, filled in by type checking
    pub proc_id: Option<usize>,
    /// Determinism of this call site
    pub detism: Determinism,
    /// Whether the call may use resources from the enclosing scope
    pub resourceful: bool,
    pub args: Vec<Placed<Exp>>,
}

impl Call {
    pub fn new(name: impl Into<Box<str>>, args: Vec<Placed<Exp>>) -> Call {
        Call {
            module: ModPath::default(),
            name: name.into(),
            proc_id: None,
            detism: Determinism::Det,
            resourceful: false,
            args,
        }
    }

    pub fn test(name: impl Into<Box<str>>, args: Vec<Placed<Exp>>) -> Call {
        Call {
            detism: Determinism::SemiDet,
            ..Call::new(name, args)
        }
    }
}

/// A statement in a procedure body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Procedure call
    Call(Call),

    /// Foreign / low-level instruction
    Foreign {
        lang: Box<str>,
        name: Box<str>,
        flags: Vec<Box<str>>,
        args: Vec<Placed<Exp>>,
    },

    /// Test of a boolean expression; the body fails if it is false
    TestBool(Exp),

    /// Conjunction of tests
    And(Vec<Placed<Stmt>>),

    /// Disjunction of alternatives, with the variables bound by every
    /// alternative cached by mode checking
    Or(Vec<Placed<Stmt>>, Option<VarSet>),

    /// Negation of a test
    Not(Box<Placed<Stmt>>),

    /// Conditional. `test_vars` caches the variables bound by the
    /// condition, `exit_vars` the variables bound however the conditional
    /// exits; both are filled by mode checking.
    Cond {
        test: Box<Placed<Stmt>>,
        then_branch: Vec<Placed<Stmt>>,
        else_branch: Vec<Placed<Stmt>>,
        test_vars: Option<VarSet>,
        exit_vars: Option<VarSet>,
    },

    /// Loop until `Break`; `exit_vars` caches the variables bound on every
    /// path to a `Break`
    Loop {
        body: Vec<Placed<Stmt>>,
        exit_vars: Option<VarSet>,
    },

    /// Scope in which the named resources are available
    UseResources {
        resources: Vec<ResourceName>,
        body: Vec<Placed<Stmt>>,
    },

    /// Multi-way match; eliminated by upstream flattening
    Case {
        exp: Placed<Exp>,
        cases: Vec<(Placed<Exp>, Vec<Placed<Stmt>>)>,
        default: Option<Vec<Placed<Stmt>>>,
    },

    /// Iteration over a generator; eliminated by upstream flattening
    For {
        generators: Vec<(Placed<Exp>, Placed<Exp>)>,
        body: Vec<Placed<Stmt>>,
    },

    /// Do nothing
    Nop,

    /// Fail the enclosing test context
    Fail,

    /// Leave the enclosing loop
    Break,

    /// Restart the enclosing loop
    Next,
}

impl Stmt {
    pub fn call(name: impl Into<Box<str>>, args: Vec<Placed<Exp>>) -> Stmt {
        Stmt::Call(Call::new(name, args))
    }

    pub fn foreign(
        lang: impl Into<Box<str>>,
        name: impl Into<Box<str>>,
        args: Vec<Placed<Exp>>,
    ) -> Stmt {
        Stmt::Foreign {
            lang: lang.into(),
            name: name.into(),
            flags: Vec::new(),
            args,
        }
    }

    pub fn cond(test: Stmt, then_branch: Vec<Placed<Stmt>>, else_branch: Vec<Placed<Stmt>>) -> Stmt {
        Stmt::Cond {
            test: Box::new(Placed::unplaced(test)),
            then_branch,
            else_branch,
            test_vars: None,
            exit_vars: None,
        }
    }

    /// Whether this statement is already primitive (no structured control)
    pub fn is_flat(&self) -> bool {
        matches!(self, Stmt::Call(_) | Stmt::Foreign { .. } | Stmt::Nop)
    }
}
