//! Binding state lattice
//!
//! Mode checking threads a [`BindingState`] through every program point: is
//! the point reachable, can execution here still succeed, and which
//! variables are definitely bound if it does. Joining alternation branches
//! intersects bound-variable sets; sequencing unions them.

use marl_ast::stmt::VarSet;

/// What is known about control and bindings at a program point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    /// Control cannot reach this point
    Impossible,
    /// Reachable, but cannot succeed from here
    Failing,
    /// Definitely succeeds, binding the given variables
    Succeeding(VarSet),
    /// May succeed (binding the given variables) or fail
    Possible(VarSet),
}

impl BindingState {
    /// Entry state of a body whose inputs are already bound
    pub fn entry<I, S>(bound: I) -> BindingState
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        BindingState::Succeeding(bound.into_iter().map(Into::into).collect())
    }

    pub fn is_reachable(&self) -> bool {
        !matches!(self, BindingState::Impossible)
    }

    pub fn can_succeed(&self) -> bool {
        matches!(
            self,
            BindingState::Succeeding(_) | BindingState::Possible(_)
        )
    }

    pub fn bound_vars(&self) -> Option<&VarSet> {
        match self {
            BindingState::Succeeding(vars) | BindingState::Possible(vars) => Some(vars),
            _ => None,
        }
    }

    pub fn is_bound(&self, var: &str) -> bool {
        self.bound_vars().is_some_and(|vars| vars.contains(var))
    }

    /// Record that a variable is now bound
    pub fn bind(&mut self, var: impl Into<Box<str>>) {
        if let BindingState::Succeeding(vars) | BindingState::Possible(vars) = self {
            vars.insert(var.into());
        }
    }

    pub fn bind_all<I, S>(&mut self, new: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        for var in new {
            self.bind(var);
        }
    }

    /// A statement that may fail has run: success is no longer certain
    pub fn may_fail(&mut self) {
        if let BindingState::Succeeding(vars) = self {
            *self = BindingState::Possible(std::mem::take(vars));
        }
    }

    /// Control diverges here (`Break`, `Next`, `Fail` have their own exits)
    pub fn make_impossible(&mut self) {
        *self = BindingState::Impossible;
    }

    /// Join two alternation exits: reachable if either is, certain only if
    /// both are, binding the intersection of the branch bindings.
    pub fn join(self, other: BindingState) -> BindingState {
        use BindingState::*;
        match (self, other) {
            (Impossible, s) | (s, Impossible) => s,
            (Failing, Failing) => Failing,
            (Failing, Succeeding(vars)) | (Succeeding(vars), Failing) => Possible(vars),
            (Failing, Possible(vars)) | (Possible(vars), Failing) => Possible(vars),
            (Succeeding(a), Succeeding(b)) => {
                Succeeding(a.intersection(&b).cloned().collect())
            }
            (Succeeding(a), Possible(b)) | (Possible(a), Succeeding(b)) => {
                Possible(a.intersection(&b).cloned().collect())
            }
            (Possible(a), Possible(b)) => Possible(a.intersection(&b).cloned().collect()),
        }
    }
}
