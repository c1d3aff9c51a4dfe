//! Typing state and unification
//!
//! The typing of one procedure maps variables to type specs and type
//! variables to their bindings. Type-variable lookup follows transitive
//! bindings to a fixed point and compresses the path so later lookups are
//! one step. Unresolved overloaded calls are held as [`Alternative`]s and
//! narrowed as variable types become known.

use std::collections::HashMap;

use marl_ast::pos::SourcePos;
use marl_ast::types::TypeSpec;

use crate::error::{CheckError, ErrorKind};

/// An overloaded call whose candidates could not yet be told apart.
///
/// `vars` are the argument variables whose types remain ambiguous; each
/// entry of `tuples` is one still-consistent assignment of types to those
/// variables.
#[derive(Debug, Clone)]
pub struct Alternative {
    pub name: Box<str>,
    pub pos: Option<SourcePos>,
    pub vars: Vec<Box<str>>,
    pub tuples: Vec<Vec<TypeSpec>>,
}

/// Typing state of one procedure
#[derive(Debug, Default)]
pub struct Typing {
    var_types: HashMap<Box<str>, TypeSpec>,
    tyvar_bindings: HashMap<Box<str>, TypeSpec>,
    pub alternatives: Vec<Alternative>,
    /// Counter for freshening the type variables of generic callees
    fresh_counter: u32,
}

impl Typing {
    pub fn new() -> Self {
        Typing::default()
    }

    /// The current type of a program variable, fully resolved
    pub fn var_type(&mut self, name: &str) -> TypeSpec {
        match self.var_types.get(name) {
            Some(ty) => {
                let ty = ty.clone();
                self.resolve(&ty)
            }
            None => TypeSpec::Any,
        }
    }

    pub fn known_vars(&self) -> impl Iterator<Item = &Box<str>> {
        self.var_types.keys()
    }

    /// Set a variable's type without unifying (used for declared parameters)
    pub fn declare_var(&mut self, name: impl Into<Box<str>>, ty: TypeSpec) {
        self.var_types.insert(name.into(), ty);
    }

    /// Resolve a type through the type-variable bindings, compressing the
    /// paths walked.
    pub fn resolve(&mut self, ty: &TypeSpec) -> TypeSpec {
        match ty {
            TypeSpec::Var(name) => {
                let Some(bound) = self.tyvar_bindings.get(name.as_ref()).cloned() else {
                    return ty.clone();
                };
                let ultimate = self.resolve(&bound);
                if ultimate != bound {
                    self.tyvar_bindings
                        .insert(name.clone(), ultimate.clone());
                }
                ultimate
            }
            TypeSpec::Named {
                module,
                name,
                params,
            } => TypeSpec::Named {
                module: module.clone(),
                name: name.clone(),
                params: params.iter().map(|p| self.resolve(p)).collect(),
            },
            TypeSpec::Higher { modifiers, flows } => TypeSpec::Higher {
                modifiers: *modifiers,
                flows: flows
                    .iter()
                    .map(|f| marl_ast::types::TypeFlow::new(self.resolve(&f.ty), f.dir))
                    .collect(),
            },
            other => other.clone(),
        }
    }

    /// Unify two types. Returns the unified type, or the irreconcilable
    /// pair on failure.
    pub fn unify(&mut self, t1: &TypeSpec, t2: &TypeSpec) -> Result<TypeSpec, (TypeSpec, TypeSpec)> {
        let t1 = self.resolve(t1);
        let t2 = self.resolve(t2);
        match (&t1, &t2) {
            _ if t1 == t2 => Ok(t1),
            (TypeSpec::Invalid, _) | (_, TypeSpec::Invalid) => Ok(TypeSpec::Invalid),
            (TypeSpec::Any, _) => Ok(t2),
            (_, TypeSpec::Any) => Ok(t1),
            (TypeSpec::Var(v), _) => {
                self.tyvar_bindings.insert(v.clone(), t2.clone());
                Ok(t2)
            }
            (_, TypeSpec::Var(v)) => {
                self.tyvar_bindings.insert(v.clone(), t1.clone());
                Ok(t1)
            }
            (
                TypeSpec::Named {
                    module: m1,
                    name: n1,
                    params: p1,
                },
                TypeSpec::Named {
                    module: m2,
                    name: n2,
                    params: p2,
                },
            ) if m1 == m2 && n1 == n2 && p1.len() == p2.len() => {
                let mut params = Vec::with_capacity(p1.len());
                for (a, b) in p1.iter().zip(p2) {
                    params.push(self.unify(a, b).map_err(|_| (t1.clone(), t2.clone()))?);
                }
                Ok(TypeSpec::Named {
                    module: m1.clone(),
                    name: n1.clone(),
                    params,
                })
            }
            _ => Err((t1, t2)),
        }
    }

    /// Unify a program variable's type with another type, reporting a
    /// conflict (and poisoning the variable) on failure.
    pub fn unify_var(
        &mut self,
        var: &str,
        ty: &TypeSpec,
        pos: Option<&SourcePos>,
        errors: &mut Vec<CheckError>,
    ) {
        let current = self.var_type(var);
        match self.unify(&current, ty) {
            Ok(unified) => {
                self.var_types.insert(var.into(), unified);
            }
            Err((expected, found)) => {
                errors.push(CheckError::new(
                    ErrorKind::TypeConflict {
                        var: var.into(),
                        expected,
                        found,
                    },
                    pos.cloned(),
                ));
                self.var_types.insert(var.into(), TypeSpec::Invalid);
            }
        }
    }

    /// Rename the type variables of a callee's parameter type so separate
    /// call sites of a generic procedure do not share bindings.
    pub fn freshen(&mut self, ty: &TypeSpec) -> TypeSpec {
        let stamp = self.fresh_counter;
        self.freshen_with(ty, stamp)
    }

    /// Advance the freshening stamp; call once per call site
    pub fn next_call_site(&mut self) {
        self.fresh_counter += 1;
    }

    fn freshen_with(&mut self, ty: &TypeSpec, stamp: u32) -> TypeSpec {
        match ty {
            TypeSpec::Var(name) => TypeSpec::Var(format!("{}${}", name, stamp).into()),
            TypeSpec::Named {
                module,
                name,
                params,
            } => TypeSpec::Named {
                module: module.clone(),
                name: name.clone(),
                params: params.iter().map(|p| self.freshen_with(p, stamp)).collect(),
            },
            TypeSpec::Higher { modifiers, flows } => TypeSpec::Higher {
                modifiers: *modifiers,
                flows: flows
                    .iter()
                    .map(|f| {
                        marl_ast::types::TypeFlow::new(self.freshen_with(&f.ty, stamp), f.dir)
                    })
                    .collect(),
            },
            other => other.clone(),
        }
    }

    /// Narrow the recorded alternatives against current variable types to a
    /// fixed point: filter tuples, commit singletons, report empties as
    /// no-match and leftovers as ambiguous.
    pub fn narrow_alternatives(&mut self, errors: &mut Vec<CheckError>) {
        let mut alternatives = std::mem::take(&mut self.alternatives);
        loop {
            let mut changed = false;
            let mut remaining = Vec::new();
            for mut alt in alternatives {
                let var_types: Vec<TypeSpec> =
                    alt.vars.iter().map(|v| self.var_type(v)).collect();
                let before = alt.tuples.len();
                alt.tuples.retain(|tuple| {
                    tuple
                        .iter()
                        .zip(&var_types)
                        .all(|(ty, actual)| ty.compatible(actual))
                });
                if alt.tuples.len() != before {
                    changed = true;
                }
                match alt.tuples.len() {
                    0 => {
                        errors.push(CheckError::new(
                            ErrorKind::NoMatch {
                                name: alt.name.clone(),
                            },
                            alt.pos.clone(),
                        ));
                        changed = true;
                    }
                    1 => {
                        let tuple = alt.tuples.pop().expect("singleton");
                        for (var, ty) in alt.vars.iter().zip(&tuple) {
                            if !ty.is_any() {
                                let var = var.clone();
                                self.unify_var(&var, ty, alt.pos.as_ref(), errors);
                            }
                        }
                        changed = true;
                    }
                    _ => remaining.push(alt),
                }
            }
            alternatives = remaining;
            if !changed {
                break;
            }
        }
        for alt in alternatives {
            errors.push(CheckError::new(
                ErrorKind::AmbiguousCall {
                    name: alt.name.clone(),
                    count: alt.tuples.len(),
                },
                alt.pos,
            ));
        }
    }

    pub fn has_invalid(&self) -> bool {
        self.var_types.values().any(TypeSpec::is_invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_any_yields_other() {
        let mut typing = Typing::new();
        let unified = typing.unify(&TypeSpec::Any, &TypeSpec::int()).unwrap();
        assert_eq!(unified, TypeSpec::int());
    }

    #[test]
    fn test_unify_binds_type_var() {
        let mut typing = Typing::new();
        let var = TypeSpec::Var("T".into());
        typing.unify(&var, &TypeSpec::int()).unwrap();
        assert_eq!(typing.resolve(&var), TypeSpec::int());
    }

    #[test]
    fn test_path_compression() {
        let mut typing = Typing::new();
        // T -> U -> int; resolving T should shortcut straight to int
        typing
            .unify(&TypeSpec::Var("T".into()), &TypeSpec::Var("U".into()))
            .unwrap();
        typing
            .unify(&TypeSpec::Var("U".into()), &TypeSpec::int())
            .unwrap();
        assert_eq!(typing.resolve(&TypeSpec::Var("T".into())), TypeSpec::int());
        // After compression T points directly at int
        assert_eq!(
            typing.tyvar_bindings.get("T"),
            Some(&TypeSpec::int())
        );
    }

    #[test]
    fn test_unify_mismatch() {
        let mut typing = Typing::new();
        assert!(typing.unify(&TypeSpec::int(), &TypeSpec::float()).is_err());
    }

    #[test]
    fn test_var_conflict_reports_and_poisons() {
        let mut typing = Typing::new();
        let mut errors = Vec::new();
        typing.unify_var("x", &TypeSpec::int(), None, &mut errors);
        typing.unify_var("x", &TypeSpec::float(), None, &mut errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(typing.var_type("x"), TypeSpec::Invalid);
    }

    #[test]
    fn test_narrow_commits_singleton() {
        let mut typing = Typing::new();
        let mut errors = Vec::new();
        typing.declare_var("x", TypeSpec::float());
        typing.alternatives.push(Alternative {
            name: "f".into(),
            pos: None,
            vars: vec!["x".into(), "y".into()],
            tuples: vec![
                vec![TypeSpec::int(), TypeSpec::int()],
                vec![TypeSpec::float(), TypeSpec::float()],
            ],
        });
        typing.narrow_alternatives(&mut errors);
        assert!(errors.is_empty());
        assert_eq!(typing.var_type("y"), TypeSpec::float());
    }

    #[test]
    fn test_narrow_reports_empty_as_no_match() {
        let mut typing = Typing::new();
        let mut errors = Vec::new();
        typing.declare_var("x", TypeSpec::string());
        typing.alternatives.push(Alternative {
            name: "f".into(),
            pos: None,
            vars: vec!["x".into()],
            tuples: vec![vec![TypeSpec::int()], vec![TypeSpec::float()]],
        });
        typing.narrow_alternatives(&mut errors);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind, ErrorKind::NoMatch { .. }));
    }

    #[test]
    fn test_narrow_reports_ambiguous() {
        let mut typing = Typing::new();
        let mut errors = Vec::new();
        typing.alternatives.push(Alternative {
            name: "f".into(),
            pos: None,
            vars: vec!["x".into()],
            tuples: vec![vec![TypeSpec::int()], vec![TypeSpec::float()]],
        });
        typing.narrow_alternatives(&mut errors);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind, ErrorKind::AmbiguousCall { .. }));
    }
}
