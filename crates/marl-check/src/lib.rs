//! # Marl type and mode checker
//!
//! Checks every procedure of a module in two phases: type inference (types
//! only, flow directions ignored) and mode checking (overload selection
//! from argument availability, flow rewriting, binding-state tracking).
//! Procedures are visited bottom-up by strongly-connected component of the
//! local call graph; cyclic components iterate until inferred parameter
//! types stop changing.
//!
//! Errors are collected per procedure rather than thrown; a procedure with
//! errors is recorded in [`CheckOutcome::failed`] so downstream passes can
//! skip it, and checking of the rest of the module continues.

pub mod binding;
pub mod error;
pub mod foreign;
pub mod infer;
pub mod modes;
pub mod scc;
pub mod typing;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use marl_ast::proc::{Module, ProcImpl, ProcSpec};
use marl_ast::types::TypeSpec;
use tracing::debug;

pub use error::{sort_errors, CheckError, ErrorKind};

use infer::Inferencer;
use modes::ModeChecker;

/// Final types of the variables of one procedure body
pub type VarTypes = BTreeMap<Box<str>, TypeSpec>;

/// Result of checking a whole module
#[derive(Debug, Default)]
pub struct CheckOutcome {
    /// All errors, in source-position order
    pub errors: Vec<CheckError>,
    /// Procedures that had errors and must not be lowered
    pub failed: BTreeSet<ProcSpec>,
    /// Per-procedure variable typings, for the lowering passes
    pub var_types: BTreeMap<ProcSpec, VarTypes>,
}

impl CheckOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate declarations: every parameter of a public procedure must have a
/// fully-resolved declared type.
pub fn validate_decls(module: &Module) -> Vec<CheckError> {
    let mut errors = Vec::new();
    for (name, defs) in &module.procs {
        for def in defs {
            if !def.public {
                continue;
            }
            for param in &def.proto.params {
                if !param.ty.is_fully_resolved() {
                    errors.push(CheckError::new(
                        ErrorKind::UndeclaredType {
                            name: name.clone(),
                            param: param.name.clone(),
                        },
                        def.pos.clone(),
                    ));
                }
            }
        }
    }
    errors
}

/// Type and mode check a whole module
pub fn check_module(module: &mut Module) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();
    outcome.errors = validate_decls(module);

    let graph = scc::local_call_graph(module);
    for component in scc::bottom_up_sccs(&graph) {
        debug!(target: "types", ?component, "checking component");
        let specs: Vec<ProcSpec> = component
            .iter()
            .flat_map(|name| {
                let path = module.path.clone();
                (0..module.candidates(name).len())
                    .map(move |id| ProcSpec::new(path.clone(), name.clone(), id))
            })
            .collect();

        // Iterate the component until parameter types reach a fixed point;
        // the cap guards against non-converging inference.
        let mut last: BTreeMap<ProcSpec, (Vec<CheckError>, VarTypes)> = BTreeMap::new();
        for _round in 0..=component.len() {
            let mut changed = false;
            for spec in &specs {
                let (proc_changed, errors, var_types) = check_proc(module, spec);
                changed |= proc_changed;
                last.insert(spec.clone(), (errors, var_types));
            }
            if !changed {
                break;
            }
        }
        for (spec, (errors, var_types)) in last {
            if !errors.is_empty() {
                outcome.failed.insert(spec.clone());
            }
            outcome.errors.extend(errors);
            outcome.var_types.insert(spec, var_types);
        }
    }

    sort_errors(&mut outcome.errors);
    outcome
}

/// Check one procedure. Returns whether its parameter types changed (which
/// forces another round over its component), the errors found, and the
/// final variable typing.
fn check_proc(module: &mut Module, spec: &ProcSpec) -> (bool, Vec<CheckError>, VarTypes) {
    let Some(def) = module.proc(spec) else {
        return (false, Vec::new(), VarTypes::new());
    };
    let ProcImpl::Source { body } = &def.body else {
        return (false, Vec::new(), VarTypes::new());
    };
    let body = body.clone();
    let proto = def.proto.clone();
    let detism = def.detism;

    // Phase 1: types only
    let mut inferencer = Inferencer::new(module);
    for param in &proto.params {
        inferencer
            .typing
            .declare_var(param.name.clone(), param.ty.clone());
    }
    inferencer.infer_body(&body);
    let (typing, mut errors) = inferencer.into_parts();

    // Phase 2: modes, with the inferred types in hand
    let mut checker = ModeChecker::new(module, typing);
    let (new_body, _exit) = checker.run(body, &proto, detism);
    let (mut typing, mode_errors) = checker.into_parts();
    errors.extend(mode_errors);

    // Refine this procedure's parameter types from the final typing
    let mut params = proto.params;
    let mut changed = false;
    for param in &mut params {
        let inferred = typing.resolve(&param.ty);
        let inferred = if inferred.is_any() || inferred.is_var() {
            typing.var_type(&param.name)
        } else {
            inferred
        };
        if !inferred.is_any() && inferred != param.ty {
            debug!(
                target: "types",
                proc = %proto.name,
                param = %param.name,
                ty = %inferred,
                "refined parameter type"
            );
            param.ty = inferred;
            changed = true;
        }
    }

    let var_names: Vec<Box<str>> = typing.known_vars().cloned().collect();
    let mut var_types = VarTypes::new();
    for var in var_names {
        let ty = typing.var_type(&var);
        var_types.insert(var, ty);
    }
    for param in &params {
        var_types
            .entry(param.name.clone())
            .or_insert_with(|| param.ty.clone());
    }

    let def = module.proc_mut(spec).expect("proc vanished during check");
    def.proto.params = params;
    def.body = ProcImpl::Source { body: new_body };
    (changed, errors, var_types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marl_ast::flow::Param;
    use marl_ast::pos::Placed;
    use marl_ast::proc::{ProcDef, ProcProto};
    use marl_ast::stmt::{Exp, Stmt};
    use marl_ast::types::{ModPath, TypeSpec};

    #[test]
    fn test_public_proc_with_undeclared_type_is_rejected() {
        let mut module = Module::new(ModPath::new(["m"]));
        let mut def = ProcDef::new(
            ProcProto::new("p", vec![Param::input("x", TypeSpec::Any)]),
            Vec::new(),
        );
        def.public = true;
        module.add_proc(def);
        let outcome = check_module(&mut module);
        assert!(outcome
            .errors
            .iter()
            .any(|e| matches!(e.kind, ErrorKind::UndeclaredType { .. })));
    }

    #[test]
    fn test_private_param_types_are_inferred_for_callers() {
        // helper(x, ?y) calls add; main calls helper. Checking bottom-up
        // must give helper int parameters before main is checked.
        let mut module = Module::new(ModPath::new(["m"]));
        module.add_proc(ProcDef::new(
            ProcProto::new(
                "add",
                vec![
                    Param::input("x", TypeSpec::int()),
                    Param::input("y", TypeSpec::int()),
                    Param::output("z", TypeSpec::int()),
                ],
            ),
            Vec::new(),
        ));
        module.add_proc(ProcDef::new(
            ProcProto::new(
                "helper",
                vec![
                    Param::input("x", TypeSpec::Any),
                    Param::output("y", TypeSpec::Any),
                ],
            ),
            vec![Placed::unplaced(Stmt::call(
                "add",
                vec![
                    Placed::unplaced(Exp::var_get("x")),
                    Placed::unplaced(Exp::Int(1)),
                    Placed::unplaced(Exp::var_set("y")),
                ],
            ))],
        ));
        module.add_proc(ProcDef::new(
            ProcProto::new(
                "main",
                vec![
                    Param::input("a", TypeSpec::Any),
                    Param::output("b", TypeSpec::Any),
                ],
            ),
            vec![Placed::unplaced(Stmt::call(
                "helper",
                vec![
                    Placed::unplaced(Exp::var_get("a")),
                    Placed::unplaced(Exp::var_unknown("b")),
                ],
            ))],
        ));

        let outcome = check_module(&mut module);
        assert!(outcome.is_clean(), "{:?}", outcome.errors);

        let helper = ProcSpec::new(module.path.clone(), "helper", 0);
        let helper = module.proc(&helper).unwrap();
        assert_eq!(helper.proto.params[0].ty, TypeSpec::int());
        assert_eq!(helper.proto.params[1].ty, TypeSpec::int());

        let main = ProcSpec::new(module.path.clone(), "main", 0);
        let main = module.proc(&main).unwrap();
        assert_eq!(main.proto.params[0].ty, TypeSpec::int());
        assert_eq!(main.proto.params[1].ty, TypeSpec::int());
    }

    #[test]
    fn test_failed_proc_is_marked() {
        let mut module = Module::new(ModPath::new(["m"]));
        module.add_proc(ProcDef::new(
            ProcProto::new("bad", vec![]),
            vec![Placed::unplaced(Stmt::call("nonesuch", vec![]))],
        ));
        let outcome = check_module(&mut module);
        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.is_clean());
    }
}
