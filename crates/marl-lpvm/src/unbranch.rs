//! Unbranching: flattening structured control flow
//!
//! Consumes a type-and-mode-checked body and produces a flat statement
//! sequence where every non-final statement is a call, foreign call, or
//! `Nop`, and the only branching left is a terminal conditional testing a
//! single boolean variable. Loops and non-trivial continuations are lifted
//! into fresh `Generated` procedures; `SemiDet` procedures gain a trailing
//! boolean output that success paths set to true and failure paths to
//! false.

use std::collections::BTreeSet;
use std::rc::Rc;

use marl_ast::flow::{ArgFlowType, FlowDirection, Param};
use marl_ast::pos::Placed;
use marl_ast::proc::{Module, ProcDef, ProcImpl, ProcProto, ProcSpec, ProcVariant};
use marl_ast::stmt::{Call, Exp, Stmt, VarSet};
use marl_ast::types::{Determinism, ModPath, TypeFlow, TypeSpec};
use marl_check::VarTypes;
use tracing::debug;

use crate::error::{LpvmError, LpvmResult};

/// Continuations at most this heavy (in flat statements, branches included)
/// are duplicated inline; heavier ones are lifted into a fresh procedure.
pub const CONT_INLINE_LIMIT: usize = 4;

/// Name of the success output appended to lowered `SemiDet` procedures
pub const SUCCESS_VAR: &str = "success$";

/// A flattened statement sequence ready to be spliced into a branch
type Cont = Rc<Vec<Placed<Stmt>>>;

fn realize(cont: &Cont) -> Vec<Placed<Stmt>> {
    cont.as_ref().clone()
}

#[derive(Clone)]
struct LoopFrame {
    next_call: Placed<Stmt>,
    brk_call: Placed<Stmt>,
}

pub struct Unbrancher<'a> {
    module_path: ModPath,
    base_name: Box<str>,
    /// Output parameters of the enclosing procedure
    outputs: Vec<Param>,
    var_types: &'a mut VarTypes,
    temp_count: u32,
    gen_count: u32,
    loops: Vec<LoopFrame>,
    pub new_procs: Vec<ProcDef>,
}

/// Unbranch one procedure in place, returning the procedures generated for
/// its loops and continuations (their bodies are already flat).
pub fn unbranch_proc(
    def: &mut ProcDef,
    module_path: &ModPath,
    var_types: &mut VarTypes,
) -> LpvmResult<Vec<ProcDef>> {
    let ProcImpl::Source { body } = &def.body else {
        return Ok(Vec::new());
    };
    let body = body.clone();

    // SemiDet lowering: the procedure becomes Det over an explicit flag
    let (cont, fail): (Cont, Option<Cont>) = if def.detism == Determinism::SemiDet {
        def.proto
            .params
            .push(Param::output(SUCCESS_VAR, TypeSpec::bool()));
        def.detism = Determinism::Det;
        var_types.insert(SUCCESS_VAR.into(), TypeSpec::bool());
        (
            Rc::new(vec![set_flag(true)]),
            Some(Rc::new(vec![set_flag(false)])),
        )
    } else {
        (Rc::new(Vec::new()), None)
    };

    let mut ub = Unbrancher {
        module_path: module_path.clone(),
        base_name: def.name.clone(),
        outputs: def.proto.outputs().cloned().collect(),
        var_types,
        temp_count: def.temp_count,
        gen_count: 0,
        loops: Vec::new(),
        new_procs: Vec::new(),
    };
    let mut bound: VarSet = def.proto.inputs().map(|p| p.name.clone()).collect();
    let flat = ub.ub_stmts(&body, &mut bound, cont, fail)?;
    debug!(target: "unbranch", proc = %def.name, generated = ub.new_procs.len(), "unbranched");

    def.temp_count = ub.temp_count;
    def.body = ProcImpl::Source { body: flat };
    Ok(ub.new_procs)
}

/// `foreign llvm move(flag, ?success$)`
fn set_flag(value: bool) -> Placed<Stmt> {
    Placed::unplaced(Stmt::foreign(
        "llvm",
        "move",
        vec![
            Placed::unplaced(Exp::Typed {
                exp: Box::new(Placed::unplaced(Exp::Int(value as i64))),
                ty: TypeSpec::bool(),
                cast: false,
            }),
            Placed::unplaced(Exp::var_set(SUCCESS_VAR)),
        ],
    ))
}

impl<'a> Unbrancher<'a> {
    fn ub_stmts(
        &mut self,
        stmts: &[Placed<Stmt>],
        bound: &mut VarSet,
        cont: Cont,
        fail: Option<Cont>,
    ) -> LpvmResult<Vec<Placed<Stmt>>> {
        let Some((first, rest)) = stmts.split_first() else {
            return Ok(realize(&cont));
        };
        let pos = first.pos.clone();
        match &first.node {
            Stmt::Nop => self.ub_stmts(rest, bound, cont, fail),

            Stmt::Call(call) if call.detism == Determinism::SemiDet => {
                let Some(fail) = fail else {
                    return Err(LpvmError::Internal(format!(
                        "test call {} in a deterministic context",
                        call.name
                    )));
                };
                // The callee is lowered to produce an explicit success flag
                let succ = self.fresh_tmp(TypeSpec::bool());
                let mut lowered = call.clone();
                lowered.detism = Determinism::Det;
                lowered
                    .args
                    .push(Placed::unplaced(Exp::var_set(succ.clone())));
                bound.insert(succ.clone());

                let then_flat =
                    self.ub_stmts(rest, &mut bound.clone(), cont, Some(fail.clone()))?;
                let else_flat = realize(&fail);
                Ok(vec![
                    Placed::new(Stmt::Call(lowered), pos.clone()),
                    Placed::new(terminal_cond(&succ, then_flat, else_flat), pos),
                ])
            }

            Stmt::Call(_) | Stmt::Foreign { .. } => {
                bind_stmt_outputs(&first.node, bound);
                let mut out = vec![first.clone()];
                out.extend(self.ub_stmts(rest, bound, cont, fail)?);
                Ok(out)
            }

            Stmt::TestBool(exp) => {
                let Some(fail) = fail else {
                    return Err(LpvmError::Internal(
                        "test in a deterministic context".into(),
                    ));
                };
                let (mut out, var) = self.test_var(exp, bound);
                let then_flat =
                    self.ub_stmts(rest, &mut bound.clone(), cont, Some(fail.clone()))?;
                let else_flat = realize(&fail);
                out.push(Placed::new(terminal_cond(&var, then_flat, else_flat), pos));
                Ok(out)
            }

            Stmt::And(body) => {
                let combined: Vec<Placed<Stmt>> =
                    body.iter().chain(rest.iter()).cloned().collect();
                self.ub_stmts(&combined, bound, cont, fail)
            }

            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                test_vars,
                exit_vars,
            } => {
                let mut after_bound = bound.clone();
                after_bound.extend(exit_vars.clone().unwrap_or_default());
                let k = self.make_cont(rest, &after_bound, &cont, &fail)?;

                let mut then_bound = bound.clone();
                then_bound.extend(test_vars.clone().unwrap_or_default());
                let then_flat =
                    self.ub_stmts(then_branch, &mut then_bound, k.clone(), fail.clone())?;
                let else_flat =
                    self.ub_stmts(else_branch, &mut bound.clone(), k, fail.clone())?;

                // The condition is a test: its success continuation is the
                // then branch, its failure continuation the else branch.
                self.ub_stmts(
                    std::slice::from_ref(test.as_ref()),
                    bound,
                    Rc::new(then_flat),
                    Some(Rc::new(else_flat)),
                )
            }

            Stmt::Or(alts, exit_vars) => {
                let mut after_bound = bound.clone();
                after_bound.extend(exit_vars.clone().unwrap_or_default());
                let k = self.make_cont(rest, &after_bound, &cont, &fail)?;

                // Build right to left: each alternative fails into the next
                let mut current: Option<Vec<Placed<Stmt>>> = None;
                for alt in alts.iter().rev() {
                    let alt_fail = match current {
                        Some(flat) => Some(self.cont_of(flat, bound)?),
                        None => fail.clone(),
                    };
                    current = Some(self.ub_stmts(
                        std::slice::from_ref(alt),
                        &mut bound.clone(),
                        k.clone(),
                        alt_fail,
                    )?);
                }
                match current {
                    Some(flat) => Ok(flat),
                    // An empty disjunction can never succeed
                    None => Ok(fail.as_ref().map(realize).unwrap_or_else(|| realize(&k))),
                }
            }

            Stmt::Not(inner) => {
                let Some(fail) = fail.clone() else {
                    return Err(LpvmError::Internal(
                        "negation in a deterministic context".into(),
                    ));
                };
                let k = self.make_cont(rest, bound, &cont, &Some(fail.clone()))?;
                // Success of the inner test fails the negation and vice versa
                self.ub_stmts(
                    std::slice::from_ref(inner.as_ref()),
                    &mut bound.clone(),
                    fail,
                    Some(k),
                )
            }

            Stmt::Loop { body, exit_vars } => {
                let mut brk_bound = bound.clone();
                brk_bound.extend(exit_vars.clone().unwrap_or_default());
                let brk_flat =
                    self.ub_stmts(rest, &mut brk_bound.clone(), cont, fail.clone())?;
                let brk_call = self.lift("brk", brk_flat, &brk_bound);

                let next_name = self.gen_name("next");
                let next_call = self.call_to(&next_name, bound);
                self.loops.push(LoopFrame {
                    next_call: next_call.clone(),
                    brk_call,
                });
                let next_cont: Cont = Rc::new(vec![next_call.clone()]);
                let body_flat = self.ub_stmts(body, &mut bound.clone(), next_cont, fail)?;
                self.loops.pop();
                self.push_proc(next_name, body_flat, bound);
                Ok(vec![next_call])
            }

            Stmt::Break => {
                let frame = self
                    .loops
                    .last()
                    .ok_or_else(|| LpvmError::Internal("break outside a loop".into()))?;
                Ok(vec![frame.brk_call.clone()])
            }

            Stmt::Next => {
                let frame = self
                    .loops
                    .last()
                    .ok_or_else(|| LpvmError::Internal("next outside a loop".into()))?;
                Ok(vec![frame.next_call.clone()])
            }

            Stmt::Fail => match fail {
                Some(fail) => Ok(realize(&fail)),
                None => Err(LpvmError::Internal(
                    "fail in a deterministic context".into(),
                )),
            },

            Stmt::UseResources { body, .. } => {
                // Resource scoping was checked; nothing remains to enforce
                let combined: Vec<Placed<Stmt>> =
                    body.iter().chain(rest.iter()).cloned().collect();
                self.ub_stmts(&combined, bound, cont, fail)
            }

            Stmt::Case { .. } | Stmt::For { .. } => Err(LpvmError::NotFlat(
                "case/for statement survived flattening".into(),
            )),
        }
    }

    /// Flatten the statements following a branch point into a continuation,
    /// lifting it into a fresh procedure when it is too heavy to duplicate.
    fn make_cont(
        &mut self,
        rest: &[Placed<Stmt>],
        bound: &VarSet,
        cont: &Cont,
        fail: &Option<Cont>,
    ) -> LpvmResult<Cont> {
        if rest.is_empty() {
            return Ok(cont.clone());
        }
        let flat = self.ub_stmts(rest, &mut bound.clone(), cont.clone(), fail.clone())?;
        self.cont_of(flat, bound)
    }

    fn cont_of(&mut self, flat: Vec<Placed<Stmt>>, bound: &VarSet) -> LpvmResult<Cont> {
        if stmt_weight(&flat) <= CONT_INLINE_LIMIT {
            Ok(Rc::new(flat))
        } else {
            Ok(Rc::new(vec![self.lift("cont", flat, bound)]))
        }
    }

    /// Move a lifted body into a fresh procedure and return the call to it
    fn lift(&mut self, kind: &str, flat: Vec<Placed<Stmt>>, bound: &VarSet) -> Placed<Stmt> {
        let name = self.gen_name(kind);
        let call = self.call_to(&name, bound);
        self.push_proc(name, flat, bound);
        call
    }

    fn gen_name(&mut self, kind: &str) -> Box<str> {
        let name = format!("{}#{}{}", self.base_name, kind, self.gen_count);
        self.gen_count += 1;
        name.into()
    }

    /// A call to a generated procedure: the variables bound at the lift
    /// point flow in, the enclosing procedure's still-unbound outputs flow
    /// out.
    fn call_to(&self, name: &str, bound: &VarSet) -> Placed<Stmt> {
        let mut args: Vec<Placed<Exp>> = bound
            .iter()
            .map(|v| Placed::unplaced(Exp::var_get(v.clone())))
            .collect();
        for output in &self.outputs {
            if !bound.contains(&output.name) {
                args.push(Placed::unplaced(Exp::var_set(output.name.clone())));
            }
        }
        let mut call = Call::new(name, args);
        call.module = self.module_path.clone();
        call.proc_id = Some(0);
        Placed::unplaced(Stmt::Call(call))
    }

    fn push_proc(&mut self, name: Box<str>, body: Vec<Placed<Stmt>>, bound: &VarSet) {
        let mut params: Vec<Param> = bound
            .iter()
            .map(|v| {
                Param::input(
                    v.clone(),
                    self.var_types.get(v).cloned().unwrap_or(TypeSpec::Any),
                )
            })
            .collect();
        for output in &self.outputs {
            if !bound.contains(&output.name) {
                params.push(output.clone());
            }
        }
        let mut def = ProcDef::new(ProcProto::new(name, params), body);
        def.variant = ProcVariant::Generated;
        def.temp_count = self.temp_count;
        self.new_procs.push(def);
    }

    fn fresh_tmp(&mut self, ty: TypeSpec) -> Box<str> {
        let name: Box<str> = format!("tmp${}", self.temp_count).into();
        self.temp_count += 1;
        self.var_types.insert(name.clone(), ty);
        name
    }

    /// Reduce a tested expression to a boolean variable, inserting a move
    /// when it is not one already.
    fn test_var(&mut self, exp: &Exp, bound: &mut VarSet) -> (Vec<Placed<Stmt>>, Box<str>) {
        if let Some(name) = exp.var_name() {
            return (Vec::new(), name.into());
        }
        let tmp = self.fresh_tmp(TypeSpec::bool());
        bound.insert(tmp.clone());
        let mov = Stmt::foreign(
            "llvm",
            "move",
            vec![
                Placed::unplaced(exp.clone()),
                Placed::unplaced(Exp::var_set(tmp.clone())),
            ],
        );
        (vec![Placed::unplaced(mov)], tmp)
    }
}

/// A conditional in final form: a single boolean-variable test
fn terminal_cond(var: &str, then_flat: Vec<Placed<Stmt>>, else_flat: Vec<Placed<Stmt>>) -> Stmt {
    Stmt::Cond {
        test: Box::new(Placed::unplaced(Stmt::TestBool(Exp::var_get(var)))),
        then_branch: then_flat,
        else_branch: else_flat,
        test_vars: None,
        exit_vars: None,
    }
}

fn bind_stmt_outputs(stmt: &Stmt, bound: &mut VarSet) {
    let args = match stmt {
        Stmt::Call(call) => &call.args,
        Stmt::Foreign { args, .. } => args,
        _ => return,
    };
    for arg in args {
        if arg.node.flow().is_out() {
            if let Some(var) = arg.node.var_name() {
                bound.insert(var.into());
            }
        }
    }
}

/// Total number of flat statements, counting both branches of conditionals
fn stmt_weight(stmts: &[Placed<Stmt>]) -> usize {
    stmts
        .iter()
        .map(|s| match &s.node {
            Stmt::Cond {
                then_branch,
                else_branch,
                ..
            } => 1 + stmt_weight(then_branch) + stmt_weight(else_branch),
            _ => 1,
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Closure hoisting
// ---------------------------------------------------------------------------

/// Hoist every anonymous procedure expression in the module to a top-level
/// `Closure` procedure whose leading parameters are the captured variables.
/// Runs before checking so the hoisted procedures are typed and moded like
/// any other.
pub fn hoist_closures(module: &mut Module) {
    let specs = module.proc_specs();
    for spec in specs {
        let Some(def) = module.proc_mut(&spec) else {
            continue;
        };
        let ProcImpl::Source { body } = &mut def.body else {
            continue;
        };
        let mut body = std::mem::take(body);
        let base: Box<str> = def.name.clone();
        let mut hoisted: Vec<ProcDef> = Vec::new();
        let mut counter = 0usize;
        hoist_in_stmts(&mut body, module.path.clone(), &base, &mut counter, &mut hoisted);

        let Some(def) = module.proc_mut(&spec) else {
            continue;
        };
        def.body = ProcImpl::Source { body };
        for new_def in hoisted {
            module.add_proc(new_def);
        }
    }
}

fn hoist_in_stmts(
    stmts: &mut [Placed<Stmt>],
    module_path: ModPath,
    base: &str,
    counter: &mut usize,
    out: &mut Vec<ProcDef>,
) {
    for stmt in stmts {
        match &mut stmt.node {
            Stmt::Call(call) => {
                hoist_in_exps(&mut call.args, module_path.clone(), base, counter, out)
            }
            Stmt::Foreign { args, .. } => {
                hoist_in_exps(args, module_path.clone(), base, counter, out)
            }
            Stmt::And(body) | Stmt::Or(body, _) | Stmt::Loop { body, .. } => {
                hoist_in_stmts(body, module_path.clone(), base, counter, out)
            }
            Stmt::Not(inner) => hoist_in_stmts(
                std::slice::from_mut(inner.as_mut()),
                module_path.clone(),
                base,
                counter,
                out,
            ),
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                hoist_in_stmts(
                    std::slice::from_mut(test.as_mut()),
                    module_path.clone(),
                    base,
                    counter,
                    out,
                );
                hoist_in_stmts(then_branch, module_path.clone(), base, counter, out);
                hoist_in_stmts(else_branch, module_path.clone(), base, counter, out);
            }
            Stmt::UseResources { body, .. } => {
                hoist_in_stmts(body, module_path.clone(), base, counter, out)
            }
            _ => {}
        }
    }
}

fn hoist_in_exps(
    args: &mut [Placed<Exp>],
    module_path: ModPath,
    base: &str,
    counter: &mut usize,
    out: &mut Vec<ProcDef>,
) {
    for arg in args {
        if let Exp::Typed { exp, .. } = &mut arg.node {
            hoist_in_exps(
                std::slice::from_mut(exp.as_mut()),
                module_path.clone(),
                base,
                counter,
                out,
            );
            continue;
        }
        let Exp::AnonProc {
            modifiers,
            params,
            body,
        } = &mut arg.node
        else {
            continue;
        };

        let free = free_vars(params, body);
        let name: Box<str> = format!("{}#closure{}", base, counter).into();
        *counter += 1;

        // Captured variables become leading Free parameters
        let mut proc_params: Vec<Param> = free
            .iter()
            .map(|v| Param {
                name: v.clone(),
                ty: TypeSpec::Any,
                flow: FlowDirection::In,
                kind: ArgFlowType::Free,
            })
            .collect();
        proc_params.extend(params.iter().cloned());

        let mut def = ProcDef::new(
            ProcProto::new(name.clone(), proc_params),
            std::mem::take(body),
        );
        def.variant = ProcVariant::Closure;
        def.detism = modifiers.detism;
        def.purity = modifiers.purity;
        def.inlining = modifiers.inlining;

        let higher_ty = TypeSpec::Higher {
            modifiers: *modifiers,
            flows: params
                .iter()
                .map(|p| TypeFlow::new(p.ty.clone(), p.flow))
                .collect(),
        };
        // Generated closure names are unique, so the overload id is 0
        let spec = ProcSpec::new(module_path.clone(), name, 0);
        let replacement = Exp::Typed {
            exp: Box::new(Placed::unplaced(Exp::ProcRef {
                spec,
                args: free
                    .iter()
                    .map(|v| Placed::unplaced(Exp::var_get(v.clone())))
                    .collect(),
            })),
            ty: higher_ty,
            cast: false,
        };
        arg.node = replacement;
        out.push(def);
    }
}

/// Variables an anonymous procedure reads before binding them locally
fn free_vars(params: &[Param], body: &[Placed<Stmt>]) -> VarSet {
    let mut defined: BTreeSet<Box<str>> = params.iter().map(|p| p.name.clone()).collect();
    let mut free = VarSet::new();
    collect_free(body, &mut defined, &mut free);
    free
}

fn collect_free(stmts: &[Placed<Stmt>], defined: &mut BTreeSet<Box<str>>, free: &mut VarSet) {
    for stmt in stmts {
        match &stmt.node {
            Stmt::Call(call) => collect_free_exps(&call.args, defined, free),
            Stmt::Foreign { args, .. } => collect_free_exps(args, defined, free),
            Stmt::TestBool(exp) => {
                if let Some(name) = exp.var_name() {
                    if !defined.contains(name) {
                        free.insert(name.into());
                    }
                }
            }
            Stmt::And(body) | Stmt::Or(body, _) | Stmt::Loop { body, .. } => {
                collect_free(body, defined, free)
            }
            Stmt::Not(inner) => collect_free(std::slice::from_ref(inner.as_ref()), defined, free),
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                collect_free(std::slice::from_ref(test.as_ref()), defined, free);
                collect_free(then_branch, defined, free);
                collect_free(else_branch, defined, free);
            }
            Stmt::UseResources { body, .. } => collect_free(body, defined, free),
            _ => {}
        }
    }
}

fn collect_free_exps(
    args: &[Placed<Exp>],
    defined: &mut BTreeSet<Box<str>>,
    free: &mut VarSet,
) {
    for arg in args {
        match &arg.node {
            Exp::Var { name, flow } => {
                if flow.is_out() {
                    defined.insert(name.clone());
                } else if !defined.contains(name) {
                    free.insert(name.clone());
                }
            }
            Exp::Typed { exp, .. } => {
                collect_free_exps(std::slice::from_ref(exp.as_ref()), defined, free)
            }
            Exp::ProcRef { args, .. } => collect_free_exps(args, defined, free),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marl_ast::types::ProcModifiers;

    fn call(name: &str, args: Vec<Placed<Exp>>) -> Placed<Stmt> {
        let mut call = Call::new(name, args);
        call.proc_id = Some(0);
        Placed::unplaced(Stmt::Call(call))
    }

    fn det_proc(name: &str, params: Vec<Param>, body: Vec<Placed<Stmt>>) -> ProcDef {
        ProcDef::new(ProcProto::new(name, params), body)
    }

    fn is_flat_form(stmts: &[Placed<Stmt>]) -> bool {
        let Some((last, init)) = stmts.split_last() else {
            return true;
        };
        if !init.iter().all(|s| s.node.is_flat()) {
            return false;
        }
        match &last.node {
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                matches!(&test.node, Stmt::TestBool(Exp::Var { .. }))
                    && is_flat_form(then_branch)
                    && is_flat_form(else_branch)
            }
            other => other.is_flat(),
        }
    }

    #[test]
    fn test_semidet_gains_success_output() {
        let mut var_types = VarTypes::new();
        var_types.insert("x".into(), TypeSpec::int());
        let mut def = det_proc(
            "p",
            vec![Param::input("x", TypeSpec::int())],
            vec![Placed::unplaced(Stmt::TestBool(Exp::var_get("x")))],
        );
        def.detism = Determinism::SemiDet;
        let before_params = def.proto.params.len();

        unbranch_proc(&mut def, &ModPath::new(["m"]), &mut var_types).unwrap();

        assert_eq!(def.detism, Determinism::Det);
        assert_eq!(def.proto.params.len(), before_params + 1);
        let success = def.proto.params.last().unwrap();
        assert_eq!(success.name.as_ref(), SUCCESS_VAR);
        assert!(success.flow.is_out());

        let ProcImpl::Source { body } = &def.body else {
            panic!("expected source body")
        };
        assert!(is_flat_form(body));
        // Both arms of the final conditional must set the flag
        let text = format!("{:?}", body);
        assert!(text.contains(SUCCESS_VAR));
    }

    #[test]
    fn test_loop_lifting_produces_next_and_brk() {
        // do { if b:: break; c() } d... with a non-trivial d
        let mut var_types = VarTypes::new();
        var_types.insert("b".into(), TypeSpec::bool());
        let cond = Stmt::Cond {
            test: Box::new(Placed::unplaced(Stmt::TestBool(Exp::var_get("b")))),
            then_branch: vec![Placed::unplaced(Stmt::Break)],
            else_branch: vec![],
            test_vars: Some(VarSet::new()),
            exit_vars: Some(VarSet::new()),
        };
        let body = vec![
            Placed::unplaced(Stmt::Loop {
                body: vec![Placed::unplaced(cond), call("c", vec![])],
                exit_vars: Some(VarSet::new()),
            }),
            call("d1", vec![]),
            call("d2", vec![]),
            call("d3", vec![]),
            call("d4", vec![]),
            call("d5", vec![]),
            call("d6", vec![]),
        ];
        let mut def = det_proc("p", vec![Param::input("b", TypeSpec::bool())], body);
        let new_procs =
            unbranch_proc(&mut def, &ModPath::new(["m"]), &mut var_types).unwrap();

        // One procedure for the loop body, one for the break continuation
        let names: Vec<&str> = new_procs.iter().map(|p| p.name.as_ref()).collect();
        assert!(names.iter().any(|n| n.contains("#next")));
        assert!(names.iter().any(|n| n.contains("#brk")));
        assert!(new_procs
            .iter()
            .all(|p| p.variant == ProcVariant::Generated));

        // The caller's body reduces to a single call to the next proc
        let ProcImpl::Source { body } = &def.body else {
            panic!("expected source body")
        };
        assert_eq!(body.len(), 1);
        let Stmt::Call(entry) = &body[0].node else {
            panic!("expected a call, got {:?}", body[0].node)
        };
        assert!(entry.name.contains("#next"));

        // The next proc loops on itself and breaks into the brk proc
        let next = new_procs
            .iter()
            .find(|p| p.name.contains("#next"))
            .unwrap();
        let ProcImpl::Source { body } = &next.body else {
            panic!()
        };
        assert!(is_flat_form(body));
        let printed = format!("{:?}", body);
        assert!(printed.contains("#next"));
        assert!(printed.contains("#brk"));

        // The brk proc carries the d continuation
        let brk = new_procs.iter().find(|p| p.name.contains("#brk")).unwrap();
        let ProcImpl::Source { body } = &brk.body else {
            panic!()
        };
        assert_eq!(body.len(), 6);
    }

    #[test]
    fn test_trivial_continuation_is_duplicated_inline() {
        let mut var_types = VarTypes::new();
        var_types.insert("b".into(), TypeSpec::bool());
        let cond = Stmt::Cond {
            test: Box::new(Placed::unplaced(Stmt::TestBool(Exp::var_get("b")))),
            then_branch: vec![call("t", vec![])],
            else_branch: vec![call("e", vec![])],
            test_vars: Some(VarSet::new()),
            exit_vars: Some(VarSet::new()),
        };
        let body = vec![Placed::unplaced(cond), call("after", vec![])];
        let mut def = det_proc("p", vec![Param::input("b", TypeSpec::bool())], body);
        let new_procs =
            unbranch_proc(&mut def, &ModPath::new(["m"]), &mut var_types).unwrap();
        assert!(new_procs.is_empty(), "small continuation must inline");

        let ProcImpl::Source { body } = &def.body else {
            panic!()
        };
        assert!(is_flat_form(body));
        // Both branches end with the duplicated continuation
        let Stmt::Cond {
            then_branch,
            else_branch,
            ..
        } = &body[0].node
        else {
            panic!("expected terminal cond, got {:?}", body[0].node)
        };
        for branch in [then_branch, else_branch] {
            let Stmt::Call(last) = &branch.last().unwrap().node else {
                panic!()
            };
            assert_eq!(last.name.as_ref(), "after");
        }
    }

    #[test]
    fn test_heavy_continuation_is_lifted() {
        let mut var_types = VarTypes::new();
        var_types.insert("b".into(), TypeSpec::bool());
        let cond = Stmt::Cond {
            test: Box::new(Placed::unplaced(Stmt::TestBool(Exp::var_get("b")))),
            then_branch: vec![call("t", vec![])],
            else_branch: vec![call("e", vec![])],
            test_vars: Some(VarSet::new()),
            exit_vars: Some(VarSet::new()),
        };
        let mut body = vec![Placed::unplaced(cond)];
        for i in 0..(CONT_INLINE_LIMIT + 1) {
            body.push(call(&format!("after{}", i), vec![]));
        }
        let mut def = det_proc("p", vec![Param::input("b", TypeSpec::bool())], body);
        let new_procs =
            unbranch_proc(&mut def, &ModPath::new(["m"]), &mut var_types).unwrap();
        assert_eq!(new_procs.len(), 1);
        assert!(new_procs[0].name.contains("#cont"));
    }

    #[test]
    fn test_disjunction_commits_to_first_success() {
        let mut var_types = VarTypes::new();
        for v in ["a", "b"] {
            var_types.insert(v.into(), TypeSpec::bool());
        }
        let mut def = det_proc(
            "p",
            vec![
                Param::input("a", TypeSpec::bool()),
                Param::input("b", TypeSpec::bool()),
            ],
            vec![Placed::unplaced(Stmt::Or(
                vec![
                    Placed::unplaced(Stmt::TestBool(Exp::var_get("a"))),
                    Placed::unplaced(Stmt::TestBool(Exp::var_get("b"))),
                ],
                Some(VarSet::new()),
            ))],
        );
        def.detism = Determinism::SemiDet;
        unbranch_proc(&mut def, &ModPath::new(["m"]), &mut var_types).unwrap();
        let ProcImpl::Source { body } = &def.body else {
            panic!()
        };
        assert!(is_flat_form(body));
        // Outer test on a; its failure branch tests b
        let Stmt::Cond { else_branch, .. } = &body.last().unwrap().node else {
            panic!("expected cond, got {:?}", body.last().unwrap().node)
        };
        let Stmt::Cond { test, .. } = &else_branch.last().unwrap().node else {
            panic!("expected nested cond in else branch")
        };
        let Stmt::TestBool(Exp::Var { name, .. }) = &test.node else {
            panic!()
        };
        assert_eq!(name.as_ref(), "b");
    }

    #[test]
    fn test_hoisted_closure_becomes_proc() {
        let mut module = Module::new(ModPath::new(["m"]));
        let anon = Exp::AnonProc {
            modifiers: ProcModifiers::default(),
            params: vec![Param::input("n", TypeSpec::int())],
            body: vec![Placed::unplaced(Stmt::foreign(
                "llvm",
                "move",
                vec![
                    Placed::unplaced(Exp::var_get("captured")),
                    Placed::unplaced(Exp::var_set("ignored")),
                ],
            ))],
        };
        module.add_proc(det_proc(
            "p",
            vec![Param::input("captured", TypeSpec::int())],
            vec![call("consume", vec![Placed::unplaced(anon)])],
        ));

        hoist_closures(&mut module);

        let closure_name = module
            .procs
            .keys()
            .find(|n| n.contains("#closure"))
            .expect("closure proc registered")
            .clone();
        let closure = &module.candidates(&closure_name)[0];
        assert_eq!(closure.variant, ProcVariant::Closure);
        // Captured variable is the leading Free parameter
        assert_eq!(closure.proto.params[0].name.as_ref(), "captured");
        assert_eq!(closure.proto.params[0].kind, ArgFlowType::Free);

        // The call site now passes a typed procedure reference
        let caller = &module.candidates("p")[0];
        let ProcImpl::Source { body } = &caller.body else {
            panic!()
        };
        let Stmt::Call(call) = &body[0].node else {
            panic!()
        };
        let Exp::Typed { exp, ty, .. } = &call.args[0].node else {
            panic!("expected typed proc ref, got {:?}", call.args[0].node)
        };
        assert!(matches!(ty, TypeSpec::Higher { .. }));
        let Exp::ProcRef { args, .. } = &exp.node else {
            panic!()
        };
        assert_eq!(args.len(), 1);
    }
}
