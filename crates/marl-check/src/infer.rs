//! Type inference (phase 1 of checking a procedure)
//!
//! Traverses the source body accumulating a typing and a list of errors.
//! Flow directions are not consulted here, only types; overloaded calls
//! that cannot be resolved from types alone are recorded as alternatives
//! and narrowed afterwards.

use marl_ast::pos::{Placed, SourcePos};
use marl_ast::proc::{Module, ProcDef};
use marl_ast::stmt::{Call, Exp, Stmt};
use marl_ast::types::{Determinism, ModPath, ProcModifiers, TypeFlow, TypeSpec};

use crate::error::{CheckError, ErrorKind};
use crate::typing::{Alternative, Typing};

/// How a candidate's parameter list lines up with a call's argument list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Parameters and arguments correspond one to one
    Exact,
    /// A test call of a `Det` procedure whose trailing bool output becomes
    /// the implicit success flag
    ImplicitTest,
    /// A call of a `SemiDet` procedure with one extra output argument that
    /// reifies the success flag
    ReifiedTest,
}

/// One overload that survived arity filtering
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: usize,
    pub shape: Shape,
}

/// Parameter/argument pairs of a candidate, in call-argument order.
/// `ImplicitTest` drops the candidate's trailing success parameter;
/// `ReifiedTest` drops the call's trailing success argument.
pub fn aligned<'a>(
    def: &'a ProcDef,
    shape: Shape,
    args: &'a [Placed<Exp>],
) -> impl Iterator<Item = (&'a marl_ast::flow::Param, &'a Placed<Exp>)> {
    let params = &def.proto.params;
    let (params, args) = match shape {
        Shape::Exact => (&params[..], args),
        Shape::ImplicitTest => (&params[..params.len() - 1], args),
        Shape::ReifiedTest => (&params[..], &args[..args.len() - 1]),
    };
    params.iter().zip(args)
}

/// All overloads of a call whose arity can work, with their shapes
pub fn arity_candidates(module: &Module, call: &Call) -> Vec<Candidate> {
    let defs = module.candidates(&call.name);
    let n_args = call.args.len();
    let ids: Vec<usize> = match call.proc_id {
        Some(id) if id < defs.len() => vec![id],
        Some(_) => Vec::new(),
        None => (0..defs.len()).collect(),
    };

    let mut out = Vec::new();
    for id in ids {
        let def = &defs[id];
        let n_params = def.proto.params.len();
        if n_params == n_args {
            out.push(Candidate {
                id,
                shape: Shape::Exact,
            });
        } else if call.detism == Determinism::SemiDet
            && def.detism == Determinism::Det
            && n_params == n_args + 1
            && def
                .proto
                .params
                .last()
                .is_some_and(|p| p.flow.is_out() && p.ty.compatible(&TypeSpec::bool()))
        {
            out.push(Candidate {
                id,
                shape: Shape::ImplicitTest,
            });
        } else if def.detism == Determinism::SemiDet
            && n_params + 1 == n_args
            && call
                .args
                .last()
                .is_some_and(|a| a.node.flow().is_out() || a.node.flow().is_unknown())
        {
            out.push(Candidate {
                id,
                shape: Shape::ReifiedTest,
            });
        }
    }
    out
}

/// Phase 1 driver for one procedure body
pub struct Inferencer<'m> {
    module: &'m Module,
    pub typing: Typing,
    pub errors: Vec<CheckError>,
}

impl<'m> Inferencer<'m> {
    pub fn new(module: &'m Module) -> Self {
        Inferencer {
            module,
            typing: Typing::new(),
            errors: Vec::new(),
        }
    }

    /// Surrender the typing and accumulated errors
    pub fn into_parts(self) -> (Typing, Vec<CheckError>) {
        (self.typing, self.errors)
    }

    /// Infer types over a whole body, then narrow leftover alternatives
    pub fn infer_body(&mut self, stmts: &[Placed<Stmt>]) {
        self.infer_stmts(stmts);
        let mut errors = std::mem::take(&mut self.errors);
        self.typing.narrow_alternatives(&mut errors);
        self.errors = errors;
    }

    fn infer_stmts(&mut self, stmts: &[Placed<Stmt>]) {
        for stmt in stmts {
            self.infer_stmt(&stmt.node, stmt.pos.as_ref());
        }
    }

    fn infer_stmt(&mut self, stmt: &Stmt, pos: Option<&SourcePos>) {
        match stmt {
            Stmt::Call(call) => self.infer_call(call, pos),
            Stmt::Foreign {
                lang, name, args, ..
            } => self.infer_foreign(lang, name, args, pos),
            Stmt::TestBool(exp) => {
                let ty = self.exp_type(exp, pos);
                if let Some(var) = exp.var_name() {
                    let var = var.to_owned();
                    self.typing
                        .unify_var(&var, &TypeSpec::bool(), pos, &mut self.errors);
                } else if !ty.compatible(&TypeSpec::bool()) {
                    self.errors.push(CheckError::new(
                        ErrorKind::TestNotBool { found: ty },
                        pos.cloned(),
                    ));
                }
            }
            Stmt::And(body) | Stmt::Or(body, _) | Stmt::Loop { body, .. } => {
                self.infer_stmts(body)
            }
            Stmt::Not(inner) => self.infer_stmt(&inner.node, inner.pos.as_ref()),
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                self.infer_stmt(&test.node, test.pos.as_ref());
                self.infer_stmts(then_branch);
                self.infer_stmts(else_branch);
            }
            Stmt::UseResources { body, .. } => self.infer_stmts(body),
            Stmt::Case { .. } | Stmt::For { .. } => {
                self.errors.push(CheckError::new(
                    ErrorKind::Internal(format!(
                        "{} statement survived flattening",
                        discriminant_name(stmt)
                    )),
                    pos.cloned(),
                ));
            }
            Stmt::Nop | Stmt::Fail | Stmt::Break | Stmt::Next => {}
        }
    }

    fn infer_call(&mut self, call: &Call, pos: Option<&SourcePos>) {
        if self.module.candidates(&call.name).is_empty() {
            // A call through a closure-typed variable is a higher call
            if let TypeSpec::Higher { flows, .. } = self.typing.var_type(&call.name) {
                if flows.len() != call.args.len() {
                    self.errors.push(CheckError::new(
                        ErrorKind::ArityMismatch {
                            name: call.name.clone(),
                            found: call.args.len(),
                        },
                        pos.cloned(),
                    ));
                    return;
                }
                for (flow, arg) in flows.iter().zip(&call.args) {
                    if let Some(var) = arg.node.var_name() {
                        let var = var.to_owned();
                        self.typing
                            .unify_var(&var, &flow.ty, pos, &mut self.errors);
                    }
                }
                return;
            }
            self.errors.push(CheckError::new(
                ErrorKind::UnknownProc(call.name.clone()),
                pos.cloned(),
            ));
            for arg in &call.args {
                self.exp_type(&arg.node, arg.pos.as_ref());
            }
            return;
        }

        let candidates = arity_candidates(self.module, call);
        if candidates.is_empty() {
            self.errors.push(CheckError::new(
                ErrorKind::ArityMismatch {
                    name: call.name.clone(),
                    found: call.args.len(),
                },
                pos.cloned(),
            ));
            return;
        }

        // Filter by element-wise compatibility of the known argument types
        let arg_types: Vec<TypeSpec> = call
            .args
            .iter()
            .map(|a| self.exp_type(&a.node, a.pos.as_ref()))
            .collect();
        let survivors: Vec<Candidate> = candidates
            .into_iter()
            .filter(|cand| {
                let def = &self.module.candidates(&call.name)[cand.id];
                aligned(def, cand.shape, &call.args)
                    .zip(&arg_types)
                    .all(|((param, _), actual)| param.ty.compatible(actual))
            })
            .collect();

        match survivors.len() {
            0 => self.errors.push(CheckError::new(
                ErrorKind::NoMatch {
                    name: call.name.clone(),
                },
                pos.cloned(),
            )),
            1 => self.commit_candidate(call, survivors[0], pos),
            _ => self.record_alternative(call, &survivors, pos),
        }
    }

    /// A unique overload: unify each argument with its parameter type
    fn commit_candidate(&mut self, call: &Call, cand: Candidate, pos: Option<&SourcePos>) {
        self.typing.next_call_site();
        let def = &self.module.candidates(&call.name)[cand.id];
        let pairs: Vec<(Option<Box<str>>, TypeSpec)> = aligned(def, cand.shape, &call.args)
            .map(|(param, arg)| (arg.node.var_name().map(Box::from), param.ty.clone()))
            .collect();
        for (var, param_ty) in pairs {
            if let Some(var) = var {
                let fresh = self.typing.freshen(&param_ty);
                self.typing.unify_var(&var, &fresh, pos, &mut self.errors);
            }
        }
        if cand.shape == Shape::ReifiedTest {
            if let Some(var) = call.args.last().and_then(|a| a.node.var_name()) {
                let var = var.to_owned();
                self.typing
                    .unify_var(&var, &TypeSpec::bool(), pos, &mut self.errors);
            }
        }
    }

    /// Several overloads remain: record the candidate type tuples over the
    /// argument variables whose types are still open.
    fn record_alternative(&mut self, call: &Call, survivors: &[Candidate], pos: Option<&SourcePos>) {
        let mut open_vars = Vec::new();
        for arg in &call.args {
            if let Some(name) = arg.node.var_name() {
                let ty = self.typing.var_type(name);
                if (ty.is_any() || ty.is_var()) && !open_vars.iter().any(|v: &Box<str>| v.as_ref() == name) {
                    open_vars.push(Box::from(name));
                }
            }
        }

        let mut tuples: Vec<Vec<TypeSpec>> = Vec::new();
        for cand in survivors {
            let def = &self.module.candidates(&call.name)[cand.id];
            let mut tuple = vec![TypeSpec::Any; open_vars.len()];
            for (param, arg) in aligned(def, cand.shape, &call.args) {
                if let Some(name) = arg.node.var_name() {
                    if let Some(slot) = open_vars.iter().position(|v| v.as_ref() == name) {
                        // Generic parameters constrain nothing here
                        let ty = if param.ty.is_var() {
                            TypeSpec::Any
                        } else {
                            param.ty.clone()
                        };
                        tuple[slot] = ty;
                    }
                }
            }
            if !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
        }

        if open_vars.is_empty() {
            // Nothing left to narrow; modes decide between the candidates.
            return;
        }
        if let [tuple] = tuples.as_slice() {
            // The candidates agree on every open variable
            let tuple = tuple.clone();
            for (var, ty) in open_vars.iter().zip(&tuple) {
                if !ty.is_any() {
                    let var = var.clone();
                    self.typing.unify_var(&var, ty, pos, &mut self.errors);
                }
            }
            return;
        }
        self.typing.alternatives.push(Alternative {
            name: call.name.clone(),
            pos: pos.cloned(),
            vars: open_vars,
            tuples,
        });
    }

    fn infer_foreign(
        &mut self,
        _lang: &str,
        name: &str,
        args: &[Placed<Exp>],
        pos: Option<&SourcePos>,
    ) {
        for arg in args {
            self.exp_type(&arg.node, arg.pos.as_ref());
        }
        // The operations with type-connecting signatures: move and cast
        // propagate between their two ends; comparisons produce bool.
        match name {
            "move" => {
                if let [src, dst] = args {
                    let src_ty = self.exp_type(&src.node, pos);
                    if let Some(var) = dst.node.var_name() {
                        let var = var.to_owned();
                        self.typing.unify_var(&var, &src_ty, pos, &mut self.errors);
                    }
                }
            }
            _ if name.starts_with("icmp_") || name.starts_with("fcmp_") => {
                if let Some(out) = args.last() {
                    if let Some(var) = out.node.var_name() {
                        let var = var.to_owned();
                        self.typing
                            .unify_var(&var, &TypeSpec::bool(), pos, &mut self.errors);
                    }
                }
            }
            _ => {}
        }
    }

    /// The current type of an expression, unifying type annotations as a
    /// side effect.
    pub fn exp_type(&mut self, exp: &Exp, pos: Option<&SourcePos>) -> TypeSpec {
        match exp {
            Exp::Var { name, .. } => self.typing.var_type(name),
            Exp::Int(_) => TypeSpec::int(),
            Exp::Float(_) => TypeSpec::float(),
            Exp::Str(_) => TypeSpec::string(),
            Exp::Char(_) => TypeSpec::char(),
            Exp::Typed { exp, ty, cast } => {
                if *cast {
                    // A cast reinterprets: the inner expression types on its
                    // own, the whole expression has the target type.
                    self.exp_type(&exp.node, pos);
                } else if let Some(var) = exp.node.var_name() {
                    let var = var.to_owned();
                    self.typing.unify_var(&var, ty, pos, &mut self.errors);
                }
                ty.clone()
            }
            Exp::AnonProc {
                modifiers,
                params,
                body,
            } => {
                // The body types in its own scope; only the signature leaks
                let mut inner = Inferencer::new(self.module);
                for param in params {
                    inner.typing.declare_var(param.name.clone(), param.ty.clone());
                }
                inner.infer_body(body);
                self.errors.append(&mut inner.errors);
                TypeSpec::Higher {
                    modifiers: *modifiers,
                    flows: params
                        .iter()
                        .map(|p| TypeFlow::new(p.ty.clone(), p.flow))
                        .collect(),
                }
            }
            Exp::ProcRef { spec, args } => {
                for arg in args {
                    self.exp_type(&arg.node, pos);
                }
                match self.module.proc(spec) {
                    Some(def) => TypeSpec::Higher {
                        modifiers: ProcModifiers {
                            detism: def.detism,
                            purity: def.purity,
                            inlining: def.inlining,
                        },
                        flows: def
                            .proto
                            .params
                            .iter()
                            .skip(args.len())
                            .map(|p| TypeFlow::new(p.ty.clone(), p.flow))
                            .collect(),
                    },
                    None if spec.module == self.module.path || spec.module == ModPath::default() => {
                        self.errors.push(CheckError::new(
                            ErrorKind::UnknownProc(spec.name.clone()),
                            pos.cloned(),
                        ));
                        TypeSpec::Invalid
                    }
                    None => TypeSpec::Any,
                }
            }
        }
    }
}

fn discriminant_name(stmt: &Stmt) -> &'static str {
    match stmt {
        Stmt::Case { .. } => "case",
        Stmt::For { .. } => "for",
        _ => "statement",
    }
}
