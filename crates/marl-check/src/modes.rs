//! Mode checking (phase 2 of checking a procedure)
//!
//! Re-traverses the body with types known, selects the procedure variant
//! for each call from the availability and direction of its arguments,
//! rewrites argument flows, and threads a [`BindingState`] through every
//! program point. A call whose undirected arguments are not yet bound is
//! delayed and resumed once they are, which orders statements by data
//! dependency.

use std::collections::BTreeSet;

use marl_ast::flow::{ArgFlowType, FlowDirection, ResourceName};
use marl_ast::pos::{Placed, SourcePos};
use marl_ast::proc::{Module, ProcProto};
use marl_ast::stmt::{Call, Exp, Stmt, VarSet};
use marl_ast::types::{Determinism, TypeSpec};
use tracing::debug;

use crate::binding::BindingState;
use crate::error::{CheckError, ErrorKind};
use crate::foreign::validate_foreign;
use crate::infer::{aligned, arity_candidates, Candidate, Shape};
use crate::typing::Typing;

/// A call waiting for the variables in `awaiting` to become bound
#[derive(Debug)]
struct DelayedCall {
    awaiting: VarSet,
    stmt: Placed<Stmt>,
}

/// Why a candidate was rejected during mode resolution
#[derive(Debug, Clone, PartialEq)]
enum Reason {
    Flow(Box<str>),
    Determinism(Determinism),
    Resource(ResourceName),
}

/// Outcome of matching one candidate against the actual argument modes
enum ModeMatch {
    Exact,
    Delayable(VarSet),
    Rejected(Reason),
}

pub struct ModeChecker<'m> {
    module: &'m Module,
    pub typing: Typing,
    pub errors: Vec<CheckError>,
    resources: BTreeSet<ResourceName>,
    loop_exits: Vec<Vec<BindingState>>,
}

impl<'m> ModeChecker<'m> {
    pub fn new(module: &'m Module, typing: Typing) -> Self {
        ModeChecker {
            module,
            typing,
            errors: Vec::new(),
            resources: BTreeSet::new(),
            loop_exits: Vec::new(),
        }
    }

    /// Surrender the typing and accumulated errors
    pub fn into_parts(self) -> (Typing, Vec<CheckError>) {
        (self.typing, self.errors)
    }

    /// Mode check one procedure body, returning the rewritten (and possibly
    /// reordered) body and the exit binding state.
    pub fn run(
        &mut self,
        body: Vec<Placed<Stmt>>,
        proto: &ProcProto,
        detism: Determinism,
    ) -> (Vec<Placed<Stmt>>, BindingState) {
        let mut state = BindingState::entry(proto.inputs().map(|p| p.name.clone()));
        self.resources = proto.resources.clone();
        for param in &proto.params {
            if let ArgFlowType::Resource(res) = &param.kind {
                if param.flow.is_in() {
                    self.resources.insert(res.clone());
                }
            }
        }

        let out = self.mode_stmts(body, &mut state, detism);
        debug!(target: "modes", proc = %proto.name, ?state, "mode checked");

        // Every output must be bound on any succeeding exit
        if state.can_succeed() {
            for param in proto.outputs() {
                if !state.is_bound(&param.name) {
                    let kind = match &param.kind {
                        ArgFlowType::Resource(res) => ErrorKind::ResourceNotBound(res.0.clone()),
                        _ => ErrorKind::OutputUnbound(param.name.clone()),
                    };
                    self.errors.push(CheckError::new(kind, None));
                }
            }
        }
        (out, state)
    }

    fn mode_stmts(
        &mut self,
        stmts: Vec<Placed<Stmt>>,
        state: &mut BindingState,
        ctx: Determinism,
    ) -> Vec<Placed<Stmt>> {
        let mut out = Vec::new();
        let mut delayed: Vec<DelayedCall> = Vec::new();
        for stmt in stmts {
            self.mode_stmt(stmt, state, ctx, &mut delayed, &mut out);
            self.drain(&mut delayed, state, ctx, &mut out);
        }

        // Whatever is still waiting can never run: its inputs never arrive
        for d in delayed {
            for var in &d.awaiting {
                if !state.is_bound(var) {
                    self.errors.push(CheckError::new(
                        ErrorKind::UninitedInput { var: var.clone() },
                        d.stmt.pos.clone(),
                    ));
                }
            }
            out.push(d.stmt);
        }
        out
    }

    /// Re-attempt delayed calls whose awaited variables are now all bound
    fn drain(
        &mut self,
        delayed: &mut Vec<DelayedCall>,
        state: &mut BindingState,
        ctx: Determinism,
        out: &mut Vec<Placed<Stmt>>,
    ) {
        loop {
            let Some(index) = delayed
                .iter()
                .position(|d| d.awaiting.iter().all(|v| state.is_bound(v)))
            else {
                break;
            };
            let d = delayed.remove(index);
            debug!(target: "modes", stmt = %d.stmt.node, "resuming delayed call");
            self.mode_stmt(d.stmt, state, ctx, delayed, out);
        }
    }

    fn mode_stmt(
        &mut self,
        stmt: Placed<Stmt>,
        state: &mut BindingState,
        ctx: Determinism,
        delayed: &mut Vec<DelayedCall>,
        out: &mut Vec<Placed<Stmt>>,
    ) {
        let pos = stmt.pos.clone();
        match stmt.node {
            Stmt::Call(call) => self.mode_call(call, pos, state, ctx, delayed, out),

            Stmt::Foreign {
                lang,
                name,
                flags,
                mut args,
            } => {
                let arg_types: Vec<TypeSpec> = args
                    .iter_mut()
                    .map(|a| self.exp_type(&a.node))
                    .collect();
                validate_foreign(&lang, &name, &arg_types, pos.as_ref(), &mut self.errors);
                for arg in &mut args {
                    self.resolve_exp_flow(&mut arg.node, state, pos.as_ref());
                }
                for arg in &args {
                    if arg.node.flow().is_out() {
                        if let Some(var) = arg.node.var_name() {
                            state.bind(var);
                        }
                    }
                }
                out.push(Placed::new(
                    Stmt::Foreign {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos,
                ));
            }

            Stmt::TestBool(exp) => {
                if !Determinism::SemiDet.callable_in(ctx) {
                    self.errors.push(CheckError::new(
                        ErrorKind::DetismViolation {
                            name: "<test>".into(),
                            callee: Determinism::SemiDet,
                            context: ctx,
                        },
                        pos.clone(),
                    ));
                }
                if let Some(var) = exp.var_name() {
                    if !state.is_bound(var) {
                        self.errors.push(CheckError::new(
                            ErrorKind::UninitedInput { var: var.into() },
                            pos.clone(),
                        ));
                    }
                }
                state.may_fail();
                out.push(Placed::new(Stmt::TestBool(exp), pos));
            }

            Stmt::And(body) => {
                let inner = self.mode_stmts(body, state, ctx);
                out.push(Placed::new(Stmt::And(inner), pos));
            }

            Stmt::Or(alts, _) => {
                let entry = state.clone();
                let before: VarSet = entry.bound_vars().cloned().unwrap_or_default();
                let mut exit = BindingState::Impossible;
                let mut new_alts = Vec::with_capacity(alts.len());
                let last = alts.len().saturating_sub(1);
                for (i, alt) in alts.into_iter().enumerate() {
                    let alt_ctx = if i == last { ctx } else { Determinism::SemiDet };
                    let mut alt_state = entry.clone();
                    let checked = self.mode_stmts(vec![alt], &mut alt_state, alt_ctx);
                    exit = exit.join(alt_state);
                    new_alts.extend(checked);
                }
                let exit_vars = newly_bound(&before, &exit);
                *state = exit;
                out.push(Placed::new(Stmt::Or(new_alts, Some(exit_vars)), pos));
            }

            Stmt::Not(inner) => {
                if !Determinism::SemiDet.callable_in(ctx) {
                    self.errors.push(CheckError::new(
                        ErrorKind::DetismViolation {
                            name: "<negation>".into(),
                            callee: Determinism::SemiDet,
                            context: ctx,
                        },
                        pos.clone(),
                    ));
                }
                let mut inner_state = state.clone();
                let checked = self.mode_stmts(vec![*inner], &mut inner_state, Determinism::SemiDet);
                // A negation binds nothing; it only may fail
                state.may_fail();
                let inner = checked.into_iter().next().unwrap_or_else(|| {
                    Placed::new(Stmt::Nop, pos.clone())
                });
                out.push(Placed::new(Stmt::Not(Box::new(inner)), pos));
            }

            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                let before: VarSet = state.bound_vars().cloned().unwrap_or_default();
                let mut test_state = state.clone();
                let checked_test =
                    self.mode_stmts(vec![*test], &mut test_state, Determinism::SemiDet);
                let test_vars = newly_bound(&before, &test_state);

                let mut then_state = test_state;
                // The then branch runs only when the test succeeded
                if let BindingState::Possible(vars) = then_state {
                    then_state = BindingState::Succeeding(vars);
                }
                let checked_then = self.mode_stmts(then_branch, &mut then_state, ctx);

                let mut else_state = state.clone();
                let checked_else = self.mode_stmts(else_branch, &mut else_state, ctx);

                let exit = then_state.join(else_state);
                let exit_vars = newly_bound(&before, &exit);
                *state = exit;

                let test = checked_test
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| Placed::new(Stmt::Nop, pos.clone()));
                out.push(Placed::new(
                    Stmt::Cond {
                        test: Box::new(test),
                        then_branch: checked_then,
                        else_branch: checked_else,
                        test_vars: Some(test_vars),
                        exit_vars: Some(exit_vars),
                    },
                    pos,
                ));
            }

            Stmt::Loop { body, .. } => {
                let before: VarSet = state.bound_vars().cloned().unwrap_or_default();
                self.loop_exits.push(Vec::new());
                let mut body_state = state.clone();
                let checked = self.mode_stmts(body, &mut body_state, ctx);
                let exits = self.loop_exits.pop().unwrap_or_default();
                // The loop is left only through breaks; none means no exit
                let exit = exits
                    .into_iter()
                    .fold(BindingState::Impossible, BindingState::join);
                let exit_vars = newly_bound(&before, &exit);
                *state = exit;
                out.push(Placed::new(
                    Stmt::Loop {
                        body: checked,
                        exit_vars: Some(exit_vars),
                    },
                    pos,
                ));
            }

            Stmt::UseResources { resources, body } => {
                let saved = self.resources.clone();
                self.resources.extend(resources.iter().cloned());
                let checked = self.mode_stmts(body, state, ctx);
                self.resources = saved;
                out.push(Placed::new(
                    Stmt::UseResources {
                        resources,
                        body: checked,
                    },
                    pos,
                ));
            }

            Stmt::Nop => out.push(Placed::new(Stmt::Nop, pos)),

            Stmt::Fail => {
                if !Determinism::SemiDet.callable_in(ctx) {
                    self.errors.push(CheckError::new(
                        ErrorKind::DetismViolation {
                            name: "fail".into(),
                            callee: Determinism::Failure,
                            context: ctx,
                        },
                        pos.clone(),
                    ));
                }
                state.make_impossible();
                out.push(Placed::new(Stmt::Fail, pos));
            }

            Stmt::Break => {
                match self.loop_exits.last_mut() {
                    Some(exits) => exits.push(state.clone()),
                    None => self.errors.push(CheckError::new(
                        ErrorKind::LoopExitOutsideLoop,
                        pos.clone(),
                    )),
                }
                state.make_impossible();
                out.push(Placed::new(Stmt::Break, pos));
            }

            Stmt::Next => {
                if self.loop_exits.is_empty() {
                    self.errors
                        .push(CheckError::new(ErrorKind::LoopExitOutsideLoop, pos.clone()));
                }
                state.make_impossible();
                out.push(Placed::new(Stmt::Next, pos));
            }

            stmt @ (Stmt::Case { .. } | Stmt::For { .. }) => {
                self.errors.push(CheckError::new(
                    ErrorKind::Internal("case/for statement survived flattening".into()),
                    pos.clone(),
                ));
                out.push(Placed::new(stmt, pos));
            }
        }
    }

    fn mode_call(
        &mut self,
        mut call: Call,
        pos: Option<SourcePos>,
        state: &mut BindingState,
        ctx: Determinism,
        delayed: &mut Vec<DelayedCall>,
        out: &mut Vec<Placed<Stmt>>,
    ) {
        let defs = self.module.candidates(&call.name);
        if defs.is_empty() {
            if let TypeSpec::Higher { modifiers, flows } = self.typing.var_type(&call.name) {
                self.mode_higher_call(call, modifiers, flows, pos, state, out);
                return;
            }
            // Reported as unknown during inference
            out.push(Placed::new(Stmt::Call(call), pos));
            return;
        }

        // Definite inputs must already be bound; no delay can supply them
        let mut definite_input_missing = false;
        for arg in &call.args {
            if arg.node.flow() == FlowDirection::In {
                if let Some(var) = arg.node.var_name() {
                    if !state.is_bound(var) {
                        self.errors.push(CheckError::new(
                            ErrorKind::UninitedInput { var: var.into() },
                            pos.clone(),
                        ));
                        definite_input_missing = true;
                    }
                }
            }
        }
        if definite_input_missing {
            out.push(Placed::new(Stmt::Call(call), pos));
            return;
        }

        let eff_ctx = if call.detism == Determinism::SemiDet {
            Determinism::SemiDet
        } else {
            ctx
        };

        // Keep only candidates whose arity and argument types can work
        let candidates: Vec<Candidate> = {
            let arg_types: Vec<TypeSpec> = call
                .args
                .iter()
                .map(|a| self.exp_type(&a.node))
                .collect();
            arity_candidates(self.module, &call)
                .into_iter()
                .filter(|cand| {
                    aligned(&defs[cand.id], cand.shape, &call.args)
                        .zip(&arg_types)
                        .all(|((param, _), actual)| param.ty.compatible(actual))
                })
                .collect()
        };
        if candidates.is_empty() {
            // Reported during inference
            out.push(Placed::new(Stmt::Call(call), pos));
            return;
        }

        let mut delayable: Option<VarSet> = None;
        let mut reasons: Vec<Reason> = Vec::new();
        let mut chosen: Option<Candidate> = None;
        for cand in &candidates {
            match self.match_modes(&call, *cand, state, eff_ctx) {
                ModeMatch::Exact => {
                    chosen = Some(*cand);
                    break;
                }
                ModeMatch::Delayable(awaiting) => {
                    let entry = delayable.get_or_insert_with(VarSet::new);
                    entry.extend(awaiting);
                }
                ModeMatch::Rejected(reason) => reasons.push(reason),
            }
        }

        match (chosen, delayable) {
            (Some(cand), _) => {
                self.commit_call(&mut call, cand, state);
                debug!(target: "modes", call = %call, "resolved mode");
                out.push(Placed::new(Stmt::Call(call), pos));
            }
            (None, Some(awaiting)) => {
                debug!(target: "modes", call = %call, ?awaiting, "delaying call");
                delayed.push(DelayedCall {
                    awaiting,
                    stmt: Placed::new(Stmt::Call(call), pos),
                });
            }
            (None, None) => {
                let kind = match reasons.first() {
                    Some(Reason::Determinism(callee)) => ErrorKind::DetismViolation {
                        name: call.name.clone(),
                        callee: *callee,
                        context: eff_ctx,
                    },
                    Some(Reason::Resource(res)) => ErrorKind::ResourceUnavail {
                        name: call.name.clone(),
                        resource: res.0.clone(),
                    },
                    Some(Reason::Flow(var)) => ErrorKind::UndefinedFlow {
                        name: call.name.clone(),
                        var: var.clone(),
                    },
                    None => ErrorKind::NoMatch {
                        name: call.name.clone(),
                    },
                };
                self.errors.push(CheckError::new(kind, pos.clone()));
                out.push(Placed::new(Stmt::Call(call), pos));
            }
        }
    }

    /// A call through a closure-typed variable: flows come from the type
    fn mode_higher_call(
        &mut self,
        mut call: Call,
        modifiers: marl_ast::types::ProcModifiers,
        flows: Vec<marl_ast::types::TypeFlow>,
        pos: Option<SourcePos>,
        state: &mut BindingState,
        out: &mut Vec<Placed<Stmt>>,
    ) {
        if !state.is_bound(&call.name) {
            self.errors.push(CheckError::new(
                ErrorKind::UninitedInput {
                    var: call.name.clone(),
                },
                pos.clone(),
            ));
        }
        if flows.len() == call.args.len() {
            for (flow, arg) in flows.iter().zip(call.args.iter_mut()) {
                arg.node.set_flow(flow.dir);
                if flow.dir.is_out() {
                    if let Some(var) = arg.node.var_name() {
                        state.bind(var);
                    }
                } else if let Some(var) = arg.node.var_name() {
                    if !state.is_bound(var) {
                        self.errors.push(CheckError::new(
                            ErrorKind::UninitedInput { var: var.into() },
                            pos.clone(),
                        ));
                    }
                }
            }
        }
        if modifiers.detism.can_fail() || call.detism == Determinism::SemiDet {
            call.detism = Determinism::SemiDet;
            state.may_fail();
        }
        out.push(Placed::new(Stmt::Call(call), pos));
    }

    /// Match one candidate's parameter flows against the actual argument
    /// modes, treating bound unknown-flow arguments as inputs.
    fn match_modes(
        &mut self,
        call: &Call,
        cand: Candidate,
        state: &BindingState,
        eff_ctx: Determinism,
    ) -> ModeMatch {
        let def = &self.module.candidates(&call.name)[cand.id];

        // Reifying the success flag makes the call deterministic
        if cand.shape != Shape::ReifiedTest && !def.detism.callable_in(eff_ctx) {
            return ModeMatch::Rejected(Reason::Determinism(def.detism));
        }

        for param in &def.proto.params {
            if let ArgFlowType::Resource(res) = &param.kind {
                if param.flow.is_in() && !self.resources.contains(res) {
                    return ModeMatch::Rejected(Reason::Resource(res.clone()));
                }
            }
        }

        let mut awaiting = VarSet::new();
        for (param, arg) in aligned(def, cand.shape, &call.args) {
            let actual = arg.node.flow();
            let var = arg.node.var_name();
            match actual {
                FlowDirection::In | FlowDirection::TakeReference => {
                    if !param.flow.is_in() {
                        return ModeMatch::Rejected(Reason::Flow(
                            var.map(Box::from).unwrap_or_else(|| "<const>".into()),
                        ));
                    }
                }
                FlowDirection::Out | FlowDirection::OutByReference => {
                    if !param.flow.is_out() {
                        return ModeMatch::Rejected(Reason::Flow(
                            var.map(Box::from).unwrap_or_else(|| "<const>".into()),
                        ));
                    }
                }
                FlowDirection::Unknown => {
                    let bound = var.is_some_and(|v| state.is_bound(v));
                    if bound {
                        // Treat as an input; it cannot match an output slot
                        if !param.flow.is_in() {
                            return ModeMatch::Rejected(Reason::Flow(
                                var.map(Box::from).unwrap_or_else(|| "<const>".into()),
                            ));
                        }
                    } else if param.flow.is_in() {
                        // Could become an input later
                        if let Some(v) = var {
                            awaiting.insert(v.into());
                        } else {
                            return ModeMatch::Rejected(Reason::Flow("<const>".into()));
                        }
                    }
                }
            }
        }
        if awaiting.is_empty() {
            ModeMatch::Exact
        } else {
            ModeMatch::Delayable(awaiting)
        }
    }

    /// Rewrite the call with its resolved overload and flows, and record
    /// everything it binds.
    fn commit_call(&mut self, call: &mut Call, cand: Candidate, state: &mut BindingState) {
        let def = &self.module.candidates(&call.name)[cand.id];
        let params = def.proto.params.clone();
        let detism = def.detism;
        call.proc_id = Some(cand.id);
        call.module = self.module.path.clone();

        let n = match cand.shape {
            Shape::Exact => call.args.len(),
            Shape::ImplicitTest => call.args.len(),
            Shape::ReifiedTest => call.args.len() - 1,
        };
        for (param, arg) in params.iter().zip(call.args.iter_mut().take(n)) {
            arg.node.set_flow(param.flow);
            if param.flow.is_out() {
                if let Some(var) = arg.node.var_name() {
                    state.bind(var);
                }
                if let ArgFlowType::Resource(res) = &param.kind {
                    self.resources.insert(res.clone());
                }
            }
        }
        if cand.shape == Shape::ReifiedTest {
            if let Some(arg) = call.args.last_mut() {
                arg.node.set_flow(FlowDirection::Out);
                if let Some(var) = arg.node.var_name() {
                    state.bind(var);
                }
            }
        }

        let fails = match cand.shape {
            // Reified success never fails the caller
            Shape::ReifiedTest => false,
            _ => detism.can_fail() || call.detism == Determinism::SemiDet,
        };
        if fails {
            state.may_fail();
        }
    }

    /// Resolve an unknown flow on a foreign argument: bound means input,
    /// unbound means output.
    fn resolve_exp_flow(
        &mut self,
        exp: &mut Exp,
        state: &BindingState,
        pos: Option<&SourcePos>,
    ) {
        let flow = exp.flow();
        if let Some(var) = exp.var_name() {
            match flow {
                FlowDirection::Unknown => {
                    if state.is_bound(var) {
                        exp.set_flow(FlowDirection::In);
                    } else {
                        exp.set_flow(FlowDirection::Out);
                    }
                }
                FlowDirection::In | FlowDirection::TakeReference => {
                    if !state.is_bound(var) {
                        self.errors.push(CheckError::new(
                            ErrorKind::UninitedInput { var: var.into() },
                            pos.cloned(),
                        ));
                    }
                }
                _ => {}
            }
        }
    }

    fn exp_type(&mut self, exp: &Exp) -> TypeSpec {
        match exp {
            Exp::Var { name, .. } => self.typing.var_type(name),
            Exp::Int(_) => TypeSpec::int(),
            Exp::Float(_) => TypeSpec::float(),
            Exp::Str(_) => TypeSpec::string(),
            Exp::Char(_) => TypeSpec::char(),
            Exp::Typed { ty, .. } => ty.clone(),
            Exp::AnonProc { .. } | Exp::ProcRef { .. } => TypeSpec::Any,
        }
    }
}

/// Variables bound in `state` that were not bound in `before`
fn newly_bound(before: &VarSet, state: &BindingState) -> VarSet {
    state
        .bound_vars()
        .map(|vars| vars.difference(before).cloned().collect())
        .unwrap_or_default()
}
