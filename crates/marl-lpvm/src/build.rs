//! Primitive body building with on-the-fly optimisation
//!
//! The builder assembles flattened statements into a [`ProcBody`] in two
//! phases. The forward phase appends primitives while copy-propagating
//! through a substitution, folding constants, eliminating common
//! subexpressions through a recorded-call table, forwarding global loads,
//! and pruning forks whose switch value is already known. The backward
//! phase walks the finished body bottom-up, renaming moves away, dropping
//! pure primitives whose outputs are never used, and marking the final use
//! of every input.

use std::collections::{HashMap, HashSet};

use marl_ast::flow::{ArgFlowType, FlowDirection};
use marl_ast::pos::{Placed, SourcePos};
use marl_ast::prim::{
    ForeignLang, GlobalInfo, Prim, PrimArg, PrimFork, PrimParam, PrimVar, ProcBody,
};
use marl_ast::proc::{Module, ProcDef, ProcImpl, ProcSpec};
use marl_ast::stmt::{Call, Exp, Stmt};
use marl_ast::types::TypeSpec;
use marl_check::VarTypes;
use tracing::debug;

use crate::error::{LpvmError, LpvmResult};
use crate::fold;

/// Forward-phase state of one straight-line block plus its terminal fork
#[derive(Debug, Default)]
pub struct BuildState {
    prims: Vec<Placed<Prim>>,
    /// Variables proven equal to another argument (right side of a move)
    subst: HashMap<Box<str>, PrimArg>,
    /// Canonical input-only primitive -> the outputs it produced
    recorded: HashMap<Prim, Vec<PrimArg>>,
    /// Global location -> the argument it was last loaded into / stored from
    globals: HashMap<GlobalInfo, PrimArg>,
    /// Variables written in this block
    block_defs: HashSet<Box<str>>,
    /// Variables holding the same constant in every branch of a completed
    /// fork below this block
    fork_consts: HashSet<Box<str>>,
    fork: ForkState,
}

#[derive(Debug, Default)]
enum ForkState {
    #[default]
    Unforked,
    Forked {
        var: Box<str>,
        ty: TypeSpec,
        branches: Vec<BuildState>,
    },
}

impl BuildState {
    fn child(&self, switch_var: &str, index: i64, ty: &TypeSpec) -> BuildState {
        let mut subst = self.subst.clone();
        subst.insert(switch_var.into(), PrimArg::Int(index, ty.clone()));
        BuildState {
            prims: Vec::new(),
            subst,
            recorded: self.recorded.clone(),
            globals: self.globals.clone(),
            block_defs: HashSet::new(),
            fork_consts: HashSet::new(),
            fork: ForkState::Unforked,
        }
    }
}

pub struct BodyBuilder<'m> {
    module: &'m Module,
    var_types: &'m VarTypes,
}

/// Build the primitive body of one unbranched procedure in place
pub fn build_proc(def: &mut ProcDef, module: &Module, var_types: &VarTypes) -> LpvmResult<()> {
    let ProcImpl::Source { body } = &def.body else {
        return Ok(());
    };
    let stmts = body.clone();

    let builder = BodyBuilder { module, var_types };
    let mut state = BuildState::default();
    builder.build_stmts(&mut state, &stmts)?;
    let mut prim_body = finalize(state);

    let params: Vec<PrimParam> = def
        .proto
        .params
        .iter()
        .map(|p| PrimParam {
            name: p.name.clone(),
            ty: p.ty.clone(),
            flow: normalize_flow(p.flow),
            kind: p.kind.clone(),
        })
        .collect();

    // Backward phase: dead-code elimination and last-use marking
    let mut used: HashSet<Box<str>> = params
        .iter()
        .filter(|p| p.flow.is_out())
        .map(|p| p.name.clone())
        .collect();
    backward_body(&mut prim_body, &mut used);

    debug!(target: "build", proc = %def.name, prims = prim_body.prims.len(), "built body");
    def.body = ProcImpl::Prim {
        params,
        body: prim_body,
    };
    Ok(())
}

fn normalize_flow(flow: FlowDirection) -> FlowDirection {
    match flow {
        FlowDirection::Unknown => FlowDirection::In,
        other => other,
    }
}

fn finalize(state: BuildState) -> ProcBody {
    let fork = match state.fork {
        ForkState::Unforked => PrimFork::NoFork,
        ForkState::Forked { var, ty, branches } => PrimFork::Fork {
            var,
            ty,
            last_use: false,
            branches: branches.into_iter().map(finalize).collect(),
        },
    };
    ProcBody {
        prims: state.prims,
        fork,
    }
}

impl<'m> BodyBuilder<'m> {
    fn build_stmts(&self, state: &mut BuildState, stmts: &[Placed<Stmt>]) -> LpvmResult<()> {
        for (index, stmt) in stmts.iter().enumerate() {
            match &stmt.node {
                Stmt::Nop => {}
                Stmt::Call(call) => {
                    let prim = self.call_prim(call)?;
                    self.instr(state, prim, stmt.pos.clone())?;
                }
                Stmt::Foreign {
                    lang,
                    name,
                    flags,
                    args,
                } => {
                    let lang = ForeignLang::parse(lang)
                        .ok_or_else(|| LpvmError::UnknownLang(lang.clone()))?;
                    let prim = Prim::Foreign {
                        lang,
                        name: name.clone(),
                        flags: flags.clone(),
                        args: args
                            .iter()
                            .map(|a| self.exp_arg(&a.node, None))
                            .collect::<LpvmResult<_>>()?,
                    };
                    self.instr(state, prim, stmt.pos.clone())?;
                }
                Stmt::Cond {
                    test,
                    then_branch,
                    else_branch,
                    ..
                } => {
                    if index + 1 != stmts.len() {
                        return Err(LpvmError::NotFlat(
                            "conditional is not the final statement".into(),
                        ));
                    }
                    let Stmt::TestBool(exp) = &test.node else {
                        return Err(LpvmError::NotFlat(
                            "conditional test is not a boolean test".into(),
                        ));
                    };
                    let Some(var) = exp.var_name() else {
                        return Err(LpvmError::NotFlat(
                            "conditional tests a non-variable".into(),
                        ));
                    };
                    self.build_fork(state, var, else_branch, then_branch)?;
                }
                other => {
                    return Err(LpvmError::NotFlat(format!("{}", other)));
                }
            }
        }
        Ok(())
    }

    /// Terminal fork on a boolean variable: branch 0 is the else branch,
    /// branch 1 the then branch. A switch variable with a known constant
    /// value emits only the live branch, straight-line; this is also what
    /// fuses consecutive forks on the same variable, since each branch
    /// records `var = index` in its substitution.
    fn build_fork(
        &self,
        state: &mut BuildState,
        var: &str,
        else_branch: &[Placed<Stmt>],
        then_branch: &[Placed<Stmt>],
    ) -> LpvmResult<()> {
        if !matches!(state.fork, ForkState::Unforked) {
            return Err(LpvmError::AppendAfterFork);
        }
        let ty = self
            .var_types
            .get(var)
            .cloned()
            .unwrap_or_else(TypeSpec::bool);

        if let Some(known) = resolve_var(state, var).and_then(|a| a.int_value()) {
            debug!(target: "build", var, known, "fork on known value");
            let live = if known == 0 { else_branch } else { then_branch };
            return self.build_stmts(state, live);
        }

        let mut branches = Vec::with_capacity(2);
        for (index, body) in [(0_i64, else_branch), (1, then_branch)] {
            let mut child = state.child(var, index, &ty);
            self.build_stmts(&mut child, body)?;
            branches.push(child);
        }

        // Fork completion: variables holding the same constant in every
        // branch keep that substitution in the parent.
        let consts = intersect_constants(&branches);
        for (name, value) in consts {
            state.fork_consts.insert(name.clone());
            state.subst.insert(name, value);
        }

        state.fork = ForkState::Forked {
            var: var.into(),
            ty,
            branches,
        };
        Ok(())
    }

    /// Append one instruction, running the forward rewrite rules
    fn instr(&self, state: &mut BuildState, prim: Prim, pos: Option<SourcePos>) -> LpvmResult<()> {
        if !matches!(state.fork, ForkState::Unforked) {
            return Err(LpvmError::AppendAfterFork);
        }

        // 1. rewrite inputs through the substitution
        let mut prim = prim;
        for arg in prim.args_mut() {
            if arg.is_input() {
                if let Some(var) = arg.as_var() {
                    if let Some(value) = resolve_chain(&state.subst, &var.name) {
                        *arg = as_input(value);
                    }
                }
            }
        }

        // 2. constant folding may turn the instruction into a move
        let prim = fold::simplify(prim);

        // 3. moves extend the substitution; the backward pass decides
        // whether the move itself survives
        if let Some((src, dst)) = prim.as_move() {
            state.subst.insert(dst.name.clone(), src.canonical());
            state.block_defs.insert(dst.name.clone());
            state.prims.push(Placed::new(prim, pos));
            return Ok(());
        }

        // 4. global load forwarding and redundant store elision
        if let Some((global, out)) = as_global_load(&prim) {
            if let Some(cached) = state.globals.get(&global).cloned() {
                debug!(target: "build", ?global, "forwarding global load");
                return self.instr(state, Prim::mov(as_input(cached), out), pos);
            }
            state.globals.insert(global, as_input(out));
            state.block_defs.extend(prim.outputs().filter_map(var_name));
            state.prims.push(Placed::new(prim, pos));
            return Ok(());
        }
        if let Some((global, value)) = as_global_store(&prim) {
            if state.globals.get(&global).map(PrimArg::canonical) == Some(value.canonical()) {
                debug!(target: "build", ?global, "dropping redundant store");
                return Ok(());
            }
            state.globals.insert(global, value);
            state.prims.push(Placed::new(prim, pos));
            return Ok(());
        }
        if prim.touches_globals() {
            // Anything with unknown global flows invalidates the cache
            state.globals.clear();
        }

        // 5. common subexpression elimination
        let key = fold::canon_key(&prim);
        if let Some(saved) = state.recorded.get(&key).cloned() {
            let outs: Vec<PrimArg> = prim.outputs().cloned().collect();
            if saved.len() == outs.len() {
                debug!(target: "build", prim = %prim, "rewriting as moves from recorded call");
                for (src, dst) in saved.into_iter().zip(outs) {
                    self.instr(state, Prim::mov(as_input(src), dst), pos.clone())?;
                }
                return Ok(());
            }
        }

        // 6. emit, recording pure instructions under every equivalent form
        if prim.is_pure_instr() {
            for (key, outs) in fold::equivalences(&prim) {
                state.recorded.entry(key).or_insert(outs);
            }
        }
        state.block_defs.extend(prim.outputs().filter_map(var_name));
        state.prims.push(Placed::new(prim, pos));
        Ok(())
    }

    /// Convert a resolved call statement into a primitive
    fn call_prim(&self, call: &Call) -> LpvmResult<Prim> {
        // A call with no local definition through a closure-typed variable
        // is a higher call
        if self.module.candidates(&call.name).is_empty() {
            let ty = self
                .var_types
                .get(&call.name)
                .cloned()
                .unwrap_or(TypeSpec::Any);
            if matches!(ty, TypeSpec::Higher { .. }) {
                return Ok(Prim::Higher {
                    target: PrimArg::Var(PrimVar::new(
                        call.name.clone(),
                        ty,
                        FlowDirection::In,
                    )),
                    args: call
                        .args
                        .iter()
                        .map(|a| self.exp_arg(&a.node, None))
                        .collect::<LpvmResult<_>>()?,
                });
            }
            return Err(LpvmError::Internal(format!(
                "unresolved call to {} survived checking",
                call.name
            )));
        }

        let module = if call.module.is_empty() {
            self.module.path.clone()
        } else {
            call.module.clone()
        };
        let spec = ProcSpec::new(module, call.name.clone(), call.proc_id.unwrap_or(0));
        let callee = self.module.proc(&spec);

        let mut args = Vec::with_capacity(call.args.len());
        for (index, arg) in call.args.iter().enumerate() {
            let mut prim_arg = self.exp_arg(&arg.node, None)?;
            // The callee's parameter list settles resource/free marking
            if let (Some(callee), Some(var)) = (callee, prim_arg.as_var_mut()) {
                if let Some(param) = callee.proto.params.get(index) {
                    var.kind = param.kind.clone();
                }
            }
            args.push(prim_arg);
        }
        Ok(Prim::Call { spec, args })
    }

    fn exp_arg(&self, exp: &Exp, expected: Option<&TypeSpec>) -> LpvmResult<PrimArg> {
        match exp {
            Exp::Var { name, flow } => {
                let ty = expected
                    .cloned()
                    .or_else(|| self.var_types.get(name).cloned())
                    .unwrap_or(TypeSpec::Any);
                Ok(PrimArg::Var(PrimVar::new(
                    name.clone(),
                    ty,
                    normalize_flow(*flow),
                )))
            }
            Exp::Int(value) => Ok(PrimArg::Int(
                *value,
                expected.cloned().unwrap_or_else(TypeSpec::int),
            )),
            Exp::Float(value) => Ok(PrimArg::float(
                *value,
                expected.cloned().unwrap_or_else(TypeSpec::float),
            )),
            Exp::Str(s) => Ok(PrimArg::Str(s.clone(), Default::default())),
            Exp::Char(c) => Ok(PrimArg::Char(*c)),
            Exp::Typed { exp, ty, .. } => self.exp_arg(&exp.node, Some(ty)),
            Exp::ProcRef { spec, args } => {
                let closed = args
                    .iter()
                    .map(|a| self.exp_arg(&a.node, None))
                    .collect::<LpvmResult<Vec<_>>>()?;
                let ty = expected.cloned().unwrap_or_else(|| {
                    self.module
                        .proc(spec)
                        .map(|def| TypeSpec::Higher {
                            modifiers: marl_ast::types::ProcModifiers {
                                detism: def.detism,
                                purity: def.purity,
                                inlining: def.inlining,
                            },
                            flows: def
                                .proto
                                .params
                                .iter()
                                .skip(closed.len())
                                .map(|p| {
                                    marl_ast::types::TypeFlow::new(p.ty.clone(), p.flow)
                                })
                                .collect(),
                        })
                        .unwrap_or(TypeSpec::Any)
                });
                Ok(PrimArg::ProcRef {
                    spec: spec.clone(),
                    closed,
                    ty,
                })
            }
            Exp::AnonProc { .. } => Err(LpvmError::Internal(
                "anonymous procedure survived closure hoisting".into(),
            )),
        }
    }
}

/// Follow the substitution through chained moves to a fixed point
fn resolve_chain(subst: &HashMap<Box<str>, PrimArg>, name: &str) -> Option<PrimArg> {
    let mut current = subst.get(name)?.clone();
    let mut depth = 0;
    while let Some(var) = current.as_var() {
        let Some(next) = subst.get(&var.name) else {
            break;
        };
        current = next.clone();
        depth += 1;
        if depth > subst.len() {
            break;
        }
    }
    Some(current)
}

fn resolve_var(state: &BuildState, name: &str) -> Option<PrimArg> {
    resolve_chain(&state.subst, name)
}

/// An argument reshaped as an input
fn as_input(arg: PrimArg) -> PrimArg {
    match arg {
        PrimArg::Var(mut v) => {
            v.flow = FlowDirection::In;
            v.last_use = false;
            PrimArg::Var(v)
        }
        other => other,
    }
}

fn var_name(arg: &PrimArg) -> Option<Box<str>> {
    arg.as_var().map(|v| v.name.clone())
}

/// `lpvm load(<<g>>, ?v)`
fn as_global_load(prim: &Prim) -> Option<(GlobalInfo, PrimArg)> {
    match prim {
        Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } if name.as_ref() == "load" && args.len() == 2 => {
            let PrimArg::Global { info, .. } = &args[0] else {
                return None;
            };
            args[1].as_var()?;
            Some((info.clone(), args[1].clone()))
        }
        _ => None,
    }
}

/// `lpvm store(v, <<g>>)`
fn as_global_store(prim: &Prim) -> Option<(GlobalInfo, PrimArg)> {
    match prim {
        Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } if name.as_ref() == "store" && args.len() == 2 => {
            let PrimArg::Global { info, .. } = &args[1] else {
                return None;
            };
            Some((info.clone(), args[0].clone()))
        }
        _ => None,
    }
}

/// Constant substitutions agreeing across every branch of a fork
fn intersect_constants(branches: &[BuildState]) -> Vec<(Box<str>, PrimArg)> {
    let Some((first, rest)) = branches.split_first() else {
        return Vec::new();
    };
    first
        .subst
        .iter()
        .filter(|(_, value)| value.int_value().is_some() || value.float_value().is_some())
        .filter(|(name, value)| {
            rest.iter()
                .all(|branch| branch.subst.get(*name) == Some(*value))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Backward phase
// ---------------------------------------------------------------------------

/// Walk a body bottom-up: recurse into fork branches, then scan this
/// block's primitives in reverse, renaming moves into their sources,
/// dropping dead pure primitives, and marking final uses.
pub fn backward_body(body: &mut ProcBody, used: &mut HashSet<Box<str>>) {
    if let PrimFork::Fork {
        var,
        last_use,
        branches,
        ..
    } = &mut body.fork
    {
        let mut union: HashSet<Box<str>> = HashSet::new();
        for branch in branches {
            let mut branch_used = used.clone();
            backward_body(branch, &mut branch_used);
            union.extend(branch_used);
        }
        *last_use = !union.contains(var);
        union.insert(var.clone());
        *used = union;
    }

    let block_defs: HashSet<Box<str>> = body
        .prims
        .iter()
        .flat_map(|p| p.node.outputs().filter_map(var_name))
        .collect();

    let mut rename: HashMap<Box<str>, Box<str>> = HashMap::new();
    let mut kept: Vec<Placed<Prim>> = Vec::new();

    for mut prim in body.prims.drain(..).rev() {
        apply_rename(&mut prim.node, &rename);

        // Dead: pure, no globals, and nothing reads its outputs
        let dead = prim.node.is_pure_instr()
            && prim
                .node
                .outputs()
                .all(|o| var_name(o).map(|n| !used.contains(&n)).unwrap_or(true));
        if dead {
            continue;
        }

        // A live move from a block-local variable nothing else reads later
        // becomes a rename of that variable in the code above
        if let Some((PrimArg::Var(src), dst)) = prim.node.as_move().map(|(s, d)| (s.clone(), d)) {
            if !used.contains(&src.name) && block_defs.contains(&src.name) {
                rename.insert(src.name.clone(), dst.name.clone());
                continue;
            }
        }

        // Final-use marking, then use accounting
        for arg in prim.node.args_mut() {
            if arg.is_input() {
                if let Some(var) = arg.as_var_mut() {
                    if !used.contains(&var.name) {
                        var.last_use = true;
                    }
                }
            }
        }
        let outputs: Vec<Box<str>> = prim.node.outputs().filter_map(var_name).collect();
        for out in outputs {
            used.remove(&out);
        }
        let inputs: Vec<Box<str>> = prim
            .node
            .args()
            .iter()
            .filter(|a| a.is_input())
            .filter_map(var_name)
            .collect();
        used.extend(inputs);

        kept.push(prim);
    }

    kept.reverse();
    body.prims = kept;
}

fn apply_rename(prim: &mut Prim, rename: &HashMap<Box<str>, Box<str>>) {
    if rename.is_empty() {
        return;
    }
    for arg in prim.args_mut() {
        rename_arg(arg, rename);
    }
}

fn rename_arg(arg: &mut PrimArg, rename: &HashMap<Box<str>, Box<str>>) {
    match arg {
        PrimArg::Var(var) => {
            if let Some(new) = rename.get(&var.name) {
                var.name = new.clone();
            }
        }
        PrimArg::ProcRef { closed, .. } => {
            for arg in closed {
                rename_arg(arg, rename);
            }
        }
        _ => {}
    }
}
