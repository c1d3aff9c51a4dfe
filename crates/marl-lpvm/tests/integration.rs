//! Integration tests for the lowering pipeline
//!
//! These drive the full middle-end: closure hoisting, type and mode
//! checking, unbranching, body building, and last-call analysis, then
//! assert the structural invariants of the primitive form.

use std::collections::BTreeSet;

use marl_ast::flow::{FlowDirection, Param};
use marl_ast::pos::Placed;
use marl_ast::prim::{Prim, PrimFork, ProcBody};
use marl_ast::proc::{Module, ProcDef, ProcImpl, ProcProto, ProcSpec, ProcVariant};
use marl_ast::stmt::{Call, Exp, Stmt, VarSet};
use marl_ast::types::{Determinism, ModPath, TypeSpec};

fn placed(stmt: Stmt) -> Placed<Stmt> {
    Placed::unplaced(stmt)
}

fn in_var(name: &str) -> Placed<Exp> {
    Placed::unplaced(Exp::var_get(name))
}

fn out_var(name: &str) -> Placed<Exp> {
    Placed::unplaced(Exp::var_set(name))
}

fn unknown(name: &str) -> Placed<Exp> {
    Placed::unplaced(Exp::var_unknown(name))
}

fn int(value: i64) -> Placed<Exp> {
    Placed::unplaced(Exp::Int(value))
}

fn add_proc() -> ProcDef {
    ProcDef::new(
        ProcProto::new(
            "add",
            vec![
                Param::input("x", TypeSpec::int()),
                Param::input("y", TypeSpec::int()),
                Param::output("z", TypeSpec::int()),
            ],
        ),
        vec![placed(Stmt::foreign(
            "llvm",
            "add",
            vec![in_var("x"), in_var("y"), out_var("z")],
        ))],
    )
}

fn less_proc() -> ProcDef {
    let mut def = ProcDef::new(
        ProcProto::new(
            "less",
            vec![
                Param::input("x", TypeSpec::int()),
                Param::input("y", TypeSpec::int()),
            ],
        ),
        vec![
            placed(Stmt::foreign(
                "llvm",
                "icmp_slt",
                vec![in_var("x"), in_var("y"), out_var("cmp")],
            )),
            placed(Stmt::TestBool(Exp::var_get("cmp"))),
        ],
    );
    def.detism = Determinism::SemiDet;
    def
}

fn base_module() -> Module {
    let mut module = Module::new(ModPath::new(["m"]));
    module.add_proc(add_proc());
    module.add_proc(less_proc());
    module
}

/// Run the whole middle-end over a module
fn compile(module: &mut Module) {
    marl_lpvm::hoist_closures(module);
    let outcome = marl_check::check_module(module);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    marl_lpvm::transform_module(module, &outcome).unwrap();
}

fn prim_body<'a>(module: &'a Module, name: &str) -> (&'a Vec<marl_ast::prim::PrimParam>, &'a ProcBody) {
    let def = &module.candidates(name)[0];
    match &def.body {
        ProcImpl::Prim { params, body } => (params, body),
        other => panic!("{} not lowered: {:?}", name, other),
    }
}

/// Every input variable marked last-use really has no later reference on
/// the same path (including the fork variable and branches).
fn assert_last_use_sound(body: &ProcBody) {
    fn later_vars(prims: &[Placed<Prim>], fork: &PrimFork) -> BTreeSet<Box<str>> {
        let mut vars = BTreeSet::new();
        for prim in prims {
            for arg in prim.node.args() {
                if let Some(var) = arg.as_var() {
                    vars.insert(var.name.clone());
                }
            }
        }
        if let PrimFork::Fork { var, branches, .. } = fork {
            vars.insert(var.clone());
            for branch in branches {
                vars.extend(later_vars(&branch.prims, &branch.fork));
            }
        }
        vars
    }

    for (index, prim) in body.prims.iter().enumerate() {
        let after = later_vars(&body.prims[index + 1..], &body.fork);
        for arg in prim.node.args() {
            if let Some(var) = arg.as_var() {
                if var.flow == FlowDirection::In && var.last_use {
                    assert!(
                        !after.contains(&var.name),
                        "{} marked last-use but referenced later",
                        var.name
                    );
                }
            }
        }
    }
    if let PrimFork::Fork { branches, .. } = &body.fork {
        for branch in branches {
            assert_last_use_sound(branch);
        }
    }
}

#[test]
fn test_det_proc_lowers_to_prim_body() {
    let mut module = base_module();
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "twice",
            vec![
                Param::input("n", TypeSpec::int()),
                Param::output("r", TypeSpec::int()),
            ],
        ),
        vec![placed(Stmt::call(
            "add",
            vec![in_var("n"), in_var("n"), unknown("r")],
        ))],
    ));
    compile(&mut module);

    let (params, body) = prim_body(&module, "twice");
    assert_eq!(params.len(), 2);
    assert!(matches!(body.fork, PrimFork::NoFork));
    assert_eq!(body.prims.len(), 1);
    assert!(matches!(&body.prims[0].node, Prim::Call { spec, .. }
        if spec.name.as_ref() == "add"));
    assert_last_use_sound(body);
}

#[test]
fn test_semidet_prototype_gains_one_bool_output() {
    let mut module = base_module();
    compile(&mut module);

    let (params, body) = prim_body(&module, "less");
    // Two declared parameters plus exactly one success output at the end
    assert_eq!(params.len(), 3);
    let success = params.last().unwrap();
    assert_eq!(success.ty, TypeSpec::bool());
    assert!(success.flow.is_out());

    // The lowered body is deterministic: a fork whose branches both set
    // the flag
    let PrimFork::Fork { branches, .. } = &body.fork else {
        panic!("expected fork on the comparison result")
    };
    assert_eq!(branches.len(), 2);
    for branch in branches {
        let (src, dst) = branch.prims.last().unwrap().node.as_move().unwrap();
        assert_eq!(dst.name.as_ref(), success.name.as_ref());
        assert!(src.int_value().is_some());
    }
    assert_last_use_sound(body);
}

#[test]
fn test_conditional_lowers_to_terminal_fork() {
    // max(x, y, ?m): if less(x, y) then m = y else m = x
    let mut module = base_module();
    let mov = |src: &str, dst: &str| {
        placed(Stmt::foreign("llvm", "move", vec![in_var(src), out_var(dst)]))
    };
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "max",
            vec![
                Param::input("x", TypeSpec::int()),
                Param::input("y", TypeSpec::int()),
                Param::output("m", TypeSpec::int()),
            ],
        ),
        vec![placed(Stmt::Cond {
            test: Box::new(placed(Stmt::Call(Call::test(
                "less",
                vec![in_var("x"), in_var("y")],
            )))),
            then_branch: vec![mov("y", "m")],
            else_branch: vec![mov("x", "m")],
            test_vars: None,
            exit_vars: None,
        })],
    ));
    compile(&mut module);

    let (_, body) = prim_body(&module, "max");
    // One call to the lowered test, then a terminal two-way fork
    assert_eq!(body.prims.len(), 1);
    let Prim::Call { spec, args } = &body.prims[0].node else {
        panic!("expected call to less")
    };
    assert_eq!(spec.name.as_ref(), "less");
    assert_eq!(args.len(), 3, "call carries the success output");
    let PrimFork::Fork { branches, last_use, .. } = &body.fork else {
        panic!("expected terminal fork")
    };
    assert_eq!(branches.len(), 2);
    assert!(*last_use, "nothing reads the test flag after the fork");
    for branch in branches {
        assert!(matches!(branch.fork, PrimFork::NoFork));
    }
    assert_last_use_sound(body);
}

#[test]
fn test_loop_compiles_through_generated_procs() {
    // sum to zero:
    //   do { if less(n, 1):: break; add(acc, n, ?acc2); add(n, -1, ?n2);
    //        ... next }  r = acc''
    // The loop becomes generated procedures; the whole module still lowers
    // to primitive form everywhere.
    let mut module = base_module();
    let cond = Stmt::Cond {
        test: Box::new(placed(Stmt::Call(Call::test(
            "less",
            vec![in_var("n"), int(1)],
        )))),
        then_branch: vec![placed(Stmt::Break)],
        else_branch: vec![],
        test_vars: None,
        exit_vars: None,
    };
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "drain",
            vec![
                Param::input("n", TypeSpec::int()),
                Param::output("r", TypeSpec::int()),
            ],
        ),
        vec![
            placed(Stmt::Loop {
                body: vec![placed(cond), placed(Stmt::Nop)],
                exit_vars: None,
            }),
            placed(Stmt::foreign(
                "llvm",
                "move",
                vec![in_var("n"), out_var("r")],
            )),
        ],
    ));
    compile(&mut module);

    // The loop body and break continuation both became procedures
    let generated: Vec<&str> = module
        .procs
        .keys()
        .map(|n| n.as_ref())
        .filter(|n| n.contains('#'))
        .collect();
    assert!(generated.iter().any(|n| n.contains("#next")));
    assert!(generated.iter().any(|n| n.contains("#brk")));

    // Everything, generated procedures included, is in primitive form
    for (name, defs) in &module.procs {
        for def in defs {
            assert!(
                matches!(def.body, ProcImpl::Prim { .. }),
                "{} not lowered",
                name
            );
            if name.contains('#') {
                assert_eq!(def.variant, ProcVariant::Generated);
            }
        }
    }

    // The drain body itself is a single call into the loop entry
    let (_, body) = prim_body(&module, "drain");
    assert_eq!(body.prims.len(), 1);
    assert!(matches!(&body.prims[0].node, Prim::Call { spec, .. }
        if spec.name.contains("#next")));
}

#[test]
fn test_cse_and_folding_through_pipeline() {
    // r = (a + b) + (a + b) builds one add feeding itself
    let mut module = base_module();
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "double_sum",
            vec![
                Param::input("a", TypeSpec::int()),
                Param::input("b", TypeSpec::int()),
                Param::output("r", TypeSpec::int()),
            ],
        ),
        vec![
            placed(Stmt::call(
                "add",
                vec![in_var("a"), in_var("b"), unknown("t1")],
            )),
            placed(Stmt::call(
                "add",
                vec![in_var("a"), in_var("b"), unknown("t2")],
            )),
            placed(Stmt::call(
                "add",
                vec![in_var("t1"), in_var("t2"), unknown("r")],
            )),
        ],
    ));
    compile(&mut module);

    let (_, body) = prim_body(&module, "double_sum");
    // Procedure calls are not subject to CSE (the callee owns its
    // effects), so all three calls survive to inlining downstream; the
    // body must still be flat and last-use sound.
    assert_eq!(body.prims.len(), 3);
    assert_last_use_sound(body);
}

#[test]
fn test_printed_form_is_stable() {
    let mut module = base_module();
    compile(&mut module);
    let first: Vec<String> = module
        .procs
        .values()
        .flatten()
        .map(|def| def.to_string())
        .collect();
    let second: Vec<String> = module
        .procs
        .values()
        .flatten()
        .map(|def| def.to_string())
        .collect();
    assert_eq!(first, second);

    // An independently compiled copy prints identically
    let mut again = base_module();
    compile(&mut again);
    let third: Vec<String> = again
        .procs
        .values()
        .flatten()
        .map(|def| def.to_string())
        .collect();
    assert_eq!(first, third);
}

#[test]
fn test_var_set_alias() {
    // VarSet is shared between passes; keep its ordering deterministic
    let mut vars = VarSet::new();
    vars.insert("b".into());
    vars.insert("a".into());
    let order: Vec<&str> = vars.iter().map(|v| v.as_ref()).collect();
    assert_eq!(order, vec!["a", "b"]);
}

#[test]
fn test_checked_module_survives_json_round_trip() {
    let mut module = base_module();
    compile(&mut module);
    let json = marl_ast::ser::to_json(&module).unwrap();
    let back = marl_ast::ser::from_json(&json).unwrap();
    assert_eq!(module, back);
}

fn list_ty() -> TypeSpec {
    TypeSpec::named(ModPath::new(["m"]), "list")
}

fn lpvm_stmt(name: &str, args: Vec<Placed<Exp>>) -> Placed<Stmt> {
    placed(Stmt::foreign("lpvm", name, args))
}

/// A recursive list reverse whose cons tail field is written from the
/// recursive call's output
fn reverse_body(recurse: &str, rec_args: Vec<Placed<Exp>>) -> Vec<Placed<Stmt>> {
    vec![
        lpvm_stmt(
            "access",
            vec![in_var("xs"), int(8), int(8), int(0), out_var("t")],
        ),
        lpvm_stmt("alloc", vec![int(16), out_var("cell")]),
        placed(Stmt::call(recurse, rec_args)),
        lpvm_stmt(
            "mutate",
            vec![
                in_var("cell"),
                out_var("result"),
                int(8),
                int(1),
                int(8),
                int(0),
                in_var("r"),
            ],
        ),
    ]
}

fn prim_kinds(body: &ProcBody) -> Vec<String> {
    body.prims
        .iter()
        .map(|p| match &p.node {
            Prim::Call { .. } => "call".to_string(),
            Prim::Foreign { name, .. } => name.to_string(),
            Prim::Higher { .. } => "higher".to_string(),
        })
        .collect()
}

#[test]
fn test_tcmc_through_pipeline() {
    let mut module = base_module();
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "rev",
            vec![
                Param::input("xs", list_ty()),
                Param::output("result", list_ty()),
            ],
        ),
        reverse_body("rev", vec![in_var("t"), unknown("r")]),
    ));
    compile(&mut module);

    let (params, body) = prim_body(&module, "rev");
    // The output fed by the final mutate became by-reference
    assert_eq!(params[1].flow, FlowDirection::OutByReference);

    // The recursive call is in tail position before the annotated mutate
    assert_eq!(prim_kinds(body), vec!["access", "alloc", "call", "mutate"]);
    let Prim::Call { args, .. } = &body.prims[2].node else {
        panic!("expected the recursive call")
    };
    assert_eq!(
        args[1].as_var().unwrap().flow,
        FlowDirection::OutByReference
    );
    let Prim::Foreign { args, .. } = &body.prims[3].node else {
        panic!("expected the cons mutate")
    };
    assert_eq!(
        args[6].as_var().unwrap().flow,
        FlowDirection::TakeReference
    );
}

#[test]
fn test_interposed_tail_read_blocks_tcmc_through_pipeline() {
    // As above, but a probe reads the mutate's output before the leaf
    // ends. The probe can neither hoist above the call (its input is
    // defined by the mutate) nor join a mutate chain, so the transform
    // must leave the whole leaf alone, in order.
    let mut module = base_module();
    let mut body = reverse_body("rev2", vec![in_var("t"), unknown("r"), unknown("junk")]);
    body.push(lpvm_stmt(
        "access",
        vec![in_var("result"), int(0), int(8), int(0), out_var("probe")],
    ));
    module.add_proc(ProcDef::new(
        ProcProto::new(
            "rev2",
            vec![
                Param::input("xs", list_ty()),
                Param::output("result", list_ty()),
                Param::output("probe", list_ty()),
            ],
        ),
        body,
    ));
    compile(&mut module);

    let (params, body) = prim_body(&module, "rev2");
    assert!(
        params.iter().all(|p| p.flow != FlowDirection::OutByReference),
        "no output may be converted: {:?}",
        params
    );
    // Original order: nothing hoisted past its definition
    assert_eq!(
        prim_kinds(body),
        vec!["access", "alloc", "call", "mutate", "access"]
    );
    for prim in &body.prims {
        for arg in prim.node.args() {
            if let Some(var) = arg.as_var() {
                assert_ne!(var.flow, FlowDirection::TakeReference);
            }
        }
    }
}

#[test]
fn test_failed_proc_is_not_lowered() {
    let mut module = base_module();
    module.add_proc(ProcDef::new(
        ProcProto::new("broken", vec![]),
        vec![placed(Stmt::call("nonesuch", vec![]))],
    ));
    marl_lpvm::hoist_closures(&mut module);
    let outcome = marl_check::check_module(&mut module);
    assert!(!outcome.errors.is_empty());
    marl_lpvm::transform_module(&mut module, &outcome).unwrap();

    let broken = module
        .proc(&ProcSpec::new(module.path.clone(), "broken", 0))
        .unwrap();
    assert!(matches!(broken.body, ProcImpl::Source { .. }));
    // The clean procedures still lowered
    let (_, body) = prim_body(&module, "add");
    assert!(!body.prims.is_empty());
}
