//! Constant folding and algebraic simplification of LLVM-level primitives
//!
//! Folded instructions are rewritten into `llvm move`s so the builder's
//! copy-propagation machinery picks the value up. Commutative operations
//! are canonicalised to a fixed argument order so equal computations have
//! equal shapes. Floating multiplication by zero is deliberately left
//! alone (NaN and sign-of-zero semantics).

use std::cmp::Ordering;

use marl_ast::prim::{ForeignLang, Prim, PrimArg};
use marl_ast::types::TypeSpec;

/// Simplify one instruction. The result is either the instruction itself
/// (possibly with canonicalised argument order) or a `move` of the folded
/// value.
pub fn simplify(prim: Prim) -> Prim {
    let Prim::Foreign {
        lang: ForeignLang::Llvm,
        name,
        flags,
        mut args,
    } = prim
    else {
        return prim;
    };

    if is_commutative(&name) && args.len() == 3 {
        canonical_order(&mut args);
    }

    if let Some(folded) = fold_constant(&name, &args) {
        return Prim::mov(folded, args[2].clone());
    }
    if let Some(result) = identity(&name, &args) {
        return Prim::mov(result, args[2].clone());
    }
    if let Some(rewritten) = reduce_unsigned_cmp(&name, &args) {
        return rewritten;
    }

    Prim::Foreign {
        lang: ForeignLang::Llvm,
        name,
        flags,
        args,
    }
}

fn is_commutative(name: &str) -> bool {
    matches!(
        name,
        "add" | "mul" | "and" | "or" | "xor" | "fadd" | "fmul" | "icmp_eq" | "icmp_ne"
            | "fcmp_oeq" | "fcmp_one"
    )
}

/// Structural ordering used to canonicalise commutative operands:
/// variables (by name) before constants (by value).
fn arg_order(a: &PrimArg, b: &PrimArg) -> Ordering {
    match (a, b) {
        (PrimArg::Var(va), PrimArg::Var(vb)) => va.name.cmp(&vb.name),
        (PrimArg::Var(_), _) => Ordering::Less,
        (_, PrimArg::Var(_)) => Ordering::Greater,
        (PrimArg::Int(x, _), PrimArg::Int(y, _)) => x.cmp(y),
        (PrimArg::Float(x, _), PrimArg::Float(y, _)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn canonical_order(args: &mut [PrimArg]) {
    if arg_order(&args[0], &args[1]) == Ordering::Greater {
        args.swap(0, 1);
    }
}

/// Evaluate an operation whose inputs are both constants
fn fold_constant(name: &str, args: &[PrimArg]) -> Option<PrimArg> {
    if args.len() != 3 {
        return None;
    }
    let out_ty = args[2].ty();

    if let (Some(a), Some(b)) = (args[0].int_value(), args[1].int_value()) {
        let value = match name {
            "add" => a.wrapping_add(b),
            "sub" => a.wrapping_sub(b),
            "mul" => a.wrapping_mul(b),
            "sdiv" if b != 0 => a.wrapping_div(b),
            "srem" if b != 0 => a.wrapping_rem(b),
            "udiv" if b != 0 => ((a as u64) / (b as u64)) as i64,
            "urem" if b != 0 => ((a as u64) % (b as u64)) as i64,
            "and" => a & b,
            "or" => a | b,
            "xor" => a ^ b,
            "shl" => a.wrapping_shl(b as u32),
            "ashr" => a.wrapping_shr(b as u32),
            "lshr" => ((a as u64).wrapping_shr(b as u32)) as i64,
            "icmp_eq" => (a == b) as i64,
            "icmp_ne" => (a != b) as i64,
            "icmp_slt" => (a < b) as i64,
            "icmp_sle" => (a <= b) as i64,
            "icmp_sgt" => (a > b) as i64,
            "icmp_sge" => (a >= b) as i64,
            "icmp_ult" => ((a as u64) < (b as u64)) as i64,
            "icmp_ule" => ((a as u64) <= (b as u64)) as i64,
            "icmp_ugt" => ((a as u64) > (b as u64)) as i64,
            "icmp_uge" => ((a as u64) >= (b as u64)) as i64,
            _ => return None,
        };
        return Some(PrimArg::Int(value, out_ty));
    }

    if let (Some(a), Some(b)) = (args[0].float_value(), args[1].float_value()) {
        let value = match name {
            "fadd" => a + b,
            "fsub" => a - b,
            "fmul" => a * b,
            "fdiv" => a / b,
            "frem" => a % b,
            "fcmp_oeq" => return Some(PrimArg::Int((a == b) as i64, out_ty)),
            "fcmp_one" => return Some(PrimArg::Int((a != b) as i64, out_ty)),
            "fcmp_olt" => return Some(PrimArg::Int((a < b) as i64, out_ty)),
            "fcmp_ole" => return Some(PrimArg::Int((a <= b) as i64, out_ty)),
            "fcmp_ogt" => return Some(PrimArg::Int((a > b) as i64, out_ty)),
            "fcmp_oge" => return Some(PrimArg::Int((a >= b) as i64, out_ty)),
            _ => return None,
        };
        return Some(PrimArg::float(value, out_ty));
    }

    None
}

/// Identity and annihilator laws. The returned argument replaces the whole
/// instruction as the source of a move.
fn identity(name: &str, args: &[PrimArg]) -> Option<PrimArg> {
    if args.len() != 3 {
        return None;
    }
    let (x, y) = (&args[0], &args[1]);
    let out_ty = args[2].ty();

    // After canonicalisation the constant of a commutative op is second
    match (name, y.int_value()) {
        ("add", Some(0))
        | ("sub", Some(0))
        | ("or", Some(0))
        | ("xor", Some(0))
        | ("shl", Some(0))
        | ("lshr", Some(0))
        | ("ashr", Some(0)) => return Some(x.clone()),
        ("mul", Some(1)) | ("sdiv", Some(1)) | ("udiv", Some(1)) => return Some(x.clone()),
        ("mul", Some(0)) | ("and", Some(0)) => return Some(PrimArg::Int(0, out_ty)),
        ("and", Some(-1)) => return Some(x.clone()),
        ("or", Some(-1)) => return Some(PrimArg::Int(-1, out_ty)),
        _ => {}
    }

    match (name, y.float_value()) {
        ("fmul", Some(v)) if v == 1.0 => Some(x.clone()),
        ("fdiv", Some(v)) if v == 1.0 => Some(x.clone()),
        // fmul by zero is NOT folded: NaN and the sign of zero survive
        _ => None,
    }
}

/// Unsigned comparisons against 0 and 1 reduce to equality tests
fn reduce_unsigned_cmp(name: &str, args: &[PrimArg]) -> Option<Prim> {
    if args.len() != 3 {
        return None;
    }
    let rhs = args[1].int_value()?;
    let in_ty = args[0].ty();
    let rewrite = |op: &str| {
        Some(Prim::foreign(
            ForeignLang::Llvm,
            op,
            vec![
                args[0].clone(),
                PrimArg::Int(0, in_ty.clone()),
                args[2].clone(),
            ],
        ))
    };
    match (name, rhs) {
        // x < 1  <=>  x == 0,  x >= 1  <=>  x != 0  (unsigned)
        ("icmp_ult", 1) => rewrite("icmp_eq"),
        ("icmp_uge", 1) => rewrite("icmp_ne"),
        ("icmp_ule", 0) => rewrite("icmp_eq"),
        ("icmp_ugt", 0) => rewrite("icmp_ne"),
        _ => None,
    }
}

/// The canonical CSE key of an instruction: its inputs only, flow-type
/// noise stripped.
pub fn canon_key(prim: &Prim) -> Prim {
    match prim {
        Prim::Foreign {
            lang,
            name,
            flags,
            args,
        } => Prim::Foreign {
            lang: *lang,
            name: name.clone(),
            flags: flags.clone(),
            args: args
                .iter()
                .filter(|a| a.is_input())
                .map(PrimArg::canonical)
                .collect(),
        },
        Prim::Call { spec, args } => Prim::Call {
            spec: spec.clone(),
            args: args
                .iter()
                .filter(|a| a.is_input())
                .map(PrimArg::canonical)
                .collect(),
        },
        Prim::Higher { target, args } => Prim::Higher {
            target: target.canonical(),
            args: args
                .iter()
                .filter(|a| a.is_input())
                .map(PrimArg::canonical)
                .collect(),
        },
    }
}

fn key_of(lang: ForeignLang, name: &str, inputs: Vec<PrimArg>) -> Prim {
    Prim::Foreign {
        lang,
        name: name.into(),
        flags: Vec::new(),
        args: inputs.into_iter().map(|a| a.canonical()).collect(),
    }
}

/// All keys under which a just-emitted pure instruction should be
/// recorded, paired with the outputs each key yields. Includes the
/// instruction's own canonical form, commuted forms, and invertible
/// operations run backwards.
pub fn equivalences(prim: &Prim) -> Vec<(Prim, Vec<PrimArg>)> {
    let outputs: Vec<PrimArg> = prim.outputs().map(PrimArg::canonical).collect();
    let mut keys = vec![(canon_key(prim), outputs.clone())];

    let Prim::Foreign {
        lang: ForeignLang::Llvm,
        name,
        args,
        ..
    } = prim
    else {
        if let Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } = prim
        {
            lpvm_equivalences(name, args, &mut keys);
        }
        return keys;
    };

    if args.len() == 3 {
        let a = args[0].canonical();
        let b = args[1].canonical();
        let c = outputs.first().cloned();
        if let Some(c) = c {
            if is_commutative(name) {
                keys.push((
                    key_of(ForeignLang::Llvm, name, vec![b.clone(), a.clone()]),
                    outputs.clone(),
                ));
            }
            match name.as_ref() {
                // a + b = c  implies  c - b = a  and  c - a = b
                "add" => {
                    keys.push((
                        key_of(ForeignLang::Llvm, "sub", vec![c.clone(), b.clone()]),
                        vec![a.clone()],
                    ));
                    keys.push((
                        key_of(ForeignLang::Llvm, "sub", vec![c.clone(), a.clone()]),
                        vec![b.clone()],
                    ));
                }
                // a - b = c  implies  c + b = a  and  a - c = b
                "sub" => {
                    keys.push((
                        key_of(ForeignLang::Llvm, "add", vec![c.clone(), b.clone()]),
                        vec![a.clone()],
                    ));
                    keys.push((
                        key_of(ForeignLang::Llvm, "add", vec![b.clone(), c.clone()]),
                        vec![a.clone()],
                    ));
                    keys.push((
                        key_of(ForeignLang::Llvm, "sub", vec![a.clone(), c.clone()]),
                        vec![b.clone()],
                    ));
                }
                // xor is its own inverse
                "xor" => {
                    keys.push((
                        key_of(ForeignLang::Llvm, "xor", vec![c.clone(), b.clone()]),
                        vec![a.clone()],
                    ));
                    keys.push((
                        key_of(ForeignLang::Llvm, "xor", vec![c.clone(), a.clone()]),
                        vec![b.clone()],
                    ));
                }
                // Ordered comparisons commute by swapping the relation
                "icmp_slt" | "icmp_sgt" | "icmp_sle" | "icmp_sge" | "icmp_ult" | "icmp_ugt"
                | "icmp_ule" | "icmp_uge" => {
                    keys.push((
                        key_of(ForeignLang::Llvm, swap_cmp(name), vec![b, a]),
                        outputs.clone(),
                    ));
                }
                _ => {}
            }
        }
    }

    keys
}

fn swap_cmp(name: &str) -> &'static str {
    match name {
        "icmp_slt" => "icmp_sgt",
        "icmp_sgt" => "icmp_slt",
        "icmp_sle" => "icmp_sge",
        "icmp_sge" => "icmp_sle",
        "icmp_ult" => "icmp_ugt",
        "icmp_ugt" => "icmp_ult",
        "icmp_ule" => "icmp_uge",
        "icmp_uge" => "icmp_ule",
        _ => unreachable!("not an ordered comparison"),
    }
}

fn lpvm_equivalences(name: &str, args: &[PrimArg], keys: &mut Vec<(Prim, Vec<PrimArg>)>) {
    match name {
        // access(s, off, size, start, ?v): writing v back at the same spot
        // (destructively or not) reproduces s
        "access" if args.len() == 5 => {
            let s = args[0].canonical();
            let off = args[1].canonical();
            let size = args[2].canonical();
            let start = args[3].canonical();
            let v = args[4].canonical();
            for destructive in [0, 1] {
                keys.push((
                    key_of(
                        ForeignLang::Lpvm,
                        "mutate",
                        vec![
                            s.clone(),
                            off.clone(),
                            PrimArg::Int(destructive, TypeSpec::bool()),
                            size.clone(),
                            start.clone(),
                            v.clone(),
                        ],
                    ),
                    vec![s.clone()],
                ));
            }
        }
        // mutate(s, ?s2, off, d, size, start, v): accessing the written
        // field of s2 yields v
        "mutate" if args.len() == 7 => {
            let s2 = args[1].canonical();
            let off = args[2].canonical();
            let size = args[4].canonical();
            let start = args[5].canonical();
            let v = args[6].canonical();
            keys.push((
                key_of(
                    ForeignLang::Lpvm,
                    "access",
                    vec![s2, off, size, start],
                ),
                vec![v],
            ));
        }
        // cast runs backwards
        "cast" if args.len() == 2 => {
            let a = args[0].canonical();
            let b = args[1].canonical();
            keys.push((key_of(ForeignLang::Lpvm, "cast", vec![b]), vec![a]));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marl_ast::flow::FlowDirection;

    fn var(name: &str, flow: FlowDirection) -> PrimArg {
        PrimArg::var(name, TypeSpec::int(), flow)
    }

    fn binop(name: &str, a: PrimArg, b: PrimArg) -> Prim {
        Prim::foreign(
            ForeignLang::Llvm,
            name,
            vec![a, b, var("out", FlowDirection::Out)],
        )
    }

    #[test]
    fn test_fold_constant_add() {
        let folded = simplify(binop(
            "add",
            PrimArg::int(2, TypeSpec::int()),
            PrimArg::int(3, TypeSpec::int()),
        ));
        let (src, dst) = folded.as_move().expect("folded to a move");
        assert_eq!(src.int_value(), Some(5));
        assert_eq!(dst.name.as_ref(), "out");
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let kept = simplify(binop(
            "sdiv",
            PrimArg::int(1, TypeSpec::int()),
            PrimArg::int(0, TypeSpec::int()),
        ));
        assert!(kept.as_move().is_none());
    }

    #[test]
    fn test_add_zero_identity() {
        let folded = simplify(binop(
            "add",
            var("x", FlowDirection::In),
            PrimArg::int(0, TypeSpec::int()),
        ));
        let (src, _) = folded.as_move().expect("x + 0 is x");
        assert_eq!(src.as_var().unwrap().name.as_ref(), "x");
    }

    #[test]
    fn test_mul_zero_annihilates() {
        let folded = simplify(binop(
            "mul",
            var("x", FlowDirection::In),
            PrimArg::int(0, TypeSpec::int()),
        ));
        let (src, _) = folded.as_move().unwrap();
        assert_eq!(src.int_value(), Some(0));
    }

    #[test]
    fn test_float_mul_zero_not_folded() {
        let prim = Prim::foreign(
            ForeignLang::Llvm,
            "fmul",
            vec![
                PrimArg::var("x", TypeSpec::float(), FlowDirection::In),
                PrimArg::float(0.0, TypeSpec::float()),
                PrimArg::var("out", TypeSpec::float(), FlowDirection::Out),
            ],
        );
        assert!(simplify(prim).as_move().is_none());
    }

    #[test]
    fn test_commutative_canonical_order() {
        // Constant first is rewritten to variable first
        let prim = simplify(binop(
            "add",
            PrimArg::int(1, TypeSpec::int()),
            var("x", FlowDirection::In),
        ));
        let Prim::Foreign { args, .. } = &prim else {
            panic!()
        };
        assert!(args[0].as_var().is_some());
        assert_eq!(args[1].int_value(), Some(1));
    }

    #[test]
    fn test_unsigned_cmp_reduction() {
        let prim = simplify(binop(
            "icmp_ult",
            var("x", FlowDirection::In),
            PrimArg::int(1, TypeSpec::int()),
        ));
        let Prim::Foreign { name, args, .. } = &prim else {
            panic!()
        };
        assert_eq!(name.as_ref(), "icmp_eq");
        assert_eq!(args[1].int_value(), Some(0));
    }

    #[test]
    fn test_add_records_subtraction_inverses() {
        let prim = binop("add", var("a", FlowDirection::In), var("b", FlowDirection::In));
        let keys = equivalences(&prim);
        let subs: Vec<_> = keys
            .iter()
            .filter(|(k, _)| matches!(k, Prim::Foreign { name, .. } if name.as_ref() == "sub"))
            .collect();
        assert_eq!(subs.len(), 2);
        // c - b = a
        let (_, outs) = subs
            .iter()
            .find(|(k, _)| {
                let Prim::Foreign { args, .. } = k else {
                    return false;
                };
                args[1].as_var().map(|v| v.name.as_ref()) == Some("b")
            })
            .unwrap();
        assert_eq!(outs[0].as_var().unwrap().name.as_ref(), "a");
    }

    #[test]
    fn test_mutate_records_access() {
        let mutate = Prim::foreign(
            ForeignLang::Lpvm,
            "mutate",
            vec![
                var("s", FlowDirection::In),
                var("s2", FlowDirection::Out),
                PrimArg::int(8, TypeSpec::int()),
                PrimArg::int(1, TypeSpec::int()),
                PrimArg::int(8, TypeSpec::int()),
                PrimArg::int(0, TypeSpec::int()),
                var("v", FlowDirection::In),
            ],
        );
        let keys = equivalences(&mutate);
        let access = keys
            .iter()
            .find(|(k, _)| matches!(k, Prim::Foreign { name, .. } if name.as_ref() == "access"))
            .expect("mutate records its access form");
        assert_eq!(access.1[0].as_var().unwrap().name.as_ref(), "v");
    }

    #[test]
    fn test_folding_soundness_samples() {
        // Folded result equals direct evaluation over a sample grid
        for a in [-3i64, 0, 1, 7] {
            for b in [1i64, 2, 5] {
                let folded = simplify(binop(
                    "add",
                    PrimArg::int(a, TypeSpec::int()),
                    PrimArg::int(b, TypeSpec::int()),
                ));
                let (src, _) = folded.as_move().unwrap();
                assert_eq!(src.int_value(), Some(a.wrapping_add(b)));

                let folded = simplify(binop(
                    "sdiv",
                    PrimArg::int(a, TypeSpec::int()),
                    PrimArg::int(b, TypeSpec::int()),
                ));
                let (src, _) = folded.as_move().unwrap();
                assert_eq!(src.int_value(), Some(a.wrapping_div(b)));
            }
        }
    }
}
