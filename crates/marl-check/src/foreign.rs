//! Foreign-call validation
//!
//! `llvm` and `lpvm` instructions have fixed signatures; the checker
//! rejects wrong arities and argument representation families. `c` calls
//! are opaque and not validated.

use marl_ast::pos::SourcePos;
use marl_ast::types::{TypeRepr, TypeSpec};

use crate::error::{CheckError, ErrorKind};

/// Representation family an argument position must belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Int,
    Float,
    Address,
    Bool,
    /// Anything; used by move/cast positions checked separately
    Any,
}

impl Family {
    fn admits(self, repr: TypeRepr) -> bool {
        match self {
            Family::Int => repr.is_int(),
            Family::Float => repr.is_float(),
            Family::Address => repr.is_address(),
            Family::Bool => repr.is_int(),
            Family::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Family::Int => "an integer",
            Family::Float => "a float",
            Family::Address => "an address",
            Family::Bool => "a bool",
            Family::Any => "any value",
        }
    }
}

/// Expected signature of a foreign operation: one family per argument, in
/// order, inputs before outputs as the instruction takes them.
pub struct OpSig {
    pub families: &'static [Family],
    /// Input positions whose representations must agree with each other
    /// and with the listed outputs (e.g. both operands of `add`)
    pub same_repr: &'static [usize],
}

const INT_BIN: OpSig = OpSig {
    families: &[Family::Int, Family::Int, Family::Int],
    same_repr: &[0, 1, 2],
};
const FLOAT_BIN: OpSig = OpSig {
    families: &[Family::Float, Family::Float, Family::Float],
    same_repr: &[0, 1, 2],
};
const INT_CMP: OpSig = OpSig {
    families: &[Family::Int, Family::Int, Family::Bool],
    same_repr: &[0, 1],
};
const FLOAT_CMP: OpSig = OpSig {
    families: &[Family::Float, Family::Float, Family::Bool],
    same_repr: &[0, 1],
};
const MOVE: OpSig = OpSig {
    families: &[Family::Any, Family::Any],
    same_repr: &[0, 1],
};
const INT_CONV: OpSig = OpSig {
    families: &[Family::Int, Family::Int],
    same_repr: &[],
};
const FP_CONV: OpSig = OpSig {
    families: &[Family::Float, Family::Float],
    same_repr: &[],
};
const FP_TO_INT: OpSig = OpSig {
    families: &[Family::Float, Family::Int],
    same_repr: &[],
};
const INT_TO_FP: OpSig = OpSig {
    families: &[Family::Int, Family::Float],
    same_repr: &[],
};

/// Signature of an `llvm` operation, if it is known
pub fn llvm_op(name: &str) -> Option<&'static OpSig> {
    match name {
        "add" | "sub" | "mul" | "udiv" | "sdiv" | "urem" | "srem" | "and" | "or" | "xor"
        | "shl" | "lshr" | "ashr" => Some(&INT_BIN),
        "fadd" | "fsub" | "fmul" | "fdiv" | "frem" => Some(&FLOAT_BIN),
        "icmp_eq" | "icmp_ne" | "icmp_ult" | "icmp_ule" | "icmp_ugt" | "icmp_uge"
        | "icmp_slt" | "icmp_sle" | "icmp_sgt" | "icmp_sge" => Some(&INT_CMP),
        "fcmp_oeq" | "fcmp_one" | "fcmp_olt" | "fcmp_ole" | "fcmp_ogt" | "fcmp_oge" => {
            Some(&FLOAT_CMP)
        }
        "move" => Some(&MOVE),
        "trunc" | "zext" | "sext" => Some(&INT_CONV),
        "fptrunc" | "fpext" => Some(&FP_CONV),
        "fptoui" | "fptosi" => Some(&FP_TO_INT),
        "uitofp" | "sitofp" => Some(&INT_TO_FP),
        _ => None,
    }
}

const ALLOC: OpSig = OpSig {
    families: &[Family::Int, Family::Address],
    same_repr: &[],
};
const ACCESS: OpSig = OpSig {
    families: &[
        Family::Address,
        Family::Int,
        Family::Int,
        Family::Int,
        Family::Any,
    ],
    same_repr: &[],
};
const MUTATE: OpSig = OpSig {
    families: &[
        Family::Address,
        Family::Address,
        Family::Int,
        Family::Int,
        Family::Int,
        Family::Int,
        Family::Any,
    ],
    same_repr: &[],
};
const CAST: OpSig = OpSig {
    families: &[Family::Any, Family::Any],
    same_repr: &[],
};
const LOAD: OpSig = OpSig {
    families: &[Family::Any, Family::Any],
    same_repr: &[],
};
const STORE: OpSig = OpSig {
    families: &[Family::Any, Family::Any],
    same_repr: &[],
};

/// Signature of an `lpvm` operation, if it is known
pub fn lpvm_op(name: &str) -> Option<&'static OpSig> {
    match name {
        "alloc" => Some(&ALLOC),
        "access" => Some(&ACCESS),
        "mutate" => Some(&MUTATE),
        "cast" => Some(&CAST),
        "load" => Some(&LOAD),
        "store" => Some(&STORE),
        _ => None,
    }
}

/// Check one foreign call against the operation tables, appending any
/// problems found.
pub fn validate_foreign(
    lang: &str,
    name: &str,
    arg_types: &[TypeSpec],
    pos: Option<&SourcePos>,
    errors: &mut Vec<CheckError>,
) {
    let sig = match lang {
        "llvm" => llvm_op(name),
        "lpvm" => lpvm_op(name),
        "c" => return,
        _ => {
            errors.push(CheckError::new(
                ErrorKind::UnknownForeignLang(lang.into()),
                pos.cloned(),
            ));
            return;
        }
    };
    let Some(sig) = sig else {
        errors.push(CheckError::new(
            ErrorKind::UnknownForeignOp {
                lang: lang.into(),
                name: name.into(),
            },
            pos.cloned(),
        ));
        return;
    };

    if arg_types.len() != sig.families.len() {
        errors.push(CheckError::new(
            ErrorKind::ForeignArity {
                name: name.into(),
                expected: sig.families.len(),
                found: arg_types.len(),
            },
            pos.cloned(),
        ));
        return;
    }

    for (index, (family, ty)) in sig.families.iter().zip(arg_types).enumerate() {
        // Unresolved types were already reported by inference
        if ty.is_any() || ty.is_invalid() || ty.is_var() {
            continue;
        }
        if !family.admits(ty.repr()) {
            errors.push(CheckError::new(
                ErrorKind::ForeignArgFamily {
                    name: name.into(),
                    index,
                    expected: family.describe(),
                    found: ty.clone(),
                },
                pos.cloned(),
            ));
        }
    }

    if let Some((&first, rest)) = sig.same_repr.split_first() {
        let Some(base) = arg_types.get(first).map(TypeSpec::repr) else {
            return;
        };
        for &index in rest {
            if let Some(ty) = arg_types.get(index) {
                if ty.is_any() || ty.is_invalid() || ty.is_var() {
                    continue;
                }
                if !ty.repr().compatible(base) {
                    errors.push(CheckError::new(
                        ErrorKind::ForeignArgFamily {
                            name: name.into(),
                            index,
                            expected: "a compatible representation",
                            found: ty.clone(),
                        },
                        pos.cloned(),
                    ));
                }
            }
        }
    }
}
