//! The primitive (LPVM) form
//!
//! After unbranching and body building, a procedure body is a straight
//! sequence of primitives ending in an optional terminal fork. Forks never
//! rejoin; each branch is a complete body of its own.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::flow::{ArgFlowType, FlowDirection, ResourceName};
use crate::pos::Placed;
use crate::proc::ProcSpec;
use crate::types::TypeSpec;

/// Language tag of a foreign instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForeignLang {
    /// An LLVM instruction
    Llvm,
    /// A low-level memory primitive of this compiler
    Lpvm,
    /// A call into C; not validated
    C,
}

impl ForeignLang {
    pub fn parse(name: &str) -> Option<ForeignLang> {
        match name {
            "llvm" => Some(ForeignLang::Llvm),
            "lpvm" => Some(ForeignLang::Lpvm),
            "c" => Some(ForeignLang::C),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForeignLang::Llvm => "llvm",
            ForeignLang::Lpvm => "lpvm",
            ForeignLang::C => "c",
        }
    }
}

/// How a string literal is represented at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StringVariant {
    /// Length-prefixed native string structure
    #[default]
    Native,
    /// NUL-terminated C string
    CString,
}

/// A mutable global location
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GlobalInfo {
    Resource(ResourceName),
    Named(Box<str>),
}

/// A variable argument of a primitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimVar {
    pub name: Box<str>,
    pub ty: TypeSpec,
    pub flow: FlowDirection,
    pub kind: ArgFlowType,
    /// Set by the backward pass: no later use of this variable on this path
    pub last_use: bool,
}

impl PrimVar {
    pub fn new(name: impl Into<Box<str>>, ty: TypeSpec, flow: FlowDirection) -> Self {
        PrimVar {
            name: name.into(),
            ty,
            flow,
            kind: ArgFlowType::Ordinary,
            last_use: false,
        }
    }
}

/// An argument of a primitive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimArg {
    Var(PrimVar),
    Int(i64, TypeSpec),
    Float(OrderedFloat<f64>, TypeSpec),
    Str(Box<str>, StringVariant),
    Char(char),
    /// A procedure reference with the arguments closed over so far
    ProcRef {
        spec: ProcSpec,
        closed: Vec<PrimArg>,
        ty: TypeSpec,
    },
    Global {
        info: GlobalInfo,
        ty: TypeSpec,
    },
    /// An output the caller does not need
    Unneeded(TypeSpec),
    /// A value that is never defined on this path
    Undef(TypeSpec),
}

impl PrimArg {
    pub fn var(name: impl Into<Box<str>>, ty: TypeSpec, flow: FlowDirection) -> PrimArg {
        PrimArg::Var(PrimVar::new(name, ty, flow))
    }

    pub fn int(value: i64, ty: TypeSpec) -> PrimArg {
        PrimArg::Int(value, ty)
    }

    pub fn float(value: f64, ty: TypeSpec) -> PrimArg {
        PrimArg::Float(OrderedFloat(value), ty)
    }

    pub fn ty(&self) -> TypeSpec {
        match self {
            PrimArg::Var(v) => v.ty.clone(),
            PrimArg::Int(_, ty)
            | PrimArg::Float(_, ty)
            | PrimArg::Unneeded(ty)
            | PrimArg::Undef(ty) => ty.clone(),
            PrimArg::Str(..) => TypeSpec::string(),
            PrimArg::Char(_) => TypeSpec::char(),
            PrimArg::ProcRef { ty, .. } => ty.clone(),
            PrimArg::Global { ty, .. } => ty.clone(),
        }
    }

    /// The flow direction, treating constants as inputs
    pub fn flow(&self) -> FlowDirection {
        match self {
            PrimArg::Var(v) => v.flow,
            _ => FlowDirection::In,
        }
    }

    pub fn is_input(&self) -> bool {
        self.flow().is_in()
    }

    pub fn is_output(&self) -> bool {
        self.flow().is_out()
    }

    pub fn as_var(&self) -> Option<&PrimVar> {
        match self {
            PrimArg::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_var_mut(&mut self) -> Option<&mut PrimVar> {
        match self {
            PrimArg::Var(v) => Some(v),
            _ => None,
        }
    }

    /// An integer constant value, if this argument is one
    pub fn int_value(&self) -> Option<i64> {
        match self {
            PrimArg::Int(value, _) => Some(*value),
            _ => None,
        }
    }

    pub fn float_value(&self) -> Option<f64> {
        match self {
            PrimArg::Float(value, _) => Some(value.0),
            _ => None,
        }
    }

    /// Canonical form for value-equality comparison: flow-type noise and
    /// last-use marks stripped
    pub fn canonical(&self) -> PrimArg {
        match self {
            PrimArg::Var(v) => PrimArg::Var(PrimVar {
                name: v.name.clone(),
                ty: v.ty.clone(),
                flow: v.flow,
                kind: ArgFlowType::Ordinary,
                last_use: false,
            }),
            other => other.clone(),
        }
    }
}

/// A primitive instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prim {
    /// Call to a known procedure
    Call { spec: ProcSpec, args: Vec<PrimArg> },

    /// Call through a closure value
    Higher { target: PrimArg, args: Vec<PrimArg> },

    /// Foreign / low-level instruction
    Foreign {
        lang: ForeignLang,
        name: Box<str>,
        flags: Vec<Box<str>>,
        args: Vec<PrimArg>,
    },
}

impl Prim {
    pub fn foreign(lang: ForeignLang, name: impl Into<Box<str>>, args: Vec<PrimArg>) -> Prim {
        Prim::Foreign {
            lang,
            name: name.into(),
            flags: Vec::new(),
            args,
        }
    }

    /// An `llvm move` from `src` into the variable `dst`
    pub fn mov(src: PrimArg, dst: PrimArg) -> Prim {
        Prim::foreign(ForeignLang::Llvm, "move", vec![src, dst])
    }

    pub fn args(&self) -> &[PrimArg] {
        match self {
            Prim::Call { args, .. } | Prim::Higher { args, .. } | Prim::Foreign { args, .. } => {
                args
            }
        }
    }

    pub fn args_mut(&mut self) -> &mut Vec<PrimArg> {
        match self {
            Prim::Call { args, .. } | Prim::Higher { args, .. } | Prim::Foreign { args, .. } => {
                args
            }
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &PrimArg> {
        self.args().iter().filter(|a| a.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PrimArg> {
        self.args().iter().filter(|a| a.is_output())
    }

    /// If this is `llvm move src ?dst`, the source and destination
    pub fn as_move(&self) -> Option<(&PrimArg, &PrimVar)> {
        match self {
            Prim::Foreign {
                lang: ForeignLang::Llvm,
                name,
                args,
                ..
            } if name.as_ref() == "move" && args.len() == 2 => {
                let dst = args[1].as_var()?;
                if dst.flow.is_out() {
                    Some((&args[0], dst))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Whether this primitive can be elided when its outputs are unused and
    /// recorded for common-subexpression elimination. Calls are never
    /// treated as pure here: their effects belong to the callee.
    pub fn is_pure_instr(&self) -> bool {
        match self {
            Prim::Foreign { lang, flags, args, .. } => {
                *lang != ForeignLang::C
                    && !flags.iter().any(|f| f.as_ref() == "impure")
                    && !args.iter().any(|a| matches!(a, PrimArg::Global { .. }))
            }
            _ => false,
        }
    }

    /// Whether this primitive may read or write global locations
    pub fn touches_globals(&self) -> bool {
        match self {
            Prim::Call { .. } | Prim::Higher { .. } => true,
            Prim::Foreign { lang, args, .. } => {
                *lang == ForeignLang::C
                    || args.iter().any(|a| matches!(a, PrimArg::Global { .. }))
            }
        }
    }
}

/// A parameter of a primitive procedure prototype
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimParam {
    pub name: Box<str>,
    pub ty: TypeSpec,
    pub flow: FlowDirection,
    pub kind: ArgFlowType,
}

impl PrimParam {
    pub fn new(name: impl Into<Box<str>>, ty: TypeSpec, flow: FlowDirection) -> Self {
        PrimParam {
            name: name.into(),
            ty,
            flow,
            kind: ArgFlowType::Ordinary,
        }
    }
}

/// A primitive procedure body: a straight-line prefix and a terminal fork
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcBody {
    pub prims: Vec<Placed<Prim>>,
    pub fork: PrimFork,
}

impl ProcBody {
    pub fn new(prims: Vec<Placed<Prim>>, fork: PrimFork) -> Self {
        ProcBody { prims, fork }
    }

    pub fn straight(prims: Vec<Placed<Prim>>) -> Self {
        ProcBody {
            prims,
            fork: PrimFork::NoFork,
        }
    }

    /// Visit every primitive, including fork branches
    pub fn visit_prims<'a>(&'a self, visit: &mut impl FnMut(&'a Prim)) {
        for prim in &self.prims {
            visit(&prim.node);
        }
        if let PrimFork::Fork { branches, .. } = &self.fork {
            for branch in branches {
                branch.visit_prims(visit);
            }
        }
    }
}

/// The terminal branch of a body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum PrimFork {
    /// Fall through to the end of the procedure
    #[default]
    NoFork,
    /// Switch on the integer value of a variable; branch `i` runs when the
    /// variable equals `i`
    Fork {
        var: Box<str>,
        ty: TypeSpec,
        last_use: bool,
        branches: Vec<ProcBody>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_recognition() {
        let mov = Prim::mov(
            PrimArg::int(1, TypeSpec::int()),
            PrimArg::var("x", TypeSpec::int(), FlowDirection::Out),
        );
        let (src, dst) = mov.as_move().expect("is a move");
        assert_eq!(src.int_value(), Some(1));
        assert_eq!(dst.name.as_ref(), "x");

        let add = Prim::foreign(
            ForeignLang::Llvm,
            "add",
            vec![
                PrimArg::int(1, TypeSpec::int()),
                PrimArg::int(2, TypeSpec::int()),
                PrimArg::var("x", TypeSpec::int(), FlowDirection::Out),
            ],
        );
        assert!(add.as_move().is_none());
    }

    #[test]
    fn test_canonical_strips_last_use() {
        let mut var = PrimVar::new("x", TypeSpec::int(), FlowDirection::In);
        var.last_use = true;
        let canon = PrimArg::Var(var).canonical();
        assert!(!canon.as_var().unwrap().last_use);
    }

    #[test]
    fn test_purity() {
        let add = Prim::foreign(ForeignLang::Llvm, "add", vec![]);
        assert!(add.is_pure_instr());
        let mut imp = Prim::foreign(ForeignLang::Llvm, "add", vec![]);
        if let Prim::Foreign { flags, .. } = &mut imp {
            flags.push("impure".into());
        }
        assert!(!imp.is_pure_instr());
    }

    #[test]
    fn test_float_args_are_hashable() {
        use std::collections::HashMap;
        let mut map: HashMap<Prim, u32> = HashMap::new();
        let prim = Prim::foreign(
            ForeignLang::Llvm,
            "fadd",
            vec![PrimArg::float(1.5, TypeSpec::float())],
        );
        map.insert(prim.clone(), 1);
        assert_eq!(map.get(&prim), Some(&1));
    }
}
