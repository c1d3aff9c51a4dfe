//! Type specifications for Marl
//!
//! Types are structural descriptions resolved against module-qualified type
//! names. During inference a type may still be `Any` (unknown) or a type
//! variable; `Invalid` marks a type that already produced an error so later
//! passes do not pile further errors onto it.

use serde::{Deserialize, Serialize};

use crate::flow::FlowDirection;

/// A dotted module path, e.g. `list.sort`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModPath(pub Vec<Box<str>>);

impl ModPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        ModPath(segments.into_iter().map(Into::into).collect())
    }

    /// The module holding the builtin types and primitive operations
    pub fn builtin() -> Self {
        ModPath::new(["marl"])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How certainly a procedure or statement succeeds.
///
/// The ordering is the lattice of the language: `Terminal` never returns,
/// `Failure` always fails, `Det` always succeeds, `SemiDet` may fail.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Determinism {
    Terminal,
    Failure,
    #[default]
    Det,
    SemiDet,
}

impl Determinism {
    /// Least upper bound: the determinism of an alternation
    pub fn join(self, other: Determinism) -> Determinism {
        self.max(other)
    }

    /// Greatest lower bound
    pub fn meet(self, other: Determinism) -> Determinism {
        self.min(other)
    }

    /// Determinism of `self` followed by `other`
    pub fn seq(self, other: Determinism) -> Determinism {
        use Determinism::*;
        match (self, other) {
            (Terminal, _) | (Failure, _) => self,
            (Det, d) => d,
            (SemiDet, Terminal) => SemiDet,
            (SemiDet, Failure) => Failure,
            (SemiDet, _) => SemiDet,
        }
    }

    /// Whether a callee with this determinism is legal in the given context.
    /// A `SemiDet` call needs a context prepared for failure.
    pub fn callable_in(self, context: Determinism) -> bool {
        self <= context
    }

    pub fn can_fail(self) -> bool {
        matches!(self, Determinism::Failure | Determinism::SemiDet)
    }
}

/// Purity of a procedure or foreign instruction
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Purity {
    #[default]
    Pure,
    Impure,
}

/// Inlining hint attached to a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Inlining {
    #[default]
    MayInline,
    Inline,
    NoInline,
}

/// The modifier set of a procedure or higher-order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ProcModifiers {
    pub detism: Determinism,
    pub purity: Purity,
    pub inlining: Inlining,
}

impl ProcModifiers {
    pub fn semidet() -> Self {
        ProcModifiers {
            detism: Determinism::SemiDet,
            ..Default::default()
        }
    }
}

/// One argument position of a higher-order type: its type and direction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeFlow {
    pub ty: TypeSpec,
    pub dir: FlowDirection,
}

impl TypeFlow {
    pub fn new(ty: TypeSpec, dir: FlowDirection) -> Self {
        TypeFlow { ty, dir }
    }
}

/// A type specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSpec {
    /// A named type with its module path and type parameters
    Named {
        module: ModPath,
        name: Box<str>,
        params: Vec<TypeSpec>,
    },

    /// A type variable (from a generic procedure)
    Var(Box<str>),

    /// A higher-order (procedure) type
    Higher {
        modifiers: ProcModifiers,
        flows: Vec<TypeFlow>,
    },

    /// Not yet known
    Any,

    /// A type that already produced an error
    Invalid,
}

impl TypeSpec {
    fn builtin(name: &str) -> TypeSpec {
        TypeSpec::Named {
            module: ModPath::builtin(),
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn int() -> TypeSpec {
        TypeSpec::builtin("int")
    }

    pub fn float() -> TypeSpec {
        TypeSpec::builtin("float")
    }

    pub fn bool() -> TypeSpec {
        TypeSpec::builtin("bool")
    }

    pub fn string() -> TypeSpec {
        TypeSpec::builtin("string")
    }

    pub fn char() -> TypeSpec {
        TypeSpec::builtin("char")
    }

    /// A zero-size type used for pure resource threading
    pub fn phantom() -> TypeSpec {
        TypeSpec::builtin("phantom")
    }

    pub fn named(module: ModPath, name: impl Into<Box<str>>) -> TypeSpec {
        TypeSpec::Named {
            module,
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, TypeSpec::Any)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, TypeSpec::Invalid)
    }

    pub fn is_var(&self) -> bool {
        matches!(self, TypeSpec::Var(_))
    }

    /// Whether any `Any` or type variable occurs in this type
    pub fn is_fully_resolved(&self) -> bool {
        match self {
            TypeSpec::Any | TypeSpec::Var(_) => false,
            TypeSpec::Invalid => true,
            TypeSpec::Named { params, .. } => params.iter().all(TypeSpec::is_fully_resolved),
            TypeSpec::Higher { flows, .. } => {
                flows.iter().all(|flow| flow.ty.is_fully_resolved())
            }
        }
    }

    /// Structural compatibility: `Any` and type variables match anything,
    /// otherwise module, name, and arity must agree and parameters must be
    /// pairwise compatible.
    pub fn compatible(&self, other: &TypeSpec) -> bool {
        match (self, other) {
            (TypeSpec::Invalid, _) | (_, TypeSpec::Invalid) => true,
            (TypeSpec::Any, _) | (_, TypeSpec::Any) => true,
            (TypeSpec::Var(_), _) | (_, TypeSpec::Var(_)) => true,
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
            ) => {
                m1 == m2
                    && n1 == n2
                    && p1.len() == p2.len()
                    && p1.iter().zip(p2).all(|(a, b)| a.compatible(b))
            }
            (
                TypeSpec::Higher {
                    modifiers: md1,
                    flows: f1,
                },
                TypeSpec::Higher {
                    modifiers: md2,
                    flows: f2,
                },
            ) => {
                md1 == md2
                    && f1.len() == f2.len()
                    && f1
                        .iter()
                        .zip(f2)
                        .all(|(a, b)| a.dir == b.dir && a.ty.compatible(&b.ty))
            }
            _ => false,
        }
    }

    /// Low-level representation of a value of this type
    pub fn repr(&self) -> TypeRepr {
        match self {
            TypeSpec::Named { module, name, .. } if *module == ModPath::builtin() => {
                match name.as_ref() {
                    "int" => TypeRepr::Signed(64),
                    "float" => TypeRepr::Float(64),
                    "bool" => TypeRepr::Bits(1),
                    "char" => TypeRepr::Bits(8),
                    "phantom" => TypeRepr::Bits(0),
                    _ => TypeRepr::Address,
                }
            }
            _ => TypeRepr::Address,
        }
    }
}

/// Machine-level representation family of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRepr {
    /// Unsigned bit field of the given width
    Bits(u16),
    /// Signed integer of the given width
    Signed(u16),
    /// IEEE float of the given width
    Float(u16),
    /// Pointer-sized address (heap structures, strings, closures)
    Address,
}

impl TypeRepr {
    /// Integer family: plain bits or signed
    pub fn is_int(self) -> bool {
        matches!(self, TypeRepr::Bits(_) | TypeRepr::Signed(_))
    }

    pub fn is_float(self) -> bool {
        matches!(self, TypeRepr::Float(_))
    }

    pub fn is_address(self) -> bool {
        matches!(self, TypeRepr::Address)
    }

    /// Whether two representations can occupy the same register class
    pub fn compatible(self, other: TypeRepr) -> bool {
        match (self, other) {
            (TypeRepr::Address, TypeRepr::Address) => true,
            (TypeRepr::Float(a), TypeRepr::Float(b)) => a == b,
            (a, b) if a.is_int() && b.is_int() => true,
            // Address and full-width int interconvert through lpvm cast
            (TypeRepr::Address, b) if b.is_int() => true,
            (a, TypeRepr::Address) if a.is_int() => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism_lattice() {
        use Determinism::*;
        assert_eq!(Det.join(SemiDet), SemiDet);
        assert_eq!(Failure.join(Det), Det);
        assert_eq!(SemiDet.meet(Det), Det);
        assert!(Det.callable_in(SemiDet));
        assert!(!SemiDet.callable_in(Det));
    }

    #[test]
    fn test_determinism_seq() {
        use Determinism::*;
        assert_eq!(Det.seq(SemiDet), SemiDet);
        assert_eq!(SemiDet.seq(Det), SemiDet);
        assert_eq!(SemiDet.seq(Failure), Failure);
        assert_eq!(Failure.seq(SemiDet), Failure);
    }

    #[test]
    fn test_compatibility() {
        assert!(TypeSpec::int().compatible(&TypeSpec::Any));
        assert!(TypeSpec::int().compatible(&TypeSpec::Var("T".into())));
        assert!(!TypeSpec::int().compatible(&TypeSpec::float()));
        assert!(TypeSpec::int().compatible(&TypeSpec::int()));
        assert_ne!(TypeSpec::int(), TypeSpec::Any);
    }

    #[test]
    fn test_nested_compatibility() {
        let list_any = TypeSpec::Named {
            module: ModPath::builtin(),
            name: "list".into(),
            params: vec![TypeSpec::Any],
        };
        let list_int = TypeSpec::Named {
            module: ModPath::builtin(),
            name: "list".into(),
            params: vec![TypeSpec::int()],
        };
        let list_float = TypeSpec::Named {
            module: ModPath::builtin(),
            name: "list".into(),
            params: vec![TypeSpec::float()],
        };
        assert!(list_any.compatible(&list_int));
        assert!(!list_int.compatible(&list_float));
    }

    #[test]
    fn test_repr_families() {
        assert!(TypeSpec::int().repr().is_int());
        assert!(TypeSpec::bool().repr().is_int());
        assert!(TypeSpec::float().repr().is_float());
        assert!(TypeSpec::string().repr().is_address());
        assert!(TypeSpec::int().repr().compatible(TypeSpec::bool().repr()));
        assert!(!TypeSpec::int().repr().compatible(TypeSpec::float().repr()));
    }
}
