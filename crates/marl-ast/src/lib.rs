//! # Marl AST
//!
//! Data model of the Marl compiler middle-end: source-level statements and
//! expressions, procedure definitions, type specifications with flow
//! directions, and the primitive (LPVM) form the middle-end lowers to.
//!
//! The model is deliberately closed: every statement, expression, type, and
//! primitive is a tagged variant, and each compiler pass pattern matches at
//! its top level. Procedure definitions are created by parsing (an external
//! collaborator; see [`ser`] for the JSON interchange form), refined in
//! place by each pass, and become immutable once they reach code generation.

pub mod flow;
pub mod pos;
pub mod pretty;
pub mod prim;
pub mod proc;
pub mod ser;
pub mod stmt;
pub mod types;

/// Prelude - common imports
pub mod prelude {
    pub use crate::flow::{ArgFlowType, FlowDirection, Param, ResourceName};
    pub use crate::pos::{Placed, SourcePos};
    pub use crate::prim::{
        ForeignLang, GlobalInfo, Prim, PrimArg, PrimFork, PrimParam, PrimVar, ProcBody,
        StringVariant,
    };
    pub use crate::proc::{
        Module, ProcDef, ProcImpl, ProcProto, ProcSpec, ProcVariant, ProcVersion,
    };
    pub use crate::stmt::{Call, Exp, Stmt, VarSet};
    pub use crate::types::{
        Determinism, Inlining, ModPath, ProcModifiers, Purity, TypeFlow, TypeRepr, TypeSpec,
    };
}
