//! Procedure definitions and modules

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::flow::{Param, ResourceName};
use crate::pos::{Placed, SourcePos};
use crate::prim::{PrimParam, ProcBody};
use crate::stmt::Stmt;
use crate::types::{Determinism, Inlining, ModPath, Purity};

/// Which generalisation of a procedure a spec refers to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ProcVersion {
    #[default]
    General,
    Specialized(u32),
}

/// Unique identifier of one procedure
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcSpec {
    pub module: ModPath,
    pub name: Box<str>,
    pub id: usize,
    pub version: ProcVersion,
}

impl ProcSpec {
    pub fn new(module: ModPath, name: impl Into<Box<str>>, id: usize) -> Self {
        ProcSpec {
            module,
            name: name.into(),
            id,
            version: ProcVersion::General,
        }
    }
}

/// How a procedure came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcVariant {
    /// Written by the programmer
    #[default]
    Normal,
    /// Lifted by unbranching (loop bodies, continuations)
    Generated,
    /// Hoisted closure; leading parameters are the captured variables
    Closure,
    /// An anonymous procedure expression before hoisting
    Anonymous,
}

/// The declared interface of a procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcProto {
    pub name: Box<str>,
    pub params: Vec<Param>,
    pub resources: BTreeSet<ResourceName>,
}

impl ProcProto {
    pub fn new(name: impl Into<Box<str>>, params: Vec<Param>) -> Self {
        ProcProto {
            name: name.into(),
            params,
            resources: BTreeSet::new(),
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.flow.is_in())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.flow.is_out())
    }
}

/// The body of a procedure: source statements before unbranching and body
/// building, primitive form afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcImpl {
    Source { body: Vec<Placed<Stmt>> },
    Prim { params: Vec<PrimParam>, body: ProcBody },
}

impl ProcImpl {
    pub fn empty() -> Self {
        ProcImpl::Source { body: Vec::new() }
    }
}

/// One procedure definition.
///
/// Created by parsing, refined in place by each pass, immutable once it
/// reaches code generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcDef {
    pub name: Box<str>,
    pub proto: ProcProto,
    pub variant: ProcVariant,
    pub body: ProcImpl,
    pub detism: Determinism,
    pub purity: Purity,
    pub inlining: Inlining,
    /// Next fresh temporary number, threaded through every pass
    pub temp_count: u32,
    /// Whether the procedure is visible outside its module
    pub public: bool,
    pub pos: Option<SourcePos>,
}

impl ProcDef {
    pub fn new(proto: ProcProto, body: Vec<Placed<Stmt>>) -> Self {
        ProcDef {
            name: proto.name.clone(),
            proto,
            variant: ProcVariant::Normal,
            body: ProcImpl::Source { body },
            detism: Determinism::Det,
            purity: Purity::Pure,
            inlining: Inlining::MayInline,
            temp_count: 0,
            public: false,
            pos: None,
        }
    }

    /// Mint a fresh temporary variable name
    pub fn next_temp(&mut self) -> Box<str> {
        let name = format!("tmp${}", self.temp_count);
        self.temp_count += 1;
        name.into()
    }
}

/// A module: an ordered collection of (possibly overloaded) procedures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Module {
    pub path: ModPath,
    pub procs: BTreeMap<Box<str>, Vec<ProcDef>>,
}

impl Module {
    pub fn new(path: ModPath) -> Self {
        Module {
            path,
            procs: BTreeMap::new(),
        }
    }

    /// Add a procedure, returning the spec that identifies it
    pub fn add_proc(&mut self, def: ProcDef) -> ProcSpec {
        let name = def.name.clone();
        let overloads = self.procs.entry(name.clone()).or_default();
        let id = overloads.len();
        overloads.push(def);
        ProcSpec::new(self.path.clone(), name, id)
    }

    /// All overloads sharing a name
    pub fn candidates(&self, name: &str) -> &[ProcDef] {
        self.procs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn proc(&self, spec: &ProcSpec) -> Option<&ProcDef> {
        self.procs.get(&spec.name)?.get(spec.id)
    }

    pub fn proc_mut(&mut self, spec: &ProcSpec) -> Option<&mut ProcDef> {
        self.procs.get_mut(&spec.name)?.get_mut(spec.id)
    }

    /// Specs of every procedure, in deterministic order
    pub fn proc_specs(&self) -> Vec<ProcSpec> {
        self.procs
            .iter()
            .flat_map(|(name, defs)| {
                let path = self.path.clone();
                (0..defs.len()).map(move |id| ProcSpec::new(path.clone(), name.clone(), id))
            })
            .collect()
    }
}
