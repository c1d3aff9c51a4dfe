//! Data-flow directions and parameters

use serde::{Deserialize, Serialize};

use crate::types::TypeSpec;

/// Direction data flows through an argument position
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum FlowDirection {
    /// Value flows into the callee
    #[default]
    In,
    /// Value flows out of the callee
    Out,
    /// Callee writes the value through a reference supplied by the caller
    OutByReference,
    /// Caller passes a reference for the callee to write into later
    TakeReference,
    /// Not yet determined by mode checking
    Unknown,
}

impl FlowDirection {
    pub fn is_in(self) -> bool {
        matches!(self, FlowDirection::In | FlowDirection::TakeReference)
    }

    pub fn is_out(self) -> bool {
        matches!(self, FlowDirection::Out | FlowDirection::OutByReference)
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, FlowDirection::Unknown)
    }
}

/// The name of a resource threaded through procedures as hidden parameters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceName(pub Box<str>);

impl ResourceName {
    pub fn new(name: impl Into<Box<str>>) -> Self {
        ResourceName(name.into())
    }
}

/// What kind of value an argument position carries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ArgFlowType {
    /// An ordinary positional argument
    #[default]
    Ordinary,
    /// A resource expanded into a parameter
    Resource(ResourceName),
    /// A free variable captured by a closure
    Free,
}

/// A declared parameter of a procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: Box<str>,
    pub ty: TypeSpec,
    pub flow: FlowDirection,
    pub kind: ArgFlowType,
}

impl Param {
    pub fn new(
        name: impl Into<Box<str>>,
        ty: TypeSpec,
        flow: FlowDirection,
        kind: ArgFlowType,
    ) -> Self {
        Param {
            name: name.into(),
            ty,
            flow,
            kind,
        }
    }

    /// An ordinary input parameter
    pub fn input(name: impl Into<Box<str>>, ty: TypeSpec) -> Self {
        Param::new(name, ty, FlowDirection::In, ArgFlowType::Ordinary)
    }

    /// An ordinary output parameter
    pub fn output(name: impl Into<Box<str>>, ty: TypeSpec) -> Self {
        Param::new(name, ty, FlowDirection::Out, ArgFlowType::Ordinary)
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.kind, ArgFlowType::Resource(_))
    }
}
