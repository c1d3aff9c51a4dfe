//! JSON (de)serialization of modules
//!
//! Scanning and parsing are upstream of this compiler core; modules arrive
//! scope-resolved as JSON AST and leave as printed primitive form.

use crate::proc::Module;

/// Serialize a module to pretty-printed JSON
pub fn to_json(module: &Module) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(module)
}

/// Serialize a module to compact JSON
pub fn to_json_compact(module: &Module) -> Result<String, serde_json::Error> {
    serde_json::to_string(module)
}

/// Deserialize a module from JSON
pub fn from_json(json: &str) -> Result<Module, serde_json::Error> {
    serde_json::from_str(json)
}
