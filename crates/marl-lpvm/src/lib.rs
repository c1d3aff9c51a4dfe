//! # Marl LPVM lowering
//!
//! Turns type-and-mode-checked procedures into primitive (LPVM) form in
//! three passes: unbranching flattens structured control into bodies whose
//! only branching is a terminal fork, the body builder assembles and
//! optimises the primitive instruction sequences, and last-call analysis
//! rewrites tail-call-modulo-cons recursions into true tail calls with
//! by-reference outputs.
//!
//! Procedures the checker reported errors for never enter these passes.

pub mod build;
pub mod error;
pub mod fold;
pub mod lastcall;
pub mod unbranch;

use std::collections::BTreeMap;

use marl_ast::proc::{Module, ProcDef, ProcImpl, ProcSpec};
use marl_check::{CheckOutcome, VarTypes};
use tracing::debug;

pub use error::{LpvmError, LpvmResult};
pub use unbranch::hoist_closures;

/// Lower every successfully checked procedure of a module to primitive
/// form: unbranch, build, then last-call analysis.
pub fn transform_module(module: &mut Module, outcome: &CheckOutcome) -> LpvmResult<()> {
    let module_path = module.path.clone();
    let mut var_types: BTreeMap<ProcSpec, VarTypes> = outcome.var_types.clone();

    // Unbranch, collecting the procedures lifted out of loops and
    // continuations; they share their parent's variable typing.
    let mut generated: Vec<(ProcDef, VarTypes)> = Vec::new();
    for spec in module.proc_specs() {
        if outcome.failed.contains(&spec) {
            debug!(target: "unbranch", proc = %spec, "skipping failed procedure");
            continue;
        }
        let mut vt = var_types.get(&spec).cloned().unwrap_or_default();
        let Some(def) = module.proc_mut(&spec) else {
            continue;
        };
        let new_procs = unbranch::unbranch_proc(def, &module_path, &mut vt)?;
        for new_def in new_procs {
            generated.push((new_def, vt.clone()));
        }
        var_types.insert(spec, vt);
    }
    for (def, vt) in generated {
        let spec = module.add_proc(def);
        var_types.insert(spec, vt);
    }

    // Build primitive bodies. The definition is taken out so the builder
    // can read callee prototypes from the module while rewriting it.
    for spec in module.proc_specs() {
        if outcome.failed.contains(&spec) {
            continue;
        }
        let Some(def) = module.proc(&spec) else {
            continue;
        };
        if !matches!(def.body, ProcImpl::Source { .. }) {
            continue;
        }
        let vt = var_types.get(&spec).cloned().unwrap_or_default();
        let mut def = def.clone();
        build::build_proc(&mut def, module, &vt)?;
        if let Some(slot) = module.proc_mut(&spec) {
            *slot = def;
        }
    }

    lastcall::lastcall_module(module)
}
