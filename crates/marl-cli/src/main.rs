//! Marl compiler driver
//!
//! Usage:
//!   marl <module.json>              - compile a scope-resolved JSON module
//!   marl --log modes <module.json>  - with mode-checking trace output
//!
//! Scanning and parsing live upstream; this driver consumes their JSON AST
//! output, runs the middle-end (closure hoisting, type and mode checking,
//! unbranching, body building, last-call analysis), and prints the
//! resulting primitive procedures.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use marl_ast::proc::{Module, ProcImpl};
use marl_ast::ser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "marl")]
#[command(version)]
#[command(about = "The Marl compiler middle-end", long_about = None)]
struct Args {
    /// Module to compile (JSON AST)
    #[arg()]
    module: PathBuf,

    /// Recompile everything, ignoring any cached object code
    #[arg(long)]
    force_all: bool,

    /// Additional library directories for module lookup
    #[arg(short = 'L', long = "lib-dir")]
    lib_dirs: Vec<PathBuf>,

    /// Comma-separated pass aspects to log (types, modes, unbranch,
    /// build, lastcall)
    #[arg(long)]
    log: Option<String>,

    /// Print the checked source form before lowering
    #[arg(long)]
    dump_ast: bool,

    /// Skip the LLVM optimisation passes downstream
    #[arg(long)]
    no_llvm_opt: bool,

    /// Disable multiple specialisation downstream
    #[arg(long)]
    no_multi_specz: bool,
}

/// Driver configuration handed to the downstream stages; the flags with no
/// consumer inside the middle-end still travel in it.
#[allow(dead_code)]
struct Config {
    force_all: bool,
    lib_dirs: Vec<PathBuf>,
    llvm_opt: bool,
    multi_specz: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let _config = Config {
        force_all: args.force_all,
        lib_dirs: args.lib_dirs.clone(),
        llvm_opt: !args.no_llvm_opt,
        multi_specz: !args.no_multi_specz,
    };

    let source = match fs::read_to_string(&args.module) {
        Ok(source) => source,
        Err(e) => {
            eprintln!(
                "{}: reading {}: {}",
                "error".red().bold(),
                args.module.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };
    let mut module: Module = match ser::from_json(&source) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("{}: invalid module JSON: {}", "error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // Anonymous procedures become ordinary (Closure) procedures first so
    // the checker sees them
    marl_lpvm::hoist_closures(&mut module);

    let outcome = marl_check::check_module(&mut module);
    if !outcome.errors.is_empty() {
        for error in &outcome.errors {
            eprintln!("{}: {}", "error".red().bold(), error);
        }
        eprintln!(
            "{}: {} error(s) in module {}",
            "failed".red().bold(),
            outcome.errors.len(),
            module.path
        );
        return ExitCode::FAILURE;
    }

    if args.dump_ast {
        for (name, defs) in &module.procs {
            for def in defs {
                println!("{} {}", "checked".cyan(), name);
                print!("{}", def);
            }
        }
    }

    if let Err(e) = marl_lpvm::transform_module(&mut module, &outcome) {
        eprintln!("{}: {}", "internal error".red().bold(), e);
        return ExitCode::FAILURE;
    }

    for defs in module.procs.values() {
        for def in defs {
            if matches!(def.body, ProcImpl::Prim { .. }) {
                print!("{}", def);
                println!();
            }
        }
    }
    ExitCode::SUCCESS
}

/// Route all pass logging through one stderr sink, filtered by aspect
fn init_logging(aspects: Option<&str>) {
    let Some(aspects) = aspects else {
        return;
    };
    let directives: Vec<String> = aspects
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|aspect| format!("{}=debug", aspect))
        .collect();
    let filter = EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new(""));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
