//! Nox CLI
//!
//! Tools for working with compiled module images: `inspect` prints the
//! type table, function table and a disassembly; `run` executes an
//! exported function on the VM or the native back-end.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};

use nox_core::context::ExecutionContext;
use nox_core::functions::{FunctionEntry, FunctionId};
use nox_core::module::Export;
use nox_core::serialize::load_module;

#[derive(Parser)]
#[command(name = "nox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Nox module tools - inspect and run compiled modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    Vm,
    Jit,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tables and disassembly of a module image
    Inspect {
        /// Path to the module image
        input: PathBuf,
    },

    /// Execute an exported function of a module image
    Run {
        /// Path to the module image
        input: PathBuf,

        /// Exported function to call
        #[arg(long, default_value = "main")]
        entry: String,

        /// Which back-end executes the module
        #[arg(long, value_enum, default_value_t = BackendChoice::Vm)]
        backend: BackendChoice,

        /// VM stack size in bytes
        #[arg(long, default_value_t = 1 << 20)]
        stack_size: usize,

        /// Integer arguments passed to the entry function
        args: Vec<i64>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Inspect { input } => inspect(&input),
        Commands::Run { input, entry, backend, stack_size, args } => {
            run(&input, &entry, backend, stack_size, &args)
        }
    };
    process::exit(code);
}

fn load(path: &PathBuf, ctx: &mut ExecutionContext) -> Result<nox_core::module::ModuleId, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    load_module(ctx, BufReader::new(file)).map_err(|e| e.to_string())
}

fn inspect(path: &PathBuf) -> i32 {
    let mut ctx = ExecutionContext::new();
    let mid = match load(path, &mut ctx) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let module = ctx.module(mid).expect("module was just loaded");

    println!("module '{}'", module.name);

    println!("\ntypes ({}):", module.types.len());
    for &tid in &module.types {
        if let Some(d) = ctx.types.get(tid) {
            println!(
                "  {:016x}  {:<24} size={:<4} props={} methods={}",
                tid.0,
                d.fqn,
                d.meta.size,
                d.properties.len(),
                d.methods.len()
            );
        }
    }

    println!("\nfunctions ({}):", module.functions.len());
    for &fid in &module.functions {
        if let Some(d) = ctx.funcs.get(fid) {
            let entry = match d.entry {
                FunctionEntry::Script { offset, .. } => format!("ir@{}", offset),
                FunctionEntry::Native { addr } => format!("native@{:#x}", addr),
                FunctionEntry::Host(_) => "host".to_string(),
                FunctionEntry::None => "unbound".to_string(),
            };
            let sig = ctx
                .types
                .get(d.signature)
                .map(|s| s.fqn.clone())
                .unwrap_or_else(|| "?".to_string());
            println!("  #{:<4} {:<16} {:<32} {}", fid.0, d.name, sig, entry);
        }
    }

    println!("\nexports:");
    for (name, exports) in &module.exports {
        for e in exports {
            match e {
                Export::Function(f) => println!("  {} -> fn#{}", name, f.0),
                Export::Type(t) => println!("  {} -> type {:016x}", name, t.0),
                Export::Data(s) => println!("  {} -> data slot {}", name, s),
            }
        }
    }

    println!("\ncode ({} instructions):", module.code.len());
    for (i, inst) in module.code.iter().enumerate() {
        let span = module.map.get(i);
        if span.is_synthetic() {
            println!("  {:>5}  {}", i, inst);
        } else {
            println!("  {:>5}  {:<40} ; {}", i, inst.to_string(), span);
        }
    }
    0
}

fn find_entry(ctx: &ExecutionContext, mid: nox_core::module::ModuleId, name: &str) -> Option<FunctionId> {
    let module = ctx.module(mid)?;
    module.exports_named(name).iter().find_map(|e| match e {
        Export::Function(f) => Some(*f),
        _ => None,
    })
}

fn run(path: &PathBuf, entry: &str, backend: BackendChoice, stack_size: usize, args: &[i64]) -> i32 {
    let mut ctx = ExecutionContext::new();
    let mid = match load(path, &mut ctx) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let Some(fid) = find_entry(&ctx, mid, entry) else {
        eprintln!("error: module has no exported function '{}'", entry);
        return 1;
    };
    tracing::debug!(entry, function = fid.0, "resolved entry point");
    let raw_args: Vec<u64> = args.iter().map(|&a| a as u64).collect();

    let result = match backend {
        BackendChoice::Vm => {
            let mut vm = nox_runtime::Vm::new(stack_size);
            vm.call(&ctx, fid, &raw_args, None)
        }
        BackendChoice::Jit => {
            let mut jit = match nox_jit::JitBackend::new() {
                Ok(j) => j,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return 1;
                }
            };
            if let Err(e) = jit.compile_module(&mut ctx, mid) {
                eprintln!("error: {}", e);
                return 1;
            }
            jit.call(&ctx, fid, &raw_args, None)
        }
    };

    match result {
        Ok(v) => {
            println!("{}", v as i64);
            0
        }
        Err(e) => {
            eprintln!("runtime error: {}", e);
            1
        }
    }
}
