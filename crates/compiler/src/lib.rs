//! Nox compiler: AST lowering, IR construction and optimization.
//!
//! The pipeline: the parser's AST enters through [`Compiler::compile_unit`],
//! expression lowering drives the value-operation contracts in `expr` and
//! the call generation in `callgen`, IR accumulates in per-function
//! [`FunctionDef`]s, and `optimize` cleans up the committed buffers.

pub mod callgen;
pub mod expr;
pub mod funcdef;
pub mod lower;
pub mod optimize;

pub use funcdef::{Emit, FunctionDef};
pub use lower::{CompileError, Compiler};
pub use optimize::{CodeHolder, OptPass, run_default, run_passes};

use nox_core::context::ExecutionContext;
use nox_core::module::ModuleId;
use nox_core::span::SourceMap;

/// Run the default optimization pipeline over a committed module buffer.
pub fn optimize_module(ctx: &mut ExecutionContext, module: ModuleId) {
    let Some(m) = ctx.modules.iter_mut().find(|m| m.id == module) else {
        return;
    };
    let code = std::mem::take(&mut m.code);
    let map = std::mem::replace(&mut m.map, SourceMap::new());
    let mut holder = CodeHolder::new(code, map);

    // entry offsets shift if instructions are removed; the cleanup passes
    // only run per-function when offsets allow, so the whole-module pipeline
    // is restricted to passes that do not delete instructions
    let mut passes: Vec<Box<dyn OptPass>> = vec![
        Box::new(optimize::LabelOffsets),
        Box::new(optimize::ConstantFolding),
        Box::new(optimize::CopyPropagation),
    ];
    run_passes(&mut holder, &mut passes, ctx);

    let (code, map) = holder.into_parts();
    if let Some(m) = ctx.modules.iter_mut().find(|m| m.id == module) {
        m.code = code;
        m.map = map;
    }
}
