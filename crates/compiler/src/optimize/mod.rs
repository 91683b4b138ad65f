//! IR optimization.
//!
//! A [`CodeHolder`] owns a function's instruction buffer together with the
//! three derivable artifacts: the label-offset table, the control-flow
//! graph, and per-instruction liveness. Passes mutate the buffer in place
//! and ask the holder to rebuild whatever they invalidated; a pass must be
//! idempotent with respect to artifacts it does not touch.

mod cfg;
mod labels;
mod liveness;
mod passes;

pub use cfg::{BasicBlock, Cfg};
pub use labels::LabelTable;
pub use liveness::Liveness;
pub use passes::{ConstantFolding, CopyPropagation, DeadCodeElimination, LabelOffsets};

use nox_core::context::ExecutionContext;
use nox_core::ir::Instruction;
use nox_core::span::SourceMap;
use tracing::debug;

pub struct CodeHolder {
    pub code: Vec<Instruction>,
    pub map: SourceMap,
    pub labels: LabelTable,
    pub cfg: Cfg,
    pub liveness: Liveness,
}

impl CodeHolder {
    pub fn new(code: Vec<Instruction>, map: SourceMap) -> Self {
        let mut holder = CodeHolder {
            code,
            map,
            labels: LabelTable::default(),
            cfg: Cfg::default(),
            liveness: Liveness::default(),
        };
        holder.rebuild_all();
        holder
    }

    pub fn rebuild_all(&mut self) {
        self.rebuild_labels();
        self.rebuild_cfg();
        self.rebuild_liveness();
    }

    pub fn rebuild_labels(&mut self) {
        self.labels.rebuild(&self.code);
    }

    pub fn rebuild_cfg(&mut self) {
        self.cfg.rebuild(&self.code, &self.labels);
    }

    pub fn rebuild_liveness(&mut self) {
        self.liveness.rebuild(&self.code, &self.cfg);
    }

    /// Remove one instruction, keeping the source map parallel.
    pub fn remove(&mut self, index: usize) {
        self.code.remove(index);
        self.map.remove(index);
    }

    /// Give the (possibly mutated) buffer back to its owner.
    pub fn into_parts(self) -> (Vec<Instruction>, SourceMap) {
        (self.code, self.map)
    }
}

/// An optimization pass over a code holder.
///
/// Returns whether the pass changed the buffer.
pub trait OptPass {
    fn name(&self) -> &'static str;
    fn run(&mut self, holder: &mut CodeHolder, ctx: &ExecutionContext) -> bool;
}

/// Run a sequence of passes to a fixpoint, bounded to keep pathological
/// inputs from spinning.
pub fn run_passes(holder: &mut CodeHolder, passes: &mut [Box<dyn OptPass>], ctx: &ExecutionContext) {
    for _ in 0..8 {
        let mut changed = false;
        for pass in passes.iter_mut() {
            let did = pass.run(holder, ctx);
            if did {
                debug!(pass = pass.name(), "pass changed code");
            }
            changed |= did;
        }
        if !changed {
            break;
        }
    }
}

/// The default pipeline: label offsets (required by the back-ends), then
/// the cleanup passes.
pub fn run_default(holder: &mut CodeHolder, ctx: &ExecutionContext) {
    let mut passes: Vec<Box<dyn OptPass>> = vec![
        Box::new(LabelOffsets),
        Box::new(ConstantFolding),
        Box::new(CopyPropagation),
        Box::new(DeadCodeElimination),
    ];
    run_passes(holder, &mut passes, ctx);
}
