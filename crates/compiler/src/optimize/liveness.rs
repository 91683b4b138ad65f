//! Per-instruction liveness of virtual registers.
//!
//! Classic backward dataflow over the CFG; sets are rebuilt from scratch on
//! request. A register is live at an instruction when some path from it
//! reaches a use before any redefinition.

use rustc_hash::FxHashSet;

use nox_core::ir::{Instruction, Opcode, Value, ValueKind};

use super::cfg::Cfg;

#[derive(Debug, Default)]
pub struct Liveness {
    /// Live-in set per instruction offset.
    pub live_in: Vec<FxHashSet<u32>>,
    /// Live-out set per instruction offset.
    pub live_out: Vec<FxHashSet<u32>>,
}

fn reg_of(v: &Value) -> Option<u32> {
    match v.kind {
        ValueKind::Reg(r) => Some(r),
        _ => None,
    }
}

/// The registers an instruction reads and the one it writes.
pub fn uses_and_def(inst: &Instruction) -> (Vec<u32>, Option<u32>) {
    let mut uses = Vec::new();
    let mut def = None;

    match inst.op {
        Opcode::Call => {
            // operand 1 is the destination; callee and this are reads
            if let Some(v) = inst.operand(0).and_then(reg_of) {
                uses.push(v);
            }
            def = inst.operand(1).and_then(reg_of);
            if let Some(v) = inst.operand(2).and_then(reg_of) {
                uses.push(v);
            }
        }
        _ => {
            for (i, op) in inst.operands.iter().enumerate() {
                let Some(v) = op.as_ref() else { continue };
                let Some(r) = reg_of(v) else { continue };
                if i == 0 && inst.op.writes_operand0() {
                    def = Some(r);
                } else {
                    uses.push(r);
                }
            }
        }
    }
    (uses, def)
}

impl Liveness {
    pub fn rebuild(&mut self, code: &[Instruction], cfg: &Cfg) {
        let n = code.len();
        self.live_in = vec![FxHashSet::default(); n];
        self.live_out = vec![FxHashSet::default(); n];
        if n == 0 {
            return;
        }

        let mut changed = true;
        while changed {
            changed = false;
            for block in cfg.blocks.iter().rev() {
                if block.begin == block.end {
                    continue;
                }
                // out of the last instruction = union of successor block ins
                let mut carry: FxHashSet<u32> = FxHashSet::default();
                for &succ in &block.successors {
                    let first = cfg.blocks[succ].begin as usize;
                    if first < n {
                        carry.extend(self.live_in[first].iter().copied());
                    }
                }
                for i in (block.begin as usize..block.end as usize).rev() {
                    if carry != self.live_out[i] {
                        self.live_out[i] = carry.clone();
                        changed = true;
                    }
                    let (uses, def) = uses_and_def(&code[i]);
                    let mut live = self.live_out[i].clone();
                    if let Some(d) = def {
                        live.remove(&d);
                    }
                    for u in uses {
                        live.insert(u);
                    }
                    if live != self.live_in[i] {
                        self.live_in[i] = live.clone();
                        changed = true;
                    }
                    carry = live;
                }
            }
        }
    }

    pub fn is_live_out(&self, offset: usize, reg: u32) -> bool {
        self.live_out.get(offset).map(|s| s.contains(&reg)).unwrap_or(false)
    }
}
