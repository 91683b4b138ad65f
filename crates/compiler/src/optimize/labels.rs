//! Label-offset table.

use rustc_hash::FxHashMap;

use nox_core::ir::{Instruction, LabelId, Opcode};

/// Maps every bound label to the offset of its `Label` instruction.
#[derive(Debug, Default)]
pub struct LabelTable {
    offsets: FxHashMap<LabelId, u32>,
}

impl LabelTable {
    pub fn rebuild(&mut self, code: &[Instruction]) {
        self.offsets.clear();
        for (i, inst) in code.iter().enumerate() {
            if inst.op == Opcode::Label {
                if let Some(l) = inst.label() {
                    self.offsets.insert(l, i as u32);
                }
            }
        }
    }

    pub fn offset(&self, label: LabelId) -> Option<u32> {
        self.offsets.get(&label).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
