//! Control-flow graph over the instruction buffer.
//!
//! Rebuilt on demand. Blocks are half-open instruction ranges; the leaders
//! are offset zero, every bound label, and every instruction following a
//! terminator.

use std::collections::BTreeSet;

use nox_core::ir::{Instruction, Opcode};

use super::labels::LabelTable;

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub begin: u32,
    /// One past the last instruction of the block.
    pub end: u32,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
}

impl Cfg {
    pub fn rebuild(&mut self, code: &[Instruction], labels: &LabelTable) {
        self.blocks.clear();
        if code.is_empty() {
            return;
        }

        let mut leaders: BTreeSet<u32> = BTreeSet::new();
        leaders.insert(0);
        for (i, inst) in code.iter().enumerate() {
            if inst.op == Opcode::Label {
                leaders.insert(i as u32);
            }
            if inst.op.is_terminator() && i + 1 < code.len() {
                leaders.insert(i as u32 + 1);
            }
            if matches!(inst.op, Opcode::Branch | Opcode::Jump) {
                if let Some(target) = inst.label().and_then(|l| labels.offset(l)) {
                    leaders.insert(target);
                }
            }
        }

        let bounds: Vec<u32> = leaders.into_iter().collect();
        for (bi, &begin) in bounds.iter().enumerate() {
            let end = bounds.get(bi + 1).copied().unwrap_or(code.len() as u32);
            self.blocks.push(BasicBlock { begin, end, successors: Vec::new(), predecessors: Vec::new() });
        }

        let block_of = |offset: u32| -> Option<usize> {
            self.blocks.iter().position(|b| b.begin <= offset && offset < b.end)
        };

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (bi, block) in self.blocks.iter().enumerate() {
            if block.end == 0 || block.begin == block.end {
                continue;
            }
            let last = &code[block.end as usize - 1];
            match last.op {
                Opcode::Jump => {
                    if let Some(t) = last.label().and_then(|l| labels.offset(l)).and_then(block_of) {
                        edges.push((bi, t));
                    }
                }
                Opcode::Branch => {
                    if let Some(t) = last.label().and_then(|l| labels.offset(l)).and_then(block_of) {
                        edges.push((bi, t));
                    }
                    if bi + 1 < self.blocks.len() {
                        edges.push((bi, bi + 1));
                    }
                }
                Opcode::Ret | Opcode::Term => {}
                _ => {
                    if bi + 1 < self.blocks.len() {
                        edges.push((bi, bi + 1));
                    }
                }
            }
        }
        for (from, to) in edges {
            self.blocks[from].successors.push(to);
            self.blocks[to].predecessors.push(from);
        }
    }

    pub fn block_containing(&self, offset: u32) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.begin <= offset && offset < b.end)
    }
}
