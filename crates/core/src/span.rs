//! Source locations.
//!
//! Every IR instruction records the source position it was compiled from so
//! diagnostics and the module disassembler can point back at script text.

use crate::module::ModuleId;
use serde::{Deserialize, Serialize};

/// A position in script source: module, line and column.
///
/// Lines and columns are 1-based; `SrcSpan::synthetic()` (0:0) marks code
/// that has no source position, such as compiler-generated prologues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcSpan {
    pub module: ModuleId,
    pub line: u32,
    pub col: u32,
}

impl SrcSpan {
    pub fn new(module: ModuleId, line: u32, col: u32) -> Self {
        SrcSpan { module, line, col }
    }

    /// A span for code with no corresponding source text.
    pub fn synthetic() -> Self {
        SrcSpan {
            module: ModuleId(0),
            line: 0,
            col: 0,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }
}

impl std::fmt::Display for SrcSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.module.0, self.line, self.col)
    }
}

/// Per-instruction source positions, parallel to an instruction buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMap {
    spans: Vec<SrcSpan>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap { spans: Vec::new() }
    }

    pub fn push(&mut self, span: SrcSpan) {
        self.spans.push(span);
    }

    /// The span recorded for the instruction at `index`.
    pub fn get(&self, index: usize) -> SrcSpan {
        self.spans.get(index).copied().unwrap_or_else(SrcSpan::synthetic)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Append another map (used when committing a function's code to its module).
    pub fn extend(&mut self, other: &SourceMap) {
        self.spans.extend_from_slice(&other.spans);
    }

    /// Remove the span at `index`, keeping the map parallel to the code.
    pub fn remove(&mut self, index: usize) {
        if index < self.spans.len() {
            self.spans.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_span() {
        let s = SrcSpan::synthetic();
        assert!(s.is_synthetic());
        assert!(!SrcSpan::new(ModuleId(1), 3, 7).is_synthetic());
    }

    #[test]
    fn test_source_map_parallel() {
        let mut map = SourceMap::new();
        map.push(SrcSpan::new(ModuleId(1), 1, 1));
        map.push(SrcSpan::new(ModuleId(1), 2, 5));
        assert_eq!(map.get(1).line, 2);
        map.remove(0);
        assert_eq!(map.get(0).line, 2);
        // out of range reads fall back to a synthetic span
        assert!(map.get(9).is_synthetic());
    }
}
