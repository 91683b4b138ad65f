//! Compiled modules.
//!
//! A module owns the types and functions compiled from one translation
//! unit, its committed IR buffer, the source map parallel to that buffer,
//! a typed module-data area, and an export table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::functions::FunctionId;
use crate::ir::Instruction;
use crate::span::SourceMap;
use crate::types::TypeId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

/// A typed slot in the module-data section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSlot {
    pub type_id: TypeId,
    bytes: Box<[u8]>,
}

impl DataSlot {
    pub fn new(type_id: TypeId, size: usize) -> Self {
        DataSlot { type_id, bytes: vec![0u8; size].into_boxed_slice() }
    }

    pub fn from_bytes(type_id: TypeId, bytes: Vec<u8>) -> Self {
        DataSlot { type_id, bytes: bytes.into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Address of the slot's storage. Stable for the life of the module:
    /// the box is never reallocated after construction.
    pub fn address(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Export {
    Function(FunctionId),
    Type(TypeId),
    Data(u32),
}

/// One compiled translation unit.
#[derive(Debug, Default)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub types: Vec<TypeId>,
    pub functions: Vec<FunctionId>,
    pub exports: BTreeMap<String, Vec<Export>>,
    pub data: Vec<DataSlot>,
    /// The committed IR of every function in this module; function entries
    /// are offsets into this buffer.
    pub code: Vec<Instruction>,
    pub map: SourceMap,
    /// Next free label id; committed functions renumber their labels from
    /// here so ids stay unique across the shared buffer.
    pub next_label: u32,
}

impl Module {
    pub fn new(id: ModuleId, name: impl Into<String>) -> Self {
        Module { id, name: name.into(), ..Module::default() }
    }

    pub fn add_data(&mut self, slot: DataSlot) -> u32 {
        self.data.push(slot);
        (self.data.len() - 1) as u32
    }

    pub fn export(&mut self, name: impl Into<String>, export: Export) {
        self.exports.entry(name.into()).or_default().push(export);
    }

    pub fn exports_named(&self, name: &str) -> &[Export] {
        self.exports.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
