//! Nox core: type system, function registry and module model.
//!
//! This crate holds the data model every other part of the toolchain works
//! against:
//!
//! - `types`: interned type descriptors with stable name-derived ids
//! - `functions`: function descriptors, signatures, wrapper metadata
//! - `matching`: the shared overload-resolution routine
//! - `ir`: the three-address instruction form both back-ends consume
//! - `module`: compiled modules, exports and module data
//! - `ast`: the node shapes the parser hands to the compiler
//! - `context`: the execution context owning all of the above
//! - `serialize`: the module binary image with two-pass resolve
//! - `error` / `span`: diagnostics, runtime faults, source locations

pub mod ast;
pub mod context;
pub mod error;
pub mod functions;
pub mod ir;
pub mod matching;
pub mod module;
pub mod serialize;
pub mod span;
pub mod types;

pub use context::{BuiltinTypes, ExecutionContext};
pub use error::{Diagnostic, DiagnosticLog, ErrorKind, ModuleIoError, RegistryError, RuntimeError, Severity};
pub use functions::{
    ArgKind, FunctionDescriptor, FunctionEntry, FunctionFlags, FunctionId, FunctionRegistry,
    SigArg, Signature, WrapperAddrs, host_hash_of, register_signature, signature_fqn,
};
pub use ir::{Immediate, Instruction, LabelId, Opcode, ScalarCategory, Value, ValueFlags, ValueKind};
pub use matching::{MatchFlags, MatchResult, function_match, is_convertible};
pub use module::{DataSlot, Export, Module, ModuleId};
pub use serialize::{ModuleImage, capture, install, load_module, save_module};
pub use span::{SourceMap, SrcSpan};
pub use types::{
    Access, BaseClass, Property, PropertyFlags, TypeDescriptor, TypeId, TypeKind, TypeMeta,
    TypeRegistry, type_id_of,
};
