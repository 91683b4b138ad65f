//! Nox native back-end.
//!
//! Lowers committed module IR to machine code through Cranelift's
//! virtual-register compiler and installs an entry address per function.
//! Host calls go through the pre-generated wrapper shims; indirect calls
//! through closures route via the runtime's closure dispatch.

mod backend;
mod lower;

pub use backend::{JitBackend, JitError};
