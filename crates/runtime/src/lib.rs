//! Nox runtime: the register VM, the FFI bridge and the host binding
//! surface.
//!
//! # Modules
//!
//! - `state`: register file and guarded stack memory
//! - `vm`: the IR interpreter
//! - `ffi`: binding records, libffi dispatch, the wrapper triple
//! - `bind`: the builder host code registers types and functions through
//! - `closure`: runtime closure records for indirect calls
//! - `error`: thread-local fault state for code that cannot return `Result`

pub mod bind;
pub mod closure;
pub mod error;
pub mod ffi;
pub mod state;
pub mod vm;

pub use bind::{HostTypeBinder, bind_capture_function, bind_function, host_hash};
pub use closure::Closure;
pub use error::{clear_runtime_error, has_runtime_error, set_runtime_error, take_runtime_error};
pub use ffi::{
    BindingStore, HostArg, HostBinding, HostFunctionSpec, TypeTag, bind_host_function,
    call_native_entry, nox_call_method_func, nox_cdecl_wrapper, nox_srv_wrapper, tag_of,
};
pub use state::{GP_COUNT, GUARD_SIZE, Registers, StackMem};
pub use vm::Vm;

use nox_core::context::ExecutionContext;
use nox_core::functions::FunctionEntry;

/// Indirect-call dispatch for generated native code.
///
/// Reads the closure record, then routes: host targets through their
/// binding record, native targets through a signature-built call. A target
/// that only exists as uncompiled IR cannot be entered from native code;
/// that faults via the thread-local error state and returns nonzero.
///
/// # Safety
/// `ctx` must be a live execution context, `closure` a live closure
/// address, `args` a readable array of `argc` slots, and `ret` writable.
pub unsafe extern "C" fn nox_closure_dispatch(
    ctx: *const ExecutionContext,
    closure: u64,
    ret: *mut u64,
    args: *const u64,
    argc: usize,
) -> i32 {
    let ctx = unsafe { &*ctx };
    let Some(c) = (unsafe { Closure::borrow_raw(closure) }) else {
        set_runtime_error("null callback invoked");
        return 1;
    };
    let slots = unsafe { std::slice::from_raw_parts(args, argc) };

    let Some(desc) = ctx.funcs.get(c.target) else {
        set_runtime_error(format!("closure targets unknown function {}", c.target.0));
        return 1;
    };
    let Some(sig) = ctx.types.effective_desc(desc.signature).and_then(|d| d.signature().cloned())
    else {
        set_runtime_error("closure target has no signature");
        return 1;
    };

    match desc.entry {
        FunctionEntry::Host(w) => {
            let binding = unsafe { &*(w.binding as *const ffi::HostBinding) };
            unsafe { binding.call(ctx, c.this_ptr, 0, c.capture, slots, ret) };
            0
        }
        FunctionEntry::Native { addr } => {
            let mut full = Vec::with_capacity(sig.args.len());
            let mut next = 0usize;
            for a in &sig.args {
                use nox_core::functions::ArgKind;
                full.push(match a.kind {
                    ArgKind::ContextPtr => ctx as *const ExecutionContext as u64,
                    ArgKind::ThisPtr => c.this_ptr,
                    ArgKind::RetPtr => 0,
                    ArgKind::CaptureDataPtr => c.capture,
                    ArgKind::FuncPtr => 0,
                    ArgKind::Explicit => {
                        let v = slots.get(next).copied().unwrap_or(0);
                        next += 1;
                        v
                    }
                });
            }
            match unsafe { call_native_entry(ctx, addr, &sig, &full) } {
                Ok(v) => {
                    if !ret.is_null() {
                        unsafe { *ret = v };
                    }
                    0
                }
                Err(e) => {
                    set_runtime_error(e.to_string());
                    1
                }
            }
        }
        _ => {
            set_runtime_error("closure target is not executable from native code");
            1
        }
    }
}
