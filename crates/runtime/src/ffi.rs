//! The FFI bridge.
//!
//! Host functions are described by a single binding record: callee address,
//! argument type tags, return tag, and the flags that decide the call
//! shape. One reusable shim interprets the record through libffi at call
//! time; the three wrapper entry points adapt the script calling
//! convention's return-placement and method variants onto that shim. Both
//! back-ends dispatch host calls through these wrappers.

use std::sync::Arc;

use libffi::middle::{Arg, Cif, CodePtr, Type};

use nox_core::context::ExecutionContext;
use nox_core::functions::{
    ArgKind, FunctionFlags, FunctionId, SigArg, Signature, WrapperAddrs, register_signature,
    FunctionEntry,
};
use nox_core::module::ModuleId;
use nox_core::span::SrcSpan;
use nox_core::types::{Access, TypeId};

/// Scalar shape of one host argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Ptr,
}

impl TypeTag {
    fn libffi_type(&self) -> Type {
        match self {
            TypeTag::Void => Type::void(),
            TypeTag::Bool | TypeTag::U8 => Type::u8(),
            TypeTag::I8 => Type::i8(),
            TypeTag::I16 => Type::i16(),
            TypeTag::U16 => Type::u16(),
            TypeTag::I32 => Type::i32(),
            TypeTag::U32 => Type::u32(),
            TypeTag::I64 => Type::i64(),
            TypeTag::U64 => Type::u64(),
            TypeTag::F32 => Type::f32(),
            TypeTag::F64 => Type::f64(),
            TypeTag::Ptr => Type::pointer(),
        }
    }
}

/// The record one host binding is described by.
///
/// The call shape, in order: `ctx` (when `takes_ctx`), `this` (when
/// `is_method`), the hidden return pointer (when `returns_on_stack`), the
/// captured-environment pointer (when `takes_capture`), then the explicit
/// arguments.
#[derive(Debug)]
pub struct HostBinding {
    pub func: usize,
    pub args: Vec<TypeTag>,
    pub ret: TypeTag,
    pub is_method: bool,
    pub returns_on_stack: bool,
    pub takes_ctx: bool,
    pub takes_capture: bool,
    cif: Cif,
}

// Cif owns heap-allocated type descriptions and is only read at call time.
unsafe impl Send for HostBinding {}
unsafe impl Sync for HostBinding {}

impl HostBinding {
    pub fn new(
        func: usize,
        args: Vec<TypeTag>,
        ret: TypeTag,
        is_method: bool,
        returns_on_stack: bool,
        takes_ctx: bool,
        takes_capture: bool,
    ) -> Self {
        let mut ffi_args: Vec<Type> = Vec::new();
        if takes_ctx {
            ffi_args.push(Type::pointer());
        }
        if is_method {
            ffi_args.push(Type::pointer());
        }
        if returns_on_stack {
            ffi_args.push(Type::pointer());
        }
        if takes_capture {
            ffi_args.push(Type::pointer());
        }
        for a in &args {
            ffi_args.push(a.libffi_type());
        }
        let ret_ty = if returns_on_stack { Type::void() } else { ret.libffi_type() };
        let cif = Cif::new(ffi_args, ret_ty);
        HostBinding { func, args, ret, is_method, returns_on_stack, takes_ctx, takes_capture, cif }
    }

    /// The full dispatch: marshal the slots, call through libffi, place the
    /// return value.
    ///
    /// # Safety
    /// `func` must point at a function matching the record, and every
    /// pointer slot must satisfy the callee's expectations.
    pub unsafe fn call(
        &self,
        ctx: *const ExecutionContext,
        this: u64,
        sret: u64,
        capture: u64,
        args: &[u64],
        ret_slot: *mut u64,
    ) {
        // storage the Arg pointers borrow; slots are already 8-byte cells
        // holding each value in its low bytes (little-endian x86-64)
        let ctx_cell = ctx as u64;
        let this_cell = this;
        let sret_cell = sret;
        let cap_cell = capture;

        let mut ffi_args: Vec<Arg> = Vec::with_capacity(args.len() + 4);
        if self.takes_ctx {
            ffi_args.push(Arg::new(&ctx_cell));
        }
        if self.is_method {
            ffi_args.push(Arg::new(&this_cell));
        }
        if self.returns_on_stack {
            ffi_args.push(Arg::new(&sret_cell));
        }
        if self.takes_capture {
            ffi_args.push(Arg::new(&cap_cell));
        }
        for v in args {
            ffi_args.push(Arg::new(v));
        }

        let code = CodePtr(self.func as *mut _);
        unsafe {
            if self.returns_on_stack {
                self.cif.call::<()>(code, &ffi_args);
                return;
            }
            let out: u64 = match self.ret {
                TypeTag::Void => {
                    self.cif.call::<()>(code, &ffi_args);
                    0
                }
                TypeTag::Bool | TypeTag::U8 => self.cif.call::<u8>(code, &ffi_args) as u64,
                TypeTag::I8 => self.cif.call::<i8>(code, &ffi_args) as i64 as u64,
                TypeTag::I16 => self.cif.call::<i16>(code, &ffi_args) as i64 as u64,
                TypeTag::U16 => self.cif.call::<u16>(code, &ffi_args) as u64,
                TypeTag::I32 => self.cif.call::<i32>(code, &ffi_args) as i64 as u64,
                TypeTag::U32 => self.cif.call::<u32>(code, &ffi_args) as u64,
                TypeTag::I64 => self.cif.call::<i64>(code, &ffi_args) as u64,
                TypeTag::U64 | TypeTag::Ptr => self.cif.call::<u64>(code, &ffi_args),
                TypeTag::F32 => f32::to_bits(self.cif.call::<f32>(code, &ffi_args)) as u64,
                TypeTag::F64 => f64::to_bits(self.cif.call::<f64>(code, &ffi_args)),
            };
            if !ret_slot.is_null() {
                *ret_slot = out;
            }
        }
    }
}

/// Script-to-host wrapper for ordinary (register) returns.
///
/// # Safety
/// `binding` must be a live [`HostBinding`] and `args` must hold `argc`
/// readable slots.
pub unsafe extern "C" fn nox_cdecl_wrapper(
    binding: *const HostBinding,
    ctx: *const ExecutionContext,
    ret: *mut u64,
    args: *const u64,
    argc: usize,
) {
    unsafe {
        let b = &*binding;
        let slots = std::slice::from_raw_parts(args, argc);
        b.call(ctx, 0, 0, 0, slots, ret);
    }
}

/// Script-to-host wrapper for stack returns: the callee writes through the
/// hidden return pointer.
///
/// # Safety
/// Same contract as [`nox_cdecl_wrapper`], plus `sret` must point at
/// storage big enough for the return type.
pub unsafe extern "C" fn nox_srv_wrapper(
    binding: *const HostBinding,
    ctx: *const ExecutionContext,
    sret: *mut u8,
    args: *const u64,
    argc: usize,
) {
    unsafe {
        let b = &*binding;
        let slots = std::slice::from_raw_parts(args, argc);
        b.call(ctx, 0, sret as u64, 0, slots, std::ptr::null_mut());
    }
}

/// Adapter for non-static host methods: prepends the instance pointer.
///
/// # Safety
/// Same contract as [`nox_cdecl_wrapper`], plus `this` must be a live
/// instance of the bound type.
pub unsafe extern "C" fn nox_call_method_func(
    binding: *const HostBinding,
    ctx: *const ExecutionContext,
    this: *mut u8,
    ret: *mut u64,
    args: *const u64,
    argc: usize,
) {
    unsafe {
        let b = &*binding;
        let slots = std::slice::from_raw_parts(args, argc);
        if b.returns_on_stack {
            b.call(ctx, this as u64, ret as u64, 0, slots, std::ptr::null_mut());
        } else {
            b.call(ctx, this as u64, 0, 0, slots, ret);
        }
    }
}

/// Owns every binding record so the raw pointers recorded on function
/// descriptors stay valid for the life of the process.
#[derive(Debug, Default)]
pub struct BindingStore {
    bindings: Vec<Arc<HostBinding>>,
}

impl BindingStore {
    pub fn new() -> Self {
        BindingStore::default()
    }

    pub fn keep(&mut self, binding: HostBinding) -> *const HostBinding {
        let arc = Arc::new(binding);
        let ptr = Arc::as_ptr(&arc);
        self.bindings.push(arc);
        ptr
    }

    /// # Safety
    /// `ptr` must have come from [`BindingStore::keep`] on this store.
    pub unsafe fn get(&self, ptr: usize) -> &HostBinding {
        unsafe { &*(ptr as *const HostBinding) }
    }
}

/// One explicit argument of a host binding: its FFI shape and its
/// script-visible type.
#[derive(Debug, Clone, Copy)]
pub struct HostArg {
    pub tag: TypeTag,
    pub type_id: TypeId,
}

pub struct HostFunctionSpec {
    pub name: String,
    pub func: usize,
    pub args: Vec<HostArg>,
    pub ret: HostArg,
    pub this_type: Option<TypeId>,
    pub takes_ctx: bool,
    pub takes_capture: bool,
    pub access: Access,
    pub module: Option<ModuleId>,
}

/// Register a host function: intern its script signature, build its binding
/// record, and install the wrapper triple on the descriptor.
pub fn bind_host_function(
    ctx: &mut ExecutionContext,
    store: &mut BindingStore,
    spec: HostFunctionSpec,
) -> FunctionId {
    let returns_on_stack = ctx.returns_on_stack(spec.ret.type_id);

    let mut sig_args = vec![SigArg { kind: ArgKind::ContextPtr, type_id: ctx.builtins.ptr }];
    if let Some(t) = spec.this_type {
        sig_args.push(SigArg { kind: ArgKind::ThisPtr, type_id: t });
    }
    if returns_on_stack {
        sig_args.push(SigArg { kind: ArgKind::RetPtr, type_id: spec.ret.type_id });
    }
    if spec.takes_capture {
        sig_args.push(SigArg { kind: ArgKind::CaptureDataPtr, type_id: ctx.builtins.ptr });
    }
    sig_args.push(SigArg { kind: ArgKind::FuncPtr, type_id: ctx.builtins.ptr });
    for a in &spec.args {
        sig_args.push(SigArg { kind: ArgKind::Explicit, type_id: a.type_id });
    }

    let sig = Signature { ret: spec.ret.type_id, args: sig_args, returns_on_stack };
    let sig_ty = register_signature(&mut ctx.types, &ctx.funcs, sig)
        .expect("host signature registration is structural and cannot collide");

    let flags = FunctionFlags {
        is_host: true,
        is_method: spec.this_type.is_some(),
        is_thiscall: spec.this_type.is_some(),
        ..Default::default()
    };
    let fid = ctx.funcs.register(
        spec.name,
        sig_ty,
        flags,
        spec.access,
        spec.module,
        Some(SrcSpan::synthetic()),
    );

    let binding = HostBinding::new(
        spec.func,
        spec.args.iter().map(|a| a.tag).collect(),
        spec.ret.tag,
        spec.this_type.is_some(),
        returns_on_stack,
        spec.takes_ctx,
        spec.takes_capture,
    );
    let record = store.keep(binding);

    ctx.funcs.set_entry(
        fid,
        FunctionEntry::Host(WrapperAddrs {
            cdecl_wrapper: nox_cdecl_wrapper as usize,
            srv_wrapper: nox_srv_wrapper as usize,
            call_method_func: nox_call_method_func as usize,
            func_ptr: spec.func,
            binding: record as usize,
        }),
    );
    fid
}

/// The FFI tag of a script type, for marshalling through libffi.
pub fn tag_of(ctx: &ExecutionContext, ty: TypeId) -> TypeTag {
    let Some(desc) = ctx.types.effective_desc(ty) else {
        return TypeTag::U64;
    };
    let m = &desc.meta;
    if !m.is_primitive {
        // objects travel by pointer
        return TypeTag::Ptr;
    }
    if ctx.types.is_equal(ty, ctx.builtins.boolean) {
        return TypeTag::Bool;
    }
    if m.is_floating_point {
        return if m.size == 8 { TypeTag::F64 } else { TypeTag::F32 };
    }
    if m.size == 0 {
        return TypeTag::Void;
    }
    match (m.size, m.is_unsigned) {
        (1, false) => TypeTag::I8,
        (2, false) => TypeTag::I16,
        (4, false) => TypeTag::I32,
        (8, false) => TypeTag::I64,
        (1, true) => TypeTag::U8,
        (2, true) => TypeTag::U16,
        (4, true) => TypeTag::U32,
        _ => TypeTag::U64,
    }
}

/// Call a generated native entry with the script calling convention.
///
/// `slots` holds one 64-bit cell per signature argument, implicit ones
/// included, in signature order.
///
/// # Safety
/// Wrapped in a safe `Result` but `addr` must be a live code address for a
/// function with exactly this signature.
pub unsafe fn call_native_entry(
    ctx: &ExecutionContext,
    addr: usize,
    sig: &Signature,
    slots: &[u64],
) -> Result<u64, nox_core::error::RuntimeError> {
    if slots.len() != sig.args.len() {
        return Err(nox_core::error::RuntimeError::InvalidOpcode(
            "native call slot count mismatch".into(),
        ));
    }
    let mut arg_types = Vec::with_capacity(sig.args.len());
    for a in &sig.args {
        let tag = if a.kind.is_implicit() { TypeTag::Ptr } else { tag_of(ctx, a.type_id) };
        arg_types.push(tag.libffi_type());
    }
    let ret_tag = if sig.returns_on_stack { TypeTag::Void } else { tag_of(ctx, sig.ret) };
    let cif = Cif::new(arg_types, ret_tag.libffi_type());

    let args: Vec<Arg> = slots.iter().map(Arg::new).collect();
    let code = CodePtr(addr as *mut _);
    let out = unsafe {
        match ret_tag {
            TypeTag::Void => {
                cif.call::<()>(code, &args);
                0
            }
            TypeTag::Bool | TypeTag::U8 => cif.call::<u8>(code, &args) as u64,
            TypeTag::I8 => cif.call::<i8>(code, &args) as i64 as u64,
            TypeTag::I16 => cif.call::<i16>(code, &args) as i64 as u64,
            TypeTag::U16 => cif.call::<u16>(code, &args) as u64,
            TypeTag::I32 => cif.call::<i32>(code, &args) as i64 as u64,
            TypeTag::U32 => cif.call::<u32>(code, &args) as u64,
            TypeTag::I64 => cif.call::<i64>(code, &args) as u64,
            TypeTag::U64 | TypeTag::Ptr => cif.call::<u64>(code, &args),
            TypeTag::F32 => f32::to_bits(cif.call::<f32>(code, &args)) as u64,
            TypeTag::F64 => f64::to_bits(cif.call::<f64>(code, &args)),
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add2(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn half(x: f64) -> f64 {
        x / 2.0
    }

    #[test]
    fn test_dispatch_integer_return() {
        let b = HostBinding::new(
            add2 as usize,
            vec![TypeTag::I32, TypeTag::I32],
            TypeTag::I32,
            false,
            false,
            false,
            false,
        );
        let args = [5u64, 7u64];
        let mut out = 0u64;
        unsafe { b.call(std::ptr::null(), 0, 0, 0, &args, &mut out) };
        assert_eq!(out as i64, 12);
    }

    #[test]
    fn test_dispatch_float_return() {
        let b = HostBinding::new(
            half as usize,
            vec![TypeTag::F64],
            TypeTag::F64,
            false,
            false,
            false,
            false,
        );
        let args = [f64::to_bits(9.0)];
        let mut out = 0u64;
        unsafe { b.call(std::ptr::null(), 0, 0, 0, &args, &mut out) };
        assert_eq!(f64::from_bits(out), 4.5);
    }

    #[test]
    fn test_wrapper_entry_points_distinct() {
        assert_ne!(nox_cdecl_wrapper as usize, nox_srv_wrapper as usize);
        assert_ne!(nox_srv_wrapper as usize, nox_call_method_func as usize);
    }
}
