//! The JIT backend: module compilation driver and entry management.

use rustc_hash::FxHashMap;
use tracing::debug;

use cranelift_codegen::ir::{AbiParam, Signature as ClifSignature, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId as ClifFuncId, Linkage, Module as ClifModule, default_libcall_names};

use nox_core::context::ExecutionContext;
use nox_core::error::RuntimeError;
use nox_core::functions::{ArgKind, FunctionEntry, FunctionId, Signature};
use nox_core::module::ModuleId;
use nox_core::types::TypeId;
use nox_runtime::{
    call_native_entry, nox_call_method_func, nox_cdecl_wrapper, nox_closure_dispatch,
    nox_srv_wrapper,
};

use crate::lower::FunctionLowerer;

#[derive(Debug)]
pub enum JitError {
    /// The host ISA cannot be targeted.
    UnsupportedTarget(String),
    /// Cranelift rejected flags, a declaration or a definition.
    Codegen(String),
    /// The module or a function referenced by it is missing.
    BadInput(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::UnsupportedTarget(m) => write!(f, "unsupported target: {}", m),
            JitError::Codegen(m) => write!(f, "code generation failed: {}", m),
            JitError::BadInput(m) => write!(f, "bad input: {}", m),
        }
    }
}

impl std::error::Error for JitError {}

impl From<cranelift_module::ModuleError> for JitError {
    fn from(e: cranelift_module::ModuleError) -> Self {
        JitError::Codegen(e.to_string())
    }
}

/// Imported runtime symbols every generated function can reach.
pub(crate) struct RuntimeImports {
    pub cdecl: ClifFuncId,
    pub srv: ClifFuncId,
    pub method: ClifFuncId,
    pub closure: ClifFuncId,
}

pub struct JitBackend {
    module: JITModule,
    imports: RuntimeImports,
    declared: FxHashMap<FunctionId, ClifFuncId>,
}

impl JitBackend {
    pub fn new() -> Result<Self, JitError> {
        let mut flags = settings::builder();
        flags
            .set("use_colocated_libcalls", "false")
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        flags
            .set("is_pic", "false")
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        let isa_builder =
            cranelift_native::builder().map_err(|e| JitError::UnsupportedTarget(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(|e| JitError::UnsupportedTarget(e.to_string()))?;

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        builder.symbol("nox_cdecl_wrapper", nox_cdecl_wrapper as *const u8);
        builder.symbol("nox_srv_wrapper", nox_srv_wrapper as *const u8);
        builder.symbol("nox_call_method_func", nox_call_method_func as *const u8);
        builder.symbol("nox_closure_dispatch", nox_closure_dispatch as *const u8);
        let mut module = JITModule::new(builder);

        let ptr = types::I64;
        let conv = module.isa().default_call_conv();
        let mut wrapper_sig = |n: usize| {
            let mut s = ClifSignature::new(conv);
            for _ in 0..n {
                s.params.push(AbiParam::new(ptr));
            }
            s
        };
        // (binding, ctx, ret, args, argc)
        let cdecl_sig = wrapper_sig(5);
        // (binding, ctx, sret, args, argc)
        let srv_sig = wrapper_sig(5);
        // (binding, ctx, this, ret, args, argc)
        let method_sig = wrapper_sig(6);
        // (ctx, closure, ret, args, argc) -> status
        let mut closure_sig = wrapper_sig(5);
        closure_sig.returns.push(AbiParam::new(types::I32));

        let imports = RuntimeImports {
            cdecl: module.declare_function("nox_cdecl_wrapper", Linkage::Import, &cdecl_sig)?,
            srv: module.declare_function("nox_srv_wrapper", Linkage::Import, &srv_sig)?,
            method: module.declare_function("nox_call_method_func", Linkage::Import, &method_sig)?,
            closure: module.declare_function("nox_closure_dispatch", Linkage::Import, &closure_sig)?,
        };

        Ok(JitBackend { module, imports, declared: FxHashMap::default() })
    }

    pub(crate) fn clif_type(ctx: &ExecutionContext, ty: TypeId) -> types::Type {
        let Some(desc) = ctx.types.effective_desc(ty) else { return types::I64 };
        let m = &desc.meta;
        if !m.is_primitive {
            return types::I64;
        }
        if m.is_floating_point {
            return if m.size == 8 { types::F64 } else { types::F32 };
        }
        match m.size {
            1 => types::I8,
            2 => types::I16,
            4 => types::I32,
            _ => types::I64,
        }
    }

    pub(crate) fn clif_signature(&self, ctx: &ExecutionContext, sig: &Signature) -> ClifSignature {
        let mut s = ClifSignature::new(self.module.isa().default_call_conv());
        for a in &sig.args {
            let ty = if a.kind == ArgKind::Explicit {
                Self::clif_type(ctx, a.type_id)
            } else {
                types::I64
            };
            s.params.push(AbiParam::new(ty));
        }
        if !sig.returns_on_stack {
            let rt = Self::clif_type(ctx, sig.ret);
            let is_void = ctx.types.is_equal(sig.ret, ctx.builtins.void);
            if !is_void {
                s.returns.push(AbiParam::new(rt));
            }
        }
        s
    }

    /// Compile every script function of a module and install native
    /// entries on their descriptors.
    pub fn compile_module(
        &mut self,
        ctx: &mut ExecutionContext,
        module_id: ModuleId,
    ) -> Result<(), JitError> {
        let (functions, code_len) = {
            let m = ctx
                .module(module_id)
                .ok_or_else(|| JitError::BadInput(format!("module {} not loaded", module_id.0)))?;
            (m.functions.clone(), m.code.len() as u32)
        };

        // function bodies are contiguous slices of the module buffer; the
        // end of each is the next entry offset
        let mut entries: Vec<(FunctionId, u32)> = Vec::new();
        for &fid in &functions {
            let desc = ctx
                .funcs
                .get(fid)
                .ok_or_else(|| JitError::BadInput(format!("function {} not registered", fid.0)))?;
            if let FunctionEntry::Script { offset, .. } = desc.entry {
                entries.push((fid, offset));
            }
        }
        entries.sort_by_key(|&(_, off)| off);

        // pass one: declare
        for &(fid, _) in &entries {
            let desc = ctx.funcs.get(fid).expect("checked above");
            let sig = ctx
                .types
                .effective_desc(desc.signature)
                .and_then(|d| d.signature().cloned())
                .ok_or_else(|| JitError::BadInput(format!("function {} has no signature", fid.0)))?;
            let clif_sig = self.clif_signature(ctx, &sig);
            let name = format!("nox_f{}", fid.0);
            let id = self.module.declare_function(&name, Linkage::Local, &clif_sig)?;
            self.declared.insert(fid, id);
        }

        // pass two: define
        for (i, &(fid, offset)) in entries.iter().enumerate() {
            let end = entries.get(i + 1).map(|&(_, off)| off).unwrap_or(code_len);
            debug!(function = fid.0, offset, end, "lowering function");
            let clif_id = self.declared[&fid];
            let mut lowerer = FunctionLowerer::new(self, ctx, module_id, fid, offset, end)?;
            let func = lowerer.lower()?;
            let mut cctx = self.module.make_context();
            cctx.func = func;
            self.module.define_function(clif_id, &mut cctx)?;
            self.module.clear_context(&mut cctx);
        }

        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        // install the produced entry addresses
        for &(fid, _) in &entries {
            let clif_id = self.declared[&fid];
            let addr = self.module.get_finalized_function(clif_id) as usize;
            ctx.funcs.set_entry(fid, FunctionEntry::Native { addr });
        }
        Ok(())
    }

    pub(crate) fn module_mut(&mut self) -> &mut JITModule {
        &mut self.module
    }

    pub(crate) fn imports(&self) -> &RuntimeImports {
        &self.imports
    }

    pub(crate) fn declared(&self, fid: FunctionId) -> Option<ClifFuncId> {
        self.declared.get(&fid).copied()
    }

    /// Call a compiled function from host code, marshalling through the
    /// script calling convention. Functions that return on the stack need
    /// [`JitBackend::call_with_ret`].
    pub fn call(
        &self,
        ctx: &ExecutionContext,
        func: FunctionId,
        args: &[u64],
        this: Option<u64>,
    ) -> Result<u64, RuntimeError> {
        self.call_with_ret(ctx, func, args, this, None)
    }

    /// Like [`JitBackend::call`], with caller-provided storage for stack
    /// returns.
    pub fn call_with_ret(
        &self,
        ctx: &ExecutionContext,
        func: FunctionId,
        args: &[u64],
        this: Option<u64>,
        sret: Option<*mut u8>,
    ) -> Result<u64, RuntimeError> {
        let desc = ctx
            .funcs
            .get(func)
            .ok_or_else(|| RuntimeError::InvalidOpcode(format!("unknown function {}", func.0)))?;
        let FunctionEntry::Native { addr } = desc.entry else {
            return Err(RuntimeError::InvalidOpcode(format!(
                "function {} has no native entry",
                func.0
            )));
        };
        let sig = ctx
            .types
            .effective_desc(desc.signature)
            .and_then(|d| d.signature().cloned())
            .ok_or_else(|| RuntimeError::InvalidOpcode("callee has no signature".into()))?;

        let ret_addr = match (sig.returns_on_stack, sret) {
            (true, Some(p)) => p as u64,
            (true, None) => {
                return Err(RuntimeError::InvalidOpcode(
                    "stack-returning function needs caller-provided return storage".into(),
                ));
            }
            (false, _) => 0,
        };
        let mut slots = Vec::with_capacity(sig.args.len());
        let mut next = 0usize;
        for a in &sig.args {
            slots.push(match a.kind {
                ArgKind::ContextPtr => ctx as *const ExecutionContext as u64,
                ArgKind::ThisPtr => this.unwrap_or(0),
                ArgKind::RetPtr => ret_addr,
                ArgKind::CaptureDataPtr | ArgKind::FuncPtr => 0,
                ArgKind::Explicit => {
                    let v = *args.get(next).ok_or_else(|| {
                        RuntimeError::InvalidOpcode("argument count mismatch".into())
                    })?;
                    next += 1;
                    v
                }
            });
        }
        let out = unsafe { call_native_entry(ctx, addr, &sig, &slots)? };
        if sig.returns_on_stack { Ok(ret_addr) } else { Ok(out) }
    }
}
