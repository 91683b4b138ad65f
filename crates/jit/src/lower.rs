//! Per-function lowering from module IR to Cranelift IR.
//!
//! Virtual registers become Cranelift variables (the frontend inserts the
//! phis), stack allocations become explicit stack slots, labels become
//! blocks. Host calls spill their explicit arguments into an 8-byte-cell
//! array and go through the wrapper shims; indirect calls go through the
//! runtime closure dispatch.

use rustc_hash::FxHashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    Block, Function, InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind, UserFuncName,
    Value as CValue, types,
};
use cranelift_codegen::entity::EntityRef;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_module::Module as ClifModule;

use nox_core::context::ExecutionContext;
use nox_core::functions::{ArgKind, FunctionEntry, FunctionId, Signature};
use nox_core::ir::{Immediate, Instruction, LabelId, Opcode, ScalarCategory, Value, ValueKind};
use nox_core::module::ModuleId;
use nox_core::types::{TypeId, TypeMeta};

use crate::backend::{JitBackend, JitError};

pub(crate) struct FunctionLowerer<'a> {
    backend: &'a mut JitBackend,
    ctx: &'a ExecutionContext,
    module_id: ModuleId,
    fid: FunctionId,
    begin: u32,
    end: u32,
    sig: Signature,
}

fn meta_of(ctx: &ExecutionContext, ty: TypeId) -> TypeMeta {
    ctx.types.effective_desc(ty).map(|d| d.meta).unwrap_or(TypeMeta {
        size: 8,
        is_primitive: true,
        is_integral: true,
        is_unsigned: true,
        ..TypeMeta::default()
    })
}

impl<'a> FunctionLowerer<'a> {
    pub fn new(
        backend: &'a mut JitBackend,
        ctx: &'a ExecutionContext,
        module_id: ModuleId,
        fid: FunctionId,
        begin: u32,
        end: u32,
    ) -> Result<Self, JitError> {
        let desc = ctx
            .funcs
            .get(fid)
            .ok_or_else(|| JitError::BadInput(format!("function {} not registered", fid.0)))?;
        let sig = ctx
            .types
            .effective_desc(desc.signature)
            .and_then(|d| d.signature().cloned())
            .ok_or_else(|| JitError::BadInput(format!("function {} has no signature", fid.0)))?;
        Ok(FunctionLowerer { backend, ctx, module_id, fid, begin, end, sig })
    }

    pub fn lower(&mut self) -> Result<Function, JitError> {
        let code: Vec<Instruction> = {
            let m = self
                .ctx
                .module(self.module_id)
                .ok_or_else(|| JitError::BadInput("module vanished".into()))?;
            m.code[self.begin as usize..self.end as usize].to_vec()
        };

        let clif_sig = self.backend.clif_signature(self.ctx, &self.sig);
        let mut func = Function::with_name_signature(UserFuncName::user(0, self.fid.0), clif_sig);
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut func, &mut fb_ctx);

        let nargs = self.sig.args.len();

        // entry block and argument variables
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        for (i, a) in self.sig.args.iter().enumerate() {
            let ty = if a.kind == ArgKind::Explicit {
                JitBackend::clif_type(self.ctx, a.type_id)
            } else {
                types::I64
            };
            let var = Variable::new(i);
            b.declare_var(var, ty);
            let param = b.block_params(entry)[i];
            b.def_var(var, param);
        }

        // prescan: virtual-register types, stack-slot sizes, label blocks
        let mut reg_types: FxHashMap<u32, types::Type> = FxHashMap::default();
        let mut slot_sizes: FxHashMap<u32, u32> = FxHashMap::default();
        let mut label_blocks: FxHashMap<LabelId, Block> = FxHashMap::default();
        for inst in &code {
            for op in inst.operands.iter().flatten() {
                if let ValueKind::Reg(r) = op.kind {
                    // a pointer-flagged value holds an address, whatever its
                    // pointee type says
                    let ty = if op.flags.is_pointer {
                        types::I64
                    } else {
                        JitBackend::clif_type(self.ctx, op.type_id)
                    };
                    reg_types.entry(r).or_insert(ty);
                }
                if let ValueKind::Stack(s) = op.kind {
                    slot_sizes.entry(s).or_insert(8);
                }
            }
            if inst.op == Opcode::StackAlloc {
                if let (Some(v), Some(imm)) = (inst.operand(0), inst.imm) {
                    if let ValueKind::Stack(s) = v.kind {
                        slot_sizes.insert(s, (imm.as_u64() as u32).max(8));
                    }
                }
            }
            if inst.op == Opcode::Label {
                if let Some(l) = inst.label() {
                    label_blocks.entry(l).or_insert_with(|| b.create_block());
                }
            }
        }
        for (&r, &ty) in &reg_types {
            b.declare_var(Variable::new(nargs + r as usize), ty);
        }
        let mut slots: FxHashMap<u32, StackSlot> = FxHashMap::default();
        for (&s, &size) in &slot_sizes {
            let data = StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3);
            slots.insert(s, b.create_sized_stack_slot(data));
        }

        let mut st = LowerState {
            ctx: self.ctx,
            sig: &self.sig,
            nargs,
            slots,
            label_blocks,
            pending: Vec::new(),
            terminated: false,
        };

        for inst in &code {
            if inst.op == Opcode::Label {
                let l = inst.label().expect("label instruction carries its id");
                let blk = st.label_blocks[&l];
                if !st.terminated {
                    b.ins().jump(blk, &[]);
                }
                b.switch_to_block(blk);
                st.terminated = false;
                continue;
            }
            if st.terminated {
                // unreachable filler between a terminator and the next label
                let dead = b.create_block();
                b.switch_to_block(dead);
                st.terminated = false;
            }
            st.lower_inst(&mut b, self.backend, inst)?;
        }

        if !st.terminated {
            st.emit_default_return(&mut b);
        }

        b.seal_all_blocks();
        b.finalize();
        Ok(func)
    }
}

struct LowerState<'s> {
    ctx: &'s ExecutionContext,
    sig: &'s Signature,
    nargs: usize,
    slots: FxHashMap<u32, StackSlot>,
    label_blocks: FxHashMap<LabelId, Block>,
    /// Explicit call parameters queued by `Param`.
    pending: Vec<(CValue, TypeId)>,
    terminated: bool,
}

impl<'s> LowerState<'s> {
    fn var_of(&self, v: &Value) -> Result<Variable, JitError> {
        match v.kind {
            ValueKind::Reg(r) => Ok(Variable::new(self.nargs + r as usize)),
            ValueKind::Arg(a) => Ok(Variable::new(a as usize)),
            _ => Err(JitError::BadInput("operand is not a register".into())),
        }
    }

    fn clif_ty(&self, ty: TypeId) -> types::Type {
        JitBackend::clif_type(self.ctx, ty)
    }

    fn read(&mut self, b: &mut FunctionBuilder, v: &Value) -> Result<CValue, JitError> {
        match &v.kind {
            ValueKind::Reg(_) | ValueKind::Arg(_) => Ok(b.use_var(self.var_of(v)?)),
            ValueKind::Stack(s) => {
                let slot = *self
                    .slots
                    .get(s)
                    .ok_or_else(|| JitError::BadInput(format!("unallocated stack slot {}", s)))?;
                Ok(b.ins().stack_addr(types::I64, slot, 0))
            }
            ValueKind::Imm(imm) => self.read_imm(b, imm, v.type_id),
            ValueKind::Poison => Err(JitError::BadInput("poison operand reached codegen".into())),
        }
    }

    fn read_imm(&self, b: &mut FunctionBuilder, imm: &Immediate, ty: TypeId) -> Result<CValue, JitError> {
        let ct = self.clif_ty(ty);
        Ok(match *imm {
            Immediate::I(v) => iconst_masked(b, ct, v),
            Immediate::U(v) => iconst_masked(b, ct, v as i64),
            Immediate::F(v) => b.ins().f32const(v),
            Immediate::D(v) => b.ins().f64const(v),
            Immediate::Func(f) => b.ins().iconst(types::I64, f.0 as i64),
            Immediate::Module(m) => b.ins().iconst(types::I64, m.0 as i64),
            Immediate::Type(t) => b.ins().iconst(types::I64, t.0 as i64),
            Immediate::ModuleData(m, slot) => {
                let addr = self
                    .ctx
                    .module(m)
                    .and_then(|md| md.data.get(slot as usize))
                    .map(|d| d.address())
                    .ok_or_else(|| JitError::BadInput(format!("module data {}:{}", m.0, slot)))?;
                b.ins().iconst(types::I64, addr as i64)
            }
            Immediate::Label(_) => {
                return Err(JitError::BadInput("label immediate used as a value".into()));
            }
        })
    }

    fn write(&mut self, b: &mut FunctionBuilder, v: &Value, val: CValue) -> Result<(), JitError> {
        let var = self.var_of(v)?;
        b.def_var(var, val);
        Ok(())
    }

    /// Truthiness of a value per its scalar category.
    fn truthy(&mut self, b: &mut FunctionBuilder, val: CValue, meta: &TypeMeta) -> CValue {
        match ScalarCategory::of(meta) {
            ScalarCategory::F32 => {
                let z = b.ins().f32const(0.0f32);
                b.ins().fcmp(FloatCC::NotEqual, val, z)
            }
            ScalarCategory::F64 => {
                let z = b.ins().f64const(0.0f64);
                b.ins().fcmp(FloatCC::NotEqual, val, z)
            }
            _ => b.ins().icmp_imm(IntCC::NotEqual, val, 0),
        }
    }

    fn emit_default_return(&mut self, b: &mut FunctionBuilder) {
        let is_void =
            self.sig.returns_on_stack || self.ctx.types.is_equal(self.sig.ret, self.ctx.builtins.void);
        if is_void {
            b.ins().return_(&[]);
        } else {
            let ct = self.clif_ty(self.sig.ret);
            let zero = match ct {
                types::F32 => b.ins().f32const(0.0f32),
                types::F64 => b.ins().f64const(0.0f64),
                other => b.ins().iconst(other, 0),
            };
            b.ins().return_(&[zero]);
        }
        self.terminated = true;
    }

    fn lower_inst(
        &mut self,
        b: &mut FunctionBuilder,
        backend: &mut JitBackend,
        inst: &Instruction,
    ) -> Result<(), JitError> {
        use Opcode::*;
        match inst.op {
            Noop | Reserve | Resolve | StackFree | Label => {}
            StackAlloc => {
                // slots were materialized up front; the guard discipline is
                // the native stack's own
            }
            Term => {
                self.emit_default_return(b);
            }

            Load => {
                let dst = operand(inst, 0)?;
                let ptr = operand(inst, 1)?;
                let addr = self.read(b, ptr)?;
                let offset = inst.imm.map(|i| i.as_u64() as i32).unwrap_or(0);
                // pointer-flagged destinations receive an address
                let ty = if dst.flags.is_pointer { types::I64 } else { self.clif_ty(dst.type_id) };
                let loaded = b.ins().load(ty, MemFlags::trusted(), addr, offset);
                self.write(b, dst, loaded)?;
            }
            Store => {
                let src = operand(inst, 0)?;
                let ptr = operand(inst, 1)?;
                let val = self.read(b, src)?;
                let addr = self.read(b, ptr)?;
                let offset = inst.imm.map(|i| i.as_u64() as i32).unwrap_or(0);
                b.ins().store(MemFlags::trusted(), val, addr, offset);
            }
            ModuleData => {
                let dst = operand(inst, 0)?;
                let Some(imm) = inst.imm else {
                    return Err(JitError::BadInput("module_data without immediate".into()));
                };
                let v = self.read_imm(b, &imm, dst.type_id)?;
                self.write(b, dst, v)?;
            }

            Branch => {
                let cond_v = operand(inst, 0)?;
                let cond = self.read(b, cond_v)?;
                let target = self.target_block(inst)?;
                let cont = b.create_block();
                // branch goes to its label when the condition is zero
                b.ins().brif(cond, cont, &[], target, &[]);
                b.switch_to_block(cont);
            }
            Jump => {
                let target = self.target_block(inst)?;
                b.ins().jump(target, &[]);
                self.terminated = true;
            }
            Ret => {
                match inst.operand(0) {
                    Some(v) => {
                        let val = self.read(b, v)?;
                        b.ins().return_(&[val]);
                        self.terminated = true;
                    }
                    None => {
                        self.emit_default_return(b);
                    }
                }
            }

            Param => {
                let v = operand(inst, 0)?;
                let val = self.read(b, v)?;
                self.pending.push((val, v.type_id));
            }
            Call => self.lower_call(b, backend, inst)?,

            Assign => {
                let dst = operand(inst, 0)?;
                let val = self.read(b, operand(inst, 1)?)?;
                self.write(b, dst, val)?;
            }
            Cvt => {
                let dst = operand(inst, 0)?;
                let src = operand(inst, 1)?;
                let val = self.read(b, src)?;
                let Some(Immediate::Type(to_id)) = inst.imm else {
                    return Err(JitError::BadInput("cvt without target type".into()));
                };
                let from = meta_of(self.ctx, src.type_id);
                let to = meta_of(self.ctx, to_id);
                let to_bool = self.ctx.types.is_equal(to_id, self.ctx.builtins.boolean);
                let out = self.emit_cvt(b, val, &from, &to, to_bool);
                self.write(b, dst, out)?;
            }

            _ => self.lower_alu(b, inst)?,
        }
        Ok(())
    }

    fn target_block(&self, inst: &Instruction) -> Result<Block, JitError> {
        let l = inst
            .label()
            .ok_or_else(|| JitError::BadInput("control flow without label".into()))?;
        self.label_blocks
            .get(&l)
            .copied()
            .ok_or_else(|| JitError::BadInput(format!("unbound label L{}", l.0)))
    }

    // ---- conversions -------------------------------------------------------

    fn emit_cvt(
        &mut self,
        b: &mut FunctionBuilder,
        val: CValue,
        from: &TypeMeta,
        to: &TypeMeta,
        to_bool: bool,
    ) -> CValue {
        use ScalarCategory as C;
        if to_bool {
            return self.truthy(b, val, from);
        }
        let fcat = C::of(from);
        let tcat = C::of(to);
        let tty = match tcat {
            C::F32 => types::F32,
            C::F64 => types::F64,
            _ => int_ty(to.size),
        };
        let fty = match fcat {
            C::F32 => types::F32,
            C::F64 => types::F64,
            _ => int_ty(from.size),
        };

        match (fcat, tcat) {
            // every pair of scalar categories gets an explicit lowering; no
            // single machine form covers them all
            (C::F32, C::F32) | (C::F64, C::F64) => val,
            (C::F32, C::F64) => b.ins().fpromote(types::F64, val),
            (C::F64, C::F32) => b.ins().fdemote(types::F32, val),
            (C::F32, C::Signed) | (C::F64, C::Signed) => b.ins().fcvt_to_sint_sat(tty, val),
            (C::F32, C::Unsigned) | (C::F64, C::Unsigned) => b.ins().fcvt_to_uint_sat(tty, val),
            (C::Signed, C::F32) | (C::Signed, C::F64) => {
                let ft = if tcat == C::F32 { types::F32 } else { types::F64 };
                b.ins().fcvt_from_sint(ft, val)
            }
            (C::Unsigned, C::F32) | (C::Unsigned, C::F64) => {
                let ft = if tcat == C::F32 { types::F32 } else { types::F64 };
                b.ins().fcvt_from_uint(ft, val)
            }
            (C::Signed, C::Signed) | (C::Signed, C::Unsigned) | (C::Unsigned, C::Signed)
            | (C::Unsigned, C::Unsigned) => {
                let fw = fty.bits();
                let tw = tty.bits();
                if fw == tw {
                    val
                } else if fw > tw {
                    b.ins().ireduce(tty, val)
                } else if fcat == C::Signed {
                    b.ins().sextend(tty, val)
                } else {
                    b.ins().uextend(tty, val)
                }
            }
        }
    }

    /// Extend or bit-image a value into a 64-bit call cell.
    fn to_cell(&mut self, b: &mut FunctionBuilder, val: CValue, ty: TypeId) -> CValue {
        let meta = meta_of(self.ctx, ty);
        let ct = self.clif_ty(ty);
        match ct {
            types::F32 => {
                let bits = b.ins().bitcast(types::I32, MemFlags::new(), val);
                b.ins().uextend(types::I64, bits)
            }
            types::F64 => b.ins().bitcast(types::I64, MemFlags::new(), val),
            types::I64 => val,
            small => {
                let _ = small;
                if meta.is_unsigned || !meta.is_integral {
                    b.ins().uextend(types::I64, val)
                } else {
                    b.ins().sextend(types::I64, val)
                }
            }
        }
    }

    /// Narrow a 64-bit call cell back to a typed value.
    fn from_cell(&mut self, b: &mut FunctionBuilder, cell: CValue, ty: TypeId) -> CValue {
        let ct = self.clif_ty(ty);
        match ct {
            types::I64 => cell,
            types::F64 => b.ins().bitcast(types::F64, MemFlags::new(), cell),
            types::F32 => {
                let low = b.ins().ireduce(types::I32, cell);
                b.ins().bitcast(types::F32, MemFlags::new(), low)
            }
            small => b.ins().ireduce(small, cell),
        }
    }

    // ---- calls -------------------------------------------------------------

    fn lower_call(
        &mut self,
        b: &mut FunctionBuilder,
        backend: &mut JitBackend,
        inst: &Instruction,
    ) -> Result<(), JitError> {
        let callee_v = operand(inst, 0)?;
        let dest = inst.operand(1).filter(|d| !d.is_poison()).cloned();
        let this_op = inst.operand(2).filter(|t| !t.is_poison()).cloned();

        let ctx_idx = self
            .sig
            .arg_index(ArgKind::ContextPtr)
            .ok_or_else(|| JitError::BadInput("function signature lacks a context argument".into()))?;
        let ctx_val = b.use_var(Variable::new(ctx_idx));

        match callee_v.function_id() {
            Some(target) => {
                let desc = backend_desc(self.ctx, target)?;
                let sig = self
                    .ctx
                    .types
                    .effective_desc(desc.signature)
                    .and_then(|d| d.signature().cloned())
                    .ok_or_else(|| JitError::BadInput("callee has no signature".into()))?;
                let explicit = self.take_explicit(sig.explicit_count())?;

                match desc.entry {
                    FunctionEntry::Host(w) => {
                        self.emit_host_call(b, backend, &sig, w, ctx_val, &this_op, &dest, &explicit, desc.flags.is_thiscall)
                    }
                    _ => self.emit_script_call(b, backend, target, &sig, ctx_val, &this_op, &dest, &explicit),
                }
            }
            None => {
                // closure record: route through the runtime dispatch
                let sig = self
                    .ctx
                    .types
                    .effective_desc(callee_v.type_id)
                    .and_then(|d| d.signature().cloned())
                    .ok_or_else(|| JitError::BadInput("indirect callee is not a function type".into()))?;
                let explicit = self.take_explicit(sig.explicit_count())?;
                let closure = self.read(b, callee_v)?;

                let (args_ptr, argc) = self.spill_cells(b, &explicit)?;
                let ret_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 8, 3));
                let ret_ptr = b.ins().stack_addr(types::I64, ret_slot, 0);
                let argc_v = b.ins().iconst(types::I64, argc as i64);

                let import = backend.imports().closure;
                let fref = backend.module_mut().declare_func_in_func(import, b.func);
                b.ins().call(fref, &[ctx_val, closure, ret_ptr, args_ptr, argc_v]);

                if let Some(d) = &dest {
                    if !matches!(d.kind, ValueKind::Stack(_)) {
                        let cell = b.ins().load(types::I64, MemFlags::trusted(), ret_ptr, 0);
                        let out = self.from_cell(b, cell, d.type_id);
                        self.write(b, d, out)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn take_explicit(&mut self, count: usize) -> Result<Vec<(CValue, TypeId)>, JitError> {
        if self.pending.len() < count {
            return Err(JitError::BadInput("missing call parameters".into()));
        }
        Ok(self.pending.split_off(self.pending.len() - count))
    }

    /// Store call cells into a fresh array slot; returns (pointer, count).
    fn spill_cells(
        &mut self,
        b: &mut FunctionBuilder,
        args: &[(CValue, TypeId)],
    ) -> Result<(CValue, usize), JitError> {
        let size = (args.len().max(1) * 8) as u32;
        let slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3));
        let base = b.ins().stack_addr(types::I64, slot, 0);
        for (i, (val, ty)) in args.iter().enumerate() {
            let cell = self.to_cell(b, *val, *ty);
            b.ins().store(MemFlags::trusted(), cell, base, (i * 8) as i32);
        }
        Ok((base, args.len()))
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_host_call(
        &mut self,
        b: &mut FunctionBuilder,
        backend: &mut JitBackend,
        sig: &Signature,
        wrappers: nox_core::functions::WrapperAddrs,
        ctx_val: CValue,
        this_op: &Option<Value>,
        dest: &Option<Value>,
        explicit: &[(CValue, TypeId)],
        is_thiscall: bool,
    ) -> Result<(), JitError> {
        let (args_ptr, argc) = self.spill_cells(b, explicit)?;
        let argc_v = b.ins().iconst(types::I64, argc as i64);
        let binding = b.ins().iconst(types::I64, wrappers.binding as i64);

        if sig.returns_on_stack {
            // the destination slot doubles as the hidden return pointer
            let sret = match dest {
                Some(d) => self.read(b, d)?,
                None => b.ins().iconst(types::I64, 0),
            };
            if is_thiscall {
                let this = match this_op {
                    Some(t) => self.read(b, t)?,
                    None => b.ins().iconst(types::I64, 0),
                };
                let import = backend.imports().method;
                let fref = backend.module_mut().declare_func_in_func(import, b.func);
                b.ins().call(fref, &[binding, ctx_val, this, sret, args_ptr, argc_v]);
            } else {
                let import = backend.imports().srv;
                let fref = backend.module_mut().declare_func_in_func(import, b.func);
                b.ins().call(fref, &[binding, ctx_val, sret, args_ptr, argc_v]);
            }
            return Ok(());
        }

        let ret_slot = b.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 8, 3));
        let ret_ptr = b.ins().stack_addr(types::I64, ret_slot, 0);

        if is_thiscall {
            let this = match this_op {
                Some(t) => self.read(b, t)?,
                None => b.ins().iconst(types::I64, 0),
            };
            let import = backend.imports().method;
            let fref = backend.module_mut().declare_func_in_func(import, b.func);
            b.ins().call(fref, &[binding, ctx_val, this, ret_ptr, args_ptr, argc_v]);
        } else {
            let import = backend.imports().cdecl;
            let fref = backend.module_mut().declare_func_in_func(import, b.func);
            b.ins().call(fref, &[binding, ctx_val, ret_ptr, args_ptr, argc_v]);
        }

        if let Some(d) = dest {
            let cell = b.ins().load(types::I64, MemFlags::trusted(), ret_ptr, 0);
            let out = self.from_cell(b, cell, d.type_id);
            self.write(b, d, out)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_script_call(
        &mut self,
        b: &mut FunctionBuilder,
        backend: &mut JitBackend,
        target: FunctionId,
        sig: &Signature,
        ctx_val: CValue,
        this_op: &Option<Value>,
        dest: &Option<Value>,
        explicit: &[(CValue, TypeId)],
    ) -> Result<(), JitError> {
        let mut full_args: Vec<CValue> = Vec::with_capacity(sig.args.len());
        let mut next = 0usize;
        for a in &sig.args {
            let v = match a.kind {
                ArgKind::ContextPtr => ctx_val,
                ArgKind::ThisPtr => match this_op {
                    Some(t) => self.read(b, t)?,
                    None => b.ins().iconst(types::I64, 0),
                },
                ArgKind::RetPtr => match dest {
                    Some(d) => self.read(b, d)?,
                    None => b.ins().iconst(types::I64, 0),
                },
                ArgKind::CaptureDataPtr | ArgKind::FuncPtr => b.ins().iconst(types::I64, 0),
                ArgKind::Explicit => {
                    let (v, _) = explicit[next];
                    next += 1;
                    v
                }
            };
            full_args.push(v);
        }

        let results = if let Some(clif_id) = backend.declared(target) {
            let fref = backend.module_mut().declare_func_in_func(clif_id, b.func);
            let call = b.ins().call(fref, &full_args);
            b.inst_results(call).to_vec()
        } else if let FunctionEntry::Native { addr } = backend_desc(self.ctx, target)?.entry {
            // already-compiled function from another compilation round
            let clif_sig = backend.clif_signature(self.ctx, sig);
            let sigref = b.import_signature(clif_sig);
            let callee = b.ins().iconst(types::I64, addr as i64);
            let call = b.ins().call_indirect(sigref, callee, &full_args);
            b.inst_results(call).to_vec()
        } else {
            return Err(JitError::BadInput(format!(
                "call target {} is not compiled in this module",
                target.0
            )));
        };

        if let Some(d) = dest {
            if !matches!(d.kind, ValueKind::Stack(_)) {
                let out = results
                    .first()
                    .copied()
                    .ok_or_else(|| JitError::BadInput("callee returned no value".into()))?;
                self.write(b, d, out)?;
            }
        }
        Ok(())
    }

    // ---- arithmetic --------------------------------------------------------

    fn lower_alu(&mut self, b: &mut FunctionBuilder, inst: &Instruction) -> Result<(), JitError> {
        use Opcode::*;

        let dst = operand(inst, 0)?;
        let a_op = operand(inst, 1)?;
        let a = self.read(b, a_op)?;
        let meta = meta_of(self.ctx, a_op.type_id);

        // unary forms first
        let unary = match inst.op {
            INeg => Some(b.ins().ineg(a)),
            FNeg | DNeg => Some(b.ins().fneg(a)),
            IInc | UInc => Some(b.ins().iadd_imm(a, 1)),
            IDec | UDec => Some(b.ins().iadd_imm(a, -1)),
            FInc => {
                let one = b.ins().f32const(1.0f32);
                Some(b.ins().fadd(a, one))
            }
            FDec => {
                let one = b.ins().f32const(1.0f32);
                Some(b.ins().fsub(a, one))
            }
            DInc => {
                let one = b.ins().f64const(1.0f64);
                Some(b.ins().fadd(a, one))
            }
            DDec => {
                let one = b.ins().f64const(1.0f64);
                Some(b.ins().fsub(a, one))
            }
            Not => {
                let t = self.truthy(b, a, &meta);
                Some(b.ins().icmp_imm(IntCC::Equal, t, 0))
            }
            Inv => Some(b.ins().bnot(a)),
            _ => None,
        };
        if let Some(out) = unary {
            return self.write(b, dst, out);
        }

        let b_op = operand(inst, 2)?;
        let bv = self.read(b, b_op)?;

        let out = match inst.op {
            IAdd | UAdd => b.ins().iadd(a, bv),
            ISub | USub => b.ins().isub(a, bv),
            IMul | UMul => b.ins().imul(a, bv),
            IDiv => b.ins().sdiv(a, bv),
            UDiv => b.ins().udiv(a, bv),
            IMod => b.ins().srem(a, bv),
            UMod => b.ins().urem(a, bv),
            FAdd | DAdd => b.ins().fadd(a, bv),
            FSub | DSub => b.ins().fsub(a, bv),
            FMul | DMul => b.ins().fmul(a, bv),
            FDiv | DDiv => b.ins().fdiv(a, bv),
            FMod | DMod => {
                // no fused remainder instruction; a - trunc(a/b) * b
                let q = b.ins().fdiv(a, bv);
                let t = b.ins().trunc(q);
                let p = b.ins().fmul(t, bv);
                b.ins().fsub(a, p)
            }

            Band => b.ins().band(a, bv),
            Bor => b.ins().bor(a, bv),
            Bxor => b.ins().bxor(a, bv),
            Shl => b.ins().ishl(a, bv),
            Shr => {
                if ScalarCategory::of(&meta) == ScalarCategory::Signed {
                    b.ins().sshr(a, bv)
                } else {
                    b.ins().ushr(a, bv)
                }
            }
            Land => {
                let ta = self.truthy(b, a, &meta);
                let mb = meta_of(self.ctx, b_op.type_id);
                let tb = self.truthy(b, bv, &mb);
                b.ins().band(ta, tb)
            }
            Lor => {
                let ta = self.truthy(b, a, &meta);
                let mb = meta_of(self.ctx, b_op.type_id);
                let tb = self.truthy(b, bv, &mb);
                b.ins().bor(ta, tb)
            }

            IEq | UEq => b.ins().icmp(IntCC::Equal, a, bv),
            INeq | UNeq => b.ins().icmp(IntCC::NotEqual, a, bv),
            ILt => b.ins().icmp(IntCC::SignedLessThan, a, bv),
            IGt => b.ins().icmp(IntCC::SignedGreaterThan, a, bv),
            ILte => b.ins().icmp(IntCC::SignedLessThanOrEqual, a, bv),
            IGte => b.ins().icmp(IntCC::SignedGreaterThanOrEqual, a, bv),
            ULt => b.ins().icmp(IntCC::UnsignedLessThan, a, bv),
            UGt => b.ins().icmp(IntCC::UnsignedGreaterThan, a, bv),
            ULte => b.ins().icmp(IntCC::UnsignedLessThanOrEqual, a, bv),
            UGte => b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, a, bv),
            FEq | DEq => b.ins().fcmp(FloatCC::Equal, a, bv),
            FNeq | DNeq => b.ins().fcmp(FloatCC::NotEqual, a, bv),
            FLt | DLt => b.ins().fcmp(FloatCC::LessThan, a, bv),
            FGt | DGt => b.ins().fcmp(FloatCC::GreaterThan, a, bv),
            FLte | DLte => b.ins().fcmp(FloatCC::LessThanOrEqual, a, bv),
            FGte | DGte => b.ins().fcmp(FloatCC::GreaterThanOrEqual, a, bv),

            other => {
                return Err(JitError::BadInput(format!("unsupported opcode {:?}", other)));
            }
        };
        self.write(b, dst, out)
    }
}

fn operand<'i>(inst: &'i Instruction, i: usize) -> Result<&'i Value, JitError> {
    inst.operand(i)
        .ok_or_else(|| JitError::BadInput(format!("{:?} is missing operand {}", inst.op, i)))
}

fn backend_desc<'c>(
    ctx: &'c ExecutionContext,
    fid: FunctionId,
) -> Result<&'c nox_core::functions::FunctionDescriptor, JitError> {
    ctx.funcs
        .get(fid)
        .ok_or_else(|| JitError::BadInput(format!("unknown function {}", fid.0)))
}

fn int_ty(size: u32) -> types::Type {
    match size {
        1 => types::I8,
        2 => types::I16,
        4 => types::I32,
        _ => types::I64,
    }
}

fn iconst_masked(b: &mut FunctionBuilder, ty: types::Type, v: i64) -> CValue {
    let masked = match ty {
        types::I8 => v as i8 as i64,
        types::I16 => v as i16 as i64,
        types::I32 => v as i32 as i64,
        _ => v,
    };
    b.ins().iconst(ty, masked)
}
