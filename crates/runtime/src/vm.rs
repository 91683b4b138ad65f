//! The register virtual machine.
//!
//! Executes committed module IR directly: a dense dispatch over the opcode
//! at `ip`, a 256-slot register file, and one guarded stack buffer. Each
//! script call gets a register window (arguments first, then virtual
//! registers); the caller's window is saved on an explicit frame stack and
//! restored on return.
//!
//! The machine is single-threaded and non-reentrant except through host
//! callbacks: a host function called from script may call back into the
//! same `Vm`, which nests by pushing a sentinel frame and reusing the
//! register file.

use rustc_hash::FxHashMap;
use tracing::trace;

use nox_core::context::ExecutionContext;
use nox_core::error::RuntimeError;
use nox_core::functions::{ArgKind, FunctionEntry, FunctionId, Signature};
use nox_core::ir::{Immediate, LabelId, Opcode, ScalarCategory, Value, ValueKind};
use nox_core::module::ModuleId;
use nox_core::types::{TypeId, TypeMeta};

use crate::closure::Closure;
use crate::ffi::{HostBinding, call_native_entry};
use crate::state::{GP_COUNT, Registers, StackMem, load, store};

/// Marks the frame a host-level call pushed; popping it ends that call.
const HOST_SENTINEL: u64 = u64::MAX;

#[derive(Debug)]
struct Frame {
    module: ModuleId,
    arg_count: usize,
    window: usize,
    caller_saved: Vec<u64>,
    ret_ip: u64,
    dest: Option<Value>,
    sp_mark: u64,
    slots: FxHashMap<u32, u64>,
}

pub struct Vm {
    regs: Registers,
    stack: StackMem,
    frames: Vec<Frame>,
    params: Vec<u64>,
    labels: FxHashMap<ModuleId, FxHashMap<LabelId, u64>>,
    nest: u32,
}

impl Vm {
    pub fn new(stack_size: usize) -> Self {
        Vm {
            regs: Registers::new(),
            stack: StackMem::new(stack_size),
            frames: Vec::new(),
            params: Vec::new(),
            labels: FxHashMap::default(),
            nest: 0,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.nest > 0
    }

    /// Call a script function. Explicit arguments are raw 64-bit slots
    /// (floats as bits); the return value comes back the same way. For
    /// stack returns the result is the address of the return slot.
    pub fn call(
        &mut self,
        ctx: &ExecutionContext,
        func: FunctionId,
        args: &[u64],
        this: Option<u64>,
    ) -> Result<u64, RuntimeError> {
        self.enter(ctx, func, args, this, 0)
    }

    /// Invoke a closure record (host or script target).
    pub fn call_closure(
        &mut self,
        ctx: &ExecutionContext,
        closure_addr: u64,
        args: &[u64],
    ) -> Result<u64, RuntimeError> {
        let c = unsafe { Closure::borrow_raw(closure_addr) }.ok_or(RuntimeError::NullCallback)?;
        let this = if c.this_ptr != 0 { Some(c.this_ptr) } else { None };
        self.enter(ctx, c.target, args, this, c.capture)
    }

    fn enter(
        &mut self,
        ctx: &ExecutionContext,
        func: FunctionId,
        args: &[u64],
        this: Option<u64>,
        capture: u64,
    ) -> Result<u64, RuntimeError> {
        let desc = ctx
            .funcs
            .get(func)
            .ok_or_else(|| RuntimeError::InvalidOpcode(format!("unknown function {}", func.0)))?;
        let sig = signature_of(ctx, desc.signature)?;

        if let FunctionEntry::Host(w) = desc.entry {
            // host target invoked through the same wrappers scripts use
            let binding = unsafe { &*(w.binding as *const HostBinding) };
            let mut out = 0u64;
            unsafe {
                binding.call(ctx as *const _, this.unwrap_or(0), 0, capture, args, &mut out);
            }
            return Ok(out);
        }

        let (entry_module, entry_offset) = match desc.entry {
            FunctionEntry::Script { module, offset } => (module, offset),
            FunctionEntry::Native { addr } => {
                let slots = self.native_slots(ctx, &sig, args, this, capture)?;
                return unsafe { call_native_entry(ctx, addr, &sig, &slots) };
            }
            _ => {
                return Err(RuntimeError::InvalidOpcode(format!(
                    "function {} has no executable entry",
                    func.0
                )));
            }
        };

        let window = sig.args.len() + desc.vreg_count as usize;
        if window > GP_COUNT {
            return Err(RuntimeError::InvalidOpcode(format!(
                "function {} needs {} register slots",
                func.0, window
            )));
        }
        if sig.explicit_count() != args.len() {
            return Err(RuntimeError::InvalidOpcode(format!(
                "function {} takes {} arguments, {} given",
                func.0,
                sig.explicit_count(),
                args.len()
            )));
        }

        if self.nest == 0 {
            self.regs.sp = self.stack.base();
            self.regs.ra = 0;
        }
        self.nest += 1;

        let result = self.enter_inner(ctx, &sig, args, this, capture, entry_module, entry_offset, window);
        self.nest -= 1;
        if self.nest == 0 {
            self.frames.clear();
            self.params.clear();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_inner(
        &mut self,
        ctx: &ExecutionContext,
        sig: &Signature,
        args: &[u64],
        this: Option<u64>,
        capture: u64,
        entry_module: ModuleId,
        entry_offset: u32,
        window: usize,
    ) -> Result<u64, RuntimeError> {
        // hidden return slot for stack returns
        let ret_addr = if sig.returns_on_stack {
            let size = type_size(ctx, sig.ret).max(8) as u64;
            self.regs.sp = align8(self.regs.sp);
            self.stack.check_alloc(self.regs.sp, size)?;
            let addr = self.regs.sp;
            self.regs.sp += size;
            addr
        } else {
            0
        };

        let prev_window = self.frames.last().map(|f| f.window).unwrap_or(0);
        let saved: Vec<u64> = self.regs.gp[..prev_window].to_vec();

        let mut slots = Vec::with_capacity(sig.args.len());
        let mut next_arg = 0usize;
        for a in &sig.args {
            let v = match a.kind {
                ArgKind::ContextPtr => ctx as *const ExecutionContext as u64,
                ArgKind::ThisPtr => this.unwrap_or(0),
                ArgKind::RetPtr => ret_addr,
                ArgKind::CaptureDataPtr => capture,
                ArgKind::FuncPtr => 0,
                ArgKind::Explicit => {
                    let v = args[next_arg];
                    next_arg += 1;
                    v
                }
            };
            slots.push(v);
        }

        self.frames.push(Frame {
            module: entry_module,
            arg_count: sig.args.len(),
            window,
            caller_saved: saved,
            ret_ip: HOST_SENTINEL,
            dest: None,
            sp_mark: self.regs.sp,
            slots: FxHashMap::default(),
        });
        let depth = self.frames.len();

        for (i, v) in slots.iter().enumerate() {
            self.regs.gp[i] = *v;
        }
        for r in slots.len()..window {
            self.regs.gp[r] = 0;
        }
        self.regs.ip = entry_offset as u64;

        let value = self.run(ctx, depth);
        match value {
            Ok(v) => {
                if sig.returns_on_stack {
                    Ok(ret_addr)
                } else {
                    Ok(v)
                }
            }
            Err(e) => {
                // unwind anything this invocation pushed
                self.frames.truncate(depth.saturating_sub(1));
                Err(e)
            }
        }
    }

    // ---- operand plumbing --------------------------------------------------

    fn cur(&self) -> &Frame {
        self.frames.last().expect("the VM always runs inside a frame")
    }

    fn reg_index(&self, v: &Value) -> Result<usize, RuntimeError> {
        let f = self.cur();
        let idx = match v.kind {
            ValueKind::Reg(r) => f.arg_count + r as usize,
            ValueKind::Arg(a) => a as usize,
            _ => return Err(RuntimeError::InvalidOpcode("operand is not a register".into())),
        };
        if idx >= GP_COUNT {
            return Err(RuntimeError::InvalidOpcode("register window exceeded".into()));
        }
        Ok(idx)
    }

    fn read(&self, v: &Value) -> Result<u64, RuntimeError> {
        match &v.kind {
            ValueKind::Reg(_) | ValueKind::Arg(_) => Ok(self.regs.gp[self.reg_index(v)?]),
            ValueKind::Stack(s) => self
                .cur()
                .slots
                .get(s)
                .copied()
                .ok_or_else(|| RuntimeError::InvalidOpcode(format!("stack slot {} is not allocated", s))),
            ValueKind::Imm(imm) => Ok(imm.as_u64()),
            ValueKind::Poison => Err(RuntimeError::InvalidOpcode("poison operand reached execution".into())),
        }
    }

    fn write(&mut self, v: &Value, value: u64) -> Result<(), RuntimeError> {
        let idx = self.reg_index(v)?;
        self.regs.gp[idx] = value;
        Ok(())
    }

    fn label_offset(
        &mut self,
        ctx: &ExecutionContext,
        module: ModuleId,
        label: LabelId,
    ) -> Result<u64, RuntimeError> {
        if !self.labels.contains_key(&module) {
            let m = ctx
                .module(module)
                .ok_or(RuntimeError::InvalidModule(module.0))?;
            let mut table = FxHashMap::default();
            for (i, inst) in m.code.iter().enumerate() {
                if inst.op == Opcode::Label {
                    if let Some(l) = inst.label() {
                        table.insert(l, i as u64);
                    }
                }
            }
            self.labels.insert(module, table);
        }
        self.labels[&module]
            .get(&label)
            .copied()
            .ok_or_else(|| RuntimeError::InvalidOpcode(format!("unbound label L{}", label.0)))
    }

    fn native_slots(
        &self,
        ctx: &ExecutionContext,
        sig: &Signature,
        args: &[u64],
        this: Option<u64>,
        capture: u64,
    ) -> Result<Vec<u64>, RuntimeError> {
        let mut slots = Vec::with_capacity(sig.args.len());
        let mut next = 0usize;
        for a in &sig.args {
            slots.push(match a.kind {
                ArgKind::ContextPtr => ctx as *const ExecutionContext as u64,
                ArgKind::ThisPtr => this.unwrap_or(0),
                ArgKind::RetPtr => 0,
                ArgKind::CaptureDataPtr => capture,
                ArgKind::FuncPtr => 0,
                ArgKind::Explicit => {
                    let v = *args.get(next).ok_or_else(|| {
                        RuntimeError::InvalidOpcode("argument count mismatch".into())
                    })?;
                    next += 1;
                    v
                }
            });
        }
        Ok(slots)
    }

    // ---- the dispatch loop -------------------------------------------------

    fn run(&mut self, ctx: &ExecutionContext, return_depth: usize) -> Result<u64, RuntimeError> {
        loop {
            let mid = self.cur().module;
            let module = ctx.module(mid).ok_or(RuntimeError::InvalidModule(mid.0))?;
            let code = &module.code;
            let ip = self.regs.ip as usize;

            if ip >= code.len() {
                // fell off the buffer: implicit void return
                if let Some(v) = self.do_ret(None, return_depth)? {
                    return Ok(v);
                }
                continue;
            }
            let inst = &code[ip];
            trace!(ip, op = ?inst.op, "step");

            match inst.op {
                Opcode::Noop | Opcode::Label | Opcode::Reserve | Opcode::Resolve => {}
                Opcode::Term => return Ok(0),

                Opcode::Load => {
                    let dst = operand(inst, 0)?;
                    let ptr = operand(inst, 1)?;
                    let offset = inst.imm.map(|i| i.as_u64()).unwrap_or(0);
                    let addr = self.read(ptr)?.wrapping_add(offset);
                    let meta = meta_of(ctx, dst.type_id);
                    // a pointer-flagged destination receives an address,
                    // whatever its pointee width is
                    let width = if dst.flags.is_pointer { 8 } else { meta.size.max(1).min(8) };
                    self.stack.check(addr, width)?;
                    let raw = unsafe { load(addr, width) };
                    let out = if dst.flags.is_pointer { raw } else { canon(raw, &meta) };
                    self.write(dst, out)?;
                }
                Opcode::Store => {
                    let src = operand(inst, 0)?;
                    let ptr = operand(inst, 1)?;
                    let offset = inst.imm.map(|i| i.as_u64()).unwrap_or(0);
                    let addr = self.read(ptr)?.wrapping_add(offset);
                    let meta = meta_of(ctx, src.type_id);
                    let width = if src.flags.is_pointer { 8 } else { meta.size.max(1).min(8) };
                    self.stack.check(addr, width)?;
                    let value = self.read(src)?;
                    unsafe { store(addr, value, width) };
                }
                Opcode::StackAlloc => {
                    let slot = operand(inst, 0)?;
                    let size = inst.imm.map(|i| i.as_u64()).unwrap_or(8).max(1);
                    let ValueKind::Stack(id) = slot.kind else {
                        return Err(RuntimeError::InvalidOpcode("stack_alloc needs a slot operand".into()));
                    };
                    self.regs.sp = align8(self.regs.sp);
                    self.stack.check_alloc(self.regs.sp, size)?;
                    let addr = self.regs.sp;
                    self.regs.sp += size;
                    self.frames.last_mut().expect("frame").slots.insert(id, addr);
                }
                Opcode::StackFree => {
                    let slot = operand(inst, 0)?;
                    if let ValueKind::Stack(id) = slot.kind {
                        self.frames.last_mut().expect("frame").slots.remove(&id);
                    }
                }
                Opcode::ModuleData => {
                    let dst = operand(inst, 0)?;
                    let Some(Immediate::ModuleData(data_mod, slot)) = inst.imm else {
                        return Err(RuntimeError::InvalidOpcode("module_data needs a data immediate".into()));
                    };
                    let m = ctx
                        .module(data_mod)
                        .ok_or(RuntimeError::InvalidModule(data_mod.0))?;
                    let addr = m
                        .data
                        .get(slot as usize)
                        .ok_or_else(|| RuntimeError::InvalidOpcode(format!("module data slot {}", slot)))?
                        .address();
                    self.write(dst, addr)?;
                }

                Opcode::Branch => {
                    let cond = self.read(operand(inst, 0)?)?;
                    let label = inst
                        .label()
                        .ok_or_else(|| RuntimeError::InvalidOpcode("branch without label".into()))?;
                    if cond == 0 {
                        self.regs.ip = self.label_offset(ctx, mid, label)?;
                        continue;
                    }
                }
                Opcode::Jump => {
                    let label = inst
                        .label()
                        .ok_or_else(|| RuntimeError::InvalidOpcode("jump without label".into()))?;
                    self.regs.ip = self.label_offset(ctx, mid, label)?;
                    continue;
                }
                Opcode::Ret => {
                    let value = match inst.operand(0) {
                        Some(v) => Some(self.read(v)?),
                        None => None,
                    };
                    if let Some(out) = self.do_ret(value, return_depth)? {
                        return Ok(out);
                    }
                    continue;
                }

                Opcode::Param => {
                    let v = self.read(operand(inst, 0)?)?;
                    self.params.push(v);
                }
                Opcode::Call => {
                    self.do_call(ctx, inst.clone())?;
                    continue;
                }

                Opcode::Assign => {
                    let dst = operand(inst, 0)?;
                    let v = self.read(operand(inst, 1)?)?;
                    self.write(dst, v)?;
                }
                Opcode::Cvt => {
                    let dst = operand(inst, 0)?;
                    let src = operand(inst, 1)?;
                    let raw = self.read(src)?;
                    let from = meta_of(ctx, src.type_id);
                    let Some(Immediate::Type(to_id)) = inst.imm else {
                        return Err(RuntimeError::InvalidOpcode("cvt without target type".into()));
                    };
                    let to = meta_of(ctx, to_id);
                    let out = cvt(raw, &from, &to, ctx.types.is_equal(to_id, ctx.builtins.boolean));
                    self.write(dst, out)?;
                }

                _ => {
                    self.do_alu(ctx, inst)?;
                }
            }

            self.regs.ip += 1;
        }
    }

    /// Pop a frame; `Some(value)` means the host-level call at
    /// `return_depth` finished.
    fn do_ret(&mut self, value: Option<u64>, return_depth: usize) -> Result<Option<u64>, RuntimeError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::InvalidOpcode("return without a frame".into()))?;

        for (i, v) in frame.caller_saved.iter().enumerate() {
            self.regs.gp[i] = *v;
        }
        self.regs.sp = frame.sp_mark;

        if frame.ret_ip == HOST_SENTINEL {
            if self.frames.len() + 1 != return_depth {
                // a sentinel belonging to an outer call surfaced early
                return Err(RuntimeError::InvalidOpcode("unbalanced call frames".into()));
            }
            return Ok(Some(value.unwrap_or(0)));
        }

        self.regs.ip = frame.ret_ip;
        if let Some(dest) = frame.dest {
            if !matches!(dest.kind, ValueKind::Stack(_)) {
                // stack destinations were filled through the return pointer
                self.write(&dest, value.unwrap_or(0))?;
            }
        }
        Ok(None)
    }

    fn do_call(&mut self, ctx: &ExecutionContext, inst: nox_core::ir::Instruction) -> Result<(), RuntimeError> {
        let callee_v = operand(&inst, 0)?;
        let dest = inst
            .operand(1)
            .filter(|d| !d.is_poison())
            .cloned();
        let this_op = inst.operand(2).filter(|t| !t.is_poison()).cloned();

        let (target, closure_this, closure_cap) = match callee_v.function_id() {
            Some(f) => (f, None, 0u64),
            None => {
                let addr = self.read(callee_v)?;
                let c = unsafe { Closure::borrow_raw(addr) }.ok_or(RuntimeError::NullCallback)?;
                (c.target, if c.this_ptr != 0 { Some(c.this_ptr) } else { None }, c.capture)
            }
        };

        let desc = ctx
            .funcs
            .get(target)
            .ok_or_else(|| RuntimeError::InvalidOpcode(format!("call to unknown function {}", target.0)))?;
        let sig = signature_of(ctx, desc.signature)?;

        let this_val = match &this_op {
            Some(t) => Some(self.read(t)?),
            None => closure_this,
        };
        let ret_addr = if sig.returns_on_stack {
            match &dest {
                Some(d) => self.read(d)?,
                None => 0,
            }
        } else {
            0
        };

        let explicit_count = sig.explicit_count();
        if self.params.len() < explicit_count {
            return Err(RuntimeError::InvalidOpcode("missing call parameters".into()));
        }
        let explicit: Vec<u64> = self.params.drain(self.params.len() - explicit_count..).collect();

        match desc.entry {
            FunctionEntry::Host(w) => {
                let binding = unsafe { &*(w.binding as *const HostBinding) };
                let mut out = 0u64;
                unsafe {
                    if sig.returns_on_stack {
                        binding.call(
                            ctx as *const _,
                            this_val.unwrap_or(0),
                            ret_addr,
                            closure_cap,
                            &explicit,
                            std::ptr::null_mut(),
                        );
                    } else {
                        binding.call(
                            ctx as *const _,
                            this_val.unwrap_or(0),
                            0,
                            closure_cap,
                            &explicit,
                            &mut out,
                        );
                    }
                }
                if let Some(d) = &dest {
                    if !sig.returns_on_stack {
                        self.write(d, out)?;
                    }
                }
                self.regs.ip += 1;
                Ok(())
            }
            FunctionEntry::Script { module, offset } => {
                let window = sig.args.len() + desc.vreg_count as usize;
                if window > GP_COUNT {
                    return Err(RuntimeError::InvalidOpcode("register window exceeded".into()));
                }

                let cur_window = self.cur().window;
                let saved: Vec<u64> = self.regs.gp[..cur_window].to_vec();

                let mut slots = Vec::with_capacity(sig.args.len());
                let mut next = 0usize;
                for a in &sig.args {
                    slots.push(match a.kind {
                        ArgKind::ContextPtr => ctx as *const ExecutionContext as u64,
                        ArgKind::ThisPtr => this_val.unwrap_or(0),
                        ArgKind::RetPtr => ret_addr,
                        ArgKind::CaptureDataPtr => closure_cap,
                        ArgKind::FuncPtr => 0,
                        ArgKind::Explicit => {
                            let v = explicit[next];
                            next += 1;
                            v
                        }
                    });
                }

                self.frames.push(Frame {
                    module,
                    arg_count: sig.args.len(),
                    window,
                    caller_saved: saved,
                    ret_ip: self.regs.ip + 1,
                    dest,
                    sp_mark: self.regs.sp,
                    slots: FxHashMap::default(),
                });
                for (i, v) in slots.iter().enumerate() {
                    self.regs.gp[i] = *v;
                }
                for r in slots.len()..window {
                    self.regs.gp[r] = 0;
                }
                self.regs.ip = offset as u64;
                Ok(())
            }
            FunctionEntry::Native { addr } => {
                let slots = self.native_slots(ctx, &sig, &explicit, this_val, closure_cap)?;
                let out = unsafe { call_native_entry(ctx, addr, &sig, &slots)? };
                if let Some(d) = &dest {
                    if !sig.returns_on_stack {
                        self.write(d, out)?;
                    }
                }
                self.regs.ip += 1;
                Ok(())
            }
            FunctionEntry::None => Err(RuntimeError::InvalidOpcode(format!(
                "function {} has no executable entry",
                target.0
            ))),
        }
    }

    /// Arithmetic, comparison, logical and increment forms.
    fn do_alu(&mut self, ctx: &ExecutionContext, inst: &nox_core::ir::Instruction) -> Result<(), RuntimeError> {
        use Opcode::*;

        let dst = operand(inst, 0)?;
        let a_op = operand(inst, 1)?;
        let a = self.read(a_op)?;
        let meta = meta_of(ctx, a_op.type_id);
        let w = meta.size.max(1).min(8);

        // unary forms
        match inst.op {
            INeg => return self.write(dst, canon_i((a as i64).wrapping_neg(), w)),
            FNeg => return self.write(dst, fbits(-f32_of(a))),
            DNeg => return self.write(dst, dbits(-f64_of(a))),
            IInc => return self.write(dst, canon_i((a as i64).wrapping_add(1), w)),
            IDec => return self.write(dst, canon_i((a as i64).wrapping_sub(1), w)),
            UInc => return self.write(dst, canon_u(a.wrapping_add(1), w)),
            UDec => return self.write(dst, canon_u(a.wrapping_sub(1), w)),
            FInc => return self.write(dst, fbits(f32_of(a) + 1.0)),
            FDec => return self.write(dst, fbits(f32_of(a) - 1.0)),
            DInc => return self.write(dst, dbits(f64_of(a) + 1.0)),
            DDec => return self.write(dst, dbits(f64_of(a) - 1.0)),
            Not => return self.write(dst, !truthy(a, &meta) as u64),
            Inv => return self.write(dst, canon_u(!a, w)),
            _ => {}
        }

        let b_op = operand(inst, 2)?;
        let b = self.read(b_op)?;
        let (ia, ib) = (a as i64, b as i64);
        // shift amounts mask to the operand width, as the hardware does
        let sh = (b & (w as u64 * 8 - 1)) as u32;

        let out: u64 = match inst.op {
            IAdd => canon_i(ia.wrapping_add(ib), w),
            ISub => canon_i(ia.wrapping_sub(ib), w),
            IMul => canon_i(ia.wrapping_mul(ib), w),
            IDiv => {
                if ib == 0 {
                    return Err(RuntimeError::DivideByZero);
                }
                canon_i(ia.wrapping_div(ib), w)
            }
            IMod => {
                if ib == 0 {
                    return Err(RuntimeError::DivideByZero);
                }
                canon_i(ia.wrapping_rem(ib), w)
            }
            UAdd => canon_u(a.wrapping_add(b), w),
            USub => canon_u(a.wrapping_sub(b), w),
            UMul => canon_u(a.wrapping_mul(b), w),
            UDiv => {
                if b == 0 {
                    return Err(RuntimeError::DivideByZero);
                }
                canon_u(a / b, w)
            }
            UMod => {
                if b == 0 {
                    return Err(RuntimeError::DivideByZero);
                }
                canon_u(a % b, w)
            }
            FAdd => fbits(f32_of(a) + f32_of(b)),
            FSub => fbits(f32_of(a) - f32_of(b)),
            FMul => fbits(f32_of(a) * f32_of(b)),
            FDiv => fbits(f32_of(a) / f32_of(b)),
            FMod => fbits(f32_of(a) % f32_of(b)),
            DAdd => dbits(f64_of(a) + f64_of(b)),
            DSub => dbits(f64_of(a) - f64_of(b)),
            DMul => dbits(f64_of(a) * f64_of(b)),
            DDiv => dbits(f64_of(a) / f64_of(b)),
            DMod => dbits(f64_of(a) % f64_of(b)),

            Band => canon_u(a & b, w),
            Bor => canon_u(a | b, w),
            Bxor => canon_u(a ^ b, w),
            Shl => match ScalarCategory::of(&meta) {
                ScalarCategory::Signed => canon_i(ia.wrapping_shl(sh), w),
                _ => canon_u(a.wrapping_shl(sh), w),
            },
            Shr => match ScalarCategory::of(&meta) {
                ScalarCategory::Signed => canon_i(ia.wrapping_shr(sh), w),
                _ => canon_u(a.wrapping_shr(sh), w),
            },
            Land => {
                let mb = meta_of(ctx, b_op.type_id);
                (truthy(a, &meta) && truthy(b, &mb)) as u64
            }
            Lor => {
                let mb = meta_of(ctx, b_op.type_id);
                (truthy(a, &meta) || truthy(b, &mb)) as u64
            }

            IEq => (ia == ib) as u64,
            INeq => (ia != ib) as u64,
            ILt => (ia < ib) as u64,
            IGt => (ia > ib) as u64,
            ILte => (ia <= ib) as u64,
            IGte => (ia >= ib) as u64,
            UEq => (a == b) as u64,
            UNeq => (a != b) as u64,
            ULt => (a < b) as u64,
            UGt => (a > b) as u64,
            ULte => (a <= b) as u64,
            UGte => (a >= b) as u64,
            FEq => (f32_of(a) == f32_of(b)) as u64,
            FNeq => (f32_of(a) != f32_of(b)) as u64,
            FLt => (f32_of(a) < f32_of(b)) as u64,
            FGt => (f32_of(a) > f32_of(b)) as u64,
            FLte => (f32_of(a) <= f32_of(b)) as u64,
            FGte => (f32_of(a) >= f32_of(b)) as u64,
            DEq => (f64_of(a) == f64_of(b)) as u64,
            DNeq => (f64_of(a) != f64_of(b)) as u64,
            DLt => (f64_of(a) < f64_of(b)) as u64,
            DGt => (f64_of(a) > f64_of(b)) as u64,
            DLte => (f64_of(a) <= f64_of(b)) as u64,
            DGte => (f64_of(a) >= f64_of(b)) as u64,

            other => {
                return Err(RuntimeError::InvalidOpcode(format!("{:?}", other)));
            }
        };
        self.write(dst, out)
    }
}

// ---- helpers ---------------------------------------------------------------

fn operand<'a>(inst: &'a nox_core::ir::Instruction, i: usize) -> Result<&'a Value, RuntimeError> {
    inst.operand(i)
        .ok_or_else(|| RuntimeError::InvalidOpcode(format!("{:?} is missing operand {}", inst.op, i)))
}

fn signature_of(ctx: &ExecutionContext, sig_ty: TypeId) -> Result<Signature, RuntimeError> {
    ctx.types
        .effective_desc(sig_ty)
        .and_then(|d| d.signature().cloned())
        .ok_or_else(|| RuntimeError::InvalidOpcode("callee has no signature".into()))
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

fn type_size(ctx: &ExecutionContext, ty: TypeId) -> u32 {
    meta_of(ctx, ty).size
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

/// Truthiness of a raw cell per its scalar category.
fn truthy(raw: u64, meta: &TypeMeta) -> bool {
    match ScalarCategory::of(meta) {
        ScalarCategory::F32 => f32_of(raw) != 0.0,
        ScalarCategory::F64 => f64_of(raw) != 0.0,
        _ => raw != 0,
    }
}

fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

fn f64_of(bits: u64) -> f64 {
    f64::from_bits(bits)
}

fn fbits(v: f32) -> u64 {
    v.to_bits() as u64
}

fn dbits(v: f64) -> u64 {
    v.to_bits()
}

/// Re-extend a raw 64-bit cell to the canonical form of its type.
fn canon(raw: u64, meta: &TypeMeta) -> u64 {
    if meta.is_floating_point {
        return raw;
    }
    let w = meta.size.max(1).min(8);
    if meta.is_unsigned || !meta.is_integral {
        canon_u(raw, w)
    } else {
        canon_i(raw as i64, w)
    }
}

fn canon_i(v: i64, width: u32) -> u64 {
    (match width {
        1 => v as i8 as i64,
        2 => v as i16 as i64,
        4 => v as i32 as i64,
        _ => v,
    }) as u64
}

fn canon_u(v: u64, width: u32) -> u64 {
    match width {
        1 => v as u8 as u64,
        2 => v as u16 as u64,
        4 => v as u32 as u64,
        _ => v,
    }
}

/// Runtime scalar conversion; mirrors the compile-time immediate rules.
fn cvt(raw: u64, from: &TypeMeta, to: &TypeMeta, to_bool: bool) -> u64 {
    let fcat = ScalarCategory::of(from);
    if to_bool {
        return match fcat {
            ScalarCategory::F32 => (f32_of(raw) != 0.0) as u64,
            ScalarCategory::F64 => (f64_of(raw) != 0.0) as u64,
            _ => (raw != 0) as u64,
        };
    }
    let tw = to.size.max(1).min(8);
    match (fcat, ScalarCategory::of(to)) {
        (ScalarCategory::Signed, ScalarCategory::Signed) => canon_i(raw as i64, tw),
        (ScalarCategory::Signed, ScalarCategory::Unsigned) => canon_u(raw, tw),
        (ScalarCategory::Signed, ScalarCategory::F32) => fbits(raw as i64 as f32),
        (ScalarCategory::Signed, ScalarCategory::F64) => dbits(raw as i64 as f64),
        (ScalarCategory::Unsigned, ScalarCategory::Signed) => canon_i(raw as i64, tw),
        (ScalarCategory::Unsigned, ScalarCategory::Unsigned) => canon_u(raw, tw),
        (ScalarCategory::Unsigned, ScalarCategory::F32) => fbits(raw as f32),
        (ScalarCategory::Unsigned, ScalarCategory::F64) => dbits(raw as f64),
        (ScalarCategory::F32, ScalarCategory::Signed) => match tw {
            1 => canon_i(f32_of(raw) as i8 as i64, tw),
            2 => canon_i(f32_of(raw) as i16 as i64, tw),
            4 => canon_i(f32_of(raw) as i32 as i64, tw),
            _ => f32_of(raw) as i64 as u64,
        },
        (ScalarCategory::F32, ScalarCategory::Unsigned) => match tw {
            1 => f32_of(raw) as u8 as u64,
            2 => f32_of(raw) as u16 as u64,
            4 => f32_of(raw) as u32 as u64,
            _ => f32_of(raw) as u64,
        },
        (ScalarCategory::F32, ScalarCategory::F32) => raw,
        (ScalarCategory::F32, ScalarCategory::F64) => dbits(f32_of(raw) as f64),
        (ScalarCategory::F64, ScalarCategory::Signed) => match tw {
            1 => canon_i(f64_of(raw) as i8 as i64, tw),
            2 => canon_i(f64_of(raw) as i16 as i64, tw),
            4 => canon_i(f64_of(raw) as i32 as i64, tw),
            _ => f64_of(raw) as i64 as u64,
        },
        (ScalarCategory::F64, ScalarCategory::Unsigned) => match tw {
            1 => f64_of(raw) as u8 as u64,
            2 => f64_of(raw) as u16 as u64,
            4 => f64_of(raw) as u32 as u64,
            _ => f64_of(raw) as u64,
        },
        (ScalarCategory::F64, ScalarCategory::F32) => fbits(f64_of(raw) as f32),
        (ScalarCategory::F64, ScalarCategory::F64) => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_forms() {
        assert_eq!(canon_i(-1, 4), 0xffff_ffff_ffff_ffff);
        assert_eq!(canon_u(u64::MAX, 4), 0xffff_ffff);
        assert_eq!(canon_i(0x1_0000_0001, 4), 1);
    }

    #[test]
    fn test_cvt_unsigned_to_double() {
        let from = TypeMeta::primitive(8, false, true, true);
        let to = TypeMeta::primitive(8, true, false, false);
        let out = cvt(u64::MAX, &from, &to, false);
        assert_eq!(f64_of(out), 1.8446744073709552e19);
    }

    #[test]
    fn test_cvt_double_to_signed_saturates() {
        let from = TypeMeta::primitive(8, true, false, false);
        let to = TypeMeta::primitive(8, false, true, false);
        let out = cvt(dbits(1e300), &from, &to, false);
        assert_eq!(out as i64, i64::MAX);
        let out = cvt(dbits(f64::NAN), &from, &to, false);
        assert_eq!(out as i64, 0);
    }

    #[test]
    fn test_cvt_round_trip_53_bits() {
        let i_meta = TypeMeta::primitive(8, false, true, false);
        let d_meta = TypeMeta::primitive(8, true, false, false);
        for v in [0i64, 1, -1, (1 << 53) - 1, -(1 << 53) + 1] {
            let d = cvt(v as u64, &i_meta, &d_meta, false);
            let back = cvt(d, &d_meta, &i_meta, false);
            assert_eq!(back as i64, v);
        }
    }
}
