//! Per-function compile state and the IR builder.
//!
//! A [`FunctionDef`] owns everything the compiler accumulates for one
//! function: the signature, the argument values (implicit ones included),
//! the instruction buffer, the label table, allocation counters for virtual
//! registers and stack slots, and the source span the parser most recently
//! advanced to. Every emitted instruction copies that span into the
//! function's source map.

use rustc_hash::FxHashMap;

use nox_core::functions::{ArgKind, FunctionId, FunctionRegistry, FunctionEntry};
use nox_core::ir::{Immediate, Instruction, LabelId, Opcode, Value, ValueKind};
use nox_core::module::Module;
use nox_core::span::{SourceMap, SrcSpan};
use nox_core::types::{TypeId, TypeRegistry, TypeKind};

/// Compile-time state of one function being built.
#[derive(Debug)]
pub struct FunctionDef {
    pub id: FunctionId,
    pub signature: TypeId,
    /// Argument values in signature order; index `i` is `Arg(i)`.
    pub args: Vec<Value>,
    pub code: Vec<Instruction>,
    pub map: SourceMap,
    /// Size of each stack slot this function allocated.
    pub stack_sizes: FxHashMap<u32, u32>,
    next_reg: u32,
    next_stack: u32,
    next_label: u32,
    cur_span: SrcSpan,
}

impl FunctionDef {
    /// Build the definition, materializing one argument value per signature
    /// slot. Implicit arguments are pointers and read-only.
    pub fn new(id: FunctionId, signature: TypeId, types: &TypeRegistry) -> Self {
        let mut args = Vec::new();
        if let Some(desc) = types.effective_desc(signature) {
            if let TypeKind::Function(sig) = &desc.kind {
                for (i, a) in sig.args.iter().enumerate() {
                    let mut v = Value::arg(i as u16, a.type_id);
                    match a.kind {
                        ArgKind::Explicit => {}
                        ArgKind::ThisPtr | ArgKind::RetPtr => {
                            v.flags.is_pointer = true;
                        }
                        _ => {
                            v.flags.is_pointer = true;
                            v.flags.is_read_only = true;
                        }
                    }
                    args.push(v);
                }
            }
        }
        FunctionDef {
            id,
            signature,
            args,
            code: Vec::new(),
            map: SourceMap::new(),
            stack_sizes: FxHashMap::default(),
            next_reg: 0,
            next_stack: 0,
            next_label: 0,
            cur_span: SrcSpan::synthetic(),
        }
    }

    /// A fresh virtual register of the given type.
    pub fn val(&mut self, ty: TypeId) -> Value {
        let id = self.next_reg;
        self.next_reg += 1;
        Value::reg(id, ty)
    }

    /// Reserve a stack slot and emit its allocation. The returned value is
    /// the slot's address.
    pub fn stack(&mut self, ty: TypeId, size: u32) -> Value {
        let id = self.next_stack;
        self.next_stack += 1;
        self.stack_sizes.insert(id, size);
        let v = Value::stack(id, ty);
        self.add(Opcode::StackAlloc).op(v.clone()).imm(Immediate::U(size as u64));
        v
    }

    /// Release a stack slot.
    pub fn free(&mut self, slot: &Value) {
        if matches!(slot.kind, ValueKind::Stack(_)) {
            self.add(Opcode::StackFree).op(slot.detached());
        }
    }

    pub fn imm_i(&mut self, v: i64, ty: TypeId) -> Value {
        Value::imm(Immediate::I(v), ty)
    }

    pub fn imm_u(&mut self, v: u64, ty: TypeId) -> Value {
        Value::imm(Immediate::U(v), ty)
    }

    pub fn imm_f(&mut self, v: f32, ty: TypeId) -> Value {
        Value::imm(Immediate::F(v), ty)
    }

    pub fn imm_d(&mut self, v: f64, ty: TypeId) -> Value {
        Value::imm(Immediate::D(v), ty)
    }

    /// Reserve a label; it stays unbound until [`FunctionDef::bind_label`].
    pub fn label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Bind a reserved label to the current instruction offset.
    pub fn bind_label(&mut self, label: LabelId) {
        self.add(Opcode::Label).imm(Immediate::Label(label));
    }

    /// Append an instruction; chain `.op()`/`.imm()` on the result to fill
    /// in operands.
    pub fn add(&mut self, op: Opcode) -> Emit<'_> {
        self.code.push(Instruction::new(op));
        self.map.push(self.cur_span);
        Emit {
            inst: self.code.last_mut().expect("instruction was just pushed"),
            slot: 0,
        }
    }

    /// The typed sentinel every error path returns.
    pub fn poison(&self) -> Value {
        Value::poison()
    }

    pub fn set_span(&mut self, span: SrcSpan) {
        self.cur_span = span;
    }

    pub fn span(&self) -> SrcSpan {
        self.cur_span
    }

    pub fn vreg_count(&self) -> u32 {
        self.next_reg
    }

    /// The argument value for an implicit kind, if the signature has one.
    pub fn implicit_arg(&self, kind: ArgKind, types: &TypeRegistry) -> Option<Value> {
        let desc = types.effective_desc(self.signature)?;
        let sig = match &desc.kind {
            TypeKind::Function(s) => s,
            _ => return None,
        };
        sig.arg_index(kind).map(|i| self.args[i].clone())
    }

    /// Commit the finished IR to the module and install the function's
    /// entry offset. Labels are renumbered into the module's id space so
    /// they stay unique across the shared buffer. Returns the offset.
    pub fn commit(mut self, module: &mut Module, funcs: &mut FunctionRegistry) -> u32 {
        let base = module.next_label;
        if base > 0 {
            for inst in self.code.iter_mut() {
                if let Some(Immediate::Label(l)) = inst.imm {
                    inst.imm = Some(Immediate::Label(LabelId(l.0 + base)));
                }
            }
        }
        module.next_label = base + self.next_label;

        let offset = module.code.len() as u32;
        module.code.extend(self.code);
        module.map.extend(&self.map);
        module.functions.push(self.id);
        funcs.set_entry(self.id, FunctionEntry::Script { module: module.id, offset });
        if let Some(d) = funcs.get_mut(self.id) {
            d.vreg_count = self.next_reg;
        }
        offset
    }
}

/// Chained operand writer returned by [`FunctionDef::add`].
pub struct Emit<'a> {
    inst: &'a mut Instruction,
    slot: usize,
}

impl<'a> Emit<'a> {
    pub fn op(mut self, v: Value) -> Self {
        debug_assert!(self.slot < 3, "an instruction takes at most three operands");
        if self.slot < 3 {
            self.inst.operands[self.slot] = Some(v);
            self.slot += 1;
        }
        self
    }

    pub fn imm(self, imm: Immediate) -> Self {
        self.inst.imm = Some(imm);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nox_core::context::ExecutionContext;
    use nox_core::functions::{FunctionFlags, Signature, SigArg, register_signature};
    use nox_core::types::Access;

    fn sample_fd(ctx: &mut ExecutionContext) -> FunctionDef {
        let sig = register_signature(
            &mut ctx.types,
            &ctx.funcs,
            Signature {
                ret: ctx.builtins.i32,
                args: vec![
                    SigArg { kind: ArgKind::ContextPtr, type_id: ctx.builtins.ptr },
                    SigArg { kind: ArgKind::Explicit, type_id: ctx.builtins.i32 },
                ],
                returns_on_stack: false,
            },
        )
        .unwrap();
        let id = ctx.funcs.register("t", sig, FunctionFlags::default(), Access::Public, None, None);
        FunctionDef::new(id, sig, &ctx.types)
    }

    #[test]
    fn test_arguments_materialized() {
        let mut ctx = ExecutionContext::new();
        let fd = sample_fd(&mut ctx);
        assert_eq!(fd.args.len(), 2);
        assert!(fd.args[0].flags.is_read_only);
        assert!(!fd.args[1].flags.is_read_only);
        assert!(fd.implicit_arg(ArgKind::ContextPtr, &ctx.types).is_some());
    }

    #[test]
    fn test_emit_chain() {
        let mut ctx = ExecutionContext::new();
        let mut fd = sample_fd(&mut ctx);
        let a = fd.val(ctx.builtins.i32);
        let arg = fd.args[1].clone();
        let b = fd.imm_i(2, ctx.builtins.i32);
        fd.add(Opcode::IAdd).op(a.clone()).op(arg).op(b);
        assert_eq!(fd.code.len(), 1);
        assert_eq!(fd.code[0].op, Opcode::IAdd);
        assert!(fd.code[0].operands[2].is_some());
        assert_eq!(fd.vreg_count(), 1);
    }

    #[test]
    fn test_stack_slot_records_size() {
        let mut ctx = ExecutionContext::new();
        let mut fd = sample_fd(&mut ctx);
        let s = fd.stack(ctx.builtins.i64, 8);
        assert!(s.flags.is_pointer);
        assert_eq!(fd.stack_sizes.get(&0), Some(&8));
        assert_eq!(fd.code[0].op, Opcode::StackAlloc);
    }

    #[test]
    fn test_labels_monotonic() {
        let mut ctx = ExecutionContext::new();
        let mut fd = sample_fd(&mut ctx);
        let l0 = fd.label();
        let l1 = fd.label();
        assert_ne!(l0, l1);
        fd.bind_label(l1);
        assert_eq!(fd.code[0].label(), Some(l1));
    }
}
