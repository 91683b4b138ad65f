//! Call generation.
//!
//! Produces the instruction sequence for a call: explicit arguments are
//! converted and passed via `Param`, the call instruction carries the
//! callee, the destination and the `this` value, and implicit arguments
//! (context, return slot, closure captures) materialize at the call
//! boundary inside the back-ends, never through `Param`.

use nox_core::error::ErrorKind;
use nox_core::functions::{ArgKind, FunctionId, Signature};
use nox_core::ir::{Immediate, Opcode, Value};
use nox_core::matching::{MatchFlags, MatchResult, function_match};
use nox_core::types::{TypeId, TypeKind};

use crate::lower::Compiler;

impl<'ctx> Compiler<'ctx> {
    fn signature_of_fn(&self, callee: FunctionId) -> Option<(Signature, TypeId)> {
        let desc = self.ctx.funcs.get(callee)?;
        let sig_ty = desc.signature;
        match &self.ctx.types.effective_desc(sig_ty)?.kind {
            TypeKind::Function(sig) => Some((sig.clone(), sig_ty)),
            _ => None,
        }
    }

    /// Emit a call to a known function.
    pub fn gen_call(&mut self, callee: FunctionId, args: &[Value], self_v: Option<&Value>) -> Value {
        let Some((sig, sig_ty)) = self.signature_of_fn(callee) else {
            return self.err(ErrorKind::MethodNotFound, "callee has no registered signature");
        };
        let callee_v = Value::imm(Immediate::Func(callee), sig_ty);
        self.emit_call(callee_v, &sig, args, self_v)
    }

    /// Emit an indirect call through a closure-like value whose type is a
    /// function signature.
    pub fn gen_call_value(&mut self, callee: &Value, args: &[Value]) -> Value {
        if callee.is_poison() {
            return Value::poison();
        }
        // a bound method reference carries its instance along
        if let Some(f) = callee.function_id() {
            let self_v = callee.src_self.as_deref().cloned();
            return self.gen_call(f, args, self_v.as_ref());
        }
        let Some(desc) = self.ctx.types.effective_desc(callee.type_id) else {
            return self.err(ErrorKind::MethodNotFound, "callee type is not registered");
        };
        let sig = match &desc.kind {
            TypeKind::Function(sig) => sig.clone(),
            _ => {
                // fall back to `operator ()` on the object
                return self.call_operator(callee, args);
            }
        };
        self.emit_call(callee.detached(), &sig, args, None)
    }

    fn call_operator(&mut self, obj: &Value, args: &[Value]) -> Value {
        let methods = self
            .ctx
            .types
            .effective_desc(obj.type_id)
            .map(|d| d.methods.clone())
            .unwrap_or_default();
        let arg_types: Vec<TypeId> = args.iter().map(|a| a.type_id).collect();
        let got = function_match(
            "operator ()",
            None,
            &arg_types,
            &methods,
            MatchFlags { skip_implicit_args: true, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => self.gen_call(m, args, Some(obj)),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(ErrorKind::AmbiguousMethod, "call operator is ambiguous");
                self.note_candidates(&cands);
                out
            }
            MatchResult::NotFound => self.err(ErrorKind::MethodNotFound, "value is not callable"),
        }
    }

    fn emit_call(
        &mut self,
        callee: Value,
        sig: &Signature,
        args: &[Value],
        self_v: Option<&Value>,
    ) -> Value {
        let declared: Vec<TypeId> = sig.explicit_args().map(|a| a.type_id).collect();
        if declared.len() != args.len() {
            return self.err(
                ErrorKind::MethodNotFound,
                format!("call supplies {} arguments, callee takes {}", args.len(), declared.len()),
            );
        }

        let mut converted = Vec::with_capacity(args.len());
        for (arg, &want) in args.iter().zip(&declared) {
            let mut c = self.convert(arg, want);
            if c.is_poison() {
                return c;
            }
            let want_meta = self
                .ctx
                .types
                .effective_desc(want)
                .map(|d| d.meta)
                .unwrap_or_default();
            if !want_meta.is_primitive && !c.flags.is_pointer {
                // objects travel by pointer; park the value in a slot and
                // pass the slot's address
                let size = self.ctx.size_of(want).max(8);
                let slot = self.fd_mut().stack(want, size);
                self.fd_mut().add(Opcode::Store).op(c.detached()).op(slot.detached());
                c = slot;
            }
            converted.push(c);
        }

        for c in &converted {
            self.fd_mut().add(Opcode::Param).op(c.detached());
        }

        let needs_this = sig.args.iter().any(|a| a.kind == ArgKind::ThisPtr);
        let this_v = if needs_this {
            match self_v {
                Some(v) => Some(v.detached()),
                None => {
                    return self.err(
                        ErrorKind::InstanceMethodOnType,
                        "method call is missing its instance",
                    );
                }
            }
        } else {
            None
        };

        // the destination doubles as the hidden return slot for values that
        // come back on the stack
        let dest = if sig.returns_on_stack {
            let size = self.ctx.size_of(sig.ret).max(8);
            Some(self.fd_mut().stack(sig.ret, size))
        } else if !self.is_void(sig.ret) {
            Some(self.fd_mut().val(sig.ret))
        } else {
            None
        };

        let mut emit = self.fd_mut().add(Opcode::Call).op(callee);
        if let Some(d) = &dest {
            emit = emit.op(d.detached());
        } else if this_v.is_some() {
            // keep the operand layout fixed: callee, dest, this
            emit = emit.op(Value::poison());
        }
        if let Some(t) = this_v {
            emit = emit.op(t);
        }
        let _ = emit;

        dest.unwrap_or_else(|| Value::imm(Immediate::U(0), self.void_type()))
    }

    /// Allocate a slot for a new object and run the matching constructor.
    pub fn construct_object(&mut self, ty: TypeId, args: &[Value]) -> Value {
        let Some(desc) = self.ctx.types.effective_desc(ty) else {
            return self.err(ErrorKind::TypeNotFound, "cannot construct an unregistered type");
        };
        let methods = desc.methods.clone();
        let trivially_constructible = desc.meta.is_trivially_constructible;
        let size = desc.meta.size.max(1);

        let arg_types: Vec<TypeId> = args.iter().map(|a| a.type_id).collect();
        let got = function_match(
            "constructor",
            None,
            &arg_types,
            &methods,
            MatchFlags { skip_implicit_args: true, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(ctor) => {
                let slot = self.fd_mut().stack(ty, size);
                self.gen_call(ctor, args, Some(&slot));
                slot
            }
            MatchResult::NotFound if args.is_empty() && trivially_constructible => {
                self.fd_mut().stack(ty, size)
            }
            MatchResult::NotFound => self.err(
                ErrorKind::MethodNotFound,
                "no constructor matches these arguments",
            ),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(
                    ErrorKind::AmbiguousConstructor,
                    "construction with these arguments is ambiguous",
                );
                self.note_candidates(&cands);
                out
            }
        }
    }
}
