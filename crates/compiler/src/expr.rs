//! Operator and conversion semantics over compile-time values.
//!
//! Each operation here is a contract: it emits the instruction sequence
//! that performs the operation and returns the value describing the result.
//! Errors log a diagnostic and return poison; poison operands are passed
//! through silently so one bad expression does not cascade.

use nox_core::ast::{BinaryOp, UnaryOp};
use nox_core::error::ErrorKind;
use nox_core::ir::{Immediate, Opcode, ScalarCategory, Value, ValueKind};
use nox_core::matching::{MatchFlags, MatchResult, function_match};
use nox_core::types::{Access, Property, TypeId, TypeMeta};

use crate::lower::Compiler;

/// Pick the arithmetic/comparison opcode for a primitive operation.
fn select_opcode(op: BinaryOp, cat: ScalarCategory) -> Option<Opcode> {
    use BinaryOp::*;
    use Opcode::*;
    use ScalarCategory as C;
    let table = |i: Opcode, u: Opcode, f: Opcode, d: Opcode| match cat {
        C::Signed => i,
        C::Unsigned => u,
        C::F32 => f,
        C::F64 => d,
    };
    Some(match op {
        Add | AddAssign => table(IAdd, UAdd, FAdd, DAdd),
        Sub | SubAssign => table(ISub, USub, FSub, DSub),
        Mul | MulAssign => table(IMul, UMul, FMul, DMul),
        Div | DivAssign => table(IDiv, UDiv, FDiv, DDiv),
        Mod | ModAssign => table(IMod, UMod, FMod, DMod),
        Eq => table(IEq, UEq, FEq, DEq),
        Neq => table(INeq, UNeq, FNeq, DNeq),
        Lt => table(ILt, ULt, FLt, DLt),
        Gt => table(IGt, UGt, FGt, DGt),
        Lte => table(ILte, ULte, FLte, DLte),
        Gte => table(IGte, UGte, FGte, DGte),
        BinaryOp::Shl | ShlAssign if !cat.is_float() => Opcode::Shl,
        BinaryOp::Shr | ShrAssign if !cat.is_float() => Opcode::Shr,
        BitAnd | BitAndAssign if !cat.is_float() => Band,
        BitOr | BitOrAssign if !cat.is_float() => Bor,
        BitXor | BitXorAssign if !cat.is_float() => Bxor,
        LogicAnd => Land,
        LogicOr => Lor,
        _ => return None,
    })
}

fn base_of(op: BinaryOp) -> BinaryOp {
    use BinaryOp::*;
    match op {
        AddAssign => Add,
        SubAssign => Sub,
        MulAssign => Mul,
        DivAssign => Div,
        ModAssign => Mod,
        ShlAssign => Shl,
        ShrAssign => Shr,
        BitAndAssign => BitAnd,
        BitOrAssign => BitOr,
        BitXorAssign => BitXor,
        other => other,
    }
}

fn is_comparison(op: BinaryOp) -> bool {
    use BinaryOp::*;
    matches!(op, Eq | Neq | Lt | Gt | Lte | Gte | LogicAnd | LogicOr)
}

impl<'ctx> Compiler<'ctx> {
    /// Reject values that cannot appear where a datum is required.
    fn check_usable_as_value(&mut self, v: &Value) -> bool {
        if v.is_module_ref() {
            self.err(ErrorKind::ModuleUsedAsValue, "modules cannot be used as a value");
            return false;
        }
        if v.is_type_ref() {
            self.err(ErrorKind::TypeUsedAsValue, "types cannot be used as a value");
            return false;
        }
        if v.is_module_data() {
            self.err(ErrorKind::ModuleDataUsedAsValue, "module data references cannot be used as a value");
            return false;
        }
        true
    }

    fn meta_of(&self, ty: TypeId) -> TypeMeta {
        self.ctx
            .types
            .effective_desc(ty)
            .map(|d| d.meta)
            .unwrap_or_default()
    }

    fn is_void_ptr(&self, ty: TypeId) -> bool {
        self.ctx.types.is_equal(ty, self.ctx.builtins.ptr)
    }

    /// Load the datum a pointer value refers to.
    pub(crate) fn load_through(&mut self, v: &Value) -> Value {
        let out = self.fd_mut().val(v.type_id);
        self.fd_mut().add(Opcode::Load).op(out.clone()).op(v.detached());
        out
    }

    /// Write `value` back into the storage `target` describes: through the
    /// pointer it carries, through its source pointer, or via its setter.
    fn write_back(&mut self, target: &Value, value: &Value) {
        if target.flags.is_pointer && !self.is_void_ptr(target.type_id) {
            self.fd_mut().add(Opcode::Store).op(value.detached()).op(target.detached());
        } else if let Some(src_ptr) = target.src_ptr.as_deref() {
            let p = src_ptr.clone();
            self.fd_mut().add(Opcode::Store).op(value.detached()).op(p.detached());
        } else if let Some(setter) = target.src_setter {
            let self_v = target.src_self.as_deref().cloned();
            self.gen_call(setter, &[value.clone()], self_v.as_ref());
        } else {
            self.fd_mut().add(Opcode::Assign).op(target.detached()).op(value.detached());
        }
    }

    /// Binary operator semantics for both primitive and user-defined types.
    pub fn bin_op(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
        if lhs.is_poison() || rhs.is_poison() {
            return Value::poison();
        }
        if !self.check_usable_as_value(lhs) || !self.check_usable_as_value(rhs) {
            return Value::poison();
        }
        let assignment = op.is_assignment();
        if assignment && lhs.flags.is_read_only {
            return self.err(ErrorKind::NotWritable, "cannot write to read-only value");
        }

        let meta = self.meta_of(lhs.type_id);
        if !meta.is_primitive {
            return self.operator_method(op.method_name(), lhs, rhs);
        }

        // assignment proper: convert, store, and produce the stored value
        if op == BinaryOp::Assign {
            let stored = self.convert(rhs, lhs.type_id);
            if stored.is_poison() {
                return stored;
            }
            self.write_back(lhs, &stored);
            return stored;
        }

        let cat = ScalarCategory::of(&meta);
        let opcode = match select_opcode(base_of(op), cat) {
            Some(o) => o,
            None => {
                return self.err(
                    ErrorKind::InvalidOperand,
                    format!("operator '{}' is not defined for this type", op.method_name()),
                );
            }
        };

        let rhs_c = self.convert(rhs, lhs.type_id);
        if rhs_c.is_poison() {
            return rhs_c;
        }

        // pointers to primitives are loaded first; the raw pointer type is
        // arithmetic on the address itself
        let operand = if lhs.flags.is_pointer && !self.is_void_ptr(lhs.type_id) {
            self.load_through(lhs)
        } else {
            lhs.detached()
        };

        let result_ty = if is_comparison(op) { self.ctx.builtins.boolean } else { lhs.type_id };
        let out = self.fd_mut().val(result_ty);
        self.fd_mut()
            .add(opcode)
            .op(out.clone())
            .op(operand)
            .op(rhs_c);

        if assignment {
            self.write_back(lhs, &out);
        }
        out
    }

    /// Unary operator semantics.
    pub fn un_op(&mut self, op: UnaryOp, v: &Value) -> Value {
        if v.is_poison() {
            return Value::poison();
        }
        if !self.check_usable_as_value(v) {
            return Value::poison();
        }
        let writes = matches!(op, UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec);
        if writes && v.flags.is_read_only {
            return self.err(ErrorKind::NotWritable, "cannot write to read-only value");
        }

        let meta = self.meta_of(v.type_id);
        if !meta.is_primitive {
            return self.operator_method_unary(op.method_name(), v);
        }
        let cat = ScalarCategory::of(&meta);

        if op == UnaryOp::Deref {
            if !v.flags.is_pointer && !self.is_void_ptr(v.type_id) {
                return self.err(ErrorKind::InvalidOperand, "cannot dereference a non-pointer value");
            }
            let mut out = self.load_through(v);
            out.src_ptr = Some(Box::new(v.detached()));
            return out;
        }

        let operand = if v.flags.is_pointer { self.load_through(v) } else { v.detached() };

        let (opcode, result_ty) = match op {
            UnaryOp::Neg => {
                let oc = match cat {
                    ScalarCategory::Signed | ScalarCategory::Unsigned => Opcode::INeg,
                    ScalarCategory::F32 => Opcode::FNeg,
                    ScalarCategory::F64 => Opcode::DNeg,
                };
                (oc, v.type_id)
            }
            UnaryOp::Not => (Opcode::Not, self.ctx.builtins.boolean),
            UnaryOp::BitNot => {
                if cat.is_float() {
                    return self.err(ErrorKind::InvalidOperand, "operator '~' requires an integral type");
                }
                (Opcode::Inv, v.type_id)
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let inc = matches!(op, UnaryOp::PreInc | UnaryOp::PostInc);
                let oc = match (cat, inc) {
                    (ScalarCategory::Signed, true) => Opcode::IInc,
                    (ScalarCategory::Signed, false) => Opcode::IDec,
                    (ScalarCategory::Unsigned, true) => Opcode::UInc,
                    (ScalarCategory::Unsigned, false) => Opcode::UDec,
                    (ScalarCategory::F32, true) => Opcode::FInc,
                    (ScalarCategory::F32, false) => Opcode::FDec,
                    (ScalarCategory::F64, true) => Opcode::DInc,
                    (ScalarCategory::F64, false) => Opcode::DDec,
                };
                let post = matches!(op, UnaryOp::PostInc | UnaryOp::PostDec);
                let out = self.fd_mut().val(v.type_id);
                if post {
                    // post: keep the old value, then modify and write back
                    self.fd_mut().add(Opcode::Assign).op(out.clone()).op(operand.clone());
                    let bumped = self.fd_mut().val(v.type_id);
                    self.fd_mut().add(oc).op(bumped.clone()).op(operand);
                    self.write_back(v, &bumped);
                } else {
                    self.fd_mut().add(oc).op(out.clone()).op(operand);
                    self.write_back(v, &out);
                }
                return out;
            }
            UnaryOp::Deref => unreachable!("handled above"),
        };

        let out = self.fd_mut().val(result_ty);
        self.fd_mut().add(opcode).op(out.clone()).op(operand);
        out
    }

    fn operator_method(&mut self, name: &str, lhs: &Value, rhs: &Value) -> Value {
        let methods = match self.ctx.types.effective_desc(lhs.type_id) {
            Some(d) => d.methods.clone(),
            None => return self.err(ErrorKind::TypeNotFound, "operand type is not registered"),
        };
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(lhs.type_id));
        let got = function_match(
            name,
            None,
            &[rhs.type_id],
            &methods,
            MatchFlags { skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => self.gen_call(m, &[rhs.clone()], Some(lhs)),
            MatchResult::Ambiguous(cands) => {
                let v = self.err(
                    ErrorKind::AmbiguousMethod,
                    format!("reference to method '{}' is ambiguous", name),
                );
                self.note_candidates(&cands);
                v
            }
            MatchResult::NotFound => self.err(
                ErrorKind::MethodNotFound,
                format!("type has no method named '{}' matching these arguments", name),
            ),
        }
    }

    fn operator_method_unary(&mut self, name: &str, v: &Value) -> Value {
        let methods = match self.ctx.types.effective_desc(v.type_id) {
            Some(d) => d.methods.clone(),
            None => return self.err(ErrorKind::TypeNotFound, "operand type is not registered"),
        };
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(v.type_id));
        let got = function_match(
            name,
            None,
            &[],
            &methods,
            MatchFlags { skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => self.gen_call(m, &[], Some(v)),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(
                    ErrorKind::AmbiguousMethod,
                    format!("reference to method '{}' is ambiguous", name),
                );
                self.note_candidates(&cands);
                out
            }
            MatchResult::NotFound => self.err(
                ErrorKind::MethodNotFound,
                format!("type has no method named '{}'", name),
            ),
        }
    }

    /// Convert a value to another type, per the conversion ladder:
    /// identity, raw-pointer bit-cast (trusted only), primitive conversion,
    /// cast operator, single-argument constructor.
    pub fn convert(&mut self, v: &Value, to: TypeId) -> Value {
        if v.is_poison() {
            return Value::poison();
        }
        if !self.check_usable_as_value(v) {
            return Value::poison();
        }
        if self.ctx.types.is_equal(v.type_id, to) {
            return v.clone();
        }

        // raw-pointer reinterpretation, for trusted code only
        if self.is_void_ptr(v.type_id) || self.is_void_ptr(to) {
            if !self.trusted {
                return self.err(ErrorKind::NotTrusted, "raw pointer casts require trusted code");
            }
            let mut out = v.detached();
            out.type_id = to;
            out.flags.is_pointer = true;
            return out;
        }

        let from_meta = self.meta_of(v.type_id);
        let to_meta = self.meta_of(to);

        if from_meta.is_primitive && to_meta.is_primitive {
            if v.flags.is_pointer {
                let loaded = self.load_through(v);
                return self.emit_cvt(&loaded, to);
            }
            if let ValueKind::Imm(imm) = &v.kind {
                let converted = convert_immediate(*imm, &from_meta, &to_meta, self.ctx.builtins.boolean == to);
                return Value::imm(converted, to);
            }
            return self.emit_cvt(v, to);
        }

        // cast operator on the source type
        let to_fqn = self
            .ctx
            .types
            .effective_desc(to)
            .map(|d| d.fqn.clone())
            .unwrap_or_default();
        let cast_name = format!("operator {}", to_fqn);
        let methods = self
            .ctx
            .types
            .effective_desc(v.type_id)
            .map(|d| d.methods.clone())
            .unwrap_or_default();
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(v.type_id));
        let cast = function_match(
            &cast_name,
            Some(to),
            &[],
            &methods,
            MatchFlags {
                ignore_args: true,
                strict_return: true,
                skip_implicit_args: true,
                exclude_private,
                ..Default::default()
            },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match cast {
            MatchResult::Found(m) => return self.gen_call(m, &[], Some(v)),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(
                    ErrorKind::AmbiguousCast,
                    format!("cast operator '{}' is ambiguous", cast_name),
                );
                self.note_candidates(&cands);
                return out;
            }
            MatchResult::NotFound => {}
        }

        // single-argument constructor on the destination type
        let ctors = self
            .ctx
            .types
            .effective_desc(to)
            .map(|d| d.methods.clone())
            .unwrap_or_default();
        let ctor = function_match(
            "constructor",
            None,
            &[v.type_id],
            &ctors,
            MatchFlags { strict_args: true, skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match ctor {
            MatchResult::Found(_) => return self.construct_object(to, &[v.clone()]),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(
                    ErrorKind::AmbiguousConstructor,
                    "construction from this value is ambiguous".to_string(),
                );
                self.note_candidates(&cands);
                return out;
            }
            MatchResult::NotFound => {}
        }

        self.err(
            ErrorKind::NotConvertible,
            format!("no conversion to '{}' exists", to_fqn),
        )
    }

    fn emit_cvt(&mut self, v: &Value, to: TypeId) -> Value {
        let target = self.ctx.types.effective(to);
        let out = self.fd_mut().val(to);
        self.fd_mut()
            .add(Opcode::Cvt)
            .op(out.clone())
            .op(v.detached())
            .imm(Immediate::Type(target));
        out
    }

    /// Property and method access on a value, a type reference or a module
    /// reference.
    pub fn get_prop(&mut self, obj: &Value, name: &str) -> Value {
        if obj.is_poison() {
            return Value::poison();
        }

        if let ValueKind::Imm(Immediate::Module(mid)) = obj.kind {
            return self.module_member(mid, name);
        }
        if let ValueKind::Imm(Immediate::Type(tid)) = obj.kind {
            return self.static_member(tid, name);
        }
        self.instance_member(obj, name)
    }

    fn module_member(&mut self, mid: nox_core::module::ModuleId, name: &str) -> Value {
        let Some(module) = self.ctx.module(mid) else {
            return self.err(ErrorKind::ExportNotFound, "module is not loaded");
        };
        let exports = module.exports_named(name).to_vec();
        if exports.is_empty() {
            return self.err(ErrorKind::ExportNotFound, format!("module has no export named '{}'", name));
        }
        let fns: Vec<_> = exports
            .iter()
            .filter_map(|e| match e {
                nox_core::module::Export::Function(f) => Some(*f),
                _ => None,
            })
            .collect();
        if fns.len() > 1 {
            return self.err(
                ErrorKind::AmbiguousExport,
                format!("export '{}' is ambiguous between {} functions", name, fns.len()),
            );
        }
        if let Some(&f) = fns.first() {
            let sig_ty = self.ctx.funcs.get(f).map(|d| d.signature).unwrap_or(TypeId::POISON);
            return Value::imm(Immediate::Func(f), sig_ty);
        }
        match exports[0] {
            nox_core::module::Export::Type(t) => Value::imm(Immediate::Type(t), t),
            nox_core::module::Export::Data(slot) => {
                let ty = self
                    .ctx
                    .module(mid)
                    .and_then(|m| m.data.get(slot as usize))
                    .map(|d| d.type_id)
                    .unwrap_or(TypeId::POISON);
                Value::imm(Immediate::ModuleData(mid, slot), ty)
            }
            nox_core::module::Export::Function(_) => unreachable!("function exports handled above"),
        }
    }

    fn static_member(&mut self, tid: TypeId, name: &str) -> Value {
        let Some(desc) = self.ctx.types.effective_desc(tid) else {
            return self.err(ErrorKind::TypeNotFound, "type is not registered");
        };
        let methods = desc.methods.clone();
        let props: Vec<Property> = desc.properties.clone();
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(tid));

        let got = function_match(
            name,
            None,
            &[],
            &methods,
            MatchFlags { ignore_args: true, skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => {
                let desc = self.ctx.funcs.get(m).expect("matched function exists");
                if desc.flags.is_thiscall {
                    return self.err(
                        ErrorKind::InstanceMethodOnType,
                        format!("method '{}' requires an instance", name),
                    );
                }
                return Value::imm(Immediate::Func(m), desc.signature);
            }
            MatchResult::Ambiguous(cands) => {
                let out = self.err(ErrorKind::AmbiguousMethod, format!("method '{}' is ambiguous", name));
                self.note_candidates(&cands);
                return out;
            }
            MatchResult::NotFound => {}
        }

        if let Some(p) = props.iter().find(|p| p.name == name) {
            if !p.flags.is_static {
                return self.err(
                    ErrorKind::InstancePropertyOnType,
                    format!("property '{}' requires an instance", name),
                );
            }
            if exclude_private && p.access == Access::Private {
                return self.err(ErrorKind::IsPrivate, format!("property '{}' is private", name));
            }
            if let Some(getter) = p.getter {
                let mut out = self.gen_call(getter, &[], None);
                out.src_setter = p.setter;
                return out;
            }
            // static storage is reachable only through accessors
            return self.err(ErrorKind::NoReadAccess, format!("property '{}' has no getter", name));
        }

        self.err(ErrorKind::PropertyNotFound, format!("type has no member named '{}'", name))
    }

    fn instance_member(&mut self, obj: &Value, name: &str) -> Value {
        let Some(desc) = self.ctx.types.effective_desc(obj.type_id) else {
            return self.err(ErrorKind::TypeNotFound, "object type is not registered");
        };
        let methods = desc.methods.clone();
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(obj.type_id));

        let got = function_match(
            name,
            None,
            &[],
            &methods,
            MatchFlags { ignore_args: true, skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => {
                let fdesc = self.ctx.funcs.get(m).expect("matched function exists");
                if !fdesc.flags.is_thiscall {
                    return self.err(
                        ErrorKind::StaticMethodOnInstance,
                        format!("static method '{}' cannot be called through an instance", name),
                    );
                }
                let mut out = Value::imm(Immediate::Func(m), fdesc.signature);
                out.src_self = Some(Box::new(obj.detached()));
                return out;
            }
            MatchResult::Ambiguous(cands) => {
                let out = self.err(ErrorKind::AmbiguousMethod, format!("method '{}' is ambiguous", name));
                self.note_candidates(&cands);
                return out;
            }
            MatchResult::NotFound => {}
        }

        let Some((prop, offset)) = self.find_prop(obj.type_id, name) else {
            return self.err(
                ErrorKind::PropertyNotFound,
                format!("type has no property named '{}'", name),
            );
        };
        if exclude_private && prop.access == Access::Private {
            return self.err(ErrorKind::IsPrivate, format!("property '{}' is private", name));
        }
        if prop.flags.is_static {
            return self.err(
                ErrorKind::StaticPropertyOnInstance,
                format!("static property '{}' cannot be read through an instance", name),
            );
        }

        if let Some(getter) = prop.getter {
            let mut out = self.gen_call(getter, &[], Some(obj));
            out.src_setter = prop.setter;
            out.src_self = Some(Box::new(obj.detached()));
            return out;
        }
        if !prop.flags.can_read {
            return self.err(ErrorKind::NoReadAccess, format!("property '{}' cannot be read", name));
        }

        // address of the field
        let off = Value::imm(Immediate::U(offset as u64), self.ctx.builtins.u64);
        let mut addr = self.fd_mut().val(prop.type_id);
        addr.flags.is_pointer = true;
        let base = obj.detached();
        self.fd_mut().add(Opcode::UAdd).op(addr.clone()).op(base).op(off);

        let prop_meta = self.meta_of(prop.type_id);
        if !prop_meta.is_primitive && !prop.flags.is_pointer {
            // embedded object: the address is the value
            let mut out = addr;
            out.src_self = Some(Box::new(obj.detached()));
            if !prop.flags.can_write {
                out.flags.is_read_only = true;
            }
            return out;
        }

        let mut out = self.fd_mut().val(prop.type_id);
        if prop.flags.is_pointer {
            out.flags.is_pointer = true;
        }
        self.fd_mut().add(Opcode::Load).op(out.clone()).op(addr.detached());
        out.src_ptr = Some(Box::new(addr));
        out.src_self = Some(Box::new(obj.detached()));
        out.src_setter = prop.setter;
        if !prop.flags.can_write && prop.setter.is_none() {
            out.flags.is_read_only = true;
        }
        out
    }

    /// Find a property by name, walking base classes and accumulating the
    /// base offsets into the final field offset.
    fn find_prop(&self, ty: TypeId, name: &str) -> Option<(Property, u32)> {
        fn walk(
            types: &nox_core::types::TypeRegistry,
            ty: TypeId,
            name: &str,
            extra: u32,
        ) -> Option<(Property, u32)> {
            let desc = types.effective_desc(ty)?;
            if let Some(p) = desc.properties.iter().find(|p| p.name == name) {
                return Some((p.clone(), extra + p.offset));
            }
            for base in &desc.bases {
                if let Some(found) = walk(types, base.type_id, name, extra + base.offset) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.ctx.types, ty, name, 0)
    }
}

/// Compile-time conversion of an immediate between scalar categories.
///
/// Follows the width-exact cast chain of the source category: floats
/// truncate toward zero and saturate at the target bounds, integers narrow
/// by truncation and re-extend by their own signedness.
pub(crate) fn convert_immediate(imm: Immediate, from: &TypeMeta, to: &TypeMeta, to_bool: bool) -> Immediate {
    let to_cat = ScalarCategory::of(to);
    let _ = from;

    if to_bool {
        let truthy = match imm {
            Immediate::I(v) => v != 0,
            Immediate::U(v) => v != 0,
            Immediate::F(v) => v != 0.0,
            Immediate::D(v) => v != 0.0,
            other => return other,
        };
        return Immediate::U(truthy as u64);
    }

    match to_cat {
        ScalarCategory::Signed => {
            let wide: i64 = match imm {
                Immediate::I(v) => v,
                Immediate::U(v) => v as i64,
                Immediate::F(v) => v as i64,
                Immediate::D(v) => v as i64,
                other => return other,
            };
            let narrowed = match to.size {
                1 => wide as i8 as i64,
                2 => wide as i16 as i64,
                4 => wide as i32 as i64,
                _ => wide,
            };
            Immediate::I(narrowed)
        }
        ScalarCategory::Unsigned => {
            let narrowed: u64 = match imm {
                Immediate::I(v) => match to.size {
                    1 => v as u8 as u64,
                    2 => v as u16 as u64,
                    4 => v as u32 as u64,
                    _ => v as u64,
                },
                Immediate::U(v) => match to.size {
                    1 => v as u8 as u64,
                    2 => v as u16 as u64,
                    4 => v as u32 as u64,
                    _ => v,
                },
                Immediate::F(v) => match to.size {
                    1 => v as u8 as u64,
                    2 => v as u16 as u64,
                    4 => v as u32 as u64,
                    _ => v as u64,
                },
                Immediate::D(v) => match to.size {
                    1 => v as u8 as u64,
                    2 => v as u16 as u64,
                    4 => v as u32 as u64,
                    _ => v as u64,
                },
                other => return other,
            };
            Immediate::U(narrowed)
        }
        ScalarCategory::F32 => {
            let f: f32 = match imm {
                Immediate::I(v) => v as f32,
                Immediate::U(v) => v as f32,
                Immediate::F(v) => v,
                Immediate::D(v) => v as f32,
                other => return other,
            };
            Immediate::F(f)
        }
        ScalarCategory::F64 => {
            let d: f64 = match imm {
                Immediate::I(v) => v as f64,
                Immediate::U(v) => v as f64,
                Immediate::F(v) => v as f64,
                Immediate::D(v) => v,
                other => return other,
            };
            Immediate::D(d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u32, float: bool, unsigned: bool) -> TypeMeta {
        TypeMeta::primitive(size, float, !float, unsigned)
    }

    #[test]
    fn test_unsigned_reinterpretation_to_double() {
        let out = convert_immediate(Immediate::I(-1), &meta(8, false, false), &meta(8, false, true), false);
        assert_eq!(out, Immediate::U(u64::MAX));
        let out = convert_immediate(Immediate::U(u64::MAX), &meta(8, false, true), &meta(8, true, false), false);
        assert_eq!(out, Immediate::D(1.8446744073709552e19));
    }

    #[test]
    fn test_double_round_trip_is_identity_in_53_bits() {
        for v in [0i64, 1, -1, 1 << 52, -(1 << 52), 123456789] {
            let d = convert_immediate(Immediate::I(v), &meta(8, false, false), &meta(8, true, false), false);
            let back = convert_immediate(d, &meta(8, true, false), &meta(8, false, false), false);
            assert_eq!(back, Immediate::I(v));
        }
    }

    #[test]
    fn test_narrowing_truncates() {
        let out = convert_immediate(Immediate::I(0x1_0000_0001), &meta(8, false, false), &meta(4, false, false), false);
        assert_eq!(out, Immediate::I(1));
        let out = convert_immediate(Immediate::I(-1), &meta(8, false, false), &meta(2, false, true), false);
        assert_eq!(out, Immediate::U(0xffff));
    }

    #[test]
    fn test_bool_normalizes() {
        let out = convert_immediate(Immediate::I(7), &meta(8, false, false), &meta(1, false, true), true);
        assert_eq!(out, Immediate::U(1));
        let out = convert_immediate(Immediate::D(0.0), &meta(8, true, false), &meta(1, false, true), true);
        assert_eq!(out, Immediate::U(0));
    }
}
