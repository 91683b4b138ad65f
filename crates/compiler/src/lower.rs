//! AST lowering.
//!
//! Walks the tree the parser produced, drives the value operations in
//! `expr` and the call generation in `callgen`, and accumulates IR into
//! per-function definitions which are committed to the module when done.

use rustc_hash::FxHashMap;
use tracing::debug;

use nox_core::ast::{AccessSpec, ClassMember, Literal, Node, NodeKind, TypeSpec};
use nox_core::context::ExecutionContext;
use nox_core::error::ErrorKind;
use nox_core::functions::{ArgKind, FunctionId, SigArg, Signature, register_signature};
use nox_core::ir::{Immediate, Opcode, ScalarCategory, Value};
use nox_core::matching::{MatchFlags, MatchResult, function_match};
use nox_core::module::Export;
use nox_core::module::ModuleId;
use nox_core::types::{
    Access, Property, PropertyFlags, TypeDescriptor, TypeId, TypeKind, TypeMeta,
};

use crate::funcdef::FunctionDef;

/// Compilation failed; the diagnostics carry the details.
#[derive(Debug)]
pub struct CompileError {
    pub errors: usize,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compilation failed with {} error(s)", self.errors)
    }
}

impl std::error::Error for CompileError {}

struct Scope {
    vars: FxHashMap<String, Value>,
}

/// The lowering driver for one module.
pub struct Compiler<'ctx> {
    pub ctx: &'ctx mut ExecutionContext,
    pub module: ModuleId,
    /// Trusted code may perform raw-pointer casts.
    pub trusted: bool,
    fds: Vec<FunctionDef>,
    scopes: Vec<Scope>,
    current_class: Option<TypeId>,
    /// Template parameters bound during an instantiation.
    type_bindings: Vec<FxHashMap<String, TypeId>>,
}

impl<'ctx> Compiler<'ctx> {
    pub fn new(ctx: &'ctx mut ExecutionContext, module: ModuleId) -> Self {
        Compiler {
            ctx,
            module,
            trusted: false,
            fds: Vec::new(),
            scopes: Vec::new(),
            current_class: None,
            type_bindings: Vec::new(),
        }
    }

    /// Compile a whole translation unit. Classes are registered before any
    /// function body compiles so forward references resolve.
    pub fn compile_unit(&mut self, nodes: &[Node]) -> Result<(), CompileError> {
        let before = self.ctx.log.error_count();

        for node in nodes {
            if let NodeKind::Class { .. } = node.kind {
                self.compile_class(node, None, &[]);
            }
        }
        for node in nodes {
            if let NodeKind::Function { .. } = node.kind {
                self.compile_function(node, None);
            }
        }

        let errors = self.ctx.log.error_count() - before;
        if errors > 0 {
            return Err(CompileError { errors });
        }
        Ok(())
    }

    // ---- shared plumbing used by expr/callgen ------------------------------

    pub(crate) fn fd_mut(&mut self) -> &mut FunctionDef {
        self.fds.last_mut().expect("no function is being compiled")
    }

    pub(crate) fn err(&mut self, kind: ErrorKind, msg: impl Into<String>) -> Value {
        let span = self
            .fds
            .last()
            .map(|fd| fd.span())
            .unwrap_or_else(nox_core::span::SrcSpan::synthetic);
        self.ctx.log.error(kind, span, msg);
        Value::poison()
    }

    pub(crate) fn note_candidates(&mut self, cands: &[FunctionId]) {
        let span = self
            .fds
            .last()
            .map(|fd| fd.span())
            .unwrap_or_else(nox_core::span::SrcSpan::synthetic);
        for &c in cands {
            let name = self
                .ctx
                .funcs
                .get(c)
                .map(|d| d.display_name.clone())
                .unwrap_or_else(|| format!("fn#{}", c.0));
            self.ctx.log.info(ErrorKind::CouldBe, span, format!("could be '{}'", name));
        }
    }

    pub(crate) fn current_class(&self) -> Option<TypeId> {
        self.current_class
    }

    pub(crate) fn is_void(&self, ty: TypeId) -> bool {
        self.ctx.types.is_equal(ty, self.ctx.builtins.void)
    }

    pub(crate) fn void_type(&self) -> TypeId {
        self.ctx.builtins.void
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope { vars: FxHashMap::default() });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: impl Into<String>, v: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(name.into(), v);
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.vars.get(name) {
                return Some(v.clone());
            }
        }
        None
    }

    // ---- types -------------------------------------------------------------

    fn lookup_type_binding(&self, name: &str) -> Option<TypeId> {
        for frame in self.type_bindings.iter().rev() {
            if let Some(&t) = frame.get(name) {
                return Some(t);
            }
        }
        None
    }

    /// Resolve a spelled type to a registered id, instantiating templates
    /// on demand.
    pub fn resolve_typespec(&mut self, ts: &TypeSpec) -> TypeId {
        if ts.pointer {
            return self.ctx.builtins.ptr;
        }
        if let Some(bound) = self.lookup_type_binding(&ts.name) {
            return bound;
        }
        let found: Vec<TypeId> = self.ctx.types.find_by_name(&ts.name).to_vec();
        let base = match found.len() {
            0 => {
                self.err(ErrorKind::TypeNotFound, format!("type '{}' not found", ts.name));
                return TypeId::POISON;
            }
            1 => found[0],
            _ => {
                // prefer the exact fully qualified spelling when simple
                // names collide
                match self.ctx.types.get_by_fqn(&ts.name) {
                    Some(d) => d.id,
                    None => {
                        self.err(ErrorKind::TypeNotFound, format!("type name '{}' is ambiguous", ts.name));
                        return TypeId::POISON;
                    }
                }
            }
        };

        let is_template = matches!(
            self.ctx.types.get(base).map(|d| &d.kind),
            Some(TypeKind::Template { .. })
        );
        if is_template {
            if ts.args.is_empty() {
                self.err(
                    ErrorKind::TypeNotFound,
                    format!("template '{}' requires type arguments", ts.name),
                );
                return TypeId::POISON;
            }
            let args: Vec<TypeId> = ts.args.iter().map(|a| self.resolve_typespec(a)).collect();
            if args.contains(&TypeId::POISON) {
                return TypeId::POISON;
            }
            return self.instantiate_template(base, &args);
        }
        base
    }

    /// Produce (or reuse) an instantiation of a template type.
    pub fn instantiate_template(&mut self, base: TypeId, args: &[TypeId]) -> TypeId {
        let Some(desc) = self.ctx.types.get(base) else {
            return TypeId::POISON;
        };
        let base_name = desc.name.clone();
        let (params, node) = match &desc.kind {
            TypeKind::Template { params, node } => (params.clone(), node.clone()),
            _ => {
                self.err(ErrorKind::TypeNotFound, format!("'{}' is not a template", base_name));
                return TypeId::POISON;
            }
        };
        if params.len() != args.len() {
            self.err(
                ErrorKind::TypeNotFound,
                format!("template '{}' takes {} arguments, {} given", base_name, params.len(), args.len()),
            );
            return TypeId::POISON;
        }

        let arg_names: Vec<String> = args
            .iter()
            .map(|a| {
                self.ctx
                    .types
                    .get(*a)
                    .map(|d| d.fqn.clone())
                    .unwrap_or_else(|| format!("#{:x}", a.0))
            })
            .collect();
        let mangled = format!("{}<{}>", base_name, arg_names.join(","));
        if let Some(existing) = self.ctx.types.get_by_fqn(&mangled) {
            return existing.id;
        }

        debug!(template = %base_name, instance = %mangled, "instantiating template");

        let new_id = match node {
            Some(node) => {
                // script template: compile the declaration with the
                // parameters bound to the argument types
                let mut frame = FxHashMap::default();
                for (p, a) in params.iter().zip(args) {
                    frame.insert(p.clone(), *a);
                }
                self.type_bindings.push(frame);
                let id = self.compile_class(&node, Some(mangled.clone()), args);
                self.type_bindings.pop();
                id
            }
            None => {
                // host template: share methods and properties under a
                // rewritten identity
                match self.ctx.types.clone_type(base, mangled.clone(), mangled.clone()) {
                    Ok(id) => id,
                    Err(e) => {
                        self.err(ErrorKind::DuplicateType, e.to_string());
                        return TypeId::POISON;
                    }
                }
            }
        };

        if let Some(d) = self.ctx.types.get_mut(new_id) {
            d.kind = if matches!(d.kind, TypeKind::Template { .. }) { TypeKind::Class } else { d.kind.clone() };
            d.meta.is_template = false;
            d.template_base = Some(base);
            d.template_args = args.to_vec();
        }
        new_id
    }

    // ---- declarations ------------------------------------------------------

    /// Register a class type and compile its methods. Returns the type id.
    fn compile_class(&mut self, node: &Node, name_override: Option<String>, _args: &[TypeId]) -> TypeId {
        let NodeKind::Class { name, type_params, members } = &node.kind else {
            self.err(ErrorKind::InvalidOperand, "expected a class declaration");
            return TypeId::POISON;
        };

        // an uninstantiated template only records its declaration
        if !type_params.is_empty() && name_override.is_none() {
            let meta = TypeMeta { is_template: true, ..TypeMeta::default() };
            let desc = TypeDescriptor::new(
                name.clone(),
                name.clone(),
                meta,
                TypeKind::Template {
                    params: type_params.clone(),
                    node: Some(std::sync::Arc::new(node.clone())),
                },
            );
            return match self.ctx.types.register(desc, &self.ctx.funcs) {
                Ok(id) => id,
                Err(e) => {
                    self.err(ErrorKind::DuplicateType, e.to_string());
                    TypeId::POISON
                }
            };
        }

        let final_name = name_override.unwrap_or_else(|| name.clone());

        // lay out fields first so methods can use the full type
        let mut props = Vec::new();
        let mut offset: u32 = 0;
        for member in members {
            if let ClassMember::Field { name: fname, ty, access } = member {
                let ftype = self.resolve_typespec(ty);
                let fsize = self.ctx.size_of(ftype).max(1);
                let align = fsize.min(8);
                offset = (offset + align - 1) / align * align;
                props.push(Property {
                    name: fname.clone(),
                    access: match access {
                        AccessSpec::Public => Access::Public,
                        AccessSpec::Private => Access::Private,
                    },
                    offset,
                    type_id: ftype,
                    getter: None,
                    setter: None,
                    flags: PropertyFlags { can_read: true, can_write: true, ..Default::default() },
                });
                offset += fsize;
            }
        }
        let size = offset.max(1);

        let meta = TypeMeta {
            size,
            is_pod: true,
            is_trivially_constructible: true,
            is_trivially_copyable: true,
            is_trivially_destructible: true,
            ..TypeMeta::default()
        };
        let mut desc = TypeDescriptor::new(final_name.clone(), final_name.clone(), meta, TypeKind::Class);
        desc.properties = props;
        let tid = match self.ctx.types.register(desc, &self.ctx.funcs) {
            Ok(id) => id,
            Err(e) => {
                self.err(ErrorKind::DuplicateType, e.to_string());
                return TypeId::POISON;
            }
        };

        if let Some(m) = self.ctx.modules.iter_mut().find(|m| m.id == self.module) {
            m.types.push(tid);
            m.export(final_name.clone(), Export::Type(tid));
        }

        let prev_class = self.current_class.replace(tid);
        for member in members {
            if let ClassMember::Method(mnode) = member {
                if let Some(fid) = self.compile_function(mnode, Some(tid)) {
                    if let Some(d) = self.ctx.types.get_mut(tid) {
                        d.methods.push(fid);
                    }
                }
            }
        }
        self.current_class = prev_class;
        tid
    }

    /// Compile one function (or method, when `class` is given).
    pub fn compile_function(&mut self, node: &Node, class: Option<TypeId>) -> Option<FunctionId> {
        let NodeKind::Function { name, params, ret, body } = &node.kind else {
            self.err(ErrorKind::InvalidOperand, "expected a function declaration");
            return None;
        };

        let ret_ty = self.resolve_typespec(ret);
        let returns_on_stack = self.ctx.returns_on_stack(ret_ty);

        let mut args = vec![SigArg { kind: ArgKind::ContextPtr, type_id: self.ctx.builtins.ptr }];
        if let Some(cls) = class {
            args.push(SigArg { kind: ArgKind::ThisPtr, type_id: cls });
        }
        if returns_on_stack {
            args.push(SigArg { kind: ArgKind::RetPtr, type_id: ret_ty });
        }
        let explicit_base = args.len();
        let mut param_types = Vec::with_capacity(params.len());
        for p in params {
            let t = self.resolve_typespec(&p.ty);
            param_types.push(t);
            args.push(SigArg { kind: ArgKind::Explicit, type_id: t });
        }

        let sig = Signature { ret: ret_ty, args, returns_on_stack };
        let sig_ty = match register_signature(&mut self.ctx.types, &self.ctx.funcs, sig) {
            Ok(t) => t,
            Err(e) => {
                self.err(ErrorKind::DuplicateType, e.to_string());
                return None;
            }
        };

        let flags = nox_core::functions::FunctionFlags {
            is_method: class.is_some(),
            is_thiscall: class.is_some(),
            ..Default::default()
        };
        let fid = self.ctx.funcs.register(
            name.clone(),
            sig_ty,
            flags,
            Access::Public,
            Some(self.module),
            Some(node.span),
        );

        debug!(function = %name, id = fid.0, "compiling function");

        let mut fd = FunctionDef::new(fid, sig_ty, &self.ctx.types);
        fd.set_span(node.span);
        self.fds.push(fd);
        self.push_scope();

        if class.is_some() {
            let this_v = self.fd_mut().args[1].clone();
            self.bind("this", this_v);
        }
        for (i, p) in params.iter().enumerate() {
            let v = self.fd_mut().args[explicit_base + i].clone();
            self.bind(p.name.clone(), v);
        }

        self.compile_stmt(body);

        let needs_ret = !matches!(self.fd_mut().code.last().map(|i| i.op), Some(Opcode::Ret));
        if needs_ret {
            self.fd_mut().add(Opcode::Ret);
        }

        self.pop_scope();
        let fd = self.fds.pop().expect("function definition was pushed above");
        let ExecutionContext { modules, funcs, .. } = &mut *self.ctx;
        if let Some(m) = modules.iter_mut().find(|m| m.id == self.module) {
            fd.commit(m, funcs);
            if class.is_none() {
                m.export(name.clone(), Export::Function(fid));
            }
        }
        Some(fid)
    }

    // ---- statements --------------------------------------------------------

    pub fn compile_stmt(&mut self, node: &Node) {
        self.fd_mut().set_span(node.span);
        match &node.kind {
            NodeKind::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.compile_stmt(s);
                }
                self.pop_scope();
            }
            NodeKind::VarDecl { name, ty, init, constant } => {
                self.compile_var_decl(name, ty.as_ref(), init.as_deref(), *constant);
            }
            NodeKind::If { cond, then_body, else_body } => {
                let c = self.compile_expr(cond);
                let cb = self.convert(&c, self.ctx.builtins.boolean);
                let end_l = self.fd_mut().label();
                if let Some(else_node) = else_body {
                    let else_l = self.fd_mut().label();
                    self.fd_mut().add(Opcode::Branch).op(cb).imm(Immediate::Label(else_l));
                    self.compile_stmt(then_body);
                    self.fd_mut().add(Opcode::Jump).imm(Immediate::Label(end_l));
                    self.fd_mut().bind_label(else_l);
                    self.compile_stmt(else_node);
                } else {
                    self.fd_mut().add(Opcode::Branch).op(cb).imm(Immediate::Label(end_l));
                    self.compile_stmt(then_body);
                }
                self.fd_mut().bind_label(end_l);
            }
            NodeKind::While { cond, body, do_while } => {
                let start_l = self.fd_mut().label();
                let end_l = self.fd_mut().label();
                self.fd_mut().bind_label(start_l);
                if *do_while {
                    self.compile_stmt(body);
                    let c = self.compile_expr(cond);
                    let cb = self.convert(&c, self.ctx.builtins.boolean);
                    self.fd_mut().add(Opcode::Branch).op(cb).imm(Immediate::Label(end_l));
                    self.fd_mut().add(Opcode::Jump).imm(Immediate::Label(start_l));
                } else {
                    let c = self.compile_expr(cond);
                    let cb = self.convert(&c, self.ctx.builtins.boolean);
                    self.fd_mut().add(Opcode::Branch).op(cb).imm(Immediate::Label(end_l));
                    self.compile_stmt(body);
                    self.fd_mut().add(Opcode::Jump).imm(Immediate::Label(start_l));
                }
                self.fd_mut().bind_label(end_l);
            }
            NodeKind::For { init, cond, step, body } => {
                self.push_scope();
                if let Some(i) = init {
                    self.compile_stmt(i);
                }
                let start_l = self.fd_mut().label();
                let end_l = self.fd_mut().label();
                self.fd_mut().bind_label(start_l);
                if let Some(c) = cond {
                    let cv = self.compile_expr(c);
                    let cb = self.convert(&cv, self.ctx.builtins.boolean);
                    self.fd_mut().add(Opcode::Branch).op(cb).imm(Immediate::Label(end_l));
                }
                self.compile_stmt(body);
                if let Some(s) = step {
                    self.compile_expr(s);
                }
                self.fd_mut().add(Opcode::Jump).imm(Immediate::Label(start_l));
                self.fd_mut().bind_label(end_l);
                self.pop_scope();
            }
            NodeKind::Return(expr) => {
                let (ret_ty, returns_on_stack, ret_arg) = {
                    let fd = self.fds.last().expect("return outside a function");
                    let sig = self
                        .ctx
                        .types
                        .effective_desc(fd.signature)
                        .and_then(|d| d.signature().cloned());
                    match sig {
                        Some(s) => {
                            let ret_arg = fd.implicit_arg(ArgKind::RetPtr, &self.ctx.types);
                            (s.ret, s.returns_on_stack, ret_arg)
                        }
                        None => (self.ctx.builtins.void, false, None),
                    }
                };
                match expr {
                    Some(e) => {
                        let v = self.compile_expr(e);
                        let c = self.convert(&v, ret_ty);
                        if returns_on_stack {
                            if let Some(rp) = ret_arg {
                                self.fd_mut().add(Opcode::Store).op(c.detached()).op(rp.detached());
                            }
                            self.fd_mut().add(Opcode::Ret);
                        } else {
                            self.fd_mut().add(Opcode::Ret).op(c.detached());
                        }
                    }
                    None => {
                        self.fd_mut().add(Opcode::Ret);
                    }
                }
            }
            NodeKind::ExprStmt(e) => {
                self.compile_expr(e);
            }
            NodeKind::Decompose { names, object } => {
                let obj = self.compile_expr(object);
                for n in names {
                    let v = self.get_prop(&obj, n);
                    self.bind(n.clone(), v);
                }
            }
            // expressions in statement position
            _ => {
                self.compile_expr(node);
            }
        }
    }

    fn zero_imm(&self, ty: TypeId) -> Value {
        let meta = self
            .ctx
            .types
            .effective_desc(ty)
            .map(|d| d.meta)
            .unwrap_or_default();
        let imm = match ScalarCategory::of(&meta) {
            ScalarCategory::Signed => Immediate::I(0),
            ScalarCategory::Unsigned => Immediate::U(0),
            ScalarCategory::F32 => Immediate::F(0.0),
            ScalarCategory::F64 => Immediate::D(0.0),
        };
        Value::imm(imm, ty)
    }

    fn compile_var_decl(
        &mut self,
        name: &str,
        ty: Option<&TypeSpec>,
        init: Option<&Node>,
        constant: bool,
    ) {
        let init_v = init.map(|n| self.compile_expr(n));
        let declared = ty.map(|t| self.resolve_typespec(t));

        let mut var = match declared {
            Some(t) if t == TypeId::POISON => Value::poison(),
            Some(t) => {
                let is_prim = self
                    .ctx
                    .types
                    .effective_desc(t)
                    .map(|d| d.meta.is_primitive)
                    .unwrap_or(false);
                if is_prim {
                    let slot = self.fd_mut().val(t);
                    let seed = match &init_v {
                        Some(v) => self.convert(v, t),
                        None => self.zero_imm(t),
                    };
                    if !seed.is_poison() {
                        self.fd_mut().add(Opcode::Assign).op(slot.clone()).op(seed.detached());
                    }
                    slot
                } else {
                    match &init_v {
                        Some(v) => self.convert(v, t),
                        None => self.construct_object(t, &[]),
                    }
                }
            }
            None => match init_v {
                Some(v) if v.is_poison() => v,
                Some(v) => {
                    let is_prim = self
                        .ctx
                        .types
                        .effective_desc(v.type_id)
                        .map(|d| d.meta.is_primitive)
                        .unwrap_or(false);
                    if is_prim && !v.flags.is_pointer {
                        // copy into a register the variable owns
                        let slot = self.fd_mut().val(v.type_id);
                        self.fd_mut().add(Opcode::Assign).op(slot.clone()).op(v.detached());
                        slot
                    } else {
                        v
                    }
                }
                None => {
                    self.err(ErrorKind::InvalidOperand, format!("'{}' needs a type or an initializer", name));
                    return;
                }
            },
        };

        if constant {
            var.flags.is_read_only = true;
        }
        self.bind(name.to_string(), var);
    }

    // ---- expressions -------------------------------------------------------

    pub fn compile_expr(&mut self, node: &Node) -> Value {
        self.fd_mut().set_span(node.span);
        match &node.kind {
            NodeKind::Literal(lit) => self.compile_literal(*lit),
            NodeKind::Ident(name) => self.resolve_ident(name),
            NodeKind::Binary { op, lhs, rhs } => {
                let l = self.compile_expr(lhs);
                let r = self.compile_expr(rhs);
                self.bin_op(*op, &l, &r)
            }
            NodeKind::Unary { op, expr } => {
                let v = self.compile_expr(expr);
                self.un_op(*op, &v)
            }
            NodeKind::Member { object, name } => {
                let obj = self.compile_expr(object);
                self.get_prop(&obj, name)
            }
            NodeKind::Index { object, index } => {
                let obj = self.compile_expr(object);
                let idx = self.compile_expr(index);
                self.index_op(&obj, &idx)
            }
            NodeKind::Call { callee, args } => self.compile_call(callee, args),
            NodeKind::Cast { expr, ty } => {
                let v = self.compile_expr(expr);
                let t = self.resolve_typespec(ty);
                self.convert(&v, t)
            }
            NodeKind::New { ty, args } => {
                let t = self.resolve_typespec(ty);
                let args_v: Vec<Value> = args.iter().map(|a| self.compile_expr(a)).collect();
                self.construct_object(t, &args_v)
            }
            NodeKind::SizeOf(ts) => {
                let t = self.resolve_typespec(ts);
                let size = self.ctx.size_of(t);
                Value::imm(Immediate::U(size as u64), self.ctx.builtins.u64)
            }
            _ => self.err(ErrorKind::InvalidOperand, "expected an expression"),
        }
    }

    fn compile_literal(&mut self, lit: Literal) -> Value {
        let b = self.ctx.builtins;
        match lit {
            Literal::Int(v) => {
                if i32::try_from(v).is_ok() {
                    Value::imm(Immediate::I(v), b.i32)
                } else {
                    Value::imm(Immediate::I(v), b.i64)
                }
            }
            Literal::UInt(v) => {
                if u32::try_from(v).is_ok() {
                    Value::imm(Immediate::U(v), b.u32)
                } else {
                    Value::imm(Immediate::U(v), b.u64)
                }
            }
            Literal::Float(v) => Value::imm(Immediate::F(v), b.f32),
            Literal::Double(v) => Value::imm(Immediate::D(v), b.f64),
            Literal::Bool(v) => Value::imm(Immediate::U(v as u64), b.boolean),
            Literal::Null => Value::imm(Immediate::U(0), b.ptr),
        }
    }

    fn resolve_ident(&mut self, name: &str) -> Value {
        if let Some(v) = self.lookup(name) {
            return v;
        }
        if let Some(t) = self.lookup_type_binding(name) {
            return Value::imm(Immediate::Type(t), t);
        }
        let found = self.ctx.types.find_by_name(name);
        if found.len() == 1 {
            let t = found[0];
            return Value::imm(Immediate::Type(t), t);
        }
        if let Some(m) = self.ctx.module_by_name(name) {
            let mid = m.id;
            return Value::imm(Immediate::Module(mid), self.ctx.builtins.void);
        }
        let fns = self.functions_named(name);
        match fns.len() {
            1 => {
                let sig = self.ctx.funcs.get(fns[0]).map(|d| d.signature).unwrap_or(TypeId::POISON);
                Value::imm(Immediate::Func(fns[0]), sig)
            }
            0 => self.err(ErrorKind::ExportNotFound, format!("undefined identifier '{}'", name)),
            _ => {
                let out = self.err(
                    ErrorKind::AmbiguousMethod,
                    format!("reference to '{}' is ambiguous", name),
                );
                self.note_candidates(&fns);
                out
            }
        }
    }

    /// Functions of the current module registered under `name`.
    fn functions_named(&self, name: &str) -> Vec<FunctionId> {
        let Some(m) = self.ctx.module(self.module) else { return Vec::new() };
        m.functions
            .iter()
            .copied()
            .filter(|f| self.ctx.funcs.get(*f).map(|d| d.name == name).unwrap_or(false))
            .collect()
    }

    fn index_op(&mut self, obj: &Value, idx: &Value) -> Value {
        if obj.is_poison() || idx.is_poison() {
            return Value::poison();
        }
        let methods = self
            .ctx
            .types
            .effective_desc(obj.type_id)
            .map(|d| d.methods.clone())
            .unwrap_or_default();
        let got = function_match(
            "operator []",
            None,
            &[idx.type_id],
            &methods,
            MatchFlags { skip_implicit_args: true, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => self.gen_call(m, &[idx.clone()], Some(obj)),
            MatchResult::Ambiguous(cands) => {
                let out = self.err(ErrorKind::AmbiguousMethod, "index operator is ambiguous");
                self.note_candidates(&cands);
                out
            }
            MatchResult::NotFound => {
                self.err(ErrorKind::MethodNotFound, "type has no index operator")
            }
        }
    }

    fn compile_call(&mut self, callee: &Node, args: &[Node]) -> Value {
        let args_v: Vec<Value> = args.iter().map(|a| self.compile_expr(a)).collect();
        if args_v.iter().any(|a| a.is_poison()) {
            return Value::poison();
        }
        let arg_types: Vec<TypeId> = args_v.iter().map(|a| a.type_id).collect();

        match &callee.kind {
            NodeKind::Member { object, name } => {
                let obj = self.compile_expr(object);
                if obj.is_poison() {
                    return obj;
                }
                if obj.is_module_ref() || obj.is_type_ref() {
                    // exports and statics resolve through member access;
                    // overloads among them are rare enough to defer
                    let f = self.get_prop(&obj, name);
                    return self.gen_call_value(&f, &args_v);
                }
                self.method_call(&obj, name, &args_v, &arg_types)
            }
            NodeKind::Ident(name) => {
                if let Some(local) = self.lookup(name) {
                    return self.gen_call_value(&local, &args_v);
                }
                let found = self.ctx.types.find_by_name(name).to_vec();
                if found.len() == 1 && !args_v.is_empty() {
                    return self.construct_object(found[0], &args_v);
                }
                let cands = self.functions_named(name);
                if cands.is_empty() {
                    return self.err(ErrorKind::ExportNotFound, format!("undefined function '{}'", name));
                }
                let got = function_match(
                    name,
                    None,
                    &arg_types,
                    &cands,
                    MatchFlags { skip_implicit_args: true, ..Default::default() },
                    &self.ctx.types,
                    &self.ctx.funcs,
                );
                match got {
                    MatchResult::Found(f) => self.gen_call(f, &args_v, None),
                    MatchResult::Ambiguous(cands) => {
                        let out = self.err(
                            ErrorKind::AmbiguousMethod,
                            format!("call to '{}' is ambiguous", name),
                        );
                        self.note_candidates(&cands);
                        out
                    }
                    MatchResult::NotFound => self.err(
                        ErrorKind::MethodNotFound,
                        format!("no overload of '{}' matches these arguments", name),
                    ),
                }
            }
            _ => {
                let f = self.compile_expr(callee);
                self.gen_call_value(&f, &args_v)
            }
        }
    }

    fn method_call(&mut self, obj: &Value, name: &str, args: &[Value], arg_types: &[TypeId]) -> Value {
        let methods = self
            .ctx
            .types
            .effective_desc(obj.type_id)
            .map(|d| d.methods.clone())
            .unwrap_or_default();
        let exclude_private = self.current_class() != Some(self.ctx.types.effective(obj.type_id));
        let got = function_match(
            name,
            None,
            arg_types,
            &methods,
            MatchFlags { skip_implicit_args: true, exclude_private, ..Default::default() },
            &self.ctx.types,
            &self.ctx.funcs,
        );
        match got {
            MatchResult::Found(m) => {
                let is_thiscall = self
                    .ctx
                    .funcs
                    .get(m)
                    .map(|d| d.flags.is_thiscall)
                    .unwrap_or(false);
                if !is_thiscall {
                    return self.err(
                        ErrorKind::StaticMethodOnInstance,
                        format!("static method '{}' cannot be called through an instance", name),
                    );
                }
                self.gen_call(m, args, Some(obj))
            }
            MatchResult::Ambiguous(cands) => {
                let out = self.err(
                    ErrorKind::AmbiguousMethod,
                    format!("call to method '{}' is ambiguous", name),
                );
                self.note_candidates(&cands);
                out
            }
            MatchResult::NotFound => {
                // a callable property, or nothing
                let p = self.get_prop(obj, name);
                if p.is_poison() {
                    return p;
                }
                self.gen_call_value(&p, args)
            }
        }
    }
}
