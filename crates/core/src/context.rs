//! The execution context.
//!
//! Owns the process-wide state: type registry, function registry, loaded
//! modules and the diagnostic log. Created before any compilation or
//! execution and passed explicitly to everything that needs it.

use crate::error::{DiagnosticLog, RegistryError};
use crate::functions::FunctionRegistry;
use crate::module::{Module, ModuleId};
use crate::types::{TypeDescriptor, TypeId, TypeKind, TypeMeta, TypeRegistry};

/// Ids of the built-in primitive types, registered at context creation.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinTypes {
    pub poison: TypeId,
    pub void: TypeId,
    pub boolean: TypeId,
    pub i8: TypeId,
    pub i16: TypeId,
    pub i32: TypeId,
    pub i64: TypeId,
    pub u8: TypeId,
    pub u16: TypeId,
    pub u32: TypeId,
    pub u64: TypeId,
    pub f32: TypeId,
    pub f64: TypeId,
    /// The raw pointer type; bit-casts to and from it are restricted to
    /// trusted code.
    pub ptr: TypeId,
}

pub struct ExecutionContext {
    pub types: TypeRegistry,
    pub funcs: FunctionRegistry,
    pub modules: Vec<Module>,
    pub log: DiagnosticLog,
    pub builtins: BuiltinTypes,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let mut types = TypeRegistry::new();
        let funcs = FunctionRegistry::new();
        let builtins = register_builtins(&mut types, &funcs)
            .expect("builtin type registration cannot collide in a fresh registry");
        ExecutionContext {
            types,
            funcs,
            modules: Vec::new(),
            log: DiagnosticLog::new(),
            builtins,
        }
    }

    pub fn create_module(&mut self, name: impl Into<String>) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32 + 1);
        self.modules.push(Module::new(id, name));
        id
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.iter_mut().find(|m| m.id == id)
    }

    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Size in bytes of a value of the given type, pointers included.
    pub fn size_of(&self, ty: TypeId) -> u32 {
        self.types.effective_desc(ty).map(|d| d.meta.size).unwrap_or(0)
    }

    /// Whether values of `ty` return through a hidden pointer argument.
    pub fn returns_on_stack(&self, ty: TypeId) -> bool {
        match self.types.effective_desc(ty) {
            Some(d) => !d.meta.is_primitive && d.meta.size > 0,
            None => false,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext::new()
    }
}

fn register_builtins(
    types: &mut TypeRegistry,
    funcs: &FunctionRegistry,
) -> Result<BuiltinTypes, RegistryError> {
    let mut poison_desc = TypeDescriptor::new("<error>", "$poison", TypeMeta::default(), TypeKind::Plain);
    poison_desc.id = TypeId::POISON;
    let poison = {
        types.register(poison_desc, funcs)?;
        TypeId::POISON
    };

    let void = types.register(
        TypeDescriptor::new("void", "void", TypeMeta::default(), TypeKind::Plain),
        funcs,
    )?;
    let boolean = types.register(
        TypeDescriptor::new("bool", "bool", TypeMeta::primitive(1, false, true, true), TypeKind::Plain),
        funcs,
    )?;

    let int = |size: u32, unsigned: bool| TypeMeta::primitive(size, false, true, unsigned);
    let i8 = types.register(TypeDescriptor::new("i8", "i8", int(1, false), TypeKind::Plain), funcs)?;
    let i16 = types.register(TypeDescriptor::new("i16", "i16", int(2, false), TypeKind::Plain), funcs)?;
    let i32 = types.register(TypeDescriptor::new("i32", "i32", int(4, false), TypeKind::Plain), funcs)?;
    let i64 = types.register(TypeDescriptor::new("i64", "i64", int(8, false), TypeKind::Plain), funcs)?;
    let u8 = types.register(TypeDescriptor::new("u8", "u8", int(1, true), TypeKind::Plain), funcs)?;
    let u16 = types.register(TypeDescriptor::new("u16", "u16", int(2, true), TypeKind::Plain), funcs)?;
    let u32 = types.register(TypeDescriptor::new("u32", "u32", int(4, true), TypeKind::Plain), funcs)?;
    let u64 = types.register(TypeDescriptor::new("u64", "u64", int(8, true), TypeKind::Plain), funcs)?;

    let f32 = types.register(
        TypeDescriptor::new("f32", "f32", TypeMeta::primitive(4, true, false, false), TypeKind::Plain),
        funcs,
    )?;
    let f64 = types.register(
        TypeDescriptor::new("f64", "f64", TypeMeta::primitive(8, true, false, false), TypeKind::Plain),
        funcs,
    )?;

    let ptr = types.register(
        TypeDescriptor::new("ptr", "ptr", TypeMeta::primitive(8, false, true, true), TypeKind::Plain),
        funcs,
    )?;

    Ok(BuiltinTypes {
        poison,
        void,
        boolean,
        i8,
        i16,
        i32,
        i64,
        u8,
        u16,
        u32,
        u64,
        f32,
        f64,
        ptr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.builtins.poison, TypeId::POISON);
        assert_eq!(ctx.size_of(ctx.builtins.i32), 4);
        assert_eq!(ctx.size_of(ctx.builtins.f64), 8);
        let d = ctx.types.get(ctx.builtins.u64).unwrap();
        assert!(d.meta.is_unsigned && d.meta.is_integral);
    }

    #[test]
    fn test_module_creation() {
        let mut ctx = ExecutionContext::new();
        let m = ctx.create_module("main");
        assert_eq!(ctx.module(m).unwrap().name, "main");
        assert!(ctx.module_by_name("main").is_some());
    }
}
