//! Host binding surface.
//!
//! Host code registers a type by providing its size and a host-side hash,
//! then binds fields, methods, static methods, constructors, a destructor
//! and accessor properties. Every binding produces a function descriptor
//! whose wrapper triple the back-ends dispatch through; no generated code
//! is involved, just the binding records interpreted by the FFI shim.

use nox_core::context::ExecutionContext;
use nox_core::error::RegistryError;
use nox_core::functions::FunctionId;
use nox_core::types::{
    Access, Property, PropertyFlags, TypeDescriptor, TypeId, TypeKind, TypeMeta,
};

use crate::ffi::{BindingStore, HostArg, HostFunctionSpec, TypeTag, bind_host_function};

/// Deterministic hash of a host type, used to match bindings at FFI time.
pub fn host_hash<T>() -> u64 {
    nox_core::functions::host_hash_of(std::any::type_name::<T>())
}

/// Builder for one host type registration.
pub struct HostTypeBinder<'a> {
    ctx: &'a mut ExecutionContext,
    store: &'a mut BindingStore,
    type_id: TypeId,
}

impl<'a> HostTypeBinder<'a> {
    pub fn new(
        ctx: &'a mut ExecutionContext,
        store: &'a mut BindingStore,
        name: &str,
        size: u32,
        host_hash: u64,
    ) -> Result<Self, RegistryError> {
        let meta = TypeMeta {
            size,
            is_pod: true,
            is_trivially_constructible: true,
            is_trivially_copyable: true,
            is_trivially_destructible: true,
            is_host: true,
            host_hash,
            ..TypeMeta::default()
        };
        let desc = TypeDescriptor::new(name, name, meta, TypeKind::Class);
        let type_id = ctx.types.register(desc, &ctx.funcs)?;
        Ok(HostTypeBinder { ctx, store, type_id })
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Expose a plain field at a byte offset.
    pub fn field(&mut self, name: &str, offset: u32, ty: TypeId) -> &mut Self {
        self.field_with_access(name, offset, ty, Access::Public)
    }

    pub fn field_with_access(&mut self, name: &str, offset: u32, ty: TypeId, access: Access) -> &mut Self {
        if let Some(d) = self.ctx.types.get_mut(self.type_id) {
            d.properties.push(Property {
                name: name.to_string(),
                access,
                offset,
                type_id: ty,
                getter: None,
                setter: None,
                flags: PropertyFlags { can_read: true, can_write: true, ..Default::default() },
            });
        }
        self
    }

    /// Bind a non-static method; the host function receives the instance
    /// pointer first.
    pub fn method(
        &mut self,
        name: &str,
        func: usize,
        args: &[HostArg],
        ret: HostArg,
    ) -> FunctionId {
        let fid = bind_host_function(
            self.ctx,
            self.store,
            HostFunctionSpec {
                name: name.to_string(),
                func,
                args: args.to_vec(),
                ret,
                this_type: Some(self.type_id),
                takes_ctx: false,
                takes_capture: false,
                access: Access::Public,
                module: None,
            },
        );
        if let Some(d) = self.ctx.types.get_mut(self.type_id) {
            d.methods.push(fid);
        }
        fid
    }

    /// Bind a static method; no instance pointer is passed.
    pub fn static_method(
        &mut self,
        name: &str,
        func: usize,
        args: &[HostArg],
        ret: HostArg,
    ) -> FunctionId {
        let fid = bind_host_function(
            self.ctx,
            self.store,
            HostFunctionSpec {
                name: name.to_string(),
                func,
                args: args.to_vec(),
                ret,
                this_type: None,
                takes_ctx: false,
                takes_capture: false,
                access: Access::Public,
                module: None,
            },
        );
        if let Some(d) = self.ctx.funcs.get_mut(fid) {
            d.flags.is_method = true;
            d.flags.is_thiscall = false;
        }
        if let Some(d) = self.ctx.types.get_mut(self.type_id) {
            d.methods.push(fid);
        }
        fid
    }

    /// Bind a constructor; the host function receives the uninitialized
    /// instance pointer first.
    pub fn constructor(&mut self, func: usize, args: &[HostArg]) -> FunctionId {
        let void = HostArg { tag: TypeTag::Void, type_id: self.ctx.builtins.void };
        self.method("constructor", func, args, void)
    }

    /// Bind the destructor.
    pub fn destructor(&mut self, func: usize) -> FunctionId {
        let void = HostArg { tag: TypeTag::Void, type_id: self.ctx.builtins.void };
        let fid = self.method("destructor", func, &[], void);
        if let Some(d) = self.ctx.types.get_mut(self.type_id) {
            d.destructor = Some(fid);
        }
        fid
    }

    /// Bind a property backed by accessor functions instead of storage.
    pub fn property(
        &mut self,
        name: &str,
        ty_tag: TypeTag,
        ty: TypeId,
        getter: Option<usize>,
        setter: Option<usize>,
    ) -> &mut Self {
        let value = HostArg { tag: ty_tag, type_id: ty };
        let void = HostArg { tag: TypeTag::Void, type_id: self.ctx.builtins.void };
        let getter_id = getter.map(|g| self.method(&format!("get {}", name), g, &[], value));
        let setter_id = setter.map(|s| self.method(&format!("set {}", name), s, &[value], void));
        if let Some(d) = self.ctx.types.get_mut(self.type_id) {
            d.properties.push(Property {
                name: name.to_string(),
                access: Access::Public,
                offset: 0,
                type_id: ty,
                getter: getter_id,
                setter: setter_id,
                flags: PropertyFlags {
                    can_read: getter_id.is_some(),
                    can_write: setter_id.is_some(),
                    ..Default::default()
                },
            });
        }
        self
    }

    pub fn finish(self) -> TypeId {
        self.type_id
    }
}

/// Bind a free host function. When `module` is given the function joins
/// that module's function list, which makes it visible to script name
/// resolution.
pub fn bind_function(
    ctx: &mut ExecutionContext,
    store: &mut BindingStore,
    name: &str,
    func: usize,
    args: &[HostArg],
    ret: HostArg,
    module: Option<nox_core::module::ModuleId>,
) -> FunctionId {
    let fid = bind_host_function(
        ctx,
        store,
        HostFunctionSpec {
            name: name.to_string(),
            func,
            args: args.to_vec(),
            ret,
            this_type: None,
            takes_ctx: false,
            takes_capture: false,
            access: Access::Public,
            module,
        },
    );
    if let Some(mid) = module {
        if let Some(m) = ctx.module_mut(mid) {
            m.functions.push(fid);
        }
    }
    fid
}

/// Bind a host function that receives the closure capture pointer first;
/// used as the target of capturing closures.
pub fn bind_capture_function(
    ctx: &mut ExecutionContext,
    store: &mut BindingStore,
    name: &str,
    func: usize,
    args: &[HostArg],
    ret: HostArg,
    module: Option<nox_core::module::ModuleId>,
) -> FunctionId {
    let fid = bind_host_function(
        ctx,
        store,
        HostFunctionSpec {
            name: name.to_string(),
            func,
            args: args.to_vec(),
            ret,
            this_type: None,
            takes_ctx: false,
            takes_capture: true,
            access: Access::Public,
            module,
        },
    );
    if let Some(mid) = module {
        if let Some(m) = ctx.module_mut(mid) {
            m.functions.push(fid);
        }
    }
    fid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        v: i32,
    }

    extern "C" fn counter_set(this: *mut Counter, v: i32) {
        unsafe { (*this).v = v };
    }

    extern "C" fn counter_get(this: *mut Counter) -> i32 {
        unsafe { (*this).v }
    }

    #[test]
    fn test_bind_type_with_method_and_field() {
        let mut ctx = ExecutionContext::new();
        let mut store = BindingStore::new();
        let i32_t = ctx.builtins.i32;
        let mut b = HostTypeBinder::new(
            &mut ctx,
            &mut store,
            "Counter",
            std::mem::size_of::<Counter>() as u32,
            host_hash::<Counter>(),
        )
        .unwrap();
        b.field("v", 0, i32_t);
        let void_t = b.ctx.builtins.void;
        let set = b.method(
            "setVal",
            counter_set as usize,
            &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
            HostArg { tag: TypeTag::Void, type_id: void_t },
        );
        let _get = b.method("getVal", counter_get as usize, &[], HostArg { tag: TypeTag::I32, type_id: i32_t });
        let tid = b.finish();

        let desc = ctx.types.get(tid).unwrap();
        assert_eq!(desc.methods.len(), 2);
        assert_eq!(desc.properties.len(), 1);
        assert!(desc.meta.is_host);

        let f = ctx.funcs.get(set).unwrap();
        assert!(f.flags.is_host && f.flags.is_thiscall);
    }
}
