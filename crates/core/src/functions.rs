//! Function descriptors, signatures and the function registry.
//!
//! Every callable — script or host — gets a stable integer id here. The
//! registry also records, for host bindings, the wrapper entry points the
//! back-ends dispatch through.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::module::ModuleId;
use crate::span::SrcSpan;
use crate::types::{Access, TypeId, TypeKind, TypeMeta, TypeDescriptor, TypeRegistry, type_id_of};

/// Stable identifier of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// The role of an argument slot in a signature.
///
/// Implicit kinds are injected at the call boundary and are always
/// pointer-sized; scripts only ever spell `Explicit` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    Explicit,
    ThisPtr,
    /// Destination for return values that do not fit a register.
    RetPtr,
    /// The execution context, for host callbacks that re-enter script code.
    ContextPtr,
    /// The raw host function, for wrappers that need it.
    FuncPtr,
    /// Captured environment of a closure.
    CaptureDataPtr,
}

impl ArgKind {
    pub fn is_implicit(&self) -> bool {
        !matches!(self, ArgKind::Explicit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigArg {
    pub kind: ArgKind,
    pub type_id: TypeId,
}

/// A function type: return type plus ordered argument list, implicit
/// arguments included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub ret: TypeId,
    pub args: Vec<SigArg>,
    /// Whether the return value travels through a hidden pointer argument.
    pub returns_on_stack: bool,
}

impl Signature {
    pub fn explicit_args(&self) -> impl Iterator<Item = &SigArg> {
        self.args.iter().filter(|a| a.kind == ArgKind::Explicit)
    }

    pub fn explicit_count(&self) -> usize {
        self.explicit_args().count()
    }

    /// Index of the first explicit argument.
    pub fn implicit_count(&self) -> usize {
        self.args.iter().take_while(|a| a.kind.is_implicit()).count()
    }

    pub fn this_type(&self) -> Option<TypeId> {
        self.args
            .iter()
            .find(|a| a.kind == ArgKind::ThisPtr)
            .map(|a| a.type_id)
    }

    pub fn arg_index(&self, kind: ArgKind) -> Option<usize> {
        self.args.iter().position(|a| a.kind == kind)
    }
}

/// Render the fully qualified name of a signature type, e.g.
/// `i32($ctx,this:vec2,f32)`.
pub fn signature_fqn(sig: &Signature, types: &TypeRegistry) -> String {
    let name_of = |id: TypeId| -> String {
        types
            .get(id)
            .map(|d| d.fqn.clone())
            .unwrap_or_else(|| format!("#{:x}", id.0))
    };
    let mut parts = Vec::with_capacity(sig.args.len());
    for a in &sig.args {
        match a.kind {
            ArgKind::Explicit => parts.push(name_of(a.type_id)),
            ArgKind::ThisPtr => parts.push(format!("this:{}", name_of(a.type_id))),
            ArgKind::RetPtr => parts.push("$ret".to_string()),
            ArgKind::ContextPtr => parts.push("$ctx".to_string()),
            ArgKind::FuncPtr => parts.push("$fn".to_string()),
            ArgKind::CaptureDataPtr => parts.push("$capture".to_string()),
        }
    }
    format!("{}({})", name_of(sig.ret), parts.join(","))
}

/// Intern a signature as a function type and return its id.
///
/// Signature types are structural: registering the same signature twice
/// yields the same id.
pub fn register_signature(
    types: &mut TypeRegistry,
    funcs: &FunctionRegistry,
    sig: Signature,
) -> Result<TypeId, RegistryError> {
    let fqn = signature_fqn(&sig, types);
    if let Some(existing) = types.get_by_fqn(&fqn) {
        return Ok(existing.id);
    }
    let meta = TypeMeta {
        size: 8,
        is_function: true,
        ..TypeMeta::default()
    };
    let desc = TypeDescriptor::new(fqn.clone(), fqn, meta, TypeKind::Function(sig));
    types.register(desc, funcs)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFlags {
    pub is_host: bool,
    pub is_external: bool,
    pub is_method: bool,
    /// Non-static method needing a `this` pointer.
    pub is_thiscall: bool,
    pub is_template: bool,
}

/// Entry points of a host binding's ABI-adapting wrappers.
///
/// `binding` is an opaque pointer to the runtime binding record; the
/// wrappers take it as their leading argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperAddrs {
    /// Script-to-host, return by value or register.
    pub cdecl_wrapper: usize,
    /// Script-to-host, return via hidden stack-return pointer.
    pub srv_wrapper: usize,
    /// Adapter used when the host callee is a non-static method.
    pub call_method_func: usize,
    /// The raw host function.
    pub func_ptr: usize,
    /// The binding record interpreted by the wrappers.
    pub binding: usize,
}

/// Where a function's executable form lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionEntry {
    /// Not yet materialized.
    #[default]
    None,
    /// Offset into the IR buffer of the owning module.
    Script { module: ModuleId, offset: u32 },
    /// Address of generated machine code.
    Native { addr: usize },
    /// Host code reached through wrappers.
    Host(WrapperAddrs),
}

/// A registered callable.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub name: String,
    pub display_name: String,
    pub module: Option<ModuleId>,
    /// Id of the function-signature type.
    pub signature: TypeId,
    pub flags: FunctionFlags,
    pub access: Access,
    pub entry: FunctionEntry,
    /// Number of virtual registers the function's IR uses. Filled in when
    /// the IR is committed; the VM sizes its register window from it.
    pub vreg_count: u32,
    pub span: Option<SrcSpan>,
}

/// Allocates monotonically increasing function ids and stores descriptors.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    funcs: Vec<FunctionDescriptor>,
    by_name_sig: FxHashMap<(String, TypeId), FunctionId>,
    by_entry: FxHashMap<usize, FunctionId>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    /// Register a function. Idempotent on (name, signature id).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        signature: TypeId,
        flags: FunctionFlags,
        access: Access,
        module: Option<ModuleId>,
        span: Option<SrcSpan>,
    ) -> FunctionId {
        let name = name.into();
        let key = (name.clone(), signature);
        if let Some(&existing) = self.by_name_sig.get(&key) {
            return existing;
        }
        let id = FunctionId(self.funcs.len() as u32);
        self.funcs.push(FunctionDescriptor {
            id,
            display_name: name.clone(),
            name,
            module,
            signature,
            flags,
            access,
            entry: FunctionEntry::None,
            vreg_count: 0,
            span,
        });
        self.by_name_sig.insert(key, id);
        id
    }

    pub fn get(&self, id: FunctionId) -> Option<&FunctionDescriptor> {
        self.funcs.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut FunctionDescriptor> {
        self.funcs.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.funcs.iter()
    }

    /// Install the executable entry of a function, indexing host and native
    /// addresses for reverse lookup.
    pub fn set_entry(&mut self, id: FunctionId, entry: FunctionEntry) {
        if let Some(desc) = self.funcs.get_mut(id.0 as usize) {
            match entry {
                FunctionEntry::Native { addr } => {
                    self.by_entry.insert(addr, id);
                }
                FunctionEntry::Host(w) => {
                    self.by_entry.insert(w.func_ptr, id);
                }
                _ => {}
            }
            desc.entry = entry;
        }
    }

    /// Reverse lookup by native or host entry address.
    pub fn find_by_entry_addr(&self, addr: usize) -> Option<FunctionId> {
        self.by_entry.get(&addr).copied()
    }

    /// Rewrite the `this` type of a method signature.
    ///
    /// The signature's display name and id change together; the descriptor
    /// is re-keyed so later registrations see the new identity.
    pub fn rebind_this(
        &mut self,
        id: FunctionId,
        new_this: TypeId,
        types: &mut TypeRegistry,
    ) -> Result<(), RegistryError> {
        let desc = self
            .funcs
            .get(id.0 as usize)
            .ok_or(RegistryError::UnknownFunction(id.0))?;
        let sig_desc = types
            .get(desc.signature)
            .ok_or(RegistryError::UnknownType(desc.signature.0))?;
        let mut sig = match sig_desc.signature() {
            Some(s) => s.clone(),
            None => {
                return Err(RegistryError::KindMismatch {
                    fqn: sig_desc.fqn.clone(),
                    expected: "function signature",
                });
            }
        };
        for arg in sig.args.iter_mut() {
            if arg.kind == ArgKind::ThisPtr {
                arg.type_id = new_this;
            }
        }
        let new_sig = register_signature(types, self, sig)?;
        let desc = &mut self.funcs[id.0 as usize];
        let old_key = (desc.name.clone(), desc.signature);
        desc.signature = new_sig;
        desc.display_name = format!(
            "{} {}",
            types.get(new_sig).map(|d| d.fqn.as_str()).unwrap_or("?"),
            desc.name
        );
        self.by_name_sig.remove(&old_key);
        self.by_name_sig.insert((desc.name.clone(), new_sig), id);
        Ok(())
    }
}

/// Deterministic hash for matching a host type against its binding.
pub fn host_hash_of(type_name: &str) -> u64 {
    type_id_of(type_name).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_idempotent_on_name_and_signature() {
        let mut types = TypeRegistry::new();
        let mut funcs = FunctionRegistry::new();
        let sig = register_signature(
            &mut types,
            &funcs,
            Signature { ret: TypeId(7), args: vec![], returns_on_stack: false },
        )
        .unwrap();
        let a = funcs.register("f", sig, FunctionFlags::default(), Access::Public, None, None);
        let b = funcs.register("f", sig, FunctionFlags::default(), Access::Public, None, None);
        assert_eq!(a, b);
        assert_eq!(funcs.len(), 1);
    }

    #[test]
    fn test_signature_interning() {
        let mut types = TypeRegistry::new();
        let funcs = FunctionRegistry::new();
        let sig = Signature {
            ret: TypeId(7),
            args: vec![SigArg { kind: ArgKind::Explicit, type_id: TypeId(9) }],
            returns_on_stack: false,
        };
        let a = register_signature(&mut types, &funcs, sig.clone()).unwrap();
        let b = register_signature(&mut types, &funcs, sig).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_entry_reverse_lookup() {
        let mut types = TypeRegistry::new();
        let mut funcs = FunctionRegistry::new();
        let sig = register_signature(
            &mut types,
            &funcs,
            Signature { ret: TypeId(7), args: vec![], returns_on_stack: false },
        )
        .unwrap();
        let f = funcs.register("g", sig, FunctionFlags::default(), Access::Public, None, None);
        funcs.set_entry(f, FunctionEntry::Native { addr: 0xdead_0000 });
        assert_eq!(funcs.find_by_entry_addr(0xdead_0000), Some(f));
    }
}
