//! Type descriptors and the type registry.
//!
//! Every type a script can mention is interned here. Ids are derived from a
//! deterministic hash of the fully qualified name, so the same name always
//! produces the same id within a process and across serialized modules.
//!
//! The taxonomy is closed: a descriptor is plain, a class, a function
//! signature, a template, or an alias. Aliases are transparent almost
//! everywhere; `effective()` follows them to the underlying descriptor and
//! equality compares effective ids.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};

use crate::ast::Node;
use crate::error::RegistryError;
use crate::functions::{FunctionId, FunctionRegistry, Signature};

/// Stable identifier of a registered type.
///
/// Derived from the fully qualified name, so equal names yield equal ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u64);

impl TypeId {
    /// The distinguished type of poison values produced on compile errors.
    pub const POISON: TypeId = TypeId(0);
}

/// Hash a fully qualified name into a [`TypeId`].
pub fn type_id_of(fqn: &str) -> TypeId {
    let mut h = FxHasher::default();
    h.write(fqn.as_bytes());
    let v = h.finish();
    // id 0 is reserved for poison
    TypeId(if v == 0 { 1 } else { v })
}

/// Layout and category facts about a type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMeta {
    pub size: u32,
    pub is_pod: bool,
    pub is_trivially_constructible: bool,
    pub is_trivially_copyable: bool,
    pub is_trivially_destructible: bool,
    pub is_primitive: bool,
    pub is_floating_point: bool,
    pub is_integral: bool,
    pub is_unsigned: bool,
    pub is_function: bool,
    pub is_template: bool,
    pub is_alias: bool,
    pub is_host: bool,
    pub is_anonymous: bool,
    /// Hash of the host-side type, used to match bindings at FFI time.
    pub host_hash: u64,
}

impl TypeMeta {
    /// Meta for a primitive numeric or pointer type.
    pub fn primitive(size: u32, floating: bool, integral: bool, unsigned: bool) -> Self {
        TypeMeta {
            size,
            is_pod: true,
            is_trivially_constructible: true,
            is_trivially_copyable: true,
            is_trivially_destructible: true,
            is_primitive: true,
            is_floating_point: floating,
            is_integral: integral,
            is_unsigned: unsigned,
            ..TypeMeta::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Public,
    Private,
    /// Visible only to trusted script code.
    Trusted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFlags {
    pub can_read: bool,
    pub can_write: bool,
    pub is_static: bool,
    pub is_pointer: bool,
}

/// A named member of a class-like type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub access: Access,
    pub offset: u32,
    pub type_id: TypeId,
    pub getter: Option<FunctionId>,
    pub setter: Option<FunctionId>,
    pub flags: PropertyFlags,
}

/// A base class with its byte offset inside the derived object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseClass {
    pub type_id: TypeId,
    pub offset: u32,
    pub access: Access,
}

/// Per-kind payload of a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TypeKind {
    Plain,
    Class,
    /// A function signature; the compound over return and argument types.
    Function(Signature),
    /// An uninstantiated template. The declaration node is retained so an
    /// instantiation can be produced later.
    Template {
        params: Vec<String>,
        #[serde(skip)]
        node: Option<Arc<Node>>,
    },
    /// Refers to another type; transparent for equality.
    Alias(TypeId),
}

/// A registered type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub fqn: String,
    pub meta: TypeMeta,
    pub access: Access,
    pub kind: TypeKind,
    pub bases: Vec<BaseClass>,
    pub properties: Vec<Property>,
    pub methods: Vec<FunctionId>,
    pub destructor: Option<FunctionId>,
    /// For template instantiations: the template this was produced from.
    pub template_base: Option<TypeId>,
    pub template_args: Vec<TypeId>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, fqn: impl Into<String>, meta: TypeMeta, kind: TypeKind) -> Self {
        let fqn = fqn.into();
        TypeDescriptor {
            id: type_id_of(&fqn),
            name: name.into(),
            fqn,
            meta,
            access: Access::Public,
            kind,
            bases: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            destructor: None,
            template_base: None,
            template_args: Vec::new(),
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.kind {
            TypeKind::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Find a property by name, optionally walking base classes.
    pub fn get_prop<'a>(
        &'a self,
        name: &str,
        exclude_inherited: bool,
        exclude_private: bool,
        types: &'a TypeRegistry,
    ) -> Option<&'a Property> {
        let found = self.properties.iter().find(|p| {
            if exclude_private && p.access == Access::Private {
                return false;
            }
            p.name == name
        });
        if found.is_some() {
            return found;
        }
        if !exclude_inherited {
            for base in &self.bases {
                if let Some(b) = types.get(base.type_id) {
                    let p = b.get_prop(name, false, exclude_private, types);
                    if p.is_some() {
                        return p;
                    }
                }
            }
        }
        None
    }
}

/// The process-wide store of type descriptors.
///
/// Lookup is O(1) by id and O(log n) by name.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_id: FxHashMap<TypeId, TypeDescriptor>,
    by_fqn: BTreeMap<String, TypeId>,
    by_name: BTreeMap<String, Vec<TypeId>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Register a descriptor.
    ///
    /// Fails with [`RegistryError::DuplicateType`] when a type with the same
    /// fully qualified name exists and is not structurally equivalent;
    /// succeeds idempotently otherwise.
    pub fn register(
        &mut self,
        desc: TypeDescriptor,
        funcs: &FunctionRegistry,
    ) -> Result<TypeId, RegistryError> {
        if let Some(&existing) = self.by_fqn.get(&desc.fqn) {
            let cur = &self.by_id[&existing];
            if Self::equivalent_descs(cur, &desc, self, funcs) {
                return Ok(existing);
            }
            return Err(RegistryError::DuplicateType { fqn: desc.fqn });
        }
        let id = desc.id;
        self.by_fqn.insert(desc.fqn.clone(), id);
        self.by_name.entry(desc.name.clone()).or_default().push(id);
        self.by_id.insert(id, desc);
        Ok(id)
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut TypeDescriptor> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_fqn(&self, fqn: &str) -> Option<&TypeDescriptor> {
        self.by_fqn.get(fqn).and_then(|id| self.by_id.get(id))
    }

    /// All types registered under a simple (unqualified) name.
    pub fn find_by_name(&self, name: &str) -> &[TypeId] {
        self.by_name.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.by_id.values()
    }

    /// Follow aliases to the underlying type id.
    pub fn effective(&self, id: TypeId) -> TypeId {
        let mut cur = id;
        // alias chains are short; the bound only guards against cycles
        for _ in 0..64 {
            match self.by_id.get(&cur).map(|d| &d.kind) {
                Some(TypeKind::Alias(next)) => cur = *next,
                _ => return cur,
            }
        }
        cur
    }

    /// The descriptor after alias resolution.
    pub fn effective_desc(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.by_id.get(&self.effective(id))
    }

    /// Equality: identical effective ids.
    pub fn is_equal(&self, a: TypeId, b: TypeId) -> bool {
        self.effective(a) == self.effective(b)
    }

    /// Equivalence: structural comparison of metadata, bases, properties
    /// and method signatures.
    pub fn is_equivalent(&self, a: TypeId, b: TypeId, funcs: &FunctionRegistry) -> bool {
        if self.is_equal(a, b) {
            return true;
        }
        let (da, db) = match (self.effective_desc(a), self.effective_desc(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        Self::equivalent_descs(da, db, self, funcs)
    }

    fn equivalent_descs(
        a: &TypeDescriptor,
        b: &TypeDescriptor,
        types: &TypeRegistry,
        funcs: &FunctionRegistry,
    ) -> bool {
        if a.id == b.id {
            return true;
        }
        let (ma, mb) = (&a.meta, &b.meta);
        if ma.size != mb.size
            || ma.is_pod != mb.is_pod
            || ma.is_trivially_constructible != mb.is_trivially_constructible
            || ma.is_trivially_copyable != mb.is_trivially_copyable
            || ma.is_trivially_destructible != mb.is_trivially_destructible
            || ma.is_primitive != mb.is_primitive
            || ma.is_floating_point != mb.is_floating_point
            || ma.is_integral != mb.is_integral
            || ma.is_unsigned != mb.is_unsigned
            || ma.is_function != mb.is_function
            || ma.is_template != mb.is_template
            || a.methods.len() != b.methods.len()
            || a.properties.len() != b.properties.len()
            || a.bases.len() != b.bases.len()
            || a.destructor.is_some() != b.destructor.is_some()
        {
            return false;
        }

        for (fa, fb) in a.methods.iter().zip(&b.methods) {
            let (da, db) = match (funcs.get(*fa), funcs.get(*fb)) {
                (Some(x), Some(y)) => (x, y),
                _ => return false,
            };
            if da.flags.is_method != db.flags.is_method
                || da.access != db.access
                || !types.is_equal(da.signature, db.signature)
            {
                return false;
            }
        }

        for (pa, pb) in a.properties.iter().zip(&b.properties) {
            if pa.offset != pb.offset
                || pa.access != pb.access
                || pa.flags != pb.flags
                || pa.name != pb.name
                || !types.is_equal(pa.type_id, pb.type_id)
            {
                return false;
            }
        }

        true
    }

    /// Copy a descriptor under a new identity.
    ///
    /// Used to produce template instantiations: the clone shares methods and
    /// properties with the original but has its own name, FQN and id.
    pub fn clone_type(
        &mut self,
        source: TypeId,
        name: impl Into<String>,
        fqn: impl Into<String>,
    ) -> Result<TypeId, RegistryError> {
        let src = self
            .by_id
            .get(&source)
            .ok_or(RegistryError::UnknownType(source.0))?;
        let mut cloned = src.clone();
        cloned.name = name.into();
        cloned.fqn = fqn.into();
        cloned.id = type_id_of(&cloned.fqn);
        let id = cloned.id;
        if self.by_id.contains_key(&id) {
            return Ok(id);
        }
        self.by_fqn.insert(cloned.fqn.clone(), id);
        self.by_name.entry(cloned.name.clone()).or_default().push(id);
        self.by_id.insert(id, cloned);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prim(name: &str, size: u32) -> TypeDescriptor {
        TypeDescriptor::new(name, name, TypeMeta::primitive(size, false, true, false), TypeKind::Plain)
    }

    #[test]
    fn test_id_stability() {
        assert_eq!(type_id_of("math::vec2"), type_id_of("math::vec2"));
        assert_ne!(type_id_of("math::vec2"), type_id_of("math::vec3"));
    }

    #[test]
    fn test_register_idempotent() {
        let funcs = FunctionRegistry::new();
        let mut reg = TypeRegistry::new();
        let a = reg.register(prim("i32", 4), &funcs).unwrap();
        let b = reg.register(prim("i32", 4), &funcs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let funcs = FunctionRegistry::new();
        let mut reg = TypeRegistry::new();
        reg.register(prim("i32", 4), &funcs).unwrap();
        let err = reg.register(prim("i32", 8), &funcs).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType { .. }));
    }

    #[test]
    fn test_alias_equality() {
        let funcs = FunctionRegistry::new();
        let mut reg = TypeRegistry::new();
        let base = reg.register(prim("i32", 4), &funcs).unwrap();
        let alias = reg
            .register(
                TypeDescriptor::new(
                    "int",
                    "int",
                    TypeMeta { is_alias: true, ..TypeMeta::primitive(4, false, true, false) },
                    TypeKind::Alias(base),
                ),
                &funcs,
            )
            .unwrap();
        assert_ne!(alias, base);
        assert!(reg.is_equal(alias, base));
        assert_eq!(reg.effective(alias), base);
    }

    #[test]
    fn test_clone_shares_structure() {
        let funcs = FunctionRegistry::new();
        let mut reg = TypeRegistry::new();
        let mut d = prim("box", 16);
        d.properties.push(Property {
            name: "len".into(),
            access: Access::Public,
            offset: 0,
            type_id: TypeId(42),
            getter: None,
            setter: None,
            flags: PropertyFlags { can_read: true, can_write: true, ..Default::default() },
        });
        let src = reg.register(d, &funcs).unwrap();
        let inst = reg.clone_type(src, "box<i32>", "box<i32>").unwrap();
        assert_ne!(src, inst);
        let id = reg.get(inst).unwrap();
        assert_eq!(id.properties.len(), 1);
        assert_eq!(id.name, "box<i32>");
    }
}
