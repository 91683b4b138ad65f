//! Module images: the serialized form of a compiled module.
//!
//! Layout order is type-table, function-table, code section, module-data
//! section. Types and functions reference each other by id, so loading runs
//! two passes: first every type and function record is materialized, then
//! function-id references inside types and code are patched to the ids the
//! target registry actually allocated. Type ids never need patching: they
//! are derived from fully qualified names and therefore stable.

use std::io::{Read, Write};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::ModuleIoError;
use crate::functions::{FunctionEntry, FunctionFlags, FunctionId};
use crate::ir::{Immediate, Instruction, Value};
use crate::module::{DataSlot, Export, Module, ModuleId};
use crate::span::SourceMap;
use crate::types::{Access, TypeDescriptor, TypeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EntryRecord {
    None,
    /// Offset into the module's code section.
    Script { offset: u32 },
    /// Host-bound function; wrappers are rebuilt when the host re-binds
    /// after load, addresses are never persisted.
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionRecord {
    id: FunctionId,
    name: String,
    signature: TypeId,
    flags: FunctionFlags,
    access: Access,
    entry: EntryRecord,
    vreg_count: u32,
}

/// The on-disk form of one module.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleImage {
    name: String,
    /// The id the module had when it was saved; references to it inside the
    /// code section are remapped on load.
    saved_id: ModuleId,
    types: Vec<TypeDescriptor>,
    functions: Vec<FunctionRecord>,
    code: Vec<Instruction>,
    data: Vec<DataSlot>,
    map: SourceMap,
    exports: Vec<(String, Vec<Export>)>,
}

/// Capture a module into an image.
pub fn capture(ctx: &ExecutionContext, module_id: ModuleId) -> Result<ModuleImage, ModuleIoError> {
    let module = ctx
        .module(module_id)
        .ok_or_else(|| ModuleIoError::Unresolved(format!("module {}", module_id.0)))?;

    let mut types = Vec::with_capacity(module.types.len());
    for &tid in &module.types {
        let desc = ctx
            .types
            .get(tid)
            .ok_or_else(|| ModuleIoError::Unresolved(format!("type {:#x}", tid.0)))?;
        types.push(desc.clone());
    }

    let mut functions = Vec::with_capacity(module.functions.len());
    for &fid in &module.functions {
        let desc = ctx
            .funcs
            .get(fid)
            .ok_or_else(|| ModuleIoError::Unresolved(format!("function {}", fid.0)))?;
        // signature types must travel with the module even when the type was
        // interned outside of it
        let entry = match desc.entry {
            FunctionEntry::Script { offset, .. } => EntryRecord::Script { offset },
            FunctionEntry::Host(_) => EntryRecord::Host,
            _ => EntryRecord::None,
        };
        functions.push(FunctionRecord {
            id: fid,
            name: desc.name.clone(),
            signature: desc.signature,
            flags: desc.flags,
            access: desc.access,
            entry,
            vreg_count: desc.vreg_count,
        });
    }

    // carry the signature descriptors the function table references
    for rec in &functions {
        if !types.iter().any(|t| t.id == rec.signature) {
            if let Some(desc) = ctx.types.get(rec.signature) {
                types.push(desc.clone());
            }
        }
    }

    Ok(ModuleImage {
        name: module.name.clone(),
        saved_id: module.id,
        types,
        functions,
        code: module.code.clone(),
        data: module.data.clone(),
        map: module.map.clone(),
        exports: module.exports.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    })
}

pub fn save_module<W: Write>(
    ctx: &ExecutionContext,
    module_id: ModuleId,
    writer: W,
) -> Result<(), ModuleIoError> {
    let image = capture(ctx, module_id)?;
    bincode::serialize_into(writer, &image)?;
    Ok(())
}

/// Load an image into the context, allocating a fresh module id.
pub fn load_module<R: Read>(ctx: &mut ExecutionContext, reader: R) -> Result<ModuleId, ModuleIoError> {
    let image: ModuleImage = bincode::deserialize_from(reader)?;
    install(ctx, image)
}

/// Install an image: pass one registers types and functions, pass two
/// patches function-id references to the target registry's ids.
pub fn install(ctx: &mut ExecutionContext, image: ModuleImage) -> Result<ModuleId, ModuleIoError> {
    tracing::debug!(
        module = %image.name,
        types = image.types.len(),
        functions = image.functions.len(),
        instructions = image.code.len(),
        "installing module image"
    );
    let module_id = ctx.create_module(image.name.clone());

    // pass one: types first (functions reference signatures by type id)
    for desc in &image.types {
        ctx.types
            .register(desc.clone(), &ctx.funcs)
            .map_err(|e| ModuleIoError::Unresolved(e.to_string()))?;
    }

    let mut fid_map: FxHashMap<FunctionId, FunctionId> = FxHashMap::default();
    for rec in &image.functions {
        let new_id = ctx.funcs.register(
            rec.name.clone(),
            rec.signature,
            rec.flags,
            rec.access,
            Some(module_id),
            None,
        );
        let entry = match rec.entry {
            EntryRecord::Script { offset } => FunctionEntry::Script { module: module_id, offset },
            // host functions come back unbound; the host re-binds them
            EntryRecord::Host | EntryRecord::None => FunctionEntry::None,
        };
        ctx.funcs.set_entry(new_id, entry);
        if let Some(d) = ctx.funcs.get_mut(new_id) {
            d.vreg_count = rec.vreg_count;
        }
        fid_map.insert(rec.id, new_id);
    }

    // pass two: patch function-id references inside types and code
    let patch_fid = |fid: FunctionId, map: &FxHashMap<FunctionId, FunctionId>| -> FunctionId {
        map.get(&fid).copied().unwrap_or(fid)
    };

    for desc in &image.types {
        let Some(target) = ctx.types.get_mut(desc.id) else { continue };
        for m in target.methods.iter_mut() {
            *m = patch_fid(*m, &fid_map);
        }
        for p in target.properties.iter_mut() {
            p.getter = p.getter.map(|g| patch_fid(g, &fid_map));
            p.setter = p.setter.map(|s| patch_fid(s, &fid_map));
        }
        target.destructor = target.destructor.map(|d| patch_fid(d, &fid_map));
    }

    let mut code = image.code;
    for inst in code.iter_mut() {
        for op in inst.operands.iter_mut().flatten() {
            patch_value(op, &fid_map, image.saved_id, module_id);
        }
        inst.imm = inst.imm.map(|imm| patch_imm(imm, &fid_map, image.saved_id, module_id));
    }

    let module = ctx
        .module_mut(module_id)
        .ok_or_else(|| ModuleIoError::Unresolved("freshly created module".to_string()))?;
    module.types = image.types.iter().map(|t| t.id).collect();
    module.functions = image
        .functions
        .iter()
        .map(|r| fid_map.get(&r.id).copied().unwrap_or(r.id))
        .collect();
    module.next_label = code
        .iter()
        .filter_map(|i| match i.imm {
            Some(Immediate::Label(l)) => Some(l.0 + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    module.code = code;
    module.data = image.data;
    module.map = image.map;
    for (name, mut exports) in image.exports {
        for e in exports.iter_mut() {
            if let Export::Function(fid) = e {
                *fid = patch_fid(*fid, &fid_map);
            }
        }
        module.exports.insert(name, exports);
    }

    Ok(module_id)
}

fn patch_imm(
    imm: Immediate,
    fids: &FxHashMap<FunctionId, FunctionId>,
    old_mod: ModuleId,
    new_mod: ModuleId,
) -> Immediate {
    match imm {
        Immediate::Func(f) => Immediate::Func(fids.get(&f).copied().unwrap_or(f)),
        Immediate::Module(m) if m == old_mod => Immediate::Module(new_mod),
        Immediate::ModuleData(m, slot) if m == old_mod => Immediate::ModuleData(new_mod, slot),
        other => other,
    }
}

fn patch_value(
    value: &mut Value,
    fids: &FxHashMap<FunctionId, FunctionId>,
    old_mod: ModuleId,
    new_mod: ModuleId,
) {
    if let crate::ir::ValueKind::Imm(imm) = &mut value.kind {
        *imm = patch_imm(*imm, fids, old_mod, new_mod);
    }
    value.src_setter = value.src_setter.map(|s| fids.get(&s).copied().unwrap_or(s));
    if let Some(p) = value.src_ptr.as_deref_mut() {
        patch_value(p, fids, old_mod, new_mod);
    }
    if let Some(p) = value.src_self.as_deref_mut() {
        patch_value(p, fids, old_mod, new_mod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{ArgKind, Signature, SigArg, register_signature};
    use crate::ir::{Opcode, ValueKind};

    fn build_sample(ctx: &mut ExecutionContext) -> ModuleId {
        let mid = ctx.create_module("sample");
        let sig = register_signature(
            &mut ctx.types,
            &ctx.funcs,
            Signature {
                ret: ctx.builtins.i32,
                args: vec![SigArg { kind: ArgKind::ContextPtr, type_id: ctx.builtins.ptr }],
                returns_on_stack: false,
            },
        )
        .unwrap();
        let fid = ctx.funcs.register(
            "answer",
            sig,
            FunctionFlags::default(),
            Access::Public,
            Some(mid),
            None,
        );
        ctx.funcs.set_entry(fid, FunctionEntry::Script { module: mid, offset: 0 });

        let i32_t = ctx.builtins.i32;
        let module = ctx.module_mut(mid).unwrap();
        let mut ret = Instruction::new(Opcode::Ret);
        ret.operands[0] = Some(Value::imm(Immediate::I(42), i32_t));
        module.code.push(ret);
        module.functions.push(fid);
        module.export("answer", Export::Function(fid));
        mid
    }

    #[test]
    fn test_round_trip_bytes_identical() {
        let mut ctx = ExecutionContext::new();
        let mid = build_sample(&mut ctx);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.nxm");
        save_module(&ctx, mid, std::fs::File::create(&path).unwrap()).unwrap();
        let first = std::fs::read(&path).unwrap();

        let mut other = ExecutionContext::new();
        let loaded = load_module(&mut other, first.as_slice()).unwrap();

        let mut second = Vec::new();
        save_module(&other, loaded, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_rebinds_function_entries() {
        let mut ctx = ExecutionContext::new();
        let mid = build_sample(&mut ctx);
        let mut buf = Vec::new();
        save_module(&ctx, mid, &mut buf).unwrap();

        let mut other = ExecutionContext::new();
        let loaded = load_module(&mut other, buf.as_slice()).unwrap();
        let module = other.module(loaded).unwrap();
        assert_eq!(module.functions.len(), 1);
        let f = other.funcs.get(module.functions[0]).unwrap();
        match f.entry {
            FunctionEntry::Script { module: m, offset } => {
                assert_eq!(m, loaded);
                assert_eq!(offset, 0);
            }
            ref other => panic!("unexpected entry {:?}", other),
        }
        // the export table was patched to the new id
        let exports = module.exports_named("answer");
        assert_eq!(exports, &[Export::Function(module.functions[0])]);
        // code survived
        assert_eq!(module.code.len(), 1);
        assert!(matches!(
            module.code[0].operands[0].as_ref().unwrap().kind,
            ValueKind::Imm(Immediate::I(42))
        ));
    }
}
