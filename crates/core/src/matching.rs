//! Overload resolution.
//!
//! One matcher serves method lookup, operator lookup, constructor selection
//! and cast resolution: filter by name, then by return type, then prefer a
//! strict argument match, then fall back to convertibility.

use crate::functions::{FunctionId, FunctionRegistry, Signature};
use crate::types::{Access, TypeId, TypeKind, TypeRegistry};

/// Behavior switches for [`function_match`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchFlags {
    /// Match any argument list.
    pub ignore_args: bool,
    /// Require argument types equal by effective id; no conversions.
    pub strict_args: bool,
    /// Ignore the implicit prefix of each candidate's argument list.
    pub skip_implicit_args: bool,
    /// Require the return type equal rather than convertible.
    pub strict_return: bool,
    /// Drop private candidates.
    pub exclude_private: bool,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone)]
pub enum MatchResult {
    NotFound,
    Found(FunctionId),
    Ambiguous(Vec<FunctionId>),
}

impl MatchResult {
    pub fn single(&self) -> Option<FunctionId> {
        match self {
            MatchResult::Found(f) => Some(*f),
            _ => None,
        }
    }
}

fn signature_of<'a>(
    func: FunctionId,
    types: &'a TypeRegistry,
    funcs: &FunctionRegistry,
) -> Option<&'a Signature> {
    let desc = funcs.get(func)?;
    match &types.effective_desc(desc.signature)?.kind {
        TypeKind::Function(sig) => Some(sig),
        _ => None,
    }
}

/// Whether `from` can be implicitly converted to `to`.
///
/// Primitives inter-convert freely; otherwise the conversion exists when the
/// types are equal, when a cast operator `operator <fqn>` is defined on
/// `from`, or when `to` has a single-argument constructor taking `from`.
pub fn is_convertible(
    from: TypeId,
    to: TypeId,
    types: &TypeRegistry,
    funcs: &FunctionRegistry,
) -> bool {
    if types.is_equal(from, to) {
        return true;
    }
    let (df, dt) = match (types.effective_desc(from), types.effective_desc(to)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    if df.meta.is_primitive && dt.meta.is_primitive {
        return true;
    }

    // cast operator on the source type
    let cast_name = format!("operator {}", dt.fqn);
    let cast = function_match(
        &cast_name,
        Some(to),
        &[],
        &df.methods,
        MatchFlags { ignore_args: true, strict_return: true, skip_implicit_args: true, ..Default::default() },
        types,
        funcs,
    );
    if matches!(cast, MatchResult::Found(_)) {
        return true;
    }

    // copy-constructor chain on the destination type
    let ctor = function_match(
        "constructor",
        None,
        &[from],
        &dt.methods,
        MatchFlags { strict_args: true, skip_implicit_args: true, ..Default::default() },
        types,
        funcs,
    );
    matches!(ctor, MatchResult::Found(_))
}

/// The overload-resolution routine shared by member access, operator
/// resolution and call generation.
pub fn function_match(
    name: &str,
    ret: Option<TypeId>,
    args: &[TypeId],
    candidates: &[FunctionId],
    flags: MatchFlags,
    types: &TypeRegistry,
    funcs: &FunctionRegistry,
) -> MatchResult {
    let mut pool: Vec<FunctionId> = Vec::new();

    for &cand in candidates {
        let desc = match funcs.get(cand) {
            Some(d) => d,
            None => continue,
        };
        if desc.name != name {
            continue;
        }
        if flags.exclude_private && desc.access == Access::Private {
            continue;
        }
        let sig = match signature_of(cand, types, funcs) {
            Some(s) => s,
            None => continue,
        };
        if let Some(want_ret) = ret {
            if flags.strict_return {
                if !types.is_equal(sig.ret, want_ret) {
                    continue;
                }
            } else if !is_convertible(sig.ret, want_ret, types, funcs) {
                continue;
            }
        }
        pool.push(cand);
    }

    if flags.ignore_args {
        return match pool.len() {
            0 => MatchResult::NotFound,
            1 => MatchResult::Found(pool[0]),
            _ => MatchResult::Ambiguous(pool),
        };
    }

    let cand_args = |cand: FunctionId| -> Vec<TypeId> {
        let sig = signature_of(cand, types, funcs).expect("candidate signature vanished");
        sig.args
            .iter()
            .filter(|a| !flags.skip_implicit_args || a.kind == crate::functions::ArgKind::Explicit)
            .map(|a| a.type_id)
            .collect()
    };

    // strict pass: equal types position by position
    let strict: Vec<FunctionId> = pool
        .iter()
        .copied()
        .filter(|&cand| {
            let ca = cand_args(cand);
            ca.len() == args.len()
                && ca.iter().zip(args).all(|(a, b)| types.is_equal(*a, *b))
        })
        .collect();
    if strict.len() == 1 {
        return MatchResult::Found(strict[0]);
    }
    if flags.strict_args {
        return match strict.len() {
            0 => MatchResult::NotFound,
            _ => MatchResult::Ambiguous(strict),
        };
    }

    // loose pass: every requested argument convertible to the declared one
    let loose: Vec<FunctionId> = pool
        .iter()
        .copied()
        .filter(|&cand| {
            let ca = cand_args(cand);
            ca.len() == args.len()
                && ca
                    .iter()
                    .zip(args)
                    .all(|(declared, requested)| is_convertible(*requested, *declared, types, funcs))
        })
        .collect();

    match loose.len() {
        0 => MatchResult::NotFound,
        1 => MatchResult::Found(loose[0]),
        _ => MatchResult::Ambiguous(loose),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{ArgKind, FunctionFlags, SigArg, register_signature};
    use crate::types::{TypeDescriptor, TypeMeta};

    struct Fixture {
        types: TypeRegistry,
        funcs: FunctionRegistry,
        i32_t: TypeId,
        f32_t: TypeId,
        void_t: TypeId,
    }

    fn fixture() -> Fixture {
        let mut types = TypeRegistry::new();
        let funcs = FunctionRegistry::new();
        let i32_t = types
            .register(
                TypeDescriptor::new("i32", "i32", TypeMeta::primitive(4, false, true, false), TypeKind::Plain),
                &funcs,
            )
            .unwrap();
        let f32_t = types
            .register(
                TypeDescriptor::new("f32", "f32", TypeMeta::primitive(4, true, false, false), TypeKind::Plain),
                &funcs,
            )
            .unwrap();
        let void_t = types
            .register(
                TypeDescriptor::new("void", "void", TypeMeta::default(), TypeKind::Plain),
                &funcs,
            )
            .unwrap();
        Fixture { types, funcs, i32_t, f32_t, void_t }
    }

    fn add_fn(fx: &mut Fixture, name: &str, arg: TypeId) -> FunctionId {
        let sig = register_signature(
            &mut fx.types,
            &fx.funcs,
            Signature {
                ret: fx.void_t,
                args: vec![
                    SigArg { kind: ArgKind::ContextPtr, type_id: fx.void_t },
                    SigArg { kind: ArgKind::Explicit, type_id: arg },
                ],
                returns_on_stack: false,
            },
        )
        .unwrap();
        fx.funcs.register(name, sig, FunctionFlags::default(), Access::Public, None, None)
    }

    #[test]
    fn test_strict_match_wins() {
        let mut fx = fixture();
        let i32_t = fx.i32_t;
        let f32_t = fx.f32_t;
        let f_int = add_fn(&mut fx, "f", i32_t);
        let _f_flt = add_fn(&mut fx, "f", f32_t);
        let cands = [f_int, _f_flt];
        let got = function_match(
            "f",
            None,
            &[fx.i32_t],
            &cands,
            MatchFlags { skip_implicit_args: true, ..Default::default() },
            &fx.types,
            &fx.funcs,
        );
        assert_eq!(got.single(), Some(f_int));
    }

    #[test]
    fn test_ambiguous_when_only_conversions_apply() {
        let mut fx = fixture();
        let i32_t = fx.i32_t;
        let f32_t = fx.f32_t;
        let a = add_fn(&mut fx, "g", i32_t);
        let b = add_fn(&mut fx, "g", f32_t);
        // u64 does not exist here; ask with a third primitive so both
        // candidates match only by conversion
        let funcs = FunctionRegistry::new();
        let d_t = fx
            .types
            .register(
                TypeDescriptor::new("f64", "f64", TypeMeta::primitive(8, true, false, false), TypeKind::Plain),
                &funcs,
            )
            .unwrap();
        let got = function_match(
            "g",
            None,
            &[d_t],
            &[a, b],
            MatchFlags { skip_implicit_args: true, ..Default::default() },
            &fx.types,
            &fx.funcs,
        );
        assert!(matches!(got, MatchResult::Ambiguous(ref v) if v.len() == 2));
    }

    #[test]
    fn test_not_found_on_name_mismatch() {
        let mut fx = fixture();
        let i32_t = fx.i32_t;
        let a = add_fn(&mut fx, "h", i32_t);
        let got = function_match(
            "nope",
            None,
            &[fx.i32_t],
            &[a],
            MatchFlags::default(),
            &fx.types,
            &fx.funcs,
        );
        assert!(matches!(got, MatchResult::NotFound));
    }
}
