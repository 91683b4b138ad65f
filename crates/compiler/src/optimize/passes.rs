//! The built-in passes.
//!
//! Only `LabelOffsets` is required for correct back-end consumption; the
//! rest are cleanups that must preserve observable behavior exactly.

use nox_core::context::ExecutionContext;
use nox_core::ir::{Immediate, Opcode, Value, ValueKind};

use super::liveness::uses_and_def;
use super::{CodeHolder, OptPass};

/// Rebuilds the label-offset table. The back-ends resolve branch targets
/// through it, so it always runs (and re-runs after any structural pass).
pub struct LabelOffsets;

impl OptPass for LabelOffsets {
    fn name(&self) -> &'static str {
        "label-offsets"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &ExecutionContext) -> bool {
        holder.rebuild_labels();
        false
    }
}

/// Replaces arithmetic on two immediates with a move of the result.
pub struct ConstantFolding;

fn fold(op: Opcode, a: &Immediate, b: &Immediate) -> Option<Immediate> {
    use Immediate::*;
    use Opcode::*;
    Some(match (op, a, b) {
        (IAdd, I(x), I(y)) => I(x.wrapping_add(*y)),
        (ISub, I(x), I(y)) => I(x.wrapping_sub(*y)),
        (IMul, I(x), I(y)) => I(x.wrapping_mul(*y)),
        (IDiv, I(x), I(y)) if *y != 0 => I(x.wrapping_div(*y)),
        (IMod, I(x), I(y)) if *y != 0 => I(x.wrapping_rem(*y)),
        (UAdd, U(x), U(y)) => U(x.wrapping_add(*y)),
        (USub, U(x), U(y)) => U(x.wrapping_sub(*y)),
        (UMul, U(x), U(y)) => U(x.wrapping_mul(*y)),
        (UDiv, U(x), U(y)) if *y != 0 => U(x / y),
        (UMod, U(x), U(y)) if *y != 0 => U(x % y),
        (FAdd, F(x), F(y)) => F(x + y),
        (FSub, F(x), F(y)) => F(x - y),
        (FMul, F(x), F(y)) => F(x * y),
        (FDiv, F(x), F(y)) => F(x / y),
        (DAdd, D(x), D(y)) => D(x + y),
        (DSub, D(x), D(y)) => D(x - y),
        (DMul, D(x), D(y)) => D(x * y),
        (DDiv, D(x), D(y)) => D(x / y),
        (Band, U(x), U(y)) => U(x & y),
        (Bor, U(x), U(y)) => U(x | y),
        (Bxor, U(x), U(y)) => U(x ^ y),
        (Band, I(x), I(y)) => I(x & y),
        (Bor, I(x), I(y)) => I(x | y),
        (Bxor, I(x), I(y)) => I(x ^ y),
        _ => return None,
    })
}

impl OptPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &ExecutionContext) -> bool {
        let mut changed = false;
        for inst in holder.code.iter_mut() {
            let (Some(a), Some(b)) = (inst.operand(1), inst.operand(2)) else { continue };
            let (ValueKind::Imm(ia), ValueKind::Imm(ib)) = (&a.kind, &b.kind) else { continue };
            let Some(folded) = fold(inst.op, ia, ib) else { continue };
            let dest = inst.operands[0].clone();
            let ty = a.type_id;
            inst.op = Opcode::Assign;
            inst.operands = [dest, Some(Value::imm(folded, ty)), None];
            inst.imm = None;
            changed = true;
        }
        if changed {
            holder.rebuild_liveness();
        }
        changed
    }
}

/// Within a block, replaces uses of a register that was assigned another
/// register or an immediate with the source, until either side is
/// redefined.
pub struct CopyPropagation;

impl OptPass for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &ExecutionContext) -> bool {
        let mut changed = false;
        let blocks: Vec<(u32, u32)> = holder.cfg.blocks.iter().map(|b| (b.begin, b.end)).collect();

        for (begin, end) in blocks {
            let mut copies: Vec<(u32, Value)> = Vec::new();
            for i in begin as usize..end as usize {
                // rewrite reads through known copies
                let inst = &mut holder.code[i];
                let writes0 = inst.op.writes_operand0();
                let is_call = inst.op == Opcode::Call;
                for (oi, op) in inst.operands.iter_mut().enumerate() {
                    let is_def_slot = (oi == 0 && writes0) || (is_call && oi == 1);
                    if is_def_slot {
                        continue;
                    }
                    let Some(v) = op.as_mut() else { continue };
                    if let ValueKind::Reg(r) = v.kind {
                        if let Some((_, src)) = copies.iter().find(|(c, _)| *c == r) {
                            let mut replacement = src.clone();
                            replacement.type_id = v.type_id;
                            replacement.flags = v.flags;
                            *op = Some(replacement);
                            changed = true;
                        }
                    }
                }

                let inst = &holder.code[i];
                let (_, def) = uses_and_def(inst);
                if let Some(d) = def {
                    copies.retain(|(c, src)| *c != d && !matches!(src.kind, ValueKind::Reg(s) if s == d));
                    if inst.op == Opcode::Assign {
                        if let Some(src) = inst.operand(1) {
                            match src.kind {
                                ValueKind::Reg(_) | ValueKind::Imm(_) => {
                                    copies.push((d, src.detached()));
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
        if changed {
            holder.rebuild_liveness();
        }
        changed
    }
}

/// Removes pure instructions whose destination is never used.
pub struct DeadCodeElimination;

fn is_pure(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        IAdd | ISub | IMul
            | UAdd | USub | UMul
            | FAdd | FSub | FMul | FDiv | FMod
            | DAdd | DSub | DMul | DDiv | DMod
            | Band | Bor | Bxor | Shl | Shr
            | Land | Lor | Not | Inv
            | IEq | INeq | ILt | IGt | ILte | IGte
            | UEq | UNeq | ULt | UGt | ULte | UGte
            | FEq | FNeq | FLt | FGt | FLte | FGte
            | DEq | DNeq | DLt | DGt | DLte | DGte
            | Assign | Cvt | INeg | FNeg | DNeg
    )
}

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &ExecutionContext) -> bool {
        holder.rebuild_liveness();
        let mut dead: Vec<usize> = Vec::new();
        for (i, inst) in holder.code.iter().enumerate() {
            if !is_pure(inst.op) {
                continue;
            }
            let (_, def) = uses_and_def(inst);
            let Some(d) = def else { continue };
            if !holder.liveness.is_live_out(i, d) {
                dead.push(i);
            }
        }
        if dead.is_empty() {
            return false;
        }
        for &i in dead.iter().rev() {
            holder.remove(i);
        }
        holder.rebuild_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nox_core::context::ExecutionContext;
    use nox_core::ir::Instruction;
    use nox_core::span::SourceMap;
    use nox_core::types::TypeId;

    fn reg(r: u32) -> Value {
        Value::reg(r, TypeId(7))
    }

    fn imm_i(v: i64) -> Value {
        Value::imm(Immediate::I(v), TypeId(7))
    }

    fn inst(op: Opcode, ops: Vec<Value>) -> Instruction {
        let mut i = Instruction::new(op);
        for (n, v) in ops.into_iter().enumerate() {
            i.operands[n] = Some(v);
        }
        i
    }

    #[test]
    fn test_constant_folding_rewrites_to_assign() {
        let ctx = ExecutionContext::new();
        let code = vec![
            inst(Opcode::IMul, vec![reg(0), imm_i(3), imm_i(4)]),
            inst(Opcode::Ret, vec![reg(0)]),
        ];
        let mut holder = CodeHolder::new(code, SourceMap::new());
        assert!(ConstantFolding.run(&mut holder, &ctx));
        assert_eq!(holder.code[0].op, Opcode::Assign);
        match &holder.code[0].operand(1).unwrap().kind {
            ValueKind::Imm(Immediate::I(v)) => assert_eq!(*v, 12),
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let ctx = ExecutionContext::new();
        let code = vec![
            inst(Opcode::IDiv, vec![reg(0), imm_i(3), imm_i(0)]),
            inst(Opcode::Ret, vec![reg(0)]),
        ];
        let mut holder = CodeHolder::new(code, SourceMap::new());
        assert!(!ConstantFolding.run(&mut holder, &ctx));
        assert_eq!(holder.code[0].op, Opcode::IDiv);
    }

    #[test]
    fn test_dead_code_removed() {
        let ctx = ExecutionContext::new();
        let code = vec![
            inst(Opcode::IAdd, vec![reg(0), imm_i(1), imm_i(2)]),
            inst(Opcode::IAdd, vec![reg(1), imm_i(3), imm_i(4)]),
            inst(Opcode::Ret, vec![reg(1)]),
        ];
        let mut holder = CodeHolder::new(code, SourceMap::new());
        assert!(DeadCodeElimination.run(&mut holder, &ctx));
        assert_eq!(holder.code.len(), 2);
        let (_, def) = uses_and_def(&holder.code[0]);
        assert_eq!(def, Some(1));
    }

    #[test]
    fn test_copy_propagation_within_block() {
        let ctx = ExecutionContext::new();
        let code = vec![
            inst(Opcode::Assign, vec![reg(0), imm_i(5)]),
            inst(Opcode::IAdd, vec![reg(1), reg(0), imm_i(2)]),
            inst(Opcode::Ret, vec![reg(1)]),
        ];
        let mut holder = CodeHolder::new(code, SourceMap::new());
        assert!(CopyPropagation.run(&mut holder, &ctx));
        match &holder.code[1].operand(1).unwrap().kind {
            ValueKind::Imm(Immediate::I(v)) => assert_eq!(*v, 5),
            other => panic!("copy not propagated: {:?}", other),
        }
    }
}
