//! Three-address intermediate representation.
//!
//! An instruction is an opcode plus up to three operand [`Value`]s, an
//! optional immediate, and nothing else. Virtual registers are written once
//! by convention; assignment to a logical variable is modeled as a move
//! into a target value or as a store through a pointer value.
//!
//! Both back-ends consume this form directly: the interpreter executes it,
//! the native back-end lowers it to machine code.

use serde::{Deserialize, Serialize};

use crate::functions::FunctionId;
use crate::module::ModuleId;
use crate::types::{TypeId, TypeMeta};

/// A label reserved by the IR builder and later bound to an instruction
/// offset by the label pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Compile-time constant payload.
///
/// The variant is chosen by the numeric category of the declared type, so
/// conversions know exactly which widening or narrowing path applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Immediate {
    I(i64),
    U(u64),
    F(f32),
    D(f64),
    /// Reference to a function (callee of a direct call).
    Func(FunctionId),
    /// Reference to a module.
    Module(ModuleId),
    /// Reference to a type.
    Type(TypeId),
    /// A slot in a module's data section.
    ModuleData(ModuleId, u32),
    /// A control-flow label.
    Label(LabelId),
}

impl Immediate {
    pub fn as_u64(&self) -> u64 {
        match *self {
            Immediate::I(v) => v as u64,
            Immediate::U(v) => v,
            Immediate::F(v) => f32::to_bits(v) as u64,
            Immediate::D(v) => f64::to_bits(v),
            Immediate::Func(f) => f.0 as u64,
            Immediate::Module(m) => m.0 as u64,
            Immediate::Type(t) => t.0,
            Immediate::ModuleData(m, s) => ((m.0 as u64) << 32) | s as u64,
            Immediate::Label(l) => l.0 as u64,
        }
    }
}

/// Storage shape of a compile-time operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    /// A virtual register.
    Reg(u32),
    /// A stack allocation id; the value is the slot's address.
    Stack(u32),
    /// An argument slot of the enclosing function.
    Arg(u16),
    /// A compile-time constant.
    Imm(Immediate),
    /// The sentinel produced on compile errors.
    Poison,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueFlags {
    pub is_read_only: bool,
    /// The value holds the address of the datum rather than the datum.
    pub is_pointer: bool,
}

/// A typed compile-time operand.
///
/// L-values that came from dereferenced properties carry their origin: the
/// pointer they were loaded through (`src_ptr`), the object they belong to
/// (`src_self`) and the setter to call on write-back (`src_setter`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub kind: ValueKind,
    pub type_id: TypeId,
    pub flags: ValueFlags,
    pub src_ptr: Option<Box<Value>>,
    pub src_self: Option<Box<Value>>,
    pub src_setter: Option<FunctionId>,
}

impl Value {
    pub fn new(kind: ValueKind, type_id: TypeId) -> Self {
        Value {
            kind,
            type_id,
            flags: ValueFlags::default(),
            src_ptr: None,
            src_self: None,
            src_setter: None,
        }
    }

    pub fn reg(id: u32, type_id: TypeId) -> Self {
        Value::new(ValueKind::Reg(id), type_id)
    }

    pub fn stack(id: u32, type_id: TypeId) -> Self {
        let mut v = Value::new(ValueKind::Stack(id), type_id);
        v.flags.is_pointer = true;
        v
    }

    pub fn arg(index: u16, type_id: TypeId) -> Self {
        Value::new(ValueKind::Arg(index), type_id)
    }

    pub fn imm(imm: Immediate, type_id: TypeId) -> Self {
        let mut v = Value::new(ValueKind::Imm(imm), type_id);
        v.flags.is_read_only = true;
        v
    }

    pub fn poison() -> Self {
        Value::new(ValueKind::Poison, TypeId::POISON)
    }

    pub fn is_poison(&self) -> bool {
        matches!(self.kind, ValueKind::Poison)
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, ValueKind::Imm(_))
    }

    pub fn is_argument(&self) -> bool {
        matches!(self.kind, ValueKind::Arg(_))
    }

    pub fn is_type_ref(&self) -> bool {
        matches!(self.kind, ValueKind::Imm(Immediate::Type(_)))
    }

    pub fn is_module_ref(&self) -> bool {
        matches!(self.kind, ValueKind::Imm(Immediate::Module(_)))
    }

    pub fn is_module_data(&self) -> bool {
        matches!(self.kind, ValueKind::Imm(Immediate::ModuleData(..)))
    }

    pub fn is_function_ref(&self) -> bool {
        matches!(self.kind, ValueKind::Imm(Immediate::Func(_)))
    }

    pub fn function_id(&self) -> Option<FunctionId> {
        match self.kind {
            ValueKind::Imm(Immediate::Func(f)) => Some(f),
            _ => None,
        }
    }

    /// Strip l-value origin links, keeping only the storage shape.
    pub fn detached(&self) -> Value {
        Value {
            kind: self.kind.clone(),
            type_id: self.type_id,
            flags: self.flags,
            src_ptr: None,
            src_self: None,
            src_setter: None,
        }
    }
}

/// The closed instruction set.
///
/// Arithmetic, comparison and increment/decrement opcodes come in the four
/// scalar categories: `I` signed integer, `U` unsigned integer, `F` 32-bit
/// float, `D` 64-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // sentinels and register-allocator hints
    Noop,
    Term,
    Reserve,
    Resolve,

    // memory
    Load,
    Store,
    StackAlloc,
    StackFree,
    ModuleData,

    // arithmetic
    IAdd, ISub, IMul, IDiv, IMod,
    UAdd, USub, UMul, UDiv, UMod,
    FAdd, FSub, FMul, FDiv, FMod,
    DAdd, DSub, DMul, DDiv, DMod,

    // bitwise and logical
    Band, Bor, Bxor, Shl, Shr,
    Land, Lor, Not, Inv,

    // comparison
    IEq, INeq, ILt, IGt, ILte, IGte,
    UEq, UNeq, ULt, UGt, ULte, UGte,
    FEq, FNeq, FLt, FGt, FLte, FGte,
    DEq, DNeq, DLt, DGt, DLte, DGte,

    // moves and conversion
    Assign,
    Cvt,
    INeg, FNeg, DNeg,
    IInc, IDec, UInc, UDec, FInc, FDec, DInc, DDec,

    // control flow
    Label,
    Branch,
    Jump,
    Ret,

    // calls
    Call,
    Param,
}

impl Opcode {
    /// Whether the instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Branch | Opcode::Jump | Opcode::Ret | Opcode::Term)
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Opcode::Call)
    }

    /// Whether operand 0 is written by the instruction. `Call` writes its
    /// destination through operand 1 and is handled separately.
    pub fn writes_operand0(&self) -> bool {
        !matches!(
            self,
            Opcode::Noop
                | Opcode::Term
                | Opcode::Reserve
                | Opcode::Resolve
                | Opcode::Store
                | Opcode::StackFree
                | Opcode::Label
                | Opcode::Branch
                | Opcode::Jump
                | Opcode::Ret
                | Opcode::Param
                | Opcode::Call
        )
    }
}

/// A single three-address instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: [Option<Value>; 3],
    pub imm: Option<Immediate>,
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Instruction { op, operands: [None, None, None], imm: None }
    }

    pub fn operand(&self, i: usize) -> Option<&Value> {
        self.operands.get(i).and_then(|o| o.as_ref())
    }

    /// The label this instruction binds or targets, if any.
    pub fn label(&self) -> Option<LabelId> {
        match self.imm {
            Some(Immediate::Label(l)) => Some(l),
            _ => None,
        }
    }
}

/// Scalar category of a primitive type, driving opcode selection and the
/// conversion matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarCategory {
    Signed,
    Unsigned,
    F32,
    F64,
}

impl ScalarCategory {
    /// Category of a primitive type's metadata. Pointers and bools count as
    /// unsigned integers.
    pub fn of(meta: &TypeMeta) -> ScalarCategory {
        if meta.is_floating_point {
            if meta.size == 8 { ScalarCategory::F64 } else { ScalarCategory::F32 }
        } else if meta.is_unsigned || !meta.is_integral {
            ScalarCategory::Unsigned
        } else {
            ScalarCategory::Signed
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarCategory::F32 | ScalarCategory::F64)
    }
}

impl std::fmt::Display for Immediate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Immediate::I(v) => write!(f, "{}", v),
            Immediate::U(v) => write!(f, "{}u", v),
            Immediate::F(v) => write!(f, "{}f", v),
            Immediate::D(v) => write!(f, "{}", v),
            Immediate::Func(id) => write!(f, "fn#{}", id.0),
            Immediate::Module(id) => write!(f, "mod#{}", id.0),
            Immediate::Type(id) => write!(f, "tp#{:x}", id.0),
            Immediate::ModuleData(m, s) => write!(f, "data#{}:{}", m.0, s),
            Immediate::Label(l) => write!(f, "L{}", l.0),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ptr = if self.flags.is_pointer { "*" } else { "" };
        match &self.kind {
            ValueKind::Reg(r) => write!(f, "{}r{}", ptr, r),
            ValueKind::Stack(s) => write!(f, "{}s{}", ptr, s),
            ValueKind::Arg(a) => write!(f, "{}a{}", ptr, a),
            ValueKind::Imm(i) => write!(f, "{}", i),
            ValueKind::Poison => write!(f, "<poison>"),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.op)?;
        let mut first = true;
        for op in self.operands.iter().flatten() {
            if first {
                write!(f, " {}", op)?;
                first = false;
            } else {
                write!(f, ", {}", op)?;
            }
        }
        if let Some(imm) = &self.imm {
            if first {
                write!(f, " {}", imm)?;
            } else {
                write!(f, ", {}", imm)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_shapes() {
        let r = Value::reg(3, TypeId(5));
        assert!(!r.is_immediate());
        let s = Value::stack(0, TypeId(5));
        assert!(s.flags.is_pointer);
        let f = Value::imm(Immediate::Func(FunctionId(9)), TypeId(5));
        assert_eq!(f.function_id(), Some(FunctionId(9)));
        assert!(f.flags.is_read_only);
        assert!(Value::poison().is_poison());
    }

    #[test]
    fn test_terminators() {
        assert!(Opcode::Jump.is_terminator());
        assert!(Opcode::Ret.is_terminator());
        assert!(!Opcode::IAdd.is_terminator());
    }

    #[test]
    fn test_writes_operand0() {
        assert!(Opcode::IAdd.writes_operand0());
        assert!(Opcode::Load.writes_operand0());
        assert!(!Opcode::Store.writes_operand0());
        assert!(!Opcode::Param.writes_operand0());
    }
}
