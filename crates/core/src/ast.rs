//! The AST contract between the parser and the compiler.
//!
//! The parser (an external collaborator) produces this tree; the compiler
//! consumes it. Every node carries the source location the parser recorded,
//! which the compiler copies into each emitted instruction.

use crate::span::SrcSpan;

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: SrcSpan,
}

impl Node {
    pub fn new(kind: NodeKind, span: SrcSpan) -> Self {
        Node { kind, span }
    }
}

/// A type as spelled in source: a name, optional template arguments, and
/// whether it is a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    pub name: String,
    pub args: Vec<TypeSpec>,
    pub pointer: bool,
}

impl TypeSpec {
    pub fn plain(name: impl Into<String>) -> Self {
        TypeSpec { name: name.into(), args: Vec::new(), pointer: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add, Sub, Mul, Div, Mod,
    Shl, Shr,
    BitAnd, BitOr, BitXor,
    LogicAnd, LogicOr,
    Lt, Gt, Lte, Gte, Eq, Neq,
    Assign,
    AddAssign, SubAssign, MulAssign, DivAssign, ModAssign,
    ShlAssign, ShrAssign, BitAndAssign, BitOrAssign, BitXorAssign,
}

impl BinaryOp {
    pub fn is_assignment(&self) -> bool {
        use BinaryOp::*;
        matches!(
            self,
            Assign | AddAssign | SubAssign | MulAssign | DivAssign | ModAssign
                | ShlAssign | ShrAssign | BitAndAssign | BitOrAssign | BitXorAssign
        )
    }

    /// The canonical operator-method name, e.g. `"operator +="`.
    pub fn method_name(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "operator +",
            Sub => "operator -",
            Mul => "operator *",
            Div => "operator /",
            Mod => "operator %",
            Shl => "operator <<",
            Shr => "operator >>",
            BitAnd => "operator &",
            BitOr => "operator |",
            BitXor => "operator ^",
            LogicAnd => "operator &&",
            LogicOr => "operator ||",
            Lt => "operator <",
            Gt => "operator >",
            Lte => "operator <=",
            Gte => "operator >=",
            Eq => "operator ==",
            Neq => "operator !=",
            Assign => "operator =",
            AddAssign => "operator +=",
            SubAssign => "operator -=",
            MulAssign => "operator *=",
            DivAssign => "operator /=",
            ModAssign => "operator %=",
            ShlAssign => "operator <<=",
            ShrAssign => "operator >>=",
            BitAndAssign => "operator &=",
            BitOrAssign => "operator |=",
            BitXorAssign => "operator ^=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Deref,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl UnaryOp {
    pub fn method_name(&self) -> &'static str {
        use UnaryOp::*;
        match self {
            Neg => "operator -",
            Not => "operator !",
            BitNot => "operator ~",
            Deref => "operator *",
            PreInc | PostInc => "operator ++",
            PreDec | PostDec => "operator --",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeSpec,
}

#[derive(Debug, Clone)]
pub enum ClassMember {
    Field { name: String, ty: TypeSpec, access: AccessSpec },
    Method(Node),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSpec {
    Public,
    Private,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Function {
        name: String,
        params: Vec<Param>,
        ret: TypeSpec,
        body: Box<Node>,
    },
    Class {
        name: String,
        type_params: Vec<String>,
        members: Vec<ClassMember>,
    },
    Literal(Literal),
    Ident(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Node>,
    },
    Block(Vec<Node>),
    VarDecl {
        name: String,
        ty: Option<TypeSpec>,
        init: Option<Box<Node>>,
        constant: bool,
    },
    If {
        cond: Box<Node>,
        then_body: Box<Node>,
        else_body: Option<Box<Node>>,
    },
    While {
        cond: Box<Node>,
        body: Box<Node>,
        /// do-while runs the body before the first condition check.
        do_while: bool,
    },
    For {
        init: Option<Box<Node>>,
        cond: Option<Box<Node>>,
        step: Option<Box<Node>>,
        body: Box<Node>,
    },
    Return(Option<Box<Node>>),
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
    },
    Member {
        object: Box<Node>,
        name: String,
    },
    Index {
        object: Box<Node>,
        index: Box<Node>,
    },
    Cast {
        expr: Box<Node>,
        ty: TypeSpec,
    },
    New {
        ty: TypeSpec,
        args: Vec<Node>,
    },
    SizeOf(TypeSpec),
    /// `let { a, b } = expr;` — binds the named properties of the object.
    Decompose {
        names: Vec<String>,
        object: Box<Node>,
    },
    ExprStmt(Box<Node>),
}
