//! End-to-end tests: AST -> IR -> VM execution.

use nox_compiler::Compiler;
use nox_core::ast::{BinaryOp, ClassMember, Literal, Node, NodeKind, Param, TypeSpec};
use nox_core::context::ExecutionContext;
use nox_core::error::RuntimeError;
use nox_core::functions::FunctionId;
use nox_core::module::{Export, ModuleId};
use nox_core::span::SrcSpan;
use nox_runtime::{
    BindingStore, Closure, HostArg, HostTypeBinder, TypeTag, bind_capture_function, bind_function,
    host_hash,
};

// ---- small AST builders ----------------------------------------------------

fn sp() -> SrcSpan {
    SrcSpan::new(ModuleId(1), 1, 1)
}

fn n(kind: NodeKind) -> Node {
    Node::new(kind, sp())
}

fn int(v: i64) -> Node {
    n(NodeKind::Literal(Literal::Int(v)))
}

fn ident(name: &str) -> Node {
    n(NodeKind::Ident(name.to_string()))
}

fn bin(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
    n(NodeKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
}

fn ret(expr: Node) -> Node {
    n(NodeKind::Return(Some(Box::new(expr))))
}

fn block(stmts: Vec<Node>) -> Node {
    n(NodeKind::Block(stmts))
}

fn func(name: &str, params: Vec<(&str, &str)>, ret_ty: &str, body: Vec<Node>) -> Node {
    n(NodeKind::Function {
        name: name.to_string(),
        params: params
            .into_iter()
            .map(|(pn, pt)| Param { name: pn.to_string(), ty: TypeSpec::plain(pt) })
            .collect(),
        ret: TypeSpec::plain(ret_ty),
        body: Box::new(block(body)),
    })
}

fn var(name: &str, ty: Option<&str>, init: Node) -> Node {
    n(NodeKind::VarDecl {
        name: name.to_string(),
        ty: ty.map(TypeSpec::plain),
        init: Some(Box::new(init)),
        constant: false,
    })
}

fn call(callee: Node, args: Vec<Node>) -> Node {
    n(NodeKind::Call { callee: Box::new(callee), args })
}

fn member(obj: Node, name: &str) -> Node {
    n(NodeKind::Member { object: Box::new(obj), name: name.to_string() })
}

fn expr_stmt(e: Node) -> Node {
    n(NodeKind::ExprStmt(Box::new(e)))
}

fn compile(ctx: &mut ExecutionContext, mid: ModuleId, nodes: &[Node]) {
    let mut c = Compiler::new(ctx, mid);
    if let Err(e) = c.compile_unit(nodes) {
        let log: Vec<String> = c.ctx.log.entries().iter().map(|d| d.to_string()).collect();
        panic!("{}: {:?}", e, log);
    }
}

fn exported(ctx: &ExecutionContext, mid: ModuleId, name: &str) -> FunctionId {
    ctx.module(mid)
        .unwrap()
        .exports_named(name)
        .iter()
        .find_map(|e| match e {
            Export::Function(f) => Some(*f),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no exported function '{}'", name))
}

// ---- scenario 1: arithmetic ------------------------------------------------

#[test]
fn test_arithmetic_expression() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("arith");
    // return 2 + 3 * 4;
    let main = func(
        "main",
        vec![],
        "i32",
        vec![ret(bin(BinaryOp::Add, int(2), bin(BinaryOp::Mul, int(3), int(4))))],
    );
    compile(&mut ctx, mid, &[main]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 14);
}

#[test]
fn test_arithmetic_survives_optimizer() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("arith_opt");
    let main = func(
        "main",
        vec![],
        "i32",
        vec![ret(bin(BinaryOp::Add, int(2), bin(BinaryOp::Mul, int(3), int(4))))],
    );
    compile(&mut ctx, mid, &[main]);
    nox_compiler::optimize_module(&mut ctx, mid);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 14);
}

// ---- control flow ----------------------------------------------------------

#[test]
fn test_while_loop_sum() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("loops");
    // let s = 0; let i = 0; while (i < n) { s = s + i; i = i + 1; } return s;
    let main = func(
        "sum",
        vec![("n", "i32")],
        "i32",
        vec![
            var("s", Some("i32"), int(0)),
            var("i", Some("i32"), int(0)),
            n(NodeKind::While {
                cond: Box::new(bin(BinaryOp::Lt, ident("i"), ident("n"))),
                body: Box::new(block(vec![
                    expr_stmt(bin(BinaryOp::Assign, ident("s"), bin(BinaryOp::Add, ident("s"), ident("i")))),
                    expr_stmt(bin(BinaryOp::Assign, ident("i"), bin(BinaryOp::Add, ident("i"), int(1)))),
                ])),
                do_while: false,
            }),
            ret(ident("s")),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let f = exported(&ctx, mid, "sum");
    assert_eq!(vm.call(&ctx, f, &[5], None).unwrap() as i64, 10);
    assert_eq!(vm.call(&ctx, f, &[0], None).unwrap() as i64, 0);
    assert_eq!(vm.call(&ctx, f, &[100], None).unwrap() as i64, 4950);
}

#[test]
fn test_if_else() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("branches");
    // if (x < 0) { return -x; } else { return x; }
    let main = func(
        "abs",
        vec![("x", "i32")],
        "i32",
        vec![n(NodeKind::If {
            cond: Box::new(bin(BinaryOp::Lt, ident("x"), int(0))),
            then_body: Box::new(block(vec![ret(n(NodeKind::Unary {
                op: nox_core::ast::UnaryOp::Neg,
                expr: Box::new(ident("x")),
            }))])),
            else_body: Some(Box::new(block(vec![ret(ident("x"))]))),
        })],
    );
    compile(&mut ctx, mid, &[main]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let f = exported(&ctx, mid, "abs");
    assert_eq!(vm.call(&ctx, f, &[(-7i64) as u64], None).unwrap() as i64, 7);
    assert_eq!(vm.call(&ctx, f, &[9], None).unwrap() as i64, 9);
}

// ---- scenario 2: host type, method dispatch, field read --------------------

#[repr(C)]
struct Counter {
    v: i32,
}

extern "C" fn counter_set(this: *mut Counter, x: i32) {
    unsafe { (*this).v = x };
}

fn bind_counter(ctx: &mut ExecutionContext, store: &mut BindingStore) {
    let i32_t = ctx.builtins.i32;
    let void_t = ctx.builtins.void;
    let mut b = HostTypeBinder::new(
        ctx,
        store,
        "Counter",
        std::mem::size_of::<Counter>() as u32,
        host_hash::<Counter>(),
    )
    .unwrap();
    b.field("v", 0, i32_t);
    b.method(
        "setVal",
        counter_set as usize,
        &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
        HostArg { tag: TypeTag::Void, type_id: void_t },
    );
    b.finish();
}

#[test]
fn test_host_method_and_field() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    bind_counter(&mut ctx, &mut store);
    let mid = ctx.create_module("hosted");

    // let o = new Counter(); o.setVal(7); return o.v;
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("o", None, n(NodeKind::New { ty: TypeSpec::plain("Counter"), args: vec![] })),
            expr_stmt(call(member(ident("o"), "setVal"), vec![int(7)])),
            ret(member(ident("o"), "v")),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 7);
}

// ---- scenario 3: overload resolution ---------------------------------------

extern "C" fn take_int(_: i32) -> i32 {
    1
}

extern "C" fn take_float(_: f32) -> i32 {
    2
}

#[test]
fn test_overload_resolution_dispatch() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let mid = ctx.create_module("overloads");

    let i32_t = ctx.builtins.i32;
    let f32_t = ctx.builtins.f32;
    let f_int = bind_function(
        &mut ctx,
        &mut store,
        "f",
        take_int as usize,
        &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        Some(mid),
    );
    let f_float = bind_function(
        &mut ctx,
        &mut store,
        "f",
        take_float as usize,
        &[HostArg { tag: TypeTag::F32, type_id: f32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        Some(mid),
    );
    assert_ne!(f_int, f_float);

    let call_int = func("call_int", vec![], "i32", vec![ret(call(ident("f"), vec![int(1)]))]);
    let call_float = func(
        "call_float",
        vec![],
        "i32",
        vec![ret(call(ident("f"), vec![n(NodeKind::Literal(Literal::Float(1.0)))]))],
    );
    compile(&mut ctx, mid, &[call_int, call_float]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    assert_eq!(vm.call(&ctx, exported(&ctx, mid, "call_int"), &[], None).unwrap(), 1);
    assert_eq!(vm.call(&ctx, exported(&ctx, mid, "call_float"), &[], None).unwrap(), 2);
}

// ---- scenario 4: cast operator ---------------------------------------------

#[repr(C)]
struct Celsius {
    degrees: i32,
}

static CAST_CALLS: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

extern "C" fn celsius_to_i32(this: *mut Celsius) -> i32 {
    CAST_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    unsafe { (*this).degrees }
}

extern "C" fn celsius_init(this: *mut Celsius) {
    unsafe { (*this).degrees = 41 };
}

#[test]
fn test_cast_operator_invoked_once() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let i32_t = ctx.builtins.i32;
    let mut b = HostTypeBinder::new(
        &mut ctx,
        &mut store,
        "Celsius",
        std::mem::size_of::<Celsius>() as u32,
        host_hash::<Celsius>(),
    )
    .unwrap();
    b.constructor(celsius_init as usize, &[]);
    b.method(
        "operator i32",
        celsius_to_i32 as usize,
        &[],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
    );
    b.finish();

    let mid = ctx.create_module("casts");
    // let c = new Celsius(); return (c as i32) + 1;
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("c", None, n(NodeKind::New { ty: TypeSpec::plain("Celsius"), args: vec![] })),
            ret(bin(
                BinaryOp::Add,
                n(NodeKind::Cast { expr: Box::new(ident("c")), ty: TypeSpec::plain("i32") }),
                int(1),
            )),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    CAST_CALLS.store(0, std::sync::atomic::Ordering::SeqCst);
    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 42);
    assert_eq!(CAST_CALLS.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ---- scenario 5: closures --------------------------------------------------

extern "C" fn closure_add(capture: *const u8, x: i32) -> i32 {
    let captured = unsafe { *(capture as *const i32) };
    captured + x
}

#[test]
fn test_closure_capturing_host_target() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let i32_t = ctx.builtins.i32;
    let target = bind_capture_function(
        &mut ctx,
        &mut store,
        "closure_add",
        closure_add as usize,
        &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        None,
    );

    let addr = Closure::new(target).capturing(40i32).into_raw();
    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call_closure(&ctx, addr, &[2]).unwrap();
    assert_eq!(got as i64, 42);

    // reclaim the record
    drop(unsafe { Closure::from_raw(addr) });
}

#[test]
fn test_closure_called_from_script() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let i32_t = ctx.builtins.i32;
    let target = bind_capture_function(
        &mut ctx,
        &mut store,
        "closure_add",
        closure_add as usize,
        &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        None,
    );
    let cb_type = ctx.funcs.get(target).unwrap().signature;
    let cb_type_name = ctx.types.get(cb_type).unwrap().fqn.clone();

    let mid = ctx.create_module("closures");
    // fn run_cb(cb: <fn type>) -> i32 { return cb(2); }
    let run_cb = func(
        "run_cb",
        vec![("cb", cb_type_name.as_str())],
        "i32",
        vec![ret(call(ident("cb"), vec![int(2)]))],
    );
    compile(&mut ctx, mid, &[run_cb]);

    let addr = Closure::new(target).capturing(40i32).into_raw();
    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "run_cb"), &[addr], None).unwrap();
    assert_eq!(got as i64, 42);
    drop(unsafe { Closure::from_raw(addr) });
}

#[test]
fn test_null_closure_faults() {
    let ctx = ExecutionContext::new();
    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let err = vm.call_closure(&ctx, 0, &[]).unwrap_err();
    assert_eq!(err, RuntimeError::NullCallback);
}

// ---- scenario 6: stack guard -----------------------------------------------

#[repr(C)]
struct Huge {
    bytes: [u8; 1 << 16],
}

#[test]
fn test_stack_overflow_on_oversized_allocation() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    HostTypeBinder::new(&mut ctx, &mut store, "Huge", 1 << 16, host_hash::<Huge>())
        .unwrap()
        .finish();

    let mid = ctx.create_module("guard");
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("h", None, n(NodeKind::New { ty: TypeSpec::plain("Huge"), args: vec![] })),
            ret(int(0)),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    // the stack is far smaller than the allocation
    let mut vm = nox_runtime::Vm::new(4 * 1024);
    let err = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap_err();
    assert_eq!(err, RuntimeError::StackOverflow);
}

// ---- numeric boundaries ----------------------------------------------------

#[test]
fn test_unsigned_to_double_boundary() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("numerics");
    // return x as f64;
    let conv = func(
        "conv",
        vec![("x", "u64")],
        "f64",
        vec![ret(n(NodeKind::Cast { expr: Box::new(ident("x")), ty: TypeSpec::plain("f64") }))],
    );
    compile(&mut ctx, mid, &[conv]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "conv"), &[u64::MAX], None).unwrap();
    assert_eq!(f64::from_bits(got), 1.8446744073709552e19);
}

#[test]
fn test_nan_comparisons() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("nan");
    let eq = func(
        "eq",
        vec![("a", "f64"), ("b", "f64")],
        "bool",
        vec![ret(bin(BinaryOp::Eq, ident("a"), ident("b")))],
    );
    let neq = func(
        "neq",
        vec![("a", "f64"), ("b", "f64")],
        "bool",
        vec![ret(bin(BinaryOp::Neq, ident("a"), ident("b")))],
    );
    compile(&mut ctx, mid, &[eq, neq]);

    let nan = f64::to_bits(f64::NAN);
    let mut vm = nox_runtime::Vm::new(64 * 1024);
    assert_eq!(vm.call(&ctx, exported(&ctx, mid, "eq"), &[nan, nan], None).unwrap(), 0);
    assert_eq!(vm.call(&ctx, exported(&ctx, mid, "neq"), &[nan, nan], None).unwrap(), 1);
}

#[test]
fn test_integer_division_by_zero_faults() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("div");
    let div = func(
        "div",
        vec![("a", "i32"), ("b", "i32")],
        "i32",
        vec![ret(bin(BinaryOp::Div, ident("a"), ident("b")))],
    );
    compile(&mut ctx, mid, &[div]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let f = exported(&ctx, mid, "div");
    assert_eq!(vm.call(&ctx, f, &[10, 2], None).unwrap() as i64, 5);
    assert_eq!(vm.call(&ctx, f, &[10, 0], None).unwrap_err(), RuntimeError::DivideByZero);
}

// ---- script classes --------------------------------------------------------

#[test]
fn test_script_class_with_method() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("classes");

    // class Point { x: i32; y: i32; fn sum() -> i32 { return this.x + this.y; } }
    let class = n(NodeKind::Class {
        name: "Point".to_string(),
        type_params: vec![],
        members: vec![
            ClassMember::Field {
                name: "x".to_string(),
                ty: TypeSpec::plain("i32"),
                access: nox_core::ast::AccessSpec::Public,
            },
            ClassMember::Field {
                name: "y".to_string(),
                ty: TypeSpec::plain("i32"),
                access: nox_core::ast::AccessSpec::Public,
            },
            ClassMember::Method(func(
                "sum",
                vec![],
                "i32",
                vec![ret(bin(
                    BinaryOp::Add,
                    member(ident("this"), "x"),
                    member(ident("this"), "y"),
                ))],
            )),
        ],
    });

    // fn main() -> i32 { let p = new Point(); p.x = 30; p.y = 12; return p.sum(); }
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("p", None, n(NodeKind::New { ty: TypeSpec::plain("Point"), args: vec![] })),
            expr_stmt(bin(BinaryOp::Assign, member(ident("p"), "x"), int(30))),
            expr_stmt(bin(BinaryOp::Assign, member(ident("p"), "y"), int(12))),
            ret(call(member(ident("p"), "sum"), vec![])),
        ],
    );
    compile(&mut ctx, mid, &[class, main]);

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 42);
}

// ---- serialization round trip ----------------------------------------------

#[test]
fn test_save_load_run() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("roundtrip");
    let main = func(
        "main",
        vec![],
        "i32",
        vec![ret(bin(BinaryOp::Add, int(2), bin(BinaryOp::Mul, int(3), int(4))))],
    );
    compile(&mut ctx, mid, &[main]);

    let mut image = Vec::new();
    nox_core::serialize::save_module(&ctx, mid, &mut image).unwrap();

    let mut fresh = ExecutionContext::new();
    let loaded = nox_core::serialize::load_module(&mut fresh, image.as_slice()).unwrap();

    let mut vm = nox_runtime::Vm::new(64 * 1024);
    let got = vm.call(&fresh, exported(&fresh, loaded, "main"), &[], None).unwrap();
    assert_eq!(got as i64, 14);
}
