//! End-to-end tests: AST -> IR -> native code, with VM parity checks.

use nox_compiler::Compiler;
use nox_core::ast::{BinaryOp, Literal, Node, NodeKind, Param, TypeSpec};
use nox_core::context::ExecutionContext;
use nox_core::functions::{FunctionEntry, FunctionId};
use nox_core::module::{Export, ModuleId};
use nox_core::span::SrcSpan;
use nox_jit::JitBackend;
use nox_runtime::{
    BindingStore, Closure, HostArg, HostTypeBinder, TypeTag, Vm, bind_capture_function,
    bind_function, host_hash,
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

fn var(name: &str, init: Node) -> Node {
    n(NodeKind::VarDecl { name: name.to_string(), ty: None, init: Some(Box::new(init)), constant: false })
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
fn test_native_arithmetic() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("arith");
    let main = func(
        "main",
        vec![],
        "i32",
        vec![ret(bin(BinaryOp::Add, int(2), bin(BinaryOp::Mul, int(3), int(4))))],
    );
    compile(&mut ctx, mid, &[main]);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    let fid = exported(&ctx, mid, "main");
    assert!(matches!(ctx.funcs.get(fid).unwrap().entry, FunctionEntry::Native { .. }));
    assert_eq!(jit.call(&ctx, fid, &[], None).unwrap() as i64, 14);
}

// ---- parity: VM and native agree -------------------------------------------

#[test]
fn test_backends_agree_on_loops_and_branches() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("parity");
    // sum of odd numbers below n
    let main = func(
        "odds",
        vec![("n", "i32")],
        "i32",
        vec![
            var("s", int(0)),
            var("i", int(0)),
            n(NodeKind::While {
                cond: Box::new(bin(BinaryOp::Lt, ident("i"), ident("n"))),
                body: Box::new(block(vec![
                    n(NodeKind::If {
                        cond: Box::new(bin(
                            BinaryOp::Eq,
                            bin(BinaryOp::Mod, ident("i"), int(2)),
                            int(1),
                        )),
                        then_body: Box::new(block(vec![expr_stmt(bin(
                            BinaryOp::Assign,
                            ident("s"),
                            bin(BinaryOp::Add, ident("s"), ident("i")),
                        ))])),
                        else_body: None,
                    }),
                    expr_stmt(bin(BinaryOp::Assign, ident("i"), bin(BinaryOp::Add, ident("i"), int(1)))),
                ])),
                do_while: false,
            }),
            ret(ident("s")),
        ],
    );
    compile(&mut ctx, mid, &[main]);
    let fid = exported(&ctx, mid, "odds");

    let mut vm_results = Vec::new();
    {
        let mut vm = Vm::new(64 * 1024);
        for arg in [0u64, 1, 7, 100] {
            vm_results.push(vm.call(&ctx, fid, &[arg], None).unwrap());
        }
    }

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    for (i, arg) in [0u64, 1, 7, 100].into_iter().enumerate() {
        assert_eq!(jit.call(&ctx, fid, &[arg], None).unwrap(), vm_results[i]);
    }
}

#[test]
fn test_backends_agree_on_numeric_conversions() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("convs");
    let u2d = func(
        "u2d",
        vec![("x", "u64")],
        "f64",
        vec![ret(n(NodeKind::Cast { expr: Box::new(ident("x")), ty: TypeSpec::plain("f64") }))],
    );
    let d2i = func(
        "d2i",
        vec![("x", "f64")],
        "i32",
        vec![ret(n(NodeKind::Cast { expr: Box::new(ident("x")), ty: TypeSpec::plain("i32") }))],
    );
    compile(&mut ctx, mid, &[u2d, d2i]);
    let u2d_f = exported(&ctx, mid, "u2d");
    let d2i_f = exported(&ctx, mid, "d2i");

    let u_inputs = [0u64, 1, 1 << 53, u64::MAX];
    let d_inputs = [0.0f64, -1.5, 2.9, 1e12, -1e12, f64::NAN, 3e9];

    let mut vm_u = Vec::new();
    let mut vm_d = Vec::new();
    {
        let mut vm = Vm::new(64 * 1024);
        for &x in &u_inputs {
            vm_u.push(vm.call(&ctx, u2d_f, &[x], None).unwrap());
        }
        for &x in &d_inputs {
            vm_d.push(vm.call(&ctx, d2i_f, &[f64::to_bits(x)], None).unwrap());
        }
    }

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    for (i, &x) in u_inputs.iter().enumerate() {
        assert_eq!(jit.call(&ctx, u2d_f, &[x], None).unwrap(), vm_u[i], "u64->f64 of {}", x);
    }
    for (i, &x) in d_inputs.iter().enumerate() {
        let got = jit.call(&ctx, d2i_f, &[f64::to_bits(x)], None).unwrap();
        assert_eq!(got as u32, vm_d[i] as u32, "f64->i32 of {}", x);
    }
}

// ---- scenario 2: host method dispatch ---------------------------------------

#[repr(C)]
struct Counter {
    v: i32,
}

extern "C" fn counter_set(this: *mut Counter, x: i32) {
    unsafe { (*this).v = x };
}

#[test]
fn test_native_host_method_and_field() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let i32_t = ctx.builtins.i32;
    let void_t = ctx.builtins.void;
    let mut b = HostTypeBinder::new(
        &mut ctx,
        &mut store,
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

    let mid = ctx.create_module("hosted");
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("o", n(NodeKind::New { ty: TypeSpec::plain("Counter"), args: vec![] })),
            expr_stmt(call(member(ident("o"), "setVal"), vec![int(7)])),
            ret(member(ident("o"), "v")),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    assert_eq!(jit.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap() as i64, 7);
}

// ---- scenario 3: overload resolution ----------------------------------------

extern "C" fn take_int(_: i32) -> i32 {
    1
}

extern "C" fn take_float(_: f32) -> i32 {
    2
}

#[test]
fn test_native_overload_dispatch() {
    let mut ctx = ExecutionContext::new();
    let mut store = BindingStore::new();
    let mid = ctx.create_module("overloads");

    let i32_t = ctx.builtins.i32;
    let f32_t = ctx.builtins.f32;
    bind_function(
        &mut ctx,
        &mut store,
        "f",
        take_int as usize,
        &[HostArg { tag: TypeTag::I32, type_id: i32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        Some(mid),
    );
    bind_function(
        &mut ctx,
        &mut store,
        "f",
        take_float as usize,
        &[HostArg { tag: TypeTag::F32, type_id: f32_t }],
        HostArg { tag: TypeTag::I32, type_id: i32_t },
        Some(mid),
    );

    let call_int = func("call_int", vec![], "i32", vec![ret(call(ident("f"), vec![int(1)]))]);
    let call_float = func(
        "call_float",
        vec![],
        "i32",
        vec![ret(call(ident("f"), vec![n(NodeKind::Literal(Literal::Float(1.0)))]))],
    );
    compile(&mut ctx, mid, &[call_int, call_float]);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    assert_eq!(jit.call(&ctx, exported(&ctx, mid, "call_int"), &[], None).unwrap(), 1);
    assert_eq!(jit.call(&ctx, exported(&ctx, mid, "call_float"), &[], None).unwrap(), 2);
}

// ---- scenario 4: cast operator ----------------------------------------------

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
fn test_native_cast_operator_invoked_once() {
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
    let main = func(
        "main",
        vec![],
        "i32",
        vec![
            var("c", n(NodeKind::New { ty: TypeSpec::plain("Celsius"), args: vec![] })),
            ret(bin(
                BinaryOp::Add,
                n(NodeKind::Cast { expr: Box::new(ident("c")), ty: TypeSpec::plain("i32") }),
                int(1),
            )),
        ],
    );
    compile(&mut ctx, mid, &[main]);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();

    CAST_CALLS.store(0, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(jit.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap() as i64, 42);
    assert_eq!(CAST_CALLS.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ---- scenario 5: closures ---------------------------------------------------

extern "C" fn closure_add(capture: *const u8, x: i32) -> i32 {
    let captured = unsafe { *(capture as *const i32) };
    captured + x
}

#[test]
fn test_native_closure_call() {
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
    let cb_type_name = {
        let sig_ty = ctx.funcs.get(target).unwrap().signature;
        ctx.types.get(sig_ty).unwrap().fqn.clone()
    };

    let mid = ctx.create_module("closures");
    let run_cb = func(
        "run_cb",
        vec![("cb", cb_type_name.as_str())],
        "i32",
        vec![ret(call(ident("cb"), vec![int(2)]))],
    );
    compile(&mut ctx, mid, &[run_cb]);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();

    let addr = Closure::new(target).capturing(40i32).into_raw();
    let got = jit.call(&ctx, exported(&ctx, mid, "run_cb"), &[addr], None).unwrap();
    assert_eq!(got as i64, 42);
    drop(unsafe { Closure::from_raw(addr) });
}

// ---- script-to-script calls -------------------------------------------------

#[test]
fn test_native_direct_script_call() {
    let mut ctx = ExecutionContext::new();
    let mid = ctx.create_module("calls");
    // fn twice(x: i32) -> i32 { return x * 2; }
    // fn main() -> i32 { return twice(20) + 2; }
    let twice = func(
        "twice",
        vec![("x", "i32")],
        "i32",
        vec![ret(bin(BinaryOp::Mul, ident("x"), int(2)))],
    );
    let main = func(
        "main",
        vec![],
        "i32",
        vec![ret(bin(BinaryOp::Add, call(ident("twice"), vec![int(20)]), int(2)))],
    );
    compile(&mut ctx, mid, &[twice, main]);

    let vm_result = {
        let mut vm = Vm::new(64 * 1024);
        vm.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap()
    };
    assert_eq!(vm_result as i64, 42);

    let mut jit = JitBackend::new().unwrap();
    jit.compile_module(&mut ctx, mid).unwrap();
    assert_eq!(jit.call(&ctx, exported(&ctx, mid, "main"), &[], None).unwrap(), vm_result);
}
