//! Whole-pipeline tests: source in, VM execution out, host bindings in both
//! directions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tern_engine::{Config, Context, EngineError};
use tern_ffi::{AccessModifier, FfiPrimitive};
use tern_parser::SourceLocation;

fn context() -> Context {
    Context::new(Config::default())
}

/// Arithmetic and return.
#[test]
fn add_two_numbers() {
    let mut ctx = context();
    ctx.compile_module(
        "main.tn",
        r#"
function add(a: i32, b: i32): i32 {
    return a + b;
}
"#,
    )
    .expect("compile");

    let add = ctx.find_function("main.tn", "add").expect("function");
    let result: i32 = ctx
        .call(add, &[2i32.to_word(), 40i32.to_word()])
        .expect("call");
    assert_eq!(result, 42);
}

/// A scoped stack object runs its constructor and destructor exactly
/// once, in order.
#[test]
fn stack_object_lifecycle() {
    #[derive(Clone, Copy)]
    struct Tracked {
        tag: u32,
    }

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut ctx = context();
    {
        let ctor_events = events.clone();
        let dtor_events = events.clone();
        let mut b = ctx.bindings();
        b.bind_type::<Tracked>("Tracked")
            .unwrap()
            .with_constructor(move || {
                ctor_events.lock().unwrap().push("ctor");
                Tracked { tag: 7 }
            })
            .unwrap()
            .with_destructor(move |t: &mut Tracked| {
                assert_eq!(t.tag, 7, "destructor sees the constructed object");
                dtor_events.lock().unwrap().push("dtor");
            })
            .unwrap()
            .finish()
            .unwrap();
    }

    ctx.compile_module(
        "main.tn",
        r#"
function scoped(): i32 {
    let x = new Tracked();
    return 1;
}
"#,
    )
    .expect("compile");

    let scoped = ctx.find_function("main.tn", "scoped").unwrap();
    let result: i32 = ctx.call(scoped, &[]).expect("call");
    assert_eq!(result, 1);
    assert_eq!(events.lock().unwrap().as_slice(), ["ctor", "dtor"]);
}

/// Overload resolution picks exact matches and reports ambiguity.
#[test]
fn overloads_resolve_and_ambiguity_is_reported() {
    let picks: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut ctx = context();
    {
        let int_picks = picks.clone();
        let float_picks = picks.clone();
        let mut b = ctx.bindings();
        b.bind_function("f", AccessModifier::Public, move |_: i32| {
            int_picks.lock().unwrap().push("i32");
        })
        .unwrap();
        b.bind_function("f", AccessModifier::Public, move |_: f32| {
            float_picks.lock().unwrap().push("f32");
        })
        .unwrap();
    }

    ctx.compile_module(
        "ok.tn",
        r#"
function go(): i32 {
    f(1);
    f(1.5f);
    return 0;
}
"#,
    )
    .expect("compile");
    let go = ctx.find_function("ok.tn", "go").unwrap();
    let _: i32 = ctx.call(go, &[]).unwrap();
    assert_eq!(picks.lock().unwrap().as_slice(), ["i32", "f32"]);

    let err = ctx
        .compile_module("bad.tn", "function nope(): void { f(true); }")
        .unwrap_err();
    assert!(matches!(err, EngineError::CompileFailed(_, _)));
    assert!(ctx
        .messages()
        .iter()
        .any(|m| m.message.contains("ambiguous")));
}

/// Control flow: loops, branches, locals.
#[test]
fn loops_and_branches_execute() {
    let mut ctx = context();
    ctx.compile_module(
        "main.tn",
        r#"
function sum_even(n: i32): i32 {
    let total: i32 = 0;
    for (let i = 0; i < n; i = i + 1) {
        if (i % 2 == 0) {
            total = total + i;
        }
    }
    return total;
}

function collatz_steps(n0: i32): i32 {
    let n: i32 = n0;
    let steps: i32 = 0;
    while (n != 1) {
        if (n % 2 == 0) {
            n = n / 2;
        } else {
            n = 3 * n + 1;
        }
        steps = steps + 1;
    }
    return steps;
}
"#,
    )
    .expect("compile");

    let sum_even = ctx.find_function("main.tn", "sum_even").unwrap();
    let result: i32 = ctx.call(sum_even, &[10i32.to_word()]).unwrap();
    assert_eq!(result, 2 + 4 + 6 + 8);

    let collatz = ctx.find_function("main.tn", "collatz_steps").unwrap();
    let result: i32 = ctx.call(collatz, &[6i32.to_word()]).unwrap();
    assert_eq!(result, 8);
}

/// Script-to-script calls and recursion.
#[test]
fn script_calls_script() {
    let mut ctx = context();
    ctx.compile_module(
        "main.tn",
        r#"
function fib(n: i32): i32 {
    if (n < 2) {
        return n;
    }
    return fib(n - 1) + fib(n - 2);
}

function main(): i32 {
    return fib(10);
}
"#,
    )
    .expect("compile");

    let main = ctx.find_function("main.tn", "main").unwrap();
    let result: i32 = ctx.call(main, &[]).unwrap();
    assert_eq!(result, 55);
}

/// Module data and imports across modules.
#[test]
fn imports_and_module_data() {
    let mut ctx = context();
    ctx.compile_module(
        "a.tn",
        r#"
export let base: i32 = 10;

export function twice(x: i32): i32 {
    return x * 2;
}
"#,
    )
    .expect("compile a");

    ctx.compile_module(
        "b.tn",
        r#"
import { twice, base } from 'a.tn';

function go(): i32 {
    return twice(base) + 1;
}
"#,
    )
    .expect("compile b");

    let go = ctx.find_function("b.tn", "go").unwrap();
    let result: i32 = ctx.call(go, &[]).unwrap();
    assert_eq!(result, 21);
}

/// A host function raising an exception unwinds the script call; the
/// host observes the message and the captured call stack.
#[test]
fn host_exception_unwinds() {
    let raise_src = SourceLocation {
        offset: 0,
        length: 4,
        line: 12,
        column: 3,
        end_line: 12,
        end_column: 7,
    };

    let mut ctx = context();
    {
        let mut b = ctx.bindings();
        b.bind_function("boom", AccessModifier::Public, move || {
            tern_ffi::raise_exception("bad", raise_src);
        })
        .unwrap();
    }

    ctx.compile_module(
        "main.tn",
        r#"
function trigger(): i32 {
    boom();
    return 1;
}
"#,
    )
    .expect("compile");

    let trigger = ctx.find_function("main.tn", "trigger").unwrap();
    let err = ctx.call::<i32>(trigger, &[]).unwrap_err();
    match err {
        EngineError::Exception {
            message,
            call_stack,
        } => {
            assert_eq!(message, "bad");
            assert_eq!(call_stack.first(), Some(&raise_src), "innermost frame");
            assert!(call_stack.len() >= 2, "script call site is captured");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

/// Primitive values round-trip host → script → host bitwise.
#[test]
fn ffi_round_trip_is_bitwise() {
    let mut ctx = context();
    ctx.compile_module(
        "main.tn",
        r#"
function id_i32(x: i32): i32 { return x; }
function id_u64(x: u64): u64 { return x; }
function id_f32(x: f32): f32 { return x; }
function id_f64(x: f64): f64 { return x; }
function id_bool(x: bool): bool { return x; }
"#,
    )
    .expect("compile");

    let id_i32 = ctx.find_function("main.tn", "id_i32").unwrap();
    for v in [0i32, -1, i32::MIN, i32::MAX, 123456789] {
        let r: i32 = ctx.call(id_i32, &[v.to_word()]).unwrap();
        assert_eq!(r, v);
    }

    let id_u64 = ctx.find_function("main.tn", "id_u64").unwrap();
    for v in [0u64, u64::MAX, 0xDEAD_BEEF_CAFE_F00D] {
        let r: u64 = ctx.call(id_u64, &[v.to_word()]).unwrap();
        assert_eq!(r, v);
    }

    // NaN payloads must survive
    let id_f32 = ctx.find_function("main.tn", "id_f32").unwrap();
    for bits in [0x7fc0_1234u32, 1.5f32.to_bits(), (-0.0f32).to_bits()] {
        let v = f32::from_bits(bits);
        let r: f32 = ctx.call(id_f32, &[v.to_word()]).unwrap();
        assert_eq!(r.to_bits(), bits);
    }

    let id_f64 = ctx.find_function("main.tn", "id_f64").unwrap();
    for bits in [0x7ff8_0000_dead_beefu64, 2.25f64.to_bits()] {
        let v = f64::from_bits(bits);
        let r: f64 = ctx.call(id_f64, &[v.to_word()]).unwrap();
        assert_eq!(r.to_bits(), bits);
    }

    let id_bool = ctx.find_function("main.tn", "id_bool").unwrap();
    let r: bool = ctx.call(id_bool, &[true.to_word()]).unwrap();
    assert!(r);
}

/// Identical inputs produce identical outputs, run after run and
/// context after context.
#[test]
fn execution_is_deterministic() {
    const SOURCE: &str = r#"
function mix(a: i32, b: i32): i32 {
    let x: i32 = a * 31 + b;
    let y: i32 = x ^ (x << 3);
    return y - (y >> 2);
}
"#;

    let mut first = Vec::new();
    for _ in 0..2 {
        let mut ctx = context();
        ctx.compile_module("main.tn", SOURCE).expect("compile");
        let mix = ctx.find_function("main.tn", "mix").unwrap();
        let mut outputs = Vec::new();
        for (a, b) in [(1, 2), (100, -7), (i32::MAX, 1), (-50, 50)] {
            // Two calls per input must agree as well
            let r1: i32 = ctx.call(mix, &[a.to_word(), b.to_word()]).unwrap();
            let r2: i32 = ctx.call(mix, &[a.to_word(), b.to_word()]).unwrap();
            assert_eq!(r1, r2);
            outputs.push(r1);
        }
        if first.is_empty() {
            first = outputs;
        } else {
            assert_eq!(first, outputs);
        }
    }
}

/// `disableExecution` turns script calls into no-ops.
#[test]
fn disabled_execution_short_circuits() {
    let mut ctx = Context::new(Config {
        disable_execution: true,
        ..Config::default()
    });
    ctx.compile_module(
        "main.tn",
        "function answer(): i32 { return 42; }",
    )
    .expect("compile");

    let answer = ctx.find_function("main.tn", "answer").unwrap();
    let result: i32 = ctx.call(answer, &[]).unwrap();
    assert_eq!(result, 0, "short-circuited call returns the zero value");
}

/// Persistence: a compiled module saved to disk restores into a fresh
/// context and executes identically.
#[test]
fn persisted_module_executes_after_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        support_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    let source = r#"
function square(x: i32): i32 {
    return x * x;
}
"#;

    let mut ctx = Context::new(config.clone());
    ctx.compile_module("main.tn", source).expect("compile");
    let square = ctx.find_function("main.tn", "square").unwrap();
    let direct: i32 = ctx.call(square, &[12i32.to_word()]).unwrap();
    assert_eq!(direct, 144);
    ctx.save_module_to_disk("main.tn").expect("save");

    let mut restored = Context::new(config);
    restored.load_module_from_disk("main.tn").expect("load");
    let square = restored.find_function("main.tn", "square").unwrap();
    let result: i32 = restored.call(square, &[12i32.to_word()]).unwrap();
    assert_eq!(result, direct);
}

/// Bound properties and methods are reachable from scripts.
#[test]
fn host_object_methods_and_properties() {
    #[repr(C)]
    struct Counter {
        value: i32,
        step: i32,
    }

    let mut ctx = context();
    {
        let mut b = ctx.bindings();
        b.bind_type::<Counter>("Counter")
            .unwrap()
            .with_constructor(|start: i32, step: i32| Counter { value: start, step })
            .unwrap()
            .with_method("bump", |c: &mut Counter| {
                c.value += c.step;
                c.value
            })
            .unwrap()
            .with_property::<i32>("value", 0)
            .unwrap()
            .with_default_destructor()
            .unwrap()
            .finish()
            .unwrap();
    }

    ctx.compile_module(
        "main.tn",
        r#"
function drive(): i32 {
    let c = new Counter(10, 5);
    c.bump();
    c.bump();
    return c.value;
}
"#,
    )
    .expect("compile");

    let drive = ctx.find_function("main.tn", "drive").unwrap();
    let result: i32 = ctx.call(drive, &[]).unwrap();
    assert_eq!(result, 20);
}
