//! End-to-end middle-end tests: parse → compile → analyze → optimize →
//! allocate → persist.

use rustc_hash::FxHashMap;
use tern_compiler::compile::TemplateStore;
use tern_compiler::ir::{CodeHolder, Op};
use tern_compiler::persist::{self, ApiVersions};
use tern_compiler::{
    CompiledFunction, Compiler, CompilerOutput, OptimizationGroup, OptimizeContext,
    RegisterAllocator,
};
use tern_ffi::{AccessModifier, Bindings, FunctionRegistry, Module, TypeRegistry};
use tern_parser::{parse_module, Logger, ModuleSource, NodeArena, ParseContext};

struct Compiled {
    module: Module,
    output: CompilerOutput,
    types: TypeRegistry,
    funcs: FunctionRegistry,
    templates: TemplateStore,
    arena: NodeArena,
    log: Logger,
}

fn compile(text: &str) -> Compiled {
    compile_with(text, |_| {})
}

fn compile_with(text: &str, bind: impl FnOnce(&mut Bindings)) -> Compiled {
    let src = ModuleSource::new("test.tn", text);
    let mut log = Logger::new();

    let mut types = TypeRegistry::new();
    let mut funcs = FunctionRegistry::new();
    {
        let mut bindings = Bindings::new(&mut types, &mut funcs);
        bind(&mut bindings);
    }

    let type_names: Vec<String> = types.iter().map(|t| t.name.clone()).collect();
    let mut parsed = parse_module(&src, ParseContext::with_type_names(type_names), &mut log);

    let mut module = Module::new("test", "test.tn");
    let mut templates = TemplateStore::new();
    let output = Compiler::new(
        &mut parsed.arena,
        &mut types,
        &mut funcs,
        &mut module,
        &mut templates,
        &(),
        false,
        &mut log,
    )
    .compile(parsed.root);

    Compiled {
        module,
        output,
        types,
        funcs,
        templates,
        arena: parsed.arena,
        log,
    }
}

fn function<'a>(c: &'a Compiled, name: &str) -> &'a CompiledFunction {
    c.output
        .functions
        .iter()
        .find(|f| f.def.name == name)
        .unwrap_or_else(|| panic!("no function '{name}'"))
}

const ADD_SOURCE: &str = r#"
function add(a: i32, b: i32): i32 {
    return a + b;
}
"#;

#[test]
fn straight_line_function_compiles() {
    let c = compile(ADD_SOURCE);
    assert!(!c.log.has_errors(), "diagnostics: {:?}", c.log.messages());
    assert!(c.module.compiled);

    let add = function(&c, "add");
    assert_eq!(add.def.args.len(), 2);
    let ops: Vec<Op> = add.def.code.iter().map(|i| i.op).collect();
    assert!(ops.contains(&Op::IAdd));
    assert_eq!(*ops.last().unwrap(), Op::Ret);
}

#[test]
fn labels_are_unique_and_branches_resolve() {
    let c = compile(
        r#"
function count(n: i32): i32 {
    let total: i32 = 0;
    for (let i = 0; i < n; i = i + 1) {
        if (i % 2 == 0) {
            total = total + i;
        } else {
            total = total - 1;
        }
    }
    while (total > 100) {
        total = total - 10;
    }
    return total;
}
"#,
    );
    assert!(!c.log.has_errors(), "diagnostics: {:?}", c.log.messages());

    for f in &c.output.functions {
        let mut defined = FxHashMap::default();
        for instr in &f.def.code {
            if instr.op == Op::Label {
                let label = instr.primary_label().expect("label without id");
                *defined.entry(label).or_insert(0u32) += 1;
            }
        }
        for (&label, &count) in &defined {
            assert_eq!(count, 1, "label L{label} defined {count} times");
        }
        for instr in &f.def.code {
            if matches!(instr.op, Op::Jump | Op::Branch) {
                let target = instr.primary_label().expect("jump without target");
                assert!(defined.contains_key(&target), "undefined label L{target}");
            }
        }
    }
}

#[test]
fn liveness_and_cfg_are_coherent_after_rebuild() {
    let c = compile(
        r#"
function loopy(n: i32): i32 {
    let acc: i32 = 1;
    while (acc < n) {
        acc = acc * 2;
    }
    return acc;
}
"#,
    );
    assert!(!c.log.has_errors());

    let f = function(&c, "loopy");
    let mut holder = CodeHolder::new(f.def.code.clone());
    holder.rebuild_all(&c.types);

    // Every operand register is live where it appears
    for (addr, instr) in holder.code.iter().enumerate() {
        instr.for_each_reg(|reg| {
            assert!(
                holder.liveness.live_at(reg, addr),
                "r{reg} not live at {addr}:\n{}",
                holder.listing()
            );
        });
    }

    // Blocks cover [0, len) without overlap
    let mut covered = vec![false; holder.code.len()];
    for block in &holder.cfg.blocks {
        for addr in block.begin..block.end {
            assert!(!covered[addr], "block overlap at {addr}");
            covered[addr] = true;
        }
    }
    assert!(covered.iter().all(|&c| c), "blocks must cover all code");
}

#[test]
fn optimizer_reaches_fixpoint_and_folds() {
    let c = compile(
        r#"
function fixed(): i32 {
    let a: i32 = 2 + 3;
    let b: i32 = a * 4;
    return b;
}
"#,
    );
    assert!(!c.log.has_errors());

    let f = function(&c, "fixed");
    let mut holder = CodeHolder::new(f.def.code.clone());
    let mut log = Logger::new();
    let mut ctx = OptimizeContext {
        types: &c.types,
        log: &mut log,
        enabled: true,
    };
    OptimizationGroup::default_pipeline().process(&mut holder, &mut ctx);

    // The function reduces to a constant return
    let ret = holder
        .code
        .iter()
        .find(|i| i.op == Op::Ret)
        .expect("missing ret");
    let imm = ret
        .op1()
        .and_then(|v| v.imm_value())
        .and_then(|i| i.as_i64());
    assert_eq!(imm, Some(20), "listing:\n{}", holder.listing());

    // Idempotence: a second run changes nothing
    let listing = holder.listing();
    OptimizationGroup::default_pipeline().process(&mut holder, &mut ctx);
    assert_eq!(holder.listing(), listing);
}

#[test]
fn stack_object_gets_ctor_and_dtor_in_order() {
    struct Probe;

    let c = compile_with(
        r#"
function scoped(): i32 {
    let x = new Probe();
    return 1;
}
"#,
        |b| {
            b.bind_type::<Probe>("Probe")
                .unwrap()
                .with_constructor(|| Probe)
                .unwrap()
                .with_default_destructor()
                .unwrap()
                .finish()
                .unwrap();
        },
    );
    assert!(!c.log.has_errors(), "diagnostics: {:?}", c.log.messages());

    let f = function(&c, "scoped");
    let probe = c.types.by_fqn("Probe").unwrap();
    let ctor = probe.methods[0];
    let dtor = probe.destructor.unwrap();

    let calls: Vec<_> = f
        .def
        .code
        .iter()
        .filter(|i| i.op == Op::Call)
        .filter_map(|i| i.op1().and_then(|v| v.imm_value()))
        .filter_map(|imm| match imm {
            tern_compiler::Immediate::Func(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 2, "exactly one ctor and one dtor call");
    assert_eq!(calls[0], ctor);
    assert_eq!(calls[1], dtor);

    let alloc_at = f.def.code.iter().position(|i| i.op == Op::StackAlloc).unwrap();
    let free_at = f.def.code.iter().position(|i| i.op == Op::StackFree).unwrap();
    assert!(alloc_at < free_at);
}

#[test]
fn overload_resolution_picks_exact_and_rejects_ambiguous() {
    let bind = |b: &mut Bindings| {
        b.bind_function("f", AccessModifier::Public, |_: i32| ()).unwrap();
        b.bind_function("f", AccessModifier::Public, |_: f32| ()).unwrap();
    };

    let ok = compile_with("function a(): void { f(1); f(1.5f); }", bind);
    assert!(!ok.log.has_errors(), "diagnostics: {:?}", ok.log.messages());

    let ambiguous = compile_with("function a(): void { f(true); }", bind);
    assert!(ambiguous.log.has_errors());
    let rendered = format!("{:?}", ambiguous.log.messages());
    assert!(rendered.contains("ambiguous"), "got: {rendered}");
}

#[test]
fn compile_errors_do_not_abort_the_module_walk() {
    let c = compile(
        r#"
function broken(): i32 {
    return missing_symbol;
}

function fine(): i32 {
    return 7;
}
"#,
    );
    assert!(c.log.has_errors());
    assert!(!c.module.compiled);
    // The healthy function still compiled
    let fine = function(&c, "fine");
    assert!(fine.def.code.iter().any(|i| i.op == Op::Ret));
}

#[test]
fn register_allocation_bounds_register_ids() {
    let c = compile(
        r#"
function busy(a: i32, b: i32): i32 {
    let c1: i32 = a + b;
    let c2: i32 = a - b;
    let c3: i32 = a * b;
    let c4: i32 = c1 + c2;
    return c4 + c3;
}
"#,
    );
    assert!(!c.log.has_errors());

    let f = function(&c, "busy");
    let mut holder = CodeHolder::new(f.def.code.clone());
    let result = RegisterAllocator::new(4, 0).process(&mut holder, &c.types);

    let scratch_limit = 4 + tern_compiler::regalloc::SPILL_SCRATCH_COUNT;
    for instr in &holder.code {
        instr.for_each_reg(|r| assert!(r < scratch_limit, "r{r} exceeds the bank"));
    }
    // Spilled values load before use
    if result.spill_count > 0 {
        assert!(holder.code.iter().any(|i| i.op == Op::Load));
    }
}

#[test]
fn persisted_module_round_trips() {
    let c = compile(ADD_SOURCE);
    assert!(!c.log.has_errors());

    let versions = ApiVersions {
        api_version: 1,
        builtin_api_version: 1,
    };
    let image = persist::write_module(
        &c.module,
        &c.output.functions,
        &c.types,
        &c.templates,
        &c.arena,
        versions,
    );

    let mut types = TypeRegistry::new();
    let mut funcs = FunctionRegistry::new();
    let mut templates = TemplateStore::new();
    let mut arena = NodeArena::new();
    let (module, functions) =
        persist::read_module(&image, &mut types, &mut funcs, &mut templates, &mut arena, versions)
            .expect("restore");

    assert_eq!(module.name, c.module.name);
    assert_eq!(functions.len(), c.output.functions.len());
    let original = function(&c, "add");
    let restored = functions.iter().find(|f| f.def.name == "add").unwrap();
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.def.code.len(), original.def.code.len());
    for (a, b) in restored.def.code.iter().zip(&original.def.code) {
        assert_eq!(a.op, b.op);
        assert_eq!(a.src, b.src);
    }

    // Version mismatch invalidates the cache
    let stale = ApiVersions {
        api_version: 2,
        builtin_api_version: 1,
    };
    let err = persist::read_module(
        &image,
        &mut TypeRegistry::new(),
        &mut FunctionRegistry::new(),
        &mut TemplateStore::new(),
        &mut NodeArena::new(),
        stale,
    )
    .unwrap_err();
    assert!(err.invalidates_cache());
}

#[test]
fn class_with_template_instantiates_on_use() {
    let c = compile(
        r#"
class Box<T> {
    value: T;

    constructor(v: T) {
        this.value = v;
    }

    get(): T {
        return this.value;
    }
}

function use_box(): i32 {
    let b: Box<i32> = new Box<i32>(41);
    return b.get() + 1;
}
"#,
    );
    assert!(!c.log.has_errors(), "diagnostics: {:?}", c.log.messages());
    assert!(c.types.by_fqn("test::Box<i32>").is_some());
    // The instantiated methods were compiled
    assert!(c
        .output
        .functions
        .iter()
        .any(|f| f.def.fully_qualified_name.contains("Box<i32>")));
}
