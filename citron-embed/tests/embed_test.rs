// citron-embed - Engine integration tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use citron_core::NativeFlags;
use citron_core::OpcodeType;
use citron_embed::{Engine, UpdateHook};
use citron_parser::fnv1a_64;
use citron_vm::{CompileOptions, MemoryFileSystem};

fn compile(engine: &mut Engine, source: &str) {
    let fs = MemoryFileSystem::with(&[("main.lemon", source)]);
    engine
        .compile_script_with_file_system("main.lemon", &fs)
        .unwrap_or_else(|e| panic!("compile failed: {}", e));
}

fn run(source: &str, entry: &str) -> i64 {
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine
        .call_function(entry, &[])
        .expect("call failed")
        .expect("expected a return value") as i64
}

#[test]
fn test_constant_arithmetic_precedence() {
    let source = "function u8 f()\n{\n\treturn 2 + 3 * 4\n}\n";
    assert_eq!(run(source, "f"), 14);
}

#[test]
fn test_signed_subtraction() {
    let source = "function s16 g(s16 a, s16 b)\n{\n\treturn a - b\n}\n";
    let mut engine = Engine::new();
    compile(&mut engine, source);
    let result = engine.call_function("g", &[10, 3]).unwrap().unwrap();
    assert_eq!(result as i64, 7);
    let result = engine.call_function("g", &[3, 10]).unwrap().unwrap();
    assert_eq!(result as i64, -7);
}

#[test]
fn test_define_expansion() {
    let source = "define N = 5\nfunction u32 h()\n{\n\treturn N * N\n}\n";
    assert_eq!(run(source, "h"), 25);
}

#[test]
fn test_define_without_assign() {
    let source = "define N 5\nfunction u32 h()\n{\n\treturn N * N\n}\n";
    assert_eq!(run(source, "h"), 25);
}

#[test]
fn test_string_concat_compound_assign() {
    let source = concat!(
        "global string s\n",
        "function void t()\n",
        "{\n",
        "\ts = \"foo\"\n",
        "\ts += \"bar\"\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_function("t", &[]).unwrap();
    assert_eq!(
        engine.get_global_as_string("s").unwrap().as_deref(),
        Some("foobar")
    );
}

#[test]
fn test_string_plus_integer() {
    let source = concat!(
        "global string s\n",
        "function void t()\n",
        "{\n",
        "\ts = \"frame \" + 7\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_function("t", &[]).unwrap();
    assert_eq!(
        engine.get_global_as_string("s").unwrap().as_deref(),
        Some("frame 7")
    );
}

#[test]
fn test_include_with_constant() {
    let fs = MemoryFileSystem::with(&[
        (
            "main.lemon",
            "include sub/part\nfunction u32 top()\n{\n\treturn K + 1\n}\n",
        ),
        ("sub/part.lemon", "constant u32 K = 42\n"),
    ]);
    let mut engine = Engine::new();
    engine
        .compile_script_with_file_system("main.lemon", &fs)
        .unwrap();
    assert_eq!(engine.call_function("top", &[]).unwrap().unwrap(), 43);

    // Change the constant and recompile: the new value flows through
    let fs = MemoryFileSystem::with(&[
        (
            "main.lemon",
            "include sub/part\nfunction u32 top()\n{\n\treturn K + 1\n}\n",
        ),
        ("sub/part.lemon", "constant u32 K = 43\n"),
    ]);
    engine.reload_scripts(&fs).unwrap();
    assert_eq!(engine.call_function("top", &[]).unwrap().unwrap(), 44);
}

#[test]
fn test_compile_time_constant_native_folds_to_push() {
    let mut engine = Engine::new();
    engine.register_native_with_flags(
        "host_add",
        |a: u32, b: u32| -> u32 { a + b },
        NativeFlags {
            allow_inline_execution: true,
            compile_time_constant: true,
        },
    );
    compile(
        &mut engine,
        "function u32 k()\n{\n\treturn host_add(7, 8)\n}\n",
    );

    let functions = engine
        .runtime()
        .program()
        .functions_by_name(fnv1a_64(b"k"));
    let function = match &functions[0] {
        citron_core::FunctionHandle::Script(script) => script.borrow(),
        _ => panic!("expected script function"),
    };
    // The call folded away: one push of 15, no Call opcode
    assert!(
        function.opcodes.iter().all(|op| op.op != OpcodeType::Call),
        "call survived folding: {:?}",
        function.opcodes
    );
    let pushes: Vec<_> = function
        .opcodes
        .iter()
        .filter(|op| op.op == OpcodeType::PushConstant)
        .collect();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].param, 15);
    drop(function);

    assert_eq!(engine.call_function("k", &[]).unwrap().unwrap(), 15);
}

#[test]
fn test_native_function_call_at_runtime() {
    let mut engine = Engine::new();
    engine.register_native("twice", |value: u32| -> u32 { value * 2 });
    compile(
        &mut engine,
        "function u32 f(u32 x)\n{\n\treturn twice(x) + 1\n}\n",
    );
    assert_eq!(engine.call_function("f", &[21]).unwrap().unwrap(), 43);
}

#[test]
fn test_overload_selection_prefers_exact_types() {
    let mut engine = Engine::new();
    engine.register_native("pick", |_value: u8| -> u32 { 1 });
    engine.register_native("pick", |_value: u32| -> u32 { 2 });
    compile(
        &mut engine,
        concat!(
            "function u32 narrow()\n{\n\tu8 v = 5\n\treturn pick(v)\n}\n",
            "function u32 wide()\n{\n\tu32 v = 5\n\treturn pick(v)\n}\n",
        ),
    );
    assert_eq!(engine.call_function("narrow", &[]).unwrap().unwrap(), 1);
    assert_eq!(engine.call_function("wide", &[]).unwrap().unwrap(), 2);
}

#[test]
fn test_builtin_min_max() {
    let source = "function s64 f(s64 a, s64 b)\n{\n\treturn min(a, b) + max(a, b)\n}\n";
    let mut engine = Engine::new();
    compile(&mut engine, source);
    let result = engine
        .call_function("f", &[(-3i64) as u64, 10])
        .unwrap()
        .unwrap();
    assert_eq!(result as i64, 7);
}

#[test]
fn test_control_flow_loops() {
    let source = concat!(
        "function u32 sum(u32 n)\n",
        "{\n",
        "\tu32 total = 0\n",
        "\tfor (u32 i = 1; i <= n; ++i)\n",
        "\t{\n",
        "\t\ttotal += i\n",
        "\t}\n",
        "\treturn total\n",
        "}\n",
        "function u32 evens(u32 n)\n",
        "{\n",
        "\tu32 count = 0\n",
        "\tu32 i = 0\n",
        "\twhile (i < n)\n",
        "\t{\n",
        "\t\t++i\n",
        "\t\tif (i % 2 != 0)\n",
        "\t\t\tcontinue\n",
        "\t\tcount += 1\n",
        "\t\tif (count >= 100)\n",
        "\t\t\tbreak\n",
        "\t}\n",
        "\treturn count\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(engine.call_function("sum", &[10]).unwrap().unwrap(), 55);
    assert_eq!(engine.call_function("evens", &[9]).unwrap().unwrap(), 4);
}

#[test]
fn test_if_else_chains() {
    let source = concat!(
        "function u32 grade(u32 score)\n",
        "{\n",
        "\tif (score >= 90)\n",
        "\t\treturn 1\n",
        "\telse if (score >= 50)\n",
        "\t\treturn 2\n",
        "\telse\n",
        "\t\treturn 3\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(engine.call_function("grade", &[95]).unwrap().unwrap(), 1);
    assert_eq!(engine.call_function("grade", &[60]).unwrap().unwrap(), 2);
    assert_eq!(engine.call_function("grade", &[10]).unwrap().unwrap(), 3);
}

#[test]
fn test_ternary_and_logical_operators() {
    let source = concat!(
        "function u32 f(u32 a, u32 b)\n",
        "{\n",
        "\treturn (a > 2 && b > 2) ? a : b\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(engine.call_function("f", &[5, 9]).unwrap().unwrap(), 5);
    assert_eq!(engine.call_function("f", &[1, 9]).unwrap().unwrap(), 9);
}

#[test]
fn test_constant_array_access_and_length() {
    let source = concat!(
        "constant array<u16> table = { 10, 20, 30 }\n",
        "function u32 f(u32 i)\n",
        "{\n",
        "\treturn table[i] + table.length()\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(engine.call_function("f", &[1]).unwrap().unwrap(), 23);
}

#[test]
fn test_memory_access() {
    let source = concat!(
        "function void store(u32 address, u16 value)\n",
        "{\n",
        "\tu16[address] = value\n",
        "}\n",
        "function u16 load(u32 address)\n",
        "{\n",
        "\treturn u16[address]\n",
        "}\n",
        "function void bump(u32 address)\n",
        "{\n",
        "\tu16[address] += 5\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_function("store", &[0x100, 0x1234]).unwrap();
    assert_eq!(
        engine.call_function("load", &[0x100]).unwrap().unwrap(),
        0x1234
    );
    engine.call_function("bump", &[0x100]).unwrap();
    assert_eq!(
        engine.call_function("load", &[0x100]).unwrap().unwrap(),
        0x1239
    );
}

#[test]
fn test_address_hook_matches_direct_call() {
    let source = concat!(
        "global u32 counter\n",
        "//# address-hook(0x00123456)\n",
        "function void tick()\n",
        "{\n",
        "\tcounter += 1\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);

    engine.call_function("tick", &[]).unwrap();
    assert_eq!(engine.get_global_value("counter").unwrap(), 1);

    assert!(engine.call_address_hook(0x0012_3456).unwrap());
    assert_eq!(engine.get_global_value("counter").unwrap(), 2);

    // Unknown addresses are a silent no-op
    assert!(!engine.call_address_hook(0x000f_ffff).unwrap());
    assert_eq!(engine.get_global_value("counter").unwrap(), 2);
}

#[test]
fn test_addressof_and_make_callable() {
    let source = concat!(
        "global u32 counter\n",
        "//# address-hook(0x00002000)\n",
        "function void tick()\n",
        "{\n",
        "\tcounter += 1\n",
        "}\n",
        "function u32 hook_address()\n",
        "{\n",
        "\treturn addressof(tick)\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(
        engine.call_function("hook_address", &[]).unwrap().unwrap(),
        0x2000
    );

    let callable = engine.make_callable("tick").unwrap();
    assert_eq!(callable >> 28, 1);
    assert!(engine.call_address_hook(callable).unwrap());
    assert_eq!(engine.get_global_value("counter").unwrap(), 1);
}

#[test]
fn test_external_call_transfers_through_hook() {
    let source = concat!(
        "global u32 counter\n",
        "//# address-hook(0x00004000)\n",
        "function void tick()\n",
        "{\n",
        "\tcounter += 10\n",
        "}\n",
        "function void trampoline()\n",
        "{\n",
        "\tcall 0x00004000\n",
        "\tcounter += 1\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_function("trampoline", &[]).unwrap();
    assert_eq!(engine.get_global_value("counter").unwrap(), 11);
}

#[test]
fn test_base_call_without_base_yields_default() {
    let source = concat!(
        "function u8 v()\n",
        "{\n",
        "\treturn base.v() + 1\n",
        "}\n",
    );
    assert_eq!(run(source, "v"), 1);
}

#[test]
fn test_labels_and_jumps() {
    let source = concat!(
        "global u32 value\n",
        "function void f()\n",
        "{\n",
        "\tvalue = 1\n",
        "\tjump @end\n",
        "\tvalue = 2\n",
        "\t@end:\n",
        "\tvalue += 10\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_function("f", &[]).unwrap();
    assert_eq!(engine.get_global_value("value").unwrap(), 11);
}

#[test]
fn test_call_function_at_label() {
    let source = concat!(
        "global u32 value\n",
        "function void f()\n",
        "{\n",
        "\tvalue += 1\n",
        "\t@late:\n",
        "\tvalue += 10\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert!(engine.call_function_at_label("f", "@late").unwrap());
    assert_eq!(engine.get_global_value("value").unwrap(), 10);
}

#[test]
fn test_update_hooks() {
    let source = concat!(
        "global u32 frames\n",
        "//# update-hook(pre)\n",
        "function void on_frame()\n",
        "{\n",
        "\tframes += 1\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    engine.call_update_hooks(UpdateHook::PreFrame).unwrap();
    engine.call_update_hooks(UpdateHook::PreFrame).unwrap();
    engine.call_update_hooks(UpdateHook::PostFrame).unwrap();
    assert_eq!(engine.get_global_value("frames").unwrap(), 2);
}

#[test]
fn test_yield_and_resume() {
    let source = concat!(
        "global u32 phase\n",
        "function void f()\n",
        "{\n",
        "\tphase = 1\n",
        "\tyieldExecution()\n",
        "\tphase = 2\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);

    // The call yields mid-function
    assert!(engine.call_function("f", &[]).unwrap().is_none());
    assert_eq!(engine.get_global_value("phase").unwrap(), 1);

    // Resuming continues from the same program counter
    engine.resume().unwrap();
    assert_eq!(engine.get_global_value("phase").unwrap(), 2);
}

#[test]
fn test_snapshot_roundtrip_mid_execution() {
    let source = concat!(
        "global u32 phase\n",
        "function void f()\n",
        "{\n",
        "\tphase = 1\n",
        "\tyieldExecution()\n",
        "\tphase = phase + 41\n",
        "}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);

    engine.call_function("f", &[]).unwrap();
    assert_eq!(engine.get_global_value("phase").unwrap(), 1);
    let snapshot = engine.save_state();

    engine.resume().unwrap();
    assert_eq!(engine.get_global_value("phase").unwrap(), 42);

    // Restore to the yield point and run again: same observable behavior
    engine.restore_state(&snapshot).unwrap();
    assert_eq!(engine.get_global_value("phase").unwrap(), 1);
    engine.resume().unwrap();
    assert_eq!(engine.get_global_value("phase").unwrap(), 42);
}

#[test]
fn test_hot_reload_preserves_globals() {
    let fs = MemoryFileSystem::with(&[(
        "main.lemon",
        "global u32 lives = 3\nfunction void hit()\n{\n\tlives -= 1\n}\n",
    )]);
    let mut engine = Engine::new();
    engine
        .compile_script_with_file_system("main.lemon", &fs)
        .unwrap();
    engine.call_function("hit", &[]).unwrap();
    assert_eq!(engine.get_global_value("lives").unwrap(), 2);

    // Reload a changed script: the global keeps its value
    let fs = MemoryFileSystem::with(&[(
        "main.lemon",
        "global u32 lives = 3\nfunction void hit()\n{\n\tlives -= 2\n}\n",
    )]);
    engine.reload_scripts(&fs).unwrap();
    assert_eq!(engine.get_global_value("lives").unwrap(), 2);
    engine.call_function("hit", &[]).unwrap();
    assert_eq!(engine.get_global_value("lives").unwrap(), 0);
}

#[test]
fn test_serialized_module_roundtrip() {
    let source = "function u8 f()\n{\n\treturn 2 + 3 * 4\n}\n";
    let mut engine = Engine::new();
    compile(&mut engine, source);
    let bytes = engine.serialize_script_module().unwrap();

    let mut second = Engine::new();
    second.install_serialized_module(&bytes).unwrap();
    assert_eq!(second.call_function("f", &[]).unwrap().unwrap(), 14);
}

#[test]
fn test_serialized_module_rejects_changed_dependencies() {
    let source = "function u8 f()\n{\n\treturn 1\n}\n";
    let mut engine = Engine::new();
    compile(&mut engine, source);
    let bytes = engine.serialize_script_module().unwrap();

    // An engine with a different native catalog must reject the module
    let mut second = Engine::new();
    second.register_native("extra", || -> u32 { 0 });
    assert!(second.install_serialized_module(&bytes).is_err());
}

#[test]
fn test_custom_type_method_call() {
    let mut engine = Engine::new();
    engine.register_data_type("Handle", citron_parser::BaseType::UInt32);
    engine.register_native_method("Handle", "doubled", |raw: u32| -> u32 { raw * 2 });
    compile(
        &mut engine,
        concat!(
            "function u32 m(u32 raw)\n",
            "{\n",
            "\tHandle h = Handle(raw)\n",
            "\treturn h.doubled()\n",
            "}\n",
        ),
    );
    assert_eq!(engine.call_function("m", &[21]).unwrap().unwrap(), 42);
}

#[test]
fn test_external_variable_shared_with_host() {
    let mut engine = Engine::new();
    let cell = engine.register_external_variable("vblank", citron_parser::DataType::U32);
    compile(
        &mut engine,
        "function u32 f()\n{\n\treturn vblank + 1\n}\n",
    );
    cell.set(59);
    assert_eq!(engine.call_function("f", &[]).unwrap().unwrap(), 60);
}

#[test]
fn test_call_stack_walk_from_native() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let captured: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let mut engine = Engine::new();
    compile(
        &mut engine,
        concat!(
            "function void inner()\n{\n\tyieldExecution()\n}\n",
            "function void outer()\n{\n\tinner()\n}\n",
        ),
    );
    engine.call_function("outer", &[]).unwrap();
    // Yielded inside inner(): both frames are live
    let stack = engine.walk_call_stack();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].function_name.as_str(), "outer");
    assert_eq!(stack[1].function_name.as_str(), "inner");
    *captured.borrow_mut() = stack.len();
    engine.resume().unwrap();
    assert!(engine.walk_call_stack().is_empty());
}

#[test]
fn test_compile_error_reports_file_and_line() {
    let fs = MemoryFileSystem::with(&[(
        "main.lemon",
        "function void f()\n{\n\treturn unknown_name\n}\n",
    )]);
    let mut engine = Engine::new();
    let error = engine
        .compile_script_with_file_system("main.lemon", &fs)
        .unwrap_err();
    match error {
        citron_embed::EngineError::Compile(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].filename, "main.lemon");
            assert_eq!(errors[0].line, 3);
            assert!(errors[0].text.contains("unknown_name"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_preprocessor_selects_branch() {
    let source = concat!(
        "#define HARD_MODE = 1\n",
        "function u32 f()\n",
        "{\n",
        "#if HARD_MODE\n",
        "\treturn 2\n",
        "#else\n",
        "\treturn 1\n",
        "#endif\n",
        "}\n",
    );
    assert_eq!(run(source, "f"), 2);
}

#[test]
fn test_explicit_casts_truncate_and_extend() {
    let source = concat!(
        "function u8 low(u32 value)\n{\n\treturn u8(value)\n}\n",
        "function s32 widen(s8 value)\n{\n\treturn s32(value)\n}\n",
    );
    let mut engine = Engine::new();
    compile(&mut engine, source);
    assert_eq!(engine.call_function("low", &[0x1234]).unwrap().unwrap(), 0x34);
    let widened = engine.call_function("widen", &[0xff]).unwrap().unwrap();
    assert_eq!(widened as i64, -1);
}
