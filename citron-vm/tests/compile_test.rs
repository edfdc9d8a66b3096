// citron-vm - Compiler integration tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use citron_core::{GlobalsLookup, Module, OpcodeType};
use citron_vm::builtins;
use citron_vm::compiler::error::CompileErrorKind;
use citron_vm::compiler::loader::MemoryFileSystem;
use citron_vm::compiler::Compiler;
use citron_vm::CompileOptions;

struct CompileOutcome {
    module: Module,
    success: bool,
    errors: Vec<citron_vm::ErrorMessage>,
}

fn compile_files(files: &[(&str, &str)], root: &str) -> CompileOutcome {
    let file_system = MemoryFileSystem::with(files);
    let mut globals = GlobalsLookup::new();
    let core = builtins::create_core_module(&globals);
    globals.add_definitions_from_module(&core);

    let mut module = Module::new("script");
    let mut compiler = Compiler::new(&mut module, &mut globals, CompileOptions::default());
    let success = compiler.load_script(root, &file_system);
    let errors = compiler.errors().to_vec();
    CompileOutcome {
        module,
        success,
        errors,
    }
}

fn compile(source: &str) -> CompileOutcome {
    compile_files(&[("main.lemon", source)], "main.lemon")
}

#[test]
fn test_constant_expression_folds_to_single_push() {
    let outcome = compile("function u8 f()\n{\n\treturn 2 + 3 * 4\n}\n");
    assert!(outcome.success, "errors: {:?}", outcome.errors);

    let function = outcome.module.script_functions[0].borrow();
    let kinds: Vec<OpcodeType> = function.opcodes.iter().map(|op| op.op).collect();
    assert_eq!(kinds, vec![OpcodeType::PushConstant, OpcodeType::Return]);
    assert_eq!(function.opcodes[0].param, 14);
}

#[test]
fn test_parameters_pop_into_locals() {
    let outcome = compile("function s16 g(s16 a, s16 b)\n{\n\treturn a - b\n}\n");
    assert!(outcome.success, "errors: {:?}", outcome.errors);

    let function = outcome.module.script_functions[0].borrow();
    assert_eq!(function.local_variables.len(), 2);
    // Prologue: grow locals, then pop the arguments in reverse order
    assert_eq!(function.opcodes[0].op, OpcodeType::MoveVarStack);
    assert_eq!(function.opcodes[0].param, 2);
    assert_eq!(function.opcodes[1].op, OpcodeType::SetVariableValue);
    assert_eq!(function.opcodes[1].param, 1);
    assert_eq!(function.opcodes[3].op, OpcodeType::SetVariableValue);
    assert_eq!(function.opcodes[3].param, 0);
}

#[test]
fn test_unmatched_parenthesis_is_a_parse_error() {
    let outcome = compile("function void f()\n{\n\tu8 x = (1 + 2\n}\n");
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, CompileErrorKind::Parse);
    assert!(outcome.errors[0].text.contains("Parenthesis"));
}

#[test]
fn test_unknown_identifier_is_a_semantic_error() {
    let outcome = compile("function void f()\n{\n\tmystery = 1\n}\n");
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, CompileErrorKind::Semantic);
}

#[test]
fn test_errors_accumulate_across_functions() {
    let outcome = compile(concat!(
        "function void f()\n{\n\tfirst_unknown = 1\n}\n",
        "function void g()\n{\n\tsecond_unknown = 2\n}\n",
    ));
    assert!(!outcome.success);
    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome.errors[0].text.contains("first_unknown"));
    assert!(outcome.errors[1].text.contains("second_unknown"));
}

#[test]
fn test_void_variable_rejected() {
    let outcome = compile("function void f()\n{\n\tvoid x\n}\n");
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, CompileErrorKind::Semantic);
    assert!(outcome.errors[0].text.contains("void"));
}

#[test]
fn test_duplicate_local_rejected() {
    let outcome = compile("function void f()\n{\n\tu8 x\n\tu8 x\n}\n");
    assert!(!outcome.success);
    assert!(outcome.errors[0].text.contains("already used"));
}

#[test]
fn test_missing_return_value_rejected() {
    let outcome = compile("function u8 f()\n{\n\tu8 x = 1\n}\n");
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, CompileErrorKind::Backend);
    assert!(outcome.errors[0].text.contains("must return"));
}

#[test]
fn test_invalid_explicit_cast_rejected() {
    let outcome = compile(concat!(
        "function void f()\n",
        "{\n",
        "\tu8 x = u8(f())\n",
        "}\n",
    ));
    assert!(!outcome.success);
    assert_eq!(outcome.errors[0].kind, CompileErrorKind::Cast);
}

#[test]
fn test_memory_access_requires_basic_integer_type() {
    let outcome = compile("function void f()\n{\n\tstring[0x100] = 1\n}\n");
    assert!(!outcome.success);
    assert!(outcome.errors[0].text.contains("Memory access"));
}

#[test]
fn test_double_include_compiles_identically() {
    let single = compile_files(
        &[
            ("main.lemon", "include part\nfunction u32 f()\n{\n\treturn K\n}\n"),
            ("part.lemon", "constant u32 K = 9\n"),
        ],
        "main.lemon",
    );
    let double = compile_files(
        &[
            (
                "main.lemon",
                "include part\ninclude part\nfunction u32 f()\n{\n\treturn K\n}\n",
            ),
            ("part.lemon", "constant u32 K = 9\n"),
        ],
        "main.lemon",
    );
    assert!(single.success && double.success);

    let single_fn = single.module.script_functions[0].borrow();
    let double_fn = double.module.script_functions[0].borrow();
    assert_eq!(single_fn.opcodes, double_fn.opcodes);
    assert_eq!(
        single.module.source_files.len(),
        double.module.source_files.len()
    );
}

#[test]
fn test_comparison_statement_rejected_at_level_two() {
    let outcome = compile("function void f()\n{\n\tu8 x = 1\n\tx == 1\n}\n");
    assert!(!outcome.success);
    assert!(outcome.errors[0].text.contains("comparison"));
}

#[test]
fn test_feature_level_pragma_too_high() {
    let outcome = compile("//# script-feature-level(9)\nfunction void f()\n{\n}\n");
    assert!(!outcome.success);
    assert!(outcome.errors[0].text.contains("feature level"));
}

#[test]
fn test_global_with_initializer() {
    let outcome = compile("global u16 hp = 99\nfunction void f()\n{\n\thp = 1\n}\n");
    assert!(outcome.success, "errors: {:?}", outcome.errors);
    match &*outcome.module.global_variables[0] {
        citron_core::ModuleVariable::Global(global) => {
            assert_eq!(global.initial_value, 99);
        }
        other => panic!("unexpected variable kind: {:?}", other),
    }
}

#[test]
fn test_local_constant_array() {
    let outcome = compile(concat!(
        "function u32 f()\n",
        "{\n",
        "\tconstant array<u8> bits = { 1, 2, 4 }\n",
        "\treturn bits[2] + bits.length()\n",
        "}\n",
    ));
    assert!(outcome.success, "errors: {:?}", outcome.errors);
    assert_eq!(outcome.module.constant_arrays[0].values, vec![1, 2, 4]);
}
