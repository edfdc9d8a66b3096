// citron-vm - Runtime integration tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::rc::Rc;

use citron_core::{
    GlobalsLookup, Module, Opcode, OpcodeType, ParameterList, Program,
};
use citron_parser::{BaseType, DataType, FlyweightStr};
use citron_vm::vm::Runtime;

fn opcode(op: OpcodeType, base_type: BaseType, param: i64) -> Opcode {
    Opcode::new(op, base_type, param, 1)
}

/// Build a program where a patch module overrides a base module's function
/// and calls through to it with a base call.
#[test]
fn test_base_call_dispatches_down_the_override_chain() {
    let mut globals = GlobalsLookup::new();

    let mut base_module = Module::new("base");
    base_module.start_compiling(&globals);
    let base_fn = base_module.add_script_function(
        FlyweightStr::new("f"),
        DataType::U32,
        ParameterList::new(),
    );
    base_fn.borrow_mut().opcodes = vec![
        opcode(OpcodeType::PushConstant, BaseType::IntConst, 1),
        opcode(OpcodeType::Return, BaseType::Void, 0),
    ];
    globals.add_definitions_from_module(&base_module);

    let mut patch_module = Module::new("patch");
    patch_module.start_compiling(&globals);
    let patch_fn = patch_module.add_script_function(
        FlyweightStr::new("f"),
        DataType::U32,
        ParameterList::new(),
    );
    {
        let mut script = patch_fn.borrow_mut();
        let hash = script.name_and_signature_hash() as i64;
        // base.f() + 10: the UInt8 base type marks the base call
        script.opcodes = vec![
            opcode(OpcodeType::Call, BaseType::UInt8, hash),
            opcode(OpcodeType::PushConstant, BaseType::IntConst, 10),
            opcode(OpcodeType::ArithmAdd, BaseType::UInt32, 0),
            opcode(OpcodeType::Return, BaseType::Void, 0),
        ];
    }

    let mut program = Program::new();
    program.add_module(Rc::new(base_module));
    program.add_module(Rc::new(patch_module));
    let program = Rc::new(program);

    let mut runtime = Runtime::new();
    runtime.set_program(program.clone());

    // Resolving by signature yields the patch module's override
    let hash = patch_fn.borrow().name_and_signature_hash();
    let function = program.function_by_signature(hash, 0).unwrap().clone();
    assert_eq!(function.id(), patch_fn.borrow().id);
    runtime.call_function(&function, 0).unwrap();
    let result = runtime.execute_steps(1000, 0).unwrap();
    assert!(result.halted);
    assert_eq!(runtime.pop_value().unwrap(), 11);
}

#[test]
fn test_step_limit_pauses_and_resumes() {
    let globals = GlobalsLookup::new();
    let mut module = Module::new("m");
    module.start_compiling(&globals);
    let function = module.add_script_function(
        FlyweightStr::new("spin"),
        DataType::U32,
        ParameterList::new(),
    );
    // An empty counting loop ending in a constant return
    function.borrow_mut().opcodes = vec![
        opcode(OpcodeType::MoveVarStack, BaseType::Void, 1),
        opcode(OpcodeType::PushConstant, BaseType::IntConst, 0),
        opcode(OpcodeType::SetVariableValue, BaseType::UInt32, 0),
        opcode(OpcodeType::MoveStack, BaseType::Void, -1),
        // loop: i < 100000
        opcode(OpcodeType::GetVariableValue, BaseType::UInt32, 0),
        opcode(OpcodeType::PushConstant, BaseType::IntConst, 100_000),
        opcode(OpcodeType::CompareLt, BaseType::UInt32, 0),
        opcode(OpcodeType::JumpConditional, BaseType::Void, 14),
        // i += 1
        opcode(OpcodeType::GetVariableValue, BaseType::UInt32, 0),
        opcode(OpcodeType::PushConstant, BaseType::IntConst, 1),
        opcode(OpcodeType::ArithmAdd, BaseType::UInt32, 0),
        opcode(OpcodeType::SetVariableValue, BaseType::UInt32, 0),
        opcode(OpcodeType::MoveStack, BaseType::Void, -1),
        opcode(OpcodeType::Jump, BaseType::Void, 4),
        // end: return i
        opcode(OpcodeType::GetVariableValue, BaseType::UInt32, 0),
        opcode(OpcodeType::Return, BaseType::Void, 0),
    ];

    let mut program = Program::new();
    program.add_module(Rc::new(module));
    let program = Rc::new(program);
    let mut runtime = Runtime::new();
    runtime.set_program(program.clone());

    let spin = program
        .functions_by_name(FlyweightStr::new("spin").hash())[0]
        .clone();
    runtime.call_function(&spin, 0).unwrap();

    // A small budget pauses mid-loop without losing state
    let mut total_calls = 0;
    loop {
        let result = runtime.execute_steps(10_000, 0).unwrap();
        total_calls += 1;
        if result.halted {
            break;
        }
        assert!(total_calls < 1000, "loop never finished");
    }
    assert!(total_calls > 1, "step limit was never hit");
    assert_eq!(runtime.pop_value().unwrap(), 100_000);
}

#[test]
fn test_runtime_error_unwinds_control_flow() {
    let globals = GlobalsLookup::new();
    let mut module = Module::new("m");
    module.start_compiling(&globals);
    let function = module.add_script_function(
        FlyweightStr::new("bad"),
        DataType::Void,
        ParameterList::new(),
    );
    // Pops from an empty stack
    function.borrow_mut().opcodes = vec![
        opcode(OpcodeType::MoveStack, BaseType::Void, -1),
        opcode(OpcodeType::Return, BaseType::Void, 0),
    ];

    let mut program = Program::new();
    program.add_module(Rc::new(module));
    let program = Rc::new(program);
    let mut runtime = Runtime::new();
    runtime.set_program(program.clone());

    let bad = program
        .functions_by_name(FlyweightStr::new("bad").hash())[0]
        .clone();
    runtime.call_function(&bad, 0).unwrap();
    assert!(runtime.execute_steps(100, 0).is_err());

    // All frames unwound; the flow is reusable
    assert!(!runtime.selected_control_flow().has_frames());
    runtime.call_function(&bad, 0).unwrap();
    assert!(runtime.selected_control_flow().has_frames());
}

#[test]
fn test_unknown_call_target_is_an_error() {
    let globals = GlobalsLookup::new();
    let mut module = Module::new("m");
    module.start_compiling(&globals);
    let function = module.add_script_function(
        FlyweightStr::new("f"),
        DataType::Void,
        ParameterList::new(),
    );
    function.borrow_mut().opcodes = vec![
        opcode(OpcodeType::Call, BaseType::Void, 0x1234_5678),
        opcode(OpcodeType::Return, BaseType::Void, 0),
    ];

    let mut program = Program::new();
    program.add_module(Rc::new(module));
    let program = Rc::new(program);
    let mut runtime = Runtime::new();
    runtime.set_program(program.clone());

    let f = program
        .functions_by_name(FlyweightStr::new("f").hash())[0]
        .clone();
    runtime.call_function(&f, 0).unwrap();
    assert!(matches!(
        runtime.execute_steps(100, 0),
        Err(citron_vm::RuntimeError::UnknownFunction { .. })
    ));
}
