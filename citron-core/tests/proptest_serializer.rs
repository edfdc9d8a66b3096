// citron-core - Property tests for module serialization
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use citron_core::{
    deserialize_module, serialize_module, GlobalsLookup, Module, Opcode, OpcodeType,
    ParameterList,
};
use citron_parser::{BaseType, DataType, FlyweightStr};
use proptest::prelude::*;

fn arb_opcode_type() -> impl Strategy<Value = OpcodeType> {
    prop_oneof![
        Just(OpcodeType::PushConstant),
        Just(OpcodeType::GetVariableValue),
        Just(OpcodeType::SetVariableValue),
        Just(OpcodeType::ArithmAdd),
        Just(OpcodeType::ArithmMul),
        Just(OpcodeType::CompareLt),
        Just(OpcodeType::Jump),
        Just(OpcodeType::JumpConditional),
        Just(OpcodeType::Call),
        Just(OpcodeType::CastValue),
        Just(OpcodeType::MoveStack),
        Just(OpcodeType::MoveVarStack),
        Just(OpcodeType::Return),
    ]
}

fn arb_base_type() -> impl Strategy<Value = BaseType> {
    prop_oneof![
        Just(BaseType::Void),
        Just(BaseType::UInt8),
        Just(BaseType::UInt16),
        Just(BaseType::UInt32),
        Just(BaseType::UInt64),
        Just(BaseType::Int8),
        Just(BaseType::Int16),
        Just(BaseType::Int32),
        Just(BaseType::Int64),
        Just(BaseType::IntConst),
    ]
}

fn arb_opcode() -> impl Strategy<Value = Opcode> {
    (arb_opcode_type(), arb_base_type(), any::<i64>(), any::<u32>())
        .prop_map(|(op, base_type, param, line)| Opcode::new(op, base_type, param, line))
}

proptest! {
    /// Serializing and deserializing a module reproduces its opcode streams
    /// and definition tables exactly.
    #[test]
    fn module_roundtrip(
        opcodes in proptest::collection::vec(arb_opcode(), 0..64),
        constant_value in any::<u64>(),
        array_values in proptest::collection::vec(any::<u64>(), 0..16),
        hooks in proptest::collection::vec(any::<u32>(), 0..4),
    ) {
        let globals = GlobalsLookup::new();
        let mut module = Module::new("prop");
        module.start_compiling(&globals);
        module.add_source_file("scripts/", "prop.lemon");
        module.add_constant(FlyweightStr::new("K"), DataType::U32, constant_value);
        module.add_constant_array(
            FlyweightStr::new("table"),
            DataType::U16,
            array_values.clone(),
        );

        let function = module.add_script_function(
            FlyweightStr::new("f"),
            DataType::U32,
            ParameterList::new(),
        );
        {
            let mut script = function.borrow_mut();
            script.opcodes = opcodes.clone();
            script.address_hooks = hooks.clone();
        }

        let dependency_hash = globals.build_dependency_hash();
        let bytes = serialize_module(&module, dependency_hash).unwrap();
        let restored = deserialize_module(&bytes, &globals).unwrap();

        prop_assert_eq!(restored.constants[0].value, constant_value);
        prop_assert_eq!(&restored.constant_arrays[0].values, &array_values);
        let restored_function = restored.script_functions[0].borrow();
        prop_assert_eq!(&restored_function.opcodes, &opcodes);
        prop_assert_eq!(&restored_function.address_hooks, &hooks);
    }

    /// A flipped dependency hash always rejects the module.
    #[test]
    fn dependency_hash_guard(flip in 1u32..) {
        let globals = GlobalsLookup::new();
        let mut module = Module::new("guard");
        module.start_compiling(&globals);
        let hash = globals.build_dependency_hash();
        let bytes = serialize_module(&module, hash ^ flip).unwrap();
        prop_assert!(deserialize_module(&bytes, &globals).is_err());
    }
}
