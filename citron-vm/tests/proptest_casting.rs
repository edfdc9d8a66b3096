// citron-vm - Property tests for the type-casting policy
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use citron_parser::DataType;
use citron_vm::compiler::options::CompileOptions;
use citron_vm::compiler::type_casting::TypeCasting;
use citron_vm::vm::exec;
use citron_core::OpcodeType;
use citron_parser::BaseType;
use proptest::prelude::*;

fn arb_data_type() -> impl Strategy<Value = DataType> {
    prop_oneof![
        Just(DataType::U8),
        Just(DataType::U16),
        Just(DataType::U32),
        Just(DataType::U64),
        Just(DataType::S8),
        Just(DataType::S16),
        Just(DataType::S32),
        Just(DataType::S64),
        Just(DataType::CONST_INT),
        Just(DataType::Str),
        Just(DataType::Void),
    ]
}

fn casting() -> TypeCasting {
    TypeCasting::new(&CompileOptions::default())
}

proptest! {
    /// Priority 0 exactly characterizes identical types.
    #[test]
    fn priority_zero_iff_identical(a in arb_data_type(), b in arb_data_type()) {
        let priority = casting().implicit_cast_priority(a, b);
        prop_assert_eq!(priority == 0, a == b);
    }

    /// Overload scoring is deterministic and symmetric in repeated runs.
    #[test]
    fn overload_score_deterministic(
        args in proptest::collection::vec(arb_data_type(), 0..5),
        params in proptest::collection::vec(arb_data_type(), 0..5),
    ) {
        let tc = casting();
        let first = tc.overload_score(&args, &params);
        let second = tc.overload_score(&args, &params);
        prop_assert_eq!(first, second);
    }

    /// The best binary-operator signature is stable and accepts its own
    /// operand types.
    #[test]
    fn best_signature_is_stable(a in arb_data_type(), b in arb_data_type()) {
        let tc = casting();
        let first = tc.best_operator_signature(citron_parser::Operator::BinaryPlus, a, b);
        let second = tc.best_operator_signature(citron_parser::Operator::BinaryPlus, a, b);
        prop_assert_eq!(first, second);
        if let Some(signature) = first {
            prop_assert!(tc.implicit_cast_priority(a, signature.left) != 0xff);
            prop_assert!(tc.implicit_cast_priority(b, signature.right) != 0xff);
        }
    }

    /// 64-bit arithmetic matches two's-complement wrapping semantics with
    /// safe division.
    #[test]
    fn int64_arithmetic_reference(a in any::<i64>(), b in any::<i64>()) {
        let raw_a = a as u64;
        let raw_b = b as u64;
        prop_assert_eq!(
            exec::binary_operation(OpcodeType::ArithmAdd, BaseType::Int64, raw_a, raw_b) as i64,
            a.wrapping_add(b)
        );
        prop_assert_eq!(
            exec::binary_operation(OpcodeType::ArithmMul, BaseType::Int64, raw_a, raw_b) as i64,
            a.wrapping_mul(b)
        );
        let expected_div = if b == 0 { 0 } else { a.wrapping_div(b) };
        prop_assert_eq!(
            exec::binary_operation(OpcodeType::ArithmDiv, BaseType::Int64, raw_a, raw_b) as i64,
            expected_div
        );
        let expected_mod = if b == 0 { 0 } else { a.wrapping_rem(b) };
        prop_assert_eq!(
            exec::binary_operation(OpcodeType::ArithmMod, BaseType::Int64, raw_a, raw_b) as i64,
            expected_mod
        );
    }

    /// Narrow arithmetic wraps at its own width and sign-extends results.
    #[test]
    fn narrow_arithmetic_wraps(a in any::<u8>(), b in any::<u8>()) {
        let sum = exec::binary_operation(
            OpcodeType::ArithmAdd,
            BaseType::UInt8,
            a as u64,
            b as u64,
        );
        prop_assert_eq!(sum, a.wrapping_add(b) as u64);

        let signed_sum = exec::binary_operation(
            OpcodeType::ArithmAdd,
            BaseType::Int8,
            a as u64,
            b as u64,
        );
        prop_assert_eq!(signed_sum as i64, (a as i8).wrapping_add(b as i8) as i64);
    }

    /// Down-casting truncates low bits; signed up-casts sign-extend.
    #[test]
    fn cast_truncation_and_extension(value in any::<u64>()) {
        use citron_parser::BaseCastType;
        use citron_vm::compiler::type_casting::cast_constant_value;

        let down = BaseCastType::Int { source_bits: 3, target_bits: 0, signed: false };
        prop_assert_eq!(cast_constant_value(down, value), value & 0xff);

        let up_signed = BaseCastType::Int { source_bits: 0, target_bits: 3, signed: true };
        prop_assert_eq!(
            cast_constant_value(up_signed, value) as i64,
            (value as u8) as i8 as i64
        );

        let up_unsigned = BaseCastType::Int { source_bits: 1, target_bits: 2, signed: false };
        prop_assert_eq!(cast_constant_value(up_unsigned, value), value & 0xffff);
    }
}
