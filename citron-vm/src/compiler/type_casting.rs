// citron-vm - Type casting policy
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The implicit-cast policy: cast priorities, binary-operator signature
//! selection and function-overload scoring.
//!
//! Priorities are `u8` values where smaller is better: 0 means identical
//! types, 0xff (`CANNOT_CAST`) means no implicit conversion exists. The
//! exact encoding is part of overload-resolution behaviour and therefore of
//! language semantics.

use citron_parser::{BaseCastType, DataType, IntSemantics, Operator, OperatorClass, TypeClass};
use smallvec::SmallVec;

use super::options::CompileOptions;

pub const CANNOT_CAST: u8 = 0xff;

/// A binary operator signature: operand types and result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryOperatorSignature {
    pub left: DataType,
    pub right: DataType,
    pub result: DataType,
}

impl BinaryOperatorSignature {
    pub const fn new(left: DataType, right: DataType, result: DataType) -> Self {
        BinaryOperatorSignature {
            left,
            right,
            result,
        }
    }
}

macro_rules! symmetric_signature {
    ($t:expr) => {
        BinaryOperatorSignature::new($t, $t, $t)
    };
}

/// Symmetric arithmetic signatures, widest type first.
pub const SIGNATURES_SYMMETRIC: [BinaryOperatorSignature; 9] = [
    symmetric_signature!(DataType::S64),
    symmetric_signature!(DataType::U64),
    symmetric_signature!(DataType::S32),
    symmetric_signature!(DataType::U32),
    symmetric_signature!(DataType::S16),
    symmetric_signature!(DataType::U16),
    symmetric_signature!(DataType::S8),
    symmetric_signature!(DataType::U8),
    symmetric_signature!(DataType::Str),
];

/// Comparison signatures; results are always bool.
pub const SIGNATURES_COMPARISON: [BinaryOperatorSignature; 9] = [
    BinaryOperatorSignature::new(DataType::S64, DataType::S64, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::U64, DataType::U64, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::S32, DataType::S32, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::U32, DataType::U32, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::S16, DataType::S16, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::U16, DataType::U16, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::S8, DataType::S8, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::U8, DataType::U8, DataType::BOOL),
    BinaryOperatorSignature::new(DataType::Str, DataType::Str, DataType::BOOL),
];

/// Trinary (`? :`) signatures: bool condition, symmetric alternatives.
pub const SIGNATURES_TRINARY: [BinaryOperatorSignature; 9] = [
    BinaryOperatorSignature::new(DataType::BOOL, DataType::S64, DataType::S64),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::U64, DataType::U64),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::S32, DataType::S32),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::U32, DataType::U32),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::S16, DataType::S16),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::U16, DataType::U16),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::S8, DataType::S8),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::U8, DataType::U8),
    BinaryOperatorSignature::new(DataType::BOOL, DataType::Str, DataType::Str),
];

/// How a value of one type becomes a value of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastHandling {
    /// Types agree at runtime level; nothing to emit.
    NoCast,
    /// Emit a `CastValue` opcode with this cast type.
    BaseCast(BaseCastType),
    /// Cast to `any`: push the source type hash so the callee can tell.
    AnyCast,
    Invalid,
}

/// The type-casting policy, parameterized by the script feature level.
#[derive(Debug, Clone, Copy)]
pub struct TypeCasting {
    feature_level: u32,
}

impl TypeCasting {
    pub fn new(options: &CompileOptions) -> Self {
        TypeCasting {
            feature_level: options.script_feature_level,
        }
    }

    /// Strings act as their 64-bit key. The key is always readable as an
    /// integer; writing an integer into a string is only legal at feature
    /// level 1 (legacy scripts relied on it).
    fn string_adjust(&self, original: DataType, target: DataType) -> (DataType, DataType) {
        let original = if original == DataType::Str {
            DataType::U64
        } else {
            original
        };
        let target = if self.feature_level < 2 && target == DataType::Str {
            DataType::U64
        } else {
            target
        };
        (original, target)
    }

    /// Priority of the implicit conversion `original` → `target`; smaller is
    /// better, `CANNOT_CAST` means impossible.
    pub fn implicit_cast_priority(&self, original: DataType, target: DataType) -> u8 {
        if original == target {
            return 0;
        }

        let (original, target) = self.string_adjust(original, target);
        if original == target {
            // A conversion over the string <-> u64 bridge
            return 1;
        }

        if target == DataType::Any && original.class() != TypeClass::Void {
            return 2;
        }

        if let (DataType::Int(original_int), DataType::Int(target_int)) = (original, target) {
            // Constant-semantics integers cast freely
            if original_int.semantics == IntSemantics::Constant
                || target_int.semantics == IntSemantics::Constant
            {
                return 1;
            }

            let sign_change = original_int.signed && !target_int.signed;
            if original_int.bytes == target_int.bytes {
                return if sign_change { 0x02 } else { 0x01 };
            }
            if original_int.bytes < target_int.bytes {
                // Up-cast
                return if sign_change { 0x20 } else { 0x10 }
                    + (target_int.size_bits() - original_int.size_bits());
            }
            // Down-cast
            return if sign_change { 0x40 } else { 0x30 }
                + (original_int.size_bits() - target_int.size_bits());
        }

        CANNOT_CAST
    }

    /// The cast opcode needed for `original` → `target`, if any.
    ///
    /// Custom types cast through their integer base type; two custom types
    /// over the same base need no opcode at all.
    pub fn base_cast_type(&self, original: DataType, target: DataType) -> BaseCastType {
        if original == target {
            return BaseCastType::None;
        }

        let (original, target) = self.string_adjust(original, target);
        let original = match original {
            DataType::Custom { base, .. } => DataType::from_base_type(base),
            other => other,
        };
        let target = match target {
            DataType::Custom { base, .. } => DataType::from_base_type(base),
            other => other,
        };
        if original == target {
            return BaseCastType::None;
        }
        if let (DataType::Int(original_int), DataType::Int(target_int)) = (original, target) {
            if original_int.bytes == target_int.bytes {
                return BaseCastType::None;
            }
            let signed_up_cast =
                original_int.signed && target_int.bytes > original_int.bytes;
            return BaseCastType::Int {
                source_bits: original_int.size_bits(),
                target_bits: target_int.size_bits(),
                signed: signed_up_cast,
            };
        }

        BaseCastType::Invalid
    }

    pub fn cast_handling(&self, original: DataType, target: DataType) -> CastHandling {
        if original == target {
            return CastHandling::NoCast;
        }
        if target == DataType::Any {
            return CastHandling::AnyCast;
        }
        match self.base_cast_type(original, target) {
            BaseCastType::None => CastHandling::NoCast,
            BaseCastType::Invalid => CastHandling::Invalid,
            cast => CastHandling::BaseCast(cast),
        }
    }

    /// Whether an explicit `type(expr)` cast is permitted.
    pub fn can_explicitly_cast(&self, original: DataType, target: DataType) -> bool {
        if original == target || target == DataType::Any {
            return true;
        }
        let castable = |class: TypeClass| {
            matches!(class, TypeClass::Integer | TypeClass::String | TypeClass::Custom)
        };
        castable(original.class()) && castable(target.class())
    }

    /// Priority of a binary-operator signature for the given operand types:
    /// `(max << 8) | min` of the two operand priorities.
    pub fn priority_of_signature(
        &self,
        signature: &BinaryOperatorSignature,
        left: DataType,
        right: DataType,
    ) -> u16 {
        let priority_left = self.implicit_cast_priority(left, signature.left);
        let priority_right = self.implicit_cast_priority(right, signature.right);
        if priority_left < priority_right {
            ((priority_right as u16) << 8) | priority_left as u16
        } else {
            ((priority_left as u16) << 8) | priority_right as u16
        }
    }

    /// Find the best signature for a binary operator, or `None` if no
    /// signature accepts the operand types.
    pub fn best_operator_signature(
        &self,
        op: Operator,
        left: DataType,
        right: DataType,
    ) -> Option<BinaryOperatorSignature> {
        let (signatures, exact_match_left_required): (&[BinaryOperatorSignature], bool) =
            match op.class() {
                OperatorClass::Assignment => (&SIGNATURES_SYMMETRIC, true),
                OperatorClass::Symmetric => (&SIGNATURES_SYMMETRIC, false),
                OperatorClass::Comparison => (&SIGNATURES_COMPARISON, false),
                OperatorClass::Trinary => (&SIGNATURES_TRINARY, false),
                OperatorClass::Unknown => return None,
            };

        let mut best_priority = 0xff00u16;
        let mut best: Option<BinaryOperatorSignature> = None;
        for signature in signatures {
            if exact_match_left_required && signature.left != left {
                continue;
            }
            let priority = self.priority_of_signature(signature, left, right);
            if priority < best_priority {
                best_priority = priority;
                best = Some(*signature);
            }
        }
        best
    }

    /// Overload score of calling a function with `arguments` against its
    /// declared `parameters`: per-argument priorities sorted worst-first and
    /// packed into a `u32`. Smaller is better; `0xffffffff` means the
    /// argument count does not match.
    pub fn overload_score(&self, arguments: &[DataType], parameters: &[DataType]) -> u32 {
        if arguments.len() != parameters.len() {
            return 0xffff_ffff;
        }
        let mut priorities: SmallVec<[u8; 8]> = arguments
            .iter()
            .zip(parameters.iter())
            .map(|(a, p)| self.implicit_cast_priority(*a, *p))
            .collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));

        let mut score = 0u32;
        for (i, priority) in priorities.iter().take(4).enumerate() {
            score |= (*priority as u32) << (24 - i * 8);
        }
        score
    }

    /// Whether an overload score indicates a valid match at all.
    pub fn score_matches(score: u32) -> bool {
        score < 0xff00_0000
    }

    /// Check all arguments cast to their parameters; on failure returns the
    /// first failing index.
    pub fn can_match_signature(
        &self,
        arguments: &[DataType],
        parameters: &[DataType],
    ) -> Result<(), usize> {
        if arguments.len() != parameters.len() {
            return Err(arguments.len().min(parameters.len()));
        }
        for (index, (argument, parameter)) in
            arguments.iter().zip(parameters.iter()).enumerate()
        {
            if self.implicit_cast_priority(*argument, *parameter) == CANNOT_CAST {
                return Err(index);
            }
        }
        Ok(())
    }
}

/// Apply a cast to a raw 64-bit value: truncation for down-casts, zero fill
/// for unsigned up-casts, sign extension for signed up-casts.
///
/// Signed values occupy the full 64-bit word sign-extended, matching what
/// arithmetic results and variable loads produce, so signed up-casts extend
/// all the way regardless of the target width.
pub fn cast_constant_value(cast: BaseCastType, value: u64) -> u64 {
    match cast {
        BaseCastType::None | BaseCastType::Invalid => value,
        BaseCastType::Int {
            source_bits,
            target_bits,
            signed,
        } => {
            let source_width = 8u32 << source_bits;
            let target_width = 8u32 << target_bits;
            let truncated = mask_to_width(value, source_width);
            if target_width < source_width {
                mask_to_width(truncated, target_width)
            } else if signed {
                sign_extend(truncated, source_width)
            } else {
                truncated
            }
        }
    }
}

#[inline]
fn mask_to_width(value: u64, width: u32) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

#[inline]
fn sign_extend(value: u64, width: u32) -> u64 {
    if width >= 64 {
        return value;
    }
    let shift = 64 - width;
    (((value << shift) as i64) >> shift) as u64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn casting() -> TypeCasting {
        TypeCasting::new(&CompileOptions::default())
    }

    #[test]
    fn test_identical_types_are_priority_zero() {
        let tc = casting();
        for t in DataType::INTEGERS_WIDEST_FIRST {
            assert_eq!(tc.implicit_cast_priority(t, t), 0);
        }
        assert_eq!(tc.implicit_cast_priority(DataType::Str, DataType::Str), 0);
    }

    #[test]
    fn test_widening_beats_narrowing() {
        let tc = casting();
        let widen = tc.implicit_cast_priority(DataType::U8, DataType::U16);
        let narrow = tc.implicit_cast_priority(DataType::U16, DataType::U8);
        assert!(widen < narrow);
    }

    #[test]
    fn test_same_sign_beats_sign_change() {
        let tc = casting();
        let same_sign = tc.implicit_cast_priority(DataType::U8, DataType::U16);
        let sign_change = tc.implicit_cast_priority(DataType::S8, DataType::U16);
        assert!(same_sign < sign_change);
    }

    #[test]
    fn test_const_int_casts_freely() {
        let tc = casting();
        assert_eq!(
            tc.implicit_cast_priority(DataType::CONST_INT, DataType::U8),
            1
        );
    }

    #[test]
    fn test_string_bridge_direction_by_feature_level() {
        let tc = casting();
        // string -> integer allowed at level 2
        assert_eq!(tc.implicit_cast_priority(DataType::Str, DataType::U64), 1);
        // integer -> string not allowed at level 2
        assert_eq!(
            tc.implicit_cast_priority(DataType::U64, DataType::Str),
            CANNOT_CAST
        );

        let mut options = CompileOptions::default();
        options.script_feature_level = 1;
        let tc1 = TypeCasting::new(&options);
        assert_eq!(tc1.implicit_cast_priority(DataType::U64, DataType::Str), 1);
    }

    #[test]
    fn test_best_signature_picks_matching_width() {
        let tc = casting();
        let signature = tc
            .best_operator_signature(Operator::BinaryPlus, DataType::S16, DataType::S16)
            .unwrap();
        assert_eq!(signature.result, DataType::S16);

        let signature = tc
            .best_operator_signature(Operator::CompareLess, DataType::U32, DataType::U32)
            .unwrap();
        assert_eq!(signature.result, DataType::BOOL);
        assert_eq!(signature.left, DataType::U32);
    }

    #[test]
    fn test_assignment_requires_exact_left() {
        let tc = casting();
        let signature = tc
            .best_operator_signature(Operator::Assign, DataType::U8, DataType::U64)
            .unwrap();
        assert_eq!(signature.left, DataType::U8);
    }

    #[test]
    fn test_overload_score_prefers_exact() {
        let tc = casting();
        let exact = tc.overload_score(
            &[DataType::U32, DataType::U32],
            &[DataType::U32, DataType::U32],
        );
        let widened = tc.overload_score(
            &[DataType::U32, DataType::U32],
            &[DataType::U64, DataType::U64],
        );
        assert!(exact < widened);
        assert!(TypeCasting::score_matches(exact));

        let mismatch = tc.overload_score(&[DataType::Str], &[DataType::Void]);
        assert!(!TypeCasting::score_matches(mismatch));
    }

    #[test]
    fn test_cast_constant_truncates_and_extends() {
        // s8 -> s64 sign extension
        let cast = BaseCastType::Int {
            source_bits: 0,
            target_bits: 3,
            signed: true,
        };
        assert_eq!(cast_constant_value(cast, 0xff), u64::MAX);

        // u16 -> u8 truncation
        let cast = BaseCastType::Int {
            source_bits: 1,
            target_bits: 0,
            signed: false,
        };
        assert_eq!(cast_constant_value(cast, 0x1234), 0x34);

        // u8 -> u32 zero fill
        let cast = BaseCastType::Int {
            source_bits: 0,
            target_bits: 2,
            signed: false,
        };
        assert_eq!(cast_constant_value(cast, 0xfff), 0xff);
    }
}
