// citron-vm - Typed opcode execution helpers
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Typed arithmetic, comparison and memory helpers for the opcode loop.
//!
//! Values live on the stack as raw 64-bit words; each helper reinterprets
//! them at the opcode's base type, applies the operation with wrapping
//! semantics, and writes the result back sign- or zero-extended. Division
//! and modulo trap to zero on a zero divisor.

use citron_core::OpcodeType;
use citron_parser::BaseType;
use num_traits::{PrimInt, WrappingSub};

use super::error::RuntimeError;

/// Fault reported by the host's memory access handler.
#[derive(Debug, Clone, Copy)]
pub struct MemoryFault {
    pub address: u64,
}

impl From<MemoryFault> for RuntimeError {
    fn from(fault: MemoryFault) -> Self {
        RuntimeError::MemoryFault {
            address: fault.address,
        }
    }
}

/// Host-provided access to the simulated address space. Every
/// `ReadMemory`/`WriteMemory` opcode goes through this.
pub trait MemoryAccessHandler {
    fn read8(&mut self, address: u64) -> Result<u8, MemoryFault>;
    fn read16(&mut self, address: u64) -> Result<u16, MemoryFault>;
    fn read32(&mut self, address: u64) -> Result<u32, MemoryFault>;
    fn read64(&mut self, address: u64) -> Result<u64, MemoryFault>;
    fn write8(&mut self, address: u64, value: u8) -> Result<(), MemoryFault>;
    fn write16(&mut self, address: u64, value: u16) -> Result<(), MemoryFault>;
    fn write32(&mut self, address: u64, value: u32) -> Result<(), MemoryFault>;
    fn write64(&mut self, address: u64, value: u64) -> Result<(), MemoryFault>;
}

/// A flat, bounds-checked RAM block; the default handler for tests and the
/// CLI.
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        FlatMemory {
            bytes: vec![0; size],
        }
    }

    fn check(&self, address: u64, size: usize) -> Result<usize, MemoryFault> {
        let start = usize::try_from(address).map_err(|_| MemoryFault { address })?;
        match start.checked_add(size) {
            Some(end) if end <= self.bytes.len() => Ok(start),
            _ => Err(MemoryFault { address }),
        }
    }
}

impl MemoryAccessHandler for FlatMemory {
    fn read8(&mut self, address: u64) -> Result<u8, MemoryFault> {
        let start = self.check(address, 1)?;
        Ok(self.bytes[start])
    }

    fn read16(&mut self, address: u64) -> Result<u16, MemoryFault> {
        let start = self.check(address, 2)?;
        Ok(u16::from_be_bytes(
            self.bytes[start..start + 2].try_into().unwrap(),
        ))
    }

    fn read32(&mut self, address: u64) -> Result<u32, MemoryFault> {
        let start = self.check(address, 4)?;
        Ok(u32::from_be_bytes(
            self.bytes[start..start + 4].try_into().unwrap(),
        ))
    }

    fn read64(&mut self, address: u64) -> Result<u64, MemoryFault> {
        let start = self.check(address, 8)?;
        Ok(u64::from_be_bytes(
            self.bytes[start..start + 8].try_into().unwrap(),
        ))
    }

    fn write8(&mut self, address: u64, value: u8) -> Result<(), MemoryFault> {
        let start = self.check(address, 1)?;
        self.bytes[start] = value;
        Ok(())
    }

    fn write16(&mut self, address: u64, value: u16) -> Result<(), MemoryFault> {
        let start = self.check(address, 2)?;
        self.bytes[start..start + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write32(&mut self, address: u64, value: u32) -> Result<(), MemoryFault> {
        let start = self.check(address, 4)?;
        self.bytes[start..start + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write64(&mut self, address: u64, value: u64) -> Result<(), MemoryFault> {
        let start = self.check(address, 8)?;
        self.bytes[start..start + 8].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

/// Division trapping to zero on a zero divisor, wrapping on overflow.
pub fn safe_divide<T: PrimInt + WrappingSub>(a: T, b: T) -> T {
    if b == T::zero() {
        return T::zero();
    }
    let minus_one = T::zero().wrapping_sub(&T::one());
    if a == T::min_value() && b == minus_one {
        // The only overflowing case; wraps back to itself
        return a;
    }
    a / b
}

/// Modulo trapping to zero on a zero divisor, wrapping on overflow.
pub fn safe_modulo<T: PrimInt + WrappingSub>(a: T, b: T) -> T {
    if b == T::zero() {
        return T::zero();
    }
    let minus_one = T::zero().wrapping_sub(&T::one());
    if a == T::min_value() && b == minus_one {
        return T::zero();
    }
    a % b
}

/// Reinterpret a raw stack word at the given base type and extend it back
/// to 64 bits (sign extension for signed types).
pub fn truncate_value(base_type: BaseType, value: u64) -> u64 {
    macro_rules! eval {
        ($t:ty) => {
            (value as $t) as i64 as u64
        };
    }
    match base_type {
        BaseType::UInt8 => eval!(u8),
        BaseType::UInt16 => eval!(u16),
        BaseType::UInt32 => eval!(u32),
        BaseType::UInt64 => eval!(u64),
        BaseType::Int8 => eval!(i8),
        BaseType::Int16 => eval!(i16),
        BaseType::Int32 => eval!(i32),
        BaseType::Int64 | BaseType::IntConst => eval!(i64),
        BaseType::Void => value,
    }
}

/// Apply a binary arithmetic or comparison opcode at the given base type.
pub fn binary_operation(op: OpcodeType, base_type: BaseType, a: u64, b: u64) -> u64 {
    macro_rules! eval {
        ($t:ty) => {{
            let x = a as $t;
            let y = b as $t;
            match op {
                OpcodeType::ArithmAdd => x.wrapping_add(y) as i64 as u64,
                OpcodeType::ArithmSub => x.wrapping_sub(y) as i64 as u64,
                OpcodeType::ArithmMul => x.wrapping_mul(y) as i64 as u64,
                OpcodeType::ArithmDiv => safe_divide(x, y) as i64 as u64,
                OpcodeType::ArithmMod => safe_modulo(x, y) as i64 as u64,
                OpcodeType::ArithmAnd => (x & y) as i64 as u64,
                OpcodeType::ArithmOr => (x | y) as i64 as u64,
                OpcodeType::ArithmXor => (x ^ y) as i64 as u64,
                // Shift amounts mask to the operand width
                OpcodeType::ArithmShl => x.wrapping_shl(b as u32) as i64 as u64,
                OpcodeType::ArithmShr => x.wrapping_shr(b as u32) as i64 as u64,
                OpcodeType::CompareEq => (x == y) as u64,
                OpcodeType::CompareNeq => (x != y) as u64,
                OpcodeType::CompareLt => (x < y) as u64,
                OpcodeType::CompareLe => (x <= y) as u64,
                OpcodeType::CompareGt => (x > y) as u64,
                OpcodeType::CompareGe => (x >= y) as u64,
                _ => 0,
            }
        }};
    }
    match base_type {
        BaseType::UInt8 => eval!(u8),
        BaseType::UInt16 => eval!(u16),
        BaseType::UInt32 => eval!(u32),
        BaseType::UInt64 => eval!(u64),
        BaseType::Int8 => eval!(i8),
        BaseType::Int16 => eval!(i16),
        BaseType::Int32 => eval!(i32),
        BaseType::Int64 | BaseType::IntConst => eval!(i64),
        BaseType::Void => 0,
    }
}

/// Apply a unary opcode at the given base type.
pub fn unary_operation(op: OpcodeType, base_type: BaseType, value: u64) -> u64 {
    macro_rules! eval {
        ($t:ty) => {{
            let x = value as $t;
            match op {
                OpcodeType::ArithmNeg => x.wrapping_neg() as i64 as u64,
                OpcodeType::ArithmNot => (x == 0) as u64,
                OpcodeType::ArithmBitnot => (!x) as i64 as u64,
                OpcodeType::MakeBool => (x != 0) as u64,
                _ => 0,
            }
        }};
    }
    match base_type {
        BaseType::UInt8 => eval!(u8),
        BaseType::UInt16 => eval!(u16),
        BaseType::UInt32 => eval!(u32),
        BaseType::UInt64 => eval!(u64),
        BaseType::Int8 => eval!(i8),
        BaseType::Int16 => eval!(i16),
        BaseType::Int32 => eval!(i32),
        BaseType::Int64 | BaseType::IntConst => eval!(i64),
        BaseType::Void => 0,
    }
}

/// Read memory at the width of the base type, sign-extending signed reads.
pub fn read_memory(
    handler: &mut dyn MemoryAccessHandler,
    base_type: BaseType,
    address: u64,
) -> Result<u64, MemoryFault> {
    Ok(match base_type {
        BaseType::UInt8 => handler.read8(address)? as u64,
        BaseType::UInt16 => handler.read16(address)? as u64,
        BaseType::UInt32 => handler.read32(address)? as u64,
        BaseType::UInt64 => handler.read64(address)?,
        BaseType::Int8 => handler.read8(address)? as i8 as i64 as u64,
        BaseType::Int16 => handler.read16(address)? as i16 as i64 as u64,
        BaseType::Int32 => handler.read32(address)? as i32 as i64 as u64,
        BaseType::Int64 | BaseType::IntConst => handler.read64(address)?,
        BaseType::Void => 0,
    })
}

/// Write memory at the width of the base type.
pub fn write_memory(
    handler: &mut dyn MemoryAccessHandler,
    base_type: BaseType,
    address: u64,
    value: u64,
) -> Result<(), MemoryFault> {
    match base_type {
        BaseType::UInt8 | BaseType::Int8 => handler.write8(address, value as u8),
        BaseType::UInt16 | BaseType::Int16 => handler.write16(address, value as u16),
        BaseType::UInt32 | BaseType::Int32 => handler.write32(address, value as u32),
        BaseType::UInt64 | BaseType::Int64 | BaseType::IntConst => {
            handler.write64(address, value)
        }
        BaseType::Void => Ok(()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_arithmetic() {
        // u8 arithmetic wraps at the type width
        let sum = binary_operation(OpcodeType::ArithmAdd, BaseType::UInt8, 0xff, 1);
        assert_eq!(sum, 0);

        // Signed subtraction sign-extends its result
        let diff = binary_operation(OpcodeType::ArithmSub, BaseType::Int16, 3, 10);
        assert_eq!(diff as i64, -7);
    }

    #[test]
    fn test_safe_division() {
        assert_eq!(
            binary_operation(OpcodeType::ArithmDiv, BaseType::Int64, 10, 0),
            0
        );
        assert_eq!(
            binary_operation(OpcodeType::ArithmMod, BaseType::Int64, 10, 0),
            0
        );
        // i64::MIN / -1 wraps instead of overflowing
        assert_eq!(
            binary_operation(
                OpcodeType::ArithmDiv,
                BaseType::Int64,
                i64::MIN as u64,
                -1i64 as u64
            ),
            i64::MIN as u64
        );
    }

    #[test]
    fn test_comparisons_respect_signedness() {
        // 0xff as u8 is 255 > 1; as i8 it is -1 < 1
        assert_eq!(
            binary_operation(OpcodeType::CompareGt, BaseType::UInt8, 0xff, 1),
            1
        );
        assert_eq!(
            binary_operation(OpcodeType::CompareLt, BaseType::Int8, 0xff, 1),
            1
        );
    }

    #[test]
    fn test_shift_masking() {
        // Shift amounts mask to the operand width: 9 % 8 == 1 for u8
        assert_eq!(
            binary_operation(OpcodeType::ArithmShl, BaseType::UInt8, 1, 9),
            2
        );
        // Arithmetic right shift for signed types
        assert_eq!(
            binary_operation(OpcodeType::ArithmShr, BaseType::Int8, 0x80, 1) as i64,
            -64
        );
    }

    #[test]
    fn test_truncate_value() {
        assert_eq!(truncate_value(BaseType::UInt8, 0x1ff), 0xff);
        assert_eq!(truncate_value(BaseType::Int8, 0xff) as i64, -1);
        assert_eq!(truncate_value(BaseType::UInt32, u64::MAX), 0xffff_ffff);
    }

    #[test]
    fn test_flat_memory_roundtrip_and_fault() {
        let mut memory = FlatMemory::new(16);
        memory.write32(4, 0xdead_beef).unwrap();
        assert_eq!(memory.read32(4).unwrap(), 0xdead_beef);
        // Big-endian byte order, as the simulated console expects
        assert_eq!(memory.read8(4).unwrap(), 0xde);
        assert!(memory.read32(14).is_err());
        assert!(memory.write8(16, 0).is_err());
    }
}
