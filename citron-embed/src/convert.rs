// citron-embed - Typed value conversion
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Conversion between Rust values and script stack values, and the typed
//! wrapper builders behind [`Engine::register_native`].
//!
//! Script values are raw 64-bit words; the traits here pair each Rust type
//! with its script data type so registered functions get correct signatures
//! and arguments arrive already converted.
//!
//! [`Engine::register_native`]: crate::Engine::register_native

use std::rc::Rc;

use citron_core::{NativeCallContext, NativeFn, Parameter, ParameterList};
use citron_parser::{DataType, FlyweightStr};

/// A Rust type usable as a native-function argument.
pub trait NativeArg: Sized {
    const DATA_TYPE: DataType;

    fn from_stack(ctx: &dyn NativeCallContext, raw: u64) -> Result<Self, String>;
}

/// A Rust type usable as a native-function return value.
pub trait NativeReturn {
    const DATA_TYPE: DataType;

    fn push_onto(self, ctx: &mut dyn NativeCallContext) -> Result<(), String>;
}

macro_rules! impl_numeric_conversions {
    ($($ty:ty => $data_type:expr),* $(,)?) => {
        $(
            impl NativeArg for $ty {
                const DATA_TYPE: DataType = $data_type;

                fn from_stack(_ctx: &dyn NativeCallContext, raw: u64) -> Result<Self, String> {
                    Ok(raw as $ty)
                }
            }

            impl NativeReturn for $ty {
                const DATA_TYPE: DataType = $data_type;

                fn push_onto(self, ctx: &mut dyn NativeCallContext) -> Result<(), String> {
                    ctx.push(self as i64 as u64);
                    Ok(())
                }
            }
        )*
    };
}

impl_numeric_conversions! {
    u8 => DataType::U8,
    u16 => DataType::U16,
    u32 => DataType::U32,
    u64 => DataType::U64,
    i8 => DataType::S8,
    i16 => DataType::S16,
    i32 => DataType::S32,
    i64 => DataType::S64,
}

impl NativeArg for bool {
    const DATA_TYPE: DataType = DataType::BOOL;

    fn from_stack(_ctx: &dyn NativeCallContext, raw: u64) -> Result<Self, String> {
        Ok(raw as u8 != 0)
    }
}

impl NativeReturn for bool {
    const DATA_TYPE: DataType = DataType::BOOL;

    fn push_onto(self, ctx: &mut dyn NativeCallContext) -> Result<(), String> {
        ctx.push(self as u64);
        Ok(())
    }
}

/// Strings arrive as keys into the runtime string table.
impl NativeArg for String {
    const DATA_TYPE: DataType = DataType::Str;

    fn from_stack(ctx: &dyn NativeCallContext, raw: u64) -> Result<Self, String> {
        ctx.resolve_string(raw)
            .map(|s| s.as_str().to_string())
            .ok_or_else(|| format!("unresolved string key {:#018x}", raw))
    }
}

impl NativeReturn for String {
    const DATA_TYPE: DataType = DataType::Str;

    fn push_onto(self, ctx: &mut dyn NativeCallContext) -> Result<(), String> {
        let key = ctx.intern_string(&self);
        ctx.push(key);
        Ok(())
    }
}

impl NativeArg for FlyweightStr {
    const DATA_TYPE: DataType = DataType::Str;

    fn from_stack(ctx: &dyn NativeCallContext, raw: u64) -> Result<Self, String> {
        ctx.resolve_string(raw)
            .ok_or_else(|| format!("unresolved string key {:#018x}", raw))
    }
}

impl NativeReturn for () {
    const DATA_TYPE: DataType = DataType::Void;

    fn push_onto(self, _ctx: &mut dyn NativeCallContext) -> Result<(), String> {
        Ok(())
    }
}

/// A Rust closure convertible into a typed native-function wrapper.
///
/// Implemented for closures of up to four arguments whose types implement
/// [`NativeArg`] and whose return type implements [`NativeReturn`]. The
/// generated wrapper pops the declared number of arguments (stack order is
/// declaration order, so pops run in reverse) and pushes the return value.
pub trait IntoNativeFn<Args> {
    fn signature(&self) -> (ParameterList, DataType);
    fn into_native_fn(self) -> NativeFn;
}

fn parameter(index: usize, data_type: DataType) -> Parameter {
    Parameter {
        name: FlyweightStr::new(&format!("arg{}", index)),
        data_type,
    }
}

macro_rules! impl_into_native_fn {
    ($($arg:ident : $index:tt),*) => {
        impl<FN, $($arg,)* RET> IntoNativeFn<($($arg,)*)> for FN
        where
            FN: Fn($($arg),*) -> RET + 'static,
            $($arg: NativeArg,)*
            RET: NativeReturn,
        {
            #[allow(unused_mut)]
            fn signature(&self) -> (ParameterList, DataType) {
                let mut parameters = ParameterList::new();
                $(parameters.push(parameter($index, $arg::DATA_TYPE));)*
                (parameters, RET::DATA_TYPE)
            }

            #[allow(unused_variables, unused_mut)]
            fn into_native_fn(self) -> NativeFn {
                Rc::new(move |ctx: &mut dyn NativeCallContext| {
                    // Pop in reverse declaration order
                    let count: usize = 0 $(+ { stringify!($arg); 1 })*;
                    let mut raws = [0u64; 4];
                    for slot in (0..count).rev() {
                        raws[slot] = ctx.pop();
                    }
                    let result = self($($arg::from_stack(ctx, raws[$index])?),*);
                    result.push_onto(ctx)
                })
            }
        }
    };
}

impl_into_native_fn!();
impl_into_native_fn!(A0: 0);
impl_into_native_fn!(A0: 0, A1: 1);
impl_into_native_fn!(A0: 0, A1: 1, A2: 2);
impl_into_native_fn!(A0: 0, A1: 1, A2: 2, A3: 3);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct TestContext {
        stack: Vec<u64>,
        strings: Vec<FlyweightStr>,
    }

    impl NativeCallContext for TestContext {
        fn pop(&mut self) -> u64 {
            self.stack.pop().unwrap_or(0)
        }

        fn push(&mut self, value: u64) {
            self.stack.push(value);
        }

        fn resolve_string(&self, key: u64) -> Option<FlyweightStr> {
            self.strings.iter().find(|s| s.hash() == key).cloned()
        }

        fn intern_string(&mut self, text: &str) -> u64 {
            let s = FlyweightStr::new(text);
            let key = s.hash();
            self.strings.push(s);
            key
        }

        fn constant_array_value(&self, _array_id: u32, _index: u64) -> Option<u64> {
            None
        }

        fn signal_stop(&mut self) {}
    }

    #[test]
    fn test_two_argument_wrapper() {
        let add = |a: u32, b: u32| -> u32 { a + b };
        let (parameters, return_type) = add.signature();
        assert_eq!(parameters.len(), 2);
        assert_eq!(parameters[0].data_type, DataType::U32);
        assert_eq!(return_type, DataType::U32);

        let wrapper = add.into_native_fn();
        let mut ctx = TestContext {
            stack: vec![7, 8],
            strings: Vec::new(),
        };
        wrapper(&mut ctx).unwrap();
        assert_eq!(ctx.stack, vec![15]);
    }

    #[test]
    fn test_signed_argument_wrapper() {
        let negate = |a: i16| -> i16 { -a };
        let wrapper = negate.into_native_fn();
        let mut ctx = TestContext {
            stack: vec![5],
            strings: Vec::new(),
        };
        wrapper(&mut ctx).unwrap();
        assert_eq!(ctx.stack[0] as i64, -5);
    }

    #[test]
    fn test_void_wrapper_pushes_nothing() {
        let noop = || {};
        let wrapper = noop.into_native_fn();
        let mut ctx = TestContext {
            stack: Vec::new(),
            strings: Vec::new(),
        };
        wrapper(&mut ctx).unwrap();
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_string_roundtrip() {
        let shout = |s: String| -> String { s.to_uppercase() };
        let wrapper = shout.into_native_fn();
        let mut ctx = TestContext {
            stack: Vec::new(),
            strings: Vec::new(),
        };
        let key = ctx.intern_string("hello");
        ctx.stack.push(key);
        wrapper(&mut ctx).unwrap();
        let result_key = ctx.stack[0];
        assert_eq!(
            ctx.resolve_string(result_key).unwrap().as_str(),
            "HELLO"
        );
    }
}
