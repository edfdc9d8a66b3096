// citron-vm - Builtin native functions
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The `core` module: builtin functions every program compiles against.
//!
//! This covers the functions the frontend itself binds operations to (the
//! constant-array access and the string operators) plus a small standard
//! library. The engine installs this module before compiling any script.

use std::rc::Rc;

use citron_core::{
    GlobalsLookup, Module, NativeCallContext, NativeFlags, Parameter, ParameterList,
};
use citron_parser::{DataType, FlyweightStr};

pub const CONSTANT_ARRAY_ACCESS: &str = "#builtin_constant_array_access";
pub const STRING_OPERATOR_PLUS: &str = "#builtin_string_operator_plus";
pub const STRING_OPERATOR_PLUS_INT64: &str = "#builtin_string_operator_plus_int64";
pub const STRING_OPERATOR_PLUS_INT64_INV: &str = "#builtin_string_operator_plus_int64_inv";
pub const STRING_OPERATOR_LESS: &str = "#builtin_string_operator_less";
pub const STRING_OPERATOR_LESS_OR_EQUAL: &str = "#builtin_string_operator_less_or_equal";
pub const STRING_OPERATOR_GREATER: &str = "#builtin_string_operator_greater";
pub const STRING_OPERATOR_GREATER_OR_EQUAL: &str = "#builtin_string_operator_greater_or_equal";

fn parameters(types: &[(&str, DataType)]) -> ParameterList {
    types
        .iter()
        .map(|(name, data_type)| Parameter {
            name: FlyweightStr::new(name),
            data_type: *data_type,
        })
        .collect()
}

fn resolve_string(ctx: &dyn NativeCallContext, key: u64) -> Result<FlyweightStr, String> {
    ctx.resolve_string(key)
        .ok_or_else(|| format!("unresolved string key {:#018x}", key))
}

/// Build the `core` module holding the builtin functions.
pub fn create_core_module(globals: &GlobalsLookup) -> Module {
    let mut module = Module::new("core");
    module.start_compiling(globals);

    let inline = NativeFlags {
        allow_inline_execution: true,
        compile_time_constant: false,
    };
    let pure = NativeFlags {
        allow_inline_execution: true,
        compile_time_constant: true,
    };

    // Constant array access, one overload per element type; the frontend
    // picks the one matching the array's element type
    for element_type in DataType::INTEGERS_WIDEST_FIRST {
        module.add_native_function(
            CONSTANT_ARRAY_ACCESS,
            element_type,
            parameters(&[("id", DataType::U32), ("index", DataType::U32)]),
            inline,
            Rc::new(|ctx: &mut dyn NativeCallContext| {
                let index = ctx.pop();
                let id = ctx.pop() as u32;
                let value = ctx
                    .constant_array_value(id, index)
                    .ok_or_else(|| format!("constant array access out of bounds (array {}, index {})", id, index))?;
                ctx.push(value);
                Ok(())
            }),
        );
    }

    // String operators bound by the frontend for +, <, <=, >, >=
    module.add_native_function(
        STRING_OPERATOR_PLUS,
        DataType::Str,
        parameters(&[("left", DataType::Str), ("right", DataType::Str)]),
        inline,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let right = ctx.pop();
            let left = ctx.pop();
            let left = resolve_string(ctx, left)?;
            let right = resolve_string(ctx, right)?;
            let combined = format!("{}{}", left, right);
            let key = ctx.intern_string(&combined);
            ctx.push(key);
            Ok(())
        }),
    );
    module.add_native_function(
        STRING_OPERATOR_PLUS_INT64,
        DataType::Str,
        parameters(&[("left", DataType::Str), ("right", DataType::S64)]),
        inline,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let right = ctx.pop() as i64;
            let left = ctx.pop();
            let left = resolve_string(ctx, left)?;
            let combined = format!("{}{}", left, right);
            let key = ctx.intern_string(&combined);
            ctx.push(key);
            Ok(())
        }),
    );
    module.add_native_function(
        STRING_OPERATOR_PLUS_INT64_INV,
        DataType::Str,
        parameters(&[("left", DataType::S64), ("right", DataType::Str)]),
        inline,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let right = ctx.pop();
            let left = ctx.pop() as i64;
            let right = resolve_string(ctx, right)?;
            let combined = format!("{}{}", left, right);
            let key = ctx.intern_string(&combined);
            ctx.push(key);
            Ok(())
        }),
    );

    let comparisons: [(&str, fn(&str, &str) -> bool); 4] = [
        (STRING_OPERATOR_LESS, |a, b| a < b),
        (STRING_OPERATOR_LESS_OR_EQUAL, |a, b| a <= b),
        (STRING_OPERATOR_GREATER, |a, b| a > b),
        (STRING_OPERATOR_GREATER_OR_EQUAL, |a, b| a >= b),
    ];
    for (name, compare) in comparisons {
        module.add_native_function(
            name,
            DataType::BOOL,
            parameters(&[("left", DataType::Str), ("right", DataType::Str)]),
            inline,
            Rc::new(move |ctx: &mut dyn NativeCallContext| {
                let right = ctx.pop();
                let left = ctx.pop();
                let left = resolve_string(ctx, left)?;
                let right = resolve_string(ctx, right)?;
                ctx.push(compare(left.as_str(), right.as_str()) as u64);
                Ok(())
            }),
        );
    }

    // Small standard library
    module.add_native_function(
        "min",
        DataType::S64,
        parameters(&[("a", DataType::S64), ("b", DataType::S64)]),
        pure,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let b = ctx.pop() as i64;
            let a = ctx.pop() as i64;
            ctx.push(a.min(b) as u64);
            Ok(())
        }),
    );
    module.add_native_function(
        "max",
        DataType::S64,
        parameters(&[("a", DataType::S64), ("b", DataType::S64)]),
        pure,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let b = ctx.pop() as i64;
            let a = ctx.pop() as i64;
            ctx.push(a.max(b) as u64);
            Ok(())
        }),
    );
    module.add_native_function(
        "clamp",
        DataType::S64,
        parameters(&[
            ("value", DataType::S64),
            ("low", DataType::S64),
            ("high", DataType::S64),
        ]),
        pure,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let high = ctx.pop() as i64;
            let low = ctx.pop() as i64;
            let value = ctx.pop() as i64;
            ctx.push(value.max(low).min(high) as u64);
            Ok(())
        }),
    );
    module.add_native_function(
        "abs",
        DataType::S64,
        parameters(&[("value", DataType::S64)]),
        pure,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let value = ctx.pop() as i64;
            ctx.push(value.wrapping_abs() as u64);
            Ok(())
        }),
    );

    module.add_native_function(
        "strlen",
        DataType::U32,
        parameters(&[("value", DataType::Str)]),
        inline,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let key = ctx.pop();
            let length = ctx.resolve_string(key).map(|s| s.as_str().len()).unwrap_or(0);
            ctx.push(length as u64);
            Ok(())
        }),
    );
    module.add_native_function(
        "getchar",
        DataType::U8,
        parameters(&[("value", DataType::Str), ("index", DataType::U32)]),
        inline,
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            let index = ctx.pop() as usize;
            let key = ctx.pop();
            let byte = ctx
                .resolve_string(key)
                .and_then(|s| s.as_str().as_bytes().get(index).copied())
                .unwrap_or(0);
            ctx.push(byte as u64);
            Ok(())
        }),
    );

    // Cooperative yield: the opcode loop returns to the host and the next
    // call continues from the same program counter
    module.add_native_function(
        "yieldExecution",
        DataType::Void,
        ParameterList::new(),
        NativeFlags::default(),
        Rc::new(|ctx: &mut dyn NativeCallContext| {
            ctx.signal_stop();
            Ok(())
        }),
    );

    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_module_contains_builtins() {
        let globals = GlobalsLookup::new();
        let module = create_core_module(&globals);
        assert!(module
            .functions
            .iter()
            .any(|f| f.name().as_str() == CONSTANT_ARRAY_ACCESS));
        assert!(module
            .functions
            .iter()
            .any(|f| f.name().as_str() == "yieldExecution"));

        // Eight constant-array overloads, one per element type
        let access_count = module
            .functions
            .iter()
            .filter(|f| f.name().as_str() == CONSTANT_ARRAY_ACCESS)
            .count();
        assert_eq!(access_count, 8);
    }
}
