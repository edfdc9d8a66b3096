// citron-core - Constants, constant arrays and defines
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Named constants, constant arrays and define substitutions.

use citron_parser::{DataType, FlyweightStr, ParserToken};

/// A named compile-time constant.
#[derive(Debug, Clone)]
pub struct Constant {
    pub name: FlyweightStr,
    pub data_type: DataType,
    pub value: u64,
}

/// A read-only array of constants, accessed at runtime through the builtin
/// constant-array access function.
#[derive(Debug, Clone)]
pub struct ConstantArray {
    pub name: FlyweightStr,
    pub id: u32,
    pub element_type: DataType,
    pub values: Vec<u64>,
}

impl ConstantArray {
    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> Option<u64> {
        self.values.get(index).copied()
    }
}

/// A define: a named token sequence spliced in wherever its name appears.
///
/// Content is kept as raw lexer tokens; the frontend converts and resolves
/// them at each expansion site, which also lets defines reference other
/// defines declared later.
#[derive(Debug, Clone)]
pub struct Define {
    pub name: FlyweightStr,
    pub data_type: DataType,
    pub content: Vec<ParserToken>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_array_access() {
        let array = ConstantArray {
            name: FlyweightStr::new("table"),
            id: 0,
            element_type: DataType::U16,
            values: vec![10, 20, 30],
        };
        assert_eq!(array.size(), 3);
        assert_eq!(array.value(1), Some(20));
        assert_eq!(array.value(3), None);
    }
}
