// citron-parser - Lexer, interned strings and data types for the Citron scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Lexing and shared primitives of the Citron scripting toolchain.
//!
//! This crate holds everything both the compiler and the runtime need to
//! agree on: interned strings with stable 64-bit hashes, the data-type
//! registry with its byte encodings, the operator and keyword tables, and
//! the line lexer.

pub mod datatype;
pub mod flyweight;
pub mod keyword;
pub mod lexer;
pub mod operator;
pub mod token;

pub use datatype::{BaseCastType, BaseType, CustomDataType, DataType, IntSemantics, IntType, TypeClass};
pub use flyweight::{fnv1a_64, FlyweightStr};
pub use keyword::Keyword;
pub use lexer::{split_line_into_tokens, LexError};
pub use operator::{Operator, OperatorClass};
pub use token::ParserToken;
