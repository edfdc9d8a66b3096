// citron-parser - Lexer token model
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Tokens produced by the line lexer.
//!
//! These are the raw, flat tokens of a single source line. The compiler
//! frontend converts them into its own tree-building token type.

use std::fmt;

use crate::{DataType, FlyweightStr, Keyword, Operator};

/// A raw token from one source line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserToken {
    Keyword(Keyword),
    /// A predefined type name (`u8`, `string`, ...).
    VarType(DataType),
    Operator(Operator),
    /// A `@label` reference; the name includes the `@` prefix.
    Label(FlyweightStr),
    /// A `//# ...` pragma; content with the marker stripped.
    Pragma(String),
    /// An integer literal. Constants are untyped until context assigns a type.
    IntLiteral(u64),
    /// A double-quoted string literal, already unescaped and interned.
    StringLiteral(FlyweightStr),
    Identifier(FlyweightStr),
}

impl fmt::Display for ParserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserToken::Keyword(kw) => write!(f, "{:?}", kw),
            ParserToken::VarType(dt) => write!(f, "{}", dt),
            ParserToken::Operator(op) => write!(f, "{}", op.characters()),
            ParserToken::Label(name) => write!(f, "{}", name),
            ParserToken::Pragma(content) => write!(f, "//# {}", content),
            ParserToken::IntLiteral(value) => write!(f, "{}", value),
            ParserToken::StringLiteral(s) => write!(f, "{:?}", s.as_str()),
            ParserToken::Identifier(name) => write!(f, "{}", name),
        }
    }
}
