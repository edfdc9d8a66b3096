// citron-vm - Compile error types
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Compile-time error types.
//!
//! Errors raised anywhere in the pipeline carry the flattened line number
//! they occurred on; the compile driver translates that back into a source
//! file and local line and buffers an [`ErrorMessage`] for the host.

use std::fmt;

/// Kind of a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// File not found, unreadable or invalid encoding.
    Load,
    /// Malformed directive, unterminated `#if`, bad condition.
    Preprocess,
    /// Unmatched parenthesis, stray operator or keyword, unexpected token.
    Parse,
    /// Unknown identifier, duplicate local, void variable, no overload.
    Semantic,
    /// Explicit cast not permitted between the given types.
    Cast,
    /// Unreachable branch, frame-size overflow.
    Backend,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CompileErrorKind::Load => "load error",
            CompileErrorKind::Preprocess => "preprocessor error",
            CompileErrorKind::Parse => "parse error",
            CompileErrorKind::Semantic => "semantic error",
            CompileErrorKind::Cast => "cast error",
            CompileErrorKind::Backend => "backend error",
        };
        f.write_str(text)
    }
}

/// A compile error with its flattened line number.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    /// 1-based flattened line number; 0 when no line applies.
    pub line: u32,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>, line: u32) -> Self {
        CompileError {
            kind,
            message: message.into(),
            line,
        }
    }

    pub fn load(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Load, message, line)
    }

    pub fn preprocess(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Preprocess, message, line)
    }

    pub fn parse(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Parse, message, line)
    }

    pub fn semantic(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Semantic, message, line)
    }

    pub fn cast(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Cast, message, line)
    }

    pub fn backend(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Backend, message, line)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in line {}: {}", self.kind, self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

/// A host-facing diagnostic record with the line translated back to its
/// source file.
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub filename: String,
    /// 1-based line inside the source file.
    pub line: u32,
    pub kind: CompileErrorKind,
    pub text: String,
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}: {}", self.filename, self.line, self.kind, self.text)
    }
}
