// citron-parser - Line lexer
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The line lexer: splits one preprocessed source line into [`ParserToken`]s.
//!
//! Lexing is strictly line-oriented; block comments never reach this stage
//! (the preprocessor strips them). `//` comments end the line here, and a
//! `//#` comment becomes a pragma token instead.

use std::fmt;

use crate::keyword::is_reserved_identifier;
use crate::operator::{is_operator_character, match_operator};
use crate::{DataType, FlyweightStr, Keyword, Operator, ParserToken};

/// Error from lexing a single line.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

impl LexError {
    fn new(message: impl Into<String>, line: u32) -> Self {
        LexError {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lex error in line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

#[inline]
fn is_identifier_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[inline]
fn is_identifier_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
}

/// Split one source line into tokens, appending to `out`.
pub fn split_line_into_tokens(
    input: &str,
    line_number: u32,
    out: &mut Vec<ParserToken>,
) -> Result<(), LexError> {
    let bytes = input.as_bytes();
    let length = bytes.len();
    let mut pos = 0usize;

    while pos < length {
        let first = bytes[pos];

        if first == b'{' {
            out.push(ParserToken::Keyword(Keyword::BlockBegin));
            pos += 1;
        } else if first == b'}' {
            out.push(ParserToken::Keyword(Keyword::BlockEnd));
            pos += 1;
        } else if first.is_ascii_digit() {
            let (value, bytes_read) = collect_number(&input[pos..], line_number)?;
            out.push(ParserToken::IntLiteral(value));
            pos += bytes_read;
        } else if is_identifier_start(first) {
            let mut end = pos + 1;
            while end < length && is_identifier_char(bytes[end]) {
                end += 1;
            }
            analyse_identifier(&input[pos..end], line_number, out)?;
            pos = end;
        } else if first == b'@' {
            // Label; the token name keeps the '@' prefix
            let mut end = pos + 1;
            while end < length && is_identifier_char(bytes[end]) {
                end += 1;
            }
            out.push(ParserToken::Label(FlyweightStr::new(&input[pos..end])));
            pos = end;
        } else if is_operator_character(first as char) {
            // A run of operator characters, split greedily into operators
            let mut run_end = pos;
            while run_end < length && is_operator_character(bytes[run_end] as char) {
                run_end += 1;
            }
            let mut i = pos;
            while i < run_end {
                let (op, op_len) = match_operator(&input[i..run_end])
                    .ok_or_else(|| LexError::new("Operator not recognized", line_number))?;

                if op == Operator::BinaryDivide && i + 1 < length && bytes[i + 1] == b'/' {
                    // Line comment; check for a pragma marker
                    let mut rest = i + 2;
                    if rest < length && bytes[rest] == b'#' {
                        rest += 1;
                        while rest < length && (bytes[rest] == b' ' || bytes[rest] == b'\t') {
                            rest += 1;
                        }
                        out.push(ParserToken::Pragma(input[rest..].to_string()));
                    }
                    return Ok(());
                }

                out.push(ParserToken::Operator(op));
                i += op_len;
            }
            pos = run_end;
        } else if first == b'"' {
            let (literal, bytes_read) = collect_string_literal(&input[pos + 1..], line_number)?;
            out.push(ParserToken::StringLiteral(FlyweightStr::new(&literal)));
            pos += bytes_read + 1;
        } else {
            // Whitespace and anything else
            pos += 1;
        }
    }

    Ok(())
}

fn analyse_identifier(
    identifier: &str,
    line_number: u32,
    out: &mut Vec<ParserToken>,
) -> Result<(), LexError> {
    if let Some(data_type) = DataType::by_name(identifier) {
        out.push(ParserToken::VarType(data_type));
        return Ok(());
    }
    if let Some(keyword) = Keyword::by_name(identifier) {
        out.push(ParserToken::Keyword(keyword));
        return Ok(());
    }
    if is_reserved_identifier(identifier) {
        return Err(LexError::new(
            format!(
                "Reserved keyword '{}' cannot be used as an identifier, please rename",
                identifier
            ),
            line_number,
        ));
    }
    match identifier {
        "true" => out.push(ParserToken::IntLiteral(1)),
        "false" => out.push(ParserToken::IntLiteral(0)),
        _ => out.push(ParserToken::Identifier(FlyweightStr::new(identifier))),
    }
    Ok(())
}

/// Parse an integer literal: decimal, `0x...` hex or `0b...` binary.
/// Returns the value and the number of bytes consumed.
fn collect_number(input: &str, line_number: u32) -> Result<(u64, usize), LexError> {
    let bytes = input.as_bytes();
    let mut end = 0;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    let text = &input[..end];
    let digits = text.replace('_', "");

    let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2)
    } else {
        digits.parse::<u64>()
    };

    // Floating-point literals are not part of the language
    if bytes.get(end) == Some(&b'.') {
        return Err(LexError::new(
            format!("Invalid number '{}.'", text),
            line_number,
        ));
    }

    match parsed {
        Ok(value) => Ok((value, end)),
        Err(_) => Err(LexError::new(
            format!("Invalid number '{}'", text),
            line_number,
        )),
    }
}

/// Collect a string literal after the opening quote, resolving escapes.
/// Returns the unescaped content and the bytes consumed including the
/// closing quote.
fn collect_string_literal(input: &str, line_number: u32) -> Result<(String, usize), LexError> {
    let bytes = input.as_bytes();
    let mut output = String::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Ok((output, pos + 1)),
            b'\\' => {
                pos += 1;
                let escaped = *bytes
                    .get(pos)
                    .ok_or_else(|| LexError::new("Unterminated escape in string", line_number))?;
                match escaped {
                    b'n' => output.push('\n'),
                    b't' => output.push('\t'),
                    b'r' => output.push('\r'),
                    b'0' => output.push('\0'),
                    b'"' => output.push('"'),
                    b'\\' => output.push('\\'),
                    other => {
                        return Err(LexError::new(
                            format!("Unknown escape '\\{}' in string", other as char),
                            line_number,
                        ));
                    }
                }
                pos += 1;
            }
            _ => {
                // Copy the full UTF-8 character
                let ch_len = input[pos..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
                output.push_str(&input[pos..pos + ch_len]);
                pos += ch_len;
            }
        }
    }
    Err(LexError::new("Unterminated string literal", line_number))
}

// ============================================================================
// Tests
// ============================================================================
