// citron-vm - Preprocessor
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The preprocessor: `#if`/`#elif`/`#else`/`#endif` blocks, `#define`,
//! `#error`, and block-comment stripping.
//!
//! Runs over the raw lines of one file before includes are resolved.
//! Suppressed lines and directive lines are cleared rather than removed so
//! line numbers stay stable for diagnostics.

use citron_core::{Expr, ParenKind, PreprocessorDefinitionMap, Statement, Token, TokenList};
use citron_parser::{split_line_into_tokens, DataType, FlyweightStr, Operator, ParserToken};

use super::error::{CompileError, CompileResult};
use super::token_processing::{
    process_binary_operations, process_parentheses, process_unary_operations,
};

/// One open `#if`/`#elif` block.
struct Block {
    /// Whether this block's own condition holds.
    condition: bool,
    /// Whether every enclosing block's condition holds.
    inherited_condition: bool,
    /// Set on `#elif` blocks: popping this block also pops its parent.
    collapse_parent: bool,
}

/// The preprocessor for one file's lines.
pub struct Preprocessor<'a> {
    definitions: &'a mut PreprocessorDefinitionMap,
    /// Definitions first introduced by this run, for module registration.
    pub new_definitions: Vec<(FlyweightStr, i64)>,
    line_number: u32,
}

impl<'a> Preprocessor<'a> {
    pub fn new(definitions: &'a mut PreprocessorDefinitionMap) -> Self {
        Preprocessor {
            definitions,
            new_definitions: Vec::new(),
            line_number: 0,
        }
    }

    pub fn process_lines(&mut self, lines: &mut [String]) -> CompileResult<()> {
        let mut blocks: Vec<Block> = Vec::new();
        let mut in_block_comment = false;

        let should_consider = |blocks: &[Block]| -> bool {
            blocks
                .last()
                .map(|b| b.condition && b.inherited_condition)
                .unwrap_or(true)
        };

        for (line_index, line) in lines.iter_mut().enumerate() {
            self.line_number = line_index as u32 + 1;

            if !in_block_comment {
                // A directive is a '#' after nothing but whitespace
                let trimmed = line.trim_start();
                if let Some(rest) = trimmed.strip_prefix('#') {
                    let rest = strip_line_comment(rest);
                    if let Some(condition) = rest.strip_prefix("if ") {
                        let is_true = self.evaluate_condition(condition)?;
                        let inherited = should_consider(&blocks);
                        blocks.push(Block {
                            condition: is_true,
                            inherited_condition: inherited,
                            collapse_parent: false,
                        });
                    } else if let Some(condition) = rest.strip_prefix("elif ") {
                        let parent = blocks.last_mut().ok_or_else(|| {
                            CompileError::preprocess("Found no #if for #elif", self.line_number)
                        })?;
                        parent.condition = !parent.condition;
                        let is_true = self.evaluate_condition(condition)?;
                        let inherited = should_consider(&blocks);
                        blocks.push(Block {
                            condition: is_true,
                            inherited_condition: inherited,
                            collapse_parent: true,
                        });
                    } else if rest.starts_with("else") {
                        let block = blocks.last_mut().ok_or_else(|| {
                            CompileError::preprocess("Found no #if for #else", self.line_number)
                        })?;
                        block.condition = !block.condition;
                    } else if rest.starts_with("endif") {
                        if blocks.is_empty() {
                            return Err(CompileError::preprocess(
                                "Found no #if for #endif",
                                self.line_number,
                            ));
                        }
                        while blocks.last().map(|b| b.collapse_parent).unwrap_or(false) {
                            blocks.pop();
                        }
                        if blocks.pop().is_none() {
                            return Err(CompileError::preprocess(
                                "Something went wrong in evaluating #endif",
                                self.line_number,
                            ));
                        }
                    } else if should_consider(&blocks) {
                        if let Some(definition) = rest.strip_prefix("define ") {
                            self.process_definition(definition)?;
                        } else if let Some(message) = rest.strip_prefix("error ") {
                            return Err(CompileError::preprocess(
                                message.trim().to_string(),
                                self.line_number,
                            ));
                        } else {
                            return Err(CompileError::preprocess(
                                "Invalid preprocessor directive",
                                self.line_number,
                            ));
                        }
                    }

                    // Directive lines never reach the parser
                    line.clear();
                    continue;
                }
            }

            if !in_block_comment && !should_consider(&blocks) {
                line.clear();
                continue;
            }

            in_block_comment = strip_block_comments(line, in_block_comment);
        }

        if !blocks.is_empty() {
            return Err(CompileError::preprocess(
                "Not all preprocessor blocks closed",
                self.line_number,
            ));
        }
        if in_block_comment {
            return Err(CompileError::preprocess(
                "Still inside a block comment at end of file",
                self.line_number,
            ));
        }
        Ok(())
    }

    fn lex(&self, input: &str) -> CompileResult<Vec<ParserToken>> {
        let mut tokens = Vec::new();
        split_line_into_tokens(input, self.line_number, &mut tokens)
            .map_err(|e| CompileError::preprocess(e.message, self.line_number))?;
        Ok(tokens)
    }

    fn evaluate_condition(&mut self, input: &str) -> CompileResult<bool> {
        let parser_tokens = self.lex(strip_line_comment(input))?;
        if parser_tokens.is_empty() {
            return Err(CompileError::preprocess(
                "Empty condition after preprocessor #if",
                self.line_number,
            ));
        }
        Ok(self.evaluate_expression(&parser_tokens)? != 0)
    }

    fn process_definition(&mut self, input: &str) -> CompileResult<()> {
        let parser_tokens = self.lex(strip_line_comment(input))?;
        let name = match parser_tokens.first() {
            Some(ParserToken::Identifier(name)) => name.clone(),
            _ => {
                return Err(CompileError::preprocess(
                    "Expected an identifier after #define",
                    self.line_number,
                ));
            }
        };

        let mut value = 1i64;
        if parser_tokens.len() >= 2 {
            // The '=' between name and value is optional
            let value_start =
                if matches!(parser_tokens[1], ParserToken::Operator(Operator::Assign)) {
                    2
                } else {
                    1
                };
            if value_start >= parser_tokens.len() {
                return Err(CompileError::preprocess(
                    "Missing value in #define",
                    self.line_number,
                ));
            }
            value = self.evaluate_expression(&parser_tokens[value_start..])?;
        }

        if self.definitions.set(name.clone(), value) {
            self.new_definitions.push((name, value));
        }
        Ok(())
    }

    /// Evaluate a constant expression over the definition map. Unknown
    /// identifiers read as 0.
    fn evaluate_expression(&self, parser_tokens: &[ParserToken]) -> CompileResult<i64> {
        let mut tokens: TokenList = Vec::with_capacity(parser_tokens.len());
        for token in parser_tokens {
            let converted = match token {
                ParserToken::Operator(op) => Token::Operator(*op),
                ParserToken::IntLiteral(value) => {
                    Token::Stmt(Statement::constant(*value, DataType::CONST_INT))
                }
                ParserToken::Identifier(name) => Token::Stmt(Statement::constant(
                    self.definitions.value(name.hash()) as u64,
                    DataType::CONST_INT,
                )),
                ParserToken::Keyword(_) => {
                    return Err(CompileError::preprocess(
                        "Keyword is not allowed in preprocessor statement",
                        self.line_number,
                    ));
                }
                ParserToken::VarType(_) => {
                    return Err(CompileError::preprocess(
                        "Type is not allowed in preprocessor statement",
                        self.line_number,
                    ));
                }
                ParserToken::Label(_) => {
                    return Err(CompileError::preprocess(
                        "Label is not allowed in preprocessor statement",
                        self.line_number,
                    ));
                }
                ParserToken::Pragma(_) => {
                    return Err(CompileError::preprocess(
                        "Pragma is not allowed in preprocessor statement",
                        self.line_number,
                    ));
                }
                ParserToken::StringLiteral(_) => {
                    return Err(CompileError::preprocess(
                        "String is not allowed in preprocessor statement",
                        self.line_number,
                    ));
                }
            };
            tokens.push(converted);
        }

        process_parentheses(&mut tokens, self.line_number)?;
        self.process_recursive(&mut tokens)?;

        if tokens.len() != 1 || !tokens[0].is_statement() {
            return Err(CompileError::preprocess(
                "Preprocessor condition must evaluate to a single statement",
                self.line_number,
            ));
        }
        self.evaluate_token(tokens[0].as_statement().unwrap())
    }

    fn process_recursive(&self, tokens: &mut TokenList) -> CompileResult<()> {
        for token in tokens.iter_mut() {
            if let Token::Stmt(Statement {
                expr: Expr::Parenthesis { content, .. },
                ..
            }) = token
            {
                self.process_recursive(content)?;
            }
        }
        process_unary_operations(tokens, self.line_number)?;
        process_binary_operations(tokens, self.line_number)?;
        Ok(())
    }

    fn evaluate_token(&self, statement: &Statement) -> CompileResult<i64> {
        match &statement.expr {
            Expr::Constant { value } => Ok(*value as i64),

            Expr::Parenthesis { kind, content } => {
                if *kind != ParenKind::Round {
                    return Err(CompileError::preprocess(
                        "Brackets are not allowed in preprocessor condition",
                        self.line_number,
                    ));
                }
                if content.len() != 1 || !content[0].is_statement() {
                    return Err(CompileError::preprocess(
                        "Parenthesis must contain exactly one statement",
                        self.line_number,
                    ));
                }
                self.evaluate_token(content[0].as_statement().unwrap())
            }

            Expr::Binary { op, left, right, .. } => {
                let evaluate = |s: &Statement| self.evaluate_token(s);
                let result = match op {
                    Operator::LogicalAnd => {
                        (evaluate(left)? != 0 && evaluate(right)? != 0) as i64
                    }
                    Operator::LogicalOr => {
                        (evaluate(left)? != 0 || evaluate(right)? != 0) as i64
                    }
                    Operator::CompareEqual => (evaluate(left)? == evaluate(right)?) as i64,
                    Operator::CompareNotEqual => (evaluate(left)? != evaluate(right)?) as i64,
                    Operator::CompareLess => (evaluate(left)? < evaluate(right)?) as i64,
                    Operator::CompareLessOrEqual => (evaluate(left)? <= evaluate(right)?) as i64,
                    Operator::CompareGreater => (evaluate(left)? > evaluate(right)?) as i64,
                    Operator::CompareGreaterOrEqual => {
                        (evaluate(left)? >= evaluate(right)?) as i64
                    }
                    Operator::BinaryPlus => evaluate(left)?.wrapping_add(evaluate(right)?),
                    Operator::BinaryMinus => evaluate(left)?.wrapping_sub(evaluate(right)?),
                    Operator::BinaryMultiply => evaluate(left)?.wrapping_mul(evaluate(right)?),
                    Operator::BinaryDivide => {
                        let divisor = evaluate(right)?;
                        if divisor == 0 {
                            0
                        } else {
                            evaluate(left)?.wrapping_div(divisor)
                        }
                    }
                    Operator::BinaryModulo => {
                        let divisor = evaluate(right)?;
                        if divisor == 0 {
                            0
                        } else {
                            evaluate(left)?.wrapping_rem(divisor)
                        }
                    }
                    Operator::BinaryAnd => evaluate(left)? & evaluate(right)?,
                    Operator::BinaryOr => evaluate(left)? | evaluate(right)?,
                    Operator::BinaryXor => evaluate(left)? ^ evaluate(right)?,
                    _ => {
                        return Err(CompileError::preprocess(
                            "Operator not allowed in preprocessor condition",
                            self.line_number,
                        ));
                    }
                };
                Ok(result)
            }

            Expr::Unary { op, arg } => match op {
                Operator::UnaryNot => Ok((self.evaluate_token(arg)? == 0) as i64),
                Operator::BinaryMinus => Ok(self.evaluate_token(arg)?.wrapping_neg()),
                Operator::UnaryBitnot => Ok(!self.evaluate_token(arg)?),
                _ => Err(CompileError::preprocess(
                    "Operator not allowed in preprocessor condition",
                    self.line_number,
                )),
            },

            _ => Err(CompileError::preprocess(
                "Token type not supported in preprocessor condition",
                self.line_number,
            )),
        }
    }
}

/// Cut a trailing `//` comment (string literals shield the marker).
fn strip_line_comment(input: &str) -> &str {
    let bytes = input.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_string = !in_string,
            b'\\' if in_string => i += 1,
            b'/' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                return input[..i].trim_end();
            }
            _ => {}
        }
        i += 1;
    }
    input.trim_end()
}

/// Remove block-comment content from a line, honoring string literals and
/// `//` comments. Returns whether a block comment is still open afterwards.
fn strip_block_comments(line: &mut String, mut in_block_comment: bool) -> bool {
    let mut output = String::with_capacity(line.len());
    let bytes: Vec<u8> = line.bytes().collect();
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        if in_block_comment {
            if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                in_block_comment = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        match bytes[i] {
            b'"' if !in_string => {
                in_string = true;
                output.push('"');
                i += 1;
            }
            b'"' if in_string => {
                in_string = false;
                output.push('"');
                i += 1;
            }
            b'\\' if in_string => {
                output.push(bytes[i] as char);
                if i + 1 < bytes.len() {
                    output.push(bytes[i + 1] as char);
                }
                i += 2;
            }
            b'/' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                // Line comment: keep as-is, the lexer evaluates pragmas
                output.push_str(std::str::from_utf8(&bytes[i..]).unwrap_or(""));
                break;
            }
            b'/' if !in_string && i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                in_block_comment = true;
                i += 2;
            }
            _ => {
                // Copy the full UTF-8 character
                let remainder = std::str::from_utf8(&bytes[i..]).unwrap_or("");
                if let Some(c) = remainder.chars().next() {
                    output.push(c);
                    i += c.len_utf8();
                } else {
                    i += 1;
                }
            }
        }
    }

    *line = output;
    in_block_comment
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str]) -> (Vec<String>, PreprocessorDefinitionMap) {
        let mut definitions = PreprocessorDefinitionMap::default();
        let mut owned: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        {
            let mut preprocessor = Preprocessor::new(&mut definitions);
            preprocessor.process_lines(&mut owned).expect("preprocess");
        }
        (owned, definitions)
    }

    #[test]
    fn test_define_and_if() {
        let (lines, definitions) = run(&[
            "#define FEATURE = 1",
            "#if FEATURE",
            "kept",
            "#else",
            "dropped",
            "#endif",
        ]);
        assert_eq!(definitions.value(FlyweightStr::new("FEATURE").hash()), 1);
        assert_eq!(lines[2], "kept");
        assert_eq!(lines[4], "");
    }

    #[test]
    fn test_define_without_assign() {
        let (_, definitions) = run(&["#define COUNT 5"]);
        assert_eq!(definitions.value(FlyweightStr::new("COUNT").hash()), 5);
    }

    #[test]
    fn test_unknown_identifier_is_zero() {
        let (lines, _) = run(&["#if UNKNOWN", "dropped", "#endif"]);
        assert_eq!(lines[1], "");
    }

    #[test]
    fn test_elif_chains() {
        let (lines, _) = run(&[
            "#define MODE = 2",
            "#if MODE == 1",
            "one",
            "#elif MODE == 2",
            "two",
            "#else",
            "other",
            "#endif",
        ]);
        assert_eq!(lines[2], "");
        assert_eq!(lines[4], "two");
        assert_eq!(lines[6], "");
    }

    #[test]
    fn test_nested_suppression() {
        let (lines, _) = run(&[
            "#if 0",
            "#if 1",
            "inner",
            "#endif",
            "outer",
            "#endif",
        ]);
        assert_eq!(lines[2], "");
        assert_eq!(lines[4], "");
    }

    #[test]
    fn test_block_comments_span_lines() {
        let (lines, _) = run(&["before /* comment", "still comment", "done */ after"]);
        assert_eq!(lines[0], "before ");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], " after");
    }

    #[test]
    fn test_string_shields_comment_markers() {
        let (lines, _) = run(&[r#"x = "/* not a comment""#]);
        assert_eq!(lines[0], r#"x = "/* not a comment""#);
    }

    #[test]
    fn test_unterminated_if_errors() {
        let mut definitions = PreprocessorDefinitionMap::default();
        let mut lines = vec!["#if 1".to_string()];
        let mut preprocessor = Preprocessor::new(&mut definitions);
        assert!(preprocessor.process_lines(&mut lines).is_err());
    }

    #[test]
    fn test_error_directive() {
        let mut definitions = PreprocessorDefinitionMap::default();
        let mut lines = vec!["#error something broke".to_string()];
        let mut preprocessor = Preprocessor::new(&mut definitions);
        let error = preprocessor.process_lines(&mut lines).unwrap_err();
        assert!(error.message.contains("something broke"));
    }

    #[test]
    fn test_condition_expressions() {
        let (lines, _) = run(&[
            "#define A = 3",
            "#define B = 4",
            "#if A + 1 == B && !(A > B)",
            "kept",
            "#endif",
        ]);
        assert_eq!(lines[3], "kept");
    }
}
