// citron-parser - Property tests for the line lexer
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use citron_parser::{split_line_into_tokens, FlyweightStr, ParserToken};
use proptest::prelude::*;

fn lex(input: &str) -> Result<Vec<ParserToken>, citron_parser::LexError> {
    let mut tokens = Vec::new();
    split_line_into_tokens(input, 1, &mut tokens).map(|_| tokens)
}

proptest! {
    /// Any plain identifier lexes to exactly one identifier token (unless it
    /// collides with a keyword, type name or reserved word).
    #[test]
    fn identifiers_lex_to_single_token(name in "[a-zA-Z_][a-zA-Z0-9_]{0,20}") {
        match lex(&name) {
            Ok(tokens) => {
                prop_assert_eq!(tokens.len(), 1);
                match &tokens[0] {
                    ParserToken::Identifier(ident) => {
                        prop_assert_eq!(ident, &FlyweightStr::new(&name));
                    }
                    // Keywords, type names and true/false are fine too
                    ParserToken::Keyword(_)
                    | ParserToken::VarType(_)
                    | ParserToken::IntLiteral(_) => {}
                    other => prop_assert!(false, "unexpected token {:?}", other),
                }
            }
            // Reserved identifiers refuse to lex; that is the contract
            Err(_) => {}
        }
    }

    /// Decimal, hex and binary renderings of a value all lex to the same
    /// integer literal.
    #[test]
    fn integer_literal_radixes_agree(value in any::<u32>()) {
        let decimal = lex(&format!("{}", value)).unwrap();
        let hex = lex(&format!("{:#x}", value)).unwrap();
        let binary = lex(&format!("{:#b}", value)).unwrap();
        prop_assert_eq!(&decimal, &vec![ParserToken::IntLiteral(value as u64)]);
        prop_assert_eq!(&hex, &decimal);
        prop_assert_eq!(&binary, &decimal);
    }

    /// String literals with arbitrary escapable content survive lexing.
    #[test]
    fn string_literals_roundtrip(content in "[a-zA-Z0-9 .,;:!?+*/-]{0,32}") {
        let tokens = lex(&format!("\"{}\"", content)).unwrap();
        prop_assert_eq!(tokens.len(), 1);
        match &tokens[0] {
            ParserToken::StringLiteral(s) => prop_assert_eq!(s.as_str(), content.as_str()),
            other => prop_assert!(false, "unexpected token {:?}", other),
        }
    }

    /// The lexer never panics on arbitrary input lines.
    #[test]
    fn lexer_total_on_arbitrary_input(line in "\\PC{0,64}") {
        let _ = lex(&line);
    }
}
