// citron-vm - Compiler frontend
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The frontend: turns preprocessed lines into a block tree, registers
//! global definitions, and processes every function body into typed
//! statement nodes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use citron_core::{
    Expr, FunctionHandle, GlobalsLookup, LineNumberTranslation, Module, Parameter, ParameterList,
    ScriptFunction, Statement, Token, TokenList,
};
use citron_parser::{
    split_line_into_tokens, DataType, FlyweightStr, Keyword, Operator, ParserToken,
};

use super::error::{CompileError, CompileResult};
use super::nodes::{BlockNode, ExternalKind, FunctionEntry, Node};
use super::options::{CompileOptions, MAX_SCRIPT_FEATURE_LEVEL};
use super::token_processing::{convert_parser_token, FunctionContext, ScopeContext, TokenProcessing};

/// Run the whole frontend over the flattened line list.
///
/// On success the module contains every global definition and each returned
/// entry holds a function with its fully processed body, ready for the
/// backend.
pub fn run_frontend(
    module: &mut Module,
    globals: &mut GlobalsLookup,
    options: &mut CompileOptions,
    translation: &LineNumberTranslation,
    lines: &[String],
    errors: &mut Vec<CompileError>,
) -> CompileResult<Vec<FunctionEntry>> {
    let root = build_nodes_from_code_lines(lines, module, globals, options)?;
    let mut entries =
        process_global_definitions(root, module, globals, translation, options)?;

    // Function bodies are independent; collect their errors instead of
    // stopping at the first one
    let mut processing = TokenProcessing::new(globals, options);
    for entry in entries.iter_mut() {
        if let Err(error) = process_single_function(entry, &mut processing, module) {
            errors.push(error);
        }
    }
    for literal in processing.new_string_literals.drain(..) {
        module.add_string_literal(literal);
    }
    Ok(entries)
}

// ============================================================================
// Node building
// ============================================================================

fn build_nodes_from_code_lines(
    lines: &[String],
    module: &mut Module,
    globals: &GlobalsLookup,
    options: &mut CompileOptions,
) -> CompileResult<BlockNode> {
    let mut stack: Vec<BlockNode> = vec![BlockNode::default()];
    let mut parser_tokens: Vec<ParserToken> = Vec::new();
    let mut new_string_literals: Vec<FlyweightStr> = Vec::new();
    let mut line_number = 0u32;

    for line in lines {
        line_number += 1;

        parser_tokens.clear();
        split_line_into_tokens(line, line_number, &mut parser_tokens)
            .map_err(|e| CompileError::parse(e.message, line_number))?;
        if parser_tokens.is_empty() {
            continue;
        }

        match &parser_tokens[0] {
            ParserToken::Keyword(Keyword::BlockBegin) => {
                if parser_tokens.len() != 1 {
                    return Err(CompileError::parse(
                        "Curly brace must use its own line",
                        line_number,
                    ));
                }
                stack.push(BlockNode {
                    nodes: Vec::new(),
                    line: line_number,
                });
                continue;
            }
            ParserToken::Keyword(Keyword::BlockEnd) => {
                if parser_tokens.len() != 1 {
                    return Err(CompileError::parse(
                        "Curly brace must use its own line",
                        line_number,
                    ));
                }
                let closed = stack.pop().unwrap();
                let parent = stack.last_mut().ok_or_else(|| {
                    CompileError::parse("Closed too many blocks", line_number)
                })?;
                parent.nodes.push(Node::Block(closed));
                continue;
            }
            ParserToken::Pragma(content) => {
                if !process_global_pragma(content, options, line_number)? {
                    stack.last_mut().unwrap().nodes.push(Node::Pragma {
                        content: content.clone(),
                        line: line_number,
                    });
                }
                continue;
            }
            _ => {}
        }

        let mut tokens: TokenList = Vec::with_capacity(parser_tokens.len());
        for parser_token in &parser_tokens {
            if let Some(token) =
                convert_parser_token(parser_token, globals, &mut new_string_literals)
            {
                tokens.push(token);
            }
        }
        stack.last_mut().unwrap().nodes.push(Node::Undefined {
            tokens,
            line: line_number,
        });
    }

    for literal in new_string_literals {
        module.add_string_literal(literal);
    }

    if stack.len() != 1 {
        return Err(CompileError::parse(
            "More blocks opened than closed",
            line_number,
        ));
    }
    Ok(stack.pop().unwrap())
}

/// Pragmas addressed at the compiler itself; currently only the feature
/// level. Returns true when the pragma was consumed.
fn process_global_pragma(
    content: &str,
    options: &mut CompileOptions,
    line: u32,
) -> CompileResult<bool> {
    let trimmed = content.trim();
    let Some(argument) = trimmed
        .strip_prefix("script-feature-level(")
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return Ok(false);
    };
    let value: u32 = argument.trim().parse().map_err(|_| {
        CompileError::parse("Invalid script-feature-level pragma", line)
    })?;
    if value > MAX_SCRIPT_FEATURE_LEVEL {
        return Err(CompileError::parse(
            format!(
                "Script uses feature level {}, but the highest supported level is {}",
                value, MAX_SCRIPT_FEATURE_LEVEL
            ),
            line,
        ));
    }
    if value > 0 {
        options.script_feature_level = value;
    }
    Ok(true)
}

// ============================================================================
// Global definitions
// ============================================================================

fn process_global_definitions(
    root: BlockNode,
    module: &mut Module,
    globals: &mut GlobalsLookup,
    translation: &LineNumberTranslation,
    options: &CompileOptions,
) -> CompileResult<Vec<FunctionEntry>> {
    let mut entries: Vec<FunctionEntry> = Vec::new();
    let mut queue: VecDeque<Node> = root.nodes.into();
    let mut current_pragmas: Vec<String> = Vec::new();

    while let Some(node) = queue.pop_front() {
        match node {
            Node::Pragma { content, .. } => {
                current_pragmas.push(content);
            }
            Node::Undefined { tokens, line } => {
                match tokens.first() {
                    Some(Token::Keyword(Keyword::Function)) => {
                        let function = process_function_header(&tokens, line, module, translation)?;
                        let content = match queue.pop_front() {
                            Some(Node::Block(block)) => block,
                            _ => {
                                return Err(CompileError::parse(
                                    "Expected block node after function header",
                                    line,
                                ));
                            }
                        };
                        {
                            let mut script = function.borrow_mut();
                            for pragma in current_pragmas.drain(..) {
                                script
                                    .add_or_process_pragma(&pragma, options.consume_processed_pragmas);
                            }
                        }
                        globals.register_function(FunctionHandle::Script(function.clone()));
                        entries.push(FunctionEntry {
                            function,
                            content,
                            line,
                        });
                    }

                    Some(Token::Keyword(Keyword::Global)) => {
                        process_global_variable(&tokens, line, module, globals)?;
                    }

                    Some(Token::Keyword(Keyword::Constant)) => {
                        process_constant_definition(
                            tokens, line, &mut queue, module, Some(globals), None,
                        )?;
                    }

                    Some(Token::Keyword(Keyword::Define)) => {
                        process_define(&tokens, line, module, globals)?;
                    }

                    Some(Token::Keyword(Keyword::Declare)) => {
                        // Declarations are accepted and ignored
                    }

                    _ => {}
                }
                current_pragmas.clear();
            }
            _ => {}
        }
    }

    Ok(entries)
}

fn process_function_header(
    tokens: &TokenList,
    line: u32,
    module: &mut Module,
    translation: &LineNumberTranslation,
) -> CompileResult<Rc<RefCell<ScriptFunction>>> {
    let mut offset = 1;
    let return_type = tokens
        .get(offset)
        .and_then(|t| t.as_var_type())
        .ok_or_else(|| {
            CompileError::parse("Expected a typename after 'function' keyword", line)
        })?;

    offset += 1;
    let name = tokens
        .get(offset)
        .and_then(|t| t.as_identifier())
        .cloned()
        .ok_or_else(|| {
            CompileError::parse("Expected an identifier in function definition", line)
        })?;

    offset += 1;
    if !tokens
        .get(offset)
        .map(|t| t.is_operator(Operator::ParenthesisLeft))
        .unwrap_or(false)
    {
        return Err(CompileError::parse(
            "Expected opening parentheses in function definition",
            line,
        ));
    }

    offset += 1;
    let mut parameters = ParameterList::new();
    match tokens.get(offset) {
        None => return Err(CompileError::parse("Unexpected end of function definition", line)),
        Some(Token::Operator(Operator::ParenthesisRight)) => {}
        Some(Token::Operator(_)) => {
            return Err(CompileError::parse(
                "Expected closing parentheses or parameter definition",
                line,
            ));
        }
        _ => loop {
            let data_type = tokens
                .get(offset)
                .and_then(|t| t.as_var_type())
                .ok_or_else(|| {
                    CompileError::parse("Expected type in function parameter definition", line)
                })?;
            offset += 1;
            let parameter_name = tokens
                .get(offset)
                .and_then(|t| t.as_identifier())
                .cloned()
                .ok_or_else(|| {
                    CompileError::parse(
                        "Expected identifier in function parameter definition",
                        line,
                    )
                })?;
            parameters.push(Parameter {
                name: parameter_name,
                data_type,
            });
            offset += 1;
            match tokens.get(offset) {
                Some(Token::Operator(Operator::ParenthesisRight)) => break,
                Some(Token::Operator(Operator::CommaSeparator)) => offset += 1,
                _ => {
                    return Err(CompileError::parse(
                        "Expected comma or closing parentheses after function parameter definition",
                        line,
                    ));
                }
            }
        },
    }

    let function = module.add_script_function(name, return_type, parameters);
    {
        let mut script = function.borrow_mut();
        let parameter_list = script.parameters.clone();
        for parameter in &parameter_list {
            if script
                .local_variable_by_name(parameter.name.hash())
                .is_some()
            {
                return Err(CompileError::semantic("Parameter name already used", line));
            }
            script.add_local_variable(parameter.name.clone(), parameter.data_type, line);
        }
        if let Some(translated) = translation.translate(line) {
            script.source_file = translated.source_file.index;
            script.source_base_line_offset = line - translated.local_line;
        }
    }
    Ok(function)
}

fn process_global_variable(
    tokens: &TokenList,
    line: u32,
    module: &mut Module,
    globals: &mut GlobalsLookup,
) -> CompileResult<()> {
    let data_type = tokens
        .get(1)
        .and_then(|t| t.as_var_type())
        .ok_or_else(|| CompileError::parse("Expected a typename after 'global' keyword", line))?;
    let name = tokens
        .get(2)
        .and_then(|t| t.as_identifier())
        .cloned()
        .ok_or_else(|| {
            CompileError::parse("Expected an identifier in global variable definition", line)
        })?;

    let mut initial_value = 0i64;
    if tokens.len() >= 5 && tokens[3].is_operator(Operator::Assign) {
        let constant = tokens[4].as_statement().and_then(|s| s.constant_value());
        match (constant, tokens.len()) {
            (Some(value), 5) => initial_value = value as i64,
            _ => {
                return Err(CompileError::parse(
                    "Expected a constant value for initializing the global variable",
                    line,
                ));
            }
        }
    }

    let variable = module.add_global_variable_with_initial(name, data_type, initial_value);
    globals.register_variable(variable);
    Ok(())
}

fn process_define(
    tokens: &TokenList,
    line: u32,
    module: &mut Module,
    globals: &mut GlobalsLookup,
) -> CompileResult<()> {
    let mut offset = 1;

    // Typename is optional
    let mut data_type = tokens.get(offset).and_then(|t| t.as_var_type());
    if data_type.is_some() {
        offset += 1;
    }

    let name = tokens
        .get(offset)
        .and_then(|t| t.as_identifier())
        .cloned()
        .ok_or_else(|| CompileError::parse("Expected an identifier for define", line))?;
    offset += 1;

    if tokens
        .get(offset)
        .map(|t| t.is_operator(Operator::Assign))
        .unwrap_or(false)
    {
        offset += 1;
    }
    if offset >= tokens.len() {
        return Err(CompileError::parse("Missing define content", line));
    }

    // Determine the data type from the content when not given explicitly
    if data_type.is_none() {
        data_type = match &tokens[offset] {
            Token::VarType(var_type) => Some(*var_type),
            Token::Stmt(statement) if statement.is_constant() => statement.data_type,
            _ => None,
        };
    }
    let data_type = data_type.ok_or_else(|| {
        CompileError::parse("Data type of define could not be determined", line)
    })?;

    let mut content = Vec::with_capacity(tokens.len() - offset);
    for token in &tokens[offset..] {
        content.push(token_to_parser_token(token, line)?);
    }

    let define = module.add_define(name, data_type, content);
    globals.register_define(define);
    Ok(())
}

/// Convert an unprocessed compiler token back into a lexer token, for
/// storage in a define.
fn token_to_parser_token(token: &Token, line: u32) -> CompileResult<ParserToken> {
    Ok(match token {
        Token::Keyword(keyword) => ParserToken::Keyword(*keyword),
        Token::VarType(data_type) => ParserToken::VarType(*data_type),
        Token::Operator(op) => ParserToken::Operator(*op),
        Token::Label(name) => ParserToken::Label(name.clone()),
        Token::Stmt(Statement {
            expr: Expr::Identifier { name },
            ..
        }) => ParserToken::Identifier(name.clone()),
        Token::Stmt(statement) => match (statement.data_type, statement.constant_value()) {
            (Some(DataType::Str), Some(value)) => {
                let literal = FlyweightStr::resolve(value).ok_or_else(|| {
                    CompileError::parse("String literal in define could not be resolved", line)
                })?;
                ParserToken::StringLiteral(literal)
            }
            (_, Some(value)) => ParserToken::IntLiteral(value),
            _ => {
                return Err(CompileError::parse(
                    "Unsupported token in define content",
                    line,
                ));
            }
        },
    })
}

fn process_constant_definition(
    tokens: TokenList,
    line: u32,
    queue: &mut VecDeque<Node>,
    module: &mut Module,
    globals: Option<&mut GlobalsLookup>,
    mut scope: Option<&mut ScopeContext>,
) -> CompileResult<()> {
    let mut globals = globals;
    if tokens.len() < 5 {
        return Err(CompileError::parse("Syntax error in constant definition", line));
    }

    let is_array = tokens[1]
        .as_identifier()
        .map(|name| name.as_str() == "array")
        .unwrap_or(false);

    if is_array {
        if tokens.len() < 7 {
            return Err(CompileError::parse(
                "Syntax error in constant array definition",
                line,
            ));
        }
        if !tokens[2].is_operator(Operator::CompareLess)
            || !tokens[4].is_operator(Operator::CompareGreater)
        {
            return Err(CompileError::parse(
                "Expected a type in <> in constant array definition",
                line,
            ));
        }
        let element_type = tokens[3].as_var_type().ok_or_else(|| {
            CompileError::parse("Expected a type in <> in constant array definition", line)
        })?;
        let name = tokens[5].as_identifier().cloned().ok_or_else(|| {
            CompileError::parse("Expected identifier in constant array definition", line)
        })?;
        if !tokens[6].is_operator(Operator::Assign) {
            return Err(CompileError::parse(
                "Expected assignment at the end of constant array definition",
                line,
            ));
        }

        let mut values: Vec<u64> = Vec::new();
        if tokens.len() >= 8 {
            // One-line form: constant array<u8> x = { 1, 2, 3 }
            if tokens.len() < 9
                || !tokens[7].is_keyword(Keyword::BlockBegin)
                || !tokens[tokens.len() - 1].is_keyword(Keyword::BlockEnd)
            {
                return Err(CompileError::parse(
                    "Expected { or a line break after = in constant array definition",
                    line,
                ));
            }
            collect_constant_list(&tokens[8..tokens.len() - 1], line, &mut values)?;
        } else {
            // Block form: the values follow in the next block node
            let block = match queue.pop_front() {
                Some(Node::Block(block)) => block,
                _ => {
                    return Err(CompileError::parse(
                        "Expected block node after constant array header",
                        line,
                    ));
                }
            };
            for node in &block.nodes {
                match node {
                    Node::Undefined { tokens, line } => {
                        collect_constant_list(tokens, *line, &mut values)?;
                    }
                    other => {
                        return Err(CompileError::parse(
                            "Syntax error inside constant array list of values",
                            other.line(),
                        ));
                    }
                }
            }
        }

        let array = module.add_constant_array(name, element_type, values);
        match scope.as_deref_mut() {
            Some(scope) => scope.local_constant_arrays.push(array),
            None => {
                if let Some(globals) = globals.as_deref_mut() {
                    globals.register_constant_array(array);
                }
            }
        }
    } else {
        let data_type = tokens[1].as_var_type().ok_or_else(|| {
            CompileError::parse("Expected a type in constant definition", line)
        })?;
        let name = tokens[2].as_identifier().cloned().ok_or_else(|| {
            CompileError::parse("Expected an identifier for constant definition", line)
        })?;
        if !tokens[3].is_operator(Operator::Assign) {
            return Err(CompileError::parse(
                "Missing assignment in constant definition",
                line,
            ));
        }
        let value = tokens[4]
            .as_statement()
            .and_then(|s| s.constant_value())
            .ok_or_else(|| {
                CompileError::parse("Expected a constant value in constant definition", line)
            })?;

        match scope.as_deref_mut() {
            Some(scope) => scope.local_constants.push(citron_core::Constant {
                name,
                data_type,
                value,
            }),
            None => {
                let constant = module.add_constant(name, data_type, value);
                if let Some(globals) = globals.as_deref_mut() {
                    globals.register_constant(constant);
                }
            }
        }
    }
    Ok(())
}

fn collect_constant_list(
    tokens: &[Token],
    line: u32,
    values: &mut Vec<u64>,
) -> CompileResult<()> {
    let mut expecting_comma = false;
    for token in tokens {
        if expecting_comma {
            if !token.is_operator(Operator::CommaSeparator) {
                return Err(CompileError::parse(
                    "Expected a comma-separated list of constants inside constant array list of values",
                    line,
                ));
            }
            expecting_comma = false;
        } else {
            let value = token
                .as_statement()
                .and_then(|s| s.constant_value())
                .ok_or_else(|| {
                    CompileError::parse(
                        "Expected a comma-separated list of constants inside constant array list of values",
                        line,
                    )
                })?;
            values.push(value);
            expecting_comma = true;
        }
    }
    Ok(())
}

// ============================================================================
// Function body processing
// ============================================================================

struct BodyProcessor<'a, 'g> {
    processing: &'a mut TokenProcessing<'g>,
    module: &'a mut Module,
}

fn process_single_function(
    entry: &mut FunctionEntry,
    processing: &mut TokenProcessing,
    module: &mut Module,
) -> CompileResult<()> {
    entry.function.borrow_mut().start_line_number = entry.line;

    let mut scope = ScopeContext::new();
    {
        // Parameters are the function's first locals; make them visible
        let function = entry.function.borrow();
        for local in &function.local_variables {
            scope.local_variables.push(local.clone());
        }
    }

    let mut body = BodyProcessor { processing, module };
    let function = entry.function.clone();
    body.process_block(&mut entry.content, &function, &mut scope)
}

impl<'a, 'g> BodyProcessor<'a, 'g> {
    fn process_block(
        &mut self,
        block: &mut BlockNode,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
    ) -> CompileResult<()> {
        scope.begin_scope();
        let mut queue: VecDeque<Node> = std::mem::take(&mut block.nodes).into();
        let mut processed: Vec<Node> = Vec::with_capacity(queue.len());

        while let Some(node) = queue.pop_front() {
            match node {
                Node::Block(mut inner) => {
                    self.process_block(&mut inner, function, scope)?;
                    processed.push(Node::Block(inner));
                }
                Node::Undefined { tokens, line } => {
                    if let Some(new_node) =
                        self.process_undefined(tokens, line, &mut queue, function, scope)?
                    {
                        processed.push(new_node);
                    }
                }
                other => processed.push(other),
            }
        }

        block.nodes = processed;
        scope.end_scope();
        Ok(())
    }

    fn process_tokens(
        &mut self,
        tokens: &mut TokenList,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
        line: u32,
        result_type: Option<DataType>,
    ) -> CompileResult<()> {
        let mut ctx = FunctionContext { function, scope };
        self.processing
            .process_tokens(tokens, &mut ctx, line, result_type)
    }

    fn gather_next_statement(
        &mut self,
        queue: &mut VecDeque<Node>,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
    ) -> CompileResult<Option<Node>> {
        match queue.pop_front() {
            Some(Node::Block(mut block)) => {
                self.process_block(&mut block, function, scope)?;
                Ok(Some(Node::Block(block)))
            }
            Some(Node::Undefined { tokens, line }) => {
                self.process_undefined(tokens, line, queue, function, scope)
            }
            Some(other) => Ok(Some(other)),
            None => Ok(None),
        }
    }

    fn process_undefined(
        &mut self,
        mut tokens: TokenList,
        line: u32,
        queue: &mut VecDeque<Node>,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
    ) -> CompileResult<Option<Node>> {
        let external_address_type = self.processing.external_address_type();

        let first_keyword = match tokens.first() {
            Some(Token::Keyword(keyword)) => Some(*keyword),
            _ => None,
        };
        if let Some(keyword) = first_keyword {
            match keyword {
                Keyword::Return => {
                    self.process_tokens(&mut tokens, function, scope, line, None)?;
                    if tokens.len() > 2 {
                        return Err(CompileError::parse(
                            "Return can have up to one statement",
                            line,
                        ));
                    }
                    let statement = match tokens.len() {
                        2 => Some(tokens.pop().unwrap().into_statement().ok_or_else(|| {
                            CompileError::parse("Token after 'return' must be a statement", line)
                        })?),
                        _ => None,
                    };
                    return Ok(Some(Node::Return { statement, line }));
                }

                Keyword::Call | Keyword::Jump => {
                    self.process_tokens(
                        &mut tokens,
                        function,
                        scope,
                        line,
                        Some(external_address_type),
                    )?;

                    // Indirect jump: "jump index, @l0, @l1, ..."
                    if keyword == Keyword::Jump && tokens.len() == 1 {
                        if let Token::Stmt(Statement {
                            expr: Expr::CommaList { lists },
                            ..
                        }) = &mut tokens[0]
                        {
                            if lists.len() >= 2
                                && lists[0].len() == 2
                                && lists[0][1].is_statement()
                            {
                                let mut lists = std::mem::take(lists);
                                let index = lists
                                    .remove(0)
                                    .pop()
                                    .unwrap()
                                    .into_statement()
                                    .unwrap();
                                let mut labels = Vec::with_capacity(lists.len());
                                for list in lists {
                                    match list.as_slice() {
                                        [Token::Label(name)] => labels.push(name.clone()),
                                        _ => {
                                            return Err(CompileError::parse(
                                                "Invalid syntax for indirect 'jump'",
                                                line,
                                            ));
                                        }
                                    }
                                }
                                return Ok(Some(Node::JumpIndirect { index, labels, line }));
                            }
                        }
                    }

                    if tokens.len() != 2 {
                        return Err(CompileError::parse(
                            "'call' and 'jump' need an additional token after them",
                            line,
                        ));
                    }
                    return match tokens.pop().unwrap() {
                        Token::Stmt(statement) => Ok(Some(Node::External {
                            statement,
                            kind: if keyword == Keyword::Call {
                                ExternalKind::Call
                            } else {
                                ExternalKind::Jump
                            },
                            line,
                        })),
                        Token::Label(label) => {
                            if keyword != Keyword::Jump {
                                return Err(CompileError::parse(
                                    "Label is not allowed after 'call' keyword",
                                    line,
                                ));
                            }
                            Ok(Some(Node::Jump { label, line }))
                        }
                        _ => Err(CompileError::parse(
                            "Token after 'call' and 'jump' must be a statement or a label",
                            line,
                        )),
                    };
                }

                Keyword::Break => {
                    if tokens.len() != 1 {
                        return Err(CompileError::parse(
                            "There must be no token after 'break' keyword",
                            line,
                        ));
                    }
                    return Ok(Some(Node::Break { line }));
                }

                Keyword::Continue => {
                    if tokens.len() != 1 {
                        return Err(CompileError::parse(
                            "There must be no token after 'continue' keyword",
                            line,
                        ));
                    }
                    return Ok(Some(Node::Continue { line }));
                }

                Keyword::If => {
                    return self
                        .process_if_block(tokens, line, queue, function, scope)
                        .map(Some);
                }

                Keyword::Else => {
                    return Err(CompileError::parse(
                        "Found 'else' without a corresponding 'if'",
                        line,
                    ));
                }

                Keyword::While => {
                    self.process_tokens(&mut tokens, function, scope, line, None)?;
                    if tokens.len() != 2 || !tokens[1].is_statement() {
                        return Err(CompileError::parse(
                            "Expected single statement after 'while' keyword",
                            line,
                        ));
                    }
                    let condition = tokens.pop().unwrap().into_statement().unwrap();
                    let content = self
                        .gather_next_statement(queue, function, scope)?
                        .ok_or_else(|| {
                            CompileError::parse(
                                "Expected a block or statement after 'while' line",
                                line,
                            )
                        })?;
                    return Ok(Some(Node::While {
                        condition,
                        content: Box::new(content),
                        line,
                    }));
                }

                Keyword::For => {
                    return self
                        .process_for_block(tokens, line, queue, function, scope)
                        .map(Some);
                }

                Keyword::Constant => {
                    process_constant_definition(
                        tokens, line, queue, self.module, None, Some(scope),
                    )?;
                    return Ok(None);
                }

                _ => {}
            }
        }

        if let Some(Token::Label(_)) = tokens.first() {
            if tokens.len() != 2 || !tokens[1].is_operator(Operator::Colon) {
                return Err(CompileError::parse("Expected only colon after label", line));
            }
            let name = match tokens.into_iter().next().unwrap() {
                Token::Label(name) => name,
                _ => unreachable!(),
            };
            return Ok(Some(Node::Label { name, line }));
        }

        // A plain statement line
        self.process_tokens(&mut tokens, function, scope, line, None)?;
        if tokens.is_empty() {
            // Happens when a base call without a base function was removed
            return Ok(Some(Node::Block(BlockNode {
                nodes: Vec::new(),
                line,
            })));
        }
        if tokens.len() != 1 || !tokens[0].is_statement() {
            return Err(CompileError::parse(
                "Statement contains more than a single token tree root",
                line,
            ));
        }
        let statement = tokens.pop().unwrap().into_statement().unwrap();
        Ok(Some(Node::Statement { statement, line }))
    }

    fn process_if_block(
        &mut self,
        mut tokens: TokenList,
        line: u32,
        queue: &mut VecDeque<Node>,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
    ) -> CompileResult<Node> {
        if self.processing.feature_level() >= 2
            && !(tokens.len() >= 2 && tokens[1].is_operator(Operator::ParenthesisLeft))
        {
            return Err(CompileError::parse(
                "Expected parentheses after 'if' keyword",
                line,
            ));
        }

        self.process_tokens(&mut tokens, function, scope, line, None)?;
        if tokens.len() != 2 || !tokens[1].is_statement() {
            return Err(CompileError::parse(
                "Expected single statement after 'if' keyword",
                line,
            ));
        }
        let condition = tokens.pop().unwrap().into_statement().unwrap();

        let content_if = self
            .gather_next_statement(queue, function, scope)?
            .ok_or_else(|| {
                CompileError::parse("Expected a block or statement after 'if' line", line)
            })?;

        // An 'else' line directly after the if content?
        let mut content_else: Option<Box<Node>> = None;
        let has_else = matches!(
            queue.front(),
            Some(Node::Undefined { tokens, .. })
                if tokens.first().map(|t| t.is_keyword(Keyword::Else)).unwrap_or(false)
        );
        if has_else {
            let (mut else_tokens, else_line) = match queue.pop_front() {
                Some(Node::Undefined { tokens, line }) => (tokens, line),
                _ => unreachable!(),
            };
            if else_tokens.len() >= 2 {
                // 'else if ...' or 'else <statement>': drop the 'else' and
                // treat the rest as the next line
                else_tokens.remove(0);
                queue.push_front(Node::Undefined {
                    tokens: else_tokens,
                    line: else_line,
                });
            }
            let node = self
                .gather_next_statement(queue, function, scope)?
                .ok_or_else(|| {
                    CompileError::parse(
                        "Expected a block or statement after 'else' line",
                        else_line,
                    )
                })?;
            content_else = Some(Box::new(node));
        }

        Ok(Node::If {
            condition,
            content_if: Box::new(content_if),
            content_else,
            line,
        })
    }

    fn process_for_block(
        &mut self,
        tokens: TokenList,
        line: u32,
        queue: &mut VecDeque<Node>,
        function: &Rc<RefCell<ScriptFunction>>,
        scope: &mut ScopeContext,
    ) -> CompileResult<Node> {
        if tokens.len() < 3 {
            return Err(CompileError::parse(
                "Not enough tokens found after 'for' keyword",
                line,
            ));
        }
        if !tokens[1].is_operator(Operator::ParenthesisLeft) {
            return Err(CompileError::parse(
                "Expected opening parenthesis after 'for' keyword",
                line,
            ));
        }
        if !tokens[tokens.len() - 1].is_operator(Operator::ParenthesisRight) {
            return Err(CompileError::parse(
                "Expected closing parenthesis as last token after 'for' keyword",
                line,
            ));
        }

        // Split the header at its two top-level semicolons
        let end_index = tokens.len() - 1;
        let mut split_positions = [1usize, 0, 0, end_index];
        let mut semicolons = 0;
        for (index, token) in tokens.iter().enumerate().take(end_index).skip(2) {
            if token.is_operator(Operator::SemicolonSeparator) {
                semicolons += 1;
                if semicolons <= 2 {
                    split_positions[semicolons] = index;
                }
            }
        }
        if semicolons != 2 {
            return Err(CompileError::parse(
                "Expected exactly two semicolons in 'for' loop header",
                line,
            ));
        }

        // The loop variable's scope covers the header and the body
        scope.begin_scope();

        let mut statements: [Option<Statement>; 3] = [None, None, None];
        for section in 0..3 {
            let first = split_positions[section] + 1;
            let last = split_positions[section + 1];
            if first >= last {
                continue;
            }
            let mut inner: TokenList = tokens[first..last].to_vec();
            self.process_tokens(&mut inner, function, scope, line, None)?;
            if inner.len() != 1 || !inner[0].is_statement() {
                return Err(CompileError::parse(
                    "Tokens in 'for' loop header do not evaluate to a single statement",
                    line,
                ));
            }
            statements[section] = inner.pop().unwrap().into_statement();
        }
        let [initial, condition, iteration] = statements;

        let content = self
            .gather_next_statement(queue, function, scope)?
            .ok_or_else(|| {
                CompileError::parse("Expected a block or statement after 'for' line", line)
            })?;

        scope.end_scope();

        Ok(Node::For {
            initial,
            condition,
            iteration,
            content: Box::new(content),
            line,
        })
    }
}
