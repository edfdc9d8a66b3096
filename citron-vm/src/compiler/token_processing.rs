// citron-vm - Expression token processing
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The expression passes of the frontend.
//!
//! Each source line arrives as a flat token list and leaves as a single
//! statement tree. The passes run in a fixed order; several of them
//! (parenthesis pairing, unary and binary folding) are standalone functions
//! because the preprocessor reuses them for `#if` conditions.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use citron_core::{
    Constant, ConstantArray, Expr, FunctionHandle, GlobalsLookup, Identifier, LocalVariable,
    NativeCallContext, ParenKind, ScriptFunction, Statement, Token, TokenList, VarRef,
};
use citron_parser::{
    fnv1a_64, DataType, FlyweightStr, IntSemantics, Keyword, Operator, OperatorClass, ParserToken,
    TypeClass,
};
use smallvec::SmallVec;

use super::error::{CompileError, CompileResult};
use super::options::CompileOptions;
use super::type_casting::{
    cast_constant_value, BinaryOperatorSignature, CastHandling, TypeCasting,
};
use crate::builtins;

/// Names of local definitions inside the function currently being compiled.
///
/// Scopes push and pop; a name is visible from its declaration to the end of
/// the enclosing block.
#[derive(Debug, Default)]
pub struct ScopeContext {
    pub local_variables: Vec<LocalVariable>,
    pub local_constants: Vec<Constant>,
    pub local_constant_arrays: Vec<Rc<ConstantArray>>,
    scope_stack: Vec<(usize, usize, usize)>,
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_scope(&mut self) {
        self.scope_stack.push((
            self.local_variables.len(),
            self.local_constants.len(),
            self.local_constant_arrays.len(),
        ));
    }

    pub fn end_scope(&mut self) {
        if let Some((variables, constants, arrays)) = self.scope_stack.pop() {
            self.local_variables.truncate(variables);
            self.local_constants.truncate(constants);
            self.local_constant_arrays.truncate(arrays);
        }
    }
}

/// The function whose body is being processed, plus its visible scope.
pub struct FunctionContext<'a> {
    pub function: &'a Rc<RefCell<ScriptFunction>>,
    pub scope: &'a mut ScopeContext,
}

/// Result of binary-operator signature selection.
struct BinaryOperationChoice {
    signature: BinaryOperatorSignature,
    enforced_function: Option<FunctionHandle>,
    split_to_operator: Option<Operator>,
}

struct BinaryOperationLookup {
    function: Option<FunctionHandle>,
    signature: BinaryOperatorSignature,
    split_to_operator: Option<Operator>,
}

/// Convert one lexer token into a compiler token.
///
/// String literals not seen before are appended to `new_string_literals`;
/// the caller moves them into the module. Pragma tokens convert to nothing.
pub fn convert_parser_token(
    token: &ParserToken,
    globals: &GlobalsLookup,
    new_string_literals: &mut Vec<FlyweightStr>,
) -> Option<Token> {
    Some(match token {
        ParserToken::Keyword(keyword) => Token::Keyword(*keyword),
        ParserToken::VarType(data_type) => Token::VarType(*data_type),
        ParserToken::Operator(op) => Token::Operator(*op),
        ParserToken::Label(name) => Token::Label(name.clone()),
        ParserToken::Pragma(_) => return None,
        ParserToken::IntLiteral(value) => {
            Token::Stmt(Statement::constant(*value, DataType::CONST_INT))
        }
        ParserToken::StringLiteral(literal) => {
            if globals.string_literal_by_hash(literal.hash()).is_none()
                && !new_string_literals.contains(literal)
            {
                new_string_literals.push(literal.clone());
            }
            Token::Stmt(Statement::constant(literal.hash(), DataType::Str))
        }
        ParserToken::Identifier(name) => Token::Stmt(Statement::new(Expr::Identifier {
            name: name.clone(),
        })),
    })
}

fn operator_not_allowed_message(op: Operator) -> String {
    match op {
        Operator::UnaryNot | Operator::UnaryBitnot => {
            format!("Unary operator {} is not allowed here", op.characters())
        }
        Operator::SemicolonSeparator => "Semicolon ; is only allowed in for-loops".to_string(),
        Operator::CommaSeparator => "Comma , is not allowed here".to_string(),
        Operator::ParenthesisLeft => "Parenthesis ( is not allowed here".to_string(),
        Operator::ParenthesisRight => "Parenthesis ) is not allowed here".to_string(),
        Operator::BracketLeft => "Bracket [ is not allowed here".to_string(),
        Operator::BracketRight => "Bracket ] is not allowed here".to_string(),
        other => format!("Binary operator {} is not allowed here", other.characters()),
    }
}

// ============================================================================
// Standalone passes (shared with the preprocessor)
// ============================================================================

/// Pair parentheses and brackets into nested parenthesis tokens.
pub fn process_parentheses(tokens: &mut TokenList, line: u32) -> CompileResult<()> {
    let mut stack: Vec<(ParenKind, usize)> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let op = match &tokens[i] {
            Token::Operator(op) => *op,
            _ => {
                i += 1;
                continue;
            }
        };
        match op {
            Operator::ParenthesisLeft => {
                stack.push((ParenKind::Round, i));
                i += 1;
            }
            Operator::BracketLeft => {
                stack.push((ParenKind::Square, i));
                i += 1;
            }
            Operator::ParenthesisRight | Operator::BracketRight => {
                let closing = if op == Operator::ParenthesisRight {
                    ParenKind::Round
                } else {
                    ParenKind::Square
                };
                let (kind, start) = match stack.pop() {
                    Some(entry) if entry.0 == closing => entry,
                    _ => {
                        return Err(CompileError::parse(
                            "Parenthesis not matching (too many closed)",
                            line,
                        ));
                    }
                };
                let mut content: TokenList = tokens.drain(start + 1..=i).collect();
                content.pop(); // the closing parenthesis itself
                tokens[start] =
                    Token::Stmt(Statement::new(Expr::Parenthesis { kind, content }));
                i = start + 1;
            }
            _ => i += 1,
        }
    }
    if !stack.is_empty() {
        return Err(CompileError::parse(
            "Parenthesis not matching (too many open)",
            line,
        ));
    }
    Ok(())
}

/// Partition top-level commas inside each parenthesis into comma lists.
pub fn process_comma_separators(tokens: &mut TokenList, line: u32) -> CompileResult<()> {
    for token in tokens.iter_mut() {
        if let Token::Stmt(Statement {
            expr: Expr::Parenthesis { content, .. },
            ..
        }) = token
        {
            process_comma_separators(content, line)?;
        }
    }

    if !tokens
        .iter()
        .any(|t| t.is_operator(Operator::CommaSeparator))
    {
        return Ok(());
    }

    let mut lists: Vec<TokenList> = Vec::new();
    let mut current: TokenList = Vec::new();
    for token in tokens.drain(..) {
        if token.is_operator(Operator::CommaSeparator) {
            lists.push(std::mem::take(&mut current));
        } else {
            current.push(token);
        }
    }
    lists.push(current);
    tokens.push(Token::Stmt(Statement::new(Expr::CommaList { lists })));
    Ok(())
}

/// Fold unary operators: postfix `++`/`--` left-to-right first, then the
/// prefix forms right-to-left. A minus whose left neighbour produces a value
/// stays binary.
pub fn process_unary_operations(tokens: &mut TokenList, line: u32) -> CompileResult<()> {
    // Postfix increment/decrement, left to right
    let mut i = 0;
    while i < tokens.len() {
        let op = match &tokens[i] {
            Token::Operator(op @ (Operator::UnaryDecrement | Operator::UnaryIncrement)) => *op,
            _ => {
                i += 1;
                continue;
            }
        };
        if i == 0 || !tokens[i - 1].is_statement() {
            i += 1;
            continue;
        }
        let argument = tokens.remove(i - 1).into_statement().unwrap();
        tokens[i - 1] = Token::Stmt(Statement::new(Expr::Unary {
            op,
            arg: Box::new(argument),
        }));
        // The folded token sits at i-1 now; the old i+1 token is at i
    }

    // Prefix operators, right to left
    let mut i = tokens.len() as isize - 1;
    while i >= 0 {
        let index = i as usize;
        let op = match &tokens[index] {
            Token::Operator(op) => *op,
            _ => {
                i -= 1;
                continue;
            }
        };
        match op {
            Operator::BinaryMinus | Operator::UnaryNot | Operator::UnaryBitnot => {
                if index + 1 == tokens.len() {
                    return Err(CompileError::parse("Unary operator not allowed as last", line));
                }
                // A minus after a value-producing token is binary
                if op == Operator::BinaryMinus
                    && index > 0
                    && !matches!(tokens[index - 1], Token::Operator(_))
                {
                    i -= 1;
                    continue;
                }
                let right = tokens.remove(index + 1);
                let argument = right.into_statement().ok_or_else(|| {
                    CompileError::parse("Right of operator is no statement", line)
                })?;
                tokens[index] = Token::Stmt(Statement::new(Expr::Unary {
                    op,
                    arg: Box::new(argument),
                }));
            }
            Operator::UnaryDecrement | Operator::UnaryIncrement => {
                if index + 1 == tokens.len() || !tokens[index + 1].is_statement() {
                    i -= 1;
                    continue;
                }
                let argument = tokens.remove(index + 1).into_statement().unwrap();
                tokens[index] = Token::Stmt(Statement::new(Expr::Unary {
                    op,
                    arg: Box::new(argument),
                }));
            }
            _ => {}
        }
        i -= 1;
    }
    Ok(())
}

/// Fold binary operators by repeatedly wrapping the lowest-priority operator
/// with its neighbours; ties use the operator's associativity.
pub fn process_binary_operations(tokens: &mut TokenList, line: u32) -> CompileResult<()> {
    loop {
        let mut best_priority = 0xffu8;
        let mut best_position = 0usize;
        for i in 0..tokens.len() {
            let op = match &tokens[i] {
                Token::Operator(op) => *op,
                _ => continue,
            };
            if i == 0 || i == tokens.len() - 1 || op == Operator::SemicolonSeparator {
                return Err(CompileError::parse(operator_not_allowed_message(op), line));
            }
            let priority = op.priority();
            let is_lower = if priority == best_priority {
                op.is_right_associative()
            } else {
                priority < best_priority
            };
            if is_lower {
                best_priority = priority;
                best_position = i;
            }
        }

        if best_position == 0 {
            return Ok(());
        }

        let op = match &tokens[best_position] {
            Token::Operator(op) => *op,
            _ => unreachable!(),
        };
        let right = tokens.remove(best_position + 1).into_statement().ok_or_else(|| {
            CompileError::parse(
                format!("Right of operator {} is no statement", op.characters()),
                line,
            )
        })?;
        let left = tokens.remove(best_position - 1).into_statement().ok_or_else(|| {
            CompileError::parse(
                format!("Left of operator {} is no statement", op.characters()),
                line,
            )
        })?;
        tokens[best_position - 1] = Token::Stmt(Statement::new(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            enforced_function: None,
        }));
    }
}

// ============================================================================
// The main processing driver
// ============================================================================

pub struct TokenProcessing<'a> {
    globals: &'a GlobalsLookup,
    options: &'a CompileOptions,
    type_casting: TypeCasting,
    line: u32,
    /// String literals first seen during processing; drained into the module.
    pub new_string_literals: Vec<FlyweightStr>,

    builtin_constant_array_access: Vec<FunctionHandle>,
    binary_operation_lookup: AHashMap<u8, Vec<BinaryOperationLookup>>,
}

impl<'a> TokenProcessing<'a> {
    pub fn new(globals: &'a GlobalsLookup, options: &'a CompileOptions) -> Self {
        let single = |name: &str| -> Option<FunctionHandle> {
            globals
                .functions_by_name(fnv1a_64(name.as_bytes()))
                .first()
                .cloned()
        };

        let mut binary_operation_lookup: AHashMap<u8, Vec<BinaryOperationLookup>> =
            AHashMap::new();
        let mut add = |op: Operator,
                       function: Option<FunctionHandle>,
                       left: DataType,
                       right: DataType,
                       result: DataType,
                       split: Option<Operator>| {
            if let Some(function) = function {
                binary_operation_lookup
                    .entry(op as u8)
                    .or_default()
                    .push(BinaryOperationLookup {
                        function: Some(function),
                        signature: BinaryOperatorSignature::new(left, right, result),
                        split_to_operator: split,
                    });
            }
        };

        let string_plus = single(builtins::STRING_OPERATOR_PLUS);
        let string_plus_int = single(builtins::STRING_OPERATOR_PLUS_INT64);
        let string_plus_int_inv = single(builtins::STRING_OPERATOR_PLUS_INT64_INV);
        add(
            Operator::BinaryPlus,
            string_plus.clone(),
            DataType::Str,
            DataType::Str,
            DataType::Str,
            None,
        );
        add(
            Operator::BinaryPlus,
            string_plus_int.clone(),
            DataType::Str,
            DataType::S64,
            DataType::Str,
            None,
        );
        add(
            Operator::BinaryPlus,
            string_plus_int_inv,
            DataType::S64,
            DataType::Str,
            DataType::Str,
            None,
        );
        add(
            Operator::AssignPlus,
            string_plus,
            DataType::Str,
            DataType::Str,
            DataType::Str,
            Some(Operator::BinaryPlus),
        );
        add(
            Operator::AssignPlus,
            string_plus_int,
            DataType::Str,
            DataType::S64,
            DataType::Str,
            Some(Operator::BinaryPlus),
        );
        add(
            Operator::CompareLess,
            single(builtins::STRING_OPERATOR_LESS),
            DataType::Str,
            DataType::Str,
            DataType::BOOL,
            None,
        );
        add(
            Operator::CompareLessOrEqual,
            single(builtins::STRING_OPERATOR_LESS_OR_EQUAL),
            DataType::Str,
            DataType::Str,
            DataType::BOOL,
            None,
        );
        add(
            Operator::CompareGreater,
            single(builtins::STRING_OPERATOR_GREATER),
            DataType::Str,
            DataType::Str,
            DataType::BOOL,
            None,
        );
        add(
            Operator::CompareGreaterOrEqual,
            single(builtins::STRING_OPERATOR_GREATER_OR_EQUAL),
            DataType::Str,
            DataType::Str,
            DataType::BOOL,
            None,
        );

        TokenProcessing {
            globals,
            options,
            type_casting: TypeCasting::new(options),
            line: 0,
            new_string_literals: Vec::new(),
            builtin_constant_array_access: globals
                .functions_by_name(fnv1a_64(builtins::CONSTANT_ARRAY_ACCESS.as_bytes()))
                .to_vec(),
            binary_operation_lookup,
        }
    }

    pub fn feature_level(&self) -> u32 {
        self.options.script_feature_level
    }

    pub fn external_address_type(&self) -> DataType {
        self.options.external_address_type
    }

    /// Run every pass over one line's token list.
    pub fn process_tokens(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
        line: u32,
        result_type: Option<DataType>,
    ) -> CompileResult<()> {
        self.line = line;

        self.resolve_identifiers(tokens);
        self.process_defines(tokens)?;
        self.process_constants(tokens, ctx);
        process_parentheses(tokens, line)?;
        process_comma_separators(tokens, line)?;
        self.process_token_list_recursive(tokens, ctx)?;
        self.assign_statement_data_types(tokens, result_type, ctx)?;
        Ok(())
    }

    fn resolve_identifiers(&self, tokens: &mut TokenList) {
        for token in tokens.iter_mut() {
            let name = match token.as_identifier() {
                Some(name) => name.clone(),
                None => continue,
            };
            if let Some(Identifier::DataType(data_type)) = self.globals.resolve(name.hash()) {
                *token = Token::VarType(*data_type);
            }
        }
    }

    fn process_defines(&mut self, tokens: &mut TokenList) -> CompileResult<()> {
        let mut expansions = 0usize;
        let mut i = 0;
        while i < tokens.len() {
            let name_hash = match tokens[i].as_identifier() {
                Some(name) => name.hash(),
                None => {
                    i += 1;
                    continue;
                }
            };
            let define = match self.globals.resolve(name_hash) {
                Some(Identifier::Define(define)) => define.clone(),
                _ => {
                    i += 1;
                    continue;
                }
            };
            expansions += 1;
            if expansions > 1000 {
                return Err(CompileError::parse(
                    format!(
                        "Too deep recursion in evaluating define '{}'",
                        define.borrow().name
                    ),
                    self.line,
                ));
            }
            tokens.remove(i);
            let content = define.borrow().content.clone();
            let mut insert_at = i;
            for parser_token in &content {
                if let Some(token) = convert_parser_token(
                    parser_token,
                    self.globals,
                    &mut self.new_string_literals,
                ) {
                    tokens.insert(insert_at, token);
                    insert_at += 1;
                }
            }
            // Re-scan from the same index so defines referencing other
            // defines expand too
        }
        self.resolve_identifiers(tokens);
        Ok(())
    }

    fn process_constants(&self, tokens: &mut TokenList, ctx: &FunctionContext) {
        for token in tokens.iter_mut() {
            let name = match token.as_identifier() {
                Some(name) => name.clone(),
                None => continue,
            };
            let constant = match self.globals.resolve(name.hash()) {
                Some(Identifier::Constant(constant)) => Some((**constant).clone()),
                _ => ctx
                    .scope
                    .local_constants
                    .iter()
                    .find(|c| c.name == name)
                    .cloned(),
            };
            if let Some(constant) = constant {
                *token = Token::Stmt(Statement::constant(constant.value, constant.data_type));
            }
        }
    }

    fn process_token_list_recursive(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        // addressof over function names resolves before recursion; the bare
        // function name inside would fail identifier resolution otherwise
        self.resolve_addressof_functions(tokens)?;

        for token in tokens.iter_mut() {
            match token {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { content, .. },
                    ..
                }) => {
                    self.process_token_list_recursive(content, ctx)?;
                }
                Token::Stmt(Statement {
                    expr: Expr::CommaList { lists },
                    ..
                }) => {
                    for list in lists.iter_mut() {
                        self.process_token_list_recursive(list, ctx)?;
                    }
                }
                _ => {}
            }
        }

        self.process_variable_definitions(tokens, ctx)?;
        self.process_function_calls(tokens, ctx)?;
        self.process_memory_accesses(tokens, ctx)?;
        self.process_array_accesses(tokens, ctx)?;
        self.process_explicit_casts(tokens)?;
        self.process_variables(tokens, ctx)?;

        self.resolve_addressof_memory_accesses(tokens)?;

        process_unary_operations(tokens, self.line)?;
        process_binary_operations(tokens, self.line)?;

        self.evaluate_compile_time_constants(tokens)?;
        Ok(())
    }

    // ========================================================================
    // Individual passes
    // ========================================================================

    fn process_variable_definitions(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                Token::Keyword(Keyword::Function) => {
                    if i + 1 >= tokens.len() || tokens[i + 1].as_identifier().is_none() {
                        return Err(CompileError::parse(
                            "Function keyword must be followed by an identifier",
                            self.line,
                        ));
                    }
                }
                Token::VarType(var_type) => {
                    let var_type = *var_type;
                    if i + 1 >= tokens.len() {
                        return Err(CompileError::parse(
                            "Type name must not be the last token",
                            self.line,
                        ));
                    }
                    if let Some(name) = tokens[i + 1].as_identifier().cloned() {
                        if var_type.class() == TypeClass::Void {
                            return Err(CompileError::semantic(
                                "void variables not allowed",
                                self.line,
                            ));
                        }
                        if find_local_variable(ctx.scope, name.hash()).is_some() {
                            return Err(CompileError::semantic(
                                format!("Variable name '{}' already used", name),
                                self.line,
                            ));
                        }

                        // The variable may exist in the function already, just
                        // not in the current scope
                        let variable = {
                            let mut function = ctx.function.borrow_mut();
                            match function.local_variable_by_name(name.hash()) {
                                Some(existing) => existing.clone(),
                                None => function.add_local_variable(name, var_type, self.line),
                            }
                        };
                        ctx.scope.local_variables.push(variable.clone());

                        tokens[i] = Token::Stmt(Statement::typed(
                            Expr::Variable {
                                var: variable.var_ref(),
                            },
                            variable.data_type,
                        ));
                        tokens.remove(i + 1);
                    }
                }
                _ => {}
            }
            i += 1;
        }
        Ok(())
    }

    fn process_function_calls(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        let mut i = 0;
        while !tokens.is_empty() && i + 1 < tokens.len() {
            let is_call_site = tokens[i].as_identifier().is_some()
                && tokens[i + 1].is_parenthesis(ParenKind::Round);
            if !is_call_site {
                i += 1;
                continue;
            }
            let name = tokens[i].as_identifier().unwrap().clone();

            let mut is_base_call = false;
            let mut base_function_exists = false;
            let mut this_pointer: Option<VarRef> = None;
            let mut candidates: Vec<FunctionHandle> =
                self.globals.functions_by_name(name.hash()).to_vec();

            if candidates.is_empty() {
                if let Some(base_name) = name.as_str().strip_prefix("base.") {
                    // Base call: must target the enclosing function itself
                    let (own_name, own_signature) = {
                        let function = ctx.function.borrow();
                        (function.name.clone(), function.signature_hash())
                    };
                    if base_name != own_name.as_str() {
                        return Err(CompileError::semantic(
                            format!(
                                "Base call '{}' goes to a different function, expected 'base.{}' instead",
                                name, own_name
                            ),
                            self.line,
                        ));
                    }
                    is_base_call = true;
                    for candidate in self
                        .globals
                        .functions_by_name(fnv1a_64(base_name.as_bytes()))
                    {
                        let is_self = match candidate {
                            FunctionHandle::Script(script) => Rc::ptr_eq(script, ctx.function),
                            _ => false,
                        };
                        if candidate.signature_hash() == own_signature && !is_self {
                            base_function_exists = true;
                            break;
                        }
                    }
                } else {
                    // Method-like call or array.length()
                    let mut valid_call = false;
                    if let Some(last_dot) = name.as_str().rfind('.') {
                        let context_part = &name.as_str()[..last_dot];
                        let name_part = &name.as_str()[last_dot + 1..];
                        let context_hash = fnv1a_64(context_part.as_bytes());
                        if let Some(variable) = self.find_variable(context_hash, ctx) {
                            let key = self
                                .globals
                                .type_name_hash(variable.data_type)
                                .wrapping_add(fnv1a_64(name_part.as_bytes()));
                            let methods = self.globals.methods_by_name(key);
                            if !methods.is_empty() {
                                candidates = methods.to_vec();
                                this_pointer = Some(variable);
                                valid_call = true;
                            }
                        }
                        if !valid_call && name_part == "length" {
                            let content_empty = match &tokens[i + 1] {
                                Token::Stmt(Statement {
                                    expr: Expr::Parenthesis { content, .. },
                                    ..
                                }) => content.is_empty(),
                                _ => false,
                            };
                            if content_empty {
                                if let Some(array) = self.find_constant_array(context_hash, ctx) {
                                    tokens[i] = Token::Stmt(Statement::constant(
                                        array.size() as u64,
                                        DataType::CONST_INT,
                                    ));
                                    tokens.remove(i + 1);
                                    i += 1;
                                    continue;
                                }
                            }
                        }
                    }
                    if !valid_call {
                        return Err(CompileError::semantic(
                            format!("Unknown function name '{}'", name),
                            self.line,
                        ));
                    }
                }
            }

            // Collect arguments from the parenthesis content
            let content = match tokens.remove(i + 1) {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!(),
            };
            let mut arguments: Vec<Statement> = Vec::new();
            if !content.is_empty() {
                let single_statement = content.len() == 1 && content[0].is_statement();
                if !single_statement {
                    return Err(CompileError::parse(
                        "Function parameter content must be one token",
                        self.line,
                    ));
                }
                match content.into_iter().next().unwrap() {
                    Token::Stmt(Statement {
                        expr: Expr::CommaList { lists },
                        ..
                    }) => {
                        for list in lists {
                            if list.len() != 1 || !list[0].is_statement() {
                                return Err(CompileError::parse(
                                    "Function parameter content must be one statement",
                                    self.line,
                                ));
                            }
                            arguments
                                .push(list.into_iter().next().unwrap().into_statement().unwrap());
                        }
                    }
                    Token::Stmt(statement) => arguments.push(statement),
                    _ => unreachable!(),
                }
            }
            if let Some(variable) = this_pointer {
                arguments.insert(
                    0,
                    Statement::typed(Expr::Variable { var: variable }, variable.data_type),
                );
            }

            // Infer argument types, then resolve the overload
            let mut argument_types: SmallVec<[DataType; 8]> = SmallVec::new();
            for argument in arguments.iter_mut() {
                argument_types.push(self.assign_statement_data_type(argument, None, ctx)?);
            }

            let function = if is_base_call {
                let own_parameter_types: SmallVec<[DataType; 4]> = {
                    let function = ctx.function.borrow();
                    function.parameters.iter().map(|p| p.data_type).collect()
                };
                if argument_types.len() != own_parameter_types.len() {
                    return Err(CompileError::semantic(
                        format!("Base function call for '{}' has different parameter count", name),
                        self.line,
                    ));
                }
                if let Err(failed) = self
                    .type_casting
                    .can_match_signature(&argument_types, &own_parameter_types)
                {
                    let parameter_name = ctx.function.borrow().parameters[failed].name.clone();
                    return Err(CompileError::semantic(
                        format!(
                            "Can't cast parameters of '{}' function call to match base function, parameter '{}' has the wrong type",
                            name, parameter_name
                        ),
                        self.line,
                    ));
                }

                if !base_function_exists {
                    // No base function: drop the call or substitute the
                    // return type's default value
                    let return_type = ctx.function.borrow().return_type;
                    match return_type.class() {
                        TypeClass::Void => {
                            tokens.remove(i);
                        }
                        TypeClass::Integer | TypeClass::String | TypeClass::Custom => {
                            tokens[i] = Token::Stmt(Statement::constant(0, return_type));
                        }
                        TypeClass::Any => {
                            return Err(CompileError::semantic(
                                "'any' type cannot be used as a return value",
                                self.line,
                            ));
                        }
                    }
                    return Ok(());
                }
                FunctionHandle::Script(ctx.function.clone())
            } else {
                let mut best_score = 0xff00_0000u32;
                let mut best: Option<FunctionHandle> = None;
                for candidate in &candidates {
                    let parameter_types = candidate.parameter_types();
                    let score = self
                        .type_casting
                        .overload_score(&argument_types, &parameter_types);
                    if score < best_score {
                        best_score = score;
                        best = Some(candidate.clone());
                    }
                }
                best.ok_or_else(|| {
                    CompileError::semantic(
                        format!(
                            "No appropriate function overload found calling '{}', the number or types of parameters passed are wrong",
                            name
                        ),
                        self.line,
                    )
                })?
            };

            let data_type = function.return_type();
            tokens[i] = Token::Stmt(Statement::typed(
                Expr::FunctionCall {
                    function,
                    is_base_call,
                    arguments,
                },
                data_type,
            ));
            i += 1;
        }
        Ok(())
    }

    fn process_memory_accesses(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        let mut i = 0;
        while i + 1 < tokens.len() {
            let element_type = match tokens[i].as_var_type() {
                Some(data_type) if tokens[i + 1].is_parenthesis(ParenKind::Square) => data_type,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let valid_element = matches!(
                element_type,
                DataType::Int(int) if int.semantics == IntSemantics::Default
            );
            if !valid_element {
                return Err(CompileError::semantic(
                    format!(
                        "Memory access is only possible using basic integer types, but not '{}'",
                        element_type
                    ),
                    self.line,
                ));
            }

            let mut content = match tokens.remove(i + 1) {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!(),
            };
            if content.len() != 1 || !content[0].is_statement() {
                return Err(CompileError::parse(
                    "Expected exactly one statement token inside brackets",
                    self.line,
                ));
            }
            let mut address = content.pop().unwrap().into_statement().unwrap();
            self.assign_statement_data_type(&mut address, Some(DataType::U32), ctx)?;

            tokens[i] = Token::Stmt(Statement::typed(
                Expr::MemoryAccess {
                    address: Box::new(address),
                },
                element_type,
            ));
            i += 1;
        }
        Ok(())
    }

    fn process_array_accesses(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        let mut i = 0;
        while i + 1 < tokens.len() {
            let name = match tokens[i].as_identifier() {
                Some(name) if tokens[i + 1].is_parenthesis(ParenKind::Square) => name.clone(),
                _ => {
                    i += 1;
                    continue;
                }
            };
            let array = self
                .find_constant_array(name.hash(), ctx)
                .ok_or_else(|| {
                    CompileError::semantic(
                        format!("Unable to resolve identifier: {}", name),
                        self.line,
                    )
                })?;

            let matching = self
                .builtin_constant_array_access
                .iter()
                .find(|f| f.return_type() == array.element_type)
                .cloned();
            let function = match matching {
                Some(function) => function,
                None => {
                    i += 1;
                    continue;
                }
            };

            let mut content = match tokens.remove(i + 1) {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!(),
            };
            if content.len() != 1 || !content[0].is_statement() {
                return Err(CompileError::parse(
                    "Expected exactly one statement token inside brackets",
                    self.line,
                ));
            }
            let mut index_statement = content.pop().unwrap().into_statement().unwrap();

            let mut id_statement = Statement::constant(array.id as u64, DataType::U32);
            self.assign_statement_data_type(&mut id_statement, Some(DataType::U32), ctx)?;
            self.assign_statement_data_type(&mut index_statement, Some(DataType::U32), ctx)?;

            let data_type = function.return_type();
            tokens[i] = Token::Stmt(Statement::typed(
                Expr::FunctionCall {
                    function,
                    is_base_call: false,
                    arguments: vec![id_statement, index_statement],
                },
                data_type,
            ));
            i += 1;
        }
        Ok(())
    }

    fn process_explicit_casts(&mut self, tokens: &mut TokenList) -> CompileResult<()> {
        let mut i = 0;
        while i + 1 < tokens.len() {
            let target_type = match tokens[i].as_var_type() {
                Some(data_type) if tokens[i + 1].is_parenthesis(ParenKind::Round) => data_type,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let argument = tokens.remove(i + 1).into_statement().unwrap();
            tokens[i] = Token::Stmt(Statement::typed(
                Expr::ValueCast {
                    arg: Box::new(argument),
                },
                target_type,
            ));
            i += 1;
        }
        Ok(())
    }

    fn process_variables(
        &mut self,
        tokens: &mut TokenList,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        for token in tokens.iter_mut() {
            let name = match token.as_identifier() {
                Some(name) => name.clone(),
                None => continue,
            };
            let variable = self.find_variable(name.hash(), ctx).ok_or_else(|| {
                CompileError::semantic(
                    format!("Unable to resolve identifier: {}", name),
                    self.line,
                )
            })?;
            *token = Token::Stmt(Statement::typed(
                Expr::Variable { var: variable },
                variable.data_type,
            ));
        }
        Ok(())
    }

    fn resolve_addressof_functions(&mut self, tokens: &mut TokenList) -> CompileResult<()> {
        let mut i = 0;
        while i + 1 < tokens.len() {
            if !tokens[i].is_keyword(Keyword::AddressOf) {
                i += 1;
                continue;
            }
            let content_name: Option<FlyweightStr> = match &tokens[i + 1] {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { kind: ParenKind::Round, content },
                    ..
                }) if content.len() == 1 => content[0].as_identifier().cloned(),
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { .. },
                    ..
                }) => None,
                _ => {
                    return Err(CompileError::parse(
                        "addressof must be followed by parentheses",
                        self.line,
                    ));
                }
            };
            let name = match content_name {
                Some(name) => name,
                None => {
                    i += 1;
                    continue;
                }
            };
            let candidates = self.globals.functions_by_name(name.hash());
            if candidates.is_empty() {
                i += 1;
                continue;
            }
            let mut address = 0u32;
            for candidate in candidates {
                if let FunctionHandle::Script(script) = candidate {
                    let hooks = &script.borrow().address_hooks;
                    if let Some(first) = hooks.first() {
                        address = *first;
                        break;
                    }
                }
            }
            if address == 0 {
                return Err(CompileError::semantic(
                    format!("No address hook found for function '{}'", name),
                    self.line,
                ));
            }
            tokens[i] = Token::Stmt(Statement::constant(address as u64, DataType::U32));
            tokens.remove(i + 1);
            break;
        }
        Ok(())
    }

    fn resolve_addressof_memory_accesses(&mut self, tokens: &mut TokenList) -> CompileResult<()> {
        let mut i = 0;
        while i + 1 < tokens.len() {
            if !tokens[i].is_keyword(Keyword::AddressOf) {
                i += 1;
                continue;
            }
            if !tokens[i + 1].is_parenthesis(ParenKind::Round) {
                return Err(CompileError::parse(
                    "addressof must be followed by parentheses",
                    self.line,
                ));
            }
            let mut content = match tokens.remove(i + 1) {
                Token::Stmt(Statement {
                    expr: Expr::Parenthesis { content, .. },
                    ..
                }) => content,
                _ => unreachable!(),
            };
            if content.len() != 1 {
                return Err(CompileError::parse(
                    "Expected a single token in parentheses after addressof",
                    self.line,
                ));
            }
            match content.pop().unwrap() {
                Token::Stmt(Statement {
                    expr: Expr::MemoryAccess { address },
                    ..
                }) => {
                    tokens[i] = Token::Stmt(*address);
                }
                _ => {
                    return Err(CompileError::parse(
                        "Unsupported use of addressof",
                        self.line,
                    ));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Compile-time constant folding
    // ========================================================================

    fn evaluate_compile_time_constants(&mut self, tokens: &mut TokenList) -> CompileResult<()> {
        for token in tokens.iter_mut() {
            if let Token::Stmt(statement) = token {
                self.fold_statement(statement)?;
            }
        }
        Ok(())
    }

    fn fold_statement(&mut self, statement: &mut Statement) -> CompileResult<()> {
        match &mut statement.expr {
            Expr::Parenthesis {
                kind: ParenKind::Round,
                content,
            } if content.len() == 1 && content[0].is_statement() => {
                // Unwrap single-statement parentheses; their content was
                // already folded during the recursive pass
                let inner = content.pop().unwrap().into_statement().unwrap();
                *statement = inner;
                self.fold_statement(statement)?;
            }

            Expr::Unary { op, arg } => {
                self.fold_statement(arg)?;
                let is_integer = arg
                    .data_type
                    .map(|dt| dt.class() == TypeClass::Integer)
                    .unwrap_or(false);
                if let (true, Some(value)) = (is_integer, arg.constant_value()) {
                    let value = value as i64;
                    let folded = match op {
                        Operator::BinaryMinus => Some(value.wrapping_neg()),
                        Operator::UnaryNot => Some((value == 0) as i64),
                        Operator::UnaryBitnot => Some(!value),
                        _ => None,
                    };
                    if let Some(folded) = folded {
                        let data_type = arg.data_type.unwrap();
                        *statement = Statement::constant(folded as u64, data_type);
                    }
                }
            }

            Expr::Binary {
                op,
                left,
                right,
                enforced_function,
            } => {
                self.fold_statement(left)?;
                self.fold_statement(right)?;
                if enforced_function.is_some() {
                    return Ok(());
                }
                let both_integer = [&*left, &*right].iter().all(|s| {
                    s.data_type
                        .map(|dt| dt.class() == TypeClass::Integer)
                        .unwrap_or(false)
                });
                if let (true, Some(a), Some(b)) =
                    (both_integer, left.constant_value(), right.constant_value())
                {
                    let a = a as i64;
                    let b = b as i64;
                    let folded = match op {
                        Operator::BinaryPlus => Some(a.wrapping_add(b)),
                        Operator::BinaryMinus => Some(a.wrapping_sub(b)),
                        Operator::BinaryMultiply => Some(a.wrapping_mul(b)),
                        Operator::BinaryDivide => {
                            Some(if b == 0 { 0 } else { a.wrapping_div(b) })
                        }
                        Operator::BinaryModulo => {
                            Some(if b == 0 { 0 } else { a.wrapping_rem(b) })
                        }
                        Operator::BinaryShiftLeft => Some(a.wrapping_shl(b as u32)),
                        Operator::BinaryShiftRight => Some(a.wrapping_shr(b as u32)),
                        Operator::BinaryAnd => Some(a & b),
                        Operator::BinaryOr => Some(a | b),
                        Operator::BinaryXor => Some(a ^ b),
                        _ => None,
                    };
                    if let Some(folded) = folded {
                        let data_type = left.data_type.unwrap();
                        *statement = Statement::constant(folded as u64, data_type);
                    }
                }
            }

            Expr::FunctionCall {
                function,
                arguments,
                ..
            } => {
                let mut all_constant = true;
                for argument in arguments.iter_mut() {
                    self.fold_statement(argument)?;
                    all_constant &= argument.is_constant();
                }
                if !all_constant {
                    return Ok(());
                }
                let native = match function {
                    FunctionHandle::Native(native) if native.flags.compile_time_constant => {
                        native.clone()
                    }
                    _ => return Ok(()),
                };
                if native.return_type.class() == TypeClass::Void
                    || native.parameters.len() != arguments.len()
                {
                    return Ok(());
                }

                // Evaluate by pushing the cast arguments on a scratch stack
                // and invoking the wrapper
                let mut scratch = CompileTimeContext {
                    stack: Vec::with_capacity(arguments.len() + 1),
                    globals: self.globals,
                    new_string_literals: &mut self.new_string_literals,
                };
                for (argument, parameter) in arguments.iter().zip(native.parameters.iter()) {
                    let from = argument.data_type.unwrap_or(DataType::CONST_INT);
                    let cast = self.type_casting.base_cast_type(from, parameter.data_type);
                    let value =
                        cast_constant_value(cast, argument.constant_value().unwrap());
                    scratch.stack.push(value);
                }
                (native.wrapper)(&mut scratch).map_err(|message| {
                    CompileError::semantic(
                        format!("Compile-time evaluation of '{}' failed: {}", native.name, message),
                        self.line,
                    )
                })?;
                let result = scratch.stack.pop().ok_or_else(|| {
                    CompileError::semantic(
                        format!("Compile-time evaluation of '{}' returned no value", native.name),
                        self.line,
                    )
                })?;
                let data_type = statement.data_type.unwrap_or(native.return_type);
                *statement = Statement::constant(result, data_type);
            }

            _ => {}
        }
        Ok(())
    }

    // ========================================================================
    // Statement typing
    // ========================================================================

    fn assign_statement_data_types(
        &mut self,
        tokens: &mut TokenList,
        result_type: Option<DataType>,
        ctx: &mut FunctionContext,
    ) -> CompileResult<()> {
        for token in tokens.iter_mut() {
            if let Token::Stmt(statement) = token {
                self.assign_statement_data_type(statement, result_type, ctx)?;
            }
        }
        Ok(())
    }

    pub(crate) fn assign_statement_data_type(
        &mut self,
        statement: &mut Statement,
        result_type: Option<DataType>,
        ctx: &mut FunctionContext,
    ) -> CompileResult<DataType> {
        match &mut statement.expr {
            Expr::Constant { .. } => {
                let current = statement.data_type.unwrap_or(DataType::CONST_INT);
                if current.class() == TypeClass::Integer {
                    statement.data_type = match result_type {
                        Some(target) if target.class() == TypeClass::Integer => Some(target),
                        _ => Some(DataType::CONST_INT),
                    };
                }
            }

            Expr::Variable { .. } | Expr::FunctionCall { .. } | Expr::MemoryAccess { .. } => {
                // Data type was set when the token was created
            }

            Expr::Parenthesis { content, .. } => {
                if content.len() != 1 || !content[0].is_statement() {
                    return Err(CompileError::parse(
                        "Parenthesis content must be one statement",
                        self.line,
                    ));
                }
                let inner_type = match &mut content[0] {
                    Token::Stmt(inner) => {
                        self.assign_statement_data_type(inner, result_type, ctx)?
                    }
                    _ => unreachable!(),
                };
                statement.data_type = Some(inner_type);
            }

            Expr::Unary { arg, .. } => {
                let data_type = self.assign_statement_data_type(arg, result_type, ctx)?;
                statement.data_type = Some(data_type);
            }

            Expr::Binary {
                op,
                left,
                right,
                enforced_function,
            } => {
                let op = *op;
                let op_class = op.class();
                let expected = if op_class == OperatorClass::Symmetric {
                    result_type
                } else {
                    None
                };
                let left_type = self.assign_statement_data_type(left, expected, ctx)?;
                let right_expected = if op_class == OperatorClass::Assignment {
                    Some(left_type)
                } else {
                    expected
                };
                let right_type = self.assign_statement_data_type(right, right_expected, ctx)?;

                let choice = self.best_binary_operation(op, left_type, right_type)?;
                match (&choice.enforced_function, choice.split_to_operator) {
                    (None, _) => {
                        statement.data_type = Some(choice.signature.result);
                        if op_class != OperatorClass::Trinary {
                            self.insert_cast_if_necessary(left, choice.signature.left);
                            self.insert_cast_if_necessary(right, choice.signature.right);
                        }
                    }
                    (Some(function), None) => {
                        *enforced_function = Some(function.clone());
                        statement.data_type = Some(choice.signature.result);
                    }
                    (Some(function), Some(split_op)) => {
                        // Split "A op= B" into "A = A op B" with the builtin
                        // bound to the inner operation
                        let function = function.clone();
                        let result_type = choice.signature.result;
                        let assignment_target = left.clone();
                        let taken_right = std::mem::replace(
                            right,
                            Box::new(Statement::constant(0, DataType::CONST_INT)),
                        );
                        let inner = Statement {
                            data_type: Some(result_type),
                            expr: Expr::Binary {
                                op: split_op,
                                left: assignment_target.clone(),
                                right: taken_right,
                                enforced_function: Some(function),
                            },
                        };
                        statement.expr = Expr::Binary {
                            op: Operator::Assign,
                            left: assignment_target,
                            right: Box::new(inner),
                            enforced_function: None,
                        };
                        statement.data_type = Some(result_type);
                    }
                }
            }

            Expr::ValueCast { arg } => {
                let target = statement.data_type.ok_or_else(|| {
                    CompileError::cast("Cast target type missing", self.line)
                })?;
                let original = self.assign_statement_data_type(arg, Some(target), ctx)?;
                if !self.type_casting.can_explicitly_cast(original, target) {
                    return Err(CompileError::cast(
                        format!(
                            "Explicit cast not possible from {} to {}",
                            original, target
                        ),
                        self.line,
                    ));
                }
            }

            Expr::Identifier { name } => {
                return Err(CompileError::semantic(
                    format!("Unable to resolve identifier: {}", name),
                    self.line,
                ));
            }

            Expr::CommaList { .. } => {
                // Comma lists only appear in statement positions that never
                // produce a value (indirect jumps)
                statement.data_type = Some(DataType::Void);
            }
        }

        Ok(statement.data_type.unwrap_or(DataType::Void))
    }

    fn insert_cast_if_necessary(&self, statement: &mut Box<Statement>, target: DataType) {
        let current = match statement.data_type {
            Some(data_type) => data_type,
            None => return,
        };
        if let CastHandling::BaseCast(_) = self.type_casting.cast_handling(current, target) {
            let inner = std::mem::replace(
                statement,
                Box::new(Statement::constant(0, DataType::CONST_INT)),
            );
            *statement = Box::new(Statement::typed(Expr::ValueCast { arg: inner }, target));
        }
    }

    fn best_binary_operation(
        &self,
        op: Operator,
        left: DataType,
        right: DataType,
    ) -> CompileResult<BinaryOperationChoice> {
        // Builtin-backed operations (strings) take precedence from feature
        // level 2 on
        if self.options.script_feature_level >= 2 {
            if let Some(lookups) = self.binary_operation_lookup.get(&(op as u8)) {
                let mut best_priority = 0xff00u16;
                let mut best: Option<&BinaryOperationLookup> = None;
                for lookup in lookups {
                    let priority =
                        self.type_casting
                            .priority_of_signature(&lookup.signature, left, right);
                    if priority < best_priority {
                        best_priority = priority;
                        best = Some(lookup);
                    }
                }
                if let Some(lookup) = best {
                    return Ok(BinaryOperationChoice {
                        signature: lookup.signature,
                        enforced_function: lookup.function.clone(),
                        split_to_operator: lookup.split_to_operator,
                    });
                }
            }
        }

        if let Some(signature) = self.type_casting.best_operator_signature(op, left, right) {
            return Ok(BinaryOperationChoice {
                signature,
                enforced_function: None,
                split_to_operator: None,
            });
        }

        // Assignment between two values of the same type always works
        if left == right && op == Operator::Assign {
            return Ok(BinaryOperationChoice {
                signature: BinaryOperatorSignature::new(left, right, left),
                enforced_function: None,
                split_to_operator: None,
            });
        }

        Err(CompileError::semantic(
            format!(
                "Cannot apply binary operator {} between types '{}' and '{}'",
                op.characters(),
                left,
                right
            ),
            self.line,
        ))
    }

    // ========================================================================
    // Lookup helpers
    // ========================================================================

    fn find_variable(&self, name_hash: u64, ctx: &FunctionContext) -> Option<VarRef> {
        if let Some(local) = find_local_variable(ctx.scope, name_hash) {
            return Some(local.var_ref());
        }
        match self.globals.resolve(name_hash) {
            Some(Identifier::Variable(variable)) => Some(variable.var_ref()),
            _ => None,
        }
    }

    fn find_constant_array(
        &self,
        name_hash: u64,
        ctx: &FunctionContext,
    ) -> Option<Rc<ConstantArray>> {
        if let Some(array) = ctx
            .scope
            .local_constant_arrays
            .iter()
            .find(|a| a.name.hash() == name_hash)
        {
            return Some(array.clone());
        }
        match self.globals.resolve(name_hash) {
            Some(Identifier::ConstantArray(array)) => Some(array.clone()),
            _ => None,
        }
    }
}

fn find_local_variable(scope: &ScopeContext, name_hash: u64) -> Option<&LocalVariable> {
    scope
        .local_variables
        .iter()
        .find(|v| v.name.hash() == name_hash)
}

/// Scratch evaluation context for compile-time-constant natives.
struct CompileTimeContext<'a> {
    stack: Vec<u64>,
    globals: &'a GlobalsLookup,
    new_string_literals: &'a mut Vec<FlyweightStr>,
}

impl NativeCallContext for CompileTimeContext<'_> {
    fn pop(&mut self) -> u64 {
        self.stack.pop().unwrap_or(0)
    }

    fn push(&mut self, value: u64) {
        self.stack.push(value);
    }

    fn resolve_string(&self, key: u64) -> Option<FlyweightStr> {
        self.globals.string_literal_by_hash(key).cloned().or_else(|| {
            self.new_string_literals
                .iter()
                .find(|s| s.hash() == key)
                .cloned()
        })
    }

    fn intern_string(&mut self, text: &str) -> u64 {
        let literal = FlyweightStr::new(text);
        let hash = literal.hash();
        if !self.new_string_literals.contains(&literal) {
            self.new_string_literals.push(literal);
        }
        hash
    }

    fn constant_array_value(&self, _array_id: u32, _index: u64) -> Option<u64> {
        None
    }

    fn signal_stop(&mut self) {}
}
