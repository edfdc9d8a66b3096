// citron-vm - Compiler backend
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The backend: walks each function's typed statement tree and emits the
//! linear opcode stream, then runs the opcode optimizer over it.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use citron_core::{Expr, Label, Opcode, OpcodeType, ScriptFunction, Statement};
use citron_parser::{
    BaseCastType, BaseType, DataType, FlyweightStr, Operator, TypeClass,
};

use super::error::{CompileError, CompileResult};
use super::nodes::{BlockNode, ExternalKind, FunctionEntry, Node};
use super::options::CompileOptions;
use super::type_casting::{cast_constant_value, CastHandling, TypeCasting};

/// Jump targets waiting for a label's final offset.
#[derive(Debug, Default)]
struct CollectedLabel {
    jump_locations: Vec<usize>,
}

/// Loop state threaded through node emission; `break`/`continue` record
/// their jump locations here for patching once the loop is complete.
#[derive(Debug, Default, Clone)]
struct NodeContext {
    is_loop_block: bool,
    break_locations: Vec<usize>,
    continue_locations: Vec<usize>,
}

/// Compiles one function's node tree into opcodes.
pub struct FunctionCompiler<'a> {
    function: &'a Rc<RefCell<ScriptFunction>>,
    options: &'a CompileOptions,
    type_casting: TypeCasting,

    opcodes: Vec<Opcode>,
    labels: Vec<Label>,
    collected_labels: AHashMap<u64, (FlyweightStr, CollectedLabel)>,
    line: u32,

    // Metadata cloned up front so emission never holds a borrow
    function_name: FlyweightStr,
    return_type: DataType,
    parameter_types: Vec<DataType>,
    local_count: usize,
    start_line: u32,
}

/// Compile a processed function entry and store the opcodes in the function.
pub fn compile_function(entry: &FunctionEntry, options: &CompileOptions) -> CompileResult<()> {
    let mut compiler = FunctionCompiler::new(&entry.function, options);
    compiler.process_parameters();
    compiler.build_opcodes_for_function(&entry.content)?;
    compiler.finish();
    Ok(())
}

impl<'a> FunctionCompiler<'a> {
    pub fn new(function: &'a Rc<RefCell<ScriptFunction>>, options: &'a CompileOptions) -> Self {
        let (function_name, return_type, parameter_types, local_count, start_line) = {
            let f = function.borrow();
            (
                f.name.clone(),
                f.return_type,
                f.parameters.iter().map(|p| p.data_type).collect(),
                f.local_variables.len(),
                f.start_line_number,
            )
        };
        FunctionCompiler {
            function,
            options,
            type_casting: TypeCasting::new(options),
            opcodes: Vec::new(),
            labels: Vec::new(),
            collected_labels: AHashMap::new(),
            line: 0,
            function_name,
            return_type,
            parameter_types,
            local_count,
            start_line,
        }
    }

    fn finish(self) {
        let mut function = self.function.borrow_mut();
        function.opcodes = self.opcodes;
        function.labels = self.labels;
    }

    // ========================================================================
    // Emission primitives
    // ========================================================================

    fn add_opcode(&mut self, op: OpcodeType, base_type: BaseType, param: i64) -> usize {
        // Signedness makes no difference for these; normalizing improves
        // opcode merging and keeps the emitted stream canonical
        let sign_agnostic = matches!(
            op,
            OpcodeType::GetVariableValue
                | OpcodeType::SetVariableValue
                | OpcodeType::ReadMemory
                | OpcodeType::WriteMemory
                | OpcodeType::ArithmAdd
                | OpcodeType::ArithmSub
                | OpcodeType::ArithmAnd
                | OpcodeType::ArithmOr
                | OpcodeType::ArithmXor
                | OpcodeType::ArithmShl
                | OpcodeType::ArithmNeg
                | OpcodeType::ArithmNot
                | OpcodeType::ArithmBitnot
                | OpcodeType::CompareEq
                | OpcodeType::CompareNeq
        );
        let base_type = if sign_agnostic {
            base_type.make_unsigned()
        } else {
            base_type
        };
        self.opcodes.push(Opcode::new(op, base_type, param, self.line));
        self.opcodes.len() - 1
    }

    fn add_opcode_plain(&mut self, op: OpcodeType, param: i64) -> usize {
        self.add_opcode(op, BaseType::Void, param)
    }

    fn add_opcode_typed(&mut self, op: OpcodeType, data_type: DataType, param: i64) -> usize {
        self.add_opcode(op, data_type.base_type(), param)
    }

    fn add_cast_opcode_if_necessary(
        &mut self,
        source: DataType,
        target: DataType,
    ) -> CompileResult<()> {
        match self.type_casting.cast_handling(source, target) {
            CastHandling::NoCast => {}
            CastHandling::BaseCast(cast) => {
                self.add_opcode_plain(OpcodeType::CastValue, cast.to_u8() as i64);
            }
            CastHandling::AnyCast => {
                // Casting to "any" pushes the source type alongside the value
                self.add_opcode(
                    OpcodeType::PushConstant,
                    BaseType::IntConst,
                    source.type_hash() as i64,
                );
            }
            CastHandling::Invalid => {
                return Err(CompileError::backend(
                    format!("Cannot cast from {} to {}", source, target),
                    self.line,
                ));
            }
        }
        Ok(())
    }

    fn add_jump_to_label(&mut self, op: OpcodeType, label: &FlyweightStr) -> CompileResult<()> {
        let location = self.opcodes.len();
        let entry = self
            .collected_labels
            .get_mut(&label.hash())
            .ok_or_else(|| {
                CompileError::backend(
                    format!("Jump target label not found: {}", label),
                    self.line,
                )
            })?;
        entry.1.jump_locations.push(location);
        self.add_opcode_plain(op, 0);
        Ok(())
    }

    // ========================================================================
    // Function-level structure
    // ========================================================================

    /// Pop the call arguments into the parameter locals, in reverse order.
    pub fn process_parameters(&mut self) {
        if self.local_count == 0 {
            return;
        }
        self.line = self.start_line;
        self.add_opcode_plain(OpcodeType::MoveVarStack, self.local_count as i64);

        for index in (0..self.parameter_types.len()).rev() {
            let data_type = self.parameter_types[index];
            self.add_opcode_typed(OpcodeType::SetVariableValue, data_type, index as i64);
            self.add_opcode_plain(OpcodeType::MoveStack, -1);
        }
    }

    pub fn build_opcodes_for_function(&mut self, block: &BlockNode) -> CompileResult<()> {
        let mut context = NodeContext::default();
        self.build_opcodes_from_nodes(block, &mut context)?;

        // Resolve all label jumps
        let collected: Vec<(FlyweightStr, CollectedLabel)> =
            self.collected_labels.drain().map(|(_, v)| v).collect();
        for (name, collected_label) in collected {
            let offset = self
                .labels
                .iter()
                .find(|l| l.name == name)
                .map(|l| l.offset as i64)
                .ok_or_else(|| {
                    CompileError::backend(
                        format!("Jump target label not found: {}", name),
                        self.line,
                    )
                })?;
            for location in collected_label.jump_locations {
                self.opcodes[location].param = offset;
            }
        }

        // Every function ends with a return
        let ends_with_return = self
            .opcodes
            .last()
            .map(|op| op.op == OpcodeType::Return)
            .unwrap_or(false);
        if !ends_with_return {
            if self.return_type.class() != TypeClass::Void {
                return Err(CompileError::backend(
                    format!(
                        "Function '{}' must return a {} value",
                        self.function_name, self.return_type
                    ),
                    block.line,
                ));
            }
            self.add_opcode_plain(OpcodeType::Return, 0);
        } else {
            // Jumps may lead past the return at the end; pull them back
            let last = self.opcodes.len() - 1;
            for opcode in self.opcodes.iter_mut() {
                if matches!(opcode.op, OpcodeType::Jump | OpcodeType::JumpConditional)
                    && opcode.param as usize >= last + 1
                {
                    opcode.param = last as i64;
                }
            }
        }

        if self.options.optimization_level > 0 {
            self.optimize_opcodes();
        }
        Ok(())
    }

    fn build_opcodes_from_nodes(
        &mut self,
        block: &BlockNode,
        context: &mut NodeContext,
    ) -> CompileResult<()> {
        // Collect this block's labels first so forward jumps resolve
        for node in &block.nodes {
            if let Node::Label { name, line } = node {
                if self.collected_labels.contains_key(&name.hash()) {
                    return Err(CompileError::backend(
                        format!("Label is defined more than once: {}", name),
                        *line,
                    ));
                }
                self.collected_labels
                    .insert(name.hash(), (name.clone(), CollectedLabel::default()));
            }
        }

        for node in &block.nodes {
            self.build_opcodes_for_node(node, context)?;
        }
        Ok(())
    }

    fn build_opcodes_for_node(&mut self, node: &Node, context: &mut NodeContext) -> CompileResult<()> {
        self.line = node.line();
        match node {
            Node::Block(block) => {
                self.build_opcodes_from_nodes(block, context)?;
            }

            Node::Label { name, line } => {
                if self.labels.iter().any(|l| l.name == *name) {
                    return Err(CompileError::backend(
                        format!("Label is defined more than once: {}", name),
                        *line,
                    ));
                }
                let offset = self.opcodes.len();
                self.labels.push(Label {
                    name: name.clone(),
                    offset: offset as u32,
                });
            }

            Node::Statement { statement, .. } => {
                self.compile_statement(statement, true, false)?;
            }

            Node::Jump { label, .. } => {
                self.add_jump_to_label(OpcodeType::Jump, label)?;
            }

            Node::JumpIndirect { index, labels, line } => {
                if labels.is_empty() {
                    return Err(CompileError::backend(
                        "Indirect jump node must have at least one label",
                        *line,
                    ));
                }
                self.compile_statement(index, false, false)?;
                for label in labels {
                    self.add_jump_to_label(OpcodeType::JumpSwitch, label)?;
                }
                // Consume the index if none of the jumps did
                self.add_opcode_plain(OpcodeType::MoveStack, -1);
            }

            Node::Break { line } => {
                if !context.is_loop_block {
                    return Err(CompileError::backend(
                        "Keyword 'break' is only allowed inside a while or for loop",
                        *line,
                    ));
                }
                context.break_locations.push(self.opcodes.len());
                self.add_opcode_plain(OpcodeType::Jump, 0);
            }

            Node::Continue { line } => {
                if !context.is_loop_block {
                    return Err(CompileError::backend(
                        "Keyword 'continue' is only allowed inside a while or for loop",
                        *line,
                    ));
                }
                context.continue_locations.push(self.opcodes.len());
                self.add_opcode_plain(OpcodeType::Jump, 0);
            }

            Node::Return { statement, line } => {
                match statement {
                    Some(statement) => {
                        if self.return_type.class() == TypeClass::Void {
                            return Err(CompileError::backend(
                                format!(
                                    "Function '{}' with 'void' return type cannot return a value",
                                    self.function_name
                                ),
                                *line,
                            ));
                        }
                        self.compile_statement(statement, false, false)?;
                        let source = statement.data_type.unwrap_or(DataType::Void);
                        self.add_cast_opcode_if_necessary(source, self.return_type)?;
                    }
                    None => {
                        if self.return_type.class() != TypeClass::Void {
                            return Err(CompileError::backend(
                                format!(
                                    "Function '{}' must return a {} value",
                                    self.function_name, self.return_type
                                ),
                                *line,
                            ));
                        }
                    }
                }
                self.add_opcode_plain(OpcodeType::Return, 0);
            }

            Node::External { statement, kind, .. } => {
                self.compile_statement(statement, false, false)?;
                let source = statement.data_type.unwrap_or(DataType::Void);
                self.add_cast_opcode_if_necessary(source, self.options.external_address_type)?;
                let op = match kind {
                    ExternalKind::Call => OpcodeType::ExternalCall,
                    ExternalKind::Jump => OpcodeType::ExternalJump,
                };
                self.add_opcode_plain(op, 0);
            }

            Node::If { .. } => {
                // Emit the whole else-if chain iteratively, keeping the open
                // jump targets to patch once the chain ends
                let mut open_builders: Vec<(usize, Option<usize>)> = Vec::new();
                let mut current = node;
                loop {
                    let (condition, content_if, content_else) = match current {
                        Node::If {
                            condition,
                            content_if,
                            content_else,
                            ..
                        } => (condition, content_if, content_else),
                        _ => unreachable!(),
                    };

                    self.compile_statement(condition, false, false)?;
                    let if_jump = self.add_opcode_plain(OpcodeType::JumpConditional, 0);
                    self.build_opcodes_for_node(content_if, context)?;

                    match content_else {
                        Some(else_node) => {
                            let else_jump = self.add_opcode_plain(OpcodeType::Jump, 0);
                            self.opcodes[if_jump].param = self.opcodes.len() as i64;
                            open_builders.push((if_jump, Some(else_jump)));

                            self.line = current.line();
                            if matches!(**else_node, Node::If { .. }) {
                                current = else_node.as_ref();
                                continue;
                            }
                            self.build_opcodes_for_node(else_node, context)?;
                        }
                        None => {
                            open_builders.push((if_jump, None));
                        }
                    }
                    break;
                }

                let end = self.opcodes.len() as i64;
                for (if_jump, else_jump) in open_builders.into_iter().rev() {
                    match else_jump {
                        Some(else_jump) => self.opcodes[else_jump].param = end,
                        None => self.opcodes[if_jump].param = end,
                    }
                }
            }

            Node::While {
                condition, content, ..
            } => {
                let start_position = self.opcodes.len();
                self.compile_statement(condition, false, false)?;
                let if_jump = self.add_opcode_plain(OpcodeType::JumpConditional, 0);

                let mut inner = NodeContext {
                    is_loop_block: true,
                    ..Default::default()
                };
                self.build_opcodes_for_node(content, &mut inner)?;

                self.add_opcode_plain(OpcodeType::Jump, start_position as i64);
                let end = self.opcodes.len() as i64;
                self.opcodes[if_jump].param = end;
                for location in inner.break_locations {
                    self.opcodes[location].param = end;
                }
                for location in inner.continue_locations {
                    self.opcodes[location].param = start_position as i64;
                }
            }

            Node::For {
                initial,
                condition,
                iteration,
                content,
                ..
            } => {
                if let Some(initial) = initial {
                    self.compile_statement(initial, true, false)?;
                }
                let start_position = self.opcodes.len();
                let mut if_jump = None;
                if let Some(condition) = condition {
                    self.compile_statement(condition, false, false)?;
                    if_jump = Some(self.add_opcode_plain(OpcodeType::JumpConditional, 0));
                }

                let mut inner = NodeContext {
                    is_loop_block: true,
                    ..Default::default()
                };
                self.build_opcodes_for_node(content, &mut inner)?;

                let continue_position = self.opcodes.len();
                if let Some(iteration) = iteration {
                    self.compile_statement(iteration, true, false)?;
                }
                self.add_opcode_plain(OpcodeType::Jump, start_position as i64);

                let end = self.opcodes.len() as i64;
                if let Some(if_jump) = if_jump {
                    self.opcodes[if_jump].param = end;
                }
                for location in inner.break_locations {
                    self.opcodes[location].param = end;
                }
                for location in inner.continue_locations {
                    self.opcodes[location].param = continue_position as i64;
                }
            }

            Node::Undefined { line, .. } => {
                return Err(CompileError::backend(
                    "Unprocessed line reached the backend",
                    *line,
                ));
            }

            Node::Pragma { .. } => {}
        }
        Ok(())
    }

    // ========================================================================
    // Statement emission
    // ========================================================================

    fn compile_statement(
        &mut self,
        statement: &Statement,
        consume_result: bool,
        is_lvalue: bool,
    ) -> CompileResult<()> {
        let statement_type = statement.data_type.unwrap_or(DataType::Void);
        match &statement.expr {
            Expr::Unary { op, arg } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to a unary operation",
                        self.line,
                    ));
                }
                match op {
                    Operator::BinaryMinus => {
                        self.compile_statement(arg, false, false)?;
                        self.add_opcode_typed(OpcodeType::ArithmNeg, statement_type, 0);
                    }
                    Operator::UnaryNot => {
                        self.compile_statement(arg, false, false)?;
                        self.add_opcode_typed(OpcodeType::ArithmNot, statement_type, 0);
                    }
                    Operator::UnaryBitnot => {
                        self.compile_statement(arg, false, false)?;
                        self.add_opcode_typed(OpcodeType::ArithmBitnot, statement_type, 0);
                    }
                    Operator::UnaryDecrement | Operator::UnaryIncrement => {
                        let delta = if *op == Operator::UnaryDecrement { -1 } else { 1 };
                        self.compile_statement(arg, false, false)?;
                        self.add_opcode(OpcodeType::PushConstant, BaseType::IntConst, delta);
                        self.add_opcode_typed(OpcodeType::ArithmAdd, statement_type, 0);
                        self.compile_statement(arg, false, true)?;
                    }
                    other => {
                        return Err(CompileError::backend(
                            format!("Unrecognized unary operator {}", other.characters()),
                            self.line,
                        ));
                    }
                }
            }

            Expr::Binary {
                op,
                left,
                right,
                enforced_function,
            } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to a binary operation",
                        self.line,
                    ));
                }
                if let Some(function) = enforced_function {
                    // Operator backed by a builtin: compiles like a call
                    self.compile_statement(left, false, false)?;
                    self.compile_statement(right, false, false)?;
                    self.add_opcode(
                        OpcodeType::Call,
                        BaseType::Void,
                        function.name_and_signature_hash() as i64,
                    );
                } else {
                    self.compile_binary_operator(*op, left, right, statement_type, consume_result)?;
                }
            }

            Expr::Parenthesis { content, .. } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to an expression in parentheses",
                        self.line,
                    ));
                }
                if !content.is_empty() {
                    let inner = content[0].as_statement().ok_or_else(|| {
                        CompileError::backend("Parenthesis content is not a statement", self.line)
                    })?;
                    if content.len() != 1 {
                        return Err(CompileError::backend(
                            "Too many tokens left inside parenthesis",
                            self.line,
                        ));
                    }
                    self.compile_statement(inner, false, false)?;
                }
            }

            Expr::Constant { value } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to a constant",
                        self.line,
                    ));
                }
                self.add_opcode_typed(OpcodeType::PushConstant, statement_type, *value as i64);
            }

            Expr::Variable { var } => {
                let op = if is_lvalue {
                    OpcodeType::SetVariableValue
                } else {
                    OpcodeType::GetVariableValue
                };
                self.add_opcode_typed(op, statement_type, var.id as i64);
            }

            Expr::FunctionCall {
                function,
                is_base_call,
                arguments,
            } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to a function call",
                        self.line,
                    ));
                }
                let parameter_types = function.parameter_types();
                for (argument, parameter_type) in arguments.iter().zip(parameter_types.iter()) {
                    self.compile_statement(argument, false, false)?;
                    let source = argument.data_type.unwrap_or(DataType::Void);
                    self.add_cast_opcode_if_necessary(source, *parameter_type)?;
                }
                // A non-void base type marks a base call
                let marker = if *is_base_call {
                    BaseType::UInt8
                } else {
                    BaseType::Void
                };
                self.add_opcode(
                    OpcodeType::Call,
                    marker,
                    function.name_and_signature_hash() as i64,
                );
            }

            Expr::MemoryAccess { address } => {
                self.compile_statement(address, false, false)?;
                let op = if is_lvalue {
                    OpcodeType::WriteMemory
                } else {
                    OpcodeType::ReadMemory
                };
                self.add_opcode_typed(op, statement_type, 0);
            }

            Expr::ValueCast { arg } => {
                if is_lvalue {
                    return Err(CompileError::backend(
                        "Cannot assign value to a type cast",
                        self.line,
                    ));
                }
                self.compile_statement(arg, false, false)?;
                let source = arg.data_type.unwrap_or(DataType::Void);
                self.add_cast_opcode_if_necessary(source, statement_type)?;
            }

            Expr::Identifier { .. } | Expr::CommaList { .. } => {
                return Err(CompileError::backend(
                    "Token type should be eliminated by now",
                    self.line,
                ));
            }
        }

        if consume_result && statement_type.class() != TypeClass::Void {
            self.add_opcode_plain(OpcodeType::MoveStack, -1);
        }
        Ok(())
    }

    fn compile_binary_operator(
        &mut self,
        op: Operator,
        left: &Statement,
        right: &Statement,
        statement_type: DataType,
        consume_result: bool,
    ) -> CompileResult<()> {
        use Operator::*;
        match op {
            Assign => {
                self.compile_statement(right, false, false)?;
                let source = right.data_type.unwrap_or(DataType::Void);
                let target = left.data_type.unwrap_or(DataType::Void);
                self.add_cast_opcode_if_necessary(source, target)?;
                self.compile_statement(left, false, true)?;
            }

            AssignPlus => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmAdd)?,
            AssignMinus => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmSub)?,
            AssignMultiply => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmMul)?,
            AssignDivide => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmDiv)?,
            AssignModulo => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmMod)?,
            AssignAnd => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmAnd)?,
            AssignOr => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmOr)?,
            AssignXor => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmXor)?,
            AssignShiftLeft => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmShl)?,
            AssignShiftRight => self.compile_binary_assignment(left, right, statement_type, OpcodeType::ArithmShr)?,

            BinaryPlus => self.compile_binary_operation(op, left, right, OpcodeType::ArithmAdd)?,
            BinaryMinus => self.compile_binary_operation(op, left, right, OpcodeType::ArithmSub)?,
            BinaryMultiply => self.compile_binary_operation(op, left, right, OpcodeType::ArithmMul)?,
            BinaryDivide => self.compile_binary_operation(op, left, right, OpcodeType::ArithmDiv)?,
            BinaryModulo => self.compile_binary_operation(op, left, right, OpcodeType::ArithmMod)?,
            BinaryShiftLeft => self.compile_binary_operation(op, left, right, OpcodeType::ArithmShl)?,
            BinaryShiftRight => self.compile_binary_operation(op, left, right, OpcodeType::ArithmShr)?,
            BinaryAnd => self.compile_binary_operation(op, left, right, OpcodeType::ArithmAnd)?,
            BinaryOr => self.compile_binary_operation(op, left, right, OpcodeType::ArithmOr)?,
            BinaryXor => self.compile_binary_operation(op, left, right, OpcodeType::ArithmXor)?,

            CompareEqual => {
                self.compile_binary_operation(op, left, right, OpcodeType::CompareEq)?;
                if consume_result && self.options.script_feature_level >= 2 {
                    return Err(CompileError::backend(
                        "Result of comparison is not used, this is certainly a mistake in the script",
                        self.line,
                    ));
                }
            }
            CompareNotEqual => self.compile_binary_operation(op, left, right, OpcodeType::CompareNeq)?,
            CompareLess => self.compile_binary_operation(op, left, right, OpcodeType::CompareLt)?,
            CompareLessOrEqual => self.compile_binary_operation(op, left, right, OpcodeType::CompareLe)?,
            CompareGreater => self.compile_binary_operation(op, left, right, OpcodeType::CompareGt)?,
            CompareGreaterOrEqual => self.compile_binary_operation(op, left, right, OpcodeType::CompareGe)?,

            LogicalAnd => {
                // Short circuit: "A && B" behaves as "A ? B : false"
                self.compile_statement(left, false, false)?;
                let if_jump = self.add_opcode_plain(OpcodeType::JumpConditional, 0);
                self.compile_statement(right, false, false)?;
                let else_jump = self.add_opcode_plain(OpcodeType::Jump, 0);
                self.opcodes[if_jump].param = self.opcodes.len() as i64;
                self.add_opcode(OpcodeType::PushConstant, BaseType::IntConst, 0);
                self.opcodes[else_jump].param = self.opcodes.len() as i64;
            }

            LogicalOr => {
                // Short circuit: "A || B" behaves as "A ? true : B"
                self.compile_statement(left, false, false)?;
                let if_jump = self.add_opcode_plain(OpcodeType::JumpConditional, 0);
                self.add_opcode(OpcodeType::PushConstant, BaseType::IntConst, 1);
                let else_jump = self.add_opcode_plain(OpcodeType::Jump, 0);
                self.opcodes[if_jump].param = self.opcodes.len() as i64;
                self.compile_statement(right, false, false)?;
                self.opcodes[else_jump].param = self.opcodes.len() as i64;
            }

            QuestionMark => {
                let colon = match &right.expr {
                    Expr::Binary {
                        op: Operator::Colon,
                        left: first,
                        right: second,
                        ..
                    } => (first, second),
                    _ => {
                        return Err(CompileError::backend(
                            "Expected : after ? operator",
                            self.line,
                        ));
                    }
                };
                self.compile_statement(left, false, false)?;
                let if_jump = self.add_opcode_plain(OpcodeType::JumpConditional, 0);
                self.compile_statement(colon.0, false, false)?;
                let else_jump = self.add_opcode_plain(OpcodeType::Jump, 0);
                self.opcodes[if_jump].param = self.opcodes.len() as i64;
                self.compile_statement(colon.1, false, false)?;
                self.opcodes[else_jump].param = self.opcodes.len() as i64;
            }

            Colon => {
                return Err(CompileError::backend(
                    "Found : without outer ? operator",
                    self.line,
                ));
            }

            other => {
                return Err(CompileError::backend(
                    format!("Unrecognized operator {}", other.characters()),
                    self.line,
                ));
            }
        }
        Ok(())
    }

    /// Compound assignment: read, apply, write back. Memory targets compute
    /// their address only once (it may have side effects).
    fn compile_binary_assignment(
        &mut self,
        left: &Statement,
        right: &Statement,
        statement_type: DataType,
        op: OpcodeType,
    ) -> CompileResult<()> {
        if let Expr::MemoryAccess { address } = &left.expr {
            let element_type = left.data_type.unwrap_or(DataType::Void);
            self.compile_statement(address, false, false)?;
            // Parameter 1: keep the address on the stack for the write below
            self.add_opcode_typed(OpcodeType::ReadMemory, element_type, 1);
            self.compile_statement(right, false, false)?;
            self.add_opcode_typed(op, statement_type, 0);
            // Parameter 1: operands arrive in exchanged order
            self.add_opcode_typed(OpcodeType::WriteMemory, element_type, 1);
        } else {
            self.compile_statement(left, false, false)?;
            self.compile_statement(right, false, false)?;
            self.add_opcode_typed(op, statement_type, 0);
            self.compile_statement(left, false, true)?;
        }
        Ok(())
    }

    fn compile_binary_operation(
        &mut self,
        op: Operator,
        left: &Statement,
        right: &Statement,
        opcode: OpcodeType,
    ) -> CompileResult<()> {
        let commutative = matches!(
            op,
            Operator::BinaryPlus
                | Operator::BinaryMultiply
                | Operator::BinaryAnd
                | Operator::BinaryOr
                | Operator::BinaryXor
                | Operator::CompareEqual
                | Operator::CompareNotEqual
        );

        // Move a constant to the right for better merging later
        let (first, second) =
            if left.is_constant() && !right.is_constant() && commutative {
                (right, left)
            } else {
                (left, right)
            };

        self.compile_statement(first, false, false)?;
        self.compile_statement(second, false, false)?;

        // The left operand's type, not the statement's own; comparisons
        // produce bool but operate at the operand width
        let operand_type = first.data_type.unwrap_or(DataType::Void);
        self.add_opcode_typed(opcode, operand_type, 0);
        Ok(())
    }

    // ========================================================================
    // Opcode optimizer
    // ========================================================================

    fn optimize_opcodes(&mut self) {
        if self.opcodes.is_empty() {
            return;
        }

        // Peephole pairs, repeated until nothing merges
        loop {
            let mut changed = false;
            let mut is_jump_target = vec![false; self.opcodes.len()];
            for opcode in &self.opcodes {
                if matches!(opcode.op, OpcodeType::Jump | OpcodeType::JumpConditional | OpcodeType::JumpSwitch)
                {
                    if let Some(flag) = is_jump_target.get_mut(opcode.param as usize) {
                        *flag = true;
                    }
                }
            }
            for label in &self.labels {
                if let Some(flag) = is_jump_target.get_mut(label.offset as usize) {
                    *flag = true;
                }
            }

            for i in 0..self.opcodes.len().saturating_sub(1) {
                let first = self.opcodes[i];
                let second = self.opcodes[i + 1];
                if first.line != second.line || is_jump_target[i + 1] {
                    continue;
                }

                // A comparison result is already boolean
                let is_comparison = matches!(
                    first.op,
                    OpcodeType::CompareEq
                        | OpcodeType::CompareNeq
                        | OpcodeType::CompareLt
                        | OpcodeType::CompareLe
                        | OpcodeType::CompareGt
                        | OpcodeType::CompareGe
                );
                if is_comparison && second.op == OpcodeType::MakeBool {
                    self.opcodes[i + 1].op = OpcodeType::Nop;
                    changed = true;
                    continue;
                }

                // A constant casts at compile time
                if first.op == OpcodeType::PushConstant && second.op == OpcodeType::CastValue {
                    if let cast @ BaseCastType::Int { .. } =
                        BaseCastType::from_u8(second.param as u8)
                    {
                        self.opcodes[i].param =
                            cast_constant_value(cast, first.param as u64) as i64;
                        self.opcodes[i + 1].op = OpcodeType::Nop;
                        changed = true;
                    }
                }
            }

            self.cleanup_nops();
            if !changed {
                break;
            }
        }

        // Collapse chains of jumps onto their final target
        for i in 0..self.opcodes.len() {
            if !matches!(
                self.opcodes[i].op,
                OpcodeType::Jump | OpcodeType::JumpConditional
            ) {
                continue;
            }
            let mut target = self.opcodes[i].param as usize;
            let mut hops = 0;
            while self.opcodes[target].op == OpcodeType::Jump && hops < self.opcodes.len() {
                target = self.opcodes[target].param as usize;
                hops += 1;
            }
            self.opcodes[i].param = target as i64;
        }

        // Conditional jumps with a compile-time condition
        for i in 0..self.opcodes.len().saturating_sub(1) {
            let first = self.opcodes[i];
            if first.op != OpcodeType::PushConstant {
                continue;
            }
            let second = self.opcodes[i + 1];
            let conditional_position = match second.op {
                OpcodeType::JumpConditional => Some(i + 1),
                OpcodeType::Jump => {
                    let jump_target = second.param as usize;
                    if self.opcodes[jump_target].op == OpcodeType::JumpConditional {
                        Some(jump_target)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(conditional_position) = conditional_position else {
                continue;
            };

            let condition_met = first.param != 0;
            let conditional = self.opcodes[conditional_position];
            let mut jump_target = if condition_met {
                conditional_position + 1
            } else {
                conditional.param as usize
            };
            if self.opcodes[jump_target].op == OpcodeType::Jump {
                jump_target = self.opcodes[jump_target].param as usize;
            }
            self.opcodes[i] = Opcode::new(
                OpcodeType::Jump,
                BaseType::Void,
                jump_target as i64,
                conditional.line,
            );
        }

        // Jumps leading straight to a return
        for i in 0..self.opcodes.len() {
            if self.opcodes[i].op == OpcodeType::Jump {
                let target = self.opcodes[i].param as usize;
                let target_opcode = self.opcodes[target];
                if matches!(
                    target_opcode.op,
                    OpcodeType::Return | OpcodeType::ExternalJump
                ) {
                    self.opcodes[i] = target_opcode;
                }
            }
        }

        // Remove unreachable opcodes, tracing from the entry and all labels;
        // the final return always stays
        {
            let count = self.opcodes.len();
            let mut reachable = vec![false; count];
            reachable[count - 1] = true;
            let mut seeds: Vec<usize> = vec![0];
            seeds.extend(self.labels.iter().map(|l| l.offset as usize));

            while let Some(mut position) = seeds.pop() {
                while position < count && !reachable[position] {
                    reachable[position] = true;
                    match self.opcodes[position].op {
                        OpcodeType::Jump => {
                            position = self.opcodes[position].param as usize;
                        }
                        OpcodeType::JumpConditional | OpcodeType::JumpSwitch => {
                            seeds.push(self.opcodes[position].param as usize);
                            position += 1;
                        }
                        OpcodeType::Return | OpcodeType::ExternalJump => break,
                        _ => position += 1,
                    }
                }
            }

            for (position, opcode) in self.opcodes.iter_mut().enumerate() {
                if !reachable[position] {
                    opcode.op = OpcodeType::Nop;
                }
            }

            // Jumps that only skip NOPs are unnecessary themselves
            for i in 0..self.opcodes.len().saturating_sub(1) {
                if !matches!(
                    self.opcodes[i].op,
                    OpcodeType::Jump | OpcodeType::JumpConditional
                ) {
                    continue;
                }
                let jump_target = self.opcodes[i].param as usize;
                let mut position = i + 1;
                if jump_target < position {
                    continue;
                }
                while position < self.opcodes.len()
                    && self.opcodes[position].op == OpcodeType::Nop
                {
                    position += 1;
                }
                if jump_target <= position {
                    if self.opcodes[i].op == OpcodeType::JumpConditional {
                        // Still need to consume the condition
                        self.opcodes[i].op = OpcodeType::MoveStack;
                        self.opcodes[i].base_type = BaseType::Void;
                        self.opcodes[i].param = -1;
                    } else {
                        self.opcodes[i].op = OpcodeType::Nop;
                    }
                }
            }

            self.cleanup_nops();
        }
    }

    /// Drop all NOPs, remapping jump targets and label offsets.
    fn cleanup_nops(&mut self) {
        let mut index_remap: Vec<usize> = Vec::with_capacity(self.opcodes.len());
        let mut new_size = 0usize;
        for opcode in &self.opcodes {
            index_remap.push(new_size);
            if opcode.op != OpcodeType::Nop {
                new_size += 1;
            }
        }
        if new_size == self.opcodes.len() {
            return;
        }
        let last_opcode = new_size.saturating_sub(1);

        self.opcodes.retain(|opcode| opcode.op != OpcodeType::Nop);

        for opcode in self.opcodes.iter_mut() {
            if matches!(
                opcode.op,
                OpcodeType::Jump | OpcodeType::JumpConditional | OpcodeType::JumpSwitch
            ) {
                let target = opcode.param as usize;
                opcode.param = index_remap
                    .get(target)
                    .copied()
                    .unwrap_or(last_opcode) as i64;
            }
        }
        for label in self.labels.iter_mut() {
            let offset = label.offset as usize;
            label.offset = index_remap.get(offset).copied().unwrap_or(last_opcode) as u32;
        }
    }
}
