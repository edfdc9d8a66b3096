// citron-vm - Runtime
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The runtime: executes compiled opcodes on cooperative control flows.
//!
//! Execution is single-threaded. The opcode loop runs until the call stack
//! empties, a step limit is reached, or a native function requests a yield;
//! a yield leaves all state in place so the next call continues from the
//! same program counter.

pub mod control_flow;
pub mod error;
pub mod exec;
pub mod snapshot;

use std::cell::Cell;
use std::rc::Rc;

use ahash::AHashMap;
use citron_core::{
    void_signature_hash, FunctionHandle, ModuleVariable, NativeCallContext, NativeFunction,
    OpcodeType, Program, ScriptFunction, VariableKind,
};
use citron_parser::{BaseCastType, BaseType, FlyweightStr};

use crate::compiler::type_casting::cast_constant_value;

pub use control_flow::{ControlFlow, State, VALUE_STACK_LAST_INDEX, VAR_STACK_LIMIT};
pub use error::{RuntimeError, RuntimeResult};
pub use exec::{FlatMemory, MemoryAccessHandler, MemoryFault};

/// Optional host taps around native-function execution.
pub trait RuntimeDetailHandler {
    fn pre_execute_native(&mut self, _function: &FlyweightStr) {}
    fn post_execute_native(&mut self, _function: &FlyweightStr) {}
}

/// Outcome of an `execute_steps` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub steps_executed: usize,
    /// The call stack emptied; execution is complete.
    pub halted: bool,
    /// A native requested a yield; state is kept for resumption.
    pub yielded: bool,
}

/// Runtime string table: all module string literals plus strings created at
/// runtime, keyed by their 64-bit hash.
#[derive(Debug, Default)]
pub struct StringTable {
    entries: AHashMap<u64, FlyweightStr>,
}

impl StringTable {
    pub fn resolve(&self, key: u64) -> Option<&FlyweightStr> {
        self.entries.get(&key)
    }

    pub fn add(&mut self, value: FlyweightStr) -> u64 {
        let key = value.hash();
        self.entries.entry(key).or_insert(value);
        key
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlyweightStr> {
        self.entries.values()
    }
}

/// Exit reasons of the inner opcode loop.
enum InnerExit {
    StackEnd,
    StepLimit,
    NativeCall(Rc<NativeFunction>),
    AddressHook(u32),
}

/// The Citron runtime.
pub struct Runtime {
    program: Rc<Program>,
    memory: Box<dyn MemoryAccessHandler>,
    detail_handler: Option<Box<dyn RuntimeDetailHandler>>,

    control_flows: Vec<ControlFlow>,
    selected_control_flow: usize,

    /// Storage cells of all module-owned global variables, indexed by the
    /// index part of their variable ids.
    global_values: Vec<i64>,
    strings: StringTable,

    /// Registered hook address → function id.
    address_hooks: AHashMap<u32, u32>,
    /// Callable addresses minted by `make_callable`; index → function id.
    callable_addresses: Vec<u32>,

    stop_signal: bool,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            program: Rc::new(Program::new()),
            memory: Box::new(FlatMemory::new(0x1_0000)),
            detail_handler: None,
            control_flows: vec![ControlFlow::new()],
            selected_control_flow: 0,
            global_values: Vec::new(),
            strings: StringTable::default(),
            address_hooks: AHashMap::new(),
            callable_addresses: Vec::new(),
            stop_signal: false,
        }
    }

    /// Install a program: resets all control flows, creates the global
    /// storage cells and seeds the string table and address-hook registry.
    pub fn set_program(&mut self, program: Rc<Program>) {
        self.program = program;
        self.reset();

        self.global_values = self
            .program
            .global_variables()
            .iter()
            .map(|variable| match &**variable {
                ModuleVariable::Global(global) => global.initial_value,
                _ => 0,
            })
            .collect();

        self.strings = StringTable::default();
        for literal in self.program.collect_string_literals() {
            self.strings.add(literal);
        }

        self.address_hooks.clear();
        self.callable_addresses.clear();
        for function in self.program.functions() {
            if let FunctionHandle::Script(script) = function {
                let script = script.borrow();
                for hook in &script.address_hooks {
                    self.address_hooks.insert(*hook, script.id);
                }
            }
        }
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    pub fn reset(&mut self) {
        for flow in self.control_flows.iter_mut() {
            flow.reset();
        }
        self.stop_signal = false;
    }

    pub fn set_memory_access_handler(&mut self, handler: Box<dyn MemoryAccessHandler>) {
        self.memory = handler;
    }

    pub fn set_runtime_detail_handler(&mut self, handler: Box<dyn RuntimeDetailHandler>) {
        self.detail_handler = Some(handler);
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn add_string(&mut self, text: &str) -> u64 {
        self.strings.add(FlyweightStr::new(text))
    }

    pub fn selected_control_flow(&self) -> &ControlFlow {
        &self.control_flows[self.selected_control_flow]
    }

    fn flow(&mut self) -> &mut ControlFlow {
        &mut self.control_flows[self.selected_control_flow]
    }

    /// Ask the opcode loop to return to the host at the next opportunity.
    pub fn trigger_stop_signal(&mut self) {
        self.stop_signal = true;
    }

    // ========================================================================
    // Value stack access for the host
    // ========================================================================

    pub fn push_value(&mut self, value: u64) -> RuntimeResult<()> {
        self.flow().push_value(value)
    }

    pub fn pop_value(&mut self) -> RuntimeResult<u64> {
        self.flow().pop_value()
    }

    // ========================================================================
    // Function invocation
    // ========================================================================

    /// Begin executing a function: push a frame for script functions, run
    /// native functions immediately.
    pub fn call_function(
        &mut self,
        function: &FunctionHandle,
        base_call_index: usize,
    ) -> RuntimeResult<()> {
        match function {
            FunctionHandle::Script(script) => {
                let function_id = script.borrow().id;
                let flow = self.flow();
                let state = State {
                    function_id,
                    base_call_index,
                    program_counter: 0,
                    locals_start: flow.locals_size,
                    value_stack_base: flow.value_stack_size(),
                };
                flow.push_frame(state)
            }
            FunctionHandle::Native(native) => self.execute_native(&native.clone()),
        }
    }

    /// Resolve a `void fn()` function by name (or alias) and set it up.
    pub fn call_function_by_name(&mut self, name: &FlyweightStr) -> RuntimeResult<bool> {
        let hash = name
            .hash()
            .wrapping_add(void_signature_hash() as u64);
        let function = match self.program.function_by_signature(hash, 0) {
            Some(function) => function.clone(),
            None => return Ok(false),
        };
        self.call_function(&function, 0)?;
        Ok(true)
    }

    /// Set up a script function starting at one of its labels. All locals
    /// are zero-filled since the prologue is skipped.
    pub fn call_function_at_label(
        &mut self,
        function: &FunctionHandle,
        label: &FlyweightStr,
    ) -> RuntimeResult<bool> {
        let script = match function {
            FunctionHandle::Script(script) => script,
            FunctionHandle::Native(_) => return Ok(false),
        };
        let (function_id, local_count, offset) = {
            let f = script.borrow();
            match f.label_offset(label.hash()) {
                Some(offset) => (f.id, f.local_variables.len(), offset),
                None => return Ok(false),
            }
        };
        let flow = self.flow();
        let state = State {
            function_id,
            base_call_index: 0,
            program_counter: offset,
            locals_start: flow.locals_size,
            value_stack_base: flow.value_stack_size(),
        };
        flow.push_frame(state)?;
        flow.zero_fill_locals(local_count)?;
        Ok(true)
    }

    /// Mint a callable address for a function; `call_address_hook` on the
    /// returned address invokes it.
    pub fn make_callable(&mut self, function: &FunctionHandle) -> u32 {
        let index = self.callable_addresses.len() as u32;
        self.callable_addresses.push(function.id());
        0x1000_0000 | index
    }

    /// Dispatch an address to its hooked function: high nibble 0 looks up
    /// registered address hooks, high nibble 1 callable addresses. Unknown
    /// addresses are a silent no-op; returns whether anything was set up.
    pub fn call_address_hook(&mut self, address: u32) -> RuntimeResult<bool> {
        let function_id = match address >> 28 {
            0x0 => self.address_hooks.get(&address).copied(),
            0x1 => self
                .callable_addresses
                .get((address & 0x0fff_ffff) as usize)
                .copied(),
            _ => None,
        };
        let Some(function_id) = function_id else {
            return Ok(false);
        };
        let function = match self.program.function_by_id(function_id) {
            Some(function) => function.clone(),
            None => return Ok(false),
        };
        self.call_function(&function, 0)?;
        Ok(true)
    }

    /// Pop all frames of the current control flow's topmost function.
    pub fn return_from_function(&mut self) -> bool {
        let flow = self.flow();
        match flow.call_stack.pop() {
            Some(state) => {
                flow.locals_size = state.locals_start;
                true
            }
            None => false,
        }
    }

    /// Locations of all active frames, innermost last: function handle,
    /// program counter, and the nearest preceding label if any.
    pub fn call_stack_locations(&self) -> Vec<(FunctionHandle, usize, Option<FlyweightStr>)> {
        let flow = &self.control_flows[self.selected_control_flow];
        flow.call_stack
            .iter()
            .filter_map(|state| {
                let function = self.program.function_by_id(state.function_id)?.clone();
                let label = match &function {
                    FunctionHandle::Script(script) => script
                        .borrow()
                        .find_label_by_offset(state.program_counter)
                        .map(|l| l.name.clone()),
                    FunctionHandle::Native(_) => None,
                };
                Some((function, state.program_counter, label))
            })
            .collect()
    }

    // ========================================================================
    // Global variables
    // ========================================================================

    pub fn get_variable_value(&self, variable: &ModuleVariable) -> i64 {
        match variable {
            ModuleVariable::Global(global) => {
                let index = citron_core::variable_index(global.id) as usize;
                self.global_values.get(index).copied().unwrap_or(0)
            }
            ModuleVariable::User(user) => user.getter.as_ref().map(|g| g()).unwrap_or(0),
            ModuleVariable::External(external) => (external.accessor)().get(),
        }
    }

    pub fn set_variable_value(&mut self, variable: &ModuleVariable, value: i64) {
        match variable {
            ModuleVariable::Global(global) => {
                let index = citron_core::variable_index(global.id) as usize;
                if let Some(cell) = self.global_values.get_mut(index) {
                    *cell = value;
                }
            }
            ModuleVariable::User(user) => {
                if let Some(setter) = user.setter.as_ref() {
                    setter(value);
                }
            }
            ModuleVariable::External(external) => (external.accessor)().set(value),
        }
    }

    // ========================================================================
    // The opcode loop
    // ========================================================================

    /// Run opcodes until the call stack drops to `minimum_call_stack_size`,
    /// the step limit is reached, or a yield is requested.
    ///
    /// On a runtime error all frames of the current control flow unwind and
    /// the error surfaces to the host.
    pub fn execute_steps(
        &mut self,
        steps_limit: usize,
        minimum_call_stack_size: usize,
    ) -> RuntimeResult<ExecuteResult> {
        self.stop_signal = false;
        let mut steps = 0usize;

        let result = self.execute_steps_inner(steps_limit, minimum_call_stack_size, &mut steps);
        match result {
            Ok(result) => Ok(result),
            Err(error) => {
                // Unwind the whole control flow; other flows are unaffected
                self.flow().reset();
                Err(error)
            }
        }
    }

    fn execute_steps_inner(
        &mut self,
        steps_limit: usize,
        minimum_call_stack_size: usize,
        steps: &mut usize,
    ) -> RuntimeResult<ExecuteResult> {
        loop {
            if self.stop_signal {
                return Ok(ExecuteResult {
                    steps_executed: *steps,
                    halted: false,
                    yielded: true,
                });
            }
            if self.flow().call_stack.len() <= minimum_call_stack_size {
                return Ok(ExecuteResult {
                    steps_executed: *steps,
                    halted: true,
                    yielded: false,
                });
            }
            if *steps >= steps_limit {
                return Ok(ExecuteResult {
                    steps_executed: *steps,
                    halted: false,
                    yielded: false,
                });
            }

            match self.run_inner(steps, steps_limit, minimum_call_stack_size)? {
                InnerExit::StackEnd => {
                    return Ok(ExecuteResult {
                        steps_executed: *steps,
                        halted: true,
                        yielded: false,
                    });
                }
                InnerExit::StepLimit => {
                    return Ok(ExecuteResult {
                        steps_executed: *steps,
                        halted: false,
                        yielded: false,
                    });
                }
                InnerExit::NativeCall(native) => {
                    self.execute_native(&native)?;
                }
                InnerExit::AddressHook(address) => {
                    // Unknown addresses are a deliberate no-op
                    self.call_address_hook(address)?;
                }
            }
        }
    }

    /// The inner loop: executes opcodes of script functions, switching
    /// frames on call/return, and exits for anything that needs the full
    /// runtime (native calls, address hooks).
    fn run_inner(
        &mut self,
        steps: &mut usize,
        steps_limit: usize,
        minimum_call_stack_size: usize,
    ) -> RuntimeResult<InnerExit> {
        let program = self.program.clone();
        let Runtime {
            control_flows,
            selected_control_flow,
            global_values,
            memory,
            ..
        } = self;
        let flow = &mut control_flows[*selected_control_flow];

        'frames: loop {
            if flow.call_stack.len() <= minimum_call_stack_size {
                return Ok(InnerExit::StackEnd);
            }
            let frame = *flow.call_stack.last().unwrap();
            let function = program
                .function_by_id(frame.function_id)
                .ok_or(RuntimeError::NoProgram)?;
            let script: Rc<std::cell::RefCell<ScriptFunction>> = match function {
                FunctionHandle::Script(script) => script.clone(),
                FunctionHandle::Native(_) => {
                    return Err(RuntimeError::Internal(
                        "native function on the call stack".to_string(),
                    ));
                }
            };
            let script = script.borrow();
            let locals_start = frame.locals_start;
            let mut pc = frame.program_counter;

            macro_rules! save_pc {
                ($value:expr) => {
                    flow.call_stack.last_mut().unwrap().program_counter = $value
                };
            }

            loop {
                if *steps >= steps_limit {
                    save_pc!(pc);
                    return Ok(InnerExit::StepLimit);
                }
                let opcode = *script.opcodes.get(pc).ok_or_else(|| {
                    RuntimeError::Internal("program counter exceeded the end of function".into())
                })?;
                *steps += 1;

                match opcode.op {
                    OpcodeType::Nop => pc += 1,

                    OpcodeType::MoveStack => {
                        flow.move_value_stack(opcode.param)?;
                        pc += 1;
                    }

                    OpcodeType::MoveVarStack => {
                        flow.move_var_stack(opcode.param)?;
                        pc += 1;
                    }

                    OpcodeType::PushConstant => {
                        flow.push_value(opcode.param as u64)?;
                        pc += 1;
                    }

                    OpcodeType::GetVariableValue => {
                        let id = opcode.param as u32;
                        let raw = match VariableKind::from_id(id) {
                            Some(VariableKind::Local) => flow
                                .local(locals_start + citron_core::variable_index(id) as usize)?
                                as u64,
                            Some(VariableKind::Global) => {
                                let index = citron_core::variable_index(id) as usize;
                                *global_values.get(index).ok_or_else(|| {
                                    RuntimeError::Internal("global variable index out of range".into())
                                })? as u64
                            }
                            Some(VariableKind::User) | Some(VariableKind::External) => {
                                match program.global_variable_by_id(id) {
                                    Some(variable) => match &**variable {
                                        ModuleVariable::User(user) => {
                                            user.getter.as_ref().map(|g| g()).unwrap_or(0) as u64
                                        }
                                        ModuleVariable::External(external) => {
                                            (external.accessor)().get() as u64
                                        }
                                        _ => 0,
                                    },
                                    None => 0,
                                }
                            }
                            None => {
                                return Err(RuntimeError::Internal(
                                    "variable id with invalid kind".into(),
                                ));
                            }
                        };
                        flow.push_value(exec::truncate_value(opcode.base_type, raw))?;
                        pc += 1;
                    }

                    OpcodeType::SetVariableValue => {
                        // Writes the stack top without consuming it
                        let raw = flow.peek_value()?;
                        let value = exec::truncate_value(opcode.base_type, raw) as i64;
                        let id = opcode.param as u32;
                        match VariableKind::from_id(id) {
                            Some(VariableKind::Local) => {
                                flow.set_local(
                                    locals_start + citron_core::variable_index(id) as usize,
                                    value,
                                )?;
                            }
                            Some(VariableKind::Global) => {
                                let index = citron_core::variable_index(id) as usize;
                                let cell = global_values.get_mut(index).ok_or_else(|| {
                                    RuntimeError::Internal("global variable index out of range".into())
                                })?;
                                *cell = value;
                            }
                            Some(VariableKind::User) | Some(VariableKind::External) => {
                                if let Some(variable) = program.global_variable_by_id(id) {
                                    match &**variable {
                                        ModuleVariable::User(user) => {
                                            if let Some(setter) = user.setter.as_ref() {
                                                setter(value);
                                            }
                                        }
                                        ModuleVariable::External(external) => {
                                            (external.accessor)().set(value);
                                        }
                                        _ => {}
                                    }
                                }
                            }
                            None => {
                                return Err(RuntimeError::Internal(
                                    "variable id with invalid kind".into(),
                                ));
                            }
                        }
                        pc += 1;
                    }

                    OpcodeType::ReadMemory => {
                        let keep_address = opcode.param != 0;
                        let address = if keep_address {
                            flow.peek_value()?
                        } else {
                            flow.pop_value()?
                        };
                        let value = exec::read_memory(&mut **memory, opcode.base_type, address)?;
                        flow.push_value(value)?;
                        pc += 1;
                    }

                    OpcodeType::WriteMemory => {
                        let exchanged = opcode.param != 0;
                        let (address, value) = if exchanged {
                            let value = flow.pop_value()?;
                            let address = flow.pop_value()?;
                            (address, value)
                        } else {
                            let address = flow.pop_value()?;
                            let value = flow.pop_value()?;
                            (address, value)
                        };
                        exec::write_memory(&mut **memory, opcode.base_type, address, value)?;
                        // The written value stays as the expression result
                        flow.push_value(value)?;
                        pc += 1;
                    }

                    OpcodeType::CastValue => {
                        let cast = BaseCastType::from_u8(opcode.param as u8);
                        let value = flow.peek_value()?;
                        flow.replace_top(cast_constant_value(cast, value))?;
                        pc += 1;
                    }

                    OpcodeType::MakeBool => {
                        let value = flow.peek_value()?;
                        flow.replace_top(exec::unary_operation(
                            OpcodeType::MakeBool,
                            opcode.base_type,
                            value,
                        ))?;
                        pc += 1;
                    }

                    OpcodeType::ArithmAdd
                    | OpcodeType::ArithmSub
                    | OpcodeType::ArithmMul
                    | OpcodeType::ArithmDiv
                    | OpcodeType::ArithmMod
                    | OpcodeType::ArithmAnd
                    | OpcodeType::ArithmOr
                    | OpcodeType::ArithmXor
                    | OpcodeType::ArithmShl
                    | OpcodeType::ArithmShr
                    | OpcodeType::CompareEq
                    | OpcodeType::CompareNeq
                    | OpcodeType::CompareLt
                    | OpcodeType::CompareLe
                    | OpcodeType::CompareGt
                    | OpcodeType::CompareGe => {
                        let b = flow.pop_value()?;
                        let a = flow.pop_value()?;
                        flow.push_value(exec::binary_operation(opcode.op, opcode.base_type, a, b))?;
                        pc += 1;
                    }

                    OpcodeType::ArithmNeg | OpcodeType::ArithmNot | OpcodeType::ArithmBitnot => {
                        let value = flow.peek_value()?;
                        flow.replace_top(exec::unary_operation(
                            opcode.op,
                            opcode.base_type,
                            value,
                        ))?;
                        pc += 1;
                    }

                    OpcodeType::Jump => {
                        pc = opcode.param as usize;
                        if *steps >= steps_limit {
                            save_pc!(pc);
                            return Ok(InnerExit::StepLimit);
                        }
                    }

                    OpcodeType::JumpConditional => {
                        let condition = flow.pop_value()?;
                        if condition != 0 {
                            pc += 1;
                        } else {
                            pc = opcode.param as usize;
                            if *steps >= steps_limit {
                                save_pc!(pc);
                                return Ok(InnerExit::StepLimit);
                            }
                        }
                    }

                    OpcodeType::JumpSwitch => {
                        let top = flow.peek_value()?;
                        if top == 0 {
                            flow.pop_value()?;
                            pc = opcode.param as usize;
                        } else {
                            flow.replace_top(top - 1)?;
                            pc += 1;
                        }
                    }

                    OpcodeType::Call => {
                        let is_base_call = opcode.base_type != BaseType::Void;
                        let index = if is_base_call {
                            frame.base_call_index + 1
                        } else {
                            0
                        };
                        let hash = opcode.param as u64;
                        let target = program
                            .function_by_signature(hash, index)
                            .cloned()
                            .ok_or(RuntimeError::UnknownFunction {
                                name_and_signature_hash: hash,
                            })?;
                        save_pc!(pc + 1);

                        match target {
                            FunctionHandle::Script(callee) => {
                                let function_id = callee.borrow().id;
                                let state = State {
                                    function_id,
                                    base_call_index: index,
                                    program_counter: 0,
                                    locals_start: flow.locals_size,
                                    value_stack_base: flow.value_stack_size(),
                                };
                                flow.push_frame(state)?;
                                continue 'frames;
                            }
                            FunctionHandle::Native(native) => {
                                return Ok(InnerExit::NativeCall(native));
                            }
                        }
                    }

                    OpcodeType::Return => {
                        flow.locals_size = frame.locals_start;
                        flow.call_stack.pop();
                        continue 'frames;
                    }

                    OpcodeType::ExternalCall => {
                        let address = flow.pop_value()?;
                        save_pc!(pc + 1);
                        return Ok(InnerExit::AddressHook(address as u32));
                    }

                    OpcodeType::ExternalJump => {
                        let address = flow.pop_value()?;
                        flow.locals_size = frame.locals_start;
                        flow.call_stack.pop();
                        return Ok(InnerExit::AddressHook(address as u32));
                    }
                }
            }
        }
    }

    /// Run a native function against the current control flow, with the
    /// detail-handler taps around it.
    fn execute_native(&mut self, native: &Rc<NativeFunction>) -> RuntimeResult<()> {
        if let Some(handler) = self.detail_handler.as_mut() {
            handler.pre_execute_native(&native.name);
        }

        let result = {
            let program = self.program.clone();
            let Runtime {
                control_flows,
                selected_control_flow,
                strings,
                stop_signal,
                ..
            } = self;
            let mut context = RuntimeNativeContext {
                flow: &mut control_flows[*selected_control_flow],
                strings,
                program: &program,
                stop_signal,
            };
            (native.wrapper)(&mut context)
        };

        if let Some(handler) = self.detail_handler.as_mut() {
            handler.post_execute_native(&native.name);
        }

        result.map_err(|message| RuntimeError::NativeError {
            function: native.name.as_str().to_string(),
            message,
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// The native-call context over a live control flow.
struct RuntimeNativeContext<'a> {
    flow: &'a mut ControlFlow,
    strings: &'a mut StringTable,
    program: &'a Program,
    stop_signal: &'a mut bool,
}

impl NativeCallContext for RuntimeNativeContext<'_> {
    fn pop(&mut self) -> u64 {
        self.flow.pop_value().unwrap_or(0)
    }

    fn push(&mut self, value: u64) {
        let _ = self.flow.push_value(value);
    }

    fn resolve_string(&self, key: u64) -> Option<FlyweightStr> {
        self.strings.resolve(key).cloned()
    }

    fn intern_string(&mut self, text: &str) -> u64 {
        self.strings.add(FlyweightStr::new(text))
    }

    fn constant_array_value(&self, array_id: u32, index: u64) -> Option<u64> {
        self.program
            .constant_array_by_id(array_id)
            .and_then(|array| array.value(index as usize))
    }

    fn signal_stop(&mut self) {
        *self.stop_signal = true;
    }
}

// Shared cell for external variables; re-exported so hosts registering them
// do not need an extra import.
pub type ExternalCell = Rc<Cell<i64>>;
