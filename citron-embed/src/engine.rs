// citron-embed - Engine implementation
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The `Engine` struct - main entry point for embedding Citron.
//!
//! An engine owns the builtin `core` module, a host module for natives and
//! host-backed variables, the compiled script modules, and the runtime they
//! execute on.
//!
//! # Thread Safety
//!
//! **`Engine` is NOT thread-safe.** It uses `Rc` and `RefCell` internally
//! for performance in single-threaded contexts. Create one engine per
//! thread if you need concurrent execution.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use citron_core::{
    deserialize_module, serialize_module, FunctionHandle, GlobalsLookup, Module, ModuleVariable,
    NativeFlags, Program,
};
use citron_parser::{DataType, FlyweightStr, TypeClass};
use citron_vm::compiler::loader::FileSystem;
use citron_vm::vm::error::RuntimeError;
use citron_vm::vm::{ExecuteResult, MemoryAccessHandler, Runtime, RuntimeDetailHandler};
use citron_vm::{builtins, CompileOptions, Compiler, DiskFileSystem, ErrorMessage};

use crate::convert::IntoNativeFn;

/// Default opcode budget for one host-driven invocation.
const DEFAULT_STEP_LIMIT: usize = 0x0800_0000;

/// When a script function runs relative to the host's frame update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateHook {
    PreFrame,
    PostFrame,
}

/// One frame of the script call stack, as reported to the host.
#[derive(Debug, Clone)]
pub struct CallFrameInfo {
    pub function_name: FlyweightStr,
    pub program_counter: usize,
    /// Nearest label at or before the program counter, if any.
    pub label: Option<FlyweightStr>,
}

/// Error surface of the engine.
#[derive(Debug)]
pub enum EngineError {
    /// Compilation failed; the diagnostics carry file and line attribution.
    Compile(Vec<ErrorMessage>),
    Runtime(RuntimeError),
    FunctionNotFound(String),
    VariableNotFound(String),
    Serialize(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Compile(errors) => {
                writeln!(f, "Compilation failed:")?;
                for error in errors {
                    writeln!(f, "  {}", error)?;
                }
                Ok(())
            }
            EngineError::Runtime(error) => write!(f, "{}", error),
            EngineError::FunctionNotFound(name) => {
                write!(f, "Function not found: {}", name)
            }
            EngineError::VariableNotFound(name) => {
                write!(f, "Global variable not found: {}", name)
            }
            EngineError::Serialize(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RuntimeError> for EngineError {
    fn from(error: RuntimeError) -> Self {
        EngineError::Runtime(error)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The Citron scripting engine.
///
/// # Example
///
/// ```no_run
/// use citron_embed::Engine;
///
/// let mut engine = Engine::new();
/// engine.register_native("host_add", |a: u32, b: u32| a + b);
/// engine.compile_script("scripts/main.lemon").unwrap();
/// let result = engine.call_function("main", &[]).unwrap();
/// println!("main returned {:?}", result);
/// ```
pub struct Engine {
    options: CompileOptions,
    core_module: Rc<Module>,
    /// Open for registration until the first compile freezes it.
    host_module: Option<Module>,
    frozen_host: Option<Rc<Module>>,
    script_module: Option<Rc<Module>>,
    program: Rc<Program>,
    runtime: Runtime,
    update_hooks: Vec<(UpdateHook, FunctionHandle)>,
    script_path: Option<String>,
    step_limit: usize,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    pub fn with_options(options: CompileOptions) -> Self {
        let globals = GlobalsLookup::new();
        let core_module = Rc::new(builtins::create_core_module(&globals));

        let mut host_module = Module::new("host");
        {
            let mut globals = GlobalsLookup::new();
            globals.add_definitions_from_module(&core_module);
            host_module.start_compiling(&globals);
        }

        Engine {
            options,
            core_module,
            host_module: Some(host_module),
            frozen_host: None,
            script_module: None,
            program: Rc::new(Program::new()),
            runtime: Runtime::new(),
            update_hooks: Vec::new(),
            script_path: None,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn set_memory_access_handler(&mut self, handler: Box<dyn MemoryAccessHandler>) {
        self.runtime.set_memory_access_handler(handler);
    }

    pub fn set_runtime_detail_handler(&mut self, handler: Box<dyn RuntimeDetailHandler>) {
        self.runtime.set_runtime_detail_handler(handler);
    }

    /// Opcode budget per host-driven invocation, to bound runaway loops.
    pub fn set_step_limit(&mut self, limit: usize) {
        self.step_limit = limit;
    }

    // ========================================================================
    // Host registration (before compiling)
    // ========================================================================

    fn host_module_mut(&mut self) -> &mut Module {
        self.host_module
            .as_mut()
            .expect("host registration is only possible before compiling")
    }

    /// Register a native Rust function under the given name. The signature
    /// is derived from the closure's argument and return types.
    ///
    /// Must be called before [`Engine::compile_script`].
    pub fn register_native<Args, F>(&mut self, name: &str, function: F)
    where
        F: IntoNativeFn<Args>,
    {
        self.register_native_with_flags(name, function, NativeFlags::default());
    }

    /// Like [`Engine::register_native`], with explicit flags. Functions
    /// marked `compile_time_constant` fold at compile time when all their
    /// arguments are constants.
    pub fn register_native_with_flags<Args, F>(
        &mut self,
        name: &str,
        function: F,
        flags: NativeFlags,
    ) where
        F: IntoNativeFn<Args>,
    {
        let (parameters, return_type) = function.signature();
        let wrapper = function.into_native_fn();
        self.host_module_mut()
            .add_native_function(name, return_type, parameters, flags, wrapper);
    }

    /// Register a method callable as `receiver.name(...)` on values of the
    /// named type; the receiver arrives as the first argument.
    ///
    /// When the context names a registered custom type, the receiver
    /// parameter adopts that type (the closure still sees the raw base
    /// value).
    pub fn register_native_method<Args, F>(&mut self, context: &str, name: &str, function: F)
    where
        F: IntoNativeFn<Args>,
    {
        let (mut parameters, return_type) = function.signature();
        let wrapper = function.into_native_fn();
        let host = self.host_module_mut();
        if let Some(receiver) = parameters.first_mut() {
            if let Some(custom) = host.data_types.iter().find(|t| t.name.as_str() == context) {
                receiver.data_type = custom.data_type();
            }
        }
        host.add_native_method(
            context,
            name,
            return_type,
            parameters,
            NativeFlags::default(),
            wrapper,
        );
    }

    /// Register a variable whose storage lives in the host, shared through
    /// the returned cell.
    pub fn register_external_variable(
        &mut self,
        name: &str,
        data_type: DataType,
    ) -> Rc<Cell<i64>> {
        let cell = Rc::new(Cell::new(0i64));
        let accessor_cell = cell.clone();
        self.host_module_mut().add_external_variable(
            name,
            data_type,
            Box::new(move || accessor_cell.clone()),
        );
        cell
    }

    /// Register a variable backed by host callbacks.
    pub fn register_user_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        getter: impl Fn() -> i64 + 'static,
        setter: impl Fn(i64) + 'static,
    ) {
        self.host_module_mut().add_user_defined_variable(
            name,
            data_type,
            Some(Box::new(getter)),
            Some(Box::new(setter)),
        );
    }

    /// Declare a custom data type backed by an integer base type.
    pub fn register_data_type(&mut self, name: &str, base: citron_parser::BaseType) -> DataType {
        self.host_module_mut().add_data_type(name, base).data_type()
    }

    // ========================================================================
    // Compilation and installation
    // ========================================================================

    fn build_globals(modules: &[Rc<Module>]) -> GlobalsLookup {
        let mut globals = GlobalsLookup::new();
        for module in modules {
            globals.add_definitions_from_module(module);
        }
        globals
    }

    /// First compile freezes the host module; registration is closed from
    /// then on. Safe to call repeatedly.
    fn freeze_host(&mut self) -> Rc<Module> {
        if let Some(host) = self.host_module.take() {
            self.frozen_host = Some(Rc::new(host));
        }
        self.frozen_host
            .clone()
            .expect("host module neither open nor frozen")
    }

    /// Compile the script at `path` (resolving its includes) and install
    /// the result. Reads from disk; see
    /// [`Engine::compile_script_with_file_system`] to inject file access.
    pub fn compile_script(&mut self, path: &str) -> EngineResult<()> {
        self.compile_script_with_file_system(path, &DiskFileSystem)
    }

    pub fn compile_script_with_file_system(
        &mut self,
        path: &str,
        file_system: &dyn FileSystem,
    ) -> EngineResult<()> {
        let mut installed = vec![self.core_module.clone(), self.freeze_host()];

        let mut globals = Self::build_globals(&installed);
        let mut script_module = Module::new("script");
        {
            let mut compiler =
                Compiler::new(&mut script_module, &mut globals, self.options.clone());
            if !compiler.load_script(path, file_system) {
                return Err(EngineError::Compile(compiler.errors().to_vec()));
            }
        }

        let script_module = Rc::new(script_module);
        installed.push(script_module.clone());
        self.script_module = Some(script_module);
        self.script_path = Some(path.to_string());
        self.install(installed);
        Ok(())
    }

    fn install(&mut self, modules: Vec<Rc<Module>>) {
        let mut program = Program::new();
        program.set_optimization_level(self.options.optimization_level);
        for module in modules {
            program.add_module(module);
        }
        self.program = Rc::new(program);
        self.runtime.set_program(self.program.clone());

        // Update hooks are declared through pragmas on script functions
        self.update_hooks.clear();
        for function in self.program.functions() {
            if let FunctionHandle::Script(script) = function {
                for pragma in &script.borrow().pragmas {
                    let trimmed = pragma.trim();
                    if trimmed == "update-hook(pre)" {
                        self.update_hooks
                            .push((UpdateHook::PreFrame, function.clone()));
                    } else if trimmed == "update-hook(post)" {
                        self.update_hooks
                            .push((UpdateHook::PostFrame, function.clone()));
                    }
                }
            }
        }
    }

    /// Recompile the current script and swap it in, preserving the values
    /// of global variables that still exist with the same name and type.
    pub fn reload_scripts(&mut self, file_system: &dyn FileSystem) -> EngineResult<()> {
        let path = self
            .script_path
            .clone()
            .ok_or_else(|| EngineError::Serialize("no script compiled yet".to_string()))?;

        // Capture current global values by name
        let preserved: Vec<(FlyweightStr, DataType, i64)> = self
            .program
            .global_variables()
            .iter()
            .filter(|v| matches!(&***v, ModuleVariable::Global(_)))
            .map(|v| {
                (
                    v.name().clone(),
                    v.data_type(),
                    self.runtime.get_variable_value(v),
                )
            })
            .collect();

        self.compile_script_with_file_system(&path, file_system)?;

        // Re-apply preserved values where name and type still match
        for (name, data_type, value) in preserved {
            if let Some(variable) = self.program.global_variable_by_name(&name) {
                if variable.data_type() == data_type {
                    let variable = variable.clone();
                    self.runtime.set_variable_value(&variable, value);
                }
            }
        }
        Ok(())
    }

    /// Serialize the most recently compiled script module.
    pub fn serialize_script_module(&self) -> EngineResult<Vec<u8>> {
        let module = self
            .script_module
            .as_ref()
            .ok_or_else(|| EngineError::Serialize("no script compiled yet".to_string()))?;
        let mut base = vec![self.core_module.clone()];
        base.extend(self.frozen_host.iter().cloned());
        let globals = Self::build_globals(&base);
        serialize_module(module, globals.build_dependency_hash())
            .map_err(|e| EngineError::Serialize(e.to_string()))
    }

    /// Install a previously serialized script module instead of compiling.
    /// Fails when any referenced external declaration changed since it was
    /// serialized.
    pub fn install_serialized_module(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let mut installed = vec![self.core_module.clone(), self.freeze_host()];

        let globals = Self::build_globals(&installed);
        let module = deserialize_module(bytes, &globals)
            .map_err(|e| EngineError::Serialize(e.to_string()))?;

        let module = Rc::new(module);
        installed.push(module.clone());
        self.script_module = Some(module);
        self.install(installed);
        Ok(())
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    fn run_to_completion(&mut self) -> EngineResult<ExecuteResult> {
        let result = self.runtime.execute_steps(self.step_limit, 0)?;
        Ok(result)
    }

    /// Continue after a yield, from the saved program counter.
    pub fn resume(&mut self) -> EngineResult<ExecuteResult> {
        self.run_to_completion()
    }

    /// Call a function by name with raw argument values; returns the raw
    /// return value for non-void functions.
    ///
    /// Overloads resolve by argument count; the first matching registration
    /// wins.
    pub fn call_function(&mut self, name: &str, arguments: &[u64]) -> EngineResult<Option<u64>> {
        let name_hash = FlyweightStr::new(name).hash();
        let function = self
            .program
            .functions_by_name(name_hash)
            .iter()
            .find(|f| f.parameter_types().len() == arguments.len())
            .cloned()
            .ok_or_else(|| EngineError::FunctionNotFound(name.to_string()))?;

        for argument in arguments {
            self.runtime.push_value(*argument)?;
        }
        let return_type = function.return_type();
        self.runtime.call_function(&function, 0)?;
        let result = self.run_to_completion()?;

        if result.halted && return_type.class() != TypeClass::Void {
            Ok(Some(self.runtime.pop_value()?))
        } else {
            Ok(None)
        }
    }

    /// Call a `void fn()` script function at one of its labels.
    pub fn call_function_at_label(&mut self, name: &str, label: &str) -> EngineResult<bool> {
        let name_hash = FlyweightStr::new(name).hash();
        let function = match self.program.functions_by_name(name_hash).first() {
            Some(function) => function.clone(),
            None => return Ok(false),
        };
        let label = FlyweightStr::new(label);
        if !self.runtime.call_function_at_label(&function, &label)? {
            return Ok(false);
        }
        self.run_to_completion()?;
        Ok(true)
    }

    /// Run all functions registered for the given update hook.
    pub fn call_update_hooks(&mut self, hook: UpdateHook) -> EngineResult<()> {
        let functions: Vec<FunctionHandle> = self
            .update_hooks
            .iter()
            .filter(|(kind, _)| *kind == hook)
            .map(|(_, function)| function.clone())
            .collect();
        for function in functions {
            self.runtime.call_function(&function, 0)?;
            self.run_to_completion()?;
        }
        Ok(())
    }

    /// Dispatch a virtual address to its hooked function and run it.
    /// Unknown addresses are a silent no-op (returns false).
    pub fn call_address_hook(&mut self, address: u32) -> EngineResult<bool> {
        if !self.runtime.call_address_hook(address)? {
            return Ok(false);
        }
        self.run_to_completion()?;
        Ok(true)
    }

    /// Mint a callable address for a named function, usable with
    /// [`Engine::call_address_hook`].
    pub fn make_callable(&mut self, name: &str) -> Option<u32> {
        let name_hash = FlyweightStr::new(name).hash();
        let function = self.program.functions_by_name(name_hash).first()?.clone();
        Some(self.runtime.make_callable(&function))
    }

    /// The current call stack, outermost frame first.
    pub fn walk_call_stack(&self) -> Vec<CallFrameInfo> {
        self.runtime
            .call_stack_locations()
            .into_iter()
            .map(|(function, program_counter, label)| CallFrameInfo {
                function_name: function.name(),
                program_counter,
                label,
            })
            .collect()
    }

    // ========================================================================
    // Global variables
    // ========================================================================

    fn find_global(&self, name: &str) -> EngineResult<Rc<ModuleVariable>> {
        let name = FlyweightStr::new(name);
        self.program
            .global_variable_by_name(&name)
            .cloned()
            .ok_or_else(|| EngineError::VariableNotFound(name.as_str().to_string()))
    }

    pub fn get_global_value(&self, name: &str) -> EngineResult<i64> {
        let variable = self.find_global(name)?;
        Ok(self.runtime.get_variable_value(&variable))
    }

    pub fn set_global_value(&mut self, name: &str, value: i64) -> EngineResult<()> {
        let variable = self.find_global(name)?;
        self.runtime.set_variable_value(&variable, value);
        Ok(())
    }

    /// The stored 64-bit cell viewed as a float.
    pub fn get_global_as_f32(&self, name: &str) -> EngineResult<f32> {
        Ok(self.get_global_value(name)? as f32)
    }

    pub fn get_global_as_f64(&self, name: &str) -> EngineResult<f64> {
        Ok(self.get_global_value(name)? as f64)
    }

    pub fn set_global_from_f64(&mut self, name: &str, value: f64) -> EngineResult<()> {
        self.set_global_value(name, value as i64)
    }

    /// Resolve a string-typed global through the runtime string table.
    pub fn get_global_as_string(&self, name: &str) -> EngineResult<Option<String>> {
        let key = self.get_global_value(name)? as u64;
        Ok(self
            .runtime
            .strings()
            .resolve(key)
            .map(|s| s.as_str().to_string()))
    }

    /// Intern a string and store its key into a global.
    pub fn set_global_from_string(&mut self, name: &str, value: &str) -> EngineResult<()> {
        let key = self.runtime.add_string(value);
        self.set_global_value(name, key as i64)
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn save_state(&self) -> Vec<u8> {
        self.runtime.serialize_state()
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> EngineResult<()> {
        self.runtime.deserialize_state(bytes)?;
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
