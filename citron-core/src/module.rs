// citron-core - Module container
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! A module: one compiled translation unit.
//!
//! Modules own their functions, globals, constants, constant arrays,
//! defines, string literals, custom data types and source-file records.
//! Identifier ranges (function ids, variable ids, ...) are handed out by the
//! globals lookup when compilation starts, so ids stay unique across all
//! modules visible together.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use citron_parser::{fnv1a_64, BaseType, CustomDataType, DataType, FlyweightStr, ParserToken};

use crate::constant::{Constant, ConstantArray, Define};
use crate::function::{
    FunctionHandle, NativeFlags, NativeFn, NativeFunction, ParameterList, ScriptFunction,
};
use crate::globals::GlobalsLookup;
use crate::source::SourceFileInfo;
use crate::variable::{
    make_variable_id, ExternalVariable, GlobalVariable, ModuleVariable, UserDefinedVariable,
    VariableKind,
};

/// A named, hashed, versioned container of compiled definitions.
#[derive(Debug, Default)]
pub struct Module {
    name: String,
    id: u64,

    pub(crate) first_function_id: u32,
    pub(crate) first_variable_id: u32,
    pub(crate) first_constant_array_id: u32,
    pub(crate) first_data_type_id: u16,

    pub functions: Vec<FunctionHandle>,
    pub script_functions: Vec<Rc<RefCell<ScriptFunction>>>,
    pub global_variables: Vec<Rc<ModuleVariable>>,
    pub constants: Vec<Rc<Constant>>,
    pub constant_arrays: Vec<Rc<ConstantArray>>,
    pub defines: Vec<Rc<RefCell<Define>>>,
    pub string_literals: Vec<FlyweightStr>,
    pub data_types: Vec<Rc<CustomDataType>>,
    pub source_files: Vec<Rc<SourceFileInfo>>,

    /// Preprocessor definitions first introduced by this module.
    pub preprocessor_definitions: Vec<(FlyweightStr, i64)>,

    compiled_code_hash: u64,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            id: fnv1a_64(name.as_bytes()),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_id(&self) -> u64 {
        self.id
    }

    pub fn compiled_code_hash(&self) -> u64 {
        self.compiled_code_hash
    }

    pub fn set_compiled_code_hash(&mut self, hash: u64) {
        self.compiled_code_hash = hash;
    }

    /// Begin compiling against the given lookup: adopt its next free id
    /// ranges and drop any content from a previous compile.
    pub fn start_compiling(&mut self, globals: &GlobalsLookup) {
        self.functions.clear();
        self.script_functions.clear();
        self.global_variables.clear();
        self.constants.clear();
        self.constant_arrays.clear();
        self.defines.clear();
        self.string_literals.clear();
        self.data_types.clear();
        self.source_files.clear();
        self.preprocessor_definitions.clear();
        self.first_function_id = globals.next_function_id();
        self.first_variable_id = globals.next_variable_id();
        self.first_constant_array_id = globals.next_constant_array_id();
        self.first_data_type_id = globals.next_data_type_id();
    }

    // ========================================================================
    // Source files
    // ========================================================================

    pub fn add_source_file(&mut self, base_path: &str, filename: &str) -> Rc<SourceFileInfo> {
        let info = Rc::new(SourceFileInfo {
            base_path: base_path.to_string(),
            filename: filename.to_string(),
            index: self.source_files.len(),
        });
        self.source_files.push(info.clone());
        info
    }

    // ========================================================================
    // Functions
    // ========================================================================

    pub fn add_script_function(
        &mut self,
        name: FlyweightStr,
        return_type: DataType,
        parameters: ParameterList,
    ) -> Rc<RefCell<ScriptFunction>> {
        let id = self.first_function_id + self.functions.len() as u32;
        let function = Rc::new(RefCell::new(ScriptFunction::new(
            name,
            id,
            return_type,
            parameters,
        )));
        self.functions.push(FunctionHandle::Script(function.clone()));
        self.script_functions.push(function.clone());
        function
    }

    pub fn add_native_function(
        &mut self,
        name: &str,
        return_type: DataType,
        parameters: ParameterList,
        flags: NativeFlags,
        wrapper: NativeFn,
    ) -> Rc<NativeFunction> {
        self.add_native_internal(FlyweightStr::empty(), name, return_type, parameters, flags, wrapper)
    }

    /// A method-style native, called as `receiver.name(...)`; the context is
    /// the receiver type's name.
    pub fn add_native_method(
        &mut self,
        context: &str,
        name: &str,
        return_type: DataType,
        parameters: ParameterList,
        flags: NativeFlags,
        wrapper: NativeFn,
    ) -> Rc<NativeFunction> {
        self.add_native_internal(
            FlyweightStr::new(context),
            name,
            return_type,
            parameters,
            flags,
            wrapper,
        )
    }

    fn add_native_internal(
        &mut self,
        context: FlyweightStr,
        name: &str,
        return_type: DataType,
        parameters: ParameterList,
        flags: NativeFlags,
        wrapper: NativeFn,
    ) -> Rc<NativeFunction> {
        let id = self.first_function_id + self.functions.len() as u32;
        let function = Rc::new(NativeFunction::new(
            FlyweightStr::new(name),
            context,
            id,
            return_type,
            parameters,
            flags,
            wrapper,
        ));
        self.functions.push(FunctionHandle::Native(function.clone()));
        function
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn next_variable_id_for(&self, kind: VariableKind) -> u32 {
        make_variable_id(
            kind,
            self.first_variable_id + self.global_variables.len() as u32,
        )
    }

    pub fn add_global_variable(
        &mut self,
        name: FlyweightStr,
        data_type: DataType,
    ) -> Rc<ModuleVariable> {
        let variable = Rc::new(ModuleVariable::Global(GlobalVariable {
            name,
            id: self.next_variable_id_for(VariableKind::Global),
            data_type,
            initial_value: 0,
        }));
        self.global_variables.push(variable.clone());
        variable
    }

    pub fn add_global_variable_with_initial(
        &mut self,
        name: FlyweightStr,
        data_type: DataType,
        initial_value: i64,
    ) -> Rc<ModuleVariable> {
        let variable = Rc::new(ModuleVariable::Global(GlobalVariable {
            name,
            id: self.next_variable_id_for(VariableKind::Global),
            data_type,
            initial_value,
        }));
        self.global_variables.push(variable.clone());
        variable
    }

    pub fn add_user_defined_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        getter: Option<Box<dyn Fn() -> i64>>,
        setter: Option<Box<dyn Fn(i64)>>,
    ) -> Rc<ModuleVariable> {
        let variable = Rc::new(ModuleVariable::User(UserDefinedVariable {
            name: FlyweightStr::new(name),
            id: self.next_variable_id_for(VariableKind::User),
            data_type,
            getter,
            setter,
        }));
        self.global_variables.push(variable.clone());
        variable
    }

    pub fn add_external_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        accessor: Box<dyn Fn() -> Rc<Cell<i64>>>,
    ) -> Rc<ModuleVariable> {
        let variable = Rc::new(ModuleVariable::External(ExternalVariable {
            name: FlyweightStr::new(name),
            id: self.next_variable_id_for(VariableKind::External),
            data_type,
            accessor,
        }));
        self.global_variables.push(variable.clone());
        variable
    }

    // ========================================================================
    // Constants, constant arrays, defines
    // ========================================================================

    pub fn add_constant(
        &mut self,
        name: FlyweightStr,
        data_type: DataType,
        value: u64,
    ) -> Rc<Constant> {
        let constant = Rc::new(Constant {
            name,
            data_type,
            value,
        });
        self.constants.push(constant.clone());
        constant
    }

    pub fn add_constant_array(
        &mut self,
        name: FlyweightStr,
        element_type: DataType,
        values: Vec<u64>,
    ) -> Rc<ConstantArray> {
        let id = self.first_constant_array_id + self.constant_arrays.len() as u32;
        let array = Rc::new(ConstantArray {
            name,
            id,
            element_type,
            values,
        });
        self.constant_arrays.push(array.clone());
        array
    }

    pub fn add_define(
        &mut self,
        name: FlyweightStr,
        data_type: DataType,
        content: Vec<ParserToken>,
    ) -> Rc<RefCell<Define>> {
        let define = Rc::new(RefCell::new(Define {
            name,
            data_type,
            content,
        }));
        self.defines.push(define.clone());
        define
    }

    // ========================================================================
    // String literals and data types
    // ========================================================================

    pub fn add_string_literal(&mut self, literal: FlyweightStr) {
        if !self.string_literals.contains(&literal) {
            self.string_literals.push(literal);
        }
    }

    pub fn add_data_type(&mut self, name: &str, base: BaseType) -> Rc<CustomDataType> {
        let id = self.first_data_type_id + self.data_types.len() as u16;
        let data_type = Rc::new(CustomDataType {
            name: FlyweightStr::new(name),
            id,
            base,
        });
        self.data_types.push(data_type.clone());
        data_type
    }

    pub fn add_preprocessor_definition(&mut self, name: FlyweightStr, value: i64) {
        self.preprocessor_definitions.push((name, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ranges() {
        let mut module = Module::new("test");
        let f = module.add_script_function(
            FlyweightStr::new("f"),
            DataType::Void,
            ParameterList::new(),
        );
        let g = module.add_script_function(
            FlyweightStr::new("g"),
            DataType::Void,
            ParameterList::new(),
        );
        assert_eq!(f.borrow().id, 0);
        assert_eq!(g.borrow().id, 1);

        let v = module.add_global_variable(FlyweightStr::new("v"), DataType::U32);
        assert_eq!(v.id(), make_variable_id(VariableKind::Global, 0));
    }

    #[test]
    fn test_string_literal_dedup() {
        let mut module = Module::new("test");
        module.add_string_literal(FlyweightStr::new("hello"));
        module.add_string_literal(FlyweightStr::new("hello"));
        assert_eq!(module.string_literals.len(), 1);
    }
}
