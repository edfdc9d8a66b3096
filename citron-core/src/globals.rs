// citron-core - Globals lookup
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The globals lookup: the name-hash → entity map the compiler resolves
//! identifiers against.
//!
//! One lookup aggregates everything visible during a compile: the modules
//! already installed plus the definitions of the module currently being
//! compiled, registered incrementally as they appear.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use citron_parser::{fnv1a_64, DataType, FlyweightStr};

use crate::constant::{Constant, ConstantArray, Define};
use crate::function::FunctionHandle;
use crate::module::Module;
use crate::variable::ModuleVariable;

/// Map of preprocessor definitions (`#define` names to values).
#[derive(Debug, Default, Clone)]
pub struct PreprocessorDefinitionMap {
    entries: AHashMap<u64, (FlyweightStr, i64)>,
}

impl PreprocessorDefinitionMap {
    /// Value of a definition; unknown names read as 0.
    pub fn value(&self, name_hash: u64) -> i64 {
        self.entries.get(&name_hash).map(|(_, v)| *v).unwrap_or(0)
    }

    pub fn contains(&self, name_hash: u64) -> bool {
        self.entries.contains_key(&name_hash)
    }

    /// Set a definition; returns true if the name was new.
    pub fn set(&mut self, name: FlyweightStr, value: i64) -> bool {
        self.entries.insert(name.hash(), (name, value)).is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlyweightStr, i64)> {
        self.entries.values().map(|(name, value)| (name, *value))
    }
}

/// What an identifier resolves to.
#[derive(Debug, Clone)]
pub enum Identifier {
    Variable(Rc<ModuleVariable>),
    Constant(Rc<Constant>),
    ConstantArray(Rc<ConstantArray>),
    Define(Rc<RefCell<Define>>),
    DataType(DataType),
}

/// Aggregated view of all definitions visible to the compiler and runtime.
#[derive(Debug, Default)]
pub struct GlobalsLookup {
    /// Preprocessor definitions, shared between loader and preprocessor.
    pub preprocessor_definitions: PreprocessorDefinitionMap,

    identifiers: AHashMap<u64, Identifier>,
    functions_by_name: AHashMap<u64, Vec<FunctionHandle>>,
    /// Key: receiver-type-name hash + method-name hash.
    methods_by_name: AHashMap<u64, Vec<FunctionHandle>>,
    string_literals: AHashMap<u64, FlyweightStr>,
    custom_type_names: AHashMap<u16, FlyweightStr>,

    next_function_id: u32,
    next_variable_id: u32,
    next_constant_array_id: u32,
    next_data_type_id: u16,
}

impl GlobalsLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_function_id(&self) -> u32 {
        self.next_function_id
    }

    pub fn next_variable_id(&self) -> u32 {
        self.next_variable_id
    }

    pub fn next_constant_array_id(&self) -> u32 {
        self.next_constant_array_id
    }

    pub fn next_data_type_id(&self) -> u16 {
        self.next_data_type_id
    }

    /// Resolve an identifier by its name hash.
    pub fn resolve(&self, name_hash: u64) -> Option<&Identifier> {
        self.identifiers.get(&name_hash)
    }

    pub fn functions_by_name(&self, name_hash: u64) -> &[FunctionHandle] {
        self.functions_by_name
            .get(&name_hash)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Methods are keyed by receiver-type-name hash + method-name hash.
    pub fn methods_by_name(&self, combined_hash: u64) -> &[FunctionHandle] {
        self.methods_by_name
            .get(&combined_hash)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn string_literal_by_hash(&self, hash: u64) -> Option<&FlyweightStr> {
        self.string_literals.get(&hash)
    }

    /// Name hash of a data type, for method lookup keys.
    pub fn type_name_hash(&self, data_type: DataType) -> u64 {
        match data_type {
            DataType::Custom { id, .. } => self
                .custom_type_names
                .get(&id)
                .map(|name| name.hash())
                .unwrap_or(0),
            other => fnv1a_64(other.name().as_bytes()),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_function(&mut self, function: FunctionHandle) {
        let context_hash = match &function {
            FunctionHandle::Native(native) if !native.context.is_empty() => {
                Some(native.context.hash())
            }
            _ => None,
        };
        let name_hash = function.name().hash();
        match context_hash {
            Some(context) => {
                self.methods_by_name
                    .entry(context.wrapping_add(name_hash))
                    .or_default()
                    .push(function);
            }
            None => {
                let aliases: Vec<u64> = match &function {
                    FunctionHandle::Script(script) => script
                        .borrow()
                        .alias_names
                        .iter()
                        .map(|a| a.hash())
                        .collect(),
                    FunctionHandle::Native(_) => Vec::new(),
                };
                self.functions_by_name
                    .entry(name_hash)
                    .or_default()
                    .push(function.clone());
                for alias in aliases {
                    self.functions_by_name
                        .entry(alias)
                        .or_default()
                        .push(function.clone());
                }
            }
        }
    }

    pub fn register_variable(&mut self, variable: Rc<ModuleVariable>) {
        self.identifiers
            .insert(variable.name().hash(), Identifier::Variable(variable));
    }

    pub fn register_constant(&mut self, constant: Rc<Constant>) {
        self.identifiers
            .insert(constant.name.hash(), Identifier::Constant(constant));
    }

    pub fn register_constant_array(&mut self, array: Rc<ConstantArray>) {
        self.identifiers
            .insert(array.name.hash(), Identifier::ConstantArray(array));
    }

    pub fn register_define(&mut self, define: Rc<RefCell<Define>>) {
        let hash = define.borrow().name.hash();
        self.identifiers.insert(hash, Identifier::Define(define));
    }

    pub fn register_string_literal(&mut self, literal: FlyweightStr) {
        self.string_literals.insert(literal.hash(), literal);
    }

    pub fn register_data_type(&mut self, data_type: &citron_parser::CustomDataType) {
        self.custom_type_names
            .insert(data_type.id, data_type.name.clone());
        self.identifiers.insert(
            data_type.name.hash(),
            Identifier::DataType(data_type.data_type()),
        );
    }

    /// Register everything an already-compiled module defines, and advance
    /// the free id ranges past it.
    pub fn add_definitions_from_module(&mut self, module: &Module) {
        for function in &module.functions {
            self.register_function(function.clone());
        }
        for variable in &module.global_variables {
            self.register_variable(variable.clone());
        }
        for constant in &module.constants {
            self.register_constant(constant.clone());
        }
        for array in &module.constant_arrays {
            self.register_constant_array(array.clone());
        }
        for define in &module.defines {
            self.register_define(define.clone());
        }
        for literal in &module.string_literals {
            self.register_string_literal(literal.clone());
        }
        for data_type in &module.data_types {
            self.register_data_type(data_type);
        }
        for (name, value) in &module.preprocessor_definitions {
            self.preprocessor_definitions.set(name.clone(), *value);
        }

        self.next_function_id = self
            .next_function_id
            .max(module.first_function_id + module.functions.len() as u32);
        self.next_variable_id = self
            .next_variable_id
            .max(module.first_variable_id + module.global_variables.len() as u32);
        self.next_constant_array_id = self
            .next_constant_array_id
            .max(module.first_constant_array_id + module.constant_arrays.len() as u32);
        self.next_data_type_id = self
            .next_data_type_id
            .max(module.first_data_type_id + module.data_types.len() as u16);
    }

    /// Hash over every visible external declaration. Serialized modules
    /// store it; a mismatch at load time forces recompilation.
    pub fn build_dependency_hash(&self) -> u32 {
        let mut items: Vec<u64> = Vec::new();
        for functions in self.functions_by_name.values() {
            for function in functions {
                items.push(function.name_and_signature_hash());
            }
        }
        for (hash, identifier) in &self.identifiers {
            let tag = match identifier {
                Identifier::Variable(v) => 1u64.wrapping_add(v.id() as u64) << 32,
                Identifier::Constant(c) => 2u64 << 32 | (c.value & 0xffff_ffff),
                Identifier::ConstantArray(a) => 3u64 << 32 | a.id as u64,
                Identifier::Define(_) => 4u64 << 32,
                Identifier::DataType(dt) => 5u64 << 32 | dt.type_hash() as u64,
            };
            items.push(hash.wrapping_add(tag));
        }
        items.sort_unstable();
        let mut bytes = Vec::with_capacity(items.len() * 8);
        for item in items {
            bytes.extend_from_slice(&item.to_le_bytes());
        }
        fnv1a_64(&bytes) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ParameterList;

    #[test]
    fn test_incremental_registration_and_resolution() {
        let mut module = Module::new("m");
        let mut globals = GlobalsLookup::new();
        module.start_compiling(&globals);

        let variable = module.add_global_variable(FlyweightStr::new("score"), DataType::U32);
        globals.register_variable(variable);

        match globals.resolve(FlyweightStr::new("score").hash()) {
            Some(Identifier::Variable(v)) => assert_eq!(v.data_type(), DataType::U32),
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert!(globals.resolve(FlyweightStr::new("missing").hash()).is_none());
    }

    #[test]
    fn test_id_ranges_advance() {
        let mut globals = GlobalsLookup::new();
        let mut module = Module::new("first");
        module.start_compiling(&globals);
        module.add_script_function(
            FlyweightStr::new("f"),
            DataType::Void,
            ParameterList::new(),
        );
        globals.add_definitions_from_module(&module);
        assert_eq!(globals.next_function_id(), 1);

        let mut second = Module::new("second");
        second.start_compiling(&globals);
        let g = second.add_script_function(
            FlyweightStr::new("g"),
            DataType::Void,
            ParameterList::new(),
        );
        assert_eq!(g.borrow().id, 1);
    }

    #[test]
    fn test_dependency_hash_changes_with_content() {
        let mut globals = GlobalsLookup::new();
        let empty_hash = globals.build_dependency_hash();

        let mut module = Module::new("m");
        module.start_compiling(&globals);
        module.add_script_function(
            FlyweightStr::new("f"),
            DataType::Void,
            ParameterList::new(),
        );
        globals.add_definitions_from_module(&module);
        assert_ne!(globals.build_dependency_hash(), empty_hash);
    }

    #[test]
    fn test_preprocessor_definitions_default_to_zero() {
        let map = PreprocessorDefinitionMap::default();
        assert_eq!(map.value(12345), 0);
    }
}
