// citron-core - Program aggregation
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! A program: the set of modules installed into a runtime, with flat lookup
//! tables over all their functions, variables and constant arrays.

use std::rc::Rc;

use ahash::AHashMap;

use crate::constant::ConstantArray;
use crate::function::FunctionHandle;
use crate::module::Module;
use crate::variable::{variable_index, ModuleVariable};
use citron_parser::FlyweightStr;

/// The runtime view over a list of modules.
#[derive(Debug, Default)]
pub struct Program {
    modules: Vec<Rc<Module>>,

    functions: Vec<FunctionHandle>,
    functions_by_name: AHashMap<u64, Vec<FunctionHandle>>,
    /// Key: name-and-signature hash. Most recently added module first, so
    /// index 0 is the active override and base calls walk down the list.
    functions_by_signature: AHashMap<u64, Vec<FunctionHandle>>,

    /// All module variables in id order; the index part of a variable id
    /// indexes this list.
    global_variables: Vec<Rc<ModuleVariable>>,

    constant_arrays: Vec<Rc<ConstantArray>>,

    optimization_level: i32,
}

impl Program {
    pub fn new() -> Self {
        Program {
            optimization_level: 3,
            ..Default::default()
        }
    }

    pub fn modules(&self) -> &[Rc<Module>] {
        &self.modules
    }

    pub fn optimization_level(&self) -> i32 {
        self.optimization_level
    }

    pub fn set_optimization_level(&mut self, level: i32) {
        self.optimization_level = level;
    }

    pub fn clear(&mut self) {
        *self = Program {
            optimization_level: self.optimization_level,
            ..Default::default()
        };
    }

    /// Install a module. Modules must be added in id order (the order their
    /// id ranges were handed out in).
    pub fn add_module(&mut self, module: Rc<Module>) {
        for function in &module.functions {
            self.functions.push(function.clone());
            self.functions_by_name
                .entry(function.name().hash())
                .or_default()
                .push(function.clone());
            if let FunctionHandle::Script(script) = function {
                for alias in &script.borrow().alias_names {
                    self.functions_by_name
                        .entry(alias.hash())
                        .or_default()
                        .push(function.clone());
                }
            }
            // Most recent module first: later modules override earlier ones
            self.functions_by_signature
                .entry(function.name_and_signature_hash())
                .or_default()
                .insert(0, function.clone());
        }
        for variable in &module.global_variables {
            debug_assert_eq!(
                variable_index(variable.id()) as usize,
                self.global_variables.len(),
                "modules must be installed in id order"
            );
            self.global_variables.push(variable.clone());
        }
        for array in &module.constant_arrays {
            self.constant_arrays.push(array.clone());
        }
        self.modules.push(module);
    }

    pub fn function_by_id(&self, id: u32) -> Option<&FunctionHandle> {
        self.functions.get(id as usize)
    }

    pub fn functions(&self) -> &[FunctionHandle] {
        &self.functions
    }

    pub fn functions_by_name(&self, name_hash: u64) -> &[FunctionHandle] {
        self.functions_by_name
            .get(&name_hash)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Function by name-and-signature hash. Index 0 is the most recently
    /// installed match; base calls use increasing indices.
    pub fn function_by_signature(
        &self,
        name_and_signature_hash: u64,
        index: usize,
    ) -> Option<&FunctionHandle> {
        self.functions_by_signature
            .get(&name_and_signature_hash)
            .and_then(|v| v.get(index))
    }

    pub fn global_variables(&self) -> &[Rc<ModuleVariable>] {
        &self.global_variables
    }

    pub fn global_variable_by_id(&self, id: u32) -> Option<&Rc<ModuleVariable>> {
        self.global_variables.get(variable_index(id) as usize)
    }

    pub fn global_variable_by_name(&self, name: &FlyweightStr) -> Option<&Rc<ModuleVariable>> {
        self.global_variables
            .iter()
            .find(|v| v.name() == name)
    }

    pub fn constant_array_by_id(&self, id: u32) -> Option<&Rc<ConstantArray>> {
        self.constant_arrays.get(id as usize)
    }

    /// Every string literal of every module, for seeding the runtime string
    /// table.
    pub fn collect_string_literals(&self) -> Vec<FlyweightStr> {
        let mut literals = Vec::new();
        for module in &self.modules {
            literals.extend(module.string_literals.iter().cloned());
        }
        literals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ParameterList;
    use crate::globals::GlobalsLookup;
    use citron_parser::DataType;

    #[test]
    fn test_override_ordering() {
        let globals = GlobalsLookup::new();
        let mut base = Module::new("base");
        base.start_compiling(&globals);
        let f1 = base.add_script_function(
            FlyweightStr::new("f"),
            DataType::Void,
            ParameterList::new(),
        );

        let mut program = Program::new();
        program.add_module(Rc::new(base));

        let mut globals2 = GlobalsLookup::new();
        for module in program.modules() {
            globals2.add_definitions_from_module(module);
        }
        let mut patch = Module::new("patch");
        patch.start_compiling(&globals2);
        let f2 = patch.add_script_function(
            FlyweightStr::new("f"),
            DataType::Void,
            ParameterList::new(),
        );
        program.add_module(Rc::new(patch));

        let hash = f1.borrow().name_and_signature_hash();
        assert_eq!(hash, f2.borrow().name_and_signature_hash());

        // The patch module's function is the active override
        let active = program.function_by_signature(hash, 0).unwrap();
        assert_eq!(active.id(), f2.borrow().id);
        let base_call = program.function_by_signature(hash, 1).unwrap();
        assert_eq!(base_call.id(), f1.borrow().id);
        assert!(program.function_by_signature(hash, 2).is_none());
    }
}
