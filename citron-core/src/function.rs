// citron-core - Function definitions
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Script and native functions.
//!
//! Functions are identified by a 64-bit name hash plus a 32-bit signature
//! hash; overloads share the name hash. The combined name-and-signature hash
//! (their sum) is the value stored in `Call` opcodes and in the program's
//! signature table.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use citron_parser::{fnv1a_64, DataType, FlyweightStr};
use smallvec::SmallVec;

use crate::opcode::Opcode;
use crate::variable::{make_variable_id, LocalVariable, VariableKind};

/// A declared function parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: FlyweightStr,
    pub data_type: DataType,
}

pub type ParameterList = SmallVec<[Parameter; 4]>;

/// Hash of a function signature: return type plus parameter types.
pub fn signature_hash(return_type: DataType, parameter_types: &[DataType]) -> u32 {
    let mut bytes: SmallVec<[u8; 32]> = SmallVec::new();
    bytes.extend_from_slice(&return_type.type_hash().to_le_bytes());
    for data_type in parameter_types {
        bytes.extend_from_slice(&data_type.type_hash().to_le_bytes());
    }
    fnv1a_64(&bytes) as u32
}

/// Signature hash of a `void fn()`, the signature used when the host calls a
/// function by plain name.
pub fn void_signature_hash() -> u32 {
    signature_hash(DataType::Void, &[])
}

/// Flags on native functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeFlags {
    /// Function can run inside the opcode loop without affecting control flow.
    pub allow_inline_execution: bool,
    /// Deterministic and side-effect free; the frontend may evaluate calls
    /// with constant arguments at compile time.
    pub compile_time_constant: bool,
}

/// Execution context handed to native-function wrappers.
///
/// Implemented by the runtime's control flow, and by the frontend's scratch
/// stack for compile-time evaluation of constant natives.
pub trait NativeCallContext {
    /// Pop a raw 64-bit value from the value stack.
    fn pop(&mut self) -> u64;

    /// Push a raw 64-bit value onto the value stack.
    fn push(&mut self, value: u64);

    /// Resolve an interned-string key from the runtime string table.
    fn resolve_string(&self, key: u64) -> Option<FlyweightStr>;

    /// Intern a string into the runtime string table, returning its key.
    fn intern_string(&mut self, text: &str) -> u64;

    /// Constant-array lookup, for the builtin access function.
    fn constant_array_value(&self, array_id: u32, index: u64) -> Option<u64>;

    /// Request a cooperative yield: the opcode loop returns to the host
    /// without unwinding. No-op outside a running control flow.
    fn signal_stop(&mut self);
}

/// The callable body of a native function.
pub type NativeFn = Rc<dyn Fn(&mut dyn NativeCallContext) -> Result<(), String>>;

/// A host-registered native function with a typed wrapper.
pub struct NativeFunction {
    pub name: FlyweightStr,
    /// Type name for method-style registration (empty for free functions).
    pub context: FlyweightStr,
    pub id: u32,
    pub return_type: DataType,
    pub parameters: ParameterList,
    pub flags: NativeFlags,
    pub wrapper: NativeFn,
    signature_hash: u32,
}

impl NativeFunction {
    pub fn new(
        name: FlyweightStr,
        context: FlyweightStr,
        id: u32,
        return_type: DataType,
        parameters: ParameterList,
        flags: NativeFlags,
        wrapper: NativeFn,
    ) -> Self {
        let parameter_types: SmallVec<[DataType; 4]> =
            parameters.iter().map(|p| p.data_type).collect();
        let signature_hash = signature_hash(return_type, &parameter_types);
        NativeFunction {
            name,
            context,
            id,
            return_type,
            parameters,
            flags,
            wrapper,
            signature_hash,
        }
    }

    pub fn signature_hash(&self) -> u32 {
        self.signature_hash
    }

    pub fn name_and_signature_hash(&self) -> u64 {
        self.name
            .hash()
            .wrapping_add(self.signature_hash as u64)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NativeFunction({}, {} params -> {})",
            self.name,
            self.parameters.len(),
            self.return_type
        )
    }
}

/// A label inside a script function.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: FlyweightStr,
    pub offset: u32,
}

/// A compiled script function: signature, local-variable slots, opcodes,
/// labels and address hooks.
#[derive(Debug)]
pub struct ScriptFunction {
    pub name: FlyweightStr,
    pub id: u32,
    pub alias_names: Vec<FlyweightStr>,
    pub return_type: DataType,
    pub parameters: ParameterList,
    signature_hash: u32,

    pub local_variables: Vec<LocalVariable>,
    pub opcodes: Vec<Opcode>,
    pub labels: Vec<Label>,
    pub address_hooks: Vec<u32>,
    pub pragmas: Vec<String>,

    /// Index of the declaring file in the module's source-file list.
    pub source_file: usize,
    pub start_line_number: u32,
    /// Subtract from flattened line numbers to get local lines.
    pub source_base_line_offset: u32,
}

impl ScriptFunction {
    pub fn new(
        name: FlyweightStr,
        id: u32,
        return_type: DataType,
        parameters: ParameterList,
    ) -> Self {
        let parameter_types: SmallVec<[DataType; 4]> =
            parameters.iter().map(|p| p.data_type).collect();
        let signature_hash = signature_hash(return_type, &parameter_types);
        ScriptFunction {
            name,
            id,
            alias_names: Vec::new(),
            return_type,
            parameters,
            signature_hash,
            local_variables: Vec::new(),
            opcodes: Vec::new(),
            labels: Vec::new(),
            address_hooks: Vec::new(),
            pragmas: Vec::new(),
            source_file: 0,
            start_line_number: 0,
            source_base_line_offset: 0,
        }
    }

    pub fn signature_hash(&self) -> u32 {
        self.signature_hash
    }

    pub fn name_and_signature_hash(&self) -> u64 {
        self.name
            .hash()
            .wrapping_add(self.signature_hash as u64)
    }

    pub fn local_variable_by_name(&self, name_hash: u64) -> Option<&LocalVariable> {
        self.local_variables
            .iter()
            .find(|v| v.name.hash() == name_hash)
    }

    /// Declare a new local variable and return its reference.
    pub fn add_local_variable(
        &mut self,
        name: FlyweightStr,
        data_type: DataType,
        line: u32,
    ) -> LocalVariable {
        let id = make_variable_id(VariableKind::Local, self.local_variables.len() as u32);
        let variable = LocalVariable {
            name,
            id,
            data_type,
            declared_line: line,
        };
        self.local_variables.push(variable.clone());
        variable
    }

    /// Attach a pragma. Pragmas the compiler understands (`address-hook`,
    /// `alias`) are applied immediately; with `consume_if_processed` they are
    /// then dropped instead of kept for the host.
    pub fn add_or_process_pragma(&mut self, pragma: &str, consume_if_processed: bool) {
        let trimmed = pragma.trim();
        let mut processed = false;

        if let Some(argument) = parse_pragma_call(trimmed, "address-hook") {
            if let Some(address) = parse_pragma_integer(argument) {
                self.address_hooks.push(address);
                processed = true;
            }
        } else if let Some(argument) = parse_pragma_call(trimmed, "alias") {
            self.alias_names.push(FlyweightStr::new(argument.trim()));
            processed = true;
        }

        if !(processed && consume_if_processed) {
            self.pragmas.push(trimmed.to_string());
        }
    }

    pub fn label_offset(&self, name_hash: u64) -> Option<usize> {
        self.labels
            .iter()
            .find(|l| l.name.hash() == name_hash)
            .map(|l| l.offset as usize)
    }

    pub fn add_label(&mut self, name: FlyweightStr, offset: usize) {
        self.labels.push(Label {
            name,
            offset: offset as u32,
        });
    }

    /// The label at or closest before the given opcode offset.
    pub fn find_label_by_offset(&self, offset: usize) -> Option<&Label> {
        self.labels
            .iter()
            .filter(|l| (l.offset as usize) <= offset)
            .max_by_key(|l| l.offset)
    }
}

/// `name(argument)` form used by the pragmas the compiler understands.
fn parse_pragma_call<'a>(pragma: &'a str, name: &str) -> Option<&'a str> {
    pragma
        .strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_pragma_integer(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// A shared handle to a function of either kind.
#[derive(Clone)]
pub enum FunctionHandle {
    Script(Rc<RefCell<ScriptFunction>>),
    Native(Rc<NativeFunction>),
}

impl FunctionHandle {
    pub fn is_script(&self) -> bool {
        matches!(self, FunctionHandle::Script(_))
    }

    pub fn name(&self) -> FlyweightStr {
        match self {
            FunctionHandle::Script(f) => f.borrow().name.clone(),
            FunctionHandle::Native(f) => f.name.clone(),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            FunctionHandle::Script(f) => f.borrow().id,
            FunctionHandle::Native(f) => f.id,
        }
    }

    pub fn return_type(&self) -> DataType {
        match self {
            FunctionHandle::Script(f) => f.borrow().return_type,
            FunctionHandle::Native(f) => f.return_type,
        }
    }

    pub fn parameter_types(&self) -> SmallVec<[DataType; 4]> {
        match self {
            FunctionHandle::Script(f) => f.borrow().parameters.iter().map(|p| p.data_type).collect(),
            FunctionHandle::Native(f) => f.parameters.iter().map(|p| p.data_type).collect(),
        }
    }

    pub fn signature_hash(&self) -> u32 {
        match self {
            FunctionHandle::Script(f) => f.borrow().signature_hash(),
            FunctionHandle::Native(f) => f.signature_hash(),
        }
    }

    pub fn name_and_signature_hash(&self) -> u64 {
        match self {
            FunctionHandle::Script(f) => f.borrow().name_and_signature_hash(),
            FunctionHandle::Native(f) => f.name_and_signature_hash(),
        }
    }

    /// Identity comparison: same underlying function object.
    pub fn same_as(&self, other: &FunctionHandle) -> bool {
        match (self, other) {
            (FunctionHandle::Script(a), FunctionHandle::Script(b)) => Rc::ptr_eq(a, b),
            (FunctionHandle::Native(a), FunctionHandle::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionHandle::Script(func) => write!(f, "Script({})", func.borrow().name),
            FunctionHandle::Native(func) => write!(f, "Native({})", func.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_hash_differs_by_types() {
        let a = signature_hash(DataType::U8, &[DataType::U8, DataType::U8]);
        let b = signature_hash(DataType::U8, &[DataType::U8, DataType::U16]);
        let c = signature_hash(DataType::U16, &[DataType::U8, DataType::U8]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_string_and_u64_share_signature() {
        // Required for feature-level-1 overload compatibility
        let a = signature_hash(DataType::Void, &[DataType::Str]);
        let b = signature_hash(DataType::Void, &[DataType::U64]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_variable_ids() {
        let mut func = ScriptFunction::new(
            FlyweightStr::new("f"),
            0,
            DataType::Void,
            ParameterList::new(),
        );
        let a = func.add_local_variable(FlyweightStr::new("a"), DataType::U8, 1);
        let b = func.add_local_variable(FlyweightStr::new("b"), DataType::U16, 2);
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert!(func.local_variable_by_name(FlyweightStr::new("b").hash()).is_some());
        assert!(func.local_variable_by_name(FlyweightStr::new("c").hash()).is_none());
    }

    #[test]
    fn test_find_label_by_offset() {
        let mut func = ScriptFunction::new(
            FlyweightStr::new("f"),
            0,
            DataType::Void,
            ParameterList::new(),
        );
        func.add_label(FlyweightStr::new("@start"), 0);
        func.add_label(FlyweightStr::new("@mid"), 5);
        assert_eq!(
            func.find_label_by_offset(7).unwrap().name.as_str(),
            "@mid"
        );
        assert_eq!(
            func.find_label_by_offset(4).unwrap().name.as_str(),
            "@start"
        );
    }
}
