// citron-core - Program model for the Citron scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The program model of the Citron scripting toolchain: opcodes, variables,
//! constants, functions, modules, the globals lookup, program aggregation
//! and binary serialization.

pub mod bytes;
pub mod constant;
pub mod function;
pub mod globals;
pub mod module;
pub mod opcode;
pub mod program;
pub mod serializer;
pub mod source;
pub mod token;
pub mod variable;

pub use bytes::{ByteReader, ByteWriter, ReadError, ReadResult};
pub use constant::{Constant, ConstantArray, Define};
pub use function::{
    signature_hash, void_signature_hash, FunctionHandle, Label, NativeCallContext, NativeFlags,
    NativeFn, NativeFunction, Parameter, ParameterList, ScriptFunction,
};
pub use globals::{GlobalsLookup, Identifier, PreprocessorDefinitionMap};
pub use module::Module;
pub use opcode::{Opcode, OpcodeType};
pub use program::Program;
pub use serializer::{deserialize_module, serialize_module, SerializeError};
pub use source::{LineNumberTranslation, SourceFileInfo, TranslatedLine};
pub use token::{Expr, ParenKind, Statement, Token, TokenList};
pub use variable::{
    make_variable_id, variable_index, ExternalVariable, GlobalVariable, LocalVariable,
    ModuleVariable, UserDefinedVariable, VariableKind, VarRef,
};
