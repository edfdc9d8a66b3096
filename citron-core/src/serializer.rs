// citron-core - Module binary serialization
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Serialization of compiled modules.
//!
//! The binary format starts with a magic word, a format version and a
//! dependency hash. The dependency hash is computed over every external
//! declaration visible when the module was compiled; loading against a
//! lookup with a different hash fails, which forces recompilation whenever
//! any referenced declaration changed.
//!
//! Only script modules serialize. Modules carrying native functions or
//! host-backed variables are rebuilt by the host at startup and never hit
//! disk.

use citron_parser::{
    BaseType, DataType, FlyweightStr, Keyword, Operator, ParserToken,
};

use crate::bytes::{ByteReader, ByteWriter, ReadError, ReadResult};
use crate::function::{FunctionHandle, Parameter, ParameterList};
use crate::globals::GlobalsLookup;
use crate::module::Module;
use crate::opcode::{Opcode, OpcodeType};
use crate::variable::{LocalVariable, ModuleVariable};

const MAGIC: u32 = 0x4354_524e; // "CTRN"
const FORMAT_VERSION: u16 = 1;

/// Error when a module cannot be serialized.
#[derive(Debug, Clone)]
pub struct SerializeError {
    pub message: String,
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Serialize error: {}", self.message)
    }
}

impl std::error::Error for SerializeError {}

fn write_data_type(writer: &mut ByteWriter, data_type: DataType) {
    match data_type {
        DataType::Str => writer.write_u8(0x40),
        DataType::Any => writer.write_u8(0x41),
        DataType::Custom { id, base } => {
            writer.write_u8(0x80);
            writer.write_u16(id);
            writer.write_u8(base as u8);
        }
        other => writer.write_u8(other.base_type() as u8),
    }
}

fn read_data_type(reader: &mut ByteReader) -> ReadResult<DataType> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        0x40 => DataType::Str,
        0x41 => DataType::Any,
        0x80 => {
            let id = reader.read_u16()?;
            let base = BaseType::from_u8(reader.read_u8()?);
            DataType::Custom { id, base }
        }
        other => DataType::from_base_type(BaseType::from_u8(other)),
    })
}

fn write_flyweight(writer: &mut ByteWriter, value: &FlyweightStr) {
    writer.write_str(value.as_str());
}

fn read_flyweight(reader: &mut ByteReader) -> ReadResult<FlyweightStr> {
    Ok(FlyweightStr::new(&reader.read_str()?))
}

fn write_parser_token(writer: &mut ByteWriter, token: &ParserToken) -> Result<(), SerializeError> {
    match token {
        ParserToken::Keyword(kw) => {
            writer.write_u8(0);
            writer.write_u8(*kw as u8);
        }
        ParserToken::VarType(dt) => {
            writer.write_u8(1);
            write_data_type(writer, *dt);
        }
        ParserToken::Operator(op) => {
            writer.write_u8(2);
            writer.write_u8(*op as u8);
        }
        ParserToken::Label(name) => {
            writer.write_u8(3);
            write_flyweight(writer, name);
        }
        ParserToken::IntLiteral(value) => {
            writer.write_u8(4);
            writer.write_u64(*value);
        }
        ParserToken::StringLiteral(s) => {
            writer.write_u8(5);
            write_flyweight(writer, s);
        }
        ParserToken::Identifier(name) => {
            writer.write_u8(6);
            write_flyweight(writer, name);
        }
        ParserToken::Pragma(_) => {
            return Err(SerializeError {
                message: "pragma token inside define content".to_string(),
            });
        }
    }
    Ok(())
}

fn read_parser_token(reader: &mut ByteReader) -> ReadResult<ParserToken> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        0 => ParserToken::Keyword(
            Keyword::from_u8(reader.read_u8()?)
                .ok_or_else(|| ReadError::new("invalid keyword byte"))?,
        ),
        1 => ParserToken::VarType(read_data_type(reader)?),
        2 => ParserToken::Operator(
            Operator::from_u8(reader.read_u8()?)
                .ok_or_else(|| ReadError::new("invalid operator byte"))?,
        ),
        3 => ParserToken::Label(read_flyweight(reader)?),
        4 => ParserToken::IntLiteral(reader.read_u64()?),
        5 => ParserToken::StringLiteral(read_flyweight(reader)?),
        6 => ParserToken::Identifier(read_flyweight(reader)?),
        _ => return Err(ReadError::new("invalid parser token tag")),
    })
}

/// Serialize a compiled script module.
pub fn serialize_module(
    module: &Module,
    dependency_hash: u32,
) -> Result<Vec<u8>, SerializeError> {
    let mut writer = ByteWriter::new();
    writer.write_u32(MAGIC);
    writer.write_u16(FORMAT_VERSION);
    writer.write_u32(dependency_hash);
    writer.write_str(module.name());
    writer.write_u32(module.first_function_id);
    writer.write_u32(module.first_variable_id);
    writer.write_u32(module.first_constant_array_id);
    writer.write_u16(module.first_data_type_id);

    // Source files
    writer.write_u32(module.source_files.len() as u32);
    for file in &module.source_files {
        writer.write_str(&file.base_path);
        writer.write_str(&file.filename);
    }

    // Custom data types
    writer.write_u16(module.data_types.len() as u16);
    for data_type in &module.data_types {
        write_flyweight(&mut writer, &data_type.name);
        writer.write_u8(data_type.base as u8);
    }

    // Global variables
    writer.write_u32(module.global_variables.len() as u32);
    for variable in &module.global_variables {
        match &**variable {
            ModuleVariable::Global(global) => {
                write_flyweight(&mut writer, &global.name);
                write_data_type(&mut writer, global.data_type);
                writer.write_i64(global.initial_value);
            }
            other => {
                return Err(SerializeError {
                    message: format!(
                        "module with host-backed variable '{}' is not serializable",
                        other.name()
                    ),
                });
            }
        }
    }

    // Constants
    writer.write_u32(module.constants.len() as u32);
    for constant in &module.constants {
        write_flyweight(&mut writer, &constant.name);
        write_data_type(&mut writer, constant.data_type);
        writer.write_u64(constant.value);
    }

    // Constant arrays
    writer.write_u32(module.constant_arrays.len() as u32);
    for array in &module.constant_arrays {
        write_flyweight(&mut writer, &array.name);
        write_data_type(&mut writer, array.element_type);
        writer.write_u32(array.values.len() as u32);
        for value in &array.values {
            writer.write_u64(*value);
        }
    }

    // Defines
    writer.write_u32(module.defines.len() as u32);
    for define in &module.defines {
        let define = define.borrow();
        write_flyweight(&mut writer, &define.name);
        write_data_type(&mut writer, define.data_type);
        writer.write_u32(define.content.len() as u32);
        for token in &define.content {
            write_parser_token(&mut writer, token)?;
        }
    }

    // String literals
    writer.write_u32(module.string_literals.len() as u32);
    for literal in &module.string_literals {
        write_flyweight(&mut writer, literal);
    }

    // Functions
    writer.write_u32(module.functions.len() as u32);
    for function in &module.functions {
        let script = match function {
            FunctionHandle::Script(script) => script.borrow(),
            FunctionHandle::Native(native) => {
                return Err(SerializeError {
                    message: format!(
                        "module with native function '{}' is not serializable",
                        native.name
                    ),
                });
            }
        };
        write_flyweight(&mut writer, &script.name);
        writer.write_u32(script.alias_names.len() as u32);
        for alias in &script.alias_names {
            write_flyweight(&mut writer, alias);
        }
        write_data_type(&mut writer, script.return_type);
        writer.write_u32(script.parameters.len() as u32);
        for parameter in &script.parameters {
            write_flyweight(&mut writer, &parameter.name);
            write_data_type(&mut writer, parameter.data_type);
        }
        writer.write_u32(script.local_variables.len() as u32);
        for local in &script.local_variables {
            write_flyweight(&mut writer, &local.name);
            write_data_type(&mut writer, local.data_type);
            writer.write_u32(local.declared_line);
        }
        writer.write_u32(script.opcodes.len() as u32);
        for opcode in &script.opcodes {
            writer.write_u8(opcode.op as u8);
            writer.write_u8(opcode.base_type as u8);
            writer.write_i64(opcode.param);
            writer.write_u32(opcode.line);
        }
        writer.write_u32(script.labels.len() as u32);
        for label in &script.labels {
            write_flyweight(&mut writer, &label.name);
            writer.write_u32(label.offset);
        }
        writer.write_u32(script.address_hooks.len() as u32);
        for hook in &script.address_hooks {
            writer.write_u32(*hook);
        }
        writer.write_u32(script.pragmas.len() as u32);
        for pragma in &script.pragmas {
            writer.write_str(pragma);
        }
        writer.write_u32(script.source_file as u32);
        writer.write_u32(script.start_line_number);
        writer.write_u32(script.source_base_line_offset);
    }

    writer.write_u64(module.compiled_code_hash());
    Ok(writer.into_bytes())
}

/// Deserialize a module, verifying magic, version and dependency hash.
pub fn deserialize_module(bytes: &[u8], globals: &GlobalsLookup) -> ReadResult<Module> {
    let mut reader = ByteReader::new(bytes);
    if reader.read_u32()? != MAGIC {
        return Err(ReadError::new("not a compiled module (bad magic)"));
    }
    if reader.read_u16()? != FORMAT_VERSION {
        return Err(ReadError::new("unsupported module format version"));
    }
    let dependency_hash = reader.read_u32()?;
    if dependency_hash != globals.build_dependency_hash() {
        return Err(ReadError::new(
            "dependency hash mismatch, module must be recompiled",
        ));
    }

    let name = reader.read_str()?;
    let mut module = Module::new(&name);
    module.first_function_id = reader.read_u32()?;
    module.first_variable_id = reader.read_u32()?;
    module.first_constant_array_id = reader.read_u32()?;
    module.first_data_type_id = reader.read_u16()?;

    let source_file_count = reader.read_u32()?;
    for _ in 0..source_file_count {
        let base_path = reader.read_str()?;
        let filename = reader.read_str()?;
        module.add_source_file(&base_path, &filename);
    }

    let data_type_count = reader.read_u16()?;
    for _ in 0..data_type_count {
        let name = read_flyweight(&mut reader)?;
        let base = BaseType::from_u8(reader.read_u8()?);
        module.add_data_type(name.as_str(), base);
    }

    let variable_count = reader.read_u32()?;
    for _ in 0..variable_count {
        let name = read_flyweight(&mut reader)?;
        let data_type = read_data_type(&mut reader)?;
        let initial_value = reader.read_i64()?;
        module.add_global_variable_with_initial(name, data_type, initial_value);
    }

    let constant_count = reader.read_u32()?;
    for _ in 0..constant_count {
        let name = read_flyweight(&mut reader)?;
        let data_type = read_data_type(&mut reader)?;
        let value = reader.read_u64()?;
        module.add_constant(name, data_type, value);
    }

    let array_count = reader.read_u32()?;
    for _ in 0..array_count {
        let name = read_flyweight(&mut reader)?;
        let element_type = read_data_type(&mut reader)?;
        let value_count = reader.read_u32()?;
        let mut values = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            values.push(reader.read_u64()?);
        }
        module.add_constant_array(name, element_type, values);
    }

    let define_count = reader.read_u32()?;
    for _ in 0..define_count {
        let name = read_flyweight(&mut reader)?;
        let data_type = read_data_type(&mut reader)?;
        let token_count = reader.read_u32()?;
        let mut content = Vec::with_capacity(token_count as usize);
        for _ in 0..token_count {
            content.push(read_parser_token(&mut reader)?);
        }
        module.add_define(name, data_type, content);
    }

    let literal_count = reader.read_u32()?;
    for _ in 0..literal_count {
        let literal = read_flyweight(&mut reader)?;
        module.add_string_literal(literal);
    }

    let function_count = reader.read_u32()?;
    for _ in 0..function_count {
        let name = read_flyweight(&mut reader)?;
        let alias_count = reader.read_u32()?;
        let mut aliases = Vec::with_capacity(alias_count as usize);
        for _ in 0..alias_count {
            aliases.push(read_flyweight(&mut reader)?);
        }
        let return_type = read_data_type(&mut reader)?;
        let parameter_count = reader.read_u32()?;
        let mut parameters = ParameterList::new();
        for _ in 0..parameter_count {
            let name = read_flyweight(&mut reader)?;
            let data_type = read_data_type(&mut reader)?;
            parameters.push(Parameter { name, data_type });
        }

        let function = module.add_script_function(name, return_type, parameters);
        {
            let mut script = function.borrow_mut();
            script.alias_names = aliases;

            let local_count = reader.read_u32()?;
            for index in 0..local_count {
                let name = read_flyweight(&mut reader)?;
                let data_type = read_data_type(&mut reader)?;
                let declared_line = reader.read_u32()?;
                script.local_variables.push(LocalVariable {
                    name,
                    id: index,
                    data_type,
                    declared_line,
                });
            }

            let opcode_count = reader.read_u32()?;
            script.opcodes.reserve(opcode_count as usize);
            for _ in 0..opcode_count {
                let op = OpcodeType::from_u8(reader.read_u8()?)
                    .ok_or_else(|| ReadError::new("invalid opcode byte"))?;
                let base_type = BaseType::from_u8(reader.read_u8()?);
                let param = reader.read_i64()?;
                let line = reader.read_u32()?;
                script.opcodes.push(Opcode::new(op, base_type, param, line));
            }

            let label_count = reader.read_u32()?;
            for _ in 0..label_count {
                let name = read_flyweight(&mut reader)?;
                let offset = reader.read_u32()?;
                script.add_label(name, offset as usize);
            }

            let hook_count = reader.read_u32()?;
            for _ in 0..hook_count {
                script.address_hooks.push(reader.read_u32()?);
            }

            let pragma_count = reader.read_u32()?;
            for _ in 0..pragma_count {
                script.pragmas.push(reader.read_str()?);
            }

            script.source_file = reader.read_u32()? as usize;
            script.start_line_number = reader.read_u32()?;
            script.source_base_line_offset = reader.read_u32()?;
        }
    }

    let compiled_code_hash = reader.read_u64()?;
    module.set_compiled_code_hash(compiled_code_hash);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ParameterList;

    #[test]
    fn test_roundtrip_preserves_opcodes() {
        let globals = GlobalsLookup::new();
        let mut module = Module::new("roundtrip");
        module.start_compiling(&globals);
        module.add_source_file("scripts/", "main.lemon");
        module.add_constant(FlyweightStr::new("K"), DataType::U32, 42);
        module.add_constant_array(
            FlyweightStr::new("table"),
            DataType::U16,
            vec![1, 2, 3],
        );

        let function = module.add_script_function(
            FlyweightStr::new("f"),
            DataType::U8,
            ParameterList::new(),
        );
        {
            let mut script = function.borrow_mut();
            script.opcodes.push(Opcode::new(
                OpcodeType::PushConstant,
                BaseType::IntConst,
                14,
                2,
            ));
            script
                .opcodes
                .push(Opcode::new(OpcodeType::Return, BaseType::Void, 0, 3));
            script.address_hooks.push(0x1234);
        }

        let hash = globals.build_dependency_hash();
        let bytes = serialize_module(&module, hash).expect("serialize");
        let restored = deserialize_module(&bytes, &globals).expect("deserialize");

        assert_eq!(restored.name(), "roundtrip");
        assert_eq!(restored.constants[0].value, 42);
        assert_eq!(restored.constant_arrays[0].values, vec![1, 2, 3]);
        let restored_fn = restored.script_functions[0].borrow();
        let original_fn = module.script_functions[0].borrow();
        assert_eq!(restored_fn.opcodes, original_fn.opcodes);
        assert_eq!(restored_fn.address_hooks, original_fn.address_hooks);
    }

    #[test]
    fn test_dependency_hash_mismatch_rejected() {
        let globals = GlobalsLookup::new();
        let mut module = Module::new("m");
        module.start_compiling(&globals);
        let bytes = serialize_module(&module, 0xdead_0001).expect("serialize");
        assert!(deserialize_module(&bytes, &globals).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let globals = GlobalsLookup::new();
        assert!(deserialize_module(&[0u8; 16], &globals).is_err());
    }
}
