// citron-vm - Compiler and virtual machine for the Citron scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The Citron compiler and runtime.
//!
//! The compiler half loads a root script, preprocesses and flattens its
//! includes, builds a typed statement tree and emits opcode streams into a
//! module. The runtime half executes installed modules on cooperative
//! control flows with host callouts for memory access and native functions.

pub mod builtins;
pub mod compiler;
pub mod vm;

pub use compiler::error::{CompileError, CompileErrorKind, CompileResult, ErrorMessage};
pub use compiler::loader::{DiskFileSystem, FileSystem, MemoryFileSystem};
pub use compiler::options::CompileOptions;
pub use compiler::Compiler;
pub use vm::{
    ControlFlow, ExecuteResult, FlatMemory, MemoryAccessHandler, MemoryFault, Runtime,
    RuntimeDetailHandler, RuntimeError, RuntimeResult,
};
