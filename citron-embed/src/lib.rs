// citron-embed - Embedding engine for the Citron scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! High-level embedding interface for the Citron scripting toolchain.
//!
//! The [`Engine`] compiles scripts, registers native functions and
//! host-backed variables, and drives execution by function name, label,
//! update hook or address hook.

pub mod convert;
pub mod engine;

pub use convert::{IntoNativeFn, NativeArg, NativeReturn};
pub use engine::{CallFrameInfo, Engine, EngineError, EngineResult, UpdateHook};

pub use citron_core::NativeFlags;
pub use citron_parser::{DataType, FlyweightStr};
pub use citron_vm::{CompileOptions, FileSystem, MemoryAccessHandler, RuntimeError};
