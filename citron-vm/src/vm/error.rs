// citron-vm - Runtime error types
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Runtime errors. Any of these aborts the current opcode loop, unwinds the
//! control flow's frames and surfaces to the host; other control flows are
//! unaffected.

use std::fmt;

/// Runtime error during opcode execution.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// More values popped than pushed.
    ValueStackUnderflow,
    /// The value stack refused a push beyond its fixed capacity.
    ValueStackOverflow,
    /// Too many nested calls.
    CallStackOverflow,
    /// The local-variable buffer limit was reached, usually by runaway
    /// recursion.
    VarStackLimit,
    /// A `Call` opcode's target is not part of the installed program.
    UnknownFunction { name_and_signature_hash: u64 },
    /// The memory access handler signalled a fault.
    MemoryFault { address: u64 },
    /// A native function reported an error.
    NativeError { function: String, message: String },
    /// Execution outside any installed program or frame.
    NoProgram,
    /// Invariant violation inside the VM.
    Internal(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ValueStackUnderflow => write!(f, "Value stack underflow"),
            RuntimeError::ValueStackOverflow => write!(f, "Value stack overflow"),
            RuntimeError::CallStackOverflow => write!(f, "Call stack overflow"),
            RuntimeError::VarStackLimit => write!(
                f,
                "Reached var stack limit, probably due to recursive function calls"
            ),
            RuntimeError::UnknownFunction {
                name_and_signature_hash,
            } => write!(
                f,
                "Call to unknown function (hash {:#018x})",
                name_and_signature_hash
            ),
            RuntimeError::MemoryFault { address } => {
                write!(f, "Memory access fault at address {:#010x}", address)
            }
            RuntimeError::NativeError { function, message } => {
                write!(f, "Native function '{}' failed: {}", function, message)
            }
            RuntimeError::NoProgram => write!(f, "No program installed in the runtime"),
            RuntimeError::Internal(message) => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for RuntimeError {}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
