// citron-vm - Runtime state snapshots
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Serializable runtime snapshots: call stacks, value stacks, locals,
//! global values and runtime-created strings.
//!
//! Snapshots re-bind frames to the current program by function id, which is
//! what makes save states and hot reloads work across module swaps as long
//! as the function layout is unchanged.

use citron_core::{ByteReader, ByteWriter};
use citron_parser::FlyweightStr;

use super::control_flow::{ControlFlow, State};
use super::error::{RuntimeError, RuntimeResult};
use super::Runtime;

const SNAPSHOT_MAGIC: u32 = 0x4354_5353; // "CTSS"
const SNAPSHOT_VERSION: u16 = 1;

impl Runtime {
    /// Serialize the complete execution state.
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u32(SNAPSHOT_MAGIC);
        writer.write_u16(SNAPSHOT_VERSION);

        writer.write_u32(self.global_values.len() as u32);
        for value in &self.global_values {
            writer.write_i64(*value);
        }

        // Runtime-created strings must survive; writing the whole table is
        // simpler and correct
        let strings: Vec<&FlyweightStr> = self.strings.iter().collect();
        writer.write_u32(strings.len() as u32);
        for string in strings {
            writer.write_str(string.as_str());
        }

        writer.write_u32(self.control_flows.len() as u32);
        for flow in &self.control_flows {
            writer.write_u32(flow.call_stack.len() as u32);
            for state in &flow.call_stack {
                writer.write_u32(state.function_id);
                writer.write_u32(state.base_call_index as u32);
                writer.write_u32(state.program_counter as u32);
                writer.write_u32(state.locals_start as u32);
                writer.write_u32(state.value_stack_base as u32);
            }
            let values = flow.value_stack_contents();
            writer.write_u32(values.len() as u32);
            for value in values {
                writer.write_u64(*value);
            }
            let locals = flow.locals_contents();
            writer.write_u32(locals.len() as u32);
            for local in locals {
                writer.write_i64(*local);
            }
        }

        writer.into_bytes()
    }

    /// Restore a previously serialized execution state.
    pub fn deserialize_state(&mut self, bytes: &[u8]) -> RuntimeResult<()> {
        let mut reader = ByteReader::new(bytes);
        let bad = |message: &str| RuntimeError::Internal(format!("snapshot: {}", message));

        if reader.read_u32().map_err(|_| bad("truncated"))? != SNAPSHOT_MAGIC {
            return Err(bad("bad magic"));
        }
        if reader.read_u16().map_err(|_| bad("truncated"))? != SNAPSHOT_VERSION {
            return Err(bad("unsupported version"));
        }

        let global_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
        if global_count != self.global_values.len() {
            return Err(bad("global variable layout mismatch"));
        }
        let mut globals = Vec::with_capacity(global_count);
        for _ in 0..global_count {
            globals.push(reader.read_i64().map_err(|_| bad("truncated"))?);
        }

        let string_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            strings.push(reader.read_str().map_err(|_| bad("truncated"))?);
        }

        let flow_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
        let mut flows: Vec<ControlFlow> = Vec::with_capacity(flow_count);
        for _ in 0..flow_count {
            let mut flow = ControlFlow::new();

            let frame_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
            for _ in 0..frame_count {
                let function_id = reader.read_u32().map_err(|_| bad("truncated"))?;
                if self.program.function_by_id(function_id).is_none() {
                    return Err(bad("frame references an unknown function"));
                }
                let state = State {
                    function_id,
                    base_call_index: reader.read_u32().map_err(|_| bad("truncated"))? as usize,
                    program_counter: reader.read_u32().map_err(|_| bad("truncated"))? as usize,
                    locals_start: reader.read_u32().map_err(|_| bad("truncated"))? as usize,
                    value_stack_base: reader.read_u32().map_err(|_| bad("truncated"))? as usize,
                };
                flow.push_frame(state)?;
            }

            let value_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(reader.read_u64().map_err(|_| bad("truncated"))?);
            }
            flow.set_value_stack_contents(&values)?;

            let local_count = reader.read_u32().map_err(|_| bad("truncated"))? as usize;
            let mut locals = Vec::with_capacity(local_count);
            for _ in 0..local_count {
                locals.push(reader.read_i64().map_err(|_| bad("truncated"))?);
            }
            flow.set_locals_contents(&locals)?;

            flows.push(flow);
        }
        if flows.is_empty() {
            return Err(bad("no control flows"));
        }

        // Everything validated; commit
        self.global_values = globals;
        for text in strings {
            self.add_string(&text);
        }
        self.control_flows = flows;
        self.selected_control_flow = 0;
        self.stop_signal = false;
        Ok(())
    }
}
