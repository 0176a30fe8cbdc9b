//! Data structures for calibration memory traces

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::call_tracer::CallStackFrame;

/// Type of memory operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOpType {
    Read,
    Write,
}

/// Memory operation (read or write) recorded during calibration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOp {
    /// Position of the operation in the trace
    pub seq_no: u64,
    /// Address of the instruction performing the access
    pub pc: u64,
    /// Id of the native frame on top of the stack during the access
    pub frame_id: u64,
    /// Memory address
    pub address: u64,
    /// Value read or written
    pub value: u64,
    /// Access width in bytes
    pub size: u8,
    /// Operation type
    pub op_type: MemoryOpType,
}

impl MemoryOp {
    pub fn is_write(&self) -> bool {
        self.op_type == MemoryOpType::Write
    }
}

/// Memory operations of the tracked thread recorded between the calibration
/// start and end signals
///
/// Only the operations recorded before the last checkpoint are analyzed: the
/// tail after it belongs to an instruction whose execution was not declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTrace {
    ops: Vec<MemoryOp>,
    /// Function of every frame seen in the trace
    frame_functions: BTreeMap<u64, u64>,
    /// Number of leading operations covered by a checkpoint
    analysis_end: usize,
    /// Bytecode instructions declared through checkpoints
    instruction_count: u64,
}

impl MemoryTrace {
    /// Create new empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation performed while `frame` was on top of the stack
    pub fn record(
        &mut self,
        frame: &CallStackFrame,
        pc: u64,
        address: u64,
        value: u64,
        size: u8,
        op_type: MemoryOpType,
    ) {
        self.frame_functions.entry(frame.id).or_insert(frame.function);
        self.ops.push(MemoryOp {
            seq_no: self.ops.len() as u64,
            pc,
            frame_id: frame.id,
            address,
            value,
            size,
            op_type,
        });
    }

    /// Declare that `count` more bytecode instructions were exercised
    pub fn checkpoint(&mut self, count: u64) {
        self.analysis_end = self.ops.len();
        self.instruction_count += count;
    }

    /// Operations covered by the checkpoints
    pub fn analysis_range(&self) -> &[MemoryOp] {
        &self.ops[..self.analysis_end]
    }

    /// Total number of declared bytecode instructions
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Function executing in frame `frame_id`
    pub fn function_of(&self, frame_id: u64) -> Option<u64> {
        self.frame_functions.get(&frame_id).copied()
    }

    /// Get number of recorded memory operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
