//! Interpreter structure detection
//!
//! A guest program running on an interpreter signals a calibration window in
//! which it executes a known number of bytecode instructions. The memory
//! operations of the tracked thread are recorded inside that window and
//! analyzed for the two signatures of a dispatch loop:
//!
//! * a word-sized variable that is written with strictly increasing values,
//!   once per executed bytecode instruction (the bytecode PC), and
//! * an instruction that reads, with strictly increasing addresses, from the
//!   range of values taken by that variable (the opcode fetch).
//!
//! Detection succeeds only when exactly one candidate shows both signatures.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::call_tracer::CallStackFrame;
use crate::config::TracerConfig;
use crate::syscall::{
    GuestSyscall, SYSCALL_CALIBRATION_CHECKPOINT, SYSCALL_CALIBRATION_END,
    SYSCALL_CALIBRATION_START,
};
use crate::trace::{MemoryOp, MemoryOpType, MemoryTrace};
use crate::Result;

/// Detected structure of an interpreter's dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterpreterStructureParams {
    /// Entry address of the function running the dispatch loop
    pub interp_loop_function: u64,
    /// Instruction storing a new value to the bytecode PC
    pub hlpc_update_pc: u64,
    /// Instruction loading the next opcode
    pub instruction_fetch_pc: u64,
}

impl InterpreterStructureParams {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Recoverable detection failures
///
/// Execution continues at native granularity after any of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("no memory operations were recorded before the last checkpoint")]
    EmptyWindow,

    #[error("no candidate bytecode PC variables detected")]
    NoPcCandidates,

    #[error("not enough bytecode PC variable updates (at least {threshold} required)")]
    NotEnoughUpdates { threshold: u64 },

    #[error("no candidate opcode fetch instructions detected")]
    NoFetchCandidates,

    #[error("ambiguous interpreter structure: {count} candidates qualify")]
    Ambiguous { count: usize },
}

/// Calibration signal sent by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationCommand {
    /// Begin recording memory operations
    Start,
    /// The given number of bytecode instructions was executed since the
    /// previous checkpoint or the start
    Checkpoint(u64),
    /// Stop recording and run the detection
    End,
}

impl CalibrationCommand {
    /// Decode a calibration syscall, `None` for any other id
    pub fn decode(syscall: &GuestSyscall) -> Option<Self> {
        match syscall.id {
            SYSCALL_CALIBRATION_START => Some(Self::Start),
            SYSCALL_CALIBRATION_CHECKPOINT => Some(Self::Checkpoint(syscall.data)),
            SYSCALL_CALIBRATION_END => Some(Self::End),
            _ => None,
        }
    }
}

/// Writes observed at one candidate bytecode PC address
#[derive(Debug)]
struct PcCandidate {
    address: u64,
    frame_id: u64,
    first_seq: u64,
    update_pc: u64,
    values: Vec<u64>,
}

impl PcCandidate {
    fn range(&self) -> (u64, u64) {
        (self.values[0], self.values[self.values.len() - 1])
    }
}

/// Reads performed by one candidate opcode fetch instruction
#[derive(Debug)]
struct FetchCandidate {
    pc: u64,
    frame_id: u64,
    first_seq: u64,
    addresses: Vec<u64>,
}

/// Groups monotonic sequences by key, dropping a key for good as soon as it
/// breaks monotonicity or changes frame
fn group_monotonic<G>(
    ops: impl Iterator<Item = (u64, u64, G)>,
    frame_of: impl Fn(&G) -> u64,
    push: impl Fn(&mut G, u64) -> Option<u64>,
    mut make: impl FnMut(u64, G) -> G,
) -> Vec<G> {
    let mut groups: HashMap<u64, G> = HashMap::new();
    let mut discarded: HashSet<u64> = HashSet::new();
    let mut order: Vec<u64> = Vec::new();

    for (key, value, fresh) in ops {
        if discarded.contains(&key) {
            continue;
        }
        let Some(group) = groups.get_mut(&key) else {
            order.push(key);
            groups.insert(key, make(value, fresh));
            continue;
        };
        let last = push(group, value);
        if frame_of(group) != frame_of(&fresh) || last.map_or(false, |last| value <= last) {
            groups.remove(&key);
            discarded.insert(key);
        }
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Run both detection phases over a finished calibration trace
pub fn detect(
    trace: &MemoryTrace,
    config: &TracerConfig,
) -> std::result::Result<InterpreterStructureParams, DetectionError> {
    let ops = trace.analysis_range();
    if ops.is_empty() {
        return Err(DetectionError::EmptyWindow);
    }
    let threshold = trace.instruction_count().max(config.min_opcodes);

    let mut candidates = pc_candidates(ops, config.word_size);
    if candidates.is_empty() {
        return Err(DetectionError::NoPcCandidates);
    }
    candidates.retain(|candidate| {
        let updates = candidate.values.len() as u64;
        let (first, last) = candidate.range();
        updates >= threshold
            && last - first <= updates.saturating_mul(config.max_instruction_size)
    });
    if candidates.is_empty() {
        return Err(DetectionError::NotEnoughUpdates { threshold });
    }
    // Strongest candidates first
    candidates.sort_by(|a, b| {
        b.values
            .len()
            .cmp(&a.values.len())
            .then(a.first_seq.cmp(&b.first_seq))
    });

    let mut found = Vec::new();
    for candidate in &candidates {
        let Some(fetch) = fetch_candidate(ops, candidate, threshold) else {
            tracing::debug!(
                "Bytecode PC candidate {:#x} ({} updates) has no opcode fetch",
                candidate.address,
                candidate.values.len()
            );
            continue;
        };
        let Some(function) = trace.function_of(candidate.frame_id) else {
            tracing::debug!(
                "Bytecode PC candidate {:#x} was updated in unknown frame #{}",
                candidate.address,
                candidate.frame_id
            );
            continue;
        };
        tracing::debug!(
            "Bytecode PC candidate {:#x} updated at {:#x}, fetched at {:#x}",
            candidate.address,
            candidate.update_pc,
            fetch.pc
        );
        found.push((candidate, fetch, function));
    }

    match found.as_slice() {
        [] => Err(DetectionError::NoFetchCandidates),
        [(candidate, fetch, function)] => {
            let params = InterpreterStructureParams {
                interp_loop_function: *function,
                hlpc_update_pc: candidate.update_pc,
                instruction_fetch_pc: fetch.pc,
            };
            tracing::info!(
                "Interpreter structure detected: loop={:#x} hlpc_update={:#x} fetch={:#x}",
                params.interp_loop_function,
                params.hlpc_update_pc,
                params.instruction_fetch_pc
            );
            Ok(params)
        }
        _ => Err(DetectionError::Ambiguous { count: found.len() }),
    }
}

fn pc_candidates(ops: &[MemoryOp], word_size: u8) -> Vec<PcCandidate> {
    let writes = ops
        .iter()
        .filter(|op| op.is_write() && op.size == word_size)
        .map(|op| {
            let fresh = PcCandidate {
                address: op.address,
                frame_id: op.frame_id,
                first_seq: op.seq_no,
                update_pc: op.pc,
                values: Vec::new(),
            };
            (op.address, op.value, fresh)
        });
    group_monotonic(
        writes,
        |group| group.frame_id,
        |group, value| {
            let last = group.values.last().copied();
            group.values.push(value);
            last
        },
        |value, mut fresh| {
            fresh.values.push(value);
            fresh
        },
    )
}

fn fetch_candidate(ops: &[MemoryOp], candidate: &PcCandidate, threshold: u64) -> Option<FetchCandidate> {
    let (first, last) = candidate.range();
    let reads = ops
        .iter()
        .filter(|op| op.op_type == MemoryOpType::Read)
        .filter(|op| op.address >= first && op.address <= last)
        .map(|op| {
            let fresh = FetchCandidate {
                pc: op.pc,
                frame_id: op.frame_id,
                first_seq: op.seq_no,
                addresses: Vec::new(),
            };
            (op.pc, op.address, fresh)
        });
    let groups = group_monotonic(
        reads,
        |group| group.frame_id,
        |group, address| {
            let last = group.addresses.last().copied();
            group.addresses.push(address);
            last
        },
        |address, mut fresh| {
            fresh.addresses.push(address);
            fresh
        },
    );

    groups
        .into_iter()
        .filter(|group| group.frame_id == candidate.frame_id)
        .filter(|group| group.addresses.len() as u64 >= threshold)
        // Longest group wins, ties go to the group seen first
        .fold(None, |best: Option<FetchCandidate>, group| match best {
            Some(best)
                if best.addresses.len() > group.addresses.len()
                    || (best.addresses.len() == group.addresses.len()
                        && best.first_seq <= group.first_seq) =>
            {
                Some(best)
            }
            _ => Some(group),
        })
}

/// Drives the calibration protocol and records the window's memory trace
#[derive(Debug)]
pub struct InterpreterDetector {
    config: TracerConfig,
    trace: Option<MemoryTrace>,
}

impl InterpreterDetector {
    pub fn new(config: TracerConfig) -> Self {
        Self { config, trace: None }
    }

    /// Whether a calibration window is open
    pub fn is_calibrating(&self) -> bool {
        self.trace.is_some()
    }

    /// The trace of the open calibration window
    pub fn trace(&self) -> Option<&MemoryTrace> {
        self.trace.as_ref()
    }

    /// Handle a guest syscall; returns the detection outcome on calibration end
    pub fn handle_syscall(
        &mut self,
        syscall: &GuestSyscall,
    ) -> Option<std::result::Result<InterpreterStructureParams, DetectionError>> {
        CalibrationCommand::decode(syscall).and_then(|command| self.handle_command(command))
    }

    /// Handle a decoded calibration command
    ///
    /// Protocol misuse is reported and otherwise ignored.
    pub fn handle_command(
        &mut self,
        command: CalibrationCommand,
    ) -> Option<std::result::Result<InterpreterStructureParams, DetectionError>> {
        match (command, self.trace.as_mut()) {
            (CalibrationCommand::Start, None) => {
                tracing::info!("Starting interpreter detector calibration");
                self.trace = Some(MemoryTrace::new());
                None
            }
            (CalibrationCommand::Start, Some(_)) => {
                tracing::warn!("Calibration start received while already calibrating, ignoring");
                None
            }
            (CalibrationCommand::Checkpoint(count), Some(trace)) => {
                tracing::debug!("Calibration checkpoint: {} instructions", count);
                trace.checkpoint(count);
                None
            }
            (CalibrationCommand::End, Some(_)) => {
                let trace = self.trace.take()?;
                tracing::info!(
                    "Calibration ended: {} memory operations, {} instructions",
                    trace.len(),
                    trace.instruction_count()
                );
                let outcome = detect(&trace, &self.config);
                if let Err(err) = &outcome {
                    tracing::warn!("Could not detect interpretation structure: {}", err);
                }
                Some(outcome)
            }
            (command, None) => {
                tracing::warn!("Calibration command {:?} received before start, ignoring", command);
                None
            }
        }
    }

    /// Record a concrete memory access of the tracked thread
    pub fn on_memory_access(
        &mut self,
        frame: &CallStackFrame,
        pc: u64,
        address: u64,
        value: u64,
        size: u8,
        is_write: bool,
    ) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        let op_type = if is_write {
            MemoryOpType::Write
        } else {
            MemoryOpType::Read
        };
        trace.record(frame, pc, address, value, size, op_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP_FUNCTION: u64 = 0x40_0000;
    const UPDATE_PC: u64 = 0x40_0100;
    const FETCH_PC: u64 = 0x40_0120;

    fn frame(id: u64, function: u64) -> CallStackFrame {
        CallStackFrame {
            parent: Some(0),
            id,
            call_site: 0x40_0000,
            function,
            basic_block: None,
            top: 0x7fff_0000,
            bottom: 0x7ffe_ff00,
        }
    }

    /// Plants an interpreter executing `count` instructions of 3 bytes each,
    /// with a bytecode PC stored at `hlpc_address`.
    fn plant(
        detector: &mut InterpreterDetector,
        frame: &CallStackFrame,
        hlpc_address: u64,
        bytecode: u64,
        offset: u64,
        count: u64,
    ) {
        for i in 0..count {
            let hlpc = bytecode + i * 3;
            detector.on_memory_access(frame, UPDATE_PC + offset, hlpc_address, hlpc, 8, true);
            detector.on_memory_access(frame, FETCH_PC + offset, hlpc, 0x17, 1, false);
            // Stack traffic going back and forth
            detector.on_memory_access(frame, 0x40_0200, 0x7ffe_ff08, i % 2, 8, true);
            detector.on_memory_access(frame, 0x40_0204, 0x7ffe_ff08, i % 2, 8, false);
        }
    }

    #[test]
    fn test_detects_planted_structure() {
        let mut detector = InterpreterDetector::new(TracerConfig::default());
        let interp = frame(3, LOOP_FUNCTION);

        assert!(detector.handle_command(CalibrationCommand::Start).is_none());
        plant(&mut detector, &interp, 0x60_1000, 0x80_0000, 0, 12);
        assert!(detector.handle_command(CalibrationCommand::Checkpoint(12)).is_none());

        let params = detector
            .handle_command(CalibrationCommand::End)
            .expect("calibration end yields an outcome")
            .expect("structure is detected");
        assert_eq!(
            params,
            InterpreterStructureParams {
                interp_loop_function: LOOP_FUNCTION,
                hlpc_update_pc: UPDATE_PC,
                instruction_fetch_pc: FETCH_PC,
            }
        );
        assert!(!detector.is_calibrating());
    }

    #[test]
    fn test_ambiguous_structure_fails() {
        let mut detector = InterpreterDetector::new(TracerConfig::default());
        let interp = frame(3, LOOP_FUNCTION);

        detector.handle_command(CalibrationCommand::Start);
        plant(&mut detector, &interp, 0x60_1000, 0x80_0000, 0, 10);
        plant(&mut detector, &interp, 0x60_2000, 0x90_0000, 0x40, 10);
        detector.handle_command(CalibrationCommand::Checkpoint(10));

        let outcome = detector.handle_command(CalibrationCommand::End);
        assert_eq!(outcome, Some(Err(DetectionError::Ambiguous { count: 2 })));
    }

    #[test]
    fn test_candidates_of_unknown_frames_are_skipped() {
        let mut detector = InterpreterDetector::new(TracerConfig::default());
        detector.handle_command(CalibrationCommand::Start);
        plant(&mut detector, &frame(3, LOOP_FUNCTION), 0x60_1000, 0x80_0000, 0, 10);
        plant(&mut detector, &frame(4, 0x41_0000), 0x60_2000, 0x90_0000, 0x40, 10);
        detector.handle_command(CalibrationCommand::Checkpoint(10));

        // A stored trace may lack the function of some frames
        let mut stored = serde_json::to_value(detector.trace().unwrap()).unwrap();
        stored["frame_functions"].as_object_mut().unwrap().remove("4");
        let trace: MemoryTrace = serde_json::from_value(stored).unwrap();

        let params = detect(&trace, &TracerConfig::default()).unwrap();
        assert_eq!(params.interp_loop_function, LOOP_FUNCTION, "Only the known frame qualifies");
        assert_eq!(params.hlpc_update_pc, UPDATE_PC);
    }

    #[test]
    fn test_not_enough_updates() {
        let mut detector = InterpreterDetector::new(TracerConfig::default());
        let interp = frame(3, LOOP_FUNCTION);

        detector.handle_command(CalibrationCommand::Start);
        plant(&mut detector, &interp, 0x60_1000, 0x80_0000, 0, 4);
        detector.handle_command(CalibrationCommand::Checkpoint(20));

        let outcome = detector.handle_command(CalibrationCommand::End);
        assert_eq!(outcome, Some(Err(DetectionError::NotEnoughUpdates { threshold: 20 })));
    }

    #[test]
    fn test_cross_frame_writes_are_discarded() {
        let mut detector = InterpreterDetector::new(TracerConfig::default().with_min_opcodes(1));
        let first = frame(3, LOOP_FUNCTION);
        let second = frame(4, LOOP_FUNCTION);

        detector.handle_command(CalibrationCommand::Start);
        plant(&mut detector, &first, 0x60_1000, 0x80_0000, 0, 3);
        plant(&mut detector, &second, 0x60_1000, 0x80_0100, 0, 3);
        detector.handle_command(CalibrationCommand::Checkpoint(6));

        let outcome = detector.handle_command(CalibrationCommand::End);
        assert_eq!(outcome, Some(Err(DetectionError::NoPcCandidates)));
    }

    #[test]
    fn test_wide_value_span_is_rejected() {
        let config = TracerConfig::default().with_max_instruction_size(2);
        let mut detector = InterpreterDetector::new(config);
        let interp = frame(3, LOOP_FUNCTION);

        detector.handle_command(CalibrationCommand::Start);
        plant(&mut detector, &interp, 0x60_1000, 0x80_0000, 0, 10);
        detector.handle_command(CalibrationCommand::Checkpoint(10));

        let outcome = detector.handle_command(CalibrationCommand::End);
        assert_eq!(outcome, Some(Err(DetectionError::NotEnoughUpdates { threshold: 10 })));
    }

    #[test]
    fn test_protocol_misuse_is_ignored() {
        let mut detector = InterpreterDetector::new(TracerConfig::default());
        assert!(detector.handle_command(CalibrationCommand::End).is_none());
        assert!(detector.handle_command(CalibrationCommand::Checkpoint(3)).is_none());
        assert!(!detector.is_calibrating());

        detector.handle_command(CalibrationCommand::Start);
        detector.on_memory_access(&frame(1, 0), 0x1, 0x2, 0x3, 8, true);
        detector.handle_command(CalibrationCommand::Start);
        assert_eq!(detector.trace().map(MemoryTrace::len), Some(1), "A second start keeps the window");
    }

    #[test]
    fn test_syscall_decoding() {
        assert_eq!(
            CalibrationCommand::decode(&GuestSyscall::new(SYSCALL_CALIBRATION_CHECKPOINT, 7)),
            Some(CalibrationCommand::Checkpoint(7))
        );
        assert_eq!(CalibrationCommand::decode(&GuestSyscall::new(0xBEEF, 0)), None);
    }

    #[test]
    fn test_params_json_round_trip() {
        let params = InterpreterStructureParams {
            interp_loop_function: 1,
            hlpc_update_pc: 2,
            instruction_fetch_pc: 3,
        };
        let bytes = params.to_bytes().unwrap();
        assert_eq!(InterpreterStructureParams::from_bytes(&bytes).unwrap(), params);
    }
}
