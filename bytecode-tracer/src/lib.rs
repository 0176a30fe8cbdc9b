//! Bytecode Tracer - Native and bytecode-level structure of an interpreted guest
//!
//! This crate turns the low-level signals of a symbolic execution host
//! (calls, stack pointer writes, memory accesses, guest pseudo-syscalls) into
//! the execution structure of an interpreter running in the guest.
//!
//! # Overview
//!
//! * [`os`] follows guest threads and their privilege level through the
//!   thread announcement syscalls.
//! * [`call_tracer`] reconstructs native call stacks from calls and stack
//!   pointer writes, per execution context.
//! * [`detector`] records memory operations inside a guest-delimited
//!   calibration window and infers the dispatch loop of the interpreter.
//! * [`interp_tracer`] uses the detected structure to maintain bytecode-level
//!   stacks and report every bytecode PC update.
//!
//! # Usage
//!
//! ```
//! use bytecode_tracer::{CallTracer, StateId};
//!
//! let state = StateId(0);
//! let mut tracer = CallTracer::new(0x1000);
//!
//! tracer.on_call(state, 0x50, 0x100, 0xff0, &mut ()).unwrap();
//! tracer.on_call(state, 0x104, 0x110, 0xfe0, &mut ()).unwrap();
//! assert_eq!(tracer.stack(state).unwrap().depth(), 3);
//!
//! tracer.on_stack_pointer_write(state, 0x1000, &mut ()).unwrap();
//! assert_eq!(tracer.stack(state).unwrap().depth(), 1);
//! ```
//!
//! # Limitations
//!
//! * Frames are inferred heuristically. Code that switches stacks or unwinds
//!   without touching the stack pointer desynchronizes the tracer, which is
//!   reported as a fatal [`TracerError::StackDesync`].
//! * Symbolic bytecode PC updates are reported but not tracked.

pub mod call_graph;
pub mod call_tracer;
pub mod config;
pub mod detector;
pub mod error;
pub mod interp_tracer;
pub mod os;
pub mod state;
pub mod syscall;
pub mod trace;

pub use call_graph::CallGraphMonitor;
pub use call_tracer::{BasicBlockInfo, CallStack, CallStackFrame, CallStackListener, CallTracer};
pub use config::TracerConfig;
pub use detector::{CalibrationCommand, DetectionError, InterpreterDetector, InterpreterStructureParams};
pub use error::TracerError;
pub use interp_tracer::{HighLevelFrame, HighLevelStack, InterpreterListener, InterpreterTracer};
pub use os::{OsEvent, OsThread, OsTracer};
pub use state::{PerState, StateId};
pub use syscall::{GuestSyscall, SyscallMonitor};
pub use trace::{MemoryOp, MemoryOpType, MemoryTrace};

/// Result type for tracer operations
pub type Result<T> = anyhow::Result<T>;
