//! High-level (bytecode) stack tracking
//!
//! Once the structure of the interpreter is known, every native frame running
//! the dispatch loop owns one or more high-level frames. Writes performed by
//! the bytecode-PC update instruction move the bytecode PC of the current
//! high-level frame. A write to a different location than the one bound to
//! the frame is either a return to an outer high-level frame, when some frame
//! below is bound to that location, or the start of a nested one.

use std::fmt;

use crate::call_tracer::{CallStack, CallStackFrame};
use crate::config::TracerConfig;
use crate::detector::InterpreterStructureParams;
use crate::state::{PerState, StateId};
use crate::Result;

/// One bytecode-level frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighLevelFrame {
    /// Depth of the parent frame in the owning stack
    pub parent: Option<usize>,
    /// Id of the native frame running the dispatch loop for this frame
    pub low_level_frame_id: u64,
    /// Location of the bytecode PC, bound on its first update
    pub hlpc_ptr: Option<u64>,
    /// Last bytecode PC value
    pub hlpc: u64,
    /// Last fetched instruction address
    pub hlinst: u64,
}

/// Stack of high-level frames of one execution context, outermost first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighLevelStack {
    frames: Vec<HighLevelFrame>,
}

impl HighLevelStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost frame
    pub fn top(&self) -> Option<&HighLevelFrame> {
        self.frames.last()
    }

    fn top_mut(&mut self) -> Option<&mut HighLevelFrame> {
        self.frames.last_mut()
    }

    /// All frames, outermost first
    pub fn frames(&self) -> &[HighLevelFrame] {
        &self.frames
    }

    fn push(&mut self, low_level_frame_id: u64) {
        let parent = self.frames.len().checked_sub(1);
        self.frames.push(HighLevelFrame {
            parent,
            low_level_frame_id,
            ..Default::default()
        });
    }
}

impl fmt::Display for HighLevelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            write!(f, "  [{}] ll#{} hlpc={:#x}", depth, frame.low_level_frame_id, frame.hlpc)?;
            if let Some(ptr) = frame.hlpc_ptr {
                write!(f, " @{:#x}", ptr)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Receiver of high-level notifications
pub trait InterpreterListener {
    fn on_high_level_frame_push(&mut self, _state: StateId, _stack: &HighLevelStack) -> Result<()> {
        Ok(())
    }

    /// Announced while the frame is still on the stack
    fn on_high_level_frame_popping(&mut self, _state: StateId, _stack: &HighLevelStack) -> Result<()> {
        Ok(())
    }

    /// The bytecode PC of the top frame changed
    fn on_high_level_pc_update(&mut self, _state: StateId, _stack: &HighLevelStack) -> Result<()> {
        Ok(())
    }

    fn on_high_level_instruction_fetch(&mut self, _state: StateId, _stack: &HighLevelStack) -> Result<()> {
        Ok(())
    }
}

impl InterpreterListener for () {}

/// Tracks high-level stacks of every execution context of the tracked thread
#[derive(Debug)]
pub struct InterpreterTracer {
    params: Option<InterpreterStructureParams>,
    stacks: PerState<HighLevelStack>,
    user_address_limit: u64,
    debug_instructions: bool,
}

impl InterpreterTracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            params: None,
            stacks: PerState::new(),
            user_address_limit: config.user_address_limit,
            debug_instructions: config.debug_instructions,
        }
    }

    /// The structure parameters in use, if installed
    pub fn params(&self) -> Option<&InterpreterStructureParams> {
        self.params.as_ref()
    }

    /// The high-level stack of `state`
    pub fn stack(&self, state: StateId) -> Option<&HighLevelStack> {
        self.stacks.get(state)
    }

    /// Install structure parameters
    ///
    /// High-level stacks are rebuilt from the native stacks already present,
    /// one high-level frame per native frame running the dispatch loop.
    pub fn set_params<'a>(
        &mut self,
        params: InterpreterStructureParams,
        native_stacks: impl IntoIterator<Item = (StateId, &'a CallStack)>,
    ) {
        self.params = Some(params);
        self.stacks = PerState::new();
        for (state, call_stack) in native_stacks {
            let stack = self.stacks.get_or_insert_with(state, HighLevelStack::new);
            for frame in call_stack.frames() {
                if frame.function == params.interp_loop_function {
                    stack.push(frame.id);
                }
            }
            tracing::debug!("Rebuilt high-level stack of {} with {} frames", state, stack.depth());
        }
    }

    /// A native frame was pushed
    pub fn on_frame_push(
        &mut self,
        state: StateId,
        new_top: &CallStackFrame,
        listener: &mut dyn InterpreterListener,
    ) -> Result<()> {
        let Some(params) = self.params else {
            return Ok(());
        };
        if new_top.function != params.interp_loop_function {
            return Ok(());
        }
        let stack = self.stacks.get_or_insert_with(state, HighLevelStack::new);
        stack.push(new_top.id);
        tracing::debug!("Enter high-level frame in {}. Stack size: {}", state, stack.depth());
        listener.on_high_level_frame_push(state, stack)
    }

    /// A native frame is about to be popped
    pub fn on_frame_popping(
        &mut self,
        state: StateId,
        old_top: &CallStackFrame,
        listener: &mut dyn InterpreterListener,
    ) -> Result<()> {
        let Some(params) = self.params else {
            return Ok(());
        };
        if old_top.function != params.interp_loop_function {
            return Ok(());
        }
        let stack = self.stacks.get_or_insert_with(state, HighLevelStack::new);
        if stack.is_empty() {
            tracing::warn!("Leaving the dispatch loop in {} without a high-level frame", state);
            return Ok(());
        }
        listener.on_high_level_frame_popping(state, stack)?;
        stack.frames.pop();
        tracing::debug!("Leaving high-level frame in {}. Stack size: {}", state, stack.depth());
        Ok(())
    }

    /// A concrete memory access of the tracked thread
    ///
    /// Accesses are only inspected while the dispatch loop is the innermost
    /// native function.
    #[allow(clippy::too_many_arguments)]
    pub fn on_memory_access(
        &mut self,
        state: StateId,
        native_top: &CallStackFrame,
        pc: u64,
        address: u64,
        value: u64,
        is_write: bool,
        listener: &mut dyn InterpreterListener,
    ) -> Result<()> {
        let Some(params) = self.params else {
            return Ok(());
        };
        if native_top.function != params.interp_loop_function || address >= self.user_address_limit {
            return Ok(());
        }
        let debug = self.debug_instructions;
        let stack = self.stacks.get_or_insert_with(state, HighLevelStack::new);
        let Some(frame) = stack.top() else {
            tracing::warn!("Dispatch loop memory access in {} without a high-level frame", state);
            return Ok(());
        };
        let (owner, hlpc_ptr) = (frame.low_level_frame_id, frame.hlpc_ptr);
        if owner != native_top.id {
            tracing::debug!(
                "High-level frame owner ll#{} differs from native frame #{} in {}, assuming an unwind",
                owner,
                native_top.id,
                state
            );
        }

        if pc == params.hlpc_update_pc {
            if !is_write {
                tracing::warn!("Unexpected read at the bytecode PC update site: pc={:#x} addr={:#x}", pc, address);
                return Ok(());
            }
            match hlpc_ptr {
                None => {
                    if let Some(frame) = stack.top_mut() {
                        frame.hlpc_ptr = Some(address);
                    }
                }
                Some(ptr) if ptr != address => {
                    let is_return = stack.frames.iter().any(|f| f.hlpc_ptr == Some(address));
                    if is_return {
                        while stack.top().map_or(false, |f| f.hlpc_ptr != Some(address)) {
                            listener.on_high_level_frame_popping(state, stack)?;
                            stack.frames.pop();
                        }
                        tracing::debug!("Virtual return in {}. Stack size: {}", state, stack.depth());
                    } else {
                        stack.push(native_top.id);
                        if let Some(frame) = stack.top_mut() {
                            frame.hlpc_ptr = Some(address);
                        }
                        tracing::debug!("Virtual call in {}. Stack size: {}", state, stack.depth());
                        listener.on_high_level_frame_push(state, stack)?;
                    }
                }
                Some(_) => {}
            }

            if let Some(frame) = stack.top_mut().filter(|f| f.hlpc_ptr == Some(address)) {
                frame.hlpc = value;
                if debug {
                    tracing::debug!("HLPC={:#x}", value);
                }
                listener.on_high_level_pc_update(state, stack)?;
            }
        }

        if pc == params.instruction_fetch_pc {
            if is_write {
                tracing::warn!("Unexpected write at the opcode fetch site: pc={:#x} addr={:#x}", pc, address);
                return Ok(());
            }
            if let Some(frame) = stack.top_mut() {
                frame.hlinst = address;
            }
            if debug {
                tracing::debug!("Instruction={:#x}", address);
            }
            listener.on_high_level_instruction_fetch(state, stack)?;
        }
        Ok(())
    }

    /// A memory access with a symbolic address or value
    pub fn on_symbolic_memory_access(&mut self, state: StateId, pc: u64, is_write: bool) {
        let Some(params) = self.params else {
            return;
        };
        if is_write && pc == params.hlpc_update_pc {
            tracing::warn!(
                "Symbolic bytecode PC update at {:#x} in {}, the high-level path is not tracked",
                pc,
                state
            );
        }
    }

    /// Copy the high-level stack of `parent` into each forked child
    pub fn fork(&mut self, parent: StateId, children: &[StateId]) {
        self.stacks.fork(parent, children);
    }

    /// Forget a killed state
    pub fn remove(&mut self, state: StateId) {
        self.stacks.remove(state);
    }
}
