//! Native call-stack reconstruction
//!
//! Frames are inferred without symbol information, only from the calls the
//! binary translator classifies and from writes to the stack pointer. A frame
//! covers the stack range `[bottom, top)`: it is pushed by a call, resized
//! when the stack grows or shrinks inside the function, and popped as soon as
//! the stack pointer rises to its `top`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TracerError;
use crate::state::{PerState, StateId};
use crate::Result;

/// Descriptor of a basic block entered by the tracked thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlockInfo {
    /// Index of the block in its function, in topological order
    pub index: u32,
    /// Innermost loop containing the block
    pub loop_id: u32,
    /// Loop nesting depth of the block
    pub loop_depth: u32,
    /// Whether the block is the header of its loop
    pub is_header: bool,
}

/// One native stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStackFrame {
    /// Depth of the parent frame, set by the owning [`CallStack`]
    pub parent: Option<usize>,
    pub id: u64,
    pub call_site: u64,
    pub function: u64,
    /// Last basic block entered while this frame was on top
    pub basic_block: Option<BasicBlockInfo>,
    pub top: u64,
    pub bottom: u64,
}

impl CallStackFrame {
    /// Index of the last entered basic block, `-1` before the first one
    pub fn bb_index(&self) -> i64 {
        self.basic_block.map_or(-1, |bb| i64::from(bb.index))
    }
}

impl fmt::Display for CallStackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:#x}->{:#x} [{:#x}, {:#x})",
            self.id, self.call_site, self.function, self.bottom, self.top
        )
    }
}

/// Stack of native frames of one execution context, root first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<CallStackFrame>,
}

impl CallStack {
    /// Create a stack holding only the root frame `[sp, top)`
    pub fn new(root_id: u64, top: u64, sp: u64) -> Self {
        Self {
            frames: vec![CallStackFrame {
                parent: None,
                id: root_id,
                call_site: 0,
                function: 0,
                basic_block: None,
                top,
                bottom: sp,
            }],
        }
    }

    /// Number of frames, the root included
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The innermost frame
    pub fn top(&self) -> &CallStackFrame {
        // The root frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut CallStackFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// The frame right below the innermost one
    pub fn caller(&self) -> Option<&CallStackFrame> {
        self.top().parent.map(|depth| &self.frames[depth])
    }

    /// All frames, root first
    pub fn frames(&self) -> &[CallStackFrame] {
        &self.frames
    }

    fn push(&mut self, mut frame: CallStackFrame) {
        frame.parent = Some(self.frames.len() - 1);
        self.frames.push(frame);
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            writeln!(f, "  [{}] {}", depth, frame)?;
        }
        Ok(())
    }
}

/// Receiver of call-stack notifications
///
/// Notifications for one state are delivered strictly in order. Popping is
/// announced while the frame is still on the stack.
pub trait CallStackListener {
    fn on_stack_frame_push(
        &mut self,
        _state: StateId,
        _old_top: &CallStackFrame,
        _new_top: &CallStackFrame,
    ) -> Result<()> {
        Ok(())
    }

    fn on_stack_frame_popping(
        &mut self,
        _state: StateId,
        _old_top: &CallStackFrame,
        _new_top: &CallStackFrame,
    ) -> Result<()> {
        Ok(())
    }

    fn on_stack_frame_resize(&mut self, _state: StateId, _top: &CallStackFrame) -> Result<()> {
        Ok(())
    }

    fn on_basic_block_enter(&mut self, _state: StateId, _top: &CallStackFrame) -> Result<()> {
        Ok(())
    }
}

impl CallStackListener for () {}

/// Reconstructs call stacks for every execution context of the tracked thread
#[derive(Debug)]
pub struct CallTracer {
    stacks: PerState<CallStack>,
    stack_top: u64,
    next_frame_id: u64,
    debug: bool,
}

impl CallTracer {
    /// Create a tracer for a thread whose stack starts at `stack_top`
    pub fn new(stack_top: u64) -> Self {
        Self {
            stacks: PerState::new(),
            stack_top,
            next_frame_id: 0,
            debug: false,
        }
    }

    /// Log every frame change at debug level
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The call stack of `state`, if any event was seen for it
    pub fn stack(&self, state: StateId) -> Option<&CallStack> {
        self.stacks.get(state)
    }

    /// Call stacks of every state seen so far
    pub fn stacks(&self) -> impl Iterator<Item = (StateId, &CallStack)> {
        self.stacks.iter()
    }

    fn stack_mut(&mut self, state: StateId) -> &mut CallStack {
        let (stack_top, next_id) = (self.stack_top, &mut self.next_frame_id);
        self.stacks.get_or_insert_with(state, || {
            let id = *next_id;
            *next_id += 1;
            CallStack::new(id, stack_top, stack_top)
        })
    }

    /// A control transfer classified as a call was executed
    ///
    /// `sp` is the stack pointer after the call pushed its return address.
    pub fn on_call(
        &mut self,
        state: StateId,
        call_site: u64,
        function: u64,
        sp: u64,
        listener: &mut dyn CallStackListener,
    ) -> Result<()> {
        let debug = self.debug;
        self.stack_mut(state);
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        let stack = self.stack_mut(state);
        let parent_bottom = stack.top().bottom;

        if sp >= parent_bottom {
            tracing::error!(
                "New frame {:#x}->{:#x} (sp={:#x}) is not below its parent (bottom={:#x}) in state {}. Call stack:\n{}",
                call_site,
                function,
                sp,
                parent_bottom,
                state,
                stack
            );
            return Err(TracerError::StackDesync {
                state,
                call_site,
                function,
                sp,
                parent_bottom,
            }
            .into());
        }

        stack.push(CallStackFrame {
            parent: None,
            id,
            call_site,
            function,
            basic_block: None,
            top: parent_bottom,
            bottom: sp,
        });
        if debug {
            tracing::debug!("Frame push in {}: {} (depth {})", state, stack.top(), stack.depth());
        }

        let old_top = stack.caller().cloned();
        let new_top = stack.top().clone();
        if let Some(old_top) = old_top {
            listener.on_stack_frame_push(state, &old_top, &new_top)?;
        }
        Ok(())
    }

    /// Any other write to the stack pointer
    pub fn on_stack_pointer_write(
        &mut self,
        state: StateId,
        sp: u64,
        listener: &mut dyn CallStackListener,
    ) -> Result<()> {
        let debug = self.debug;
        let stack = self.stack_mut(state);

        while stack.depth() > 1 && sp >= stack.top().top {
            if let Some(caller) = stack.caller() {
                listener.on_stack_frame_popping(state, stack.top(), caller)?;
            }
            if debug {
                tracing::debug!("Frame pop in {}: {}", state, stack.top());
            }
            stack.frames.pop();
        }

        if stack.top().bottom != sp {
            if stack.depth() == 1 && sp >= stack.top().top {
                tracing::warn!(
                    "Stack pointer {:#x} above the stack top {:#x} in {}",
                    sp,
                    stack.top().top,
                    state
                );
            }
            stack.top_mut().bottom = sp;
            listener.on_stack_frame_resize(state, stack.top())?;
        }
        Ok(())
    }

    /// The tracked thread entered a basic block
    pub fn on_basic_block_enter(
        &mut self,
        state: StateId,
        info: BasicBlockInfo,
        listener: &mut dyn CallStackListener,
    ) -> Result<()> {
        let stack = self.stack_mut(state);
        stack.top_mut().basic_block = Some(info);
        listener.on_basic_block_enter(state, stack.top())
    }

    /// Copy the stack of `parent` into each forked child
    pub fn fork(&mut self, parent: StateId, children: &[StateId]) {
        self.stacks.fork(parent, children);
    }

    /// Forget a killed state
    pub fn remove(&mut self, state: StateId) {
        self.stacks.remove(state);
    }
}
