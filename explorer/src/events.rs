//! Notifications produced while exploring
//!
//! Every signal delivered to the explorer may produce events from the native
//! tracer, the bytecode tracer, the structure detector and the high-level
//! executor. They are published to the registered observers once the signal
//! has been fully processed.

use bytecode_tracer::{BasicBlockInfo, InterpreterStructureParams, StateId};
use path_scheduler::{HighLevelEvent, PathId};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    FramePush {
        state: StateId,
        frame_id: u64,
        call_site: u64,
        function: u64,
    },
    FramePopping {
        state: StateId,
        frame_id: u64,
        function: u64,
    },
    FrameResize {
        state: StateId,
        frame_id: u64,
        bottom: u64,
    },
    BasicBlockEnter {
        state: StateId,
        function: u64,
        block: BasicBlockInfo,
    },
    HighLevelFramePush {
        state: StateId,
        depth: usize,
    },
    /// Sent while the frame is still on the stack
    HighLevelFramePopping {
        state: StateId,
        depth: usize,
    },
    HighLevelPcUpdate {
        state: StateId,
        hlpc: u64,
    },
    OpcodeFetch {
        state: StateId,
        hlpc: u64,
        address: u64,
    },
    HighLevelStateCreated {
        path: PathId,
        state: StateId,
    },
    HighLevelStateStepped {
        path: PathId,
        hlpc: u64,
    },
    HighLevelStateForked {
        path: PathId,
        forks: Vec<PathId>,
    },
    HighLevelStateKilled {
        path: PathId,
    },
    HighLevelStateSwitched {
        from: Option<PathId>,
        to: Option<PathId>,
    },
    StructureDetected {
        params: InterpreterStructureParams,
    },
    DetectionFailed {
        reason: String,
    },
}

impl From<HighLevelEvent> for Event {
    fn from(event: HighLevelEvent) -> Self {
        match event {
            HighLevelEvent::Created { state, low_level } => Event::HighLevelStateCreated {
                path: state,
                state: low_level,
            },
            HighLevelEvent::Stepped { state, hlpc } => Event::HighLevelStateStepped { path: state, hlpc },
            HighLevelEvent::Forked { state, forks } => Event::HighLevelStateForked { path: state, forks },
            HighLevelEvent::Killed { state } => Event::HighLevelStateKilled { path: state },
            HighLevelEvent::Switched { from, to } => Event::HighLevelStateSwitched { from, to },
        }
    }
}

/// Receiver of explorer events
pub trait Observer {
    fn on_event(&mut self, event: &Event);
}

/// Shared observers stay inspectable by their owner after registration
impl<O: Observer> Observer for Rc<RefCell<O>> {
    fn on_event(&mut self, event: &Event) {
        self.borrow_mut().on_event(event);
    }
}

/// Keeps every event in arrival order
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Vec<Event>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Export the recorded events as a JSON array
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.events)?)
    }
}

impl Observer for EventRecorder {
    fn on_event(&mut self, event: &Event) {
        self.events.push(event.clone());
    }
}
