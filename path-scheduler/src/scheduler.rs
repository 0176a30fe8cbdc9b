//! Two-level scheduler facade
//!
//! Glues the high-level executor to a low-level strategy. Native frame and
//! block notifications move low-level states through the topological index,
//! bytecode PC updates move them through the path tree, and the host asks the
//! facade which context to run next.

use bytecode_tracer::{CallStackFrame, CallStackListener, HighLevelStack, InterpreterListener, StateId};
use std::collections::BTreeSet;

use crate::executor::{HighLevelEvent, HighLevelExecutor};
use crate::low_level::{
    DfsSearcher, ExecutionHost, LowLevelStrategy, LowLevelTopoStrategy, Merge, Searcher, SproutStrategy,
};
use crate::segment::PathId;
use crate::strategy::StrategyKind;
use crate::Result;

/// Which low-level strategy drives the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LowLevelKind {
    /// Follow the topological index and merge co-located states
    #[default]
    Topological,
    /// Run the first state backing the target
    Sprout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub strategy: StrategyKind,
    pub low_level: LowLevelKind,
    /// Number of selections between two cursor persists
    pub cursor_writeback_rate: u64,
    pub debug_topology: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            low_level: LowLevelKind::default(),
            cursor_writeback_rate: 8,
            debug_topology: false,
        }
    }
}

/// What the host loop should do after delivering a signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Control {
    #[default]
    Continue,
    /// Return to scheduling before executing further
    YieldRequested,
}

pub struct Scheduler<H> {
    executor: HighLevelExecutor,
    strategy: Box<dyn LowLevelStrategy>,
    host: H,
    fallback: DfsSearcher,
    /// Merged-away states the host has not destroyed yet
    merged: BTreeSet<StateId>,
    yield_requested: bool,
    events: Vec<HighLevelEvent>,
}

impl<H: ExecutionHost> Scheduler<H> {
    pub fn new(config: &SchedulerConfig, host: H) -> Self {
        let strategy: Box<dyn LowLevelStrategy> = match config.low_level {
            LowLevelKind::Topological => Box::new(
                LowLevelTopoStrategy::new(config.cursor_writeback_rate).with_debug(config.debug_topology),
            ),
            LowLevelKind::Sprout => Box::new(SproutStrategy::default()),
        };
        Self {
            executor: HighLevelExecutor::new(config.strategy.build()),
            strategy,
            host,
            fallback: DfsSearcher::default(),
            merged: BTreeSet::new(),
            yield_requested: false,
            events: Vec::new(),
        }
    }

    pub fn executor(&self) -> &HighLevelExecutor {
        &self.executor
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// The high-level state currently explored
    pub fn target(&self) -> Option<PathId> {
        self.executor.selected()
    }

    /// Native states inside this function are never merged
    pub fn set_interp_loop_function(&mut self, function: Option<u64>) {
        self.strategy.set_interp_loop_function(function);
    }

    /// Drain the high-level notifications produced so far
    pub fn take_events(&mut self) -> Vec<HighLevelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Consume a pending yield request
    pub fn take_control(&mut self) -> Control {
        if std::mem::take(&mut self.yield_requested) {
            Control::YieldRequested
        } else {
            Control::Continue
        }
    }

    /// Give `state` a high-level state if it has none yet
    pub fn ensure_state(&mut self, state: StateId) -> Result<()> {
        if self.executor.contains(state) || self.merged.contains(&state) {
            return Ok(());
        }
        let path = self.executor.create_state(state)?;
        self.strategy.on_state_created(state, path)?;
        self.flush()
    }

    /// The host forked `parent`; untracked parents are ignored. The host may
    /// list `parent` among the resulting states.
    pub fn on_state_fork(&mut self, parent: StateId, children: &[StateId]) -> Result<()> {
        if !self.executor.contains(parent) {
            return Ok(());
        }
        for &child in children.iter().filter(|&&child| child != parent) {
            self.executor.clone_state(parent, child)?;
            self.strategy.on_state_cloned(parent, child)?;
        }
        self.flush()
    }

    /// The host destroyed `state`
    pub fn on_state_kill(&mut self, state: StateId) -> Result<()> {
        if self.merged.remove(&state) || !self.executor.contains(state) {
            return Ok(());
        }
        self.strategy.on_state_removed(state)?;
        self.executor.terminate_state(state)?;
        self.flush()
    }

    /// `state` observed bytecode PC `hlpc`
    pub fn on_bytecode_pc(&mut self, state: StateId, hlpc: u64) -> Result<()> {
        if self.merged.contains(&state) {
            return Ok(());
        }
        self.ensure_state(state)?;
        self.executor.step_state(state, hlpc)?;
        self.flush()
    }

    /// The context to run next, falling back to the host default when no
    /// high-level state is selected
    pub fn select(&mut self) -> Result<Option<StateId>> {
        if self.executor.selected().is_some() {
            if let Some(state) = self.strategy.select_low_level_state(&self.executor)? {
                return Ok(Some(state));
            }
        }
        Ok(self.fallback.select_state())
    }

    fn flush(&mut self) -> Result<()> {
        for event in self.executor.take_events() {
            self.strategy.apply_event(&event)?;
            self.events.push(event);
        }
        self.strategy.update_target(self.executor.selected())
    }

    fn handle_merge(&mut self, merge: Option<Merge>) -> Result<()> {
        let Some(Merge { base, merged }) = merge else {
            return Ok(());
        };
        tracing::debug!("{} merged into {}, yielding", merged, base);
        self.executor.terminate_state(merged)?;
        self.merged.insert(merged);
        self.fallback.update(None, &[], &[merged]);
        self.yield_requested = true;
        self.flush()
    }
}

impl<H: ExecutionHost> CallStackListener for Scheduler<H> {
    fn on_stack_frame_push(&mut self, state: StateId, _old_top: &CallStackFrame, new_top: &CallStackFrame) -> Result<()> {
        if !self.executor.contains(state) {
            return Ok(());
        }
        let merge = self.strategy.on_frame_push(state, new_top.function, &mut self.host)?;
        self.handle_merge(merge)
    }

    fn on_stack_frame_popping(
        &mut self,
        state: StateId,
        _old_top: &CallStackFrame,
        new_top: &CallStackFrame,
    ) -> Result<()> {
        if !self.executor.contains(state) {
            return Ok(());
        }
        let merge = self.strategy.on_frame_popping(state, new_top.function, &mut self.host)?;
        self.handle_merge(merge)
    }

    fn on_basic_block_enter(&mut self, state: StateId, top: &CallStackFrame) -> Result<()> {
        if !self.executor.contains(state) || top.basic_block.is_none() {
            return Ok(());
        }
        let merge = self
            .strategy
            .on_basic_block(state, top.bb_index(), top.function, &mut self.host)?;
        self.handle_merge(merge)
    }
}

impl<H: ExecutionHost> InterpreterListener for Scheduler<H> {
    fn on_high_level_pc_update(&mut self, state: StateId, stack: &HighLevelStack) -> Result<()> {
        match stack.top() {
            Some(frame) => self.on_bytecode_pc(state, frame.hlpc),
            None => Ok(()),
        }
    }
}

impl<H: ExecutionHost> Searcher for Scheduler<H> {
    fn select_state(&mut self) -> Option<StateId> {
        match self.select() {
            Ok(state) => state,
            Err(err) => {
                tracing::error!("Low-level selection failed: {:#}", err);
                self.fallback.select_state()
            }
        }
    }

    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        self.fallback.update(current, added, removed);
    }

    fn empty(&self) -> bool {
        self.fallback.empty()
    }
}
