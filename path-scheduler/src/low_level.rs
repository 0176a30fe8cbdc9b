//! Low-level scheduling
//!
//! A low-level strategy picks which execution context the host runs next so
//! that the high-level state selected by the executor makes progress. The
//! topological strategy additionally follows every context through the
//! topological index and offers co-located contexts to the host for merging.

use bytecode_tracer::StateId;
use std::collections::BTreeMap;

use crate::error::SchedulerError;
use crate::executor::{HighLevelEvent, HighLevelExecutor};
use crate::segment::PathId;
use crate::topology::{IndexDisplay, NodeId, TopologicTree};
use crate::Result;

/// Scheduler contract of the host engine
pub trait Searcher {
    /// The context to run next
    fn select_state(&mut self) -> Option<StateId>;

    /// Contexts were added or removed while `current` was running
    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]);

    fn empty(&self) -> bool;
}

/// Depth-first searcher: the most recently added context runs first
#[derive(Debug, Default)]
pub struct DfsSearcher {
    states: Vec<StateId>,
}

impl Searcher for DfsSearcher {
    fn select_state(&mut self) -> Option<StateId> {
        self.states.last().copied()
    }

    fn update(&mut self, _current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        for state in added {
            if !self.states.contains(state) {
                self.states.push(*state);
            }
        }
        self.states.retain(|state| !removed.contains(state));
    }

    fn empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Execution primitives of the host engine
pub trait ExecutionHost {
    /// Merge `other` into `base`; on success the host destroys `other`
    fn merge(&mut self, base: StateId, other: StateId) -> bool;
}

/// Host without a merge primitive
impl ExecutionHost for () {
    fn merge(&mut self, _base: StateId, _other: StateId) -> bool {
        false
    }
}

/// Successful merge of a newly arrived context into an occupant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merge {
    pub base: StateId,
    pub merged: StateId,
}

/// Low-level strategy interface used by the scheduler
///
/// Movement callbacks return the merge they performed, if any.
pub trait LowLevelStrategy {
    fn set_interp_loop_function(&mut self, _function: Option<u64>) {}

    fn on_state_created(&mut self, _state: StateId, _path: PathId) -> Result<()> {
        Ok(())
    }

    fn on_state_cloned(&mut self, _parent: StateId, _child: StateId) -> Result<()> {
        Ok(())
    }

    fn on_state_removed(&mut self, _state: StateId) -> Result<()> {
        Ok(())
    }

    fn on_frame_push(&mut self, _state: StateId, _function: u64, _host: &mut dyn ExecutionHost) -> Result<Option<Merge>> {
        Ok(None)
    }

    fn on_frame_popping(&mut self, _state: StateId, _function: u64, _host: &mut dyn ExecutionHost) -> Result<Option<Merge>> {
        Ok(None)
    }

    fn on_basic_block(
        &mut self,
        _state: StateId,
        _basic_block: i64,
        _function: u64,
        _host: &mut dyn ExecutionHost,
    ) -> Result<Option<Merge>> {
        Ok(None)
    }

    /// Follow a high-level executor notification
    fn apply_event(&mut self, _event: &HighLevelEvent) -> Result<()> {
        Ok(())
    }

    /// Make `target` the high-level state to drive
    fn update_target(&mut self, target: Option<PathId>) -> Result<()>;

    /// The low-level state to run for the current target
    fn select_low_level_state(&mut self, executor: &HighLevelExecutor) -> Result<Option<StateId>>;
}

/// Runs the first low-level state backing the target's segment
#[derive(Debug, Default)]
pub struct SproutStrategy {
    target: Option<PathId>,
}

impl SproutStrategy {
    fn select_for(target: PathId, executor: &HighLevelExecutor) -> Option<StateId> {
        executor.backing_states(target).first().copied()
    }
}

impl LowLevelStrategy for SproutStrategy {
    fn update_target(&mut self, target: Option<PathId>) -> Result<()> {
        self.target = target;
        Ok(())
    }

    fn select_low_level_state(&mut self, executor: &HighLevelExecutor) -> Result<Option<StateId>> {
        Ok(self.target.and_then(|target| Self::select_for(target, executor)))
    }
}

/// Follows every low-level state through the topological index and walks a
/// per-target cursor through it to find the next state to run
#[derive(Debug)]
pub struct LowLevelTopoStrategy {
    tree: TopologicTree,
    /// One node per level, innermost last; every entry is owned
    indices: BTreeMap<StateId, Vec<NodeId>>,
    /// Cached cursor of every high-level state; every entry is owned
    cursors: BTreeMap<PathId, Vec<NodeId>>,
    target: Option<PathId>,
    active_cursor: Vec<NodeId>,
    selected: Option<StateId>,
    writeback_counter: u64,
    writeback_rate: u64,
    interp_loop_function: Option<u64>,
    debug: bool,
}

impl LowLevelTopoStrategy {
    pub fn new(writeback_rate: u64) -> Self {
        Self {
            tree: TopologicTree::new(),
            indices: BTreeMap::new(),
            cursors: BTreeMap::new(),
            target: None,
            active_cursor: Vec::new(),
            selected: None,
            writeback_counter: 0,
            writeback_rate: writeback_rate.max(1),
            interp_loop_function: None,
            debug: false,
        }
    }

    /// Log every index update
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn tree(&self) -> &TopologicTree {
        &self.tree
    }

    /// Current node of a state
    pub fn position(&self, state: StateId) -> Option<NodeId> {
        self.indices.get(&state).and_then(|index| index.last().copied())
    }

    /// Node the active cursor points at
    pub fn cursor(&self) -> Option<NodeId> {
        self.active_cursor.last().copied()
    }

    /// Node of the cursor kept for `path`
    pub fn saved_cursor(&self, path: PathId) -> Option<NodeId> {
        self.cursors.get(&path).and_then(|cursor| cursor.last().copied())
    }

    /// Number of levels in the index of a state
    pub fn depth(&self, state: StateId) -> usize {
        self.indices.get(&state).map_or(0, Vec::len)
    }

    fn release_all(&mut self, nodes: Vec<NodeId>) {
        for node in nodes.into_iter().rev() {
            self.tree.release(node);
        }
    }

    fn retain_all(&mut self, nodes: &[NodeId]) -> Result<()> {
        for node in nodes {
            self.tree.retain(*node)?;
        }
        Ok(())
    }

    /// Take the index of `state` for a move, with an extra reference on its
    /// current node that [`settle`](Self::settle) gives back
    fn begin_move(&mut self, state: StateId) -> Result<(Vec<NodeId>, NodeId)> {
        let index = self
            .indices
            .remove(&state)
            .ok_or(SchedulerError::UnknownState(state))?;
        let old = match index.last() {
            Some(&old) => old,
            None => return Err(SchedulerError::UnknownState(state).into()),
        };
        self.tree.retain(old)?;
        Ok((index, old))
    }

    /// Reposition `state` after its index changed, then look for a merge
    fn settle(
        &mut self,
        state: StateId,
        old: NodeId,
        index: Vec<NodeId>,
        function: u64,
        host: &mut dyn ExecutionHost,
    ) -> Result<Option<Merge>> {
        self.tree.remove_state(old, state)?;
        self.tree.release(old);
        let Some(&new) = index.last() else {
            return Err(SchedulerError::UnknownState(state).into());
        };
        let occupants = self.tree.add_state(new, state)?;
        if self.debug {
            tracing::debug!("{} at {}", state, IndexDisplay { tree: &self.tree, index: &index });
        }
        self.indices.insert(state, index);

        if occupants < 2 || self.interp_loop_function == Some(function) {
            return Ok(None);
        }
        self.try_merge(state, new, host)
    }

    fn try_merge(&mut self, state: StateId, node: NodeId, host: &mut dyn ExecutionHost) -> Result<Option<Merge>> {
        let occupants: Vec<StateId> = self
            .tree
            .node(node)?
            .states()
            .iter()
            .copied()
            .filter(|s| *s != state)
            .collect();
        for base in occupants {
            if host.merge(base, state) {
                tracing::debug!("Merged {} into {}", state, base);
                self.on_state_removed(state)?;
                return Ok(Some(Merge { base, merged: state }));
            }
            tracing::trace!("Could not merge {} into {}", state, base);
        }
        Ok(None)
    }

    /// Walk `cursor` in topological order, down first, then next, then back
    /// up, until a node holds a state of `path`
    fn find_next_state(
        tree: &TopologicTree,
        executor: &HighLevelExecutor,
        path: PathId,
        cursor: &mut Vec<NodeId>,
        retained: &mut Vec<NodeId>,
        released: &mut Vec<NodeId>,
    ) -> Result<Option<StateId>> {
        loop {
            let Some(&node) = cursor.last() else {
                return Ok(None);
            };
            let found = tree
                .node(node)?
                .states()
                .iter()
                .copied()
                .find(|s| executor.path_of(*s) == Some(path));
            if found.is_some() {
                return Ok(found);
            }
            if let Some(down) = tree.down_of(node) {
                retained.push(down);
                cursor.push(down);
                continue;
            }
            loop {
                let Some(node) = cursor.pop() else {
                    return Ok(None);
                };
                released.push(node);
                if let Some(next) = tree.next_of(node) {
                    retained.push(next);
                    cursor.push(next);
                    break;
                }
            }
        }
    }

    fn persist_cursor(&mut self) -> Result<()> {
        let Some(target) = self.target else {
            return Ok(());
        };
        if !self.cursors.contains_key(&target) {
            return Ok(());
        }
        let cursor = self.active_cursor.clone();
        self.retain_all(&cursor)?;
        if let Some(old) = self.cursors.insert(target, cursor) {
            self.release_all(old);
        }
        Ok(())
    }

    /// Advance the active cursor to the next state of `target`
    fn walk_cursor(&mut self, target: PathId, executor: &HighLevelExecutor) -> Result<Option<StateId>> {
        let mut cursor = std::mem::take(&mut self.active_cursor);
        let start = cursor.first().copied();
        let mut retained = Vec::new();
        let mut released = Vec::new();
        let found = Self::find_next_state(&self.tree, executor, target, &mut cursor, &mut retained, &mut released)?;
        self.retain_all(&retained)?;
        self.release_all(released);

        let found = match found {
            Some(state) => Some(state),
            None => {
                // Exhausted: restart from the base level next time
                if let Some(start) = start.filter(|s| self.tree.get(*s).is_some()) {
                    let head = self.tree.level_head(start)?;
                    self.tree.retain(head)?;
                    cursor.push(head);
                }
                let fallback = SproutStrategy::select_for(target, executor);
                if fallback.is_some() {
                    tracing::debug!("Topological walk found no state of {}, using the sprout state", target);
                }
                fallback
            }
        };
        self.active_cursor = cursor;
        Ok(found)
    }
}

impl LowLevelStrategy for LowLevelTopoStrategy {
    fn set_interp_loop_function(&mut self, function: Option<u64>) {
        self.interp_loop_function = function;
    }

    fn on_state_created(&mut self, state: StateId, path: PathId) -> Result<()> {
        let root = self.tree.create_root();
        self.tree.retain(root)?;
        self.tree.add_state(root, state)?;
        if let Some(old) = self.indices.insert(state, vec![root]) {
            self.release_all(old);
        }
        if let Some(old) = self.cursors.insert(path, vec![root]) {
            self.release_all(old);
        }
        Ok(())
    }

    fn on_state_cloned(&mut self, parent: StateId, child: StateId) -> Result<()> {
        let Some(index) = self.indices.get(&parent).cloned() else {
            return Ok(());
        };
        self.retain_all(&index)?;
        if let Some(&node) = index.last() {
            self.tree.add_state(node, child)?;
        }
        self.indices.insert(child, index);
        Ok(())
    }

    fn on_state_removed(&mut self, state: StateId) -> Result<()> {
        let Some(index) = self.indices.remove(&state) else {
            return Ok(());
        };
        if let Some(&node) = index.last() {
            self.tree.remove_state(node, state)?;
        }
        self.release_all(index);
        if self.selected == Some(state) {
            self.selected = None;
        }
        Ok(())
    }

    fn on_frame_push(&mut self, state: StateId, function: u64, host: &mut dyn ExecutionHost) -> Result<Option<Merge>> {
        let (mut index, old) = self.begin_move(state)?;
        let down = self.tree.get_down(old, true)?;
        index.push(down);
        self.settle(state, old, index, function, host)
    }

    fn on_frame_popping(&mut self, state: StateId, function: u64, host: &mut dyn ExecutionHost) -> Result<Option<Merge>> {
        let (mut index, old) = self.begin_move(state)?;
        // Drop the loop levels of the returning function, then its call level
        while index.len() > 1 {
            let Some(node) = index.pop() else {
                break;
            };
            let is_call_base = self.tree.node(node)?.is_call_base;
            self.tree.release(node);
            if is_call_base {
                break;
            }
        }
        if let Some(caller) = index.pop() {
            let (bb, ci) = self.tree.node(caller)?.position();
            let next = self.tree.get_next(caller, bb, ci + 1)?;
            self.tree.release(caller);
            index.push(next);
        }
        self.settle(state, old, index, function, host)
    }

    fn on_basic_block(
        &mut self,
        state: StateId,
        basic_block: i64,
        function: u64,
        host: &mut dyn ExecutionHost,
    ) -> Result<Option<Merge>> {
        let (mut index, old) = self.begin_move(state)?;
        if basic_block <= self.tree.node(old)?.basic_block {
            // Backward jump: a new loop iteration opens a level below
            let head = self.tree.get_down(old, false)?;
            let node = self.tree.get_next(head, basic_block, 0)?;
            self.tree.release(head);
            index.push(node);
            return self.settle(state, old, index, function, host);
        }

        // Leave the loop levels the new block lies beyond
        while index.len() > 1 {
            let last = index[index.len() - 1];
            let enclosing = index[index.len() - 2];
            if self.tree.node(last)?.is_call_base || basic_block <= self.tree.node(enclosing)?.basic_block {
                break;
            }
            index.pop();
            self.tree.release(last);
        }
        if let Some(top) = index.pop() {
            let next = self.tree.get_next(top, basic_block, 0)?;
            self.tree.release(top);
            index.push(next);
        }
        self.settle(state, old, index, function, host)
    }

    fn apply_event(&mut self, event: &HighLevelEvent) -> Result<()> {
        match event {
            HighLevelEvent::Forked { state, forks } => {
                if self.target == Some(*state) {
                    self.persist_cursor()?;
                }
                let Some(cursor) = self.cursors.get(state).cloned() else {
                    return Ok(());
                };
                for fork in forks {
                    self.retain_all(&cursor)?;
                    if let Some(old) = self.cursors.insert(*fork, cursor.clone()) {
                        self.release_all(old);
                    }
                }
            }
            HighLevelEvent::Killed { state } => {
                if let Some(cursor) = self.cursors.remove(state) {
                    self.release_all(cursor);
                }
                if self.target == Some(*state) {
                    let cursor = std::mem::take(&mut self.active_cursor);
                    self.release_all(cursor);
                    self.target = None;
                    self.selected = None;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn update_target(&mut self, target: Option<PathId>) -> Result<()> {
        if target == self.target {
            return Ok(());
        }
        self.persist_cursor()?;
        let previous = std::mem::take(&mut self.active_cursor);
        self.release_all(previous);

        self.target = target;
        self.selected = None;
        self.writeback_counter = 0;
        if let Some(cursor) = target.and_then(|t| self.cursors.get(&t)).cloned() {
            self.retain_all(&cursor)?;
            self.active_cursor = cursor;
        }
        Ok(())
    }

    fn select_low_level_state(&mut self, executor: &HighLevelExecutor) -> Result<Option<StateId>> {
        let Some(target) = self.target else {
            return Ok(None);
        };
        let sticky = self
            .selected
            .filter(|s| executor.path_of(*s) == Some(target) && self.indices.contains_key(s));
        let found = match sticky {
            Some(selected) => Some(selected),
            None => self.walk_cursor(target, executor)?,
        };
        self.selected = found;

        self.writeback_counter += 1;
        if self.writeback_counter >= self.writeback_rate {
            self.writeback_counter = 0;
            self.persist_cursor()?;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyKind;

    const FUNCTION: u64 = 0x4010;

    #[derive(Default)]
    struct RecordingHost {
        attempts: Vec<(StateId, StateId)>,
        accept: bool,
    }

    impl ExecutionHost for RecordingHost {
        fn merge(&mut self, base: StateId, other: StateId) -> bool {
            self.attempts.push((base, other));
            self.accept
        }
    }

    fn position(strategy: &LowLevelTopoStrategy, state: StateId) -> (i64, u32) {
        let node = strategy.position(state).unwrap();
        strategy.tree().node(node).unwrap().position()
    }

    #[test]
    fn test_colocated_states_merge_once() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = RecordingHost {
            accept: true,
            ..Default::default()
        };
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();
        strategy.on_state_cloned(StateId(0), StateId(1)).unwrap();

        let first = strategy.on_basic_block(StateId(0), 3, FUNCTION, &mut host).unwrap();
        assert_eq!(first, None);
        let second = strategy.on_basic_block(StateId(1), 3, FUNCTION, &mut host).unwrap();

        assert_eq!(
            second,
            Some(Merge {
                base: StateId(0),
                merged: StateId(1)
            })
        );
        assert_eq!(host.attempts, vec![(StateId(0), StateId(1))], "Exactly one merge attempt");
        let node = strategy.position(StateId(0)).unwrap();
        assert_eq!(strategy.tree().node(node).unwrap().states(), &[StateId(0)]);
        assert_eq!(strategy.position(StateId(1)), None, "The merged state leaves the index");
    }

    #[test]
    fn test_refused_merge_keeps_both_states() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = RecordingHost::default();
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();
        strategy.on_state_cloned(StateId(0), StateId(1)).unwrap();

        strategy.on_basic_block(StateId(0), 3, FUNCTION, &mut host).unwrap();
        let merge = strategy.on_basic_block(StateId(1), 3, FUNCTION, &mut host).unwrap();
        assert_eq!(merge, None);
        assert_eq!(host.attempts.len(), 1);
        assert_eq!(strategy.position(StateId(0)), strategy.position(StateId(1)));
    }

    #[test]
    fn test_no_merge_inside_dispatch_loop() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = RecordingHost {
            accept: true,
            ..Default::default()
        };
        strategy.set_interp_loop_function(Some(FUNCTION));
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();
        strategy.on_state_cloned(StateId(0), StateId(1)).unwrap();

        strategy.on_basic_block(StateId(0), 3, FUNCTION, &mut host).unwrap();
        strategy.on_basic_block(StateId(1), 3, FUNCTION, &mut host).unwrap();
        assert!(host.attempts.is_empty(), "States are never merged inside the dispatch loop");
    }

    #[test]
    fn test_call_and_return_levels() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = ();
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();

        strategy.on_basic_block(StateId(0), 2, FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 1);

        strategy.on_frame_push(StateId(0), 0x5000, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 2);
        assert_eq!(position(&strategy, StateId(0)), (-1, 0));
        strategy.on_basic_block(StateId(0), 0, 0x5000, &mut host).unwrap();
        strategy.on_basic_block(StateId(0), 4, 0x5000, &mut host).unwrap();

        strategy.on_frame_popping(StateId(0), FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 1);
        assert_eq!(position(&strategy, StateId(0)), (2, 1), "Returning bumps the call index");
    }

    #[test]
    fn test_loop_iterations_open_levels() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = ();
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();

        strategy.on_basic_block(StateId(0), 3, FUNCTION, &mut host).unwrap();
        strategy.on_basic_block(StateId(0), 5, FUNCTION, &mut host).unwrap();
        strategy.on_basic_block(StateId(0), 3, FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 2, "The back edge opens a loop level");
        let node = strategy.position(StateId(0)).unwrap();
        assert!(!strategy.tree().node(node).unwrap().is_call_base);

        strategy.on_basic_block(StateId(0), 4, FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 2, "Blocks of the loop body stay in the level");

        strategy.on_basic_block(StateId(0), 7, FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.depth(StateId(0)), 1, "Leaving the loop closes its level");
        assert_eq!(position(&strategy, StateId(0)), (7, 0));
    }

    #[test]
    fn test_releasing_every_holder_frees_the_index() {
        let mut strategy = LowLevelTopoStrategy::new(1);
        let mut host = ();
        strategy.on_state_created(StateId(0), PathId(0)).unwrap();
        strategy.update_target(Some(PathId(0))).unwrap();
        strategy.on_basic_block(StateId(0), 1, FUNCTION, &mut host).unwrap();

        strategy.on_state_removed(StateId(0)).unwrap();
        strategy.update_target(None).unwrap();
        strategy.apply_event(&HighLevelEvent::Killed { state: PathId(0) }).unwrap();
        assert!(strategy.tree().is_empty());
    }

    #[test]
    fn test_cursor_finds_state_of_target() {
        let mut executor = HighLevelExecutor::new(StrategyKind::Dfs.build());
        let mut strategy = LowLevelTopoStrategy::new(2);
        let mut host = ();

        let path = executor.create_state(StateId(0)).unwrap();
        strategy.on_state_created(StateId(0), path).unwrap();
        strategy.update_target(executor.selected()).unwrap();
        strategy.on_basic_block(StateId(0), 1, FUNCTION, &mut host).unwrap();

        assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(0)));
        assert_eq!(
            strategy.select_low_level_state(&executor).unwrap(),
            Some(StateId(0)),
            "The selection sticks while it belongs to the target"
        );
    }

    #[test]
    fn test_switching_targets_resumes_saved_cursor() {
        let mut executor = HighLevelExecutor::new(StrategyKind::Dfs.build());
        let mut strategy = LowLevelTopoStrategy::new(16);
        let mut host = ();

        let first = executor.create_state(StateId(0)).unwrap();
        strategy.on_state_created(StateId(0), first).unwrap();
        let second = executor.create_state(StateId(1)).unwrap();
        strategy.on_state_created(StateId(1), second).unwrap();
        let root = strategy.position(StateId(0)).unwrap();

        strategy.update_target(Some(first)).unwrap();
        strategy.on_basic_block(StateId(0), 1, FUNCTION, &mut host).unwrap();
        strategy.on_basic_block(StateId(0), 2, FUNCTION, &mut host).unwrap();
        assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(0)));
        let reached = strategy.position(StateId(0)).unwrap();
        assert_eq!(strategy.cursor(), Some(reached));
        assert_eq!(strategy.saved_cursor(first), Some(root), "Not persisted before the write-back interval");

        strategy.update_target(Some(second)).unwrap();
        assert_eq!(strategy.saved_cursor(first), Some(reached), "Leaving a target saves its cursor");
        assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(1)));

        strategy.update_target(Some(first)).unwrap();
        assert_eq!(strategy.cursor(), Some(reached), "The walk resumes where it stopped");
        assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(0)));
    }

    #[test]
    fn test_cursor_written_back_every_interval() {
        let mut executor = HighLevelExecutor::new(StrategyKind::Dfs.build());
        let mut strategy = LowLevelTopoStrategy::new(3);
        let mut host = ();

        let path = executor.create_state(StateId(0)).unwrap();
        strategy.on_state_created(StateId(0), path).unwrap();
        let root = strategy.position(StateId(0)).unwrap();
        strategy.update_target(Some(path)).unwrap();
        strategy.on_basic_block(StateId(0), 1, FUNCTION, &mut host).unwrap();
        strategy.on_basic_block(StateId(0), 2, FUNCTION, &mut host).unwrap();
        let reached = strategy.position(StateId(0)).unwrap();

        for _ in 0..2 {
            assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(0)));
            assert_eq!(strategy.saved_cursor(path), Some(root), "Persisted only every third selection");
        }
        strategy.select_low_level_state(&executor).unwrap();
        assert_eq!(strategy.saved_cursor(path), Some(reached));
    }

    #[test]
    fn test_exhausted_walk_falls_back_to_sprout() {
        let mut executor = HighLevelExecutor::new(StrategyKind::Dfs.build());
        let mut strategy = LowLevelTopoStrategy::new(1);

        let path = executor.create_state(StateId(0)).unwrap();
        // The state is unknown to the topological index
        strategy.update_target(Some(path)).unwrap();
        assert_eq!(strategy.select_low_level_state(&executor).unwrap(), Some(StateId(0)));
    }

    #[test]
    fn test_sprout_selects_backing_state() {
        let mut executor = HighLevelExecutor::new(StrategyKind::Dfs.build());
        let mut sprout = SproutStrategy::default();
        let path = executor.create_state(StateId(4)).unwrap();

        assert_eq!(sprout.select_low_level_state(&executor).unwrap(), None, "No target yet");
        sprout.update_target(Some(path)).unwrap();
        assert_eq!(sprout.select_low_level_state(&executor).unwrap(), Some(StateId(4)));
    }

    #[test]
    fn test_dfs_searcher() {
        let mut searcher = DfsSearcher::default();
        assert!(searcher.empty());
        searcher.update(None, &[StateId(0), StateId(1)], &[]);
        assert_eq!(searcher.select_state(), Some(StateId(1)));
        searcher.update(Some(StateId(1)), &[], &[StateId(1)]);
        assert_eq!(searcher.select_state(), Some(StateId(0)));
    }
}
