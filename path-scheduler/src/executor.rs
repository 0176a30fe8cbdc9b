//! High-level executor
//!
//! Low-level states advance through the path tree as their bytecode PC
//! changes. A high-level state lags behind at the lowest segment of its path
//! that still matters: once no low-level state is left on its segment, it is
//! advanced to the single successor, forked across several successors, or
//! killed when the segment has none.

use bytecode_tracer::StateId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SchedulerError;
use crate::segment::{PathId, PathTree, SegmentId};
use crate::strategy::HighLevelStrategy;
use crate::Result;

/// Position of one low-level state on the path tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowLevelState {
    pub segment: SegmentId,
}

/// One macro execution path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighLevelState {
    pub segment: SegmentId,
}

/// Notifications of the high-level executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HighLevelEvent {
    Created { state: PathId, low_level: StateId },
    Stepped { state: PathId, hlpc: u64 },
    /// `forks` lists the new states; `state` stepped into its own successor
    Forked { state: PathId, forks: Vec<PathId> },
    Killed { state: PathId },
    Switched { from: Option<PathId>, to: Option<PathId> },
}

/// Tracks low-level states on the path tree and drives high-level states
pub struct HighLevelExecutor {
    tree: PathTree,
    ll_states: BTreeMap<StateId, LowLevelState>,
    hl_states: BTreeMap<PathId, HighLevelState>,
    strategy: Box<dyn HighLevelStrategy>,
    selected: Option<PathId>,
    events: Vec<HighLevelEvent>,
}

impl HighLevelExecutor {
    pub fn new(strategy: Box<dyn HighLevelStrategy>) -> Self {
        Self {
            tree: PathTree::new(),
            ll_states: BTreeMap::new(),
            hl_states: BTreeMap::new(),
            strategy,
            selected: None,
            events: Vec::new(),
        }
    }

    pub fn tree(&self) -> &PathTree {
        &self.tree
    }

    /// The high-level state the strategy currently explores
    pub fn selected(&self) -> Option<PathId> {
        self.selected
    }

    pub fn contains(&self, state: StateId) -> bool {
        self.ll_states.contains_key(&state)
    }

    pub fn low_level_state(&self, state: StateId) -> Option<&LowLevelState> {
        self.ll_states.get(&state)
    }

    pub fn high_level_state(&self, path: PathId) -> Option<&HighLevelState> {
        self.hl_states.get(&path)
    }

    /// Live high-level states
    pub fn high_level_states(&self) -> impl Iterator<Item = PathId> + '_ {
        self.hl_states.keys().copied()
    }

    /// Path of the segment a low-level state is on
    pub fn path_of(&self, state: StateId) -> Option<PathId> {
        let ll = self.ll_states.get(&state)?;
        self.tree.get(ll.segment).map(|segment| segment.path_id)
    }

    /// Low-level states backing the segment of a high-level state
    pub fn backing_states(&self, path: PathId) -> Vec<StateId> {
        self.hl_states
            .get(&path)
            .and_then(|hl| self.tree.get(hl.segment))
            .map(|segment| segment.states().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drain pending notifications
    pub fn take_events(&mut self) -> Vec<HighLevelEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start a new path for a low-level state with no prior association
    pub fn create_state(&mut self, state: StateId) -> Result<PathId> {
        let root = self.tree.create_root();
        let path = self.tree.segment(root)?.path_id;
        if self.hl_states.contains_key(&path) {
            return Err(SchedulerError::PathIdCollision(path).into());
        }
        self.hl_states.insert(path, HighLevelState { segment: root });

        self.tree.retain(root)?;
        self.tree.join(root, state)?;
        self.ll_states.insert(state, LowLevelState { segment: root });
        tracing::info!("Created high-level state {} for {}", path, state);
        self.events.push(HighLevelEvent::Created { state: path, low_level: state });

        self.strategy.add_states(None, &[path])?;
        self.reselect();
        Ok(path)
    }

    /// A forked low-level state starts on the segment of its parent
    pub fn clone_state(&mut self, parent: StateId, child: StateId) -> Result<()> {
        let segment = self
            .ll_states
            .get(&parent)
            .ok_or(SchedulerError::UnknownState(parent))?
            .segment;
        self.tree.retain(segment)?;
        self.tree.join(segment, child)?;
        self.ll_states.insert(child, LowLevelState { segment });
        Ok(())
    }

    /// A low-level state terminated
    pub fn terminate_state(&mut self, state: StateId) -> Result<()> {
        let ll = self
            .ll_states
            .remove(&state)
            .ok_or(SchedulerError::UnknownState(state))?;
        self.tree.leave(ll.segment, state)?;
        self.tree.release(ll.segment);
        self.update_selected_state()
    }

    /// A low-level state observed a new bytecode PC
    pub fn step_state(&mut self, state: StateId, hlpc: u64) -> Result<()> {
        let current = self
            .ll_states
            .get(&state)
            .ok_or(SchedulerError::UnknownState(state))?
            .segment;
        let next = self.tree.next_segment(current, hlpc)?;
        self.tree.retain(next)?;
        self.tree.leave(current, state)?;
        self.tree.join(next, state)?;
        self.tree.release(current);
        self.ll_states.insert(state, LowLevelState { segment: next });
        self.update_selected_state()
    }

    /// Drive the selected high-level state until it has a low-level state to
    /// run, or no state is selected
    pub fn update_selected_state(&mut self) -> Result<()> {
        while self.selected.is_some() {
            if !self.do_update_selected_state()? {
                break;
            }
        }
        Ok(())
    }

    fn do_update_selected_state(&mut self) -> Result<bool> {
        let Some(path) = self.selected else {
            return Ok(false);
        };
        let segment_id = self
            .hl_states
            .get(&path)
            .ok_or(SchedulerError::UnknownPath(path))?
            .segment;
        let segment = self.tree.segment(segment_id)?;
        if !segment.states().is_empty() {
            return Ok(false);
        }
        let children: Vec<(u64, SegmentId)> = segment.children().iter().map(|(h, s)| (*h, *s)).collect();
        let own_path = segment.path_id;

        match children.as_slice() {
            [] => {
                tracing::debug!("High-level state {} terminated", path);
                self.events.push(HighLevelEvent::Killed { state: path });
                self.strategy.kill_state(path)?;
                self.hl_states.remove(&path);
                self.tree.release(segment_id);
            }
            [(hlpc, _)] => {
                self.step_high_level(path, *hlpc)?;
                self.events.push(HighLevelEvent::Stepped { state: path, hlpc: *hlpc });
                self.strategy.update_state(path)?;
            }
            _ => {
                let mut stepping = None;
                let mut forks = Vec::new();
                for (hlpc, child) in &children {
                    let child_path = self.tree.segment(*child)?.path_id;
                    if child_path == own_path {
                        stepping = Some(*hlpc);
                        continue;
                    }
                    if self.hl_states.contains_key(&child_path) {
                        return Err(SchedulerError::PathIdCollision(child_path).into());
                    }
                    self.tree.retain(*child)?;
                    self.tree.detach(*child)?;
                    self.hl_states.insert(child_path, HighLevelState { segment: *child });
                    forks.push(child_path);
                }
                // Every fork starts from the base segment, so the forking
                // state only advances afterwards
                let hlpc = stepping.ok_or(SchedulerError::MissingPathSuccessor(path))?;
                self.step_high_level(path, hlpc)?;
                tracing::debug!("High-level state {} forked into {:?}", path, forks);
                self.events.push(HighLevelEvent::Forked {
                    state: path,
                    forks: forks.clone(),
                });
                self.strategy.add_states(Some(path), &forks)?;
            }
        }

        self.reselect();
        Ok(true)
    }

    fn step_high_level(&mut self, path: PathId, hlpc: u64) -> Result<()> {
        let hl = self.hl_states.get_mut(&path).ok_or(SchedulerError::UnknownPath(path))?;
        let current = hl.segment;
        let next = self.tree.next_segment(current, hlpc)?;
        self.tree.retain(next)?;
        self.tree.detach(next)?;
        hl.segment = next;
        self.tree.release(current);
        Ok(())
    }

    fn reselect(&mut self) {
        let selected = self.strategy.select_state();
        if selected != self.selected {
            tracing::debug!("Switching high-level state {:?} -> {:?}", self.selected, selected);
            self.events.push(HighLevelEvent::Switched {
                from: self.selected,
                to: selected,
            });
            self.selected = selected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyKind;

    fn executor() -> HighLevelExecutor {
        HighLevelExecutor::new(StrategyKind::Dfs.build())
    }

    #[test]
    fn test_three_way_fork() {
        let mut executor = executor();
        let root_path = executor.create_state(StateId(0)).unwrap();
        executor.clone_state(StateId(0), StateId(1)).unwrap();
        executor.clone_state(StateId(0), StateId(2)).unwrap();

        executor.step_state(StateId(0), 0x10).unwrap();
        executor.step_state(StateId(1), 0x20).unwrap();
        executor.step_state(StateId(2), 0x30).unwrap();

        let live: Vec<PathId> = executor.high_level_states().collect();
        assert_eq!(live.len(), 3, "One high-level state per distinct successor");
        assert_eq!(live.iter().filter(|p| **p == root_path).count(), 1, "Exactly one keeps the path id");

        let events = executor.take_events();
        let forks: Vec<&HighLevelEvent> = events
            .iter()
            .filter(|e| matches!(e, HighLevelEvent::Forked { .. }))
            .collect();
        assert_eq!(forks.len(), 1, "One fork notification names all participants");
        if let HighLevelEvent::Forked { state, forks } = forks[0] {
            assert_eq!(*state, root_path);
            assert_eq!(forks.len(), 2);
        }
        for state in [StateId(0), StateId(1), StateId(2)] {
            let path = executor.path_of(state).unwrap();
            assert_eq!(executor.backing_states(path), vec![state]);
        }
    }

    #[test]
    fn test_plain_step_follows_single_successor() {
        let mut executor = executor();
        let path = executor.create_state(StateId(0)).unwrap();
        executor.step_state(StateId(0), 0x10).unwrap();
        executor.step_state(StateId(0), 0x14).unwrap();

        let stepped: Vec<u64> = executor
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                HighLevelEvent::Stepped { state, hlpc } if state == path => Some(hlpc),
                _ => None,
            })
            .collect();
        assert_eq!(stepped, vec![0x10, 0x14]);
        assert_eq!(executor.backing_states(path), vec![StateId(0)]);
        assert_eq!(executor.tree().len(), 1, "Passed segments are freed");
    }

    #[test]
    fn test_kill_when_last_state_terminates() {
        let mut executor = executor();
        let path = executor.create_state(StateId(0)).unwrap();
        executor.step_state(StateId(0), 0x10).unwrap();
        executor.terminate_state(StateId(0)).unwrap();

        let events = executor.take_events();
        assert!(events.contains(&HighLevelEvent::Killed { state: path }));
        assert_eq!(executor.selected(), None);
        assert!(executor.tree().is_empty(), "All segments are freed");
    }

    #[test]
    fn test_lagging_state_keeps_high_level_state() {
        let mut executor = executor();
        let path = executor.create_state(StateId(0)).unwrap();
        executor.clone_state(StateId(0), StateId(1)).unwrap();
        executor.step_state(StateId(0), 0x10).unwrap();

        // StateId(1) still backs the root segment
        assert_eq!(executor.backing_states(path), vec![StateId(1)]);
        assert!(!executor
            .take_events()
            .iter()
            .any(|e| matches!(e, HighLevelEvent::Stepped { .. })));

        executor.step_state(StateId(1), 0x10).unwrap();
        assert_eq!(executor.backing_states(path), vec![StateId(0), StateId(1)]);
    }

    #[test]
    fn test_unknown_state_is_an_error() {
        let mut executor = executor();
        assert!(executor.step_state(StateId(3), 0x10).is_err());
        assert!(executor.terminate_state(StateId(3)).is_err());
    }
}
