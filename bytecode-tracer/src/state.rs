//! Execution context identities and per-context analysis storage
//!
//! The host engine owns the actual execution contexts. Every analysis in this
//! crate only refers to them through a [`StateId`] handle, and keeps its own
//! per-context data in a [`PerState`] map that follows the host's fork and
//! kill notifications.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Handle of one low-level execution context owned by the host engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Per-state analysis storage
///
/// Entries are created lazily on first access, cloned into every child when
/// the host forks a state and dropped when the host kills it. The most
/// recently accessed state is remembered, which in a single execution stream
/// is the state the host is currently running.
#[derive(Debug, Clone)]
pub struct PerState<T> {
    states: HashMap<StateId, T>,
    last_used: Option<StateId>,
}

impl<T> PerState<T> {
    /// Create empty storage
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            last_used: None,
        }
    }

    /// Get the entry of `state`, creating it with `init` when missing
    pub fn get_or_insert_with(&mut self, state: StateId, init: impl FnOnce() -> T) -> &mut T {
        self.last_used = Some(state);
        self.states.entry(state).or_insert_with(init)
    }

    /// Get the entry of `state` if it exists
    pub fn get(&self, state: StateId) -> Option<&T> {
        self.states.get(&state)
    }

    /// Get the entry of `state` mutably if it exists
    pub fn get_mut(&mut self, state: StateId) -> Option<&mut T> {
        if self.states.contains_key(&state) {
            self.last_used = Some(state);
        }
        self.states.get_mut(&state)
    }

    /// Install an entry for `state`, replacing any previous one
    pub fn insert(&mut self, state: StateId, value: T) {
        self.states.insert(state, value);
    }

    /// Drop the entry of a killed state
    pub fn remove(&mut self, state: StateId) -> Option<T> {
        if self.last_used == Some(state) {
            self.last_used = None;
        }
        self.states.remove(&state)
    }

    /// Check whether `state` has an entry
    pub fn contains(&self, state: StateId) -> bool {
        self.states.contains_key(&state)
    }

    /// The state that was accessed last, if it is still alive
    pub fn last_used(&self) -> Option<StateId> {
        self.last_used
    }

    /// Number of tracked states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no state is tracked
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Iterate over all tracked states
    pub fn iter(&self) -> impl Iterator<Item = (StateId, &T)> {
        self.states.iter().map(|(id, value)| (*id, value))
    }

    /// Iterate mutably over all tracked states
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (StateId, &mut T)> {
        self.states.iter_mut().map(|(id, value)| (*id, value))
    }
}

impl<T: Clone> PerState<T> {
    /// Copy the entry of `parent` into every new child of a fork
    ///
    /// Returns the number of children that received a copy. Nothing happens
    /// when the parent has no entry: the children will be initialized lazily.
    pub fn fork(&mut self, parent: StateId, children: &[StateId]) -> usize {
        let Some(entry) = self.states.get(&parent).cloned() else {
            return 0;
        };
        let mut copied = 0;
        for &child in children.iter().filter(|&&child| child != parent) {
            if self.states.insert(child, entry.clone()).is_some() {
                tracing::warn!("State {} forked into already tracked state {}", parent, child);
            }
            copied += 1;
        }
        copied
    }
}

impl<T> Default for PerState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_and_fork() {
        let mut map: PerState<Vec<u32>> = PerState::new();
        map.get_or_insert_with(StateId(1), Vec::new).push(7);

        let copied = map.fork(StateId(1), &[StateId(1), StateId(2), StateId(3)]);
        assert_eq!(copied, 2, "The parent itself must not be counted as a child");
        assert_eq!(map.get(StateId(3)), Some(&vec![7]));

        map.get_mut(StateId(2)).unwrap().push(8);
        assert_eq!(map.get(StateId(1)), Some(&vec![7]), "Forked entries must be independent");
    }

    #[test]
    fn test_remove_clears_last_used() {
        let mut map: PerState<u32> = PerState::new();
        map.get_or_insert_with(StateId(4), || 1);
        assert_eq!(map.last_used(), Some(StateId(4)));

        assert_eq!(map.remove(StateId(4)), Some(1));
        assert_eq!(map.last_used(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_fork_of_unknown_parent() {
        let mut map: PerState<u32> = PerState::new();
        assert_eq!(map.fork(StateId(9), &[StateId(10)]), 0);
        assert!(!map.contains(StateId(10)));
    }
}
