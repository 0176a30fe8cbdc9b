//! High-level path selection strategies

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::SchedulerError;
use crate::segment::PathId;
use crate::Result;

/// Chooses which high-level state to explore next
///
/// The executor reports every change of the high-level state set:
/// `add_states` after a creation or a fork (with the forking state as
/// `current`), `update_state` after a plain step and `kill_state` when a path
/// ends.
pub trait HighLevelStrategy {
    fn add_states(&mut self, current: Option<PathId>, states: &[PathId]) -> Result<()>;

    fn kill_state(&mut self, state: PathId) -> Result<()>;

    fn update_state(&mut self, state: PathId) -> Result<()>;

    fn select_state(&mut self) -> Option<PathId>;
}

/// A set of states with a selection policy
pub trait Selector {
    /// Insert or refresh `state`; returns whether it was newly inserted
    fn update(&mut self, state: PathId) -> bool;

    /// Returns whether `state` was present
    fn remove(&mut self, state: PathId) -> bool;

    fn select(&mut self) -> Option<PathId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Depth-first: always the most recently inserted state
#[derive(Debug, Default)]
pub struct DfsSelector {
    states: Vec<PathId>,
}

impl Selector for DfsSelector {
    fn update(&mut self, state: PathId) -> bool {
        if self.states.contains(&state) {
            return false;
        }
        self.states.push(state);
        true
    }

    fn remove(&mut self, state: PathId) -> bool {
        match self.states.iter().position(|s| *s == state) {
            Some(position) => {
                self.states.remove(position);
                true
            }
            None => false,
        }
    }

    fn select(&mut self) -> Option<PathId> {
        self.states.last().copied()
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Uniformly random state on every selection, reproducible through the seed
#[derive(Debug)]
pub struct RandomSelector {
    states: Vec<PathId>,
    rng: StdRng,
}

impl RandomSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            states: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Selector for RandomSelector {
    fn update(&mut self, state: PathId) -> bool {
        if self.states.contains(&state) {
            return false;
        }
        self.states.push(state);
        true
    }

    fn remove(&mut self, state: PathId) -> bool {
        match self.states.iter().position(|s| *s == state) {
            Some(position) => {
                self.states.swap_remove(position);
                true
            }
            None => false,
        }
    }

    fn select(&mut self) -> Option<PathId> {
        self.states.choose(&mut self.rng).copied()
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Strategy delegating selection to a [`Selector`] and checking the
/// add/update/kill bookkeeping of the executor
#[derive(Debug, Default)]
pub struct SelectorStrategy<S> {
    selector: S,
}

impl<S: Selector> SelectorStrategy<S> {
    pub fn new(selector: S) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }
}

impl<S: Selector> HighLevelStrategy for SelectorStrategy<S> {
    fn add_states(&mut self, current: Option<PathId>, states: &[PathId]) -> Result<()> {
        if let Some(current) = current {
            if self.selector.update(current) {
                return Err(SchedulerError::StateNotRegistered(current).into());
            }
        }
        for &state in states {
            if !self.selector.update(state) {
                return Err(SchedulerError::StateAlreadyAdded(state).into());
            }
        }
        Ok(())
    }

    fn kill_state(&mut self, state: PathId) -> Result<()> {
        if !self.selector.remove(state) {
            return Err(SchedulerError::StateNotRegistered(state).into());
        }
        Ok(())
    }

    fn update_state(&mut self, state: PathId) -> Result<()> {
        if self.selector.update(state) {
            return Err(SchedulerError::StateNotRegistered(state).into());
        }
        Ok(())
    }

    fn select_state(&mut self) -> Option<PathId> {
        self.selector.select()
    }
}

/// Which high-level strategy to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    /// Follow the most recently forked path
    #[default]
    Dfs,
    /// Pick a random path on every selection
    Random { seed: u64 },
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn HighLevelStrategy> {
        match self {
            StrategyKind::Dfs => Box::new(SelectorStrategy::new(DfsSelector::default())),
            StrategyKind::Random { seed } => Box::new(SelectorStrategy::new(RandomSelector::new(seed))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dfs_selects_latest_fork() {
        let mut strategy = StrategyKind::Dfs.build();
        strategy.add_states(None, &[PathId(0)]).unwrap();
        strategy.add_states(Some(PathId(0)), &[PathId(1), PathId(2)]).unwrap();
        assert_eq!(strategy.select_state(), Some(PathId(2)));

        strategy.kill_state(PathId(2)).unwrap();
        assert_eq!(strategy.select_state(), Some(PathId(1)));
        strategy.update_state(PathId(1)).unwrap();
        assert_eq!(strategy.select_state(), Some(PathId(1)), "Stepping keeps the order");
    }

    #[test]
    fn test_bookkeeping_violations() {
        let mut strategy = SelectorStrategy::new(DfsSelector::default());
        strategy.add_states(None, &[PathId(0)]).unwrap();

        assert!(strategy.add_states(None, &[PathId(0)]).is_err(), "Double add");
        assert!(strategy.update_state(PathId(7)).is_err(), "Update of an unknown state");
        strategy.kill_state(PathId(0)).unwrap();
        assert!(strategy.kill_state(PathId(0)).is_err(), "Double kill");
        assert_eq!(strategy.select_state(), None);
    }

    #[test]
    fn test_random_selector_is_reproducible() {
        let picks = |seed| {
            let mut selector = RandomSelector::new(seed);
            for id in 0..8 {
                selector.update(PathId(id));
            }
            (0..16).map(|_| selector.select()).collect::<Vec<_>>()
        };
        assert_eq!(picks(42), picks(42));
        assert!(picks(42).iter().all(|pick| pick.map_or(false, |p| p.0 < 8)));
    }
}
