//! Error types for path scheduling

use bytecode_tracer::StateId;
use thiserror::Error;

use crate::segment::PathId;

/// Internal-logic failures of the path trees and strategies
///
/// None of these can be triggered by guest behavior; each one means the
/// bookkeeping of the scheduler is inconsistent and execution must stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("low-level state {0} is not tracked")]
    UnknownState(StateId),

    #[error("high-level state {0} is not tracked")]
    UnknownPath(PathId),

    #[error("path segment {0} was freed while still referenced")]
    DanglingSegment(String),

    #[error("topologic node {0} was freed while still referenced")]
    DanglingNode(String),

    #[error("path id {0} is already used by another high-level state")]
    PathIdCollision(PathId),

    #[error("forked segment of {0} has no successor on its own path")]
    MissingPathSuccessor(PathId),

    #[error("topologic position ({to_bb}, {to_ci}) does not follow ({from_bb}, {from_ci})")]
    TopologicOrder {
        from_bb: i64,
        from_ci: u32,
        to_bb: i64,
        to_ci: u32,
    },

    #[error("high-level state {0} was added twice")]
    StateAlreadyAdded(PathId),

    #[error("high-level state {0} is not registered with the strategy")]
    StateNotRegistered(PathId),
}
