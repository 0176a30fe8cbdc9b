//! Path Scheduler - Two-level path tracking and scheduling
//!
//! This crate decides which execution context of a symbolic execution host
//! runs next, so that exploration advances one bytecode-level path at a time.
//!
//! # Overview
//!
//! * [`segment`] stores the bytecode paths seen so far as a trie keyed by
//!   bytecode PC values.
//! * [`executor`] moves high-level states along that trie, forking and
//!   killing them as their low-level states diverge or terminate.
//! * [`strategy`] picks the high-level state to explore.
//! * [`topology`] and [`low_level`] index native positions to merge
//!   reconverged contexts and to find a context realizing the selected path.
//! * [`scheduler`] ties all of it together behind the searcher contract of
//!   the host.
//!
//! # Usage
//!
//! ```
//! use bytecode_tracer::StateId;
//! use path_scheduler::{Scheduler, SchedulerConfig, Searcher};
//!
//! let mut scheduler = Scheduler::new(&SchedulerConfig::default(), ());
//! scheduler.update(None, &[StateId(0)], &[]);
//! scheduler.on_bytecode_pc(StateId(0), 0x40).unwrap();
//!
//! assert!(scheduler.target().is_some());
//! assert_eq!(scheduler.select_state(), Some(StateId(0)));
//! ```

pub mod arena;
pub mod error;
pub mod executor;
pub mod low_level;
pub mod scheduler;
pub mod segment;
pub mod strategy;
pub mod topology;

pub use error::SchedulerError;
pub use executor::{HighLevelEvent, HighLevelExecutor};
pub use low_level::{
    DfsSearcher, ExecutionHost, LowLevelStrategy, LowLevelTopoStrategy, Merge, Searcher, SproutStrategy,
};
pub use scheduler::{Control, LowLevelKind, Scheduler, SchedulerConfig};
pub use segment::{PathId, PathTree, SegmentId};
pub use strategy::{HighLevelStrategy, StrategyKind};
pub use topology::{NodeId, TopologicTree};

/// Result type for scheduling operations
pub type Result<T> = anyhow::Result<T>;
