//! Error types for the explorer

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExplorerError {
    #[error("no interpreter structure has been detected or loaded")]
    NoStructure,
}
