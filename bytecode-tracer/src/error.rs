//! Error types for low-level signal processing

use thiserror::Error;

use crate::state::StateId;

/// Errors raised while reconstructing native and high-level execution structure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TracerError {
    /// A call pushed a frame whose stack pointer is not strictly below the
    /// bottom of its parent. The call-stack heuristic has lost track of the
    /// real control flow and no recovery is attempted.
    #[error(
        "stack desynchronized in state {state}: call {call_site:#x} -> {function:#x} \
         with sp={sp:#x} is not below parent bottom {parent_bottom:#x}"
    )]
    StackDesync {
        state: StateId,
        call_site: u64,
        function: u64,
        sp: u64,
        parent_bottom: u64,
    },

    /// A syscall range was registered with `lower >= upper`
    #[error("invalid syscall range [{lower:#x}, {upper:#x})")]
    InvalidSyscallRange { lower: u64, upper: u64 },

    /// A syscall range handle that is not registered was deregistered
    #[error("syscall range {0} is not registered")]
    UnknownSyscallRange(usize),

    /// A guest payload was shorter than its descriptor layout
    #[error("truncated {what} payload: expected {expected} bytes, got [{payload}]")]
    TruncatedPayload {
        what: &'static str,
        expected: usize,
        payload: String,
    },

    /// The guest passed a thread name that is not valid UTF-8
    #[error("thread name is not valid UTF-8")]
    InvalidThreadName,
}

impl TracerError {
    /// Builds a [`TracerError::TruncatedPayload`] carrying a hex dump of the payload
    pub fn truncated(what: &'static str, expected: usize, payload: &[u8]) -> Self {
        Self::TruncatedPayload {
            what,
            expected,
            payload: hex::encode(payload),
        }
    }
}
