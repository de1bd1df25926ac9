//! Error types for the block-monitoring pipeline.

use thiserror::Error;

/// Errors that can occur while following the chain and deriving state.
///
/// Payloads are plain strings and numbers so the error can be cloned onto
/// broadcast channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// Transport-level failure talking to the block source (connection, HTTP).
    #[error("block source error: {0}")]
    Source(String),

    #[error("operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The block source does not know the requested block.
    #[error("block {hash} not found at the block source")]
    BlockNotFound { hash: String },

    /// The block cache does not hold the requested block.
    #[error("block {hash} is not in the block cache")]
    UnknownBlock { hash: String },

    #[error("cannot attach block {number} ({hash}): parent {parent_hash} is unknown")]
    OrphanBlock {
        hash: String,
        number: u64,
        parent_hash: String,
    },

    #[error("no common ancestor of {left} and {right} within the retained window")]
    UnknownAncestor { left: String, right: String },

    #[error("reorg at block {head_number} ({head_hash}) is deeper than the maximum depth of {max_depth}")]
    ReorgTooDeep {
        head_hash: String,
        head_number: u64,
        max_depth: u64,
    },

    #[error("component '{name}' is already registered")]
    DuplicateComponent { name: String },

    #[error("components cannot be added while the machine is running")]
    MachineRunning,

    #[error("the block processor has no head; start it first")]
    NotStarted,

    #[error("component '{component}' failed: {reason}")]
    Component { component: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl WatchError {
    /// Returns `true` for transient failures that are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Timeout { .. })
    }

    /// Returns `true` if the error marks a reorg beyond the retained window.
    pub fn is_reorg_too_deep(&self) -> bool {
        matches!(self, Self::ReorgTooDeep { .. })
    }
}
