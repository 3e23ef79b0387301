//! Buffer pool error types.

use thiserror::Error;

use crate::node::NodeState;

/// Result type for buffer operations.
pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// Errors from buffer node and pool operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The node is still referenced and cannot be released.
    #[error("node {id} is pinned ({refs} refs)")]
    Pinned {
        /// Node identifier.
        id: u64,
        /// Outstanding reference count.
        refs: u64,
    },

    /// The requested state transition is not legal from the current state.
    #[error("node {id}: invalid transition from {from:?}")]
    InvalidTransition {
        /// Node identifier.
        id: u64,
        /// The state the node was observed in.
        from: NodeState,
    },

    /// The node's runtime state is closed.
    #[error("node {id} is closed")]
    Closed {
        /// Node identifier.
        id: u64,
    },

    /// The payload exceeds the node's capacity.
    #[error("payload of {requested} bytes exceeds node capacity {capacity}")]
    PayloadTooLarge {
        /// Requested payload size.
        requested: u64,
        /// Node capacity.
        capacity: u64,
    },

    /// The pool cannot reserve the requested bytes, even after eviction.
    #[error("pool capacity exceeded: requested {requested}, used {used} of {capacity}")]
    CapacityExceeded {
        /// Requested bytes.
        requested: u64,
        /// Bytes currently accounted.
        used: u64,
        /// Pool capacity.
        capacity: u64,
    },
}
