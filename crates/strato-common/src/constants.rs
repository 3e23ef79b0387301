//! System-wide constants and limits.

/// Default number of rows targeted per batch.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Capacity of the bounded channel inside a wait register.
pub const WAIT_REGISTER_CAPACITY: usize = 1;

/// Size of a buffer node header in bytes.
pub const NODE_HEAD_SIZE: u64 = 32;

/// Total allocation size of a static-sized buffer node.
pub const NODE_ALLOC_SIZE: u64 = 256 * 1024;

/// Usable payload size of a static-sized buffer node.
pub const NODE_DATA_SIZE: u64 = NODE_ALLOC_SIZE - NODE_HEAD_SIZE;

/// Default buffer pool capacity in bytes.
pub const DEFAULT_POOL_CAPACITY: u64 = 256 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_sizes() {
        assert_eq!(NODE_DATA_SIZE, NODE_ALLOC_SIZE - NODE_HEAD_SIZE);
        assert!(NODE_HEAD_SIZE < NODE_ALLOC_SIZE);
    }
}
