//! RAII handle over a buffer node reference.

use std::sync::Arc;

use crate::node::BufferNode;

/// A counted reference to a buffer node.
///
/// Acquiring the handle increments the node's reference count; dropping
/// it decrements. While a handle is live the node cannot be unloaded or
/// cleaned.
pub struct NodeHandle {
    node: Arc<BufferNode>,
}

impl NodeHandle {
    /// Acquires a handle, taking a reference on the node.
    pub fn new(node: Arc<BufferNode>) -> Self {
        node.node_ref();
        Self { node }
    }

    /// Returns the node identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.node.id()
    }

    /// Returns the node's iteration counter at this moment.
    #[inline]
    pub fn iteration(&self) -> u64 {
        self.node.iteration()
    }

    /// Returns the underlying node.
    #[inline]
    pub fn node(&self) -> &Arc<BufferNode> {
        &self.node
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if !self.node.node_unref() {
            debug_assert!(false, "node handle dropped with refs already at 0");
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id())
            .field("refs", &self.node.refs())
            .finish()
    }
}
