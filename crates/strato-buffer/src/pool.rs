//! Buffer pool: node registry with atomic byte accounting and eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use strato_common::constants::DEFAULT_POOL_CAPACITY;

use crate::error::{BufferError, BufferResult};
use crate::handle::NodeHandle;
use crate::node::{BufferKind, BufferNode};

/// Point-in-time counters for a buffer pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Successful loads.
    pub loads: u64,
    /// Nodes evicted to make room.
    pub evictions: u64,
    /// Bytes currently accounted.
    pub used: u64,
    /// Pool capacity in bytes.
    pub capacity: u64,
}

/// The buffer pool tracks registered nodes and enforces a byte budget.
///
/// The underlying allocator is process-wide with atomic accounting; the
/// pool never takes a lock around load/unload - node state machines do
/// the synchronization.
pub struct BufferPool {
    capacity: u64,
    used: AtomicU64,
    nodes: RwLock<HashMap<u64, Arc<BufferNode>>>,
    next_id: AtomicU64,
    load_count: AtomicU64,
    eviction_count: AtomicU64,
}

impl BufferPool {
    /// Creates a pool with the given byte capacity.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            load_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
        }
    }

    /// Registers a new node with the pool and returns it.
    pub fn register(&self, capacity: u64, kind: BufferKind, spillable: bool) -> Arc<BufferNode> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let node = Arc::new(BufferNode::new(id, capacity, kind, spillable));
        self.nodes.write().insert(id, Arc::clone(&node));
        node
    }

    /// Loads a payload into a node, driving the full CAS protocol.
    ///
    /// Reserves pool bytes first, evicting unloadable spillable nodes if
    /// over budget. If this task loses the `prepare_load` race the load is
    /// simply skipped (another task owns it) and `Ok(false)` is returned;
    /// `Ok(true)` means this call performed the load.
    pub fn load(&self, node: &Arc<BufferNode>, payload: Vec<u8>) -> BufferResult<bool> {
        if node.is_closed() {
            return Err(BufferError::Closed { id: node.id() });
        }
        if !node.prepare_load() {
            return Ok(false);
        }

        if let Err(e) = self.reserve(node.capacity()) {
            node.rollback_load()?;
            return Err(e);
        }

        match node.commit_load(payload) {
            Ok(()) => {
                self.load_count.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.release(node.capacity());
                node.rollback_load()?;
                Err(e)
            }
        }
    }

    /// Unloads a node if it is unloadable, returning its bytes to the pool.
    pub fn unload(&self, node: &BufferNode) -> bool {
        if node.try_unload() {
            self.release(node.capacity());
            true
        } else {
            false
        }
    }

    /// Pins a node, returning an RAII handle.
    pub fn pin(&self, node: Arc<BufferNode>) -> NodeHandle {
        NodeHandle::new(node)
    }

    /// Retires a node: cleans it and removes it from the registry.
    pub fn drop_node(&self, node: &BufferNode) -> BufferResult<()> {
        let was_loaded = node.state() == crate::node::NodeState::Loaded;
        node.clean()?;
        if was_loaded {
            self.release(node.capacity());
        }
        self.nodes.write().remove(&node.id());
        Ok(())
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            loads: self.load_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            used: self.used.load(Ordering::Acquire),
            capacity: self.capacity,
        }
    }

    /// Reserves `bytes` against the pool budget, evicting as needed.
    fn reserve(&self, bytes: u64) -> BufferResult<()> {
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used + bytes <= self.capacity {
                if self
                    .used
                    .compare_exchange(used, used + bytes, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if !self.evict_one() {
                return Err(BufferError::CapacityExceeded {
                    requested: bytes,
                    used,
                    capacity: self.capacity,
                });
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Evicts one spillable, unloadable node. Non-spillable nodes (for
    /// example in-progress write buffers) are pinned and never considered.
    fn evict_one(&self) -> bool {
        let candidates: Vec<Arc<BufferNode>> = {
            let nodes = self.nodes.read();
            nodes
                .values()
                .filter(|n| n.is_spillable() && n.unloadable())
                .cloned()
                .collect()
        };
        for node in candidates {
            if node.try_unload() {
                self.release(node.capacity());
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node = node.id(), "evicted buffer node");
                return true;
            }
        }
        false
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
