//! Buffer node - a state-machine-driven cache entry for a memory page.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{BufferError, BufferResult};

/// Lifecycle state of a buffer node.
///
/// ```text
/// Unload --CAS--> Loading --ok--> Commit --> Loaded
///                     \--err--> Rollback --> Unload
/// Loaded  --refs==0, CAS--> Unloading --> Unload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeState {
    /// No payload resident.
    Unload = 0,
    /// A task owns the load; exactly one transitioner.
    Loading = 1,
    /// A failed load is being undone.
    Rollback = 2,
    /// A successful load is being published.
    Commit = 3,
    /// The payload is being dropped.
    Unloading = 4,
    /// Payload resident and readable.
    Loaded = 5,
}

impl NodeState {
    fn from_u32(v: u32) -> NodeState {
        match v {
            0 => NodeState::Unload,
            1 => NodeState::Loading,
            2 => NodeState::Rollback,
            3 => NodeState::Commit,
            4 => NodeState::Unloading,
            5 => NodeState::Loaded,
            _ => panic!("unsupported node state: {}", v),
        }
    }
}

/// Runtime state of a buffer node, orthogonal to the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RtState {
    /// The node participates in the pool.
    Running = 0,
    /// The node has been retired.
    Closed = 1,
}

/// Sizing discipline of a buffer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Fixed-capacity page; payloads must fit `capacity`.
    StaticSized,
    /// Growable page; `capacity` is an accounting hint.
    DynamicSized,
}

/// A reference-counted cache entry for a memory page.
///
/// The lifecycle word, runtime word, and reference count are all atomics;
/// every transition is a compare-and-swap so that exactly one task owns
/// each transition.
pub struct BufferNode {
    id: u64,
    state: AtomicU32,
    rt_state: AtomicU32,
    refs: AtomicU64,
    /// Monotonic witness that the payload has been reloaded; bumped once
    /// per successful commit.
    iteration: AtomicU64,
    capacity: u64,
    kind: BufferKind,
    spillable: bool,
    data: RwLock<Option<Vec<u8>>>,
}

impl BufferNode {
    /// Creates a new node in the `Unload` state.
    pub fn new(id: u64, capacity: u64, kind: BufferKind, spillable: bool) -> Self {
        Self {
            id,
            state: AtomicU32::new(NodeState::Unload as u32),
            rt_state: AtomicU32::new(RtState::Running as u32),
            refs: AtomicU64::new(0),
            iteration: AtomicU64::new(0),
            capacity,
            kind,
            spillable,
            data: RwLock::new(None),
        }
    }

    /// Returns the node identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current lifecycle state.
    #[inline]
    pub fn state(&self) -> NodeState {
        NodeState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Returns the node capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the sizing discipline.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Returns true if the pool may evict this node under pressure.
    #[inline]
    pub fn is_spillable(&self) -> bool {
        self.spillable
    }

    /// Returns the current iteration counter.
    #[inline]
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Returns true if the runtime state is `Closed`.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.rt_state.load(Ordering::Acquire) == RtState::Closed as u32
    }

    /// Attempts the `Unload` -> `Loading` transition.
    ///
    /// Returns true iff the CAS succeeded; the winning caller must follow
    /// with [`commit_load`](Self::commit_load) or
    /// [`rollback_load`](Self::rollback_load).
    pub fn prepare_load(&self) -> bool {
        self.cas_state(NodeState::Unload, NodeState::Loading)
    }

    /// Publishes a loaded payload: `Loading` -> `Commit` -> `Loaded`.
    ///
    /// Bumps the iteration counter once per successful commit. Fails
    /// without changing state if the caller does not own the load or the
    /// payload does not fit a static-sized node; the caller must then
    /// roll back.
    pub fn commit_load(&self, payload: Vec<u8>) -> BufferResult<()> {
        if matches!(self.kind, BufferKind::StaticSized) && payload.len() as u64 > self.capacity {
            return Err(BufferError::PayloadTooLarge {
                requested: payload.len() as u64,
                capacity: self.capacity,
            });
        }
        if !self.cas_state(NodeState::Loading, NodeState::Commit) {
            return Err(BufferError::InvalidTransition {
                id: self.id,
                from: self.state(),
            });
        }
        *self.data.write() = Some(payload);
        self.iteration.fetch_add(1, Ordering::AcqRel);
        self.store_state(NodeState::Loaded);
        Ok(())
    }

    /// Undoes a failed load: `Loading` -> `Rollback` -> `Unload`.
    pub fn rollback_load(&self) -> BufferResult<()> {
        if !self.cas_state(NodeState::Loading, NodeState::Rollback) {
            return Err(BufferError::InvalidTransition {
                id: self.id,
                from: self.state(),
            });
        }
        *self.data.write() = None;
        self.store_state(NodeState::Unload);
        Ok(())
    }

    /// Increments the reference count.
    #[inline]
    pub fn node_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count.
    ///
    /// Returns true iff the pre-decrement count was greater than zero;
    /// callers use false to detect a double release.
    pub fn node_unref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                refs.checked_sub(1)
            })
            .is_ok()
    }

    /// Returns true if any references are outstanding.
    #[inline]
    pub fn has_ref(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }

    /// Returns the current reference count.
    #[inline]
    pub fn refs(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Returns true iff the node is `Loaded` with no outstanding refs.
    pub fn unloadable(&self) -> bool {
        !self.has_ref() && self.state() == NodeState::Loaded
    }

    /// Attempts to drop the payload: `Loaded` -> `Unloading` -> `Unload`.
    ///
    /// Returns true iff this caller performed the unload. A failed CAS
    /// means another task owns the transition or a reference appeared.
    pub fn try_unload(&self) -> bool {
        if !self.unloadable() {
            return false;
        }
        if !self.cas_state(NodeState::Loaded, NodeState::Unloading) {
            return false;
        }
        *self.data.write() = None;
        self.store_state(NodeState::Unload);
        true
    }

    /// Retires the node: marks the runtime state `Closed`.
    pub fn close(&self) {
        self.rt_state
            .store(RtState::Closed as u32, Ordering::Release);
    }

    /// Releases the backing buffer and retires the node.
    ///
    /// Fails if references are outstanding.
    pub fn clean(&self) -> BufferResult<()> {
        let refs = self.refs();
        if refs > 0 {
            return Err(BufferError::Pinned { id: self.id, refs });
        }
        *self.data.write() = None;
        self.store_state(NodeState::Unload);
        self.close();
        Ok(())
    }

    /// Returns a read guard over the payload.
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Option<Vec<u8>>> {
        self.data.read()
    }

    #[inline]
    fn cas_state(&self, from: NodeState, to: NodeState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn store_state(&self, state: NodeState) {
        self.state.store(state as u32, Ordering::Release);
    }
}

impl std::fmt::Debug for BufferNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferNode")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("refs", &self.refs())
            .field("iteration", &self.iteration())
            .field("capacity", &self.capacity)
            .field("kind", &self.kind)
            .field("spillable", &self.spillable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_node() -> BufferNode {
        BufferNode::new(1, 4096, BufferKind::StaticSized, true)
    }

    #[test]
    fn test_initial_state() {
        let node = test_node();
        assert_eq!(node.state(), NodeState::Unload);
        assert!(!node.is_closed());
        assert_eq!(node.refs(), 0);
        assert_eq!(node.iteration(), 0);
    }

    #[test]
    fn test_load_commit() {
        let node = test_node();
        assert!(node.prepare_load());
        // The load is owned; a second prepare must lose.
        assert!(!node.prepare_load());

        node.commit_load(vec![1, 2, 3]).unwrap();
        assert_eq!(node.state(), NodeState::Loaded);
        assert_eq!(node.iteration(), 1);
        assert_eq!(node.read_data().as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_load_rollback() {
        let node = test_node();
        assert!(node.prepare_load());
        node.rollback_load().unwrap();
        assert_eq!(node.state(), NodeState::Unload);
        assert_eq!(node.iteration(), 0);
        // The node is loadable again.
        assert!(node.prepare_load());
    }

    #[test]
    fn test_commit_without_prepare() {
        let node = test_node();
        assert!(matches!(
            node.commit_load(vec![0]),
            Err(BufferError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_oversized_payload() {
        let node = BufferNode::new(2, 2, BufferKind::StaticSized, true);
        assert!(node.prepare_load());
        assert!(matches!(
            node.commit_load(vec![0; 8]),
            Err(BufferError::PayloadTooLarge { .. })
        ));
        // State is still Loading; rollback completes the protocol.
        assert_eq!(node.state(), NodeState::Loading);
        node.rollback_load().unwrap();
    }

    #[test]
    fn test_dynamic_sized_allows_growth() {
        let node = BufferNode::new(3, 2, BufferKind::DynamicSized, true);
        assert!(node.prepare_load());
        node.commit_load(vec![0; 64]).unwrap();
        assert_eq!(node.state(), NodeState::Loaded);
    }

    #[test]
    fn test_ref_unref() {
        let node = test_node();
        node.node_ref();
        node.node_ref();
        assert_eq!(node.refs(), 2);
        assert!(node.node_unref());
        assert!(node.node_unref());
        // Double release is detected, not wrapped around.
        assert!(!node.node_unref());
        assert_eq!(node.refs(), 0);
    }

    #[test]
    fn test_unloadable() {
        let node = test_node();
        assert!(!node.unloadable());

        node.prepare_load();
        node.commit_load(vec![0; 16]).unwrap();
        assert!(node.unloadable());

        node.node_ref();
        assert!(!node.unloadable());
        node.node_unref();
        assert!(node.unloadable());
    }

    #[test]
    fn test_try_unload() {
        let node = test_node();
        node.prepare_load();
        node.commit_load(vec![0; 16]).unwrap();

        assert!(node.try_unload());
        assert_eq!(node.state(), NodeState::Unload);
        assert!(node.read_data().is_none());
        assert!(!node.try_unload());
    }

    #[test]
    fn test_clean() {
        let node = test_node();
        node.node_ref();
        assert!(matches!(node.clean(), Err(BufferError::Pinned { .. })));
        node.node_unref();
        node.clean().unwrap();
        assert!(node.is_closed());
    }

    #[test]
    fn test_iteration_counts_reloads() {
        let node = test_node();
        for expected in 1..=3u64 {
            assert!(node.prepare_load());
            node.commit_load(vec![0; 8]).unwrap();
            assert_eq!(node.iteration(), expected);
            assert!(node.try_unload());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_prepare_load_single_winner() {
        let node = Arc::new(test_node());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let node = Arc::clone(&node);
            handles.push(tokio::spawn(async move { node.prepare_load() }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        node.commit_load(vec![0; 8]).unwrap();

        // All tasks ref then unref; the node settles at Loaded with no refs.
        let mut handles = Vec::new();
        for _ in 0..10 {
            let node = Arc::clone(&node);
            handles.push(tokio::spawn(async move {
                node.node_ref();
                assert!(node.node_unref());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(node.state(), NodeState::Loaded);
        assert_eq!(node.refs(), 0);
    }
}
