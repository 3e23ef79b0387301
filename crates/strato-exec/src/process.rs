//! Per-scope process context: cancellation, inboxes, memory accounting.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use strato_common::constants::WAIT_REGISTER_CAPACITY;
use strato_common::{Batch, SnapshotId, StratoError, StratoResult, Timestamp};

/// A cancellation token shared by one scope tree.
///
/// Cancelling wakes every waiter; producers observe send failure,
/// consumers observe closed inboxes, and readers observe the flag on
/// their next poll.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancels the token, waking all waiters. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns true if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The consumer half of a sibling-to-parent inbox.
///
/// A wait register pairs a bounded batch channel (capacity 1) with the
/// scope tree's cancellation token. The producer half is a plain channel
/// sender held by the sibling's connector instruction.
pub struct WaitRegister {
    rx: mpsc::Receiver<Batch>,
    cancel: CancelToken,
}

impl WaitRegister {
    /// Allocates a register, returning the producer sender and the
    /// consumer half.
    pub fn new(cancel: CancelToken) -> (mpsc::Sender<Batch>, WaitRegister) {
        let (tx, rx) = mpsc::channel(WAIT_REGISTER_CAPACITY);
        (tx, WaitRegister { rx, cancel })
    }

    /// Returns the cancellation token threaded through this register.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Receives the next batch; `None` once the producer is done.
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }
}

impl Stream for WaitRegister {
    type Item = Batch;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Batch>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for WaitRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitRegister")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Process-wide memory accounting with per-scope handles.
///
/// Each scope holds an `Arc` onto the same tracker, so sibling scopes
/// share one budget family while the counter itself stays atomic.
#[derive(Debug)]
pub struct MemTracker {
    limit: u64,
    used: AtomicU64,
}

impl MemTracker {
    /// Creates a tracker with a byte limit; a limit of zero means
    /// unlimited.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Creates an unlimited tracker.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserves `bytes`, failing when the budget would be exceeded.
    pub fn try_reserve(&self, bytes: u64) -> StratoResult<()> {
        loop {
            let used = self.used.load(Ordering::Acquire);
            let next = used.saturating_add(bytes);
            if self.limit != 0 && next > self.limit {
                return Err(StratoError::execution(format!(
                    "memory budget exceeded: requested {} with {} of {} in use",
                    bytes, used, self.limit
                )));
            }
            if self
                .used
                .compare_exchange(used, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Returns `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

/// Per-scope process context.
///
/// Carries the snapshot token, the query timestamp, the shard count used
/// by the parallel rewrite, the cancellation token, the memory handle,
/// and the merge inboxes wired by the parent scope.
#[derive(Debug)]
pub struct Proc {
    /// Snapshot the query reads under.
    pub snapshot: SnapshotId,
    /// Query timestamp.
    pub timestamp: Timestamp,
    /// Shard count for the parallel rewrite.
    pub parallelism: usize,
    /// Cancellation token for the scope tree.
    pub cancel: CancelToken,
    /// Memory accounting handle; the tracker is shared process-wide.
    pub mem: Arc<MemTracker>,
    /// Inboxes feeding this scope's merge pipeline.
    pub merge_receivers: Vec<WaitRegister>,
}

impl Proc {
    /// Creates a process context with the host's parallelism.
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            snapshot: SnapshotId::default(),
            timestamp: Timestamp::now(),
            parallelism,
            cancel: CancelToken::new(),
            mem: Arc::new(MemTracker::unlimited()),
            merge_receivers: Vec::new(),
        }
    }

    /// Overrides the shard count.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the snapshot token.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SnapshotId) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Sets the memory limit, replacing the tracker.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.mem = Arc::new(MemTracker::new(limit));
        self
    }

    /// Builds a sibling context: same snapshot, timestamp, parallelism,
    /// cancellation token, and memory family; no inboxes.
    pub fn derive(&self) -> Proc {
        Proc {
            snapshot: self.snapshot,
            timestamp: self.timestamp,
            parallelism: self.parallelism,
            cancel: self.cancel.clone(),
            mem: Arc::clone(&self.mem),
            merge_receivers: Vec::new(),
        }
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}
