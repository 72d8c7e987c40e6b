//! Grace-period scheduler: a min-heap of pending session expirations.
//!
//! One heap for every session instead of one timer task per disconnect:
//! memory stays proportional to the number of sessions actually in grace,
//! and tests drive expiration by moving a paused Tokio clock.
//!
//! # Cancellation
//!
//! [`GraceScheduler::schedule`] returns a [`CancelHandle`] sharing a flag
//! with the heap entry. Cancelling flips the flag; the entry is discarded
//! the next time it reaches the top of the heap. A cancel that loses the
//! race with a fire does nothing, and that is fine: the store's `expire`
//! is a no-op for any session that is no longer in grace.
//!
//! # Integration
//!
//! The gateway's expiration driver sits in a `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         _ = &mut shutdown => break,
//!         fired = scheduler.wait_due() => { /* expire each session */ }
//!     }
//! }
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use sboboz_protocol::SessionId;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::trace;

/// A fired expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub session_id: SessionId,
    pub deadline: Instant,
}

/// Cancels one scheduled expiration.
///
/// Cheap to clone; all clones cancel the same entry.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    seq: u64,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Marks the entry as cancelled. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Registration sequence number of the entry.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    session_id: SessionId,
    cancelled: Arc<AtomicBool>,
}

impl Entry {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// `BinaryHeap` is a max-heap, so the ordering is reversed: the earliest
// deadline compares greatest, and among equal deadlines the lowest
// sequence number does (FIFO).
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Pending expirations ordered by `(deadline, registration order)`.
pub struct GraceScheduler {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: AtomicU64,
    /// Wakes [`wait_due`](Self::wait_due) when the earliest deadline may
    /// have moved.
    wake: Notify,
}

impl GraceScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    /// Registers a one-shot expiration for `session_id` at `deadline`.
    pub fn schedule(&self, session_id: SessionId, deadline: Instant) -> CancelHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        trace!(%session_id, seq, "expiration scheduled");
        self.heap.lock().push(Entry {
            deadline,
            seq,
            session_id,
            cancelled: Arc::clone(&cancelled),
        });
        self.wake.notify_one();
        CancelHandle { seq, cancelled }
    }

    /// Best-effort removal of a scheduled expiration.
    pub fn cancel(&self, handle: &CancelHandle) {
        handle.cancel();
        // Drop it right away if it's at the top; otherwise it's skipped
        // when it gets there.
        let mut heap = self.heap.lock();
        Self::drop_cancelled_top(&mut heap);
    }

    /// Removes and returns every live entry with `deadline <= now`, earliest
    /// first, ties in registration order.
    pub fn pop_due(&self, now: Instant) -> Vec<Expiry> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(top) = heap.peek() {
            if top.is_cancelled() {
                heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            if let Some(entry) = heap.pop() {
                due.push(Expiry {
                    session_id: entry.session_id,
                    deadline: entry.deadline,
                });
            }
        }
        due
    }

    /// Earliest deadline among live entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.lock();
        Self::drop_cancelled_top(&mut heap);
        heap.peek().map(|e| e.deadline)
    }

    /// Number of live (not cancelled) entries.
    pub fn len(&self) -> usize {
        self.heap.lock().iter().filter(|e| !e.is_cancelled()).count()
    }

    /// Returns `true` if no live entries are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least one entry is due, then pops everything due.
    ///
    /// Sleeps until the earliest deadline; an entry scheduled meanwhile
    /// wakes the wait so an earlier deadline isn't overslept. Pends forever
    /// while the heap is empty, which `tokio::select!` handles fine.
    pub async fn wait_due(&self) -> Vec<Expiry> {
        loop {
            let due = self.pop_due(Instant::now());
            if !due.is_empty() {
                return due;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = time::sleep_until(deadline) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    fn drop_cancelled_top(heap: &mut BinaryHeap<Entry>) {
        while heap.peek().is_some_and(Entry::is_cancelled) {
            heap.pop();
        }
    }
}

impl Default for GraceScheduler {
    fn default() -> Self {
        Self::new()
    }
}
