/*!
 * Thread Handles and Parking
 *
 * Uses parking_lot_core for futex-like operations on all platforms.
 * On Linux, this maps directly to futex syscalls for minimal overhead.
 *
 * # Design
 *
 * Each thread lazily allocates one `ThreadHandle` (held in a thread-local,
 * shared via `Arc` with any queue node that names the thread). The handle's
 * address is the parking key, so no global table is needed.
 *
 * An `unpark` that races ahead of the matching `park` is remembered in a
 * one-shot notification token: the park validate callback refuses to sleep
 * while a token is pending. A wakeup is therefore never lost to that race.
 *
 * Interrupts are cooperative: `interrupt` raises a flag and unparks the
 * thread; only blocking operations in this crate observe the flag.
 */

use parking_lot_core::{park, unpark_one, ParkResult, ParkToken, UnparkToken};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Thread ids start at 1; 0 is reserved for "no thread" in owner fields.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Arc<ThreadHandle> = Arc::new(ThreadHandle::alloc());
}

/// Per-thread parking state and interrupt flag
///
/// Obtained with [`ThreadHandle::current`] and shared by `Arc`, so another
/// thread can `unpark` or `interrupt` this one after it has exited a queue.
#[repr(C, align(64))] // Cache-line aligned to prevent false sharing
pub struct ThreadHandle {
    id: u64,
    /// One-shot notification token (unpark-before-park immunity)
    notified: AtomicBool,
    /// Cooperative interrupt flag; observed by blocking operations only
    interrupted: AtomicBool,
}

impl ThreadHandle {
    fn alloc() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            notified: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// The calling thread's handle
    pub fn current() -> Arc<ThreadHandle> {
        CURRENT.with(|handle| handle.clone())
    }

    /// The calling thread's id (cheaper than cloning the handle)
    pub(crate) fn current_id() -> u64 {
        CURRENT.with(|handle| handle.id)
    }

    /// Process-unique id of the thread this handle belongs to
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stable parking key (same as in unpark)
    #[inline]
    fn key(&self) -> usize {
        self as *const ThreadHandle as usize
    }

    /// Block until unparked. Returns immediately if a token is pending.
    pub(crate) fn park(&self) {
        self.park_inner(None);
    }

    /// Block until unparked or the deadline passes. Returns true on timeout.
    pub(crate) fn park_until(&self, deadline: Instant) -> bool {
        matches!(self.park_inner(Some(deadline)), ParkResult::TimedOut)
    }

    fn park_inner(&self, deadline: Option<Instant>) -> ParkResult {
        // Consume a pending token without sleeping
        if self.notified.swap(false, Ordering::Acquire) {
            return ParkResult::Unparked(UnparkToken(0));
        }

        // Park the thread using parking_lot_core. The validate callback runs
        // under the bucket lock: an unpark that published its token before we
        // got here aborts the sleep.
        let result = unsafe {
            park(
                self.key(),
                || !self.notified.load(Ordering::Acquire),
                || {},
                |_key, _was_last| {},
                ParkToken(0),
                deadline,
            )
        };

        // Consume the token that woke us (or the one that aborted the sleep)
        self.notified.store(false, Ordering::Release);
        result
    }

    /// Wake the thread, or leave a token if it is not parked yet
    pub fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        unsafe {
            unpark_one(self.key(), |_| UnparkToken(0));
        }
    }

    /// Raise the interrupt flag and wake the thread so it can observe it
    pub fn interrupt(&self) {
        log::trace!("interrupt delivered to thread {}", self.id);
        self.interrupted.store(true, Ordering::Release);
        self.unpark();
    }

    /// Whether the interrupt flag is raised (without clearing it)
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Read and clear the interrupt flag
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Re-raise the interrupt flag (self-interrupt replay)
    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}
