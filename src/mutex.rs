/*!
 * Reentrant Exclusive Lock
 *
 * The state word is the reentry count (0 = free). The fair policy admits
 * a thread only when no one blocked ahead of it; the nonfair policy lets
 * a newly arriving thread barge past the queue for throughput.
 */

use crate::condition::Condition;
use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::park::ThreadHandle;
use crate::sync::{SyncHooks, Synchronizer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook policy for [`ReentrantLock`]: reentry counting plus the
/// fair/nonfair admission predicate
pub struct ExclusivePolicy {
    fair: bool,
}

/// The barging probe shared by nonfair `lock` and every `try_lock`
fn nonfair_try_acquire(sync: &Synchronizer<ExclusivePolicy>, acquires: u32) -> bool {
    let me = ThreadHandle::current_id();
    let c = sync.state();
    if c == 0 {
        if sync.cas_state(0, acquires) {
            sync.set_owner(me);
            return true;
        }
    } else if sync.owner_id() == me {
        let next = match c.checked_add(acquires) {
            Some(n) => n,
            None => panic!("maximum lock count exceeded"),
        };
        sync.set_state(next);
        return true;
    }
    false
}

impl SyncHooks for ExclusivePolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: u32) -> bool {
        if !self.fair {
            return nonfair_try_acquire(sync, acquires);
        }

        let me = ThreadHandle::current_id();
        let c = sync.state();
        if c == 0 {
            if !sync.has_queued_predecessors() && sync.cas_state(0, acquires) {
                sync.set_owner(me);
                return true;
            }
        } else if sync.owner_id() == me {
            let next = match c.checked_add(acquires) {
                Some(n) => n,
                None => panic!("maximum lock count exceeded"),
            };
            sync.set_state(next);
            return true;
        }
        false
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: u32) -> bool {
        if sync.owner_id() != ThreadHandle::current_id() {
            panic!("illegal monitor state: unlock of a lock not held by the current thread");
        }
        let c = sync.state() - releases;
        let free = c == 0;
        if free {
            sync.clear_owner();
        }
        sync.set_state(c);
        free
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        sync.owner_id() == ThreadHandle::current_id()
    }
}

/// A reentrant mutual-exclusion lock with explicit lock/unlock pairing
/// and condition support.
///
/// Cloning yields another handle to the same lock.
///
/// # Examples
///
/// ```
/// use qlock::ReentrantLock;
///
/// let lock = ReentrantLock::new();
/// lock.lock();
/// lock.lock(); // reentrant
/// assert_eq!(lock.hold_count(), 2);
/// lock.unlock();
/// lock.unlock();
/// assert!(!lock.is_locked());
/// ```
#[derive(Clone)]
pub struct ReentrantLock {
    sync: Arc<Synchronizer<ExclusivePolicy>>,
}

impl ReentrantLock {
    /// Create a nonfair (barging) lock
    pub fn new() -> Self {
        Self::with_config(false, SyncConfig::default())
    }

    /// Create a fair lock: grant order equals blocking order
    pub fn new_fair() -> Self {
        Self::with_config(true, SyncConfig::default())
    }

    pub fn with_config(fair: bool, config: SyncConfig) -> Self {
        Self {
            sync: Arc::new(Synchronizer::with_config(ExclusivePolicy { fair }, config)),
        }
    }

    /// Acquire, blocking until granted. An interrupt during the wait is
    /// replayed as a self-interrupt after the grant, never dropped.
    pub fn lock(&self) {
        self.sync.acquire(1);
    }

    /// Acquire, aborting the wait if interrupted
    pub fn lock_interruptibly(&self) -> SyncResult<()> {
        self.sync.acquire_interruptibly(1)
    }

    /// Immediate probe. Barges even on a fair lock; use
    /// [`try_lock_for`](Self::try_lock_for) with a zero timeout for a
    /// fairness-respecting probe.
    pub fn try_lock(&self) -> bool {
        nonfair_try_acquire(&self.sync, 1)
    }

    /// Acquire with a deadline; `Ok(false)` on expiry
    pub fn try_lock_for(&self, timeout: Duration) -> SyncResult<bool> {
        self.sync.try_acquire_timed(1, timeout)
    }

    /// Release one reentry. Panics if the calling thread is not the owner.
    pub fn unlock(&self) {
        self.sync.release(1);
    }

    /// A new condition bound to this lock
    pub fn new_condition(&self) -> Condition<ExclusivePolicy> {
        Condition::new(self.sync.clone())
    }

    /// Whether any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.sync.state() != 0
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.hooks().is_held_exclusively(&self.sync)
    }

    /// Reentry depth of the calling thread (0 when not the owner)
    pub fn hold_count(&self) -> u32 {
        if self.is_held_by_current_thread() {
            self.sync.state()
        } else {
            0
        }
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    /// Estimate of the number of threads blocked on this lock
    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    pub fn is_fair(&self) -> bool {
        self.sync.hooks().fair
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("fair", &self.is_fair())
            .field("locked", &self.is_locked())
            .finish()
    }
}
