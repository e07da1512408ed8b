/*!
 * Synchronizer Core
 *
 * The generic acquire/release engine. A concrete lock supplies a
 * `SyncHooks` implementation that interprets the state word; the engine
 * owns everything else: the fast-path probe, enqueueing, the park/retry
 * loop, timeout accounting, interrupt bookkeeping, cancellation, and
 * shared-mode wakeup propagation.
 *
 * # Design
 *
 * The state word is a single `u32` whose bit layout belongs entirely to
 * the hooks; the engine touches it only through get/set/CAS. Exclusive
 * ownership is tracked beside it as a thread id, written only by the
 * holding thread.
 */

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};
use crate::node::{opt_ptr, wait_status, Mode, WaitNode};
use crate::park::ThreadHandle;
use crate::queue::WaitQueue;
use crate::spin::SpinWait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cold]
fn unsupported(op: &str) -> ! {
    panic!("synchronizer hook `{op}` is not supported by this lock mode");
}

/// State-transition decisions a concrete lock plugs into the engine.
///
/// Every method is optional; a lock implements only the mode it supports
/// and inherits "operation unsupported" for the rest.
pub trait SyncHooks: Send + Sync + Sized + 'static {
    /// Try to take the resource exclusively. Must not block.
    fn try_acquire(&self, sync: &Synchronizer<Self>, arg: u32) -> bool {
        let _ = (sync, arg);
        unsupported("try_acquire")
    }

    /// Release exclusively. Returns true when the resource is fully free
    /// and a queued waiter may be granted.
    fn try_release(&self, sync: &Synchronizer<Self>, arg: u32) -> bool {
        let _ = (sync, arg);
        unsupported("try_release")
    }

    /// Try to take the resource in shared mode. Negative means failure;
    /// a non-negative value is the number of further grants believed
    /// possible, steering wakeup propagation.
    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, arg: u32) -> i64 {
        let _ = (sync, arg);
        unsupported("try_acquire_shared")
    }

    /// Release in shared mode. Returns true when the release may allow a
    /// waiting acquire (of either mode) to succeed.
    fn try_release_shared(&self, sync: &Synchronizer<Self>, arg: u32) -> bool {
        let _ = (sync, arg);
        unsupported("try_release_shared")
    }

    /// Whether the calling thread holds the resource exclusively
    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        let _ = sync;
        unsupported("is_held_exclusively")
    }
}

/// The blocking-synchronization engine a lock type is built around
pub struct Synchronizer<H: SyncHooks> {
    state: AtomicU32,
    /// Id of the exclusively-owning thread (0 = none). Written only by
    /// the holder; ordering is piggybacked on the state word.
    owner: AtomicU64,
    queue: WaitQueue,
    config: SyncConfig,
    hooks: H,
}

impl<H: SyncHooks> Synchronizer<H> {
    pub fn new(hooks: H) -> Self {
        Self::with_config(hooks, SyncConfig::default())
    }

    pub fn with_config(hooks: H, config: SyncConfig) -> Self {
        Self {
            state: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            queue: WaitQueue::new(),
            config,
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ---- state word (the engine never interprets it) ----

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, value: u32) {
        self.state.store(value, Ordering::SeqCst);
    }

    pub fn cas_state(&self, expected: u32, new: u32) -> bool {
        self.state
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ---- exclusive owner bookkeeping ----

    pub fn owner_id(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn set_owner(&self, id: u64) {
        self.owner.store(id, Ordering::Relaxed);
    }

    pub fn clear_owner(&self) {
        self.owner.store(0, Ordering::Relaxed);
    }

    // ---- exclusive mode ----

    /// Acquire, ignoring interrupts. An interrupt observed while parked is
    /// replayed as a self-interrupt once the resource is granted.
    pub fn acquire(&self, arg: u32) {
        if !self.hooks.try_acquire(self, arg) {
            let node = self.queue.add_waiter(Mode::Exclusive);
            if self.acquire_queued(&node, arg) {
                ThreadHandle::current().set_interrupted();
            }
        }
    }

    /// Acquire, aborting with [`SyncError::Interrupted`] if interrupted
    /// before or while waiting
    pub fn acquire_interruptibly(&self, arg: u32) -> SyncResult<()> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.hooks.try_acquire(self, arg) {
            return Ok(());
        }

        let node = self.queue.add_waiter(Mode::Exclusive);
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) && self.hooks.try_acquire(self, arg) {
                self.grant(&node, &pred);
                return Ok(());
            }
            if WaitQueue::should_park_after_failed_acquire(&pred, &node) {
                handle.park();
                if handle.take_interrupted() {
                    self.queue.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    /// Acquire with a deadline. `Ok(false)` reports expiry, a normal
    /// outcome of bounded waiting rather than an error.
    pub fn try_acquire_timed(&self, arg: u32, timeout: Duration) -> SyncResult<bool> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.hooks.try_acquire(self, arg) {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }

        let deadline = Instant::now() + timeout;
        let node = self.queue.add_waiter(Mode::Exclusive);
        let mut spin = SpinWait::new(self.config.max_spins);
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) && self.hooks.try_acquire(self, arg) {
                self.grant(&node, &pred);
                return Ok(true);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    self.queue.cancel_acquire(&node);
                    return Ok(false);
                }
            };

            if WaitQueue::should_park_after_failed_acquire(&pred, &node) {
                if remaining > self.config.spin_threshold {
                    handle.park_until(deadline);
                    spin.reset();
                } else {
                    // Parking costs more than what is left of the budget
                    spin.spin();
                }
                if handle.take_interrupted() {
                    self.queue.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    /// Release exclusively, waking the head's successor when the hook
    /// reports the resource fully free
    pub fn release(&self, arg: u32) -> bool {
        if self.hooks.try_release(self, arg) {
            if let Some(head) = self.queue.head.load_full() {
                if head.status() != wait_status::INITIAL {
                    self.queue.unpark_successor(&head);
                }
            }
            true
        } else {
            false
        }
    }

    /// The park/retry loop for an already-enqueued exclusive node.
    /// Returns whether an interrupt was observed (to be replayed).
    pub(crate) fn acquire_queued(&self, node: &Arc<WaitNode>, arg: u32) -> bool {
        let handle = ThreadHandle::current();
        let mut interrupted = false;
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) && self.hooks.try_acquire(self, arg) {
                self.grant(node, &pred);
                return interrupted;
            }
            if WaitQueue::should_park_after_failed_acquire(&pred, node) {
                handle.park();
                if handle.take_interrupted() {
                    interrupted = true;
                }
            }
        }
    }

    #[inline]
    fn pred_is_head(&self, pred: &Arc<WaitNode>) -> bool {
        opt_ptr(&self.queue.head.load()) == Arc::as_ptr(pred)
    }

    #[inline]
    fn grant(&self, node: &Arc<WaitNode>, pred: &Arc<WaitNode>) {
        self.queue.set_head(node);
        pred.next.store(None);
    }

    // ---- shared mode ----

    /// Shared-mode acquire, ignoring interrupts (replayed after grant)
    pub fn acquire_shared(&self, arg: u32) {
        if self.hooks.try_acquire_shared(self, arg) < 0 && self.do_acquire_shared(arg) {
            ThreadHandle::current().set_interrupted();
        }
    }

    fn do_acquire_shared(&self, arg: u32) -> bool {
        let handle = ThreadHandle::current();
        let node = self.queue.add_waiter(Mode::Shared);
        let mut interrupted = false;
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) {
                let remaining = self.hooks.try_acquire_shared(self, arg);
                if remaining >= 0 {
                    self.set_head_and_propagate(&node, remaining);
                    pred.next.store(None);
                    return interrupted;
                }
            }
            if WaitQueue::should_park_after_failed_acquire(&pred, &node) {
                handle.park();
                if handle.take_interrupted() {
                    interrupted = true;
                }
            }
        }
    }

    pub fn acquire_shared_interruptibly(&self, arg: u32) -> SyncResult<()> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.hooks.try_acquire_shared(self, arg) >= 0 {
            return Ok(());
        }

        let node = self.queue.add_waiter(Mode::Shared);
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) {
                let remaining = self.hooks.try_acquire_shared(self, arg);
                if remaining >= 0 {
                    self.set_head_and_propagate(&node, remaining);
                    pred.next.store(None);
                    return Ok(());
                }
            }
            if WaitQueue::should_park_after_failed_acquire(&pred, &node) {
                handle.park();
                if handle.take_interrupted() {
                    self.queue.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    pub fn try_acquire_shared_timed(&self, arg: u32, timeout: Duration) -> SyncResult<bool> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        if self.hooks.try_acquire_shared(self, arg) >= 0 {
            return Ok(true);
        }
        if timeout.is_zero() {
            return Ok(false);
        }

        let deadline = Instant::now() + timeout;
        let node = self.queue.add_waiter(Mode::Shared);
        let mut spin = SpinWait::new(self.config.max_spins);
        loop {
            let pred = node.predecessor();
            if self.pred_is_head(&pred) {
                let remaining = self.hooks.try_acquire_shared(self, arg);
                if remaining >= 0 {
                    self.set_head_and_propagate(&node, remaining);
                    pred.next.store(None);
                    return Ok(true);
                }
            }

            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    self.queue.cancel_acquire(&node);
                    return Ok(false);
                }
            };

            if WaitQueue::should_park_after_failed_acquire(&pred, &node) {
                if left > self.config.spin_threshold {
                    handle.park_until(deadline);
                    spin.reset();
                } else {
                    spin.spin();
                }
                if handle.take_interrupted() {
                    self.queue.cancel_acquire(&node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
    }

    /// Shared-mode release. One release can cascade through an arbitrary
    /// run of queued shared waiters.
    pub fn release_shared(&self, arg: u32) -> bool {
        if self.hooks.try_release_shared(self, arg) {
            self.do_release_shared();
            true
        } else {
            false
        }
    }

    /// Promote a granted shared node to head and, if further grants look
    /// possible, keep the wakeup front moving
    fn set_head_and_propagate(&self, node: &Arc<WaitNode>, remaining: i64) {
        let old_head = self.queue.head.load_full();
        self.queue.set_head(node);

        // A recorded signal on either the old or the new head means a
        // release happened while we were promoting; be conservative and
        // propagate whenever in doubt.
        let signal_pending = |h: &Option<Arc<WaitNode>>| match h {
            Some(h) => h.status() < 0,
            None => true,
        };
        if remaining > 0
            || signal_pending(&old_head)
            || signal_pending(&self.queue.head.load_full())
        {
            let next = node.next.load_full();
            match &next {
                None => self.do_release_shared(),
                Some(s) if s.is_shared() => self.do_release_shared(),
                _ => {}
            }
        }
    }

    fn do_release_shared(&self) {
        loop {
            let head = self.queue.head.load_full();
            if let Some(h) = &head {
                if opt_ptr(&self.queue.tail.load()) != Arc::as_ptr(h) {
                    let ws = h.status();
                    if ws == wait_status::SIGNAL {
                        if !h.cas_status(wait_status::SIGNAL, wait_status::INITIAL) {
                            continue; // lost to another releaser; reload
                        }
                        self.queue.unpark_successor(h);
                    } else if ws == wait_status::INITIAL
                        && !h.cas_status(wait_status::INITIAL, wait_status::PROPAGATE)
                    {
                        continue;
                    }
                }
            }
            // Done only if the head did not move while we signalled
            if opt_ptr(&self.queue.head.load()) == opt_ptr(&head) {
                return;
            }
        }
    }

    // ---- condition support ----

    /// Give up the whole state word at once (a reentrant holder abandons
    /// every reentry), returning the captured value for restoration
    pub(crate) fn fully_release(&self, node: &Arc<WaitNode>) -> u32 {
        let saved = self.state();
        if self.release(saved) {
            saved
        } else {
            // Leave the node cancelled so the condition queue can shed it
            node.set_status(wait_status::CANCELLED);
            panic!("illegal monitor state: lock not held at wait()");
        }
    }

    /// Whether a condition node has made it onto the wait queue
    pub(crate) fn is_on_sync_queue(&self, node: &Arc<WaitNode>) -> bool {
        if node.status() == wait_status::CONDITION || node.prev.load().is_none() {
            return false;
        }
        if node.next.load().is_some() {
            return true;
        }
        // prev is set but the tail CAS may not have landed; only the tail
        // scan can say for sure
        self.queue.find_node_from_tail(node)
    }

    /// Move a signalled node onto the wait queue. False means the waiter
    /// already cancelled and should be skipped.
    pub(crate) fn transfer_for_signal(&self, node: &Arc<WaitNode>) -> bool {
        if !node.cas_status(wait_status::CONDITION, wait_status::INITIAL) {
            return false;
        }

        let pred = self.queue.enq(node);
        // The new predecessor must carry the signalling obligation; if it
        // cannot (cancelled, or the CAS loses), wake the thread directly so
        // it re-parks through the ordinary acquire loop.
        let ws = pred.status();
        if ws > 0 || !pred.cas_status(ws, wait_status::SIGNAL) {
            log::trace!("signalled waiter's predecessor is gone; unparking directly");
            node.unpark();
        }
        true
    }

    /// After a timed-out or interrupted condition wait: claim the node if
    /// no signal beat us to it. True means the cancel won the race.
    pub(crate) fn transfer_after_cancelled_wait(&self, node: &Arc<WaitNode>) -> bool {
        if node.cas_status(wait_status::CONDITION, wait_status::INITIAL) {
            self.queue.enq(node);
            return true;
        }
        // A concurrent signal won; wait until it finishes the enqueue
        while !self.is_on_sync_queue(node) {
            std::thread::yield_now();
        }
        false
    }

    // ---- introspection ----

    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_thread_ids(&self) -> Vec<u64> {
        self.queue.queued_thread_ids()
    }

    pub fn has_queued_predecessors(&self) -> bool {
        self.queue.has_queued_predecessors()
    }

    pub fn apparently_first_queued_is_exclusive(&self) -> bool {
        self.queue.apparently_first_queued_is_exclusive()
    }
}
