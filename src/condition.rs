/*!
 * Condition Queue
 *
 * One waiter chain per condition object, linked through the nodes'
 * `next_waiter` field and mutated only while the owner holds the
 * exclusive lock. Signalling transfers nodes onto the wait queue, where
 * they compete through the ordinary acquire loop; `wait` therefore never
 * returns without the lock re-held at its saved reentry depth.
 */

use crate::errors::{SyncError, SyncResult};
use crate::node::{wait_status, WaitNode};
use crate::park::ThreadHandle;
use crate::sync::{SyncHooks, Synchronizer};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An interrupt that arrived after a signal had already claimed the node:
/// finish the wait normally, then re-raise the flag.
const REINTERRUPT: i32 = 1;
/// An interrupt that beat any signal: surface it as an error.
const THROW: i32 = -1;

/// A waiting area tied to one lock, in the style of a condition variable.
///
/// All operations require the caller to hold the associated lock
/// exclusively and panic otherwise.
pub struct Condition<H: SyncHooks> {
    sync: Arc<Synchronizer<H>>,
    first_waiter: ArcSwapOption<WaitNode>,
    last_waiter: ArcSwapOption<WaitNode>,
}

impl<H: SyncHooks> Condition<H> {
    pub(crate) fn new(sync: Arc<Synchronizer<H>>) -> Self {
        Self {
            sync,
            first_waiter: ArcSwapOption::empty(),
            last_waiter: ArcSwapOption::empty(),
        }
    }

    fn check_owned(&self) {
        if !self.sync.hooks().is_held_exclusively(&self.sync) {
            panic!("illegal monitor state: condition used without holding its lock");
        }
    }

    /// Append a fresh CONDITION node, shedding any cancelled tail first
    fn add_waiter(&self) -> Arc<WaitNode> {
        let mut tail = self.last_waiter.load_full();
        if let Some(last) = &tail {
            if last.status() != wait_status::CONDITION {
                self.unlink_cancelled_waiters();
                tail = self.last_waiter.load_full();
            }
        }

        let node = WaitNode::condition_waiter();
        match &tail {
            Some(last) => last.next_waiter.store(Some(node.clone())),
            None => self.first_waiter.store(Some(node.clone())),
        }
        self.last_waiter.store(Some(node.clone()));
        node
    }

    /// Release the lock completely and wait until signalled.
    ///
    /// On `Err(Interrupted)` the lock has still been reacquired; the
    /// caller keeps responsibility for unlocking.
    pub fn wait(&self) -> SyncResult<()> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owned();

        let node = self.add_waiter();
        let saved = self.sync.fully_release(&node);
        let mut interrupt_mode = 0;
        while !self.sync.is_on_sync_queue(&node) {
            handle.park();
            interrupt_mode = self.check_interrupt_while_waiting(&handle, &node);
            if interrupt_mode != 0 {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved) && interrupt_mode != THROW {
            interrupt_mode = REINTERRUPT;
        }
        if node.next_waiter.load().is_some() {
            self.unlink_cancelled_waiters();
        }
        self.finish_wait(&handle, interrupt_mode, true).map(|_| ())
    }

    /// Like [`wait`](Self::wait) but never errors: interrupts are
    /// remembered and replayed as a self-interrupt
    pub fn wait_uninterruptibly(&self) {
        self.check_owned();
        let handle = ThreadHandle::current();
        let node = self.add_waiter();
        let saved = self.sync.fully_release(&node);
        let mut interrupted = false;
        while !self.sync.is_on_sync_queue(&node) {
            handle.park();
            if handle.take_interrupted() {
                interrupted = true;
            }
        }
        if self.sync.acquire_queued(&node, saved) || interrupted {
            handle.set_interrupted();
        }
    }

    /// Wait with a timeout. `Ok(false)` reports that the deadline passed
    /// before a signal claimed this waiter.
    pub fn wait_for(&self, timeout: Duration) -> SyncResult<bool> {
        let handle = ThreadHandle::current();
        if handle.take_interrupted() {
            return Err(SyncError::Interrupted);
        }
        self.check_owned();

        let deadline = Instant::now() + timeout;
        let node = self.add_waiter();
        let saved = self.sync.fully_release(&node);
        let mut timed_out = false;
        let mut interrupt_mode = 0;
        while !self.sync.is_on_sync_queue(&node) {
            let now = Instant::now();
            if now >= deadline {
                timed_out = self.sync.transfer_after_cancelled_wait(&node);
                break;
            }
            if deadline - now > self.sync.config().spin_threshold {
                handle.park_until(deadline);
            }
            interrupt_mode = self.check_interrupt_while_waiting(&handle, &node);
            if interrupt_mode != 0 {
                break;
            }
        }

        if self.sync.acquire_queued(&node, saved) && interrupt_mode != THROW {
            interrupt_mode = REINTERRUPT;
        }
        if node.next_waiter.load().is_some() {
            self.unlink_cancelled_waiters();
        }
        self.finish_wait(&handle, interrupt_mode, !timed_out)
    }

    /// Wait until an absolute deadline; see [`wait_for`](Self::wait_for)
    pub fn wait_until(&self, deadline: Instant) -> SyncResult<bool> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.wait_for(timeout)
    }

    fn finish_wait(
        &self,
        handle: &ThreadHandle,
        interrupt_mode: i32,
        in_time: bool,
    ) -> SyncResult<bool> {
        match interrupt_mode {
            THROW => Err(SyncError::Interrupted),
            REINTERRUPT => {
                handle.set_interrupted();
                Ok(in_time)
            }
            _ => Ok(in_time),
        }
    }

    /// Race the interrupt against any in-flight signal; whoever moves the
    /// node's status off CONDITION first decides the outcome
    fn check_interrupt_while_waiting(&self, handle: &ThreadHandle, node: &Arc<WaitNode>) -> i32 {
        if handle.take_interrupted() {
            if self.sync.transfer_after_cancelled_wait(node) {
                THROW
            } else {
                REINTERRUPT
            }
        } else {
            0
        }
    }

    /// Move the longest-waiting thread to the wait queue
    pub fn signal_one(&self) {
        self.check_owned();
        if let Some(first) = self.first_waiter.load_full() {
            self.do_signal(first);
        }
    }

    fn do_signal(&self, mut first: Arc<WaitNode>) {
        loop {
            let next = first.next_waiter.load_full();
            if next.is_none() {
                self.last_waiter.store(None);
            }
            self.first_waiter.store(next);
            first.next_waiter.store(None);

            if self.sync.transfer_for_signal(&first) {
                return;
            }
            // That waiter had already cancelled; try the next one
            match self.first_waiter.load_full() {
                Some(f) => first = f,
                None => return,
            }
        }
    }

    /// Move every waiting thread to the wait queue
    pub fn signal_all(&self) {
        self.check_owned();
        let mut cursor = self.first_waiter.load_full();
        self.first_waiter.store(None);
        self.last_waiter.store(None);
        while let Some(node) = cursor {
            let next = node.next_waiter.load_full();
            node.next_waiter.store(None);
            self.sync.transfer_for_signal(&node);
            cursor = next;
        }
    }

    /// Drop chain entries whose waiters already left (timeout/interrupt).
    /// Called only with the lock held.
    fn unlink_cancelled_waiters(&self) {
        let mut cursor = self.first_waiter.load_full();
        let mut trail: Option<Arc<WaitNode>> = None;
        while let Some(node) = cursor {
            let next = node.next_waiter.load_full();
            if node.status() != wait_status::CONDITION {
                node.next_waiter.store(None);
                match &trail {
                    None => self.first_waiter.store(next.clone()),
                    Some(t) => t.next_waiter.store(next.clone()),
                }
                if next.is_none() {
                    self.last_waiter.store(trail.clone());
                }
            } else {
                trail = Some(node);
            }
            cursor = next;
        }
    }

    /// Whether any thread is waiting on this condition
    pub fn has_waiters(&self) -> bool {
        self.check_owned();
        let mut cursor = self.first_waiter.load_full();
        while let Some(node) = cursor {
            if node.status() == wait_status::CONDITION {
                return true;
            }
            cursor = node.next_waiter.load_full();
        }
        false
    }

    /// Number of threads waiting on this condition
    pub fn wait_queue_length(&self) -> usize {
        self.check_owned();
        let mut count = 0;
        let mut cursor = self.first_waiter.load_full();
        while let Some(node) = cursor {
            if node.status() == wait_status::CONDITION {
                count += 1;
            }
            cursor = node.next_waiter.load_full();
        }
        count
    }
}
