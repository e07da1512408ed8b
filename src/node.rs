/*!
 * Wait Node
 *
 * The intrusive node shared by the FIFO wait queue and per-condition
 * queues. Link cells hold `Option<Arc<WaitNode>>` behind an atomic
 * pointer swap, so CAS-contended links need no manual reclamation: a
 * node stays alive exactly as long as something still points at it.
 */

use crate::park::ThreadHandle;
use arc_swap::ArcSwapOption;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Wait-status values. Negative values mean the node still owes work to
/// its neighborhood; the single positive value marks abandonment.
pub(crate) mod wait_status {
    /// No signalling obligation recorded yet
    pub const INITIAL: i32 = 0;
    /// The successor is (or is about to be) parked; a release passing
    /// through this node must unpark it
    pub const SIGNAL: i32 = -1;
    /// The wait was abandoned by timeout or interrupt
    pub const CANCELLED: i32 = 1;
    /// The node is parked on a condition queue
    pub const CONDITION: i32 = -2;
    /// A shared release must keep propagating to further shared waiters
    pub const PROPAGATE: i32 = -3;
}

/// Whether a waiter wants the resource alone or alongside other holders
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Exclusive,
    Shared,
}

/// One queued (or condition-parked) waiter.
///
/// `prev` is authoritative: it is written before the node becomes
/// reachable and only rewritten to skip cancelled predecessors. `next` is
/// a best-effort hint that may lag; traversals that need certainty walk
/// backward from the tail instead.
pub(crate) struct WaitNode {
    status: AtomicI32,
    mode: Mode,
    /// Handle of the blocked thread; cleared once the node is granted
    pub(crate) handle: ArcSwapOption<ThreadHandle>,
    pub(crate) prev: ArcSwapOption<WaitNode>,
    pub(crate) next: ArcSwapOption<WaitNode>,
    /// Condition-queue link; meaningful only while status is CONDITION
    pub(crate) next_waiter: ArcSwapOption<WaitNode>,
}

impl WaitNode {
    pub(crate) fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicI32::new(wait_status::INITIAL),
            mode,
            handle: ArcSwapOption::new(Some(ThreadHandle::current())),
            prev: ArcSwapOption::empty(),
            next: ArcSwapOption::empty(),
            next_waiter: ArcSwapOption::empty(),
        })
    }

    /// Dummy head node; its `handle` stays empty for its whole life
    pub(crate) fn sentinel() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicI32::new(wait_status::INITIAL),
            mode: Mode::Exclusive,
            handle: ArcSwapOption::empty(),
            prev: ArcSwapOption::empty(),
            next: ArcSwapOption::empty(),
            next_waiter: ArcSwapOption::empty(),
        })
    }

    /// Node born on a condition queue, to be transferred on signal
    pub(crate) fn condition_waiter() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicI32::new(wait_status::CONDITION),
            mode: Mode::Exclusive,
            handle: ArcSwapOption::new(Some(ThreadHandle::current())),
            prev: ArcSwapOption::empty(),
            next: ArcSwapOption::empty(),
            next_waiter: ArcSwapOption::empty(),
        })
    }

    // Status and link updates assume a single total order, like the state
    // word they cooperate with; everything here is SeqCst.

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    pub(crate) fn set_status(&self, value: i32) {
        self.status.store(value, Ordering::SeqCst);
    }

    pub(crate) fn cas_status(&self, expected: i32, new: i32) -> bool {
        self.status
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.mode == Mode::Shared
    }

    /// The queued predecessor. Enqueued nodes always carry one; the head
    /// sentinel does not, and is never asked.
    pub(crate) fn predecessor(&self) -> Arc<WaitNode> {
        self.prev
            .load_full()
            .expect("queued node must have a predecessor")
    }

    pub(crate) fn unpark(&self) {
        if let Some(handle) = &*self.handle.load() {
            handle.unpark();
        }
    }
}

/// Pointer identity of an optional link target (null for `None`)
pub(crate) fn opt_ptr(link: &Option<Arc<WaitNode>>) -> *const WaitNode {
    link.as_ref().map_or(ptr::null(), Arc::as_ptr)
}

/// Single CAS on a link cell: succeeds only if the cell still points at
/// `expected` (by identity), in which case it now points at `new`
pub(crate) fn cas_link(
    cell: &ArcSwapOption<WaitNode>,
    expected: &Option<Arc<WaitNode>>,
    new: Option<Arc<WaitNode>>,
) -> bool {
    let want = opt_ptr(expected);
    let prev = cell.compare_and_swap(want, new);
    opt_ptr(&prev) == want
}
