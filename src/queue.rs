/*!
 * FIFO Wait Queue
 *
 * A CLH-variant queue of blocked threads. Structural changes go through
 * single CAS operations on the head/tail cells and on `next` hints; no
 * mutex guards any part of it, so a thread descheduled mid-operation can
 * never wedge the queue.
 *
 * # Design
 *
 * `prev` links are authoritative. `next` links are an optimization that
 * can be stale after concurrent cancellations, so every wakeup path that
 * misses through `next` recovers by scanning backward from the tail.
 */

use crate::node::{cas_link, opt_ptr, wait_status, Mode, WaitNode};
use crate::park::ThreadHandle;
use arc_swap::ArcSwapOption;
use std::sync::Arc;

pub(crate) struct WaitQueue {
    pub(crate) head: ArcSwapOption<WaitNode>,
    pub(crate) tail: ArcSwapOption<WaitNode>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: ArcSwapOption::empty(),
            tail: ArcSwapOption::empty(),
        }
    }

    /// Insert `node` at the tail, initializing the sentinel head/tail pair
    /// on first use. Returns the node's predecessor.
    pub(crate) fn enq(&self, node: &Arc<WaitNode>) -> Arc<WaitNode> {
        loop {
            match self.tail.load_full() {
                None => {
                    let sentinel = WaitNode::sentinel();
                    if cas_link(&self.head, &None, Some(sentinel.clone())) {
                        log::trace!("wait queue sentinel initialized");
                        self.tail.store(Some(sentinel));
                    }
                    // Lost initializers retry against the winner's tail
                }
                Some(tail) => {
                    node.prev.store(Some(tail.clone()));
                    if cas_link(&self.tail, &Some(tail.clone()), Some(node.clone())) {
                        tail.next.store(Some(node.clone()));
                        return tail;
                    }
                }
            }
        }
    }

    /// Create and enqueue a node for the calling thread
    pub(crate) fn add_waiter(&self, mode: Mode) -> Arc<WaitNode> {
        let node = WaitNode::new(mode);

        // Fast path: one CAS against the current tail before the full loop
        if let Some(tail) = self.tail.load_full() {
            node.prev.store(Some(tail.clone()));
            if cas_link(&self.tail, &Some(tail.clone()), Some(node.clone())) {
                tail.next.store(Some(node.clone()));
                return node;
            }
        }
        self.enq(&node);
        node
    }

    /// Promote `node` to head after its thread was granted the resource.
    /// Clearing the thread and `prev` makes the old head unreachable.
    pub(crate) fn set_head(&self, node: &Arc<WaitNode>) {
        self.head.store(Some(node.clone()));
        node.handle.store(None);
        node.prev.store(None);
    }

    /// Wake the nearest eligible successor of `node` (usually the head)
    pub(crate) fn unpark_successor(&self, node: &Arc<WaitNode>) {
        // Clearing SIGNAL first means at most one wakeup per obligation;
        // failure is fine, the waiter re-checks anyway.
        let ws = node.status();
        if ws < 0 {
            node.cas_status(ws, wait_status::INITIAL);
        }

        if let Some(successor) = self.eligible_successor(node) {
            successor.unpark();
        }
    }

    /// Successor lookup that falls back to a backward scan when the `next`
    /// hint is missing or points at a cancelled node
    fn eligible_successor(&self, from: &Arc<WaitNode>) -> Option<Arc<WaitNode>> {
        let direct = from.next.load_full();
        if matches!(&direct, Some(s) if s.status() <= 0) {
            return direct;
        }

        let mut found = None;
        let mut cursor = self.tail.load_full();
        while let Some(current) = cursor {
            if Arc::ptr_eq(&current, from) {
                break;
            }
            if current.status() <= 0 {
                found = Some(current.clone());
            }
            cursor = current.prev.load_full();
        }
        found
    }

    /// True while any non-sentinel node is linked
    pub(crate) fn has_queued_threads(&self) -> bool {
        let head = self.head.load();
        let tail = self.tail.load();
        opt_ptr(&head) != opt_ptr(&tail)
    }

    /// Number of queued nodes still naming a thread. A snapshot; the value
    /// is stale the moment it is produced.
    pub(crate) fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if node.handle.load().is_some() {
                count += 1;
            }
            cursor = node.prev.load_full();
        }
        count
    }

    /// Ids of the queued threads, in no particular order
    pub(crate) fn queued_thread_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut cursor = self.tail.load_full();
        while let Some(node) = cursor {
            if let Some(handle) = &*node.handle.load() {
                ids.push(handle.id());
            }
            cursor = node.prev.load_full();
        }
        ids
    }

    /// Whether a thread other than the caller blocked earlier and is still
    /// waiting (the fair-mode admission check)
    pub(crate) fn has_queued_predecessors(&self) -> bool {
        let tail = self.tail.load_full();
        let head = self.head.load_full();
        match (head, tail) {
            (Some(head), Some(tail)) => {
                if Arc::ptr_eq(&head, &tail) {
                    return false;
                }
                match head.next.load_full() {
                    Some(successor) => match &*successor.handle.load() {
                        Some(handle) => handle.id() != ThreadHandle::current_id(),
                        None => true,
                    },
                    None => true,
                }
            }
            _ => false,
        }
    }

    /// Best-effort probe: does an exclusive waiter appear to be first in
    /// line? Used by the nonfair reader policy to avoid starving writers.
    pub(crate) fn apparently_first_queued_is_exclusive(&self) -> bool {
        if let Some(head) = self.head.load_full() {
            if let Some(successor) = head.next.load_full() {
                return !successor.is_shared() && successor.handle.load().is_some();
            }
        }
        false
    }

    /// Decide whether the caller may park, repairing the queue on the way.
    ///
    /// Returns true only once the predecessor has committed to signalling
    /// this node; any repair or status write returns false so the caller
    /// retries the acquire first (closing the race against an in-flight
    /// release).
    pub(crate) fn should_park_after_failed_acquire(
        pred: &Arc<WaitNode>,
        node: &Arc<WaitNode>,
    ) -> bool {
        let ws = pred.status();
        if ws == wait_status::SIGNAL {
            return true;
        }
        if ws > 0 {
            // Skip over cancelled predecessors and relink
            let mut pred = pred.clone();
            loop {
                pred = pred.predecessor();
                if pred.status() <= 0 {
                    break;
                }
            }
            node.prev.store(Some(pred.clone()));
            pred.next.store(Some(node.clone()));
        } else {
            // INITIAL or PROPAGATE: record the signalling obligation
            pred.cas_status(ws, wait_status::SIGNAL);
        }
        false
    }

    /// Abandon a queued acquire after timeout or interrupt.
    ///
    /// Safe under concurrent cancellations of neighboring nodes: the
    /// current predecessor is always re-derived through `prev` rather
    /// than trusted from a cached reference.
    pub(crate) fn cancel_acquire(&self, node: &Arc<WaitNode>) {
        node.handle.store(None);

        // Hop over predecessors that are themselves cancelled
        let mut pred = node.predecessor();
        while pred.status() > 0 {
            let before = pred.predecessor();
            node.prev.store(Some(before.clone()));
            pred = before;
        }
        let pred_next = pred.next.load_full();

        node.set_status(wait_status::CANCELLED);
        log::debug!("wait cancelled; splicing node out of the queue");

        // Tail case: back the tail up to the live predecessor
        if opt_ptr(&self.tail.load()) == Arc::as_ptr(node)
            && cas_link(&self.tail, &Some(node.clone()), Some(pred.clone()))
        {
            cas_link(&pred.next, &pred_next, None);
            return;
        }

        // Interior case: either hand the signalling obligation to the
        // predecessor, or wake the successor ourselves so the wakeup this
        // node owed is never lost.
        let pred_is_head = opt_ptr(&self.head.load()) == Arc::as_ptr(&pred);
        let ws = pred.status();
        let pred_will_signal =
            ws == wait_status::SIGNAL || (ws <= 0 && pred.cas_status(ws, wait_status::SIGNAL));
        if !pred_is_head && pred_will_signal && pred.handle.load().is_some() {
            if let Some(next) = node.next.load_full() {
                if next.status() <= 0 {
                    cas_link(&pred.next, &pred_next, Some(next));
                }
            }
        } else {
            self.unpark_successor(node);
        }
        // Drop the forward link: two dead neighbors pointing at each other
        // through next/prev would keep each other alive forever. Wakeup
        // paths that miss a `next` hint fall back to the tail scan anyway.
        node.next.store(None);
    }

    /// Walk backward from the tail looking for `node`
    pub(crate) fn find_node_from_tail(&self, node: &Arc<WaitNode>) -> bool {
        let mut cursor = self.tail.load_full();
        while let Some(current) = cursor {
            if Arc::ptr_eq(&current, node) {
                return true;
            }
            cursor = current.prev.load_full();
        }
        false
    }
}
