/*!
 * Reentrant Read-Write Lock
 *
 * One state word, split in half: the high 16 bits count reader holds,
 * the low 16 bits count writer reentries. A writer may take read locks
 * while still writing and then drop the write half, downgrading without
 * ever exposing an unlocked window. The reverse (upgrade) is not
 * supported: a reader that tries to write blocks on itself and must
 * release first.
 *
 * Per-thread read-hold counts live in a single-slot first-reader cache
 * (the common case is one reader reentering) backed by a concurrent side
 * table for everything else.
 */

use crate::condition::Condition;
use crate::config::SyncConfig;
use crate::errors::SyncResult;
use crate::park::ThreadHandle;
use crate::sync::{SyncHooks, Synchronizer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHARED_SHIFT: u32 = 16;
const SHARED_UNIT: u32 = 1 << SHARED_SHIFT;
const MAX_COUNT: u32 = (1 << SHARED_SHIFT) - 1;
const EXCLUSIVE_MASK: u32 = (1 << SHARED_SHIFT) - 1;

/// Number of reader holds packed into `state`
pub(crate) fn shared_count(state: u32) -> u32 {
    state >> SHARED_SHIFT
}

/// Number of writer reentries packed into `state`
pub(crate) fn exclusive_count(state: u32) -> u32 {
    state & EXCLUSIVE_MASK
}

/// Hook policy for [`ReentrantRwLock`]: the packed-word protocol, the
/// fairness predicates, and per-thread read-hold bookkeeping
pub struct RwPolicy {
    fair: bool,
    /// Thread id of the reader that moved the count 0 -> 1 (0 = none)
    first_reader: AtomicU64,
    /// That reader's reentry depth; written only by the first reader
    first_reader_holds: AtomicUsize,
    /// Read-hold counts for every other reader, keyed by thread id
    read_holds: DashMap<u64, usize, ahash::RandomState>,
}

impl RwPolicy {
    fn new(fair: bool) -> Self {
        Self {
            fair,
            first_reader: AtomicU64::new(0),
            first_reader_holds: AtomicUsize::new(0),
            read_holds: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    fn writer_should_block(&self, sync: &Synchronizer<Self>) -> bool {
        if self.fair {
            sync.has_queued_predecessors()
        } else {
            false // writers always barge
        }
    }

    /// Best-effort writer anti-starvation: a new nonfair reader yields
    /// when the head of the queue appears to be a writer. Heuristic only;
    /// it bounds nothing.
    fn reader_should_block(&self, sync: &Synchronizer<Self>) -> bool {
        if self.fair {
            sync.has_queued_predecessors()
        } else {
            sync.apparently_first_queued_is_exclusive()
        }
    }

    /// Record one granted read hold. `prev_readers` is the shared count
    /// the winning CAS moved from.
    fn note_read_acquire(&self, me: u64, prev_readers: u32) {
        if prev_readers == 0 {
            self.first_reader.store(me, Ordering::Relaxed);
            self.first_reader_holds.store(1, Ordering::Relaxed);
        } else if self.first_reader.load(Ordering::Relaxed) == me {
            self.first_reader_holds.fetch_add(1, Ordering::Relaxed);
        } else {
            *self.read_holds.entry(me).or_insert(0) += 1;
        }
    }

    /// Drop one read hold, panicking on an unmatched unlock
    fn note_read_release(&self, me: u64) {
        if self.first_reader.load(Ordering::Relaxed) == me {
            if self.first_reader_holds.load(Ordering::Relaxed) == 1 {
                self.first_reader.store(0, Ordering::Relaxed);
            } else {
                self.first_reader_holds.fetch_sub(1, Ordering::Relaxed);
            }
            return;
        }
        match self.read_holds.entry(me) {
            Entry::Occupied(mut entry) => {
                let holds = *entry.get();
                if holds <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() = holds - 1;
                }
            }
            Entry::Vacant(_) => {
                panic!("illegal monitor state: read unlock without a matching read lock")
            }
        }
    }

    /// Read holds of the calling thread
    fn read_hold_count(&self, me: u64) -> usize {
        if self.first_reader.load(Ordering::Relaxed) == me {
            self.first_reader_holds.load(Ordering::Relaxed)
        } else {
            self.read_holds.get(&me).map(|entry| *entry).unwrap_or(0)
        }
    }

    /// The retry loop behind the shared fast path: handles reentrant
    /// reads and downgrades that the fairness predicate would spuriously
    /// turn away
    fn full_try_acquire_shared(&self, sync: &Synchronizer<Self>, me: u64) -> i64 {
        loop {
            let c = sync.state();
            if exclusive_count(c) != 0 {
                if sync.owner_id() != me {
                    return -1;
                }
                // We hold the write lock: a downgrade read may proceed
            } else if self.reader_should_block(sync) {
                // A reentrant read must not block behind a queued writer,
                // or the thread deadlocks on itself
                if self.first_reader.load(Ordering::Relaxed) != me
                    && self.read_hold_count(me) == 0
                {
                    return -1;
                }
            }
            if shared_count(c) == MAX_COUNT {
                panic!("maximum read lock count exceeded");
            }
            if sync.cas_state(c, c + SHARED_UNIT) {
                self.note_read_acquire(me, shared_count(c));
                return 1;
            }
        }
    }
}

impl SyncHooks for RwPolicy {
    fn try_acquire(&self, sync: &Synchronizer<Self>, acquires: u32) -> bool {
        let me = ThreadHandle::current_id();
        let c = sync.state();
        let w = exclusive_count(c);
        if c != 0 {
            // Readers present, or some thread writes. Only writer reentry
            // can succeed (note: w == 0 here means readers hold it).
            if w == 0 || sync.owner_id() != me {
                return false;
            }
            if w + acquires > MAX_COUNT {
                panic!("maximum write lock count exceeded");
            }
            sync.set_state(c + acquires);
            return true;
        }
        if self.writer_should_block(sync) || !sync.cas_state(c, c + acquires) {
            return false;
        }
        sync.set_owner(me);
        true
    }

    fn try_release(&self, sync: &Synchronizer<Self>, releases: u32) -> bool {
        if sync.owner_id() != ThreadHandle::current_id() {
            panic!("illegal monitor state: write unlock of a lock not held by the current thread");
        }
        let next = sync.state() - releases;
        let free = exclusive_count(next) == 0;
        if free {
            sync.clear_owner();
        }
        sync.set_state(next);
        free
    }

    fn try_acquire_shared(&self, sync: &Synchronizer<Self>, _arg: u32) -> i64 {
        let me = ThreadHandle::current_id();
        let c = sync.state();
        // No upgrade path: a foreign writer always turns readers away
        if exclusive_count(c) != 0 && sync.owner_id() != me {
            return -1;
        }
        let r = shared_count(c);
        if !self.reader_should_block(sync) && r < MAX_COUNT && sync.cas_state(c, c + SHARED_UNIT) {
            self.note_read_acquire(me, r);
            return 1;
        }
        self.full_try_acquire_shared(sync, me)
    }

    fn try_release_shared(&self, sync: &Synchronizer<Self>, _arg: u32) -> bool {
        self.note_read_release(ThreadHandle::current_id());
        loop {
            let c = sync.state();
            let next = c - SHARED_UNIT;
            if sync.cas_state(c, next) {
                // Freeing the last read hold lets a waiting writer run
                return next == 0;
            }
        }
    }

    fn is_held_exclusively(&self, sync: &Synchronizer<Self>) -> bool {
        sync.owner_id() == ThreadHandle::current_id()
    }
}

/// Barging probe used by `ReadLock::try_lock`
fn try_read_lock(sync: &Synchronizer<RwPolicy>) -> bool {
    let me = ThreadHandle::current_id();
    loop {
        let c = sync.state();
        if exclusive_count(c) != 0 && sync.owner_id() != me {
            return false;
        }
        if shared_count(c) == MAX_COUNT {
            panic!("maximum read lock count exceeded");
        }
        if sync.cas_state(c, c + SHARED_UNIT) {
            sync.hooks().note_read_acquire(me, shared_count(c));
            return true;
        }
    }
}

/// Barging probe used by `WriteLock::try_lock`
fn try_write_lock(sync: &Synchronizer<RwPolicy>) -> bool {
    let me = ThreadHandle::current_id();
    let c = sync.state();
    if c != 0 {
        let w = exclusive_count(c);
        if w == 0 || sync.owner_id() != me {
            return false;
        }
        if w == MAX_COUNT {
            panic!("maximum write lock count exceeded");
        }
    }
    if !sync.cas_state(c, c + 1) {
        return false;
    }
    sync.set_owner(me);
    true
}

/// A reentrant read-write lock with lock downgrading.
///
/// Any number of readers may hold the lock while no writer does; a writer
/// excludes everyone else. A thread holding the write lock may also take
/// the read lock and then release the write lock, downgrading without an
/// unlocked window:
///
/// ```
/// use qlock::ReentrantRwLock;
///
/// let rw = ReentrantRwLock::new();
/// rw.write().lock();
/// rw.read().lock();   // permitted: the writer may read
/// rw.write().unlock(); // downgraded; readers can now join
/// assert!(!rw.is_write_locked());
/// rw.read().unlock();
/// ```
#[derive(Clone)]
pub struct ReentrantRwLock {
    sync: Arc<Synchronizer<RwPolicy>>,
}

impl ReentrantRwLock {
    /// Create a nonfair lock (writers barge; new readers yield to a
    /// queued writer on a best-effort basis)
    pub fn new() -> Self {
        Self::with_config(false, SyncConfig::default())
    }

    /// Create a fair lock: both sides respect queue order
    pub fn new_fair() -> Self {
        Self::with_config(true, SyncConfig::default())
    }

    pub fn with_config(fair: bool, config: SyncConfig) -> Self {
        Self {
            sync: Arc::new(Synchronizer::with_config(RwPolicy::new(fair), config)),
        }
    }

    /// Handle to the shared (reader) side
    pub fn read(&self) -> ReadLock {
        ReadLock {
            sync: self.sync.clone(),
        }
    }

    /// Handle to the exclusive (writer) side
    pub fn write(&self) -> WriteLock {
        WriteLock {
            sync: self.sync.clone(),
        }
    }

    /// Number of read holds across all threads
    pub fn reader_count(&self) -> u32 {
        shared_count(self.sync.state())
    }

    pub fn is_write_locked(&self) -> bool {
        exclusive_count(self.sync.state()) != 0
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.sync.hooks().is_held_exclusively(&self.sync)
    }

    /// Write reentries of the calling thread (0 when not the writer)
    pub fn write_hold_count(&self) -> u32 {
        if self.is_write_locked_by_current_thread() {
            exclusive_count(self.sync.state())
        } else {
            0
        }
    }

    /// Read holds of the calling thread
    pub fn read_hold_count(&self) -> usize {
        self.sync
            .hooks()
            .read_hold_count(ThreadHandle::current_id())
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.has_queued_threads()
    }

    pub fn queue_length(&self) -> usize {
        self.sync.queue_length()
    }

    pub fn is_fair(&self) -> bool {
        self.sync.hooks().fair
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantRwLock")
            .field("fair", &self.is_fair())
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

/// Shared side of a [`ReentrantRwLock`]
#[derive(Clone)]
pub struct ReadLock {
    sync: Arc<Synchronizer<RwPolicy>>,
}

impl ReadLock {
    /// Acquire a read hold, blocking while a foreign writer holds the lock
    pub fn lock(&self) {
        self.sync.acquire_shared(1);
    }

    pub fn lock_interruptibly(&self) -> SyncResult<()> {
        self.sync.acquire_shared_interruptibly(1)
    }

    /// Immediate barging probe (ignores the fairness policy)
    pub fn try_lock(&self) -> bool {
        try_read_lock(&self.sync)
    }

    /// Acquire with a deadline; `Ok(false)` on expiry
    pub fn try_lock_for(&self, timeout: Duration) -> SyncResult<bool> {
        self.sync.try_acquire_shared_timed(1, timeout)
    }

    /// Release one read hold. Panics without a matching read lock.
    pub fn unlock(&self) {
        self.sync.release_shared(1);
    }
}

/// Exclusive side of a [`ReentrantRwLock`]
#[derive(Clone)]
pub struct WriteLock {
    sync: Arc<Synchronizer<RwPolicy>>,
}

impl WriteLock {
    /// Acquire the write lock, blocking while any reader or a foreign
    /// writer holds the lock
    pub fn lock(&self) {
        self.sync.acquire(1);
    }

    pub fn lock_interruptibly(&self) -> SyncResult<()> {
        self.sync.acquire_interruptibly(1)
    }

    /// Immediate barging probe (ignores the fairness policy)
    pub fn try_lock(&self) -> bool {
        try_write_lock(&self.sync)
    }

    /// Acquire with a deadline; `Ok(false)` on expiry
    pub fn try_lock_for(&self, timeout: Duration) -> SyncResult<bool> {
        self.sync.try_acquire_timed(1, timeout)
    }

    /// Release one write reentry. Panics if the caller is not the writer.
    pub fn unlock(&self) {
        self.sync.release(1);
    }

    /// A new condition bound to the write lock
    pub fn new_condition(&self) -> Condition<RwPolicy> {
        Condition::new(self.sync.clone())
    }

    /// Write reentries of the calling thread (0 when not the writer)
    pub fn hold_count(&self) -> u32 {
        if self.is_held_by_current_thread() {
            exclusive_count(self.sync.state())
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.hooks().is_held_exclusively(&self.sync)
    }
}
