/*!
 * Condition Queue Integration Tests
 *
 * Signal round-trips, reentry-depth restoration, the interrupt-vs-signal
 * race, and a bounded producer/consumer queue moving 10,000 items.
 */

use qlock::{Condition, ExclusivePolicy, ReentrantLock, SyncError, ThreadHandle};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Hold the lock until at least one thread is waiting on the condition,
/// then run `f` while still holding it
fn with_waiter_present(lock: &ReentrantLock, cond: &Condition<ExclusivePolicy>, f: impl FnOnce()) {
    loop {
        lock.lock();
        if cond.has_waiters() {
            break;
        }
        lock.unlock();
        thread::sleep(Duration::from_millis(1));
    }
    f();
    lock.unlock();
}

/// A waiter is woken by exactly one signal and returns with the lock held
#[test]
fn test_signal_round_trip() {
    let lock = ReentrantLock::new();
    let cond = Arc::new(lock.new_condition());
    let signalled = Arc::new(AtomicBool::new(false));

    let waiter = {
        let lock = lock.clone();
        let cond = cond.clone();
        let signalled = signalled.clone();
        thread::spawn(move || {
            lock.lock();
            while !signalled.load(Ordering::SeqCst) {
                cond.wait().unwrap();
            }
            let held = lock.is_held_by_current_thread();
            lock.unlock();
            held
        })
    };

    with_waiter_present(&lock, &cond, || {
        signalled.store(true, Ordering::SeqCst);
        cond.signal_one();
    });
    assert!(waiter.join().unwrap(), "wait() returned without the lock");
}

/// A reentrant holder gives up all reentries at once and gets the full
/// depth back before wait() returns
#[test]
fn test_wait_restores_reentry_depth() {
    let lock = ReentrantLock::new();
    let cond = Arc::new(lock.new_condition());
    let signalled = Arc::new(AtomicBool::new(false));

    let waiter = {
        let lock = lock.clone();
        let cond = cond.clone();
        let signalled = signalled.clone();
        thread::spawn(move || {
            lock.lock();
            lock.lock();
            lock.lock();
            while !signalled.load(Ordering::SeqCst) {
                cond.wait().unwrap();
            }
            let depth = lock.hold_count();
            lock.unlock();
            lock.unlock();
            lock.unlock();
            depth
        })
    };

    // While the waiter sleeps it holds nothing, despite its depth of 3
    with_waiter_present(&lock, &cond, || {
        signalled.store(true, Ordering::SeqCst);
        cond.signal_one();
    });
    assert_eq!(waiter.join().unwrap(), 3);
}

#[test]
fn test_signal_all_wakes_every_waiter() {
    let lock = ReentrantLock::new();
    let cond = Arc::new(lock.new_condition());
    let go = Arc::new(AtomicBool::new(false));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let lock = lock.clone();
            let cond = cond.clone();
            let go = go.clone();
            thread::spawn(move || {
                lock.lock();
                while !go.load(Ordering::SeqCst) {
                    cond.wait().unwrap();
                }
                lock.unlock();
            })
        })
        .collect();

    loop {
        lock.lock();
        if cond.wait_queue_length() == 4 {
            break;
        }
        lock.unlock();
        thread::sleep(Duration::from_millis(1));
    }
    go.store(true, Ordering::SeqCst);
    cond.signal_all();
    lock.unlock();

    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn test_wait_for_times_out_with_lock_reheld() {
    let lock = ReentrantLock::new();
    let cond = lock.new_condition();

    lock.lock();
    let in_time = cond.wait_for(Duration::from_millis(50)).unwrap();
    assert!(!in_time);
    assert!(lock.is_held_by_current_thread());
    lock.unlock();
}

/// Interrupt observed before any signal: the wait must error out
/// (with the lock reacquired so the caller can unlock)
#[test]
fn test_interrupt_before_signal_errors() {
    let lock = ReentrantLock::new();
    let cond = Arc::new(lock.new_condition());

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let lock = lock.clone();
        let cond = cond.clone();
        thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            lock.lock();
            let result = cond.wait();
            let held = lock.is_held_by_current_thread();
            lock.unlock();
            (result, held)
        })
    };

    let handle = rx.recv().unwrap();
    with_waiter_present(&lock, &cond, || {});
    handle.interrupt();

    let (result, held) = waiter.join().unwrap();
    assert_eq!(result, Err(SyncError::Interrupted));
    assert!(held);
}

/// Interrupt observed after a signal already claimed the node: the wait
/// completes normally and merely re-raises the interrupt flag
#[test]
fn test_interrupt_after_signal_completes_normally() {
    let lock = ReentrantLock::new();
    let cond = Arc::new(lock.new_condition());

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let lock = lock.clone();
        let cond = cond.clone();
        thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            lock.lock();
            let result = cond.wait();
            let flag = ThreadHandle::current().take_interrupted();
            lock.unlock();
            (result, flag)
        })
    };

    let handle = rx.recv().unwrap();
    // Signal first (claiming the node), interrupt second, both under the
    // lock so the waiter cannot observe anything in between
    with_waiter_present(&lock, &cond, || {
        cond.signal_one();
        handle.interrupt();
    });

    let (result, flag) = waiter.join().unwrap();
    assert_eq!(result, Ok(()));
    assert!(flag, "the post-signal interrupt must be re-raised");
}

#[test]
#[should_panic(expected = "illegal monitor state")]
fn test_signal_without_lock_panics() {
    let lock = ReentrantLock::new();
    let cond = lock.new_condition();
    cond.signal_one();
}

#[test]
#[should_panic(expected = "illegal monitor state")]
fn test_wait_without_lock_panics() {
    let lock = ReentrantLock::new();
    let cond = lock.new_condition();
    let _ = cond.wait();
}

/// Classic bounded buffer on one lock and two conditions
struct BoundedQueue {
    lock: ReentrantLock,
    not_full: Condition<ExclusivePolicy>,
    not_empty: Condition<ExclusivePolicy>,
    items: parking_lot::Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        let lock = ReentrantLock::new();
        let not_full = lock.new_condition();
        let not_empty = lock.new_condition();
        Self {
            lock,
            not_full,
            not_empty,
            items: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn put(&self, item: u64) {
        self.lock.lock();
        while self.items.lock().len() == self.capacity {
            self.not_full.wait_uninterruptibly();
        }
        self.items.lock().push_back(item);
        self.not_empty.signal_one();
        self.lock.unlock();
    }

    fn take(&self) -> u64 {
        self.lock.lock();
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                self.not_full.signal_one();
                self.lock.unlock();
                return item;
            }
            self.not_empty.wait_uninterruptibly();
        }
    }
}

/// Scenario: 10,000 items through a capacity-8 buffer under concurrent
/// load; nothing may be lost or duplicated, and producers must block on
/// "not full" rather than overfill
#[test]
fn test_bounded_queue_loses_nothing() {
    const PRODUCERS: u64 = 4;
    const CONSUMERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_500;

    let queue = Arc::new(BoundedQueue::new(8));
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.put(p * 1_000_000 + seq);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let received = received.clone();
            thread::spawn(move || {
                for _ in 0..(PRODUCERS * PER_PRODUCER / CONSUMERS) {
                    let item = queue.take();
                    received.lock().push(item);
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    for consumer in consumers {
        consumer.join().unwrap();
    }

    let received = received.lock();
    assert_eq!(received.len(), 10_000);
    let unique: HashSet<_> = received.iter().collect();
    assert_eq!(unique.len(), 10_000, "duplicate items detected");
    // The buffer respected its capacity bound throughout
    assert!(queue.items.lock().is_empty());
}
