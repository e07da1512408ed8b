/*!
 * qlock
 *
 * Blocking synchronization built from two halves: a lock-free FIFO wait
 * queue of parked threads, and a pluggable protocol (`SyncHooks`) that
 * gives an integer state word its meaning. The included locks (a
 * reentrant exclusive lock and a reentrant read-write lock with
 * downgrading) are thin policies over the same engine, and new
 * primitives such as semaphores and latches can be built the same way.
 *
 * # Example
 *
 * ```
 * use qlock::ReentrantLock;
 * use std::thread;
 *
 * let lock = ReentrantLock::new_fair();
 * let worker = {
 *     let lock = lock.clone();
 *     thread::spawn(move || {
 *         lock.lock();
 *         lock.unlock();
 *     })
 * };
 * lock.lock();
 * lock.unlock();
 * worker.join().unwrap();
 * ```
 */

mod condition;
mod config;
mod errors;
mod mutex;
mod node;
mod park;
mod queue;
mod rwlock;
mod spin;
mod sync;

pub use condition::Condition;
pub use config::SyncConfig;
pub use errors::{SyncError, SyncResult};
pub use mutex::{ExclusivePolicy, ReentrantLock};
pub use park::ThreadHandle;
pub use rwlock::{ReadLock, ReentrantRwLock, RwPolicy, WriteLock};
pub use sync::{SyncHooks, Synchronizer};
