/*!
 * Error Types
 *
 * Recoverable outcomes surfaced by interruptible and timed waits.
 * Misuse of a lock (releasing without ownership, waiting on a condition
 * without its lock, blowing a hold-count cap) is a programming error and
 * panics instead of returning one of these.
 */

use thiserror::Error;

/// Result type for interruptible wait operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors reported by interruptible acquire and wait operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("wait was interrupted")]
    Interrupted,
}
