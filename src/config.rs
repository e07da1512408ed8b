/*!
 * Synchronization Configuration
 *
 * Tuning knobs for the park/retry loops. The defaults favor parking early;
 * `low_latency` trades CPU for faster wakeups on very short waits.
 */

use std::time::Duration;

/// Tuning for timed acquires and condition waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Remaining-time threshold below which a timed wait spins instead of
    /// parking. Parking costs more than the whole wait at this scale.
    pub spin_threshold: Duration,
    /// Spin iterations before backoff switches from yielding to sleeping.
    pub max_spins: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            spin_threshold: Duration::from_micros(1),
            max_spins: 64,
        }
    }
}

impl SyncConfig {
    /// Configuration optimized for waits that are expected to be short
    pub fn low_latency() -> Self {
        Self {
            spin_threshold: Duration::from_micros(50),
            max_spins: 500,
        }
    }
}
