/*!
 * Adaptive Spin-Wait with Exponential Backoff
 *
 * Used by timed acquires when the remaining budget is too small to be
 * worth a park/unpark round trip.
 *
 * # Design
 *
 * Three phases, cheapest first:
 * 1. Tight spin with the hardware hint
 * 2. Yield to the scheduler
 * 3. Exponentially increasing sleep, capped at 1ms
 */

use std::thread;
use std::time::Duration;

const HINT_PHASE_ITERS: u32 = 10;
const MAX_BACKOFF_NS: u64 = 1_000_000; // 1ms

pub(crate) struct SpinWait {
    counter: u32,
    /// Iterations before the yield phase gives way to sleeping
    yield_limit: u32,
    backoff_ns: u64,
}

impl SpinWait {
    pub(crate) fn new(yield_limit: u32) -> Self {
        Self {
            counter: 0,
            yield_limit: yield_limit.max(HINT_PHASE_ITERS),
            backoff_ns: 1,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.counter = 0;
        self.backoff_ns = 1;
    }

    /// One bounded backoff step
    pub(crate) fn spin(&mut self) {
        self.counter = self.counter.saturating_add(1);
        if self.counter < HINT_PHASE_ITERS {
            std::hint::spin_loop();
        } else if self.counter < self.yield_limit {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_nanos(self.backoff_ns));
            self.backoff_ns = (self.backoff_ns * 2).min(MAX_BACKOFF_NS);
        }
    }
}
