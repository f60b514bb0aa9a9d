use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Token bucket for inbound messages. The budget of `max_num` per `cycle` is split into
///  `slice` windows; every slice the free window grows by one window, capped at twice the
///  cycle budget. This only informs the caller, it never blocks.
#[derive(Debug)]
pub struct FlowController {
    max_num: i64,
    window: i64,
    cycle_slice: Duration,
    free_window: AtomicI64,
}

impl FlowController {
    pub fn new(max_num: u32, cycle: Duration, slice: u32) -> FlowController {
        let max_num = max_num as i64;
        let slice = slice.max(1);
        let mut window = max_num / slice as i64;
        let mut cycle_slice = cycle / slice;

        if window == 0 || cycle_slice.is_zero() {
            window = max_num;
            cycle_slice = cycle;
        }

        FlowController {
            max_num,
            window,
            cycle_slice,
            free_window: AtomicI64::new(window),
        }
    }

    pub fn cycle_slice(&self) -> Duration {
        self.cycle_slice
    }

    pub fn free_window(&self) -> i64 {
        self.free_window.load(Ordering::Acquire)
    }

    /// Takes `n` tokens. Returns `true` if the caller is over its budget and should drop or
    ///  delay the input.
    pub fn over_speed(&self, n: u32) -> bool {
        if self.free_window.load(Ordering::Acquire) <= 0 {
            return true;
        }
        let n = n as i64;
        self.free_window.fetch_sub(n, Ordering::AcqRel) - n < 0
    }

    pub fn refill(&self) {
        let cap = 2 * self.max_num;
        let window = self.window;
        let _ = self.free_window.fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
            Some((free + window).min(cap))
        });
    }

    /// Refills every `cycle_slice` until the returned future is dropped
    pub async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.cycle_slice, self.cycle_slice);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refill();
            trace!(free_window = self.free_window(), "flow control refill");
        }
    }
}
