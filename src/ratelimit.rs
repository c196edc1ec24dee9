//! Rate-limited logging gate
//!
//! A small crate-local utility with the contract "returns true at most N
//! times per window of W seconds", grounded in `vlog_rate_limit`. This is not
//! a feature of `tracing` itself; it's a gate checked before emitting a
//! `tracing::warn!`/`tracing::debug!` call.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct State {
    window_start: Instant,
    count_in_window: u32,
}

/// Allows at most `burst` events per `window`, then suppresses until the
/// window rolls over.
pub struct RateLimiter {
    burst: u32,
    window: Duration,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(burst: u32, window: Duration) -> Self {
        Self {
            burst,
            window,
            state: Mutex::new(State { window_start: Instant::now(), count_in_window: 0 }),
        }
    }

    /// `(1 event, 5s window)`, matching the original's `rl`: gates per-packet
    /// warnings on the hot path.
    pub fn fast() -> Self {
        Self::new(1, Duration::from_secs(5))
    }

    /// `(60 events, 60s window)`, matching the original's `dbg_rl`: gates
    /// verbose pre/post flow diagnostic traces.
    pub fn debug() -> Self {
        Self::new(60, Duration::from_secs(60))
    }

    /// Returns true if an event may be emitted right now, and records it.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count_in_window = 0;
        }
        if state.count_in_window < self.burst {
            state.count_in_window += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_burst_then_suppresses() {
        let rl = RateLimiter::new(2, Duration::from_secs(60));
        assert!(rl.allow());
        assert!(rl.allow());
        assert!(!rl.allow());
    }

    #[test]
    fn resets_after_window() {
        let rl = RateLimiter::new(1, Duration::from_millis(20));
        assert!(rl.allow());
        assert!(!rl.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.allow());
    }
}
