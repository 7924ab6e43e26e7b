//! Log rate limiting, so a sustained stream of runtime errors can't flood the
//! output.

use std::time::{Duration, Instant};

/// Allows one message per interval and counts the suppressed ones.
pub(crate) struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimiter {
    pub(crate) fn new(interval: Duration) -> Self {
        RateLimiter {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Check if a message can be emitted now. If so, returns the number of
    /// messages suppressed since the last emitted one.
    pub(crate) fn check(&mut self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    pub(crate) fn check_at(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// Number of suppressed messages not reported yet, resetting the count.
    pub(crate) fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

/// Log through a rate limiter, mentioning how many similar messages were
/// suppressed since the last one.
#[macro_export]
macro_rules! ratelimited {
    ($limiter:expr, $lvl:expr, $($arg:tt)+) => {{
        if let Some(suppressed) = $limiter.check() {
            if suppressed > 0 {
                log::log!($lvl, "({} similar message(s) suppressed)", suppressed);
            }
            log::log!($lvl, $($arg)+);
        }
    }};
}
