use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::Clock;

/// Not-ready window opened by connection failures.
///
/// After [`mark_unavailable`](Self::mark_unavailable), [`is_ready`](Self::is_ready)
/// reports `false` until the back-off has passed. Overlapping failures never
/// shorten an open window.
#[derive(Debug)]
pub struct ReadinessBackoff {
    unavailable_until_ms: AtomicU64,
    backoff: Duration,
    clock: Arc<dyn Clock>,
}

impl ReadinessBackoff {
    /// A back-off that starts out ready.
    pub fn new(backoff: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            unavailable_until_ms: AtomicU64::new(0),
            backoff,
            clock,
        }
    }

    /// Replace the window length.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the back-off window, if any, has passed.
    pub fn is_ready(&self) -> bool {
        self.clock.now_ms() >= self.unavailable_until_ms()
    }

    /// Open (or extend) the not-ready window from now.
    pub fn mark_unavailable(&self) {
        let backoff_ms = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        let until_ms = self.clock.now_ms().saturating_add(backoff_ms);

        self.unavailable_until_ms.fetch_max(until_ms, Ordering::Relaxed);
    }

    /// Open the window if `err` is a connection-level failure (I/O, refused,
    /// dropped or timeout). Returns whether it did.
    ///
    /// Script and protocol errors leave readiness untouched.
    #[cfg(feature = "redis-tokio")]
    pub fn observe_redis_error(&self, err: &redis::RedisError) -> bool {
        let connection_error = err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout();

        if connection_error {
            self.mark_unavailable();
        }

        connection_error
    }

    /// End of the current not-ready window in epoch milliseconds, `0` if none was opened.
    pub fn unavailable_until_ms(&self) -> u64 {
        self.unavailable_until_ms.load(Ordering::Relaxed)
    }

    /// Length of the not-ready window.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}
