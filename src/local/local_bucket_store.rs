use std::sync::Arc;

use dashmap::DashMap;

use crate::{BucketParams, Clock, RateLimitDecision, RejectionReason, common::refilled_tokens};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    pub tokens: f64,
    pub last_refill_ms: u64,
    pub locked_until_ms: u64,
}

/// In-process token buckets keyed by string identity.
///
/// Refill happens on access: every call computes the tokens generated since the
/// bucket was last touched, so no timer runs per key and a key unseen for hours
/// costs the same as a hot one.
///
/// # Thread Safety
///
/// Each consume runs its whole read-modify-write while holding the
/// [`DashMap`] entry guard for the key, which gives the same per-key atomicity
/// the Redis script provides. Different keys on different shards proceed in
/// parallel.
///
/// # Lockout
///
/// With a non-zero lock duration, a denied consume locks the key. While locked,
/// every consume is rejected with [`RejectionReason::LockedOut`] without
/// computing refill, even if the bucket would have refilled meanwhile.
///
/// # Memory
///
/// Buckets are created lazily at full capacity and only removed by
/// [`cleanup`](Self::cleanup). A bucket idle for [`BucketParams::full_refill_ms`]
/// would be full again, so evicting it after that long loses nothing.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tokenbucket::{BucketParams, Capacity, LocalBucketStore, ManualClock, RefillRate};
///
/// let params = BucketParams::new(
///     RefillRate::try_from(2.0).unwrap(),
///     Capacity::try_from(5.0).unwrap(),
/// );
/// let store = LocalBucketStore::new(params, 0, Arc::new(ManualClock::new(0)));
///
/// assert_eq!(store.consume("user_123", 1.0).remaining_tokens(), 4.0);
/// ```
#[derive(Debug)]
pub struct LocalBucketStore {
    params: BucketParams,
    lock_duration_ms: u64,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, Bucket>,
}

impl LocalBucketStore {
    /// Create an empty store. `lock_duration_seconds == 0` disables lockouts.
    pub fn new(params: BucketParams, lock_duration_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            params,
            lock_duration_ms: lock_duration_seconds.saturating_mul(1000),
            clock,
            buckets: DashMap::new(),
        }
    } // end constructor

    /// Bucket parameters of this store.
    pub fn params(&self) -> &BucketParams {
        &self.params
    }

    /// Try to take `requested` tokens from the bucket of `key`.
    ///
    /// - `Allowed` carries the balance after consumption.
    /// - `Rejected` leaves the refilled balance in place; there is no debt.
    ///
    /// A `requested` of `0` never changes the balance and reports it as
    /// `Allowed`, unless the key is locked out.
    pub fn consume(&self, key: &str, requested: f64) -> RateLimitDecision {
        let requested = requested.max(0f64);
        let now_ms = self.clock.now_ms();

        let mut bucket = self
            .buckets
            .entry(self.params.prefixed_key(key))
            .or_insert_with(|| Bucket {
                tokens: *self.params.capacity,
                last_refill_ms: now_ms,
                locked_until_ms: 0,
            });

        if now_ms < bucket.locked_until_ms {
            return RateLimitDecision::Rejected {
                reason: RejectionReason::LockedOut,
            };
        }

        bucket.tokens = refilled_tokens(
            bucket.tokens,
            bucket.last_refill_ms,
            now_ms,
            self.params.refill_rate,
            self.params.capacity,
        );
        bucket.last_refill_ms = bucket.last_refill_ms.max(now_ms);

        let remaining = bucket.tokens - requested;

        if remaining < 0f64 {
            if self.lock_duration_ms > 0 {
                bucket.locked_until_ms = now_ms.saturating_add(self.lock_duration_ms);
                tracing::debug!(key, lock_ms = self.lock_duration_ms, "Locking out key");
            }

            return RateLimitDecision::Rejected {
                reason: RejectionReason::InsufficientTokens,
            };
        }

        bucket.tokens = remaining;

        RateLimitDecision::Allowed {
            remaining_tokens: remaining,
        }
    } // end method consume

    /// Current refilled balance of `key` without consuming or touching state.
    ///
    /// Unknown keys report full capacity.
    pub fn tokens(&self, key: &str) -> f64 {
        let Some(bucket) = self.buckets.get(&self.params.prefixed_key(key)) else {
            return *self.params.capacity;
        };

        refilled_tokens(
            bucket.tokens,
            bucket.last_refill_ms,
            self.clock.now_ms(),
            self.params.refill_rate,
            self.params.capacity,
        )
    }

    /// Whether `key` is currently locked out.
    pub fn is_locked(&self, key: &str) -> bool {
        let now_ms = self.clock.now_ms();

        self.buckets
            .get(&self.params.prefixed_key(key))
            .is_some_and(|bucket| now_ms < bucket.locked_until_ms)
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the store holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Milliseconds after which an idle bucket is indistinguishable from a new one.
    pub fn full_refill_ms(&self) -> u64 {
        self.params.full_refill_ms()
    }

    /// Evict buckets untouched for more than `stale_after_ms` whose lockout is over.
    pub fn cleanup(&self, stale_after_ms: u64) {
        let now_ms = self.clock.now_ms();

        self.buckets.retain(|_, bucket| {
            now_ms < bucket.locked_until_ms
                || now_ms.saturating_sub(bucket.last_refill_ms) <= stale_after_ms
        });
    } // end method cleanup
} // end of impl
