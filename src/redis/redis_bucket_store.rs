use std::sync::Arc;

use crate::{
    BucketKeys, BucketParams, Clock, ConsumeScriptArgs, ScriptReply, SharedStore,
    TokenBucketError,
};

const TIME_UNIT_MS: u64 = 1000;

/// Token buckets held in a shared key-value server.
///
/// Every consume is one execution of the consume script, so the
/// read-modify-write of a bucket is indivisible across any number of callers
/// on any number of processes.
///
/// # Data model
///
/// - `<prefix>:<key>:b`: hash with `tokens` and `refilled_at` (epoch ms)
/// - `<prefix>:<key>:l`: lockout marker, written with `NX` so concurrent
///   denials never extend each other's lockout
///
/// Both expire on their own. The bucket expiry is refreshed on every write and
/// defaults to the time an empty bucket needs to refill, plus one refill unit,
/// so an expired bucket is always one that would have been full again.
///
/// # Refill granularity
///
/// Tokens are added per whole second. The stored timestamp advances by the
/// whole seconds credited rather than to `now`, so fractional seconds are
/// never lost between calls.
pub struct RedisBucketStore {
    store: Arc<dyn SharedStore>,
    params: BucketParams,
    lock_seconds: u64,
    key_expiry_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RedisBucketStore {
    /// Create a store over `store`.
    ///
    /// `key_expiry_ms` overrides the default bucket expiry.
    pub fn new(
        store: Arc<dyn SharedStore>,
        params: BucketParams,
        lock_seconds: u64,
        key_expiry_ms: Option<u64>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key_expiry_ms = key_expiry_ms
            .unwrap_or_else(|| Self::default_key_expiry_ms(&params))
            .max(1);

        Self {
            store,
            params,
            lock_seconds,
            key_expiry_ms,
            clock,
        }
    } // end constructor

    fn default_key_expiry_ms(params: &BucketParams) -> u64 {
        let units = (*params.capacity / *params.refill_rate).ceil() as u64;

        units.saturating_mul(TIME_UNIT_MS).saturating_add(TIME_UNIT_MS)
    }

    /// Expiry attached to every bucket write.
    pub fn key_expiry_ms(&self) -> u64 {
        self.key_expiry_ms
    }

    /// Keys used for `key`.
    pub fn keys(&self, key: &str) -> BucketKeys {
        BucketKeys::for_key(&self.params.prefixed_key(key))
    }

    /// Take `requested` tokens from the shared bucket of `key`.
    ///
    /// Fails with [`TokenBucketError::SharedStoreNotReady`] without contacting
    /// the server when the store reports it is not ready.
    pub async fn consume(
        &self,
        key: &str,
        requested: f64,
    ) -> Result<ScriptReply, TokenBucketError> {
        if !self.store.is_ready() {
            return Err(TokenBucketError::SharedStoreNotReady);
        }

        let args = ConsumeScriptArgs {
            capacity: *self.params.capacity,
            requested: requested.max(0f64),
            refill_rate: *self.params.refill_rate,
            time_unit_ms: TIME_UNIT_MS,
            lock_seconds: self.lock_seconds,
            key_expiry_ms: self.key_expiry_ms,
            now_ms: self.clock.now_ms(),
        };

        self.store.consume_tokens(&self.keys(key), &args).await
    } // end method consume
}
