//! Top-level entrypoint that wires the abuse guard and the bucket stores.
//!
//! A [`RateLimiter`] is either local (in-process buckets only) or distributed
//! (buckets in a [`SharedStore`], with an optional in-process insurance limiter).
//! Both put the same [`AbuseGuard`] in front of the buckets.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    AbuseGuard, AbuseGuardOptions, BucketParams, Capacity, ClientAddress, Clock,
    LocalBucketStore, RateLimitDecision, RedisBucketStore, RefillRate, RejectionReason,
    ScriptReply, SharedStore, SystemClock, TokenBucketError,
};

const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_STALE_AFTER_MS: u64 = 60_000;
const FAIL_OPEN_TOKENS: f64 = 1f64;

/// Configuration shared by local and distributed limiters.
#[derive(Clone, Debug)]
pub struct RateLimiterOptions {
    /// Refill rate, capacity and key prefix.
    pub params: BucketParams,
    /// Cooldown applied to a key after a denial. `0` disables it.
    pub lock_duration_seconds: u64,
    /// Per-block-key abuse protection in front of the buckets.
    pub abuse_guard: Option<AbuseGuardOptions>,
    /// Time source for refill, lockouts and abuse windows.
    pub clock: Arc<dyn Clock>,
}

impl RateLimiterOptions {
    /// Options with no key prefix, no lockout, no abuse guard and the system clock.
    pub fn new(refill_rate: RefillRate, capacity: Capacity) -> Self {
        Self {
            params: BucketParams::new(refill_rate, capacity),
            lock_duration_seconds: 0,
            abuse_guard: None,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Parameters of the insurance limiter.
///
/// The insurance limiter only sees this process's traffic, so it usually gets
/// this instance's share of the distributed budget. Unset values fall back to
/// the distributed limiter's own.
#[derive(Clone, Debug, Default)]
pub struct InsuranceOptions {
    /// Refill rate of the insurance buckets.
    pub refill_rate: Option<RefillRate>,
    /// Capacity of the insurance buckets.
    pub capacity: Option<Capacity>,
}

/// Shared-store specific configuration of a distributed limiter.
#[derive(Clone, Default)]
pub struct DistributedOptions {
    /// Store holding the shared buckets.
    pub shared_store: Option<Arc<dyn SharedStore>>,
    /// In-process fallback used while the shared store fails.
    pub insurance: Option<InsuranceOptions>,
    /// Overrides the default expiry of shared buckets.
    pub key_expiry_ms: Option<u64>,
    /// Upper bound on one shared-store call. A timeout counts as a store failure.
    pub timeout: Option<Duration>,
}

enum Backend {
    Local(LocalBucketStore),
    Distributed {
        shared: Option<RedisBucketStore>,
        insurance: Option<LocalBucketStore>,
        timeout: Option<Duration>,
    },
}

/// Rate limiter entrypoint.
///
/// # Decision order
///
/// 1. [`AbuseGuard`]: a locked-out block key is rejected before anything else
/// 2. the buckets: local, or shared through the consume script
/// 3. on shared-store failure, the insurance limiter if configured
/// 4. otherwise fail open, reporting one available token
///
/// The attempt is then counted against the block key. Zero-token requests only
/// report the balance and are not counted.
///
/// # Examples
///
/// ```
/// use tokenbucket::{Capacity, RateLimiter, RateLimiterOptions, RefillRate};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let options = RateLimiterOptions::new(
///     RefillRate::try_from(2.0).unwrap(),
///     Capacity::try_from(5.0).unwrap(),
/// );
/// let rl = RateLimiter::local(options).unwrap();
///
/// let decision = rl.consume("user_123", None, 1.0).await;
/// assert!(decision.is_allowed());
/// assert_eq!(decision.remaining_tokens(), 4.0);
/// # });
/// ```
pub struct RateLimiter {
    backend: Backend,
    abuse_guard: Option<AbuseGuard>,
    cleanup_running: AtomicBool,
    cleanup_generation: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter whose buckets live in this process.
    pub fn local(options: RateLimiterOptions) -> Result<Self, TokenBucketError> {
        let RateLimiterOptions {
            params,
            lock_duration_seconds,
            abuse_guard,
            clock,
        } = options;

        let abuse_guard = abuse_guard
            .map(|options| AbuseGuard::new(options, clock.clone()))
            .transpose()?;

        Ok(Self::with_backend(
            Backend::Local(LocalBucketStore::new(params, lock_duration_seconds, clock)),
            abuse_guard,
        ))
    }

    /// Create a limiter whose buckets live in a shared store.
    ///
    /// Fails when neither a shared store nor insurance is configured.
    pub fn distributed(
        options: RateLimiterOptions,
        distributed: DistributedOptions,
    ) -> Result<Self, TokenBucketError> {
        let RateLimiterOptions {
            params,
            lock_duration_seconds,
            abuse_guard,
            clock,
        } = options;
        let DistributedOptions {
            shared_store,
            insurance,
            key_expiry_ms,
            timeout,
        } = distributed;

        if shared_store.is_none() && insurance.is_none() {
            return Err(TokenBucketError::MissingSharedStore);
        }

        if shared_store.is_none() {
            tracing::warn!("No shared store configured, every request uses the insurance limiter");
        }

        let abuse_guard = abuse_guard
            .map(|options| AbuseGuard::new(options, clock.clone()))
            .transpose()?;

        let insurance = insurance.map(|insurance| {
            let insurance_params = BucketParams {
                refill_rate: insurance.refill_rate.unwrap_or(params.refill_rate),
                capacity: insurance.capacity.unwrap_or(params.capacity),
                key_prefix: params.key_prefix.clone(),
            };

            LocalBucketStore::new(insurance_params, lock_duration_seconds, clock.clone())
        });

        let shared = shared_store.map(|store| {
            RedisBucketStore::new(store, params, lock_duration_seconds, key_expiry_ms, clock)
        });

        Ok(Self::with_backend(
            Backend::Distributed {
                shared,
                insurance,
                timeout,
            },
            abuse_guard,
        ))
    }

    fn with_backend(backend: Backend, abuse_guard: Option<AbuseGuard>) -> Self {
        Self {
            backend,
            abuse_guard,
            cleanup_running: AtomicBool::new(false),
            cleanup_generation: AtomicU64::new(0),
        }
    }

    /// Take `requested` tokens from the bucket of `token_key`.
    ///
    /// `block_key` is the identity tracked by the abuse guard and defaults to
    /// `token_key`. Several token keys (e.g. one per route) can share one block
    /// key (e.g. the client address).
    ///
    /// Never fails: shared-store errors are logged and answered by the insurance
    /// limiter or by failing open.
    pub async fn consume(
        &self,
        token_key: &str,
        block_key: Option<&str>,
        requested: f64,
    ) -> RateLimitDecision {
        let block_key = block_key.unwrap_or(token_key);
        let requested = requested.max(0f64);

        if let Some(guard) = &self.abuse_guard
            && guard.is_blocked(block_key)
        {
            tracing::debug!(token_key, block_key, "Rejected by abuse guard");
            return RateLimitDecision::Rejected {
                reason: RejectionReason::AbuseBlocked,
            };
        }

        let decision = match &self.backend {
            Backend::Local(store) => store.consume(token_key, requested),
            Backend::Distributed {
                shared,
                insurance,
                timeout,
            } => {
                Self::consume_distributed(
                    shared.as_ref(),
                    insurance.as_ref(),
                    *timeout,
                    token_key,
                    requested,
                )
                .await
            }
        };

        if requested > 0f64
            && let Some(guard) = &self.abuse_guard
        {
            guard.record_consumption(block_key);
        }

        decision
    } // end method consume

    /// Take one token for the client that sent `request`.
    ///
    /// The effective token key is the client address followed by `token_key`;
    /// `block_key` defaults to that effective key.
    pub async fn consume_by_client_address<R: ClientAddress + ?Sized>(
        &self,
        request: &R,
        token_key: &str,
        block_key: Option<&str>,
    ) -> RateLimitDecision {
        let key = format!("{}{}", request.client_address(), token_key);

        self.consume(&key, block_key, 1f64).await
    }

    async fn consume_distributed(
        shared: Option<&RedisBucketStore>,
        insurance: Option<&LocalBucketStore>,
        timeout: Option<Duration>,
        key: &str,
        requested: f64,
    ) -> RateLimitDecision {
        let error = match shared {
            None => None,
            Some(shared) => match Self::consume_shared(shared, timeout, key, requested).await {
                Ok(reply) if reply.denied => {
                    return RateLimitDecision::Rejected {
                        reason: RejectionReason::InsufficientTokens,
                    };
                }
                Ok(reply) => {
                    return RateLimitDecision::Allowed {
                        remaining_tokens: reply.balance.max(0f64),
                    };
                }
                Err(err) => Some(err),
            },
        };

        match insurance {
            Some(insurance) => {
                if let Some(err) = &error {
                    tracing::warn!(
                        error = %err,
                        key,
                        "Shared store failed, using insurance limiter"
                    );
                }

                insurance.consume(key, requested)
            }
            None => {
                tracing::warn!(error = ?error, key, "Shared store failed, failing open");

                RateLimitDecision::Allowed {
                    remaining_tokens: FAIL_OPEN_TOKENS,
                }
            }
        }
    } // end method consume_distributed

    async fn consume_shared(
        shared: &RedisBucketStore,
        timeout: Option<Duration>,
        key: &str,
        requested: f64,
    ) -> Result<ScriptReply, TokenBucketError> {
        match timeout {
            None => shared.consume(key, requested).await,
            Some(timeout) => tokio::time::timeout(timeout, shared.consume(key, requested))
                .await
                .map_err(|_| TokenBucketError::SharedStoreTimeout(timeout))?,
        }
    }

    /// The abuse guard, when configured.
    pub fn abuse_guard(&self) -> Option<&AbuseGuard> {
        self.abuse_guard.as_ref()
    }

    /// The buckets of a local limiter.
    pub fn local_store(&self) -> Option<&LocalBucketStore> {
        match &self.backend {
            Backend::Local(store) => Some(store),
            Backend::Distributed { .. } => None,
        }
    }

    /// The insurance buckets of a distributed limiter.
    pub fn insurance_store(&self) -> Option<&LocalBucketStore> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Distributed { insurance, .. } => insurance.as_ref(),
        }
    }

    /// The shared buckets of a distributed limiter.
    pub fn shared_store(&self) -> Option<&RedisBucketStore> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Distributed { shared, .. } => shared.as_ref(),
        }
    }

    /// Evict idle in-process buckets and sweep the abuse guard.
    ///
    /// Shared buckets expire on their own and are not touched.
    pub fn cleanup(&self, stale_after_ms: u64) {
        if let Some(store) = self.local_store() {
            store.cleanup(stale_after_ms);
        }

        if let Some(store) = self.insurance_store() {
            store.cleanup(stale_after_ms);
        }

        if let Some(guard) = &self.abuse_guard {
            guard.sweep();
        }
    } // end method cleanup

    fn default_stale_after_ms(&self) -> u64 {
        self.local_store()
            .or(self.insurance_store())
            .map(LocalBucketStore::full_refill_ms)
            .unwrap_or(DEFAULT_STALE_AFTER_MS)
    }

    /// Run [`cleanup`](Self::cleanup) every 30 seconds on a background thread.
    ///
    /// Buckets are considered stale once they would have refilled completely.
    pub fn run_cleanup_loop(self: &Arc<Self>) {
        self.run_cleanup_loop_with_config(
            self.default_stale_after_ms(),
            DEFAULT_CLEANUP_INTERVAL_MS,
        );
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval_ms` on a background thread.
    ///
    /// The first cleanup runs immediately. Calling this while a loop is running
    /// does nothing. The thread only holds a weak reference and exits once the
    /// limiter is dropped or [`stop_cleanup_loop`](Self::stop_cleanup_loop) is called.
    pub fn run_cleanup_loop_with_config(
        self: &Arc<Self>,
        stale_after_ms: u64,
        cleanup_interval_ms: u64,
    ) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let generation = self.cleanup_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let limiter = Arc::downgrade(self);
        let interval = Duration::from_millis(cleanup_interval_ms.max(1));

        tracing::info!(stale_after_ms, cleanup_interval_ms, "Starting cleanup loop");

        thread::spawn(move || {
            loop {
                {
                    let Some(limiter) = limiter.upgrade() else {
                        break;
                    };

                    if limiter.cleanup_generation.load(Ordering::SeqCst) != generation {
                        break;
                    }

                    limiter.cleanup(stale_after_ms);
                }

                thread::sleep(interval);
            }
        });
    } // end method run_cleanup_loop_with_config

    /// Stop the cleanup loop. Idempotent.
    pub fn stop_cleanup_loop(&self) {
        if self.cleanup_running.swap(false, Ordering::SeqCst) {
            self.cleanup_generation.fetch_add(1, Ordering::SeqCst);
            tracing::info!("Stopped cleanup loop");
        }
    }
}
