use std::ops::Deref;

/// Tokens generated per second.
///
/// Must be a finite value greater than `0`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RefillRate(f64);

impl Deref for RefillRate {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for RefillRate {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err("Refill rate must be greater than 0".to_string())
        } else {
            Ok(Self(value))
        }
    }
}

/// Maximum number of tokens a bucket can hold.
///
/// This is both the largest burst a key can spend at once and the level a new
/// bucket starts at. Must be a finite value greater than `0`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Capacity(f64);

impl Deref for Capacity {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for Capacity {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err("Capacity must be greater than 0".to_string())
        } else {
            Ok(Self(value))
        }
    }
}

/// Consumption attempts per minute after which a block key is locked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbuseThreshold(u64);

impl Deref for AbuseThreshold {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for AbuseThreshold {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err("Abuse threshold must be at least 1".to_string())
        } else {
            Ok(Self(value))
        }
    }
}

/// Immutable parameters shared by every bucket of one limiter.
#[derive(Debug, Clone)]
pub struct BucketParams {
    /// Tokens generated per second.
    pub refill_rate: RefillRate,
    /// Burst size and initial fill level.
    pub capacity: Capacity,
    /// Namespace prepended to every key. Empty means no namespace.
    pub key_prefix: String,
}

impl BucketParams {
    /// Parameters without a key prefix.
    pub fn new(refill_rate: RefillRate, capacity: Capacity) -> Self {
        Self {
            refill_rate,
            capacity,
            key_prefix: String::new(),
        }
    }

    pub(crate) fn prefixed_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// Milliseconds an empty bucket needs to refill to capacity.
    pub fn full_refill_ms(&self) -> u64 {
        (*self.capacity / *self.refill_rate * 1000f64).ceil() as u64
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The bucket does not hold enough tokens.
    InsufficientTokens,
    /// The key is cooling down after an earlier denial.
    LockedOut,
    /// The block key exceeded its per-minute consumption threshold.
    AbuseBlocked,
}

/// Outcome of a consume call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    /// The request/work is allowed.
    Allowed {
        /// Balance left in the bucket after this consumption.
        remaining_tokens: f64,
    },
    /// The request/work is rejected. Bucket state is left as it was.
    Rejected {
        /// What caused the rejection.
        reason: RejectionReason,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Current balance as seen by the caller, `0` for rejections.
    pub fn remaining_tokens(&self) -> f64 {
        match self {
            Self::Allowed { remaining_tokens } => *remaining_tokens,
            Self::Rejected { .. } => 0f64,
        }
    }
}

/// Tokens held by a bucket after refilling from `last_refill_ms` up to `now_ms`.
///
/// Elapsed time is clamped at zero so that an out-of-order clock reading never
/// drains a bucket.
pub(crate) fn refilled_tokens(
    tokens: f64,
    last_refill_ms: u64,
    now_ms: u64,
    refill_rate: RefillRate,
    capacity: Capacity,
) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(last_refill_ms) as f64;
    let generated = elapsed_ms * *refill_rate / 1000f64;

    (tokens + generated).min(*capacity)
}
