use std::time::Duration;

/// Error type for this crate.
///
/// Rate limit denials are not errors; they are reported through
/// [`RateLimitDecision::Rejected`](crate::RateLimitDecision::Rejected).
#[derive(Debug, thiserror::Error)]
pub enum TokenBucketError {
    /// Redis error.
    #[cfg(feature = "redis-tokio")]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The shared store reported itself as not ready to serve requests.
    #[error("shared store is not ready")]
    SharedStoreNotReady,

    /// The shared store did not answer within the configured timeout.
    #[error("shared store did not answer within {0:?}")]
    SharedStoreTimeout(Duration),

    /// The token script answered with something other than `[denied, balance]`.
    #[error("unexpected reply from token script: {0}")]
    UnexpectedScriptReply(String),

    /// A distributed limiter was built without a shared store and without insurance.
    #[error("a shared store is required when insurance is disabled")]
    MissingSharedStore,

    /// Structurally invalid limiter configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid Redis client connection count.
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),
}
