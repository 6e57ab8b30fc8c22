use async_trait::async_trait;

use crate::TokenBucketError;

/// The consume script, versioned with the crate.
///
/// See the header of `consume_tokens.lua` for its input/output contract.
pub const CONSUME_TOKENS_SCRIPT: &str = include_str!("consume_tokens.lua");

const BUCKET_SUFFIX: &str = "b";
const LOCK_SUFFIX: &str = "l";

/// Redis keys touched by one consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    /// Hash holding `tokens` and `refilled_at`.
    pub bucket: String,
    /// Lockout marker, present while the key is cooling down.
    pub lock: String,
}

/// Script inputs, in the order the script reads them from `ARGV`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeScriptArgs {
    /// Bucket capacity.
    pub capacity: f64,
    /// Tokens to take.
    pub requested: f64,
    /// Tokens generated per time unit.
    pub refill_rate: f64,
    /// Refill granularity in milliseconds.
    pub time_unit_ms: u64,
    /// Lockout after a denial, `0` disables it.
    pub lock_seconds: u64,
    /// Expiry refreshed on every write of the bucket.
    pub key_expiry_ms: u64,
    /// Caller's notion of now, in epoch milliseconds.
    pub now_ms: u64,
}

/// Script output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptReply {
    /// Whether the request was denied.
    pub denied: bool,
    /// Balance after consumption, `-1` when denied.
    pub balance: f64,
}

impl ScriptReply {
    pub(crate) fn parse(denied: i64, balance: &str) -> Result<Self, TokenBucketError> {
        let denied = match denied {
            0 => false,
            1 => true,
            other => {
                return Err(TokenBucketError::UnexpectedScriptReply(format!(
                    "denied flag {other}"
                )));
            }
        };

        let balance = balance.parse::<f64>().map_err(|err| {
            TokenBucketError::UnexpectedScriptReply(format!("balance {balance:?}: {err}"))
        })?;

        Ok(Self { denied, balance })
    }
}

/// A key-value server able to run the consume script atomically.
///
/// [`RedisStore`](crate::RedisStore) is the production implementation; the
/// trait exists so the limiter can be driven by any client that can evaluate
/// [`CONSUME_TOKENS_SCRIPT`] as a single indivisible step.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Whether the store is currently able to serve requests.
    ///
    /// A store that is not ready is treated like one whose script failed.
    fn is_ready(&self) -> bool;

    /// Run the consume script for `keys` with `args`.
    async fn consume_tokens(
        &self,
        keys: &BucketKeys,
        args: &ConsumeScriptArgs,
    ) -> Result<ScriptReply, TokenBucketError>;
}

impl BucketKeys {
    /// Keys for an already prefixed key.
    ///
    /// The two suffixes differ in their last segment, so the bucket of one key
    /// can never be the lock of another.
    pub(crate) fn for_key(key: &str) -> Self {
        Self {
            bucket: format!("{key}:{BUCKET_SUFFIX}"),
            lock: format!("{key}:{LOCK_SUFFIX}"),
        }
    }
}
