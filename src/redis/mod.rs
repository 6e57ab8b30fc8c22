//! Shared-store state.
//!
//! Buckets live in a key-value server and are only ever mutated through one
//! atomic script, [`CONSUME_TOKENS_SCRIPT`], so several processes can enforce one
//! budget without racing each other.
//!
//! - [`SharedStore`]: the seam to the server (script execution + readiness)
//! - [`RedisStore`]: Redis implementation (feature `redis-tokio`)
//! - [`RedisBucketStore`]: bucket parameters, key layout and expiry on top of a
//!   [`SharedStore`]
//!
//! # Consistency Semantics
//!
//! - **Atomic per key:** each script execution is indivisible within Redis
//! - **Approximate globally:** no ordering is guaranteed between callers beyond
//!   what the server's serialization of scripts provides
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokenbucket::{
//!     BucketParams, Capacity, RedisBucketStore, RedisStore, RefillRate, SystemClock,
//! };
//!
//! let client = redis::Client::open("redis://127.0.0.1:6379/")?;
//! let store = Arc::new(RedisStore::default_from_client(client).await?);
//!
//! let params = BucketParams::new(RefillRate::try_from(2.0)?, Capacity::try_from(5.0)?);
//! let buckets = RedisBucketStore::new(store, params, 0, None, Arc::new(SystemClock));
//!
//! let reply = buckets.consume("user_123", 1.0).await?;
//! assert!(!reply.denied);
//! ```

mod common;
pub use common::*;

mod readiness;
pub use readiness::*;

mod redis_bucket_store;
pub use redis_bucket_store::*;

#[cfg(feature = "redis-tokio")]
mod redis_store;
#[cfg(feature = "redis-tokio")]
pub use redis_store::*;
