use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use redis::{Client, Script, aio::ConnectionManager};

use crate::{
    BucketKeys, CONSUME_TOKENS_SCRIPT, Clock, ConsumeScriptArgs, ReadinessBackoff, ScriptReply,
    SharedStore, SystemClock, TokenBucketError,
};

const DEFAULT_UNAVAILABLE_BACKOFF: Duration = Duration::from_millis(1000);

/// [`SharedStore`] over one or more [`redis::aio::ConnectionManager`]s.
///
/// Requires Redis >= 4.0 (variadic `HSET`). Calls are spread round-robin over
/// the connection managers.
///
/// # Readiness
///
/// A connection-level failure (I/O, refused, dropped, timeout) marks the store
/// not ready for a back-off window. During that window [`is_ready`](SharedStore::is_ready)
/// reports `false` and the limiter skips the network round trip entirely; the
/// first call after the window probes the server again. Script-level errors do
/// not change readiness.
pub struct RedisStore {
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
    script: Script,
    readiness: ReadinessBackoff,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connections", &self.connection_managers.len())
            .field("track_index", &self.track_index.load(Ordering::Relaxed))
            .field("unavailable_until_ms", &self.readiness.unavailable_until_ms())
            .field("unavailable_backoff", &self.readiness.backoff())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store from a single connection manager.
    pub async fn default_from_client(client: Client) -> Result<Self, TokenBucketError> {
        Self::from_client(client, 1).await
    }

    /// Create a store holding `connection_count` connection managers.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, TokenBucketError> {
        if connection_count == 0 {
            return Err(TokenBucketError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connection_managers.push(client.get_connection_manager().await?);
        }

        Ok(Self::from_connection_managers(connection_managers))
    }

    /// Create a store from existing connection managers.
    ///
    /// An empty vector is not accepted.
    pub fn try_from_connection_managers(
        connection_managers: Vec<ConnectionManager>,
    ) -> Result<Self, TokenBucketError> {
        if connection_managers.is_empty() {
            return Err(TokenBucketError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        Ok(Self::from_connection_managers(connection_managers))
    }

    fn from_connection_managers(connection_managers: Vec<ConnectionManager>) -> Self {
        Self {
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
            script: Script::new(CONSUME_TOKENS_SCRIPT),
            readiness: ReadinessBackoff::new(DEFAULT_UNAVAILABLE_BACKOFF, Arc::new(SystemClock)),
        }
    }

    /// How long the store stays not ready after a connection failure.
    pub fn with_unavailable_backoff(mut self, backoff: Duration) -> Self {
        self.readiness = self.readiness.with_backoff(backoff);
        self
    }

    /// Time source of the back-off window.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.readiness = self.readiness.with_clock(clock);
        self
    }

    fn get(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    } // end method get
}

#[async_trait]
impl SharedStore for RedisStore {
    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    async fn consume_tokens(
        &self,
        keys: &BucketKeys,
        args: &ConsumeScriptArgs,
    ) -> Result<ScriptReply, TokenBucketError> {
        let mut connection_manager = self.get();

        let result: Result<(i64, String), redis::RedisError> = self
            .script
            .key(&keys.bucket)
            .key(&keys.lock)
            .arg(args.capacity)
            .arg(args.requested)
            .arg(args.refill_rate)
            .arg(args.time_unit_ms)
            .arg(args.lock_seconds)
            .arg(args.key_expiry_ms)
            .arg(args.now_ms)
            .invoke_async(&mut connection_manager)
            .await;

        match result {
            Ok((denied, balance)) => ScriptReply::parse(denied, &balance),
            Err(err) => {
                if self.readiness.observe_redis_error(&err) {
                    tracing::warn!(
                        error = %err,
                        backoff_ms = self.readiness.backoff().as_millis() as u64,
                        "Redis connection failed, marking store not ready"
                    );
                }

                Err(TokenBucketError::RedisError(err))
            }
        }
    } // end method consume_tokens
}
