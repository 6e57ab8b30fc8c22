#![cfg(feature = "redis-tokio")]

use std::{env, sync::Arc, thread, time::Duration};

use tokenbucket::{
    BucketParams, Capacity, Clock, DistributedOptions, ManualClock, RateLimitDecision,
    RateLimiter, RateLimiterOptions, RedisBucketStore, RedisStore, RefillRate, RejectionReason,
    SharedStore, SystemClock,
};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_prefix() -> String {
    let n: u64 = rand::random();
    format!("tokenbucket_test_{n}")
}

fn params(rate: f64, capacity: f64) -> BucketParams {
    let mut params = BucketParams::new(
        RefillRate::try_from(rate).unwrap(),
        Capacity::try_from(capacity).unwrap(),
    );
    params.key_prefix = unique_prefix();

    params
}

async fn build_store(
    url: &str,
    params: BucketParams,
    lock_seconds: u64,
) -> (RedisBucketStore, ManualClock) {
    let client = redis::Client::open(url).unwrap();
    let shared: Arc<dyn SharedStore> =
        Arc::new(RedisStore::default_from_client(client).await.unwrap());
    let clock = ManualClock::new(SystemClock.now_ms());

    let store = RedisBucketStore::new(shared, params, lock_seconds, None, Arc::new(clock.clone()));

    (store, clock)
}

#[test]
fn counts_down_and_denies_when_empty() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, _) = build_store(&url, params(2.0, 5.0), 0).await;

        for expected in [4.0, 3.0, 2.0, 1.0, 0.0] {
            let reply = store.consume("k", 1.0).await.unwrap();
            assert!(!reply.denied);
            assert_eq!(reply.balance, expected);
        }

        let reply = store.consume("k", 1.0).await.unwrap();
        assert!(reply.denied);
        assert_eq!(reply.balance, -1.0);
    });
}

#[test]
fn refills_per_whole_second() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, clock) = build_store(&url, params(1.0, 5.0), 0).await;

        assert_eq!(store.consume("k", 5.0).await.unwrap().balance, 0.0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(store.consume("k", 1.0).await.unwrap().balance, 0.0);

        // the 500ms left over from the previous call are not lost
        clock.advance(Duration::from_millis(500));
        assert_eq!(store.consume("k", 1.0).await.unwrap().balance, 0.0);

        assert!(store.consume("k", 1.0).await.unwrap().denied);
    });
}

#[test]
fn refill_is_capped_at_capacity() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, clock) = build_store(&url, params(2.0, 5.0), 0).await;

        store.consume("k", 1.0).await.unwrap();
        clock.advance(Duration::from_secs(3));

        assert_eq!(store.consume("k", 1.0).await.unwrap().balance, 4.0);
    });
}

#[test]
fn per_key_state_is_independent() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, _) = build_store(&url, params(1.0, 2.0), 0).await;

        store.consume("a", 2.0).await.unwrap();
        assert!(store.consume("a", 1.0).await.unwrap().denied);
        assert_eq!(store.consume("b", 1.0).await.unwrap().balance, 1.0);
    });
}

#[test]
fn denial_locks_key_until_marker_expires() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (store, clock) = build_store(&url, params(10.0, 1.0), 1).await;

        assert!(!store.consume("k", 1.0).await.unwrap().denied);
        assert!(store.consume("k", 1.0).await.unwrap().denied);

        // enough refill, but the lock marker is still there
        clock.advance(Duration::from_millis(1000));
        assert!(store.consume("k", 1.0).await.unwrap().denied);

        thread::sleep(Duration::from_millis(1100));
        assert!(!store.consume("k", 1.0).await.unwrap().denied);
    });
}

#[test]
fn bucket_key_gets_an_expiry() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let params = params(2.0, 5.0);
        let bucket_key = format!("{}:k:b", params.key_prefix);
        let (store, _) = build_store(&url, params, 0).await;

        store.consume("k", 1.0).await.unwrap();

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(&bucket_key)
            .query_async(&mut conn)
            .await
            .unwrap();

        assert!(ttl > 0 && ttl <= store.key_expiry_ms() as i64, "ttl = {ttl}");
    });
}

#[test]
fn concurrent_consumers_never_overspend() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let client = redis::Client::open(url).unwrap();
        let shared: Arc<dyn SharedStore> =
            Arc::new(RedisStore::from_client(client, 4).await.unwrap());
        let params = params(0.001, 10.0);

        let mut options = RateLimiterOptions::new(params.refill_rate, params.capacity);
        options.params = params;

        let rl = Arc::new(
            RateLimiter::distributed(
                options,
                DistributedOptions {
                    shared_store: Some(shared),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let handles = (0..40)
            .map(|_| {
                let rl = rl.clone();
                tokio::spawn(async move { rl.consume("hot", None, 1.0).await })
            })
            .collect::<Vec<_>>();

        let mut allowed = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                RateLimitDecision::Allowed { .. } => allowed += 1,
                RateLimitDecision::Rejected {
                    reason: RejectionReason::InsufficientTokens,
                } => rejected += 1,
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!(allowed, 10);
        assert_eq!(rejected, 30);
    });
}

#[test]
fn redis_store_debug_shows_readiness_state() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let client = redis::Client::open(url).unwrap();
        let store = RedisStore::from_client(client, 2)
            .await
            .unwrap()
            .with_unavailable_backoff(Duration::from_millis(250))
            .with_clock(Arc::new(ManualClock::new(0)));

        let debug = format!("{store:?}");

        assert!(debug.starts_with("RedisStore"));
        assert!(debug.contains("connections: 2"));
        assert!(debug.contains("track_index: 0"));
        assert!(debug.contains("unavailable_until_ms: 0"));
        assert!(debug.contains("unavailable_backoff: 250ms"));
        assert!(store.is_ready());
    });
}
