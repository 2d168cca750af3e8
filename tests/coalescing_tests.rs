//! Dedup / coalescing tests - one outbound call per idempotency key

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use persona_guard::Error;
use persona_guard::caller::Caller;
use persona_guard::clock::ManualClock;
use persona_guard::config::DedupConfig;
use persona_guard::events::{GuardEvent, RecordingSink};
use persona_guard::failsafe::Sweep;
use persona_guard::idempotency::{DedupCache, IdempotencyKey};
use serde_json::{Value, json};

fn cache() -> (DedupCache<Value>, Arc<ManualClock>, Arc<RecordingSink>) {
    let clock = Arc::new(ManualClock::new());
    let sink = Arc::new(RecordingSink::new());
    let cache = DedupCache::with_parts(&DedupConfig::default(), clock.clone(), sink.clone());
    (cache, clock, sink)
}

fn create_key(arguments: &Value) -> IdempotencyKey {
    let caller = Caller::Authenticated("alice".to_string());
    IdempotencyKey::from_arguments(&caller, "create_persona", arguments, &DedupConfig::default().volatile_fields)
}

#[tokio::test]
async fn test_concurrent_duplicates_share_one_call() {
    // GIVEN: ten concurrent create requests differing only in request_id
    // WHEN: all run through the cache while the first is still in flight
    // THEN: the backend is called once and every caller sees the same value
    let (cache, _, sink) = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..10).map(|i| {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        let key = create_key(&json!({"name": "Ada Lovelace", "request_id": format!("req-{i}")}));
        async move {
            cache
                .run(&key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!({"persona_id": "p-ada"}))
                })
                .await
        }
    });
    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == &Ok(json!({"persona_id": "p-ada"}))));
    let coalesced = sink
        .events()
        .iter()
        .filter(|e| matches!(e, GuardEvent::Coalesced { .. }))
        .count();
    assert_eq!(coalesced, 9);
}

#[tokio::test]
async fn test_concurrent_duplicates_share_one_failure() {
    let (cache, _, _) = cache();
    let key = create_key(&json!({"name": "Grace Hopper"}));
    let failure = Error::backend("personas", Some(502), "bad gateway");

    let requests = (0..4).map(|_| {
        let cache = cache.clone();
        let key = key.clone();
        let failure = failure.clone();
        async move {
            cache
                .run(&key, || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(failure)
                })
                .await
        }
    });
    let results = join_all(requests).await;
    assert!(results.iter().all(|r| r == &Err(failure.clone())));

    // The failed key is free for an immediate retry
    let retried = cache.run(&key, || async { Ok(json!("ok")) }).await;
    assert_eq!(retried, Ok(json!("ok")));
}

#[tokio::test]
async fn test_completed_result_replayed_until_freshness_expires() {
    let (cache, clock, _) = cache();
    let key = create_key(&json!({"name": "Alan Turing"}));
    let calls = AtomicUsize::new(0);
    let call = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"persona_id": "p-turing"}))
    };

    cache.run(&key, call).await.unwrap();
    clock.advance(Duration::from_secs(299));
    cache.run(&key, call).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(2));
    cache.run(&key, call).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancelled_executor_releases_waiters_and_key() {
    let (cache, _, _) = cache();
    let key = create_key(&json!({"name": "Katherine Johnson"}));

    let executor = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move {
            cache
                .run(&key, || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!("never"))
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    let waiter = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.run(&key, || async { Ok(json!("second")) }).await })
    };
    tokio::task::yield_now().await;

    executor.abort();
    let outcome = waiter.await.unwrap();
    assert!(matches!(outcome, Err(Error::Abandoned(_))));
    assert!(cache.is_empty());
}

#[test]
fn test_sweep_reaps_records_past_twice_freshness() {
    let (cache, clock, _) = cache();
    let key = create_key(&json!({"name": "Hedy Lamarr"}));
    tokio_test::block_on(cache.run(&key, || async { Ok(json!(1)) })).unwrap();

    clock.advance(Duration::from_secs(600));
    assert_eq!(cache.sweep(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(cache.sweep(), 1);
    assert!(cache.is_empty());
}
