//! Creation deduplication with in-flight coalescing
//!
//! Prevents duplicate side effects when clients retry tool calls (for example
//! "create persona" after a timeout on their side).
//!
//! # How it works
//!
//! 1. The caller derives an [`IdempotencyKey`] from its identity and the
//!    arguments that make two requests semantically the same.
//! 2. [`DedupCache::begin`] looks the key up and installs a pending record in
//!    the same map operation, before anything can await:
//!    - `Completed` and still fresh → the stored result is returned, no call.
//!    - `InFlight` → a [`PendingResult`] that resolves with the executing
//!      caller's outcome, success or failure.
//!    - absent → a [`CommitHandle`]; this caller is the sole executor.
//! 3. [`CommitHandle::commit`] stores a success as `Completed`, removes the
//!    record on failure so the key can be retried at once, and wakes every
//!    coalesced caller with the same `Result`.
//! 4. Dropping a `CommitHandle` without committing (cancelled task) removes the
//!    record and releases waiters with [`Error::Abandoned`].
//! 5. A periodic sweep evicts records older than twice their TTL.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use crate::caller::Caller;
use crate::clock::{self, SharedClock};
use crate::config::DedupConfig;
use crate::events::{self, GuardEvent, SharedSink};
use crate::failsafe::Sweep;
use crate::{Error, Result};

// ── Key derivation ────────────────────────────────────────────────────────────

/// Deterministic identifier of a semantically unique operation
///
/// Hex-encoded SHA-256 over length-prefixed fields, so no choice of field
/// contents can make two different field tuples produce the same input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Start a key for `operation` performed by `caller`
    #[must_use]
    pub fn builder(caller: &Caller, operation: &str) -> KeyBuilder {
        KeyBuilder::new()
            .field("caller", &caller.identifier())
            .field("operation", operation)
    }

    /// Derive a key from a JSON argument object
    ///
    /// Top-level fields listed in `volatile_fields` (timestamps, request ids)
    /// are dropped; the rest is hashed in canonical sorted-key form, so the key
    /// does not depend on the order the client sent fields in.
    #[must_use]
    pub fn from_arguments(caller: &Caller, operation: &str, arguments: &Value, volatile_fields: &[String]) -> Self {
        let mut significant = arguments.clone();
        if let Value::Object(map) = &mut significant {
            for field in volatile_fields {
                map.remove(field);
            }
        }
        let canonical = serde_json::to_string(&significant).unwrap_or_default();
        Self::builder(caller, operation)
            .field("arguments", &canonical)
            .finish()
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental [`IdempotencyKey`] construction
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Add a named, semantically significant field
    #[must_use]
    pub fn field(mut self, name: &str, value: &str) -> Self {
        for part in [name.as_bytes(), value.as_bytes()] {
            self.hasher.update((part.len() as u64).to_be_bytes());
            self.hasher.update(part);
        }
        self
    }

    /// Add an optional field; `None` and `Some("")` hash differently
    #[must_use]
    pub fn optional_field(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.field(name, "some").field(name, v),
            None => self.field(name, "none"),
        }
    }

    /// Finish the key
    #[must_use]
    pub fn finish(self) -> IdempotencyKey {
        IdempotencyKey(hex::encode(self.hasher.finalize()))
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

type Slot<V> = Option<Result<V>>;

enum Record<V> {
    /// A caller is executing; waiters subscribe to `rx`
    InFlight {
        id: u64,
        started: Instant,
        rx: watch::Receiver<Slot<V>>,
    },
    /// Completed successfully
    Completed { value: V, at: Instant },
}

impl<V> Record<V> {
    fn is_in_flight_with(&self, expected: u64) -> bool {
        matches!(self, Self::InFlight { id, .. } if *id == expected)
    }
}

struct Shared<V> {
    entries: DashMap<IdempotencyKey, Record<V>>,
    next_id: AtomicU64,
    freshness: Duration,
    in_flight_timeout: Duration,
    clock: SharedClock,
    sink: SharedSink,
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Outcome of [`DedupCache::begin`]
pub enum Begin<V> {
    /// A fresh completed result exists
    Completed(V),
    /// Another caller is executing; await its outcome
    InFlight(PendingResult<V>),
    /// This caller must execute and then commit
    Proceed(CommitHandle<V>),
}

impl<V> fmt::Debug for Begin<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(_) => f.write_str("Completed"),
            Self::InFlight(_) => f.write_str("InFlight"),
            Self::Proceed(_) => f.write_str("Proceed"),
        }
    }
}

/// Deduplication cache with in-flight coalescing
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct DedupCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for DedupCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> DedupCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new, empty cache.
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_parts(config, clock::system(), events::tracing_sink())
    }

    /// Create a cache with an explicit clock and event sink
    #[must_use]
    pub fn with_parts(config: &DedupConfig, clock: SharedClock, sink: SharedSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
                freshness: config.freshness,
                in_flight_timeout: config.in_flight_timeout,
                clock,
                sink,
            }),
        }
    }

    /// Look up `key`, installing a pending record if this caller must execute
    pub fn begin(&self, key: &IdempotencyKey) -> Begin<V> {
        let shared = &self.shared;
        let now = shared.clock.now();

        match shared.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = match occupied.get() {
                    Record::Completed { value, at } if now.saturating_duration_since(*at) <= shared.freshness => {
                        Some(Begin::Completed(value.clone()))
                    }
                    Record::InFlight { rx, started, .. }
                        if now.saturating_duration_since(*started) <= shared.in_flight_timeout =>
                    {
                        Some(Begin::InFlight(PendingResult {
                            key: key.clone(),
                            rx: rx.clone(),
                        }))
                    }
                    // Expired result or leaked in-flight marker: start over
                    _ => None,
                };
                if let Some(outcome) = existing {
                    drop(occupied);
                    if matches!(outcome, Begin::InFlight(_)) {
                        shared.sink.emit(&GuardEvent::Coalesced {
                            key: key.to_string(),
                        });
                    } else {
                        debug!(key = %key, "Serving completed result");
                    }
                    return outcome;
                }
                let (record, handle) = self.install(key, now);
                occupied.insert(record);
                debug!(key = %key, "Replaced stale idempotency record");
                Begin::Proceed(handle)
            }
            Entry::Vacant(vacant) => {
                let (record, handle) = self.install(key, now);
                vacant.insert(record);
                Begin::Proceed(handle)
            }
        }
    }

    /// Execute `call` at most once per key among concurrent callers
    ///
    /// # Errors
    ///
    /// Returns the executing call's error, shared by every coalesced caller.
    pub async fn run<F, Fut>(&self, key: &IdempotencyKey, call: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.begin(key) {
            Begin::Completed(value) => Ok(value),
            Begin::InFlight(pending) => pending.wait().await,
            Begin::Proceed(handle) => {
                let result = call().await;
                handle.commit(result.clone());
                result
            }
        }
    }

    /// Current number of tracked records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Return `true` when the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    fn install(&self, key: &IdempotencyKey, now: Instant) -> (Record<V>, CommitHandle<V>) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let record = Record::InFlight { id, started: now, rx };
        let handle = CommitHandle {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            id,
            tx,
            committed: false,
        };
        (record, handle)
    }
}

impl<V> Sweep for DedupCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "dedup_cache"
    }

    /// Evict records older than twice their TTL
    fn sweep(&self) -> usize {
        let shared = &self.shared;
        let now = shared.clock.now();
        let before = shared.entries.len();
        shared.entries.retain(|_, record| match record {
            Record::Completed { at, .. } => now.saturating_duration_since(*at) <= shared.freshness * 2,
            Record::InFlight { started, .. } => {
                now.saturating_duration_since(*started) <= shared.in_flight_timeout * 2
            }
        });
        let evicted = before.saturating_sub(shared.entries.len());
        if evicted > 0 {
            debug!(count = evicted, "Evicted stale idempotency records");
        }
        evicted
    }
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// A result that becomes available when the executing caller commits
pub struct PendingResult<V> {
    key: IdempotencyKey,
    rx: watch::Receiver<Slot<V>>,
}

impl<V: Clone> PendingResult<V> {
    /// Wait for the executing caller's outcome
    ///
    /// # Errors
    ///
    /// Returns the executing caller's error, or [`Error::Abandoned`] if it was
    /// cancelled before committing.
    pub async fn wait(mut self) -> Result<V> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(Error::Abandoned(self.key.to_string())))
    }
}

/// Exclusive right to execute the operation for one key
pub struct CommitHandle<V> {
    shared: Arc<Shared<V>>,
    key: IdempotencyKey,
    id: u64,
    tx: watch::Sender<Slot<V>>,
    committed: bool,
}

impl<V: Clone> CommitHandle<V> {
    /// Key this handle executes for
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Record the outcome and wake every coalesced caller
    pub fn commit(mut self, result: Result<V>) {
        self.committed = true;
        let shared = &self.shared;
        match &result {
            Ok(value) => {
                if let Some(mut record) = shared.entries.get_mut(&self.key)
                    && record.is_in_flight_with(self.id)
                {
                    *record = Record::Completed {
                        value: value.clone(),
                        at: shared.clock.now(),
                    };
                }
            }
            Err(e) => {
                shared.entries.remove_if(&self.key, |_, r| r.is_in_flight_with(self.id));
                debug!(key = %self.key, error = %e, "Operation failed; key released for retry");
            }
        }
        self.tx.send_replace(Some(result));
    }
}

impl<V> Drop for CommitHandle<V> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.shared
            .entries
            .remove_if(&self.key, |_, r| r.is_in_flight_with(self.id));
        self.tx
            .send_replace(Some(Err(Error::Abandoned(self.key.to_string()))));
        debug!(key = %self.key, "Executor dropped before commit; key released");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::RecordingSink;
    use serde_json::json;

    fn alice() -> Caller {
        Caller::Authenticated("alice".to_string())
    }

    fn cache() -> (DedupCache<Value>, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::new());
        let cfg = DedupConfig {
            freshness: Duration::from_secs(60),
            in_flight_timeout: Duration::from_secs(30),
            ..DedupConfig::default()
        };
        (DedupCache::with_parts(&cfg, clock.clone(), sink.clone()), clock, sink)
    }

    fn key(name: &str) -> IdempotencyKey {
        IdempotencyKey::builder(&alice(), "create_persona")
            .field("name", name)
            .finish()
    }

    // ── key derivation ────────────────────────────────────────────────────────

    #[test]
    fn key_is_deterministic_and_hex() {
        let k1 = key("Einstein");
        let k2 = key("Einstein");
        assert_eq!(k1, k2);
        assert_eq!(k1.as_str().len(), 64);
        assert!(k1.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_depends_on_caller() {
        let bob = Caller::Authenticated("bob".to_string());
        let k_bob = IdempotencyKey::builder(&bob, "create_persona").field("name", "Einstein").finish();
        assert_ne!(key("Einstein"), k_bob);
    }

    #[test]
    fn key_fields_cannot_collide_through_separators() {
        // GIVEN: field values that would concatenate to the same string
        // WHEN: deriving keys
        // THEN: length prefixes keep them apart
        let base = || IdempotencyKey::builder(&alice(), "create_persona");
        let k1 = base().field("name", "a|b").field("mode", "c").finish();
        let k2 = base().field("name", "a").field("mode", "b|c").finish();
        assert_ne!(k1, k2);
    }

    #[test]
    fn optional_field_distinguishes_none_from_empty() {
        let base = || IdempotencyKey::builder(&alice(), "create_persona");
        let none = base().optional_field("source", None).finish();
        let empty = base().optional_field("source", Some("")).finish();
        assert_ne!(none, empty);
    }

    #[test]
    fn argument_keys_ignore_volatile_fields_and_order() {
        let volatile = DedupConfig::default().volatile_fields;
        let a = json!({"name": "Einstein", "mode": "deep", "timestamp": 1, "request_id": "r-1"});
        let b = json!({"mode": "deep", "request_id": "r-2", "name": "Einstein", "timestamp": 2});
        let c = json!({"name": "Einstein", "mode": "shallow"});
        let ka = IdempotencyKey::from_arguments(&alice(), "create_persona", &a, &volatile);
        let kb = IdempotencyKey::from_arguments(&alice(), "create_persona", &b, &volatile);
        let kc = IdempotencyKey::from_arguments(&alice(), "create_persona", &c, &volatile);
        assert_eq!(ka, kb);
        assert_ne!(ka, kc);
    }

    // ── begin / commit ────────────────────────────────────────────────────────

    #[test]
    fn first_begin_proceeds_and_installs_pending_record() {
        let (cache, _, _) = cache();
        assert!(matches!(cache.begin(&key("x")), Begin::Proceed(_)));
    }

    #[test]
    fn dropping_uncommitted_handle_releases_key() {
        // GIVEN: an executor that is cancelled before committing
        // WHEN: its handle is dropped
        // THEN: the key is free again
        let (cache, _, _) = cache();
        let handle = cache.begin(&key("x"));
        assert_eq!(cache.len(), 1);
        drop(handle);
        assert!(cache.is_empty());
        assert!(matches!(cache.begin(&key("x")), Begin::Proceed(_)));
    }

    #[test]
    fn completed_result_is_replayed_while_fresh() {
        let (cache, clock, _) = cache();
        let Begin::Proceed(handle) = cache.begin(&key("x")) else {
            panic!("expected Proceed");
        };
        handle.commit(Ok(json!({"persona_id": "p-1"})));

        clock.advance(Duration::from_secs(60));
        match cache.begin(&key("x")) {
            Begin::Completed(v) => assert_eq!(v, json!({"persona_id": "p-1"})),
            other => panic!("expected Completed, got {other:?}"),
        }

        clock.advance(Duration::from_secs(1));
        assert!(matches!(cache.begin(&key("x")), Begin::Proceed(_)));
    }

    #[test]
    fn failure_removes_record_for_immediate_retry() {
        let (cache, _, _) = cache();
        let Begin::Proceed(handle) = cache.begin(&key("x")) else {
            panic!("expected Proceed");
        };
        handle.commit(Err(Error::Transport("connection reset".to_string())));
        assert!(cache.is_empty());
        assert!(matches!(cache.begin(&key("x")), Begin::Proceed(_)));
    }

    #[test]
    fn leaked_in_flight_record_is_replaced_after_timeout() {
        let (cache, clock, _) = cache();
        let Begin::Proceed(stale) = cache.begin(&key("x")) else {
            panic!("expected Proceed");
        };
        clock.advance(Duration::from_secs(31));
        let Begin::Proceed(fresh) = cache.begin(&key("x")) else {
            panic!("expected Proceed after in-flight timeout");
        };

        // The stale executor finishing late must not clobber the new record
        stale.commit(Ok(json!("late")));
        assert!(matches!(cache.begin(&key("x")), Begin::InFlight(_)));
        fresh.commit(Ok(json!("fresh")));
        assert!(matches!(cache.begin(&key("x")), Begin::Completed(v) if v == json!("fresh")));
    }

    #[tokio::test]
    async fn ten_concurrent_begins_coalesce_onto_one_executor() {
        // GIVEN: 10 begin() calls on one key before anything completes
        // WHEN: the single executor commits
        // THEN: 1 proceeded, 9 waited, all 10 observe the identical result
        let (cache, _, sink) = cache();
        let mut executors = Vec::new();
        let mut waiters = Vec::new();
        for _ in 0..10 {
            match cache.begin(&key("Einstein")) {
                Begin::Proceed(h) => executors.push(h),
                Begin::InFlight(p) => waiters.push(tokio::spawn(p.wait())),
                Begin::Completed(_) => panic!("nothing has completed yet"),
            }
        }
        assert_eq!(executors.len(), 1);
        assert_eq!(waiters.len(), 9);
        assert_eq!(sink.events().len(), 9);

        let result = json!({"persona_id": "p-42"});
        executors.pop().unwrap().commit(Ok(result.clone()));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(result.clone()));
        }
    }

    #[tokio::test]
    async fn waiters_observe_executor_failure() {
        let (cache, _, _) = cache();
        let Begin::Proceed(handle) = cache.begin(&key("x")) else {
            panic!("expected Proceed");
        };
        let Begin::InFlight(pending) = cache.begin(&key("x")) else {
            panic!("expected InFlight");
        };
        let err = Error::backend("personas", Some(500), "boom");
        handle.commit(Err(err.clone()));
        assert_eq!(pending.wait().await, Err(err));
    }

    #[tokio::test]
    async fn waiters_are_released_when_executor_is_dropped() {
        let (cache, _, _) = cache();
        let handle = cache.begin(&key("x"));
        let Begin::InFlight(pending) = cache.begin(&key("x")) else {
            panic!("expected InFlight");
        };
        drop(handle);
        assert!(matches!(pending.wait().await, Err(Error::Abandoned(_))));
    }

    // ── sweep ─────────────────────────────────────────────────────────────────

    #[test]
    fn sweep_evicts_records_older_than_twice_ttl() {
        let (cache, clock, _) = cache();
        let Begin::Proceed(old) = cache.begin(&key("old")) else {
            panic!("expected Proceed");
        };
        old.commit(Ok(json!(1)));
        clock.advance(Duration::from_secs(100));
        let Begin::Proceed(recent) = cache.begin(&key("recent")) else {
            panic!("expected Proceed");
        };
        recent.commit(Ok(json!(2)));

        assert_eq!(cache.sweep(), 0);
        clock.advance(Duration::from_secs(21));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }
}
