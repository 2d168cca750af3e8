//! Failsafe mechanisms: rate limiting, circuit breaking, coalescing, sweeping

mod circuit_breaker;
mod rate_limiter;
mod sweeper;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use sweeper::{Sweep, Sweeper};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::caller::Caller;
use crate::clock::{self, SharedClock};
use crate::config::FailsafeConfig;
use crate::events::{self, SharedSink};
use crate::idempotency::{Begin, DedupCache, IdempotencyKey};
use crate::{Error, Result};

/// Combined guard for outbound tool calls
///
/// Runs a side-effecting call through, in order: the dedup cache, the rate
/// limiter, and the dependency's circuit breaker around a deadline-bounded
/// call. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Failsafe {
    /// Per-caller admission control
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-dependency circuit breakers
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Creation dedup / coalescing cache
    pub dedup: DedupCache<Value>,
    call_timeout: Duration,
    sweep_interval: Duration,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn from_config(config: &FailsafeConfig) -> Self {
        Self::with_parts(config, clock::system(), events::tracing_sink())
    }

    /// Create a failsafe whose guards share an explicit clock and event sink
    #[must_use]
    pub fn with_parts(config: &FailsafeConfig, clock: SharedClock, sink: SharedSink) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::with_parts(
                &config.rate_limit,
                Arc::clone(&clock),
                Arc::clone(&sink),
            )),
            breakers: Arc::new(CircuitBreakerRegistry::with_parts(
                &config.circuit_breaker,
                &config.dependencies,
                Arc::clone(&clock),
                Arc::clone(&sink),
            )),
            dedup: DedupCache::with_parts(&config.dedup, clock, sink),
            call_timeout: config.call_timeout,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Run a side-effecting call at most once per idempotency key
    ///
    /// A fresh completed result is returned without calling anything; a caller
    /// arriving while the same key is in flight waits for and receives the
    /// executing caller's exact outcome.
    ///
    /// # Errors
    ///
    /// [`Error::RateLimited`], [`Error::DependencyUnavailable`],
    /// [`Error::Timeout`], or whatever the call itself returned. Coalesced
    /// callers receive the same error.
    pub async fn invoke<F, Fut>(
        &self,
        caller: &Caller,
        operation: &str,
        key: &IdempotencyKey,
        dependency: &str,
        call: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let handle = match self.dedup.begin(key) {
            Begin::Completed(value) => return Ok(value),
            Begin::InFlight(pending) => return pending.wait().await,
            Begin::Proceed(handle) => handle,
        };

        let result = self.execute(caller, operation, dependency, call).await;
        handle.commit(result.clone());
        result
    }

    /// Run a call through rate limiting and the circuit breaker only
    ///
    /// For reads, which need no deduplication.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn execute<T, F, Fut>(&self, caller: &Caller, operation: &str, dependency: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let decision = self.rate_limiter.check_and_record(caller, Some(operation));
        if !decision.allowed {
            return Err(Error::RateLimited {
                identifier: caller.identifier(),
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs,
            });
        }

        let deadline = self.call_timeout;
        self.breakers
            .execute(dependency, || async move {
                tokio::time::timeout(deadline, call()).await.unwrap_or_else(|_| {
                    debug!(dependency, timeout = ?deadline, "Outbound call timed out");
                    Err(Error::Timeout {
                        dependency: dependency.to_string(),
                        after: deadline,
                    })
                })
            })
            .await
    }

    /// Start the periodic sweep of rate windows and dedup records
    #[must_use]
    pub fn spawn_sweeper(&self) -> Sweeper {
        let targets: Vec<Arc<dyn Sweep>> = vec![
            Arc::clone(&self.rate_limiter) as Arc<dyn Sweep>,
            Arc::new(self.dedup.clone()),
        ];
        Sweeper::spawn(targets, self.sweep_interval)
    }

    /// One-line status per known dependency
    #[must_use]
    pub fn status(&self) -> Vec<String> {
        self.breakers
            .states()
            .into_iter()
            .map(|(dependency, _)| self.breakers.get(&dependency).status_message())
            .collect()
    }
}
