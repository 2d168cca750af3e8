//! Circuit breaker implementation

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{self, SharedClock};
use crate::config::CircuitBreakerConfig;
use crate::events::{self, GuardEvent, SharedSink};
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing trial requests)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable breaker bookkeeping, always updated under one lock
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures
    failures: u32,
    /// Consecutive successes (meaningful in half-open only)
    successes: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker for one dependency
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    /// Configuration
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    /// State
    inner: Mutex<BreakerState>,
    clock: SharedClock,
    sink: SharedSink,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self::with_parts(name, config, clock::system(), events::tracing_sink())
    }

    /// Create a circuit breaker with an explicit clock and event sink
    #[must_use]
    pub fn with_parts(name: &str, config: &CircuitBreakerConfig, clock: SharedClock, sink: SharedSink) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout: config.reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            clock,
            sink,
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if requests can proceed
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open here,
    /// on access, rather than on a timer.
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn is_allowed(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let mut inner = self.inner.lock();
        let current = inner.state;
        let (allowed, event) = match current {
            CircuitState::Closed => {
                trace!("Circuit closed, allowing request");
                (true, None)
            }
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    debug!("Reset timeout elapsed, transitioning to half-open");
                    (true, self.transition_to(&mut inner, CircuitState::HalfOpen))
                } else {
                    trace!("Circuit open, rejecting request");
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                trace!("Circuit half-open, allowing trial request");
                (true, None)
            }
        };
        drop(inner);
        self.emit(event);
        allowed
    }

    /// Record a successful request
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        let current = inner.state;
        let event = match current {
            CircuitState::Closed => {
                inner.failures = 0;
                trace!("Success in closed state, reset failure count");
                None
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(successes = inner.successes, threshold = self.success_threshold, "Success in half-open state");
                if inner.successes >= self.success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => {
                trace!("Success recorded in open state (ignored)");
                None
            }
        };
        drop(inner);
        self.emit(event);
    }

    /// Record a failed request
    ///
    /// Returns `true` when this failure opened the circuit.
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn record_failure(&self) -> bool {
        if !self.enabled {
            return false;
        }

        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(self.clock.now());
        let current = inner.state;
        let event = match current {
            CircuitState::Closed => {
                debug!(failures = inner.failures, threshold = self.failure_threshold, "Failure in closed state");
                if inner.failures >= self.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                debug!("Failure in half-open state, reopening circuit");
                self.transition_to(&mut inner, CircuitState::Open)
            }
            CircuitState::Open => {
                trace!("Failure recorded in open state");
                None
            }
        };
        drop(inner);
        let opened = event.is_some();
        self.emit(event);
        opened
    }

    /// Run `operation` under the breaker
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyUnavailable`] without invoking `operation`
    /// while the circuit is open, or the operation's own error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None::<fn() -> T>).await
    }

    /// Run `operation` under the breaker, degrading to `fallback`
    ///
    /// The fallback is used when the circuit is open, and when this call's
    /// failure is the one that opens it.
    ///
    /// # Errors
    ///
    /// Returns the operation's error when it fails without opening the circuit.
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        self.run(operation, Some(fallback)).await
    }

    async fn run<T, F, Fut, FB>(&self, operation: F, fallback: Option<FB>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        if !self.is_allowed() {
            return match fallback {
                Some(fallback) => {
                    debug!(dependency = %self.name, "Circuit open, serving fallback");
                    Ok(fallback())
                }
                None => Err(self.unavailable()),
            };
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            // The dependency answered; the request itself was rejected
            Err(e) if !e.counts_against_dependency() => {
                self.record_success();
                Err(e)
            }
            Err(e) => {
                let opened = self.record_failure();
                match fallback {
                    Some(fallback) if opened => {
                        debug!(dependency = %self.name, error = %e, "Circuit opened by this failure, serving fallback");
                        Ok(fallback())
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Get current state (without triggering the lazy half-open transition)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failure count
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Time left before an open circuit admits a trial call
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner
            .last_failure
            .map_or(self.reset_timeout, |t| self.clock.now().saturating_duration_since(t));
        Some(self.reset_timeout.saturating_sub(elapsed))
    }

    /// Human-readable status for tool responses
    pub fn status_message(&self) -> String {
        if !self.enabled {
            return format!("Dependency '{}' is healthy (circuit closed)", self.name);
        }
        match self.state() {
            CircuitState::Closed => format!("Dependency '{}' is healthy (circuit closed)", self.name),
            CircuitState::Open => {
                let retry = self.retry_after().unwrap_or_default();
                format!(
                    "Dependency '{}' circuit breaker is open after {} failures; retry in {} seconds",
                    self.name,
                    self.failures(),
                    retry.as_secs().max(1)
                )
            }
            CircuitState::HalfOpen => format!(
                "Dependency '{}' circuit breaker is half-open (testing recovery)",
                self.name
            ),
        }
    }

    fn unavailable(&self) -> Error {
        Error::DependencyUnavailable {
            dependency: self.name.clone(),
            retry_after: self.retry_after().unwrap_or(self.reset_timeout),
        }
    }

    fn reset_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure
            .is_none_or(|t| self.clock.now().saturating_duration_since(t) >= self.reset_timeout)
    }

    /// Transition to a new state, returning the event to emit once unlocked
    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) -> Option<GuardEvent> {
        let old_state = inner.state;
        if old_state == new_state {
            return None;
        }

        inner.state = new_state;
        let event = GuardEvent::CircuitTransition {
            dependency: self.name.clone(),
            from: old_state,
            to: new_state,
            failures: inner.failures,
        };

        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.successes = 0;
            }
        }
        Some(event)
    }

    fn emit(&self, event: Option<GuardEvent>) {
        if let Some(event) = event {
            self.sink.emit(&event);
        }
    }
}

/// Circuit breakers keyed by dependency name
///
/// Breakers are created on first use and live as long as the registry; the set
/// of dependencies is small and fixed.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: SharedClock,
    sink: SharedSink,
}

impl CircuitBreakerRegistry {
    /// Create a registry with default settings and per-dependency overrides
    #[must_use]
    pub fn new(defaults: &CircuitBreakerConfig, overrides: &HashMap<String, CircuitBreakerConfig>) -> Self {
        Self::with_parts(defaults, overrides, clock::system(), events::tracing_sink())
    }

    /// Create a registry with an explicit clock and event sink
    #[must_use]
    pub fn with_parts(
        defaults: &CircuitBreakerConfig,
        overrides: &HashMap<String, CircuitBreakerConfig>,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Self {
        Self {
            defaults: defaults.clone(),
            overrides: overrides.clone(),
            breakers: DashMap::new(),
            clock,
            sink,
        }
    }

    /// Breaker for `dependency`, created on first use
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(dependency).unwrap_or(&self.defaults);
                Arc::new(CircuitBreaker::with_parts(
                    dependency,
                    config,
                    Arc::clone(&self.clock),
                    Arc::clone(&self.sink),
                ))
            })
            .clone()
    }

    /// Run `operation` under `dependency`'s breaker
    ///
    /// # Errors
    ///
    /// See [`CircuitBreaker::execute`].
    pub async fn execute<T, F, Fut>(&self, dependency: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get(dependency).execute(operation).await
    }

    /// Run `operation` under `dependency`'s breaker with a fallback
    ///
    /// # Errors
    ///
    /// See [`CircuitBreaker::execute_with_fallback`].
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, dependency: &str, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> T,
    {
        self.get(dependency).execute_with_fallback(operation, fallback).await
    }

    /// Snapshot of every known breaker's state, sorted by name
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
