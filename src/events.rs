//! Observability sink for guard state transitions and denials
//!
//! Guards never log directly for the events operators alert on; they emit a
//! [`GuardEvent`] to an injected [`EventSink`]. The default [`TracingSink`]
//! turns each event into a structured log line plus a metrics counter.

use std::sync::Arc;

use parking_lot::Mutex;
use telemetry_metrics::counter;
use tracing::{info, warn};

use crate::failsafe::CircuitState;

/// Observable guard event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// A circuit breaker changed state
    CircuitTransition {
        /// Dependency name
        dependency: String,
        /// State before the transition
        from: CircuitState,
        /// State after the transition
        to: CircuitState,
        /// Consecutive failures at transition time
        failures: u32,
    },
    /// An admission check was denied
    RateLimited {
        /// Rate-limit identifier
        identifier: String,
        /// Operation whose limit was hit (`None` for the aggregate limit)
        operation: Option<String>,
        /// Limit that was hit
        limit: u32,
        /// Seconds until the window resets
        retry_after_secs: u64,
    },
    /// A caller attached to another caller's in-flight operation
    Coalesced {
        /// Idempotency key
        key: String,
    },
}

/// Destination for guard events
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: &GuardEvent);
}

/// Shared sink handle
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: `tracing` events plus `metrics` counters
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GuardEvent) {
        match event {
            GuardEvent::CircuitTransition {
                dependency,
                from,
                to,
                failures,
            } => {
                if *to == CircuitState::Open {
                    warn!(dependency = %dependency, from = %from, to = %to, failures, "Circuit breaker transition");
                } else {
                    info!(dependency = %dependency, from = %from, to = %to, failures, "Circuit breaker transition");
                }
                counter!(
                    "persona_guard_circuit_transitions_total",
                    "dependency" => dependency.clone(),
                    "to" => to.as_str()
                )
                .increment(1);
            }
            GuardEvent::RateLimited {
                identifier,
                operation,
                limit,
                retry_after_secs,
            } => {
                warn!(
                    identifier = %identifier,
                    operation = operation.as_deref().unwrap_or("*"),
                    limit,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                counter!(
                    "persona_guard_rate_limited_total",
                    "operation" => operation.clone().unwrap_or_else(|| "*".to_string())
                )
                .increment(1);
            }
            GuardEvent::Coalesced { key } => {
                tracing::debug!(key = %key, "Coalesced onto in-flight operation");
                counter!("persona_guard_dedup_coalesced_total").increment(1);
            }
        }
    }
}

/// Default shared sink
#[must_use]
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Sink that keeps every event in memory, for assertions in tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GuardEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    #[must_use]
    pub fn events(&self) -> Vec<GuardEvent> {
        self.events.lock().clone()
    }

    /// Circuit transitions recorded so far, as `(from, to)` pairs
    #[must_use]
    pub fn transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                GuardEvent::CircuitTransition { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &GuardEvent) {
        self.events.lock().push(event.clone());
    }
}
