//! Fixed-window rate limiting per caller identifier
//!
//! Each identifier owns at most one window. A window counts every admitted
//! call plus, per operation, the calls to operations that carry a stricter
//! limit. Once a window is older than the configured duration it is discarded
//! wholesale; counts are never aged incrementally.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use tracing::trace;

use crate::caller::Caller;
use crate::clock::{self, SharedClock};
use crate::config::RateLimitConfig;
use crate::events::{self, GuardEvent, SharedSink};

use super::Sweep;

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Calls left in the current window after this one (0 when denied)
    pub remaining: u32,
    /// Limit that governed the decision
    pub limit: u32,
    /// Seconds until the window resets (0 when allowed)
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            limit: u32::MAX,
            retry_after_secs: 0,
        }
    }

    /// Response headers describing this decision
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs.to_string()));
        }
        headers
    }
}

/// Counters for one identifier's current window
#[derive(Debug, Clone)]
struct RateWindow {
    started: Instant,
    total: u32,
    per_operation: HashMap<String, u32>,
}

impl RateWindow {
    fn new(started: Instant) -> Self {
        Self {
            started,
            total: 0,
            per_operation: HashMap::new(),
        }
    }

    fn operation_count(&self, operation: &str) -> u32 {
        self.per_operation.get(operation).copied().unwrap_or(0)
    }
}

/// Limit hit during evaluation
struct Denial {
    operation: Option<String>,
    limit: u32,
    retry_after_secs: u64,
}

/// Per-identifier fixed-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateWindow>,
    clock: SharedClock,
    sink: SharedSink,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_parts(config, clock::system(), events::tracing_sink())
    }

    /// Create a rate limiter with an explicit clock and event sink
    #[must_use]
    pub fn with_parts(config: &RateLimitConfig, clock: SharedClock, sink: SharedSink) -> Self {
        Self {
            config: config.clone(),
            windows: DashMap::new(),
            clock,
            sink,
        }
    }

    /// Check whether `caller` may perform `operation` now
    ///
    /// Does not consume quota; call [`record`](Self::record) after an allowed
    /// admission. The aggregate limit is checked first, then the operation's
    /// own limit if one is configured.
    pub fn admit(&self, caller: &Caller, operation: Option<&str>) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::unlimited();
        }

        let identifier = caller.identifier();
        let now = self.clock.now();
        let window = self
            .windows
            .get(&identifier)
            .map(|w| w.value().clone())
            .filter(|w| !self.is_expired(w, now))
            .unwrap_or_else(|| RateWindow::new(now));

        self.evaluate(caller, operation, &window, now)
            .unwrap_or_else(|denial| self.deny(&identifier, denial))
    }

    /// Count one call by `caller` against its current window
    pub fn record(&self, caller: &Caller, operation: Option<&str>) {
        if !self.config.enabled {
            return;
        }

        let now = self.clock.now();
        let mut window = self.current_window(caller, now);
        self.count(&mut window, operation);
    }

    /// [`admit`](Self::admit), then [`record`](Self::record) when allowed
    ///
    /// Check and count happen under one map entry lock, so concurrent callers
    /// cannot both take the last slot.
    pub fn check_and_record(&self, caller: &Caller, operation: Option<&str>) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::unlimited();
        }

        let now = self.clock.now();
        let outcome = {
            let mut window = self.current_window(caller, now);
            let outcome = self.evaluate(caller, operation, &window, now);
            if outcome.is_ok() {
                self.count(&mut window, operation);
            }
            outcome
        };
        outcome.unwrap_or_else(|denial| self.deny(&caller.identifier(), denial))
    }

    /// Number of identifiers with a tracked window
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    fn evaluate(
        &self,
        caller: &Caller,
        operation: Option<&str>,
        window: &RateWindow,
        now: Instant,
    ) -> Result<RateDecision, Denial> {
        let retry_after_secs = self.retry_after(window, now);

        let aggregate_limit = self.config.limit_for(caller.is_authenticated());
        if window.total >= aggregate_limit {
            return Err(Denial {
                operation: None,
                limit: aggregate_limit,
                retry_after_secs,
            });
        }
        let mut decision = RateDecision {
            allowed: true,
            remaining: aggregate_limit - window.total - 1,
            limit: aggregate_limit,
            retry_after_secs: 0,
        };

        if let Some((op, &op_limit)) = operation.and_then(|op| self.config.operation_limits.get_key_value(op)) {
            let used = window.operation_count(op);
            if used >= op_limit {
                return Err(Denial {
                    operation: Some(op.clone()),
                    limit: op_limit,
                    retry_after_secs,
                });
            }
            let op_remaining = op_limit - used - 1;
            if op_remaining < decision.remaining {
                decision.remaining = op_remaining;
                decision.limit = op_limit;
            }
        }

        trace!(identifier = %caller, remaining = decision.remaining, "Admitted");
        Ok(decision)
    }

    /// Live window for `caller`, replaced first if it has expired
    fn current_window(&self, caller: &Caller, now: Instant) -> RefMut<'_, String, RateWindow> {
        let mut window = self
            .windows
            .entry(caller.identifier())
            .or_insert_with(|| RateWindow::new(now));
        if self.is_expired(&window, now) {
            *window = RateWindow::new(now);
        }
        window
    }

    fn count(&self, window: &mut RateWindow, operation: Option<&str>) {
        window.total += 1;
        if let Some(op) = operation.filter(|op| self.config.operation_limits.contains_key(*op)) {
            *window.per_operation.entry(op.to_string()).or_insert(0) += 1;
        }
    }

    fn deny(&self, identifier: &str, denial: Denial) -> RateDecision {
        self.sink.emit(&GuardEvent::RateLimited {
            identifier: identifier.to_string(),
            operation: denial.operation,
            limit: denial.limit,
            retry_after_secs: denial.retry_after_secs,
        });
        RateDecision {
            allowed: false,
            remaining: 0,
            limit: denial.limit,
            retry_after_secs: denial.retry_after_secs,
        }
    }

    fn is_expired(&self, window: &RateWindow, now: Instant) -> bool {
        now.saturating_duration_since(window.started) > self.config.window
    }

    /// Whole seconds until `window` resets, at least 1
    fn retry_after(&self, window: &RateWindow, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(window.started);
        let left = self.config.window.saturating_sub(elapsed);
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        secs.max(1)
    }
}

impl Sweep for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    /// Drop windows older than twice the window duration
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let horizon: Duration = self.config.window * 2;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) <= horizon);
        before.saturating_sub(self.windows.len())
    }
}
