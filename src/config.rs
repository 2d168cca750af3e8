//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::token::MIN_SECRET_LEN;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Deployment environment
    pub environment: Environment,
    /// Failsafe configuration
    pub failsafe: FailsafeConfig,
    /// Capability token configuration
    pub token: TokenConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: a missing token secret is replaced by a random one
    #[default]
    Development,
    /// Production: a token secret is mandatory
    Production,
}

impl Environment {
    /// Whether this is a production deployment
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Environment variables (PERSONA_GUARD_ prefix, __ for nesting)
        figment = figment.merge(Env::prefixed("PERSONA_GUARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Reject configurations the guards cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let failsafe = &self.failsafe;
        failsafe.rate_limit.validate()?;
        failsafe.circuit_breaker.validate("default")?;
        for (name, cb) in &failsafe.dependencies {
            cb.validate(name)?;
        }
        if failsafe.dedup.freshness.is_zero() {
            return Err(Error::Config("dedup.freshness must be positive".to_string()));
        }
        if failsafe.call_timeout.is_zero() {
            return Err(Error::Config("failsafe.call_timeout must be positive".to_string()));
        }
        if failsafe.sweep_interval.is_zero() {
            return Err(Error::Config("failsafe.sweep_interval must be positive".to_string()));
        }

        match self.token.resolve_secret() {
            Some(secret) if secret.len() < MIN_SECRET_LEN => Err(Error::Config(format!(
                "token.secret must be at least {MIN_SECRET_LEN} bytes (got {})",
                secret.len()
            ))),
            None if self.environment.is_production() => Err(Error::Config(
                "token.secret is required in production".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Default circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-dependency circuit breaker overrides
    pub dependencies: HashMap<String, CircuitBreakerConfig>,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Creation deduplication configuration
    pub dedup: DedupConfig,
    /// Deadline for a single outbound call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// How often stale rate windows and dedup records are reaped
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            dependencies: HashMap::new(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failure threshold before opening
    pub failure_threshold: u32,
    /// Success threshold to close
    pub success_threshold: u32,
    /// Time to wait before half-open
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(Error::Config(format!(
                "circuit breaker '{name}': thresholds must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests per window for unauthenticated callers
    pub anonymous_limit: u32,
    /// Requests per window for authenticated callers
    pub authenticated_limit: u32,
    /// Stricter per-operation limits, counted in the same window
    pub operation_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            anonymous_limit: 30,
            authenticated_limit: 120,
            operation_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::Config("rate_limit.window must be positive".to_string()));
        }
        if self.authenticated_limit < self.anonymous_limit {
            tracing::warn!(
                anonymous = self.anonymous_limit,
                authenticated = self.authenticated_limit,
                "Authenticated rate limit is lower than the anonymous one"
            );
        }
        Ok(())
    }

    /// Aggregate limit for a caller
    #[must_use]
    pub fn limit_for(&self, authenticated: bool) -> u32 {
        if authenticated {
            self.authenticated_limit
        } else {
            self.anonymous_limit
        }
    }
}

/// Creation deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a completed result is replayed to duplicate requests
    #[serde(with = "humantime_serde")]
    pub freshness: Duration,
    /// Age after which an uncommitted in-flight record is considered leaked
    #[serde(with = "humantime_serde")]
    pub in_flight_timeout: Duration,
    /// Argument fields that never take part in key derivation
    pub volatile_fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(5 * 60),
            in_flight_timeout: Duration::from_secs(5 * 60),
            volatile_fields: vec![
                "timestamp".to_string(),
                "request_id".to_string(),
                "idempotency_key".to_string(),
            ],
        }
    }
}

/// Capability token configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TokenConfig {
    /// Signing secret.
    /// Supports: literal value, `env:VAR_NAME`, or `${VAR}` / `${VAR:-default}` expansion
    pub secret: Option<String>,
}

impl TokenConfig {
    /// Resolve the signing secret (expand env references)
    ///
    /// Returns `None` when no secret is configured or it resolves to an empty
    /// string.
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        let raw = self.secret.as_ref()?;
        let resolved = if let Some(var_name) = raw.strip_prefix("env:") {
            env::var(var_name).ok()?
        } else {
            expand_env_vars(raw)
        };
        (!resolved.is_empty()).then_some(resolved)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` patterns
fn expand_env_vars(value: &str) -> String {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Human-readable serde for `Duration` ("30s", "5m", "100ms", bare seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration as seconds, or milliseconds when sub-second precision matters
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Bare integers arrive as numbers from YAML and from figment's env provider
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Deserialize a duration string (e.g., "30s", "5m", "100ms") or bare seconds (`30`)
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" must be checked before the single-letter suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
