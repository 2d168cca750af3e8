//! Error types for persona-guard

use std::time::Duration;

use thiserror::Error;

use crate::token::TokenError;

/// Result type alias for persona-guard
pub type Result<T> = std::result::Result<T, Error>;

/// Guard errors
///
/// Every variant owns plain data so the type is `Clone`: a failure observed by
/// the caller executing a deduplicated operation is handed verbatim to every
/// caller coalesced on the same idempotency key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller exceeded its admission quota
    #[error("Rate limit exceeded for {identifier}: limit {limit}, retry after {retry_after_secs}s")]
    RateLimited {
        /// Rate-limit identifier (principal or synthetic address id)
        identifier: String,
        /// Limit that was hit
        limit: u32,
        /// Seconds until the window resets
        retry_after_secs: u64,
    },

    /// Dependency unavailable (circuit open)
    #[error("Dependency unavailable: {dependency} (retry in {}s)", .retry_after.as_secs())]
    DependencyUnavailable {
        /// Dependency name
        dependency: String,
        /// Remaining time until the breaker admits a trial call
        retry_after: Duration,
    },

    /// Outbound call exceeded its deadline
    #[error("Dependency timeout: {dependency} after {}ms", .after.as_millis())]
    Timeout {
        /// Dependency name
        dependency: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Backend answered with an error
    #[error("Backend error from {dependency}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Backend {
        /// Dependency name
        dependency: String,
        /// HTTP status, when the transport reports one
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Capability token rejected
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    /// The executing caller went away before committing a result
    #[error("Operation abandoned before completion: {0}")]
    Abandoned(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl Error {
    /// Create a backend error
    pub fn backend(dependency: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Backend {
            dependency: dependency.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether this failure says something about the dependency's health.
    ///
    /// Client-side rejections (4xx) mean the dependency answered correctly and
    /// must not trip its circuit breaker.
    #[must_use]
    pub fn counts_against_dependency(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::Internal(_) => true,
            Self::Backend { status, .. } => !matches!(status, Some(400..=499)),
            _ => false,
        }
    }

    /// Whether the caller may retry later without changing the request
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::DependencyUnavailable { .. }
                | Self::Timeout { .. }
                | Self::Transport(_)
                | Self::Abandoned(_)
        )
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::InvalidToken(_) => rpc_codes::INVALID_PARAMS,
            Self::RateLimited { .. } => rpc_codes::RATE_LIMITED,
            Self::DependencyUnavailable { .. }
            | Self::Timeout { .. }
            | Self::Backend { .. }
            | Self::Transport(_)
            | Self::Abandoned(_) => rpc_codes::SERVER_ERROR_START,
            Self::Config(_) | Self::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// JSON-RPC error codes surfaced to the tool-handling layer
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Rate limited (implementation-defined server error)
    pub const RATE_LIMITED: i32 = -32029;
}
