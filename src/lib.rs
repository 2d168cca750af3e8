//! Persona Guard Library
//!
//! Resilience and consistency layer for a server that brokers tool calls to an
//! external persona-management API.
//!
//! # Features
//!
//! - **Rate limiting**: fixed windows per caller, with stricter per-operation limits
//! - **Circuit breaking**: per-dependency closed / open / half-open state machines
//! - **Coalescing**: one outbound call per idempotency key; duplicates share its result
//! - **Capability tokens**: HMAC-SHA256 tagged principal ids, verified in constant time
//! - **Fuzzy matching**: exact / prefix / substring / edit-distance name resolution
//!
//! The [`failsafe::Failsafe`] orchestrator composes the stateful guards around a
//! caller-supplied outbound future; the core never talks to the network itself.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod caller;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod failsafe;
pub mod idempotency;
pub mod matching;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
