//! Signed capability tokens
//!
//! A capability token binds a principal id to an HMAC-SHA256 tag so a client
//! can later prove, without a session store, which principal's resources it
//! may discover. Tokens are read-only capabilities and carry no expiry; they
//! stay valid until the signing secret rotates.
//!
//! # Wire formats
//!
//! Every format is URL-safe base64 (no padding) over a `:`-separated payload:
//!
//! | Format   | Payload                        | Tag input                |
//! |----------|--------------------------------|--------------------------|
//! | current  | `principal:tag64`              | `principal`              |
//! | legacy A | `principal:tag32`              | `principal` (truncated)  |
//! | legacy B | `principal:expiry:tag32`       | `principal:expiry`       |
//!
//! `tagN` is `N` lowercase hex characters. Legacy B tokens carry a unix-seconds
//! expiry and are rejected once it passes. Any other shape is malformed.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Environment, TokenConfig};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted signing secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

const SEPARATOR: char = ':';
const CURRENT_TAG_HEX_LEN: usize = 64;
const LEGACY_TAG_HEX_LEN: usize = 32;

/// Why a token was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Not a token in any recognized format
    #[error("malformed token")]
    Malformed,
    /// Recognized format, but the tag does not match
    #[error("token signature mismatch")]
    BadSignature,
    /// Legacy token whose embedded expiry has passed
    #[error("token expired at {0}")]
    Expired(i64),
    /// Principal id cannot be encoded in a token
    #[error("invalid principal id: {0:?}")]
    InvalidPrincipal(String),
}

/// Issues and verifies capability tokens with one signing secret
pub struct TokenSigner {
    /// HMAC state keyed with the signing secret, cloned per tag
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

/// Parsed token payload, before tag verification
#[derive(Debug, PartialEq, Eq)]
enum Payload<'a> {
    Current { principal: &'a str, tag: &'a str },
    LegacyShortTag { principal: &'a str, tag: &'a str },
    LegacyExpiring { principal: &'a str, expiry: i64, tag: &'a str },
}

impl TokenSigner {
    /// Create a signer from an explicit secret
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "token secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        let mac = <HmacSha256 as KeyInit>::new_from_slice(secret)
            .map_err(|e| Error::Config(format!("invalid token secret: {e}")))?;
        Ok(Self { mac })
    }

    /// Create a signer with a random per-process secret.
    ///
    /// Tokens issued by it do not survive a restart.
    pub fn ephemeral() -> Result<Self> {
        let secret: [u8; MIN_SECRET_LEN] = rand::random();
        Self::new(secret)
    }

    /// Build the signer for a deployment
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when production has no secret configured or the
    /// configured secret is too short.
    pub fn from_config(config: &TokenConfig, environment: Environment) -> Result<Self> {
        match config.resolve_secret() {
            Some(secret) => Self::new(secret),
            None if environment.is_production() => Err(Error::Config(
                "token.secret is required in production".to_string(),
            )),
            None => {
                warn!("No token secret configured; using a per-process random secret (tokens will not survive restart)");
                Self::ephemeral()
            }
        }
    }

    /// Issue a token for `principal`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidPrincipal`] for an empty principal or one
    /// containing the payload separator.
    pub fn issue(&self, principal: &str) -> std::result::Result<String, TokenError> {
        if principal.is_empty() || principal.contains(SEPARATOR) {
            return Err(TokenError::InvalidPrincipal(principal.to_string()));
        }
        let tag = self.tag_hex(principal.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(format!("{principal}{SEPARATOR}{tag}")))
    }

    /// Verify `token` and return the principal it was issued for
    ///
    /// # Errors
    ///
    /// Returns the [`TokenError`] describing why the token is not acceptable.
    pub fn verify(&self, token: &str) -> std::result::Result<String, TokenError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// [`verify`](Self::verify) against an explicit unix time
    fn verify_at(&self, token: &str, now_unix: i64) -> std::result::Result<String, TokenError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Malformed)?;
        let payload = String::from_utf8(decoded).map_err(|_| TokenError::Malformed)?;

        match parse_payload(&payload)? {
            Payload::Current { principal, tag } => {
                self.check_tag(principal.as_bytes(), tag)?;
                Ok(principal.to_string())
            }
            Payload::LegacyShortTag { principal, tag } => {
                self.check_tag(principal.as_bytes(), tag)?;
                debug!(principal, "Accepted legacy short-tag token");
                Ok(principal.to_string())
            }
            Payload::LegacyExpiring {
                principal,
                expiry,
                tag,
            } => {
                let signed = format!("{principal}{SEPARATOR}{expiry}");
                self.check_tag(signed.as_bytes(), tag)?;
                if expiry <= now_unix {
                    return Err(TokenError::Expired(expiry));
                }
                debug!(principal, expiry, "Accepted legacy expiring token");
                Ok(principal.to_string())
            }
        }
    }

    fn tag_hex(&self, message: &[u8]) -> String {
        hex::encode(self.mac(message))
    }

    fn mac(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }

    /// Compare `presented` against the (possibly truncated) expected hex tag
    fn check_tag(&self, message: &[u8], presented: &str) -> std::result::Result<(), TokenError> {
        let expected = self.tag_hex(message);
        let expected = &expected.as_bytes()[..presented.len()];
        if bool::from(expected.ct_eq(presented.as_bytes())) {
            Ok(())
        } else {
            Err(TokenError::BadSignature)
        }
    }
}

/// Tagged-variant parser: current, then legacy A, then legacy B
fn parse_payload(payload: &str) -> std::result::Result<Payload<'_>, TokenError> {
    let parts: Vec<&str> = payload.split(SEPARATOR).collect();
    match parts.as_slice() {
        &[principal, tag] if !principal.is_empty() && is_hex_tag(tag, CURRENT_TAG_HEX_LEN) => {
            Ok(Payload::Current { principal, tag })
        }
        &[principal, tag] if !principal.is_empty() && is_hex_tag(tag, LEGACY_TAG_HEX_LEN) => {
            Ok(Payload::LegacyShortTag { principal, tag })
        }
        &[principal, expiry, tag]
            if !principal.is_empty()
                && !expiry.is_empty()
                && expiry.bytes().all(|b| b.is_ascii_digit())
                && is_hex_tag(tag, LEGACY_TAG_HEX_LEN) =>
        {
            let expiry = expiry.parse().map_err(|_| TokenError::Malformed)?;
            Ok(Payload::LegacyExpiring {
                principal,
                expiry,
                tag,
            })
        }
        _ => Err(TokenError::Malformed),
    }
}

/// Exactly `len` lowercase hex characters
fn is_hex_tag(tag: &str, len: usize) -> bool {
    tag.len() == len && tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
