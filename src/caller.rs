//! Caller identity used to key rate windows and idempotency records

use std::fmt;
use std::net::IpAddr;

/// Who is making a tool call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// Caller presented a valid credential for this principal id
    Authenticated(String),
    /// Unauthenticated caller, identified by its network address
    Anonymous(IpAddr),
}

impl Caller {
    /// Stable rate-limit identifier (`user:<id>` or `ip:<addr>`)
    #[must_use]
    pub fn identifier(&self) -> String {
        self.to_string()
    }

    /// Whether the caller is authenticated
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated(id) => write!(f, "user:{id}"),
            Self::Anonymous(addr) => write!(f, "ip:{addr}"),
        }
    }
}
