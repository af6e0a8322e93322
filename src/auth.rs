//! Client authentication
//!
//! Listeners build an [`Authentication`] from whatever the wire protocol
//! carried (RFC 1929 sub-negotiation, `Proxy-Authorization`) and hand it to
//! an [`Authenticator`]. Credentials are never stored past that call.

use crate::error::{ProxyError, Result};
use crate::transport::Address;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::fmt::Debug;

/// Scheme name for `user:pass` credentials
pub const SCHEME_BASIC: &str = "basic";

/// Credentials presented by one client
#[derive(Clone, PartialEq, Eq)]
pub struct Authentication {
    /// Client address
    pub source: Address,
    /// Lower-case scheme name
    pub scheme: String,
    /// Scheme-dependent credential, `user:pass` for basic
    pub credential: String,
}

impl Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authentication")
            .field("source", &self.source)
            .field("scheme", &self.scheme)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl Authentication {
    /// Basic credentials from a username and password
    pub fn basic(source: Address, username: &str, password: &str) -> Self {
        Authentication {
            source,
            scheme: SCHEME_BASIC.to_string(),
            credential: format!("{}:{}", username, password),
        }
    }

    /// Parse an HTTP `Proxy-Authorization` style header value (`Basic <b64>`)
    pub fn from_header(source: Address, value: &str) -> Option<Self> {
        let (scheme, payload) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case(SCHEME_BASIC) {
            return Some(Authentication {
                source,
                scheme: scheme.to_ascii_lowercase(),
                credential: payload.trim().to_string(),
            });
        }
        let decoded = STANDARD.decode(payload.trim()).ok()?;
        let credential = String::from_utf8(decoded).ok()?;
        Some(Authentication {
            source,
            scheme: SCHEME_BASIC.to_string(),
            credential,
        })
    }

    /// Username and password for basic credentials
    pub fn user_pass(&self) -> Option<(&str, &str)> {
        if self.scheme != SCHEME_BASIC {
            return None;
        }
        self.credential.split_once(':')
    }
}

/// Decides whether presented credentials are acceptable
#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    /// Ok if the client may proceed
    async fn authenticate(&self, auth: &Authentication) -> Result<()>;
}

/// Username to password table loaded at startup
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, String>,
}

impl UserTable {
    /// Create a table from configured users
    pub fn new(users: HashMap<String, String>) -> Self {
        UserTable { users }
    }

    /// Number of users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Authenticator for UserTable {
    async fn authenticate(&self, auth: &Authentication) -> Result<()> {
        let (username, password) = auth.user_pass().ok_or_else(|| {
            ProxyError::Authentication(format!("unsupported scheme '{}'", auth.scheme))
        })?;

        match self.users.get(username) {
            Some(expected) if expected == password => {
                tracing::debug!("Authentication successful for user: {}", username);
                Ok(())
            }
            _ => Err(ProxyError::Authentication(format!(
                "invalid credentials for user '{}' from {}",
                username, auth.source
            ))),
        }
    }
}
