//! Environment-driven server configuration.
//!
//! `main` calls `dotenvy::dotenv()` first, so a `.env` file next to the
//! binary works the same as exported variables.

use std::time::Duration;

use sboboz_session::{IdentityPolicy, SessionConfig};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACE_SECS: u64 = 30;
/// Longest accepted grace window: one day.
const MAX_GRACE_SECS: u64 = 86_400;

/// Backend configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host both listeners bind to.
    pub host: String,
    /// Port of the HTTP API.
    pub port: u16,
    /// Port of the realtime socket. Defaults to `port + 1`.
    pub socket_port: u16,
    /// Environment name (`development`, `production`, ...).
    pub env: String,
    /// How long a dropped session stays recoverable.
    pub grace_window: Duration,
    pub identity_policy: IdentityPolicy,
}

impl ServerConfig {
    /// Loads configuration from the process environment.
    ///
    /// Never fails: unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = var("PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let socket_port = var("SOCKET_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| port.saturating_add(1));
        let mut grace_secs = var("GRACE_WINDOW_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_GRACE_SECS);
        if grace_secs > MAX_GRACE_SECS {
            tracing::warn!(
                value = grace_secs,
                max = MAX_GRACE_SECS,
                "GRACE_WINDOW_SECS too large, using the maximum"
            );
            grace_secs = MAX_GRACE_SECS;
        }
        let identity_policy = match var("SESSION_POLICY").as_deref() {
            Some("multi") => IdentityPolicy::MultiSession,
            Some("single") | None => IdentityPolicy::SingleSession,
            Some(other) => {
                tracing::warn!(value = other, "unknown SESSION_POLICY, using single");
                IdentityPolicy::SingleSession
            }
        };

        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            socket_port,
            env: var("NODE_ENV").unwrap_or_else(|| "development".to_string()),
            grace_window: Duration::from_secs(grace_secs),
            identity_policy,
        }
    }

    pub fn is_dev(&self) -> bool {
        self.env == "development"
    }

    pub fn is_prod(&self) -> bool {
        self.env == "production"
    }

    /// `host:port` of the HTTP API.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port` of the realtime socket.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.socket_port)
    }

    /// Session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            grace_window: self.grace_window,
            identity_policy: self.identity_policy,
            ..SessionConfig::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
