//! Runtime configuration consumed by the framework core.
//!
//! Every key is optional; absent keys take the documented defaults, so an
//! empty document is a valid configuration. The certificate, key, and
//! authentication entries are opaque to the core and are forwarded to the
//! transport layer.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration keys consumed by the core.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Idle timeout applied to server sessions after each request,
    /// milliseconds.
    pub cbpp_keep_alive_timeout: u64,
    /// Bind address of the administrative HTTP surface.
    pub system_http_bind: String,
    /// Port of the administrative HTTP surface.
    pub system_http_port: u16,
    /// Path prefix of the administrative servlet.
    pub system_http_path: String,
    /// TLS certificate forwarded to the transport.
    pub system_http_certificate: Option<String>,
    /// TLS private key forwarded to the transport.
    pub system_http_private_key: Option<String>,
    /// `user:password` credentials forwarded to the transport.
    pub system_http_auth_user_pass: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cbpp_keep_alive_timeout: 30_000,
            system_http_bind: "0.0.0.0".to_owned(),
            system_http_port: 8900,
            system_http_path: "/sys".to_owned(),
            system_http_certificate: None,
            system_http_private_key: None,
            system_http_auth_user_pass: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The servlet path prefix, normalized to end with `/`.
    #[must_use]
    pub fn system_http_prefix(&self) -> String {
        let mut prefix = self.system_http_path.clone();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }
}
