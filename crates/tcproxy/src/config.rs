//! Proxy configuration.
//!
//! Settings come from the environment (the deployment surface a task
//! runner actually controls) with serde-friendly defaults, so a config
//! can also be embedded or deserialized directly in tests.

use crate::backoff::ExponentialBackoff;
use crate::credentials::Credentials;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    256
}

/// Everything the proxy needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Backend root URL, e.g. `https://tc.example.com`.
    pub root_url: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Certificate JSON for temporary credentials.
    #[serde(default)]
    pub certificate: Option<String>,
    /// JSON array restricting the scopes calls may use.
    #[serde(default)]
    pub authorized_scopes: Option<Vec<String>>,
    /// Loopback only unless explicitly overridden; the local surface is
    /// unauthenticated.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub backoff: ExponentialBackoff,
}

impl ProxyConfig {
    /// Read configuration from `TASKCLUSTER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let root_url = require_env("TASKCLUSTER_ROOT_URL")?;
        let client_id = require_env("TASKCLUSTER_CLIENT_ID")?;
        let access_token = require_env("TASKCLUSTER_ACCESS_TOKEN")?;
        let certificate = optional_env("TASKCLUSTER_CERTIFICATE");
        let authorized_scopes = match optional_env("TASKCLUSTER_AUTHORIZED_SCOPES") {
            None => None,
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                ProxyError::Config(format!("TASKCLUSTER_AUTHORIZED_SCOPES is not a JSON array: {}", e))
            })?),
        };
        let port = match optional_env("TASKCLUSTER_PROXY_PORT") {
            None => default_port(),
            Some(raw) => raw.parse().map_err(|_| {
                ProxyError::Config(format!("invalid TASKCLUSTER_PROXY_PORT: {}", raw))
            })?,
        };

        Ok(Self {
            root_url,
            client_id,
            access_token,
            certificate,
            authorized_scopes,
            bind_address: default_bind_address(),
            port,
            max_connections: default_max_connections(),
            backoff: ExponentialBackoff::default(),
        })
    }

    /// Build the credential set this config describes.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            client_id: self.client_id.clone(),
            access_token: Zeroizing::new(self.access_token.clone()),
            certificate: self.certificate.clone(),
            authorized_scopes: self.authorized_scopes.clone(),
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ProxyError::Config(format!("{} must be set", name))),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
