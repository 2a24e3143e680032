//! Local authenticating reverse proxy for Taskcluster APIs.
//!
//! A sandboxed task speaks plain unauthenticated HTTP to this proxy on
//! loopback; the proxy resolves each path against the configured root
//! URL, signs the outbound call with the Hawk scheme using the process
//! credential, and relays the backend's response with diagnostic headers
//! describing which identity served the call. A second surface,
//! `POST /bewit`, mints pre-signed GET URLs for tools that cannot set
//! headers at all.
//!
//! The credential never crosses the local socket in either direction.

pub mod audit;
pub mod backoff;
pub mod bewit;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod hawk;
pub mod routes;
pub mod server;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use server::{start, ProxyHandle};

/// Crate version, reported in the `X-Taskcluster-Proxy-Version` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source revision baked in at build time; empty when built outside a
/// git checkout.
pub const REVISION: &str = env!("TCPROXY_REVISION");
