//! Audit logging for proxied requests.
//!
//! Structured `tracing` events with a fixed target. Secrets never appear
//! here: no authorization headers, no access tokens, and no signed bewit
//! URLs (a bewit is itself a capability).

use tracing::info;

/// Log a call forwarded to the backend.
pub fn log_forwarded(service: &str, version: &str, method: &str, status: u16) {
    info!(
        target: "tcproxy::audit",
        service = service,
        version = version,
        method = method,
        status = status,
        decision = "forward",
        "api call relayed"
    );
}

/// Log a request rejected before any outbound call.
pub fn log_rejected(path: &str, reason: &str) {
    info!(
        target: "tcproxy::audit",
        path = path,
        decision = "reject",
        reason = reason,
        "request rejected"
    );
}

/// Log a bewit issued for a target host. The signed URL itself is
/// deliberately not logged.
pub fn log_bewit_issued(host: &str) {
    info!(
        target: "tcproxy::audit",
        host = host,
        decision = "issue",
        "bewit issued"
    );
}
