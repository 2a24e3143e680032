//! Request routing and response assembly.
//!
//! Two inbound surfaces: `POST /bewit` (mint a pre-signed URL for the
//! literal target URL in the body) and everything else (resolve, sign,
//! forward, relay). Every response, on every code path, carries the full
//! diagnostic header set so callers can see which credential identity
//! served the call and which backend URL it resolved to.

use crate::credentials::CredentialStore;
use crate::error::{ProxyError, Result};
use crate::forward::{Forwarder, OutboundRequest, UpstreamResponse};
use crate::{audit, bewit, endpoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// How long a minted bewit remains valid.
const BEWIT_TTL: Duration = Duration::from_secs(3600);

/// Request dispatcher. One instance serves all connections; it holds no
/// per-request state.
pub struct Routes {
    root_url: Url,
    store: Arc<CredentialStore>,
    forwarder: Forwarder,
}

impl Routes {
    #[must_use]
    pub fn new(root_url: Url, store: Arc<CredentialStore>, forwarder: Forwarder) -> Self {
        Self {
            root_url,
            store,
            forwarder,
        }
    }

    /// The diagnostic headers attached to every response. Exactly one of
    /// the Perm-/Temp-ClientId headers is non-empty; empty values are
    /// equivalent to absent headers.
    fn diagnostic_headers(&self, endpoint: &str) -> Vec<(String, String)> {
        let (perm_id, temp_id, temp_scopes) = if self.store.is_temporary() {
            (
                String::new(),
                self.store.client_id().to_string(),
                self.store.temp_scopes_json(),
            )
        } else {
            (
                self.store.client_id().to_string(),
                String::new(),
                String::new(),
            )
        };

        vec![
            ("X-Taskcluster-Proxy-Version".to_string(), crate::VERSION.to_string()),
            ("X-Taskcluster-Proxy-Revision".to_string(), crate::REVISION.to_string()),
            ("X-Taskcluster-Proxy-Perm-ClientId".to_string(), perm_id),
            ("X-Taskcluster-Proxy-Temp-ClientId".to_string(), temp_id),
            ("X-Taskcluster-Proxy-Temp-Scopes".to_string(), temp_scopes),
            ("X-Taskcluster-Endpoint".to_string(), endpoint.to_string()),
            (
                "X-Taskcluster-Authorized-Scopes".to_string(),
                self.store.authorized_scopes_json(),
            ),
        ]
    }

    /// `POST /bewit`: body is the literal target URL; answer is a `303`
    /// whose `Location` header and plain-text body are byte-identical.
    pub async fn handle_bewit(
        &self,
        stream: &mut TcpStream,
        method: &str,
        body: &[u8],
    ) -> Result<()> {
        if method != "POST" {
            audit::log_rejected("/bewit", "method not allowed");
            return self
                .respond_error(stream, 405, "Method Not Allowed", "bewit issuance requires POST", "")
                .await;
        }

        let target = match std::str::from_utf8(body) {
            Ok(target) => target.trim(),
            Err(_) => {
                audit::log_rejected("/bewit", "body is not UTF-8");
                return self
                    .respond_error(stream, 400, "Bad Request", "target URL must be UTF-8 text", "")
                    .await;
            }
        };
        let url = match Url::parse(target) {
            Ok(url) if url.host_str().is_some() => url,
            _ => {
                audit::log_rejected("/bewit", "malformed target URL");
                return self
                    .respond_error(stream, 400, "Bad Request", "malformed target URL", "")
                    .await;
            }
        };

        if let Err(e) = self.store.validate() {
            return self.respond_proxy_error(stream, &e, target).await;
        }
        let ext = match self.store.signature_ext() {
            Ok(ext) => ext,
            Err(e) => return self.respond_proxy_error(stream, &e, target).await,
        };

        let signed = match bewit::issue_bewit(
            self.store.client_id(),
            self.store.access_token().as_bytes(),
            &url,
            BEWIT_TTL,
            ext.as_deref(),
        ) {
            Ok(signed) => signed,
            Err(e) => return self.respond_proxy_error(stream, &e, target).await,
        };

        audit::log_bewit_issued(url.host_str().unwrap_or(""));

        let signed_str = String::from(signed);
        let mut headers = self.diagnostic_headers(target);
        headers.push(("Location".to_string(), signed_str.clone()));
        headers.push(("Content-Type".to_string(), "text/plain".to_string()));
        write_response(stream, 303, "See Other", &headers, signed_str.as_bytes()).await
    }

    /// Generic proxied call: resolve the path, sign, forward, relay.
    pub async fn handle_api(
        &self,
        stream: &mut TcpStream,
        method: &str,
        path_and_query: &str,
        inbound_headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        let resolved = match endpoint::resolve(&self.root_url, path_and_query) {
            Ok(resolved) => resolved,
            Err(e) => {
                audit::log_rejected(path_and_query, "invalid endpoint");
                // The diagnostic endpoint header stays empty: resolution
                // failure must not leak a partial URL.
                return self.respond_proxy_error(stream, &e, "").await;
            }
        };
        let endpoint_str = resolved.full_url.as_str().to_string();

        // Catch a structurally broken credential before any outbound call
        if let Err(e) = self.store.validate() {
            audit::log_rejected(path_and_query, "malformed credential");
            return self.respond_proxy_error(stream, &e, &endpoint_str).await;
        }
        let ext = match self.store.signature_ext() {
            Ok(ext) => ext,
            Err(e) => return self.respond_proxy_error(stream, &e, &endpoint_str).await,
        };

        let content_type = header_value(inbound_headers, "content-type");
        let forwarded = forwardable_headers(inbound_headers);
        let request = OutboundRequest {
            client_id: self.store.client_id(),
            key: self.store.access_token().as_bytes(),
            method,
            url: &resolved.full_url,
            content_type,
            body,
            ext: ext.as_deref(),
            headers: &forwarded,
        };

        match self.forwarder.forward(&request).await {
            Ok(upstream) => {
                audit::log_forwarded(
                    &resolved.service,
                    &resolved.api_version,
                    method,
                    upstream.status,
                );
                self.relay(stream, upstream, &endpoint_str).await
            }
            Err(e) => self.respond_proxy_error(stream, &e, &endpoint_str).await,
        }
    }

    /// Relay the backend's response verbatim, plus diagnostic headers.
    /// The body is streamed, including for non-2xx statuses; error bodies
    /// must reach the caller.
    async fn relay(
        &self,
        stream: &mut TcpStream,
        mut upstream: UpstreamResponse,
        endpoint: &str,
    ) -> Result<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", upstream.status, upstream.reason);
        for (name, value) in &upstream.headers {
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        for (name, value) in self.diagnostic_headers(endpoint) {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("Connection: close\r\n\r\n");

        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&upstream.buffered_body).await?;

        let mut chunk = [0u8; 8192];
        loop {
            let n = match upstream.stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Upstream read error during relay: {}", e);
                    break;
                }
            };
            stream.write_all(&chunk[..n]).await?;
        }
        stream.flush().await?;
        Ok(())
    }

    /// Map a proxy error onto its terminal HTTP response.
    async fn respond_proxy_error(
        &self,
        stream: &mut TcpStream,
        error: &ProxyError,
        endpoint: &str,
    ) -> Result<()> {
        let (status, reason) = match error {
            ProxyError::InvalidEndpoint { .. } => (404, "Not Found"),
            ProxyError::MalformedCredential(_) => (500, "Internal Server Error"),
            ProxyError::BewitIneligible(_) => (400, "Bad Request"),
            ProxyError::UpstreamConnect { .. }
            | ProxyError::UpstreamIo(_)
            | ProxyError::HttpParse(_) => (502, "Bad Gateway"),
            _ => (500, "Internal Server Error"),
        };
        self.respond_error(stream, status, reason, &error.to_string(), endpoint)
            .await
    }

    /// Write a synthesized error response. Always a non-empty JSON body:
    /// a bare response is indistinguishable from a broken proxy.
    pub(crate) async fn respond_error(
        &self,
        stream: &mut TcpStream,
        status: u16,
        reason: &str,
        message: &str,
        endpoint: &str,
    ) -> Result<()> {
        let body = serde_json::json!({ "error": message }).to_string();
        let mut headers = self.diagnostic_headers(endpoint);
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        write_response(stream, status, reason, &headers, body.as_bytes()).await
    }
}

/// Write a complete response with explicit body.
async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Look up an inbound header by case-insensitive name.
fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Inbound headers safe to forward. Host, length and authorization are
/// rewritten by the forwarder; hop-by-hop headers stay local.
fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("host")
                && !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("connection")
                && !name.eq_ignore_ascii_case("authorization")
                && !name.eq_ignore_ascii_case("transfer-encoding")
        })
        .cloned()
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::credentials::Credentials;

    fn routes_with(creds: Credentials) -> Routes {
        Routes::new(
            Url::parse("https://tc.example.com").unwrap(),
            Arc::new(CredentialStore::new(creds)),
            Forwarder::new(ExponentialBackoff::default()).unwrap(),
        )
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> &'a str {
        header_value(headers, name).unwrap_or("")
    }

    #[test]
    fn test_diagnostics_permanent_sets_exactly_perm() {
        let routes = routes_with(Credentials::permanent("perm-client", "secret"));
        let headers = routes.diagnostic_headers("https://tc.example.com/api/queue/v1/ping");

        assert_eq!(header(&headers, "X-Taskcluster-Proxy-Perm-ClientId"), "perm-client");
        assert_eq!(header(&headers, "X-Taskcluster-Proxy-Temp-ClientId"), "");
        assert_eq!(header(&headers, "X-Taskcluster-Proxy-Temp-Scopes"), "");
        assert_eq!(
            header(&headers, "X-Taskcluster-Endpoint"),
            "https://tc.example.com/api/queue/v1/ping"
        );
        assert_eq!(header(&headers, "X-Taskcluster-Proxy-Version"), crate::VERSION);
    }

    #[test]
    fn test_diagnostics_temporary_sets_exactly_temp() {
        let temp = Credentials::permanent("issuer", "secret")
            .create_named_temporary_credentials(
                "garbage/temp-client",
                Duration::from_secs(3600),
                vec!["assume:project:tester".to_string()],
            )
            .unwrap();
        let routes = routes_with(temp);
        let headers = routes.diagnostic_headers("");

        assert_eq!(header(&headers, "X-Taskcluster-Proxy-Perm-ClientId"), "");
        assert_eq!(
            header(&headers, "X-Taskcluster-Proxy-Temp-ClientId"),
            "garbage/temp-client"
        );
        assert_eq!(
            header(&headers, "X-Taskcluster-Proxy-Temp-Scopes"),
            r#"["assume:project:tester"]"#
        );
    }

    #[test]
    fn test_diagnostics_carry_authorized_scopes() {
        let creds = Credentials {
            authorized_scopes: Some(vec!["secrets:get:garbage/foo".to_string()]),
            ..Credentials::permanent("perm-client", "secret")
        };
        let routes = routes_with(creds);
        let headers = routes.diagnostic_headers("");
        assert_eq!(
            header(&headers, "X-Taskcluster-Authorized-Scopes"),
            r#"["secrets:get:garbage/foo"]"#
        );
    }

    #[test]
    fn test_forwardable_headers_filtering() {
        let inbound = vec![
            ("Host".to_string(), "localhost:60024".to_string()),
            ("Authorization".to_string(), "Bearer stale".to_string()),
            ("Content-Length".to_string(), "42".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];
        let forwarded = forwardable_headers(&inbound);
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].0, "Content-Type");
        assert_eq!(forwarded[1].0, "Accept");
    }

    #[test]
    fn test_header_value_case_insensitive() {
        let headers = vec![("CONTENT-TYPE".to_string(), "text/plain".to_string())];
        assert_eq!(header_value(&headers, "content-type"), Some("text/plain"));
        assert_eq!(header_value(&headers, "accept"), None);
    }
}
