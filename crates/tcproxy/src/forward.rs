//! Proxy forwarder: signed outbound calls and response relay.
//!
//! Connects to the backend (plain TCP for `http` roots, rustls for
//! `https`), writes the signed request, and hands the parsed response
//! head plus the remaining body stream back to the router for relay.
//!
//! Transport failures are retried under the configured backoff policy;
//! every attempt is re-signed so a timestamp or nonce is never reused.
//! HTTP-level responses, including 4xx/5xx, are returned as-is and never
//! retried.

use crate::backoff::ExponentialBackoff;
use crate::error::{ProxyError, Result};
use crate::hawk;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Timeout for upstream TCP connect.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum size of an upstream response head (64 KiB).
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// One outbound call, ready to be signed and sent. Signing inputs are
/// kept separate from the raw body so each retry attempt signs fresh.
pub struct OutboundRequest<'a> {
    pub client_id: &'a str,
    pub key: &'a [u8],
    pub method: &'a str,
    pub url: &'a Url,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
    /// Extension data (certificate, authorized scopes) carried with the
    /// signature.
    pub ext: Option<&'a str>,
    /// Inbound headers to forward verbatim.
    pub headers: &'a [(String, String)],
}

/// The backend's answer: parsed head plus the not-yet-read remainder of
/// the body.
pub struct UpstreamResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Body bytes read past the head while parsing.
    pub buffered_body: Vec<u8>,
    pub stream: UpstreamStream,
}

/// Either a plain or a TLS upstream connection.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl UpstreamStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            UpstreamStream::Plain(s) => s.read(buf).await,
            UpstreamStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            UpstreamStream::Plain(s) => s.write_all(buf).await,
            UpstreamStream::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            UpstreamStream::Plain(s) => s.flush().await,
            UpstreamStream::Tls(s) => s.flush().await,
        }
    }
}

/// Executes signed calls against the backend.
pub struct Forwarder {
    /// Shared TLS connector, created once at startup with the system
    /// root certificate store.
    tls_connector: TlsConnector,
    backoff: ExponentialBackoff,
}

impl Forwarder {
    pub fn new(backoff: ExponentialBackoff) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            backoff,
        })
    }

    /// Issue the call, retrying transport failures under the backoff
    /// policy. Each attempt is signed fresh.
    pub async fn forward(&self, request: &OutboundRequest<'_>) -> Result<UpstreamResponse> {
        let mut attempts = self.backoff.start();
        loop {
            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => match attempts.next_interval() {
                    Some(interval) => {
                        warn!(
                            "Transient upstream failure, retrying in {:?}: {}",
                            interval, e
                        );
                        tokio::time::sleep(interval).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, request: &OutboundRequest<'_>) -> Result<UpstreamResponse> {
        // Fresh timestamp and nonce on every attempt
        let payload = if request.body.is_empty() {
            None
        } else {
            Some((request.content_type.unwrap_or(""), request.body))
        };
        let authorization = hawk::authorization_header(
            request.client_id,
            request.key,
            request.method,
            request.url,
            payload,
            request.ext,
        )?;

        let mut upstream = self.connect(request.url).await?;

        let head = build_request_head(request, &authorization)?;
        upstream
            .write_all(head.as_bytes())
            .await
            .map_err(ProxyError::UpstreamIo)?;
        if !request.body.is_empty() {
            upstream
                .write_all(request.body)
                .await
                .map_err(ProxyError::UpstreamIo)?;
        }
        upstream.flush().await.map_err(ProxyError::UpstreamIo)?;

        read_response_head(upstream).await
    }

    async fn connect(&self, url: &Url) -> Result<UpstreamStream> {
        let (host, port, _) = hawk::url_parts(url)?;
        let addr = format!("{}:{}", host, port);

        let tcp = match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProxyError::UpstreamConnect {
                    host,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ProxyError::UpstreamConnect {
                    host,
                    reason: "connection timed out".to_string(),
                });
            }
        };

        if url.scheme() != "https" {
            return Ok(UpstreamStream::Plain(tcp));
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.clone()).map_err(|_| {
            ProxyError::UpstreamConnect {
                host: host.clone(),
                reason: "invalid server name for TLS".to_string(),
            }
        })?;
        let tls = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                host,
                reason: format!("TLS handshake failed: {}", e),
            })?;
        Ok(UpstreamStream::Tls(Box::new(tls)))
    }
}

/// Assemble the outbound request head. `Connection: close` lets the
/// response be relayed by streaming until EOF.
fn build_request_head(request: &OutboundRequest<'_>, authorization: &str) -> Result<String> {
    let (host, port, resource) = hawk::url_parts(request.url)?;
    let default_port = if request.url.scheme() == "https" { 443 } else { 80 };
    let host_header = if port == default_port {
        host
    } else {
        format!("{}:{}", host, port)
    };

    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nAuthorization: {}\r\n",
        request.method.to_ascii_uppercase(),
        resource,
        host_header,
        authorization
    );
    for (name, value) in request.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !request.body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    Ok(head)
}

/// Read and parse the response head, leaving any body bytes already read
/// in `buffered_body`.
async fn read_response_head(mut stream: UpstreamStream) -> Result<UpstreamResponse> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 8192];
    let head_end;
    loop {
        let n = stream.read(&mut chunk).await.map_err(ProxyError::UpstreamIo)?;
        if n == 0 {
            return Err(ProxyError::UpstreamIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            )));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&head) {
            head_end = pos;
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::HttpParse(
                "upstream response head too large".to_string(),
            ));
        }
    }

    let buffered_body = head.split_off(head_end + 4);
    let head_str = std::str::from_utf8(&head)
        .map_err(|_| ProxyError::HttpParse("non-UTF8 response head".to_string()))?;

    let mut lines = head_str.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::HttpParse("empty response head".to_string()))?;
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    debug!("Upstream responded {} {}", status, reason);
    Ok(UpstreamResponse {
        status,
        reason,
        headers,
        buffered_body,
        stream,
    })
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `HTTP/1.1 200 OK` into `(200, "OK")`.
fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::HttpParse(format!("malformed status line: {}", line)))?;
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed status line: {}",
            line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::HttpParse(format!("malformed status line: {}", line)))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line_ok() {
        let (status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");
    }

    #[test]
    fn test_parse_status_line_multiword_reason() {
        let (status, reason) = parse_status_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(status, 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn test_parse_status_line_no_reason() {
        let (status, reason) = parse_status_line("HTTP/1.1 204").unwrap();
        assert_eq!(status, 204);
        assert_eq!(reason, "");
    }

    #[test]
    fn test_parse_status_line_garbage() {
        assert!(parse_status_line("not an http response").is_err());
        assert!(parse_status_line("HTTP/1.1 banana OK").is_err());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(15));
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_request_head_includes_signature_and_port() {
        let url = Url::parse("http://localhost:8080/api/queue/v1/ping").unwrap();
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let request = OutboundRequest {
            client_id: "abc",
            key: b"def",
            method: "post",
            url: &url,
            content_type: Some("application/json"),
            body: b"{}",
            ext: None,
            headers: &headers,
        };
        let head = build_request_head(&request, "Hawk id=\"abc\"").unwrap();
        assert!(head.starts_with("POST /api/queue/v1/ping HTTP/1.1\r\n"));
        assert!(head.contains("Host: localhost:8080\r\n"));
        assert!(head.contains("Authorization: Hawk id=\"abc\"\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_request_head_omits_default_port() {
        let url = Url::parse("https://queue.example.com/v1/ping").unwrap();
        let request = OutboundRequest {
            client_id: "abc",
            key: b"def",
            method: "GET",
            url: &url,
            content_type: None,
            body: b"",
            ext: None,
            headers: &[],
        };
        let head = build_request_head(&request, "Hawk").unwrap();
        assert!(head.contains("Host: queue.example.com\r\n"));
        assert!(!head.contains("Content-Length"));
    }
}
