//! Proxy server: listener, connection handling, request parsing.
//!
//! Plain HTTP/1.1 on the local side, one request per connection
//! (`Connection: close` on every response). The local surface is
//! unauthenticated, so it binds to loopback unless configured otherwise.

use crate::config::ProxyConfig;
use crate::credentials::CredentialStore;
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::routes::Routes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use url::Url;

/// Maximum accumulated size of an inbound request head (64 KiB).
const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// Maximum inbound body size (16 MiB).
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// A running proxy instance.
#[derive(Debug)]
pub struct ProxyHandle {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// The port the listener actually bound (relevant when configured
    /// with port 0).
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections. In-flight requests finish on their
    /// own tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Bind the listener and start serving. Returns once the socket is
/// bound; the accept loop runs on a background task.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    let root_url = Url::parse(&config.root_url)
        .map_err(|e| ProxyError::Config(format!("invalid root URL: {}", e)))?;
    if config.client_id.is_empty() || config.access_token.is_empty() {
        return Err(ProxyError::Config(
            "client ID and access token must be set".to_string(),
        ));
    }

    let store = Arc::new(CredentialStore::new(config.credentials()));
    let forwarder = Forwarder::new(config.backoff.clone())?;
    let routes = Arc::new(Routes::new(root_url, store, forwarder));

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;
    let port = listener.local_addr().map_err(ProxyError::Io)?.port();
    info!(
        "Listening on {}:{} for {}",
        config.bind_address, port, config.root_url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let max_connections = config.max_connections;
    tokio::spawn(accept_loop(listener, routes, max_connections, shutdown_rx));

    Ok(ProxyHandle { port, shutdown_tx })
}

async fn accept_loop(
    listener: TcpListener,
    routes: Arc<Routes>,
    max_connections: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.changed() => {
                info!("Shutting down listener");
                return;
            }
        };
        let (mut stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };

        if active.load(Ordering::SeqCst) >= max_connections {
            debug!("Connection limit reached, refusing {}", peer);
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let _ = routes
                    .respond_error(&mut stream, 503, "Service Unavailable", "connection limit reached", "")
                    .await;
            });
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);
        let routes = Arc::clone(&routes);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&routes, stream).await {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// A parsed inbound request.
struct InboundRequest {
    method: String,
    path_and_query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

enum ParseOutcome {
    Request(InboundRequest),
    /// Terminal response the parser already decided on.
    Reject { status: u16, reason: &'static str, message: &'static str },
}

async fn handle_connection(routes: &Routes, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let outcome = read_request(&mut reader).await?;
    let mut stream = reader.into_inner();

    match outcome {
        ParseOutcome::Reject { status, reason, message } => {
            routes
                .respond_error(&mut stream, status, reason, message, "")
                .await
        }
        ParseOutcome::Request(request) => {
            let path = request
                .path_and_query
                .split('?')
                .next()
                .unwrap_or(&request.path_and_query);
            if path == "/bewit" {
                routes
                    .handle_bewit(&mut stream, &request.method, &request.body)
                    .await
            } else {
                routes
                    .handle_api(
                        &mut stream,
                        &request.method,
                        &request.path_and_query,
                        &request.headers,
                        &request.body,
                    )
                    .await
            }
        }
    }
}

/// Read the request line, headers and body off the wire.
async fn read_request(reader: &mut BufReader<TcpStream>) -> Result<ParseOutcome> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end();

    let mut parts = request_line.split(' ');
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) if !method.is_empty() && path.starts_with('/') => {
            (method.to_string(), path.to_string())
        }
        _ => {
            return Ok(ParseOutcome::Reject {
                status: 400,
                reason: "Bad Request",
                message: "malformed request line",
            });
        }
    };

    let mut headers = Vec::new();
    let mut head_size = request_line.len();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        head_size += line.len();
        if head_size > MAX_REQUEST_HEAD {
            return Ok(ParseOutcome::Reject {
                status: 431,
                reason: "Request Header Fields Too Large",
                message: "request head too large",
            });
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BODY {
        return Ok(ParseOutcome::Reject {
            status: 413,
            reason: "Payload Too Large",
            message: "request body too large",
        });
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(ParseOutcome::Request(InboundRequest {
        method,
        path_and_query: path,
        headers,
        body,
    }))
}
