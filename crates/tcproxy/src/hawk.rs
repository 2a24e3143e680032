//! Hawk request signing.
//!
//! Computes the HMAC-SHA256 `Authorization` header for outbound calls.
//! The canonical signing string is a fixed, newline-terminated sequence of
//! request fields; two requests with identical inputs still sign
//! differently because the timestamp and nonce are fresh for every call.
//!
//! The `*_at` entry points take an explicit timestamp and nonce so tests
//! can pin the clock; production paths go through [`authorization_header`]
//! which draws both from the system clock and RNG.

use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const HEADER_PREFIX: &str = "hawk.1.header";
const PAYLOAD_PREFIX: &str = "hawk.1.payload";
pub(crate) const BEWIT_PREFIX: &str = "hawk.1.bewit";

/// Number of random bytes in a nonce. Collision within one timestamp
/// second must be negligible.
const NONCE_BYTES: usize = 8;

/// HMAC-SHA256 of `data` under `key`, as raw bytes.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| ProxyError::MalformedCredential("invalid signing key".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Generate a fresh random nonce (base64url, no padding).
pub(crate) fn fresh_nonce() -> Result<String> {
    let mut bytes = [0u8; NONCE_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|e| ProxyError::Config(format!("RNG failure: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hash of the request payload, bound to its media type.
///
/// `base64(SHA256("hawk.1.payload\n" + content-type + "\n" + body + "\n"))`
/// where the content type is lowercased and stripped of parameters
/// (`application/json; charset=utf-8` hashes as `application/json`).
#[must_use]
pub fn payload_hash(content_type: &str, body: &[u8]) -> String {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(PAYLOAD_PREFIX.as_bytes());
    hasher.update(b"\n");
    hasher.update(media_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    STANDARD.encode(hasher.finalize())
}

/// The canonical signing string: fixed field order, every line
/// newline-terminated, empty fields kept as empty lines.
#[allow(clippy::too_many_arguments)]
pub(crate) fn canonical_string(
    prefix: &str,
    ts: u64,
    nonce: &str,
    method: &str,
    resource: &str,
    host: &str,
    port: u16,
    hash: &str,
    ext: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        prefix, ts, nonce, method, resource, host, port, hash, ext
    )
}

/// Split a URL into the (host, port, path+query) triple the canonical
/// string needs. The host is lowercased; the port falls back to the
/// scheme default.
pub(crate) fn url_parts(url: &Url) -> Result<(String, u16, String)> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::HttpParse(format!("URL has no host: {}", url)))?
        .to_ascii_lowercase();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::HttpParse(format!("URL has no port: {}", url)))?;
    let resource = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    Ok((host, port, resource))
}

/// Compute the `Authorization` header value for a fixed timestamp and
/// nonce. Deterministic; exercised directly by tests.
#[allow(clippy::too_many_arguments)]
pub fn authorization_header_at(
    client_id: &str,
    key: &[u8],
    method: &str,
    url: &Url,
    hash: Option<&str>,
    ext: Option<&str>,
    ts: u64,
    nonce: &str,
) -> Result<String> {
    let (host, port, resource) = url_parts(url)?;
    let canonical = canonical_string(
        HEADER_PREFIX,
        ts,
        nonce,
        &method.to_ascii_uppercase(),
        &resource,
        &host,
        port,
        hash.unwrap_or(""),
        ext.unwrap_or(""),
    );
    let mac = STANDARD.encode(hmac_sha256(key, canonical.as_bytes())?);

    let mut header = format!(
        "Hawk id=\"{}\", ts=\"{}\", nonce=\"{}\"",
        client_id, ts, nonce
    );
    if let Some(hash) = hash {
        header.push_str(&format!(", hash=\"{}\"", hash));
    }
    if let Some(ext) = ext {
        header.push_str(&format!(", ext=\"{}\"", ext));
    }
    header.push_str(&format!(", mac=\"{}\"", mac));
    Ok(header)
}

/// Compute the `Authorization` header value for one outbound request.
///
/// Draws a fresh timestamp and nonce, and hashes the payload when one is
/// present. Fails only on a structurally broken credential; backend
/// authorization outcomes are never this function's concern.
pub fn authorization_header(
    client_id: &str,
    key: &[u8],
    method: &str,
    url: &Url,
    payload: Option<(&str, &[u8])>,
    ext: Option<&str>,
) -> Result<String> {
    if key.is_empty() {
        return Err(ProxyError::MalformedCredential(
            "empty access token".to_string(),
        ));
    }
    let hash = payload.map(|(content_type, body)| payload_hash(content_type, body));
    authorization_header_at(
        client_id,
        key,
        method,
        url,
        hash.as_deref(),
        ext,
        now_secs(),
        &fresh_nonce()?,
    )
}
