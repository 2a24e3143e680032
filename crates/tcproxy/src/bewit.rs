//! Bewit (pre-signed URL) generation.
//!
//! A bewit authorizes exactly one `GET` URL until its expiry, letting
//! clients that cannot sign requests themselves (plain download tools)
//! fetch protected resources. The proxy only mints bewits; verifying
//! them is the backend's job.

use crate::error::{ProxyError, Result};
use crate::hawk;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use std::time::Duration;
use url::Url;

/// Sign `url` for unauthenticated `GET` until `now + ttl`, with a fixed
/// expiry clock. Deterministic; exercised directly by tests.
pub fn issue_bewit_at(
    client_id: &str,
    key: &[u8],
    url: &Url,
    ttl: Duration,
    ext: Option<&str>,
    now_secs: u64,
) -> Result<Url> {
    if key.is_empty() {
        return Err(ProxyError::MalformedCredential(
            "empty access token".to_string(),
        ));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::BewitIneligible(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }

    let expiry = now_secs + ttl.as_secs();
    let (host, port, resource) = hawk::url_parts(url)
        .map_err(|e| ProxyError::BewitIneligible(e.to_string()))?;

    // Same canonical representation as a signed request, restricted to
    // what a deferred credential-free GET can carry: the expiry stands in
    // for the timestamp, and there is no nonce and no payload hash.
    let canonical = hawk::canonical_string(
        hawk::BEWIT_PREFIX,
        expiry,
        "",
        "GET",
        &resource,
        &host,
        port,
        "",
        ext.unwrap_or(""),
    );
    let mac = STANDARD.encode(hawk::hmac_sha256(key, canonical.as_bytes())?);

    let token = URL_SAFE_NO_PAD.encode(format!(
        "{}\\{}\\{}\\{}",
        client_id,
        expiry,
        mac,
        ext.unwrap_or("")
    ));

    let mut signed = url.clone();
    signed.query_pairs_mut().append_pair("bewit", &token);
    Ok(signed)
}

/// Sign `url` for unauthenticated `GET` for the next `ttl`.
pub fn issue_bewit(
    client_id: &str,
    key: &[u8],
    url: &Url,
    ttl: Duration,
    ext: Option<&str>,
) -> Result<Url> {
    issue_bewit_at(client_id, key, url, ttl, ext, hawk::now_secs())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"werxhqb98rpaxn39848xrunpaw3489ruxnpa98w4rxn";

    fn target() -> Url {
        Url::parse("https://example.com/resource/1?b=1&a=2").unwrap()
    }

    fn decode_token(signed: &Url) -> Vec<String> {
        let token = signed
            .query_pairs()
            .find(|(k, _)| k == "bewit")
            .map(|(_, v)| v.to_string())
            .unwrap();
        let raw = URL_SAFE_NO_PAD.decode(token).unwrap();
        String::from_utf8(raw)
            .unwrap()
            .split('\\')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_token_layout_is_id_expiry_mac_ext() {
        let signed = issue_bewit_at(
            "123456",
            KEY,
            &target(),
            Duration::from_secs(0),
            Some("some-app-data"),
            1356420707,
        )
        .unwrap();

        let fields = decode_token(&signed);
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "123456");
        assert_eq!(fields[1], "1356420707");
        assert!(!fields[2].is_empty());
        assert_eq!(fields[3], "some-app-data");
    }

    #[test]
    fn test_mac_matches_independent_computation() {
        let signed = issue_bewit_at(
            "123456",
            KEY,
            &target(),
            Duration::from_secs(0),
            Some("some-app-data"),
            1356420707,
        )
        .unwrap();
        let fields = decode_token(&signed);

        let canonical = "hawk.1.bewit\n\
                         1356420707\n\
                         \n\
                         GET\n\
                         /resource/1?b=1&a=2\n\
                         example.com\n\
                         443\n\
                         \n\
                         some-app-data\n";
        let expected = STANDARD.encode(hawk::hmac_sha256(KEY, canonical.as_bytes()).unwrap());
        assert_eq!(fields[2], expected);
    }

    #[test]
    fn test_bewit_appended_to_existing_query() {
        let signed = issue_bewit(
            "id",
            KEY,
            &target(),
            Duration::from_secs(3600),
            None,
        )
        .unwrap();
        // Original query survives and the bewit is one extra parameter
        assert!(signed.query().unwrap().starts_with("b=1&a=2&bewit="));
        assert_eq!(signed.path(), "/resource/1");
    }

    #[test]
    fn test_expiry_is_now_plus_ttl() {
        let signed = issue_bewit_at(
            "id",
            KEY,
            &target(),
            Duration::from_secs(600),
            None,
            1_000_000,
        )
        .unwrap();
        let fields = decode_token(&signed);
        assert_eq!(fields[1], "1000600");
        assert_eq!(fields[3], "");
    }

    #[test]
    fn test_empty_secret_rejected() {
        let err =
            issue_bewit("id", b"", &target(), Duration::from_secs(60), None).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedCredential(_)));
    }

    #[test]
    fn test_non_http_scheme_ineligible() {
        let url = Url::parse("ftp://example.com/file").unwrap();
        let err = issue_bewit("id", KEY, &url, Duration::from_secs(60), None).unwrap_err();
        assert!(matches!(err, ProxyError::BewitIneligible(_)));
    }
}
