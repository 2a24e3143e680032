//! Credential model and store.
//!
//! The proxy process is started with exactly one credential set, either
//! permanent (`clientId` + `accessToken`) or temporary (a derived token
//! plus a certificate naming its scopes and expiry). The store is built
//! once at startup and never mutated; concurrent reads from in-flight
//! requests need no locking.
//!
//! Scope adjudication is the backend's job. The store only carries the
//! certificate and any `authorizedScopes` restriction faithfully into the
//! signature's `ext` field; it never approves or denies anything locally.

use crate::error::{ProxyError, Result};
use crate::hawk;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// Margin subtracted from a certificate's start time to tolerate clock
/// drift between issuer and backend.
const CERT_START_DRIFT: Duration = Duration::from_secs(5 * 60);

/// A temporary credential's certificate. Timestamps are milliseconds
/// since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub version: u32,
    pub scopes: Vec<String>,
    pub start: i64,
    pub expiry: i64,
    pub seed: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// The credential set the proxy signs with.
///
/// For temporary credentials, `access_token` is already the derived
/// secret; the proxy never re-derives anything at request time.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: Zeroizing<String>,
    /// Certificate JSON, present iff the credential is temporary.
    pub certificate: Option<String>,
    /// Caller-supplied scope restriction, carried to the backend as-is.
    pub authorized_scopes: Option<Vec<String>>,
}

impl Credentials {
    /// A permanent credential with no scope restriction.
    #[must_use]
    pub fn permanent(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: Zeroizing::new(access_token.into()),
            certificate: None,
            authorized_scopes: None,
        }
    }

    /// Derive named temporary credentials from this permanent credential.
    ///
    /// The derived access token is `base64url(HMAC-SHA256(token, seed))`
    /// and the certificate signature is an HMAC over the canonical
    /// `version`/`clientId`/`issuer`/`seed`/`start`/`expiry`/`scopes`
    /// lines, so only the holder of the permanent secret could have
    /// produced it. The certificate starts slightly in the past to
    /// tolerate clock drift.
    pub fn create_named_temporary_credentials(
        &self,
        client_id: &str,
        validity: Duration,
        scopes: Vec<String>,
    ) -> Result<Credentials> {
        if self.certificate.is_some() {
            return Err(ProxyError::MalformedCredential(
                "temporary credentials cannot issue further credentials".to_string(),
            ));
        }
        if self.access_token.is_empty() {
            return Err(ProxyError::MalformedCredential(
                "empty access token".to_string(),
            ));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let start = (now.saturating_sub(CERT_START_DRIFT)).as_millis() as i64;
        let expiry = (now + validity).as_millis() as i64;
        let seed = random_seed()?;

        let mut lines = vec![
            "version:1".to_string(),
            format!("clientId:{}", client_id),
            format!("issuer:{}", self.client_id),
            format!("seed:{}", seed),
            format!("start:{}", start),
            format!("expiry:{}", expiry),
            "scopes:".to_string(),
        ];
        lines.extend(scopes.iter().cloned());

        let signature = STANDARD.encode(hawk::hmac_sha256(
            self.access_token.as_bytes(),
            lines.join("\n").as_bytes(),
        )?);
        let derived_token = URL_SAFE_NO_PAD.encode(hawk::hmac_sha256(
            self.access_token.as_bytes(),
            seed.as_bytes(),
        )?);

        let certificate = Certificate {
            version: 1,
            scopes,
            start,
            expiry,
            seed,
            signature,
            issuer: Some(self.client_id.clone()),
        };
        let certificate_json = serde_json::to_string(&certificate)
            .map_err(|e| ProxyError::MalformedCredential(e.to_string()))?;

        Ok(Credentials {
            client_id: client_id.to_string(),
            access_token: Zeroizing::new(derived_token),
            certificate: Some(certificate_json),
            authorized_scopes: None,
        })
    }
}

/// A 32-byte random seed, base64url encoded.
fn random_seed() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|e| ProxyError::Config(format!("RNG failure: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Fields carried in the signature's `ext` extension.
#[derive(Serialize)]
struct SignatureExt<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate: Option<Certificate>,
    #[serde(rename = "authorizedScopes", skip_serializing_if = "Option::is_none")]
    authorized_scopes: Option<&'a [String]>,
}

/// Immutable holder of the process credential.
#[derive(Debug)]
pub struct CredentialStore {
    credentials: Credentials,
}

impl CredentialStore {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    #[must_use]
    pub fn access_token(&self) -> &Zeroizing<String> {
        &self.credentials.access_token
    }

    /// Whether a certificate accompanies the credential.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.credentials.certificate.is_some()
    }

    #[must_use]
    pub fn authorized_scopes(&self) -> Option<&[String]> {
        self.credentials.authorized_scopes.as_deref()
    }

    /// Parse the certificate, if any. An unparseable certificate is a
    /// `MalformedCredential`, discovered before any outbound call.
    pub fn certificate(&self) -> Result<Option<Certificate>> {
        match &self.credentials.certificate {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                ProxyError::MalformedCredential(format!("unparseable certificate: {}", e))
            }),
        }
    }

    /// Check the credential is structurally sound without touching the
    /// network. Run before signing so a broken credential fails the
    /// request with an internal fault instead of an outbound call.
    pub fn validate(&self) -> Result<()> {
        if self.credentials.access_token.is_empty() {
            return Err(ProxyError::MalformedCredential(
                "empty access token".to_string(),
            ));
        }
        self.certificate()?;
        Ok(())
    }

    /// The `ext` field for signatures: base64 JSON carrying the
    /// certificate and any `authorizedScopes` restriction. `None` for a
    /// plain permanent credential.
    pub fn signature_ext(&self) -> Result<Option<String>> {
        let certificate = self.certificate()?;
        let authorized_scopes = self.credentials.authorized_scopes.as_deref();
        if certificate.is_none() && authorized_scopes.is_none() {
            return Ok(None);
        }
        let ext = SignatureExt {
            certificate,
            authorized_scopes,
        };
        let json =
            serde_json::to_string(&ext).map_err(|e| ProxyError::MalformedCredential(e.to_string()))?;
        Ok(Some(STANDARD.encode(json)))
    }

    /// The certificate's scopes as a JSON array, for diagnostic
    /// reporting. Empty string for permanent or unparseable credentials.
    #[must_use]
    pub fn temp_scopes_json(&self) -> String {
        match self.certificate() {
            Ok(Some(cert)) => serde_json::to_string(&cert.scopes).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// The authorized-scopes restriction as a JSON array, or empty.
    #[must_use]
    pub fn authorized_scopes_json(&self) -> String {
        match &self.credentials.authorized_scopes {
            Some(scopes) => serde_json::to_string(scopes).unwrap_or_default(),
            None => String::new(),
        }
    }
}
