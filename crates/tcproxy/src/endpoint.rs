//! Endpoint resolution.
//!
//! Maps an incoming local path of the shape
//! `/<service>/<version>/<resource...>` (optionally prefixed with a
//! literal `/api/`) onto the fully-qualified backend URL
//! `{root}/api/{service}/{version}/{resource}`. Resolution is purely
//! syntactic: whether a service or version actually exists is only
//! discovered when the backend answers.

use crate::error::{ProxyError, Result};
use url::Url;

/// A local path resolved against the configured root URL.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub service: String,
    pub api_version: String,
    pub resource_path: String,
    pub full_url: Url,
}

/// Resolve a local request path (with optional query string) to a
/// backend URL. Pure function of `(root_url, path)`.
pub fn resolve(root_url: &Url, path_and_query: &str) -> Result<ResolvedEndpoint> {
    let invalid = || ProxyError::InvalidEndpoint {
        path: path_and_query.to_string(),
    };

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_prefix("api/").unwrap_or(trimmed);

    let (service, rest) = trimmed.split_once('/').ok_or_else(invalid)?;
    let (version, resource) = rest.split_once('/').unwrap_or((rest, ""));

    if service.is_empty() || version.is_empty() {
        return Err(invalid());
    }
    if !valid_segment(service) || !valid_segment(version) {
        return Err(invalid());
    }
    if resource.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
        return Err(invalid());
    }

    let mut full = format!(
        "{}/api/{}/{}/{}",
        root_url.as_str().trim_end_matches('/'),
        service,
        version,
        resource
    );
    if let Some(query) = query {
        full.push('?');
        full.push_str(query);
    }
    let full_url = Url::parse(&full).map_err(|_| invalid())?;

    Ok(ResolvedEndpoint {
        service: service.to_string(),
        api_version: version.to_string(),
        resource_path: resource.to_string(),
        full_url,
    })
}

/// Service and version segments: letters, digits, `-`, `_`, `.` only.
/// Notably rejects unescaped `@` and other URL-hostile characters.
fn valid_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn root() -> Url {
        Url::parse("https://tc.example.com").unwrap()
    }

    #[test]
    fn test_resolves_service_version_resource() {
        let ep = resolve(&root(), "/queue/v1/task/abc123/define").unwrap();
        assert_eq!(ep.service, "queue");
        assert_eq!(ep.api_version, "v1");
        assert_eq!(ep.resource_path, "task/abc123/define");
        assert_eq!(
            ep.full_url.as_str(),
            "https://tc.example.com/api/queue/v1/task/abc123/define"
        );
    }

    #[test]
    fn test_api_prefix_is_stripped() {
        let ep = resolve(&root(), "/api/auth/v1/azure/fakeaccount/table/DuMmYtAbLe/read-write")
            .unwrap();
        assert_eq!(ep.service, "auth");
        assert_eq!(
            ep.full_url.as_str(),
            "https://tc.example.com/api/auth/v1/azure/fakeaccount/table/DuMmYtAbLe/read-write"
        );
    }

    #[test]
    fn test_query_string_preserved() {
        let ep = resolve(&root(), "/index/v1/tasks/ns?continuationToken=abc&limit=2").unwrap();
        assert_eq!(ep.resource_path, "tasks/ns");
        assert_eq!(
            ep.full_url.as_str(),
            "https://tc.example.com/api/index/v1/tasks/ns?continuationToken=abc&limit=2"
        );
    }

    #[test]
    fn test_percent_encoded_resource_passes_through() {
        let ep = resolve(&root(), "/queue/v1/task/abc/runs/0/artifacts/private%2Fbuild%2Flog.txt")
            .unwrap();
        assert_eq!(
            ep.full_url.as_str(),
            "https://tc.example.com/api/queue/v1/task/abc/runs/0/artifacts/private%2Fbuild%2Flog.txt"
        );
    }

    #[test]
    fn test_invalid_segment_character_rejected() {
        assert!(matches!(
            resolve(&root(), "/x@/v1/thing").unwrap_err(),
            ProxyError::InvalidEndpoint { .. }
        ));
    }

    #[test]
    fn test_missing_version_rejected() {
        assert!(resolve(&root(), "/x@/").is_err());
        assert!(resolve(&root(), "/queue").is_err());
        assert!(resolve(&root(), "/queue/").is_err());
        assert!(resolve(&root(), "/").is_err());
        assert!(resolve(&root(), "").is_err());
    }

    #[test]
    fn test_error_does_not_leak_partial_url() {
        let err = resolve(&root(), "/x@/v1/thing").unwrap_err();
        assert!(!err.to_string().contains("tc.example.com"));
    }

    #[test]
    fn test_root_url_with_trailing_slash() {
        let root = Url::parse("https://tc.example.com/").unwrap();
        let ep = resolve(&root, "/queue/v1/ping").unwrap();
        assert_eq!(ep.full_url.as_str(), "https://tc.example.com/api/queue/v1/ping");
    }

    #[test]
    fn test_resolution_ignores_credentials() {
        // Same (root, path) always resolves identically
        let a = resolve(&root(), "/queue/v1/ping").unwrap();
        let b = resolve(&root(), "/queue/v1/ping").unwrap();
        assert_eq!(a.full_url, b.full_url);
    }
}
