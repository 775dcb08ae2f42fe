//! Cookie-backed basic auth gates
//!
//! A gate answers two questions: does this request already carry the auth
//! cookie ([`AuthGate::is_authorized`]), and if not, do its Basic credentials
//! let it through ([`AuthGate::challenge`]).
//!
//! [`BasicAuth`] protects a single route. [`SharedBasicAuth`] wraps it and, on
//! success, scopes the cookie to the parent domain so every sibling subdomain
//! is authorized at once.

use crate::domain;
use crate::error::{full_body, ProxyBody};
use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Default cookie name for per-route auth
pub const DEFAULT_ROUTE_COOKIE: &str = "__ez_proxy_service_basic_auth__";

const REALM: &str = "Basic realm=\"ezproxy\"";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthCredentials {
    pub username: String,
    pub password: String,
    pub cookie_name: String,
}

impl BasicAuthCredentials {
    /// Parse a `username:password` pair, splitting on the first colon.
    /// Returns `None` when either half is empty or the colon is missing.
    pub fn parse(value: &str, cookie_name: impl Into<String>) -> Option<Self> {
        let (username, password) = value.split_once(':')?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
            cookie_name: cookie_name.into(),
        })
    }
}

/// Outcome of [`AuthGate::challenge`]
pub enum AuthDecision {
    /// Let the request through, optionally attaching a `Set-Cookie` value to
    /// whatever response it ends up with.
    Continue { set_cookie: Option<HeaderValue> },
    /// Stop and send this response.
    Respond(Response<ProxyBody>),
}

impl std::fmt::Debug for AuthDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthDecision::Continue { set_cookie } => f
                .debug_struct("Continue")
                .field("set_cookie", set_cookie)
                .finish(),
            AuthDecision::Respond(res) => f.debug_tuple("Respond").field(&res.status()).finish(),
        }
    }
}

pub trait AuthGate: Send + Sync {
    /// True if the request carries this gate's cookie with the expected token.
    fn is_authorized(&self, headers: &HeaderMap) -> bool;

    /// Check Basic credentials on a request that is not yet authorized.
    fn challenge(&self, host: &str, headers: &HeaderMap) -> AuthDecision;
}

/// Per-route gate. Never sets a cookie itself.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    credentials: BasicAuthCredentials,
    token: String,
}

impl BasicAuth {
    pub fn new(credentials: BasicAuthCredentials) -> Self {
        let token = auth_token(&credentials.username, &credentials.password);
        Self { credentials, token }
    }

    pub fn cookie_name(&self) -> &str {
        &self.credentials.cookie_name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn credentials_match(&self, headers: &HeaderMap) -> bool {
        match extract_basic_credentials(headers) {
            Some((username, password)) => {
                username == self.credentials.username && password == self.credentials.password
            }
            None => false,
        }
    }

    fn check(&self, headers: &HeaderMap) -> Result<(), Response<ProxyBody>> {
        if self.credentials_match(headers) {
            debug!(cookie = %self.credentials.cookie_name, "Basic credentials accepted");
            Ok(())
        } else {
            Err(unauthorized_response())
        }
    }
}

impl AuthGate for BasicAuth {
    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        extract_cookie(headers, &self.credentials.cookie_name)
            .map(|value| value == self.token)
            .unwrap_or(false)
    }

    fn challenge(&self, _host: &str, headers: &HeaderMap) -> AuthDecision {
        match self.check(headers) {
            Ok(()) => AuthDecision::Continue { set_cookie: None },
            Err(response) => AuthDecision::Respond(response),
        }
    }
}

/// Domain-wide gate: same check as [`BasicAuth`], but a successful challenge
/// hands out a cookie for `.<domain>.<tld>`.
#[derive(Debug, Clone)]
pub struct SharedBasicAuth {
    inner: BasicAuth,
}

impl SharedBasicAuth {
    pub fn new(credentials: BasicAuthCredentials) -> Self {
        Self {
            inner: BasicAuth::new(credentials),
        }
    }

    /// Build the `Set-Cookie` value for a host. Hosts without a registrable
    /// domain (IP literals, bare names) get a host-only cookie.
    pub fn cookie_for_host(&self, host: &str) -> String {
        let mut cookie = format!("{}={}; Path=/", self.inner.cookie_name(), self.inner.token());
        match domain::cookie_domain(host) {
            Ok(scope) => {
                cookie.push_str("; Domain=");
                cookie.push_str(&scope);
            }
            Err(e) => debug!(host, error = %e, "Cannot scope auth cookie, using host-only cookie"),
        }
        cookie
    }
}

impl AuthGate for SharedBasicAuth {
    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        self.inner.is_authorized(headers)
    }

    fn challenge(&self, host: &str, headers: &HeaderMap) -> AuthDecision {
        if let Err(response) = self.inner.check(headers) {
            return AuthDecision::Respond(response);
        }
        let set_cookie = HeaderValue::from_str(&self.cookie_for_host(host)).ok();
        AuthDecision::Continue { set_cookie }
    }
}

/// Hex SHA-256 of `username:password`
pub fn auth_token(username: &str, password: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", username, password).as_bytes());
    hex::encode(digest)
}

/// Find a cookie by name across all `Cookie` headers
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

/// Decode `Authorization: Basic <base64(user:pass)>`
pub fn extract_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn unauthorized_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, REALM)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Unauthorized"))
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(cookie: &str) -> BasicAuthCredentials {
        BasicAuthCredentials::parse("admin:s3cret", cookie).unwrap()
    }

    fn basic_header(user: &str, pass: &str) -> HeaderValue {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap()
    }

    #[test]
    fn test_parse_credentials() {
        let creds = BasicAuthCredentials::parse("user:pa:ss", DEFAULT_ROUTE_COOKIE).unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "pa:ss");
        assert_eq!(creds.cookie_name, DEFAULT_ROUTE_COOKIE);

        assert!(BasicAuthCredentials::parse("user", "c").is_none());
        assert!(BasicAuthCredentials::parse(":pass", "c").is_none());
        assert!(BasicAuthCredentials::parse("user:", "c").is_none());
        assert!(BasicAuthCredentials::parse("", "c").is_none());
    }

    #[test]
    fn test_token_is_deterministic() {
        assert_eq!(auth_token("a", "b"), auth_token("a", "b"));
        assert_ne!(auth_token("a", "b"), auth_token("a", "c"));
        assert_eq!(auth_token("a", "b").len(), 64);
    }

    #[test]
    fn test_extract_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("other=1; session=abc123"));
        assert_eq!(extract_cookie(&headers, "session"), Some("abc123".to_string()));
        assert_eq!(extract_cookie(&headers, "missing"), None);

        headers.append(COOKIE, HeaderValue::from_static("late=xyz"));
        assert_eq!(extract_cookie(&headers, "late"), Some("xyz".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session="));
        assert_eq!(extract_cookie(&headers, "session"), None);
    }

    #[test]
    fn test_extract_basic_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, basic_header("admin", "s3cret"));
        assert_eq!(
            extract_basic_credentials(&headers),
            Some(("admin".to_string(), "s3cret".to_string()))
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_basic_credentials(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(extract_basic_credentials(&headers), None);
    }

    #[test]
    fn test_is_authorized_by_cookie() {
        let gate = BasicAuth::new(credentials("route_cookie"));
        let mut headers = HeaderMap::new();
        assert!(!gate.is_authorized(&headers));

        let cookie = format!("route_cookie={}", gate.token());
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        assert!(gate.is_authorized(&headers));

        headers.insert(COOKIE, HeaderValue::from_static("route_cookie=forged"));
        assert!(!gate.is_authorized(&headers));
    }

    #[test]
    fn test_route_challenge() {
        let gate = BasicAuth::new(credentials(DEFAULT_ROUTE_COOKIE));

        let headers = HeaderMap::new();
        match gate.challenge("a.test", &headers) {
            AuthDecision::Respond(res) => {
                assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
                assert!(res.headers().contains_key(WWW_AUTHENTICATE));
            }
            other => panic!("expected 401, got {:?}", other),
        }

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, basic_header("admin", "wrong"));
        assert!(matches!(gate.challenge("a.test", &headers), AuthDecision::Respond(_)));

        headers.insert(AUTHORIZATION, basic_header("admin", "s3cret"));
        match gate.challenge("a.test", &headers) {
            AuthDecision::Continue { set_cookie } => assert!(set_cookie.is_none()),
            other => panic!("expected continue, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_challenge_sets_parent_domain_cookie() {
        let gate = SharedBasicAuth::new(credentials("__EZ_PROXY_AUTH_TOKEN__"));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, basic_header("admin", "s3cret"));

        match gate.challenge("app.a.test", &headers) {
            AuthDecision::Continue { set_cookie: Some(cookie) } => {
                let cookie = cookie.to_str().unwrap();
                assert!(cookie.starts_with("__EZ_PROXY_AUTH_TOKEN__="));
                assert!(cookie.contains(&auth_token("admin", "s3cret")));
                assert!(cookie.contains("Domain=.a.test"));
            }
            other => panic!("expected cookie, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_cookie_for_ip_host_is_host_only() {
        let gate = SharedBasicAuth::new(credentials("c"));
        let cookie = gate.cookie_for_host("192.168.1.10:8080");
        assert!(!cookie.contains("Domain="));
        assert!(cookie.starts_with("c="));
    }

    #[test]
    fn test_shared_cookie_authorizes_sibling() {
        let gate = SharedBasicAuth::new(credentials("c"));
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&format!("c={}", auth_token("admin", "s3cret"))).unwrap());
        assert!(gate.is_authorized(&headers));
    }
}
