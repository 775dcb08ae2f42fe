//! Routing table
//!
//! Every relevant container publishes one [`Route`] per virtual host. Several
//! routes may share a domain; only those at the highest priority serve
//! traffic, and ties are broken by a fresh random pick on every lookup.

use crate::auth::BasicAuth;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Default route priority
pub const DEFAULT_PRIORITY: i64 = 10;

/// How a route treats plaintext and TLS traffic (`HTTPS_METHOD`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Plaintext requests are redirected to HTTPS
    #[default]
    Redirect,
    /// Both plaintext and HTTPS are served
    NoRedirect,
    /// HTTPS only: plaintext requests get a 404
    NoHttp,
    /// Plaintext only: HTTPS requests get a 404
    NoHttps,
}

impl TlsPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsPolicy::Redirect => "redirect",
            TlsPolicy::NoRedirect => "noredirect",
            TlsPolicy::NoHttp => "nohttp",
            TlsPolicy::NoHttps => "nohttps",
        }
    }
}

impl FromStr for TlsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redirect" => Ok(TlsPolicy::Redirect),
            "noredirect" => Ok(TlsPolicy::NoRedirect),
            "nohttp" => Ok(TlsPolicy::NoHttp),
            "nohttps" => Ok(TlsPolicy::NoHttps),
            other => Err(format!("unknown HTTPS method '{}'", other)),
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published route. Immutable once registered: a config change is an
/// unregister followed by a new register.
#[derive(Debug, Clone)]
pub struct Route {
    /// Owning container id
    pub container_id: String,
    /// Virtual host, lowercase
    pub domain: String,
    /// Container address on the shared network
    pub backend: SocketAddr,
    pub tls_policy: TlsPolicy,
    /// Higher wins
    pub priority: i64,
    /// ACME contact
    pub acme_email: Option<String>,
    /// Per-route gate
    pub auth: Option<BasicAuth>,
}

impl Route {
    pub fn new(container_id: impl Into<String>, domain: &str, backend: SocketAddr) -> Self {
        Self {
            container_id: container_id.into(),
            domain: domain.trim().to_ascii_lowercase(),
            backend,
            tls_policy: TlsPolicy::default(),
            priority: DEFAULT_PRIORITY,
            acme_email: None,
            auth: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tls_policy(mut self, policy: TlsPolicy) -> Self {
        self.tls_policy = policy;
        self
    }

    pub fn with_acme_email(mut self, email: Option<String>) -> Self {
        self.acme_email = email;
        self
    }

    pub fn with_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn target_url(&self) -> String {
        format!("http://{}", self.backend)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Route(id: {}, target: {}, domain: {}, https_method: {}, priority: {})",
            self.container_id,
            self.target_url(),
            self.domain,
            self.tls_policy,
            self.priority
        )
    }
}

/// In-memory, insertion-ordered route registry
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route
    pub fn register(&self, route: Route) {
        info!(route = %route, "Registered route");
        self.routes.write().push(Arc::new(route));
    }

    /// Remove every route owned by a container. Returns how many were removed.
    pub fn unregister(&self, container_id: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|route| {
            let owned = route.container_id == container_id;
            if owned {
                info!(route = %route, "Unregistered route");
            }
            !owned
        });
        let removed = before - routes.len();
        debug!(container_id, removed, remaining = routes.len(), "Unregister complete");
        removed
    }

    /// Pick a route for a host: exact domain match, maximum priority, uniform
    /// random choice among ties.
    pub fn resolve(&self, domain: &str) -> Option<Arc<Route>> {
        let domain = domain.trim().to_ascii_lowercase();
        let routes = self.routes.read();

        let matching: Vec<&Arc<Route>> = routes.iter().filter(|r| r.domain == domain).collect();
        let best = matching.iter().map(|r| r.priority).max()?;
        let candidates: Vec<&Arc<Route>> = matching
            .into_iter()
            .filter(|r| r.priority == best)
            .collect();

        candidates
            .choose(&mut rand::thread_rng())
            .map(|route| Arc::clone(route))
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
