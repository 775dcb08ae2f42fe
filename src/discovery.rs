//! Service discovery
//!
//! Keeps the [`RouteTable`] in step with running containers. At startup the
//! shared network is ensured, the proxy's own container joins it, and every
//! running container is examined. Afterwards start and die events register
//! and unregister routes.
//!
//! A container is ours when its environment sets `VIRTUAL_HOST`:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `VIRTUAL_HOST` | comma-separated domains | required |
//! | `VIRTUAL_PORT` | backend port | 80 |
//! | `LETSENCRYPT_EMAIL` | ACME contact | none |
//! | `HTTPS_METHOD` | redirect, noredirect, nohttp, nohttps | redirect |
//! | `EZ_PROXY_PRIORITY` | route priority | 10 |
//! | `BASIC_AUTH` | `username:password` | none |
//! | `BASIC_AUTH_COOKIE` | per-route auth cookie | `__ez_proxy_service_basic_auth__` |

use crate::auth::{BasicAuth, BasicAuthCredentials, DEFAULT_ROUTE_COOKIE};
use crate::config::DiscoveryConfig;
use crate::dns::Resolver;
use crate::routes::{Route, RouteTable, TlsPolicy, DEFAULT_PRIORITY};
use crate::runtime::{ContainerAction, ContainerEvent, ContainerRuntime};
use anyhow::Context;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VIRTUAL_HOST: &str = "VIRTUAL_HOST";
pub const VIRTUAL_PORT: &str = "VIRTUAL_PORT";
pub const LETSENCRYPT_EMAIL: &str = "LETSENCRYPT_EMAIL";
pub const HTTPS_METHOD: &str = "HTTPS_METHOD";
pub const EZ_PROXY_PRIORITY: &str = "EZ_PROXY_PRIORITY";
pub const BASIC_AUTH: &str = "BASIC_AUTH";
pub const BASIC_AUTH_COOKIE: &str = "BASIC_AUTH_COOKIE";

const DEFAULT_PORT: u16 = 80;

/// Routing directives read from a container's environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub domains: Vec<String>,
    pub port: u16,
    pub acme_email: Option<String>,
    pub tls_policy: TlsPolicy,
    pub priority: i64,
    pub basic_auth: Option<BasicAuthCredentials>,
}

impl RouteSettings {
    /// `None` when the container is not relevant (no usable `VIRTUAL_HOST`).
    /// Malformed optional values fall back to their defaults.
    pub fn from_env(env: &HashMap<String, String>) -> Option<Self> {
        let domains: Vec<String> = env
            .get(VIRTUAL_HOST)?
            .split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            return None;
        }

        let value = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let port = match value(VIRTUAL_PORT) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = raw, "Invalid VIRTUAL_PORT, using default");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };

        let tls_policy = match value(HTTPS_METHOD) {
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                warn!(error = %e, "Invalid HTTPS_METHOD, using default");
                TlsPolicy::default()
            }),
            None => TlsPolicy::default(),
        };

        let priority = match value(EZ_PROXY_PRIORITY) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = raw, "Invalid EZ_PROXY_PRIORITY, using default");
                DEFAULT_PRIORITY
            }),
            None => DEFAULT_PRIORITY,
        };

        let cookie_name = value(BASIC_AUTH_COOKIE).unwrap_or(DEFAULT_ROUTE_COOKIE);
        let basic_auth = value(BASIC_AUTH).and_then(|raw| BasicAuthCredentials::parse(raw, cookie_name));

        Some(Self {
            domains,
            port,
            acme_email: value(LETSENCRYPT_EMAIL).map(String::from),
            tls_policy,
            priority,
            basic_auth,
        })
    }

    /// One route per domain, all pointing at `ip:port`
    pub fn routes(&self, container_id: &str, ip: IpAddr) -> Vec<Route> {
        let backend = SocketAddr::new(ip, self.port);
        let auth = self.basic_auth.clone().map(BasicAuth::new);
        self.domains
            .iter()
            .map(|domain| {
                Route::new(container_id, domain, backend)
                    .with_priority(self.priority)
                    .with_tls_policy(self.tls_policy)
                    .with_acme_email(self.acme_email.clone())
                    .with_auth(auth.clone())
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub network: String,
    /// File holding the proxy's own container id
    pub hostname_file: PathBuf,
    pub dns_retry_interval: Duration,
    /// `None` retries forever
    pub dns_max_attempts: Option<u32>,
    pub network_poll_interval: Duration,
    pub resubscribe_delay: Duration,
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            network: config.network.clone(),
            hostname_file: PathBuf::from(&config.hostname_file),
            dns_retry_interval: config.dns_retry_interval(),
            dns_max_attempts: config.dns_max_attempts,
            network_poll_interval: config.network_poll_interval(),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

pub struct Discovery {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<dyn Resolver>,
    routes: Arc<RouteTable>,
    options: DiscoveryOptions,
    network_ready: AtomicBool,
    /// Containers started and not yet dead
    live: DashMap<String, ()>,
    container_ips: DashMap<String, IpAddr>,
}

impl Discovery {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<dyn Resolver>,
        routes: Arc<RouteTable>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            runtime,
            resolver,
            routes,
            options,
            network_ready: AtomicBool::new(false),
            live: DashMap::new(),
            container_ips: DashMap::new(),
        }
    }

    /// Ensure the network, join it, and start registering every running
    /// container. Each registration runs as its own task, so one container
    /// whose name never resolves holds up neither the others nor startup.
    /// Fails when the runtime is unreachable or the own id cannot be read.
    pub async fn reconcile(self: &Arc<Self>) -> anyhow::Result<()> {
        let network = &self.options.network;
        self.runtime
            .ensure_network(network)
            .await
            .with_context(|| format!("failed to ensure network '{}'", network))?;

        let own_id = read_own_id(&self.options.hostname_file).await?;
        if let Err(e) = self.runtime.connect_network(network, &own_id).await {
            warn!(network = %network, container_id = %own_id, error = %e, "Failed to attach proxy to network");
        }
        self.network_ready.store(true, Ordering::Release);

        let running = self
            .runtime
            .list_running()
            .await
            .context("failed to list running containers")?;
        info!(count = running.len(), "Reconciling running containers");

        for container_id in running {
            self.spawn_registration(container_id);
        }
        Ok(())
    }

    /// Follow start/die events until shutdown, resubscribing when the stream
    /// ends or fails.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let mut events = self.runtime.events();
            info!("Subscribed to container events");

            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(event)) => self.dispatch(event),
                        Some(Err(e)) => {
                            warn!(error = %e, "Container event stream failed");
                            break;
                        }
                        None => {
                            warn!("Container event stream ended");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Discovery shutting down");
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.resubscribe_delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Discovery shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, event: ContainerEvent) {
        debug!(action = ?event.action, container_id = %event.container_id, "Container event");
        match event.action {
            ContainerAction::Start => self.spawn_registration(event.container_id),
            ContainerAction::Die => self.handle_die(&event.container_id),
        }
    }

    fn spawn_registration(self: &Arc<Self>, container_id: String) {
        // marked before spawning so a die that follows is not lost
        self.live.insert(container_id.clone(), ());
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            discovery.register_container(&container_id).await;
        });
    }

    async fn register_container(&self, container_id: &str) {
        let snapshot = match self.runtime.inspect(container_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(container_id, "Container vanished before inspection");
                return;
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to inspect container");
                return;
            }
        };

        let settings = match RouteSettings::from_env(&snapshot.env) {
            Some(settings) => settings,
            None => {
                debug!(container_id, "Container has no VIRTUAL_HOST, ignoring");
                return;
            }
        };

        self.wait_for_network().await;
        if let Err(e) = self.runtime.connect_network(&self.options.network, container_id).await {
            warn!(container_id, network = %self.options.network, error = %e, "Failed to attach container to network");
        }

        let hostname = snapshot.hostname.as_deref().unwrap_or(container_id);
        let ip = match self.resolve_ip(container_id, hostname).await {
            Some(ip) => ip,
            None => return,
        };

        // held across registration so a concurrent die waits for it
        let Some(_live) = self.live.get(container_id) else {
            debug!(container_id, "Container died while resolving, skipping registration");
            return;
        };

        self.container_ips.insert(container_id.to_string(), ip);
        self.routes.unregister(container_id);
        for route in settings.routes(container_id, ip) {
            self.routes.register(route);
        }
        info!(container_id, %ip, domains = ?settings.domains, total = self.routes.len(), "Container routes registered");
    }

    /// Drop every route owned by a container
    pub fn handle_die(&self, container_id: &str) {
        self.live.remove(container_id);
        let ip = self.container_ips.remove(container_id).map(|(_, ip)| ip);
        let removed = self.routes.unregister(container_id);
        if removed > 0 {
            info!(container_id, ip = ?ip, removed, "Container died, routes removed");
        }
        if self.routes.is_empty() {
            debug!("Routing table is empty");
        }
    }

    async fn wait_for_network(&self) {
        while !self.network_ready.load(Ordering::Acquire) {
            tokio::time::sleep(self.options.network_poll_interval).await;
        }
    }

    /// Resolve the container hostname, retrying at a fixed interval
    async fn resolve_ip(&self, container_id: &str, hostname: &str) -> Option<IpAddr> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.resolver.lookup(hostname).await {
                Ok(ip) => {
                    debug!(container_id, hostname, %ip, attempts, "Resolved container address");
                    return Some(ip);
                }
                Err(e) => {
                    if self.options.dns_max_attempts.is_some_and(|max| attempts >= max) {
                        warn!(container_id, hostname, attempts, error = %e, "Giving up resolving container address");
                        return None;
                    }
                    if attempts % 50 == 1 {
                        debug!(container_id, hostname, attempts, error = %e, "Container address not resolvable yet");
                    }
                }
            }

            if !self.live.contains_key(container_id) {
                debug!(container_id, "Container died while resolving");
                return None;
            }
            tokio::time::sleep(self.options.dns_retry_interval).await;
        }
    }
}

async fn read_own_id(path: &std::path::Path) -> anyhow::Result<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read own container id from {}", path.display()))?;
    let id = raw.trim();
    if id.is_empty() {
        error!(path = %path.display(), "Own container id file is empty");
        anyhow::bail!("own container id file {} is empty", path.display());
    }
    Ok(id.to_string())
}
