use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Certificate store configuration
    #[serde(default)]
    pub certificates: CertificatesConfig,

    /// Container discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Domain-wide shared basic auth
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plaintext HTTP port (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificatesConfig {
    /// Root of the per-domain certificate directories
    #[serde(default = "default_certificates_dir")]
    pub dir: String,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub acme_directory_url: Option<String>,

    /// Certificates expiring sooner than this are regenerated (default: 7)
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// Interval at which the in-memory certificate cache is dropped (default: 300)
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,

    /// Endpoint returning the host's public IPv4 as plain text
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,

    /// Path to an `mkcert` binary used for local certificates (optional)
    pub mkcert_path: Option<String>,

    /// CAROOT handed to `mkcert`
    pub caroot: Option<String>,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            dir: default_certificates_dir(),
            acme_directory_url: None,
            renew_before_days: default_renew_before_days(),
            cache_refresh_secs: default_cache_refresh_secs(),
            public_ip_url: default_public_ip_url(),
            mkcert_path: None,
            caroot: None,
        }
    }
}

impl CertificatesConfig {
    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Name of the shared network backends are attached to
    #[serde(default = "default_network_name")]
    pub network: String,

    /// File holding this proxy's own container id
    #[serde(default = "default_hostname_file")]
    pub hostname_file: String,

    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,

    /// Delay between failed container DNS lookups in milliseconds (default: 100)
    #[serde(default = "default_dns_retry_interval")]
    pub dns_retry_interval_ms: u64,

    /// Give up resolving a container after this many attempts (default: never)
    pub dns_max_attempts: Option<u32>,

    /// Poll interval while waiting for the shared network in milliseconds (default: 10)
    #[serde(default = "default_network_poll_interval")]
    pub network_poll_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: default_network_name(),
            hostname_file: default_hostname_file(),
            docker_host: None,
            dns_retry_interval_ms: default_dns_retry_interval(),
            dns_max_attempts: None,
            network_poll_interval_ms: default_network_poll_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn dns_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dns_retry_interval_ms)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_millis(self.network_poll_interval_ms)
    }
}

/// Shared basic auth covering every non-local domain
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_auth_cookie")]
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            cookie_name: default_auth_cookie(),
        }
    }
}

impl AuthConfig {
    /// Enabled only when both username and password are set
    pub fn enabled(&self) -> bool {
        matches!(
            (self.username.as_deref(), self.password.as_deref()),
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty()
        )
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_certificates_dir() -> String {
    "./.certificates".to_string()
}

fn default_renew_before_days() -> u64 {
    7
}

fn default_cache_refresh_secs() -> u64 {
    5 * 60
}

fn default_public_ip_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_network_name() -> String {
    "MY_PROXY_NETWORK".to_string()
}

fn default_hostname_file() -> String {
    "/etc/hostname".to_string()
}

fn default_dns_retry_interval() -> u64 {
    100
}

fn default_network_poll_interval() -> u64 {
    10
}

pub fn default_auth_cookie() -> String {
    "__EZ_PROXY_AUTH_TOKEN__".to_string()
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `EZ_PROXY_*` overrides. Takes a lookup function so tests need not
    /// touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EZ_PROXY_AUTH_USERNAME") {
            self.auth.username = Some(v);
        }
        if let Some(v) = lookup("EZ_PROXY_AUTH_PASSWORD") {
            self.auth.password = Some(v);
        }
        if let Some(v) = lookup("EZ_PROXY_AUTH_COOKIE").filter(|v| !v.is_empty()) {
            self.auth.cookie_name = v;
        }
        if let Some(v) = lookup("EZ_PROXY_CERTIFICATES_DIR").filter(|v| !v.is_empty()) {
            self.certificates.dir = v;
        }
        if let Some(v) = lookup("EZ_PROXY_ACME_DIRECTORY").filter(|v| !v.is_empty()) {
            self.certificates.acme_directory_url = Some(v);
        }
        if let Some(v) = lookup("EZ_PROXY_NETWORK").filter(|v| !v.is_empty()) {
            self.discovery.network = v;
        }
        if let Some(v) = lookup("DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.discovery.docker_host.get_or_insert(v);
        }
    }

    pub fn certificates_dir(&self) -> PathBuf {
        PathBuf::from(&self.certificates.dir)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }
        if self.server.https_port == 0 {
            errors.push("server.https_port must be greater than 0".to_string());
        }
        if self.server.http_port == self.server.https_port {
            errors.push("server.http_port and server.https_port must differ".to_string());
        }
        if self.certificates.cache_refresh_secs == 0 {
            errors.push("certificates.cache_refresh_secs must be greater than 0".to_string());
        }
        if self.discovery.dns_retry_interval_ms == 0 {
            errors.push("discovery.dns_retry_interval_ms must be greater than 0".to_string());
        }
        if self.discovery.network_poll_interval_ms == 0 {
            errors.push("discovery.network_poll_interval_ms must be greater than 0".to_string());
        }
        if self.discovery.dns_max_attempts == Some(0) {
            errors.push("discovery.dns_max_attempts must be greater than 0 when set".to_string());
        }
        if self.discovery.network.is_empty() {
            errors.push("discovery.network must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}
