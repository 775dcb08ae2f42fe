use ezproxy::auth::{BasicAuthCredentials, SharedBasicAuth};
use ezproxy::certs::CertificateStore;
use ezproxy::config::Config;
use ezproxy::discovery::{Discovery, DiscoveryOptions};
use ezproxy::dns::SystemResolver;
use ezproxy::docker::DockerRuntime;
use ezproxy::pool::{ConnectionPool, PoolConfig};
use ezproxy::proxy::{ProxyContext, ProxyServer, Scheme};
use ezproxy::routes::RouteTable;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ezproxy=info")),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ezproxy.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let certs_dir = config.certificates_dir();
    std::fs::create_dir_all(&certs_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create certificates directory '{}': {}", certs_dir.display(), e)
    })?;
    let certs = Arc::new(CertificateStore::from_config(&certs_dir, &config.certificates)?);
    info!(dir = %certs_dir.display(), "Certificate store ready");

    let global_auth = match (&config.auth.username, &config.auth.password) {
        (Some(username), Some(password)) if config.auth.enabled() => {
            let credentials = BasicAuthCredentials {
                username: username.clone(),
                password: password.clone(),
                cookie_name: config.auth.cookie_name.clone(),
            };
            info!(username = %username, cookie = %config.auth.cookie_name, "Global basic auth enabled");
            Some(SharedBasicAuth::new(credentials))
        }
        _ => None,
    };

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let routes = Arc::new(RouteTable::new());
    let ctx = Arc::new(ProxyContext {
        routes: Arc::clone(&routes),
        certs: Arc::clone(&certs),
        global_auth,
        pool: Arc::new(ConnectionPool::new(pool_config)),
        https_port: config.server.https_port,
    });

    let runtime = DockerRuntime::connect(config.discovery.docker_host.as_deref()).await?;
    let discovery = Arc::new(Discovery::new(
        Arc::new(runtime),
        Arc::new(SystemResolver),
        Arc::clone(&routes),
        DiscoveryOptions::from(&config.discovery),
    ));

    let http_addr = bind_addr(&config.server.bind, config.server.http_port)?;
    let https_addr = bind_addr(&config.server.bind, config.server.https_port)?;

    // bind before reconciling so startup fails fast on busy ports
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let https_listener = tokio::net::TcpListener::bind(https_addr).await?;

    discovery.reconcile().await?;

    let http_server = ProxyServer::new(Scheme::Http, Arc::clone(&ctx), shutdown_rx.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.serve(http_listener).await {
            error!(error = %e, "HTTP proxy server error");
        }
    });

    let https_server = ProxyServer::new(Scheme::Https, Arc::clone(&ctx), shutdown_rx.clone());
    let https_handle = tokio::spawn(async move {
        if let Err(e) = https_server.serve(https_listener).await {
            error!(error = %e, "HTTPS proxy server error");
        }
    });

    let discovery_handle = tokio::spawn(Arc::clone(&discovery).run(shutdown_rx.clone()));
    let sweeper_handle = tokio::spawn(
        Arc::clone(&certs).run_cache_sweeper(config.certificates.cache_refresh_interval(), shutdown_rx.clone()),
    );

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        let _ = https_handle.await;
        let _ = discovery_handle.await;
        let _ = sweeper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}:{}': {}", bind, port, e)
    })
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
