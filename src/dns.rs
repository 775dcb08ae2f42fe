//! Name resolution seams
//!
//! Container IPs and the local-vs-public certificate decision both depend on
//! DNS. They go through the [`Resolver`] trait so tests can substitute a
//! fixed table.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Resolves a hostname to a single address.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the system's `getaddrinfo`. IPv4 answers are preferred.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<IpAddr> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
            })
    }
}

/// Source of the host's own public IPv4 address.
#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn public_ipv4(&self) -> anyhow::Result<Ipv4Addr>;
}

/// Asks an external "what is my IP" endpoint and remembers the answer for
/// `ttl`. Failed lookups are not remembered.
pub struct HttpPublicIp {
    client: reqwest::Client,
    url: String,
    ttl: Duration,
    cached: Mutex<Option<(Ipv4Addr, Instant)>>,
}

impl HttpPublicIp {
    pub fn new(url: impl Into<String>, ttl: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            ttl,
            cached: Mutex::new(None),
        })
    }

    fn fresh(&self) -> Option<Ipv4Addr> {
        match *self.cached.lock() {
            Some((ip, fetched_at)) if fetched_at.elapsed() < self.ttl => Some(ip),
            _ => None,
        }
    }

    async fn fetch(&self) -> anyhow::Result<Ipv4Addr> {
        debug!(url = %self.url, "Looking up public IP");
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse::<Ipv4Addr>()
            .map_err(|e| anyhow::anyhow!("Unexpected public IP response '{}': {}", body.trim(), e))
    }
}

#[async_trait]
impl PublicIpSource for HttpPublicIp {
    async fn public_ipv4(&self) -> anyhow::Result<Ipv4Addr> {
        if let Some(ip) = self.fresh() {
            return Ok(ip);
        }

        let ip = self.fetch().await?;
        let previous = self.cached.lock().replace((ip, Instant::now())).map(|(ip, _)| ip);
        match previous {
            Some(previous) if previous != ip => info!(%previous, %ip, "Public IP changed"),
            Some(_) => {}
            None => info!(%ip, "Public IP discovered"),
        }
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Endpoint answering `203.0.113.<n>` where n counts requests from 1
    async fn spawn_ip_endpoint() -> (String, Arc<AtomicU8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicU8::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!("203.0.113.{}\n", n);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (url, hits)
    }

    fn public_ip(url: String, ttl: Duration) -> HttpPublicIp {
        HttpPublicIp {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            url,
            ttl,
            cached: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn test_public_ip_cached_within_ttl() {
        let (url, hits) = spawn_ip_endpoint().await;
        let source = public_ip(url, Duration::from_secs(300));

        assert_eq!(source.public_ipv4().await.unwrap(), Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(source.public_ipv4().await.unwrap(), Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_public_ip_refreshed_after_ttl() {
        let (url, hits) = spawn_ip_endpoint().await;
        let source = public_ip(url, Duration::from_millis(20));

        assert_eq!(source.public_ipv4().await.unwrap(), Ipv4Addr::new(203, 0, 113, 1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(source.public_ipv4().await.unwrap(), Ipv4Addr::new(203, 0, 113, 2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_public_ip_lookup_not_cached() {
        let source = public_ip("http://127.0.0.1:1/".to_string(), Duration::from_secs(300));
        assert!(source.public_ipv4().await.is_err());
        assert!(source.cached.lock().is_none());
    }

    #[tokio::test]
    async fn test_system_resolver_literal() {
        let ip = SystemResolver.lookup("127.0.0.1").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_system_resolver_unknown_host() {
        assert!(SystemResolver
            .lookup("definitely-not-a-real-host.invalid")
            .await
            .is_err());
    }
}
