//! Certificate store
//!
//! Produces a ready-to-serve [`CertifiedKey`] for any routed domain. Records
//! live on disk under `<root>/<domain>/{privkey.pem,cert.pem,chain.pem}` and
//! are mirrored in an in-memory cache that is cleared wholesale on a fixed
//! interval, so certificates replaced on disk are picked up without a
//! restart.
//!
//! Domains are classified before issuance: local names and names that do not
//! resolve to this host's public address get a locally generated certificate,
//! everything else goes through ACME.

use crate::acme::{write_private, AcmeIssuer, CertificateIssuer, Http01Challenges};
use crate::config::CertificatesConfig;
use crate::dns::{HttpPublicIp, PublicIpSource, Resolver, SystemResolver};
use crate::domain::is_local_domain;
use crate::local_tls::LocalIssuer;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Path prefix of HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const KEY_FILE: &str = "privkey.pem";
const CERT_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("invalid certificate domain '{0}'")]
    InvalidDomain(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificate data: {0}")]
    Parse(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("ACME issuance failed: {0}")]
    Acme(String),

    #[error("issued certificate for '{domain}' expires too soon")]
    ExpiresTooSoon { domain: String },
}

impl CertError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        CertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// PEM material returned by an issuer
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub chain_pem: Option<String>,
}

/// A parsed certificate, ready to serve. Expiry is read from the leaf.
pub struct CertRecord {
    certified_key: Arc<CertifiedKey>,
    not_after: i64,
}

impl CertRecord {
    pub fn from_pem(key_pem: &[u8], cert_pem: &[u8], chain_pem: Option<&[u8]>) -> Result<Self, CertError> {
        let mut certs = parse_certs(cert_pem)?;
        let leaf = certs
            .first()
            .ok_or_else(|| CertError::Parse("no certificate found".to_string()))?;
        let not_after = expiry_timestamp(leaf)?;

        if let Some(chain) = chain_pem {
            certs.extend(parse_certs(chain)?);
        }

        let key = load_private_key(key_pem)
            .ok_or_else(|| CertError::Parse("no private key found".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertError::Parse(format!("unsupported private key: {}", e)))?;

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
            not_after,
        })
    }

    pub fn from_issued(issued: &IssuedCertificate) -> Result<Self, CertError> {
        Self::from_pem(
            issued.key_pem.as_bytes(),
            issued.cert_pem.as_bytes(),
            issued.chain_pem.as_deref().map(str::as_bytes),
        )
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Expiry as a Unix timestamp
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Whether the certificate stays valid for at least `min`
    pub fn is_valid_for(&self, min: Duration) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.not_after - now >= min.as_secs() as i64
    }
}

impl fmt::Debug for CertRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertRecord")
            .field("chain_len", &self.certified_key.cert.len())
            .field("not_after", &self.not_after)
            .finish()
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse(e.to_string()))
}

fn expiry_timestamp(cert: &CertificateDer<'_>) -> Result<i64, CertError> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| CertError::Parse(format!("X.509: {}", e)))?;
    Ok(parsed.validity().not_after.timestamp())
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Per-domain certificate directories under one root
#[derive(Debug, Clone)]
pub struct CertDir {
    root: PathBuf,
}

impl CertDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn domain_dir(&self, domain: &str) -> Result<PathBuf, CertError> {
        let valid = !domain.is_empty()
            && !domain.starts_with('.')
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '*');
        if !valid {
            return Err(CertError::InvalidDomain(domain.to_string()));
        }
        Ok(self.root.join(domain))
    }

    /// Read a domain's record. `Ok(None)` when the key or certificate file is missing.
    pub async fn load(&self, domain: &str) -> Result<Option<CertRecord>, CertError> {
        let dir = self.domain_dir(domain)?;
        let key_path = dir.join(KEY_FILE);
        let cert_path = dir.join(CERT_FILE);

        let key = match read_optional(&key_path).await? {
            Some(key) => key,
            None => return Ok(None),
        };
        let cert = match read_optional(&cert_path).await? {
            Some(cert) => cert,
            None => return Ok(None),
        };
        let chain = read_optional(&dir.join(CHAIN_FILE)).await?;

        CertRecord::from_pem(&key, &cert, chain.as_deref()).map(Some)
    }

    pub async fn save(&self, domain: &str, issued: &IssuedCertificate) -> Result<(), CertError> {
        let dir = self.domain_dir(domain)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CertError::io(&dir, e))?;

        let key_path = dir.join(KEY_FILE);
        write_private(&key_path, issued.key_pem.as_bytes())
            .await
            .map_err(|e| CertError::io(&key_path, e))?;

        let cert_path = dir.join(CERT_FILE);
        tokio::fs::write(&cert_path, &issued.cert_pem)
            .await
            .map_err(|e| CertError::io(&cert_path, e))?;

        let chain_path = dir.join(CHAIN_FILE);
        match &issued.chain_pem {
            Some(chain) => tokio::fs::write(&chain_path, chain)
                .await
                .map_err(|e| CertError::io(&chain_path, e))?,
            None => match tokio::fs::remove_file(&chain_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertError::io(&chain_path, e)),
            },
        }

        debug!(domain, path = %dir.display(), "Certificate saved to disk");
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CertError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CertError::io(path, e)),
    }
}

/// Decides whether a domain gets a local certificate or an ACME one
pub struct DomainClassifier {
    resolver: Arc<dyn Resolver>,
    public_ip: Arc<dyn PublicIpSource>,
}

impl DomainClassifier {
    pub fn new(resolver: Arc<dyn Resolver>, public_ip: Arc<dyn PublicIpSource>) -> Self {
        Self { resolver, public_ip }
    }

    /// Local when the name has a local suffix or does not resolve to this
    /// host's public IPv4. An unknown public IP counts as public.
    pub async fn is_local(&self, domain: &str) -> bool {
        if is_local_domain(domain) {
            return true;
        }

        let resolved = match self.resolver.lookup(domain).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(domain, error = %e, "Domain does not resolve, treating as local");
                return true;
            }
        };

        match self.public_ip.public_ipv4().await {
            Ok(public) => resolved != std::net::IpAddr::V4(public),
            Err(e) => {
                warn!(domain, error = %e, "Public IP unknown, treating domain as public");
                false
            }
        }
    }
}

/// Certificate cache, issuance and HTTP-01 challenge responses
pub struct CertificateStore {
    dir: CertDir,
    cache: RwLock<HashMap<String, Arc<CertRecord>>>,
    issuing: DashMap<String, Arc<Mutex<()>>>,
    challenges: Http01Challenges,
    classifier: DomainClassifier,
    local_issuer: Arc<dyn CertificateIssuer>,
    acme_issuer: Arc<dyn CertificateIssuer>,
    renew_before: Duration,
}

impl CertificateStore {
    pub fn new(
        dir: CertDir,
        challenges: Http01Challenges,
        classifier: DomainClassifier,
        local_issuer: Arc<dyn CertificateIssuer>,
        acme_issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        Self {
            dir,
            cache: RwLock::new(HashMap::new()),
            issuing: DashMap::new(),
            challenges,
            classifier,
            local_issuer,
            acme_issuer,
            renew_before: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Build the production store: system DNS, HTTP public IP lookup,
    /// ACME accounts under `<root>/.acme`.
    pub fn from_config(root: impl Into<PathBuf>, config: &CertificatesConfig) -> anyhow::Result<Self> {
        let root = root.into();
        let challenges = Http01Challenges::new();

        let classifier = DomainClassifier::new(
            Arc::new(SystemResolver),
            Arc::new(HttpPublicIp::new(
                config.public_ip_url.clone(),
                config.cache_refresh_interval(),
            )?),
        );
        let local = LocalIssuer::new(root.join(".staging")).with_mkcert(
            config.mkcert_path.as_ref().map(PathBuf::from),
            config.caroot.as_ref().map(PathBuf::from),
        );
        let acme = AcmeIssuer::new(
            config.acme_directory_url.clone(),
            root.join(".acme"),
            challenges.clone(),
        );

        Ok(Self::new(
            CertDir::new(root),
            challenges,
            classifier,
            Arc::new(local),
            Arc::new(acme),
        )
        .with_renew_before(Duration::from_secs(config.renew_before_days * 24 * 60 * 60)))
    }

    pub fn challenges(&self) -> &Http01Challenges {
        &self.challenges
    }

    /// Key authorization for an `/.well-known/acme-challenge/<token>` path
    pub async fn acme_response(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        self.challenges.get(token).await
    }

    /// A certificate for `domain` valid for at least the renewal window,
    /// issuing and persisting a new one when needed.
    pub async fn get_secure_context(
        &self,
        domain: &str,
        acme_email: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertError> {
        let domain = domain.to_ascii_lowercase();

        if let Some(record) = self.usable_record(&domain).await {
            return Ok(record.certified_key());
        }

        let lock = self
            .issuing
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.issue_locked(&domain, acme_email).await
        };

        // the map holds the last reference once no handshake is waiting
        drop(lock);
        self.issuing.remove_if(&domain, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Issue and persist a certificate. Caller holds the domain's issuance lock.
    async fn issue_locked(&self, domain: &str, acme_email: Option<&str>) -> Result<Arc<CertifiedKey>, CertError> {
        // another handshake may have finished issuing while we waited
        if let Some(record) = self.usable_record(domain).await {
            return Ok(record.certified_key());
        }

        let local = self.classifier.is_local(domain).await;
        info!(domain, local, "Issuing certificate");
        let issued = if local {
            self.local_issuer.issue(domain, acme_email).await?
        } else {
            self.acme_issuer.issue(domain, acme_email).await?
        };

        let record = CertRecord::from_issued(&issued)?;
        if !record.is_valid_for(self.renew_before) {
            return Err(CertError::ExpiresTooSoon {
                domain: domain.to_string(),
            });
        }

        self.dir.save(domain, &issued).await?;
        let record = Arc::new(record);
        self.cache.write().insert(domain.to_string(), Arc::clone(&record));
        info!(domain, not_after = record.not_after(), "Certificate ready");

        Ok(record.certified_key())
    }

    async fn usable_record(&self, domain: &str) -> Option<Arc<CertRecord>> {
        let record = self.lookup(domain).await?;
        if record.is_valid_for(self.renew_before) {
            Some(record)
        } else {
            info!(domain, not_after = record.not_after(), "Certificate expires soon, renewal needed");
            None
        }
    }

    /// Cached record, falling back to disk
    async fn lookup(&self, domain: &str) -> Option<Arc<CertRecord>> {
        if let Some(record) = self.cache.read().get(domain) {
            return Some(Arc::clone(record));
        }

        match self.dir.load(domain).await {
            Ok(Some(record)) => {
                debug!(domain, "Loaded certificate from disk");
                let record = Arc::new(record);
                self.cache
                    .write()
                    .insert(domain.to_string(), Arc::clone(&record));
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(domain, error = %e, "Failed to load certificate from disk");
                None
            }
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.write();
        let cleared = cache.len();
        cache.clear();
        debug!(cleared, "Certificate cache cleared");
    }

    /// Clear the cache every `interval` until shutdown
    pub async fn run_cache_sweeper(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.clear_cache(),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Certificate cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tls::self_signed;
    use async_trait::async_trait;
    use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedResolver(Option<IpAddr>);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn lookup(&self, host: &str) -> io::Result<IpAddr> {
            self.0
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    struct FixedPublicIp(Option<Ipv4Addr>);

    #[async_trait]
    impl PublicIpSource for FixedPublicIp {
        async fn public_ipv4(&self) -> anyhow::Result<Ipv4Addr> {
            self.0.ok_or_else(|| anyhow::anyhow!("offline"))
        }
    }

    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue(&self, domain: &str, _contact: Option<&str>) -> Result<IssuedCertificate, CertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self_signed(domain)
        }
    }

    struct FailingIssuer;

    #[async_trait]
    impl CertificateIssuer for FailingIssuer {
        async fn issue(&self, _domain: &str, _contact: Option<&str>) -> Result<IssuedCertificate, CertError> {
            Err(CertError::Acme("rate limited".to_string()))
        }
    }

    const PUBLIC: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

    fn classifier(resolved: Option<IpAddr>, public: Option<Ipv4Addr>) -> DomainClassifier {
        DomainClassifier::new(Arc::new(FixedResolver(resolved)), Arc::new(FixedPublicIp(public)))
    }

    struct Harness {
        store: CertificateStore,
        local: Arc<CountingIssuer>,
        acme: Arc<CountingIssuer>,
        dir: tempfile::TempDir,
    }

    fn harness(resolved: Option<IpAddr>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(CountingIssuer::default());
        let acme = Arc::new(CountingIssuer::default());
        let store = CertificateStore::new(
            CertDir::new(dir.path()),
            Http01Challenges::new(),
            classifier(resolved, Some(PUBLIC)),
            local.clone(),
            acme.clone(),
        );
        Harness { store, local, acme, dir }
    }

    fn certificate_expiring(domain: &str, year: i32, month: u8, day: u8) -> IssuedCertificate {
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, month, day);
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            chain_pem: None,
        }
    }

    #[test]
    fn test_record_expiry() {
        let expired = CertRecord::from_issued(&certificate_expiring("old.test", 2001, 1, 1)).unwrap();
        assert!(!expired.is_valid_for(Duration::ZERO));

        let fresh = CertRecord::from_issued(&self_signed("new.test").unwrap()).unwrap();
        assert!(fresh.is_valid_for(Duration::from_secs(7 * 24 * 3600)));
    }

    #[test]
    fn test_record_rejects_garbage() {
        assert!(CertRecord::from_pem(b"nope", b"nope", None).is_err());

        let issued = self_signed("a.test").unwrap();
        assert!(CertRecord::from_pem(b"", issued.cert_pem.as_bytes(), None).is_err());
    }

    #[test]
    fn test_record_appends_chain() {
        let leaf = self_signed("a.test").unwrap();
        let ca = self_signed("ca.test").unwrap();
        let record = CertRecord::from_pem(
            leaf.key_pem.as_bytes(),
            leaf.cert_pem.as_bytes(),
            Some(ca.cert_pem.as_bytes()),
        )
        .unwrap();
        assert_eq!(record.certified_key().cert.len(), 2);
    }

    #[test]
    fn test_domain_dir_rejects_traversal() {
        let dir = CertDir::new("/certs");
        assert_eq!(dir.domain_dir("a.test").unwrap(), PathBuf::from("/certs/a.test"));
        assert!(dir.domain_dir("../etc").is_err());
        assert!(dir.domain_dir("a/b").is_err());
        assert!(dir.domain_dir("").is_err());
    }

    #[tokio::test]
    async fn test_cert_dir_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = CertDir::new(tmp.path());

        assert!(dir.load("a.test").await.unwrap().is_none());

        dir.save("a.test", &self_signed("a.test").unwrap()).await.unwrap();
        assert!(tmp.path().join("a.test/privkey.pem").exists());
        assert!(tmp.path().join("a.test/cert.pem").exists());
        assert!(!tmp.path().join("a.test/chain.pem").exists());
        assert!(dir.load("a.test").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_classifier() {
        let public = IpAddr::V4(PUBLIC);
        let private = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));

        assert!(classifier(Some(public), Some(PUBLIC)).is_local("app.loc").await);
        assert!(classifier(Some(public), Some(PUBLIC)).is_local("app.local").await);
        assert!(!classifier(Some(public), Some(PUBLIC)).is_local("app.example.com").await);
        assert!(classifier(Some(private), Some(PUBLIC)).is_local("app.example.com").await);
        assert!(classifier(None, Some(PUBLIC)).is_local("app.example.com").await);
        assert!(!classifier(Some(private), None).is_local("app.example.com").await);
    }

    #[tokio::test]
    async fn test_local_domain_uses_local_issuer() {
        let h = harness(Some(IpAddr::V4(PUBLIC)));

        h.store.get_secure_context("dev.loc", None).await.unwrap();
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.acme.calls.load(Ordering::SeqCst), 0);
        assert!(h.dir.path().join("dev.loc/cert.pem").exists());
    }

    #[tokio::test]
    async fn test_public_domain_uses_acme_issuer() {
        let h = harness(Some(IpAddr::V4(PUBLIC)));

        h.store.get_secure_context("www.example.com", Some("ops@example.com")).await.unwrap();
        assert_eq!(h.acme.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_certificate_is_reused() {
        let h = harness(None);

        h.store.get_secure_context("a.test", None).await.unwrap();
        h.store.get_secure_context("A.test", None).await.unwrap();
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.cache.read().len(), 1);

        h.store.clear_cache();
        assert_eq!(h.store.cache.read().len(), 0);

        // disk copy is still valid
        h.store.get_secure_context("a.test", None).await.unwrap();
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.cache.read().len(), 1);
    }

    #[tokio::test]
    async fn test_expiring_certificate_is_replaced() {
        let h = harness(None);
        let dir = CertDir::new(h.dir.path());
        dir.save("old.test", &certificate_expiring("old.test", 2001, 1, 1))
            .await
            .unwrap();

        let key = h.store.get_secure_context("old.test", None).await.unwrap();
        assert_eq!(h.local.calls.load(Ordering::SeqCst), 1);

        let on_disk = dir.load("old.test").await.unwrap().unwrap();
        assert!(on_disk.is_valid_for(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(key.cert, on_disk.certified_key().cert);
    }

    #[tokio::test]
    async fn test_short_lived_issuance_is_rejected() {
        struct ShortLived;

        #[async_trait]
        impl CertificateIssuer for ShortLived {
            async fn issue(&self, domain: &str, _contact: Option<&str>) -> Result<IssuedCertificate, CertError> {
                Ok(certificate_expiring(domain, 2001, 1, 1))
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(
            CertDir::new(tmp.path()),
            Http01Challenges::new(),
            classifier(None, Some(PUBLIC)),
            Arc::new(ShortLived),
            Arc::new(ShortLived),
        );

        let err = store.get_secure_context("short.test", None).await.unwrap_err();
        assert!(matches!(err, CertError::ExpiresTooSoon { .. }));
        assert!(!tmp.path().join("short.test").exists());
    }

    #[tokio::test]
    async fn test_failed_issuance_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(
            CertDir::new(tmp.path()),
            Http01Challenges::new(),
            classifier(Some(IpAddr::V4(PUBLIC)), Some(PUBLIC)),
            Arc::new(CountingIssuer::default()),
            Arc::new(FailingIssuer),
        );

        assert!(store.get_secure_context("down.example.com", None).await.is_err());
        assert!(store.get_secure_context("down.example.com", None).await.is_err());
        assert_eq!(store.cache.read().len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_issuance() {
        let h = Arc::new(harness(None));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let h = Arc::clone(&h);
            tasks.push(tokio::spawn(async move {
                h.store.get_secure_context("busy.test", None).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.local.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.issuing.is_empty());
    }

    #[tokio::test]
    async fn test_issuance_lock_released_after_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(
            CertDir::new(tmp.path()),
            Http01Challenges::new(),
            classifier(Some(IpAddr::V4(PUBLIC)), Some(PUBLIC)),
            Arc::new(CountingIssuer::default()),
            Arc::new(FailingIssuer),
        );

        for domain in ["one.example.com", "two.example.com"] {
            assert!(store.get_secure_context(domain, None).await.is_err());
        }
        assert!(store.issuing.is_empty());
    }

    #[tokio::test]
    async fn test_acme_response() {
        let h = harness(None);
        h.store
            .challenges()
            .set("tok123".to_string(), "tok123.thumb".to_string())
            .await;

        assert_eq!(
            h.store.acme_response("/.well-known/acme-challenge/tok123").await,
            Some("tok123.thumb".to_string())
        );
        assert_eq!(h.store.acme_response("/.well-known/acme-challenge/other").await, None);
        assert_eq!(h.store.acme_response("/.well-known/acme-challenge/").await, None);
        assert_eq!(h.store.acme_response("/tok123").await, None);
    }

    #[tokio::test]
    async fn test_cache_sweeper_clears_and_stops() {
        let h = harness(None);
        let store = Arc::new(h.store);
        store.get_secure_context("sweep.test", None).await.unwrap();
        assert_eq!(store.cache.read().len(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(Arc::clone(&store).run_cache_sweeper(Duration::from_millis(20), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.cache.read().len(), 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
