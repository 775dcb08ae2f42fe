//! Certificates for local development domains
//!
//! When an `mkcert` binary is configured and present, it signs the
//! certificate with the developer's local CA so browsers trust it. Otherwise
//! a self-signed certificate is generated in-process.

use crate::certs::{CertError, IssuedCertificate};
use crate::acme::CertificateIssuer;
use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Years a self-signed local certificate stays valid
const SELF_SIGNED_YEARS: i32 = 10;

/// Issues certificates for `.loc`/`.local` and privately-resolving domains
#[derive(Debug, Clone)]
pub struct LocalIssuer {
    mkcert: Option<PathBuf>,
    caroot: Option<PathBuf>,
    staging_dir: PathBuf,
}

impl LocalIssuer {
    /// `staging_dir` receives mkcert's output before it is read back.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            mkcert: None,
            caroot: None,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn with_mkcert(mut self, mkcert: Option<PathBuf>, caroot: Option<PathBuf>) -> Self {
        self.mkcert = mkcert;
        self.caroot = caroot;
        self
    }

    async fn issue_with_mkcert(&self, mkcert: &Path, domain: &str) -> Result<IssuedCertificate, CertError> {
        let dir = self.staging_dir.join(domain);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CertError::io(&dir, e))?;

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("privkey.pem");

        let mut command = Command::new(mkcert);
        command
            .arg("-cert-file")
            .arg(&cert_path)
            .arg("-key-file")
            .arg(&key_path)
            .arg(domain);
        if let Some(caroot) = &self.caroot {
            command.env("CAROOT", caroot);
        }

        debug!(domain, mkcert = %mkcert.display(), "Running mkcert");
        let output = command
            .output()
            .await
            .map_err(|e| CertError::Generation(format!("failed to run mkcert: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(CertError::Generation(format!(
                "mkcert exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let cert_pem = tokio::fs::read_to_string(&cert_path)
            .await
            .map_err(|e| CertError::io(&cert_path, e))?;
        let key_pem = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| CertError::io(&key_path, e))?;
        let _ = tokio::fs::remove_dir_all(&dir).await;

        let chain_pem = match &self.caroot {
            Some(caroot) => tokio::fs::read_to_string(caroot.join("rootCA.pem")).await.ok(),
            None => None,
        };

        info!(domain, "Local certificate signed by mkcert");
        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            chain_pem,
        })
    }
}

#[async_trait]
impl CertificateIssuer for LocalIssuer {
    async fn issue(&self, domain: &str, _contact: Option<&str>) -> Result<IssuedCertificate, CertError> {
        if let Some(mkcert) = self.mkcert.as_deref() {
            if mkcert.exists() {
                return self.issue_with_mkcert(mkcert, domain).await;
            }
            warn!(domain, mkcert = %mkcert.display(), "mkcert not found, generating self-signed certificate");
        }
        self_signed(domain)
    }
}

/// Generate a self-signed ECDSA P-256 certificate for one domain
pub fn self_signed(domain: &str) -> Result<IssuedCertificate, CertError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertError::Generation(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, domain);

    let year = current_year();
    params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(year + SELF_SIGNED_YEARS, 1, 1);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    info!(domain, "Generated self-signed certificate");
    Ok(IssuedCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        chain_pem: None,
    })
}

fn current_year() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    1970 + (secs / 31_556_952) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertRecord;
    use std::time::Duration;

    #[test]
    fn test_self_signed_is_long_lived() {
        let issued = self_signed("app.loc").unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));

        let record = CertRecord::from_issued(&issued).unwrap();
        assert!(record.is_valid_for(Duration::from_secs(365 * 24 * 3600)));
    }

    #[tokio::test]
    async fn test_missing_mkcert_falls_back_to_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = LocalIssuer::new(dir.path())
            .with_mkcert(Some(dir.path().join("no-such-mkcert")), None);

        let issued = issuer.issue("fallback.local", None).await.unwrap();
        assert!(CertRecord::from_issued(&issued).is_ok());
    }

    #[test]
    fn test_current_year_is_sane() {
        let year = current_year();
        assert!(year >= 2024 && year < 2200);
    }
}
