//! ACME (Let's Encrypt) certificate issuance
//!
//! Orders are placed per domain and proven with the HTTP-01 challenge only:
//! the key authorization is published in [`Http01Challenges`], which the
//! plaintext listener serves at `/.well-known/acme-challenge/<token>`.
//! DNS-01 is not supported; an authorization offering nothing else fails.
//!
//! # Security Considerations
//!
//! ACME account credentials are stored unencrypted in `<certificates>/.acme/`
//! with 0600 permissions on Unix. Restrict access to the certificates
//! directory to the service user.

use crate::certs::{CertError, IssuedCertificate};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Produces a certificate for one domain.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str, contact: Option<&str>) -> Result<IssuedCertificate, CertError>;
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Issues certificates from an ACME directory, one account per contact email
pub struct AcmeIssuer {
    directory_url: String,
    accounts_dir: PathBuf,
    challenges: Http01Challenges,
    accounts: Mutex<HashMap<String, Account>>,
}

impl AcmeIssuer {
    pub fn new(
        directory_url: Option<String>,
        accounts_dir: impl Into<PathBuf>,
        challenges: Http01Challenges,
    ) -> Self {
        Self {
            directory_url: directory_url.unwrap_or_else(|| LetsEncrypt::Production.url().to_string()),
            accounts_dir: accounts_dir.into(),
            challenges,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Load or create the ACME account for a contact
    async fn account_for(&self, contact: Option<&str>) -> anyhow::Result<Account> {
        let key = account_key(contact);
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(&key) {
            return Ok(account.clone());
        }

        let account_path = self.accounts_dir.join(format!("{}.json", key));
        let account = if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = tokio::fs::read_to_string(&account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            Account::from_credentials(credentials).await?
        } else {
            info!(contact = ?contact, directory = %self.directory_url, "Creating new ACME account");
            let mailto = contact.map(|email| format!("mailto:{}", email));
            let contacts: Vec<&str> = mailto.iter().map(String::as_str).collect();

            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                &self.directory_url,
                None,
            )
            .await?;

            tokio::fs::create_dir_all(&self.accounts_dir).await?;
            let data = serde_json::to_string_pretty(&credentials)?;
            write_private(&account_path, data.as_bytes()).await?;
            info!(path = %account_path.display(), "ACME account credentials saved");
            account
        };

        accounts.insert(key, account.clone());
        Ok(account)
    }

    async fn obtain(&self, domain: &str, contact: Option<&str>) -> anyhow::Result<IssuedCertificate> {
        let account = self.account_for(contact).await?;
        let identifiers = [Identifier::Dns(domain.to_string())];

        info!(domain, contact = ?contact, "Requesting new certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(name) => name.clone(),
            };

            for challenge in authz.challenges.iter().filter(|c| c.r#type == ChallengeType::Dns01) {
                debug!(domain = %identifier, token = %challenge.token, "DNS-01 challenge offered, not supported");
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    warn!(domain = %identifier, "No HTTP-01 challenge offered, DNS-01 is not supported");
                    anyhow::anyhow!("HTTP-01 challenge not available for {}", identifier)
                })?;

            let key_auth = order.key_authorization(challenge).as_str().to_string();
            debug!(domain = %identifier, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.challenges.set(challenge.token.clone(), key_auth).await;

            let outcome = async {
                order.set_challenge_ready(&challenge.url).await?;
                wait_for_authorization(&mut order, &identifier).await
            }
            .await;

            self.challenges.remove(&challenge.token).await;
            debug!(domain = %identifier, token = %challenge.token, "HTTP-01 challenge withdrawn");
            outcome?;
        }

        wait_for_order_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domain);

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing | OrderStatus::Ready => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        info!(domain, "Certificate obtained successfully");

        Ok(IssuedCertificate {
            cert_pem: cert_chain_pem,
            key_pem: private_key.serialize_pem(),
            chain_pem: None,
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str, contact: Option<&str>) -> Result<IssuedCertificate, CertError> {
        self.obtain(domain, contact)
            .await
            .map_err(|e| CertError::Acme(format!("{:#}", e)))
    }
}

async fn wait_for_authorization(order: &mut Order, identifier: &str) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        order.refresh().await?;
        let auths = order.authorizations().await?;
        let current = auths
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

        match current.map(|a| &a.status) {
            Some(AuthorizationStatus::Valid) => {
                info!(domain = %identifier, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Pending) => {
                attempts += 1;
                if attempts > MAX_POLL_ATTEMPTS {
                    anyhow::bail!("Authorization timeout for {}", identifier);
                }
                debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
            }
            Some(AuthorizationStatus::Invalid) => {
                anyhow::bail!("Authorization failed for {}", identifier);
            }
            Some(status) => {
                anyhow::bail!("Authorization for {} ended as {:?}", identifier, status);
            }
            None => {
                anyhow::bail!("Authorization not found for {}", identifier);
            }
        }
    }
}

async fn wait_for_order_ready(order: &mut Order) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        match order.state().status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                attempts += 1;
                if attempts > MAX_POLL_ATTEMPTS {
                    anyhow::bail!("Order timeout");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
}

/// File name stem for an account: the sanitized contact, or `anonymous`
fn account_key(contact: Option<&str>) -> String {
    match contact.map(str::trim).filter(|c| !c.is_empty()) {
        Some(email) => email
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '@' { c } else { '_' })
            .collect(),
        None => "anonymous".to_string(),
    }
}

/// Write a file readable only by the owner
pub(crate) async fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http01_challenges() {
        let challenges = Http01Challenges::new();

        challenges
            .set("token123".to_string(), "key_auth_123".to_string())
            .await;

        assert_eq!(
            challenges.get("token123").await,
            Some("key_auth_123".to_string())
        );
        assert_eq!(challenges.get("nonexistent").await, None);
        assert_eq!(challenges.inner.read().await.len(), 1);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[tokio::test]
    async fn test_challenges_are_shared_between_clones() {
        let challenges = Http01Challenges::new();
        let clone = challenges.clone();
        clone.set("t".to_string(), "k".to_string()).await;
        assert_eq!(challenges.get("t").await, Some("k".to_string()));
    }

    #[test]
    fn test_account_key() {
        assert_eq!(account_key(None), "anonymous");
        assert_eq!(account_key(Some("  ")), "anonymous");
        assert_eq!(account_key(Some("ops@example.com")), "ops@example.com");
        assert_eq!(account_key(Some("../evil/x")), ".._evil_x");
    }

    #[test]
    fn test_issuer_defaults_to_production_directory() {
        let issuer = AcmeIssuer::new(None, "/tmp/acme_accounts", Http01Challenges::new());
        assert_eq!(issuer.directory_url, LetsEncrypt::Production.url());

        let staging = LetsEncrypt::Staging.url().to_string();
        let issuer = AcmeIssuer::new(Some(staging.clone()), "/tmp/acme_accounts", Http01Challenges::new());
        assert_eq!(issuer.directory_url, staging);
    }

    #[tokio::test]
    async fn test_write_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_private(&path, b"{}").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
