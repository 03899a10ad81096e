//! ACME client for automatic certificate provisioning
//!
//! [`AcmeClient`] owns the process-wide account identity and runs obtain and
//! renew against a [`CaBackend`]. [`InstantAcmeBackend`] is the real backend;
//! it answers HTTP-01 challenges through the proxy's own HTTP boundary (see
//! [`crate::challenge`]), so nothing here keeps per-token state.

use crate::codec::{self, PrivateKey, PEM_CERTIFICATE};
use crate::error::TlsError;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

/// Maximum time allowed for a complete ACME certificate acquisition (5 minutes)
const ACME_TOTAL_TIMEOUT_SECS: u64 = 300;

/// The CA account this process acts as
#[derive(Debug, Clone, PartialEq)]
pub struct AcmeAccount {
    pub email: String,
    pub key: Option<PrivateKey>,
    /// Registration as returned by the CA, opaque to everything but the backend
    pub registration: Option<serde_json::Value>,
}

impl AcmeAccount {
    /// An identity that still has to be registered
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            key: None,
            registration: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.key.is_some() && self.registration.is_some()
    }
}

/// An issued certificate in CA transport form (all fields PEM)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateResource {
    pub domain: String,
    pub cert_url: String,
    pub cert_stable_url: String,
    pub private_key: Vec<u8>,
    /// Leaf followed by intermediates
    pub certificate: Vec<u8>,
    pub issuer_certificate: Vec<u8>,
    pub csr: Vec<u8>,
}

/// Protocol seam to a certificate authority
#[async_trait]
pub trait CaBackend: Send + Sync {
    /// Create a new account, returning its key and registration record
    async fn register(&self, email: &str) -> Result<(PrivateKey, serde_json::Value), TlsError>;

    /// Order a bundled certificate for `domains`; the first one names the
    /// resource. The CSR is signed with `key` when given, else a fresh key.
    async fn obtain(
        &self,
        account: &AcmeAccount,
        domains: &[String],
        key: Option<&PrivateKey>,
    ) -> Result<Option<CertificateResource>, TlsError>;
}

/// Owns the account and runs issuance through a [`CaBackend`]
pub struct AcmeClient {
    backend: Arc<dyn CaBackend>,
    account: OnceLock<AcmeAccount>,
    thumbprint: OnceLock<String>,
}

impl AcmeClient {
    pub fn new(backend: Arc<dyn CaBackend>) -> Self {
        Self {
            backend,
            account: OnceLock::new(),
            thumbprint: OnceLock::new(),
        }
    }

    /// Attach the account identity, registering it first if needed.
    ///
    /// Returns the finalized identity so the caller can persist it. Fails if
    /// an account is already attached.
    pub async fn initialize_account(&self, identity: AcmeAccount) -> Result<AcmeAccount, TlsError> {
        if self.account.get().is_some() {
            return Err(TlsError::Config("ACME account already initialized".to_string()));
        }
        if identity.email.is_empty() {
            return Err(TlsError::Config("ACME account email is required".to_string()));
        }

        let account = match identity {
            AcmeAccount {
                email,
                key: Some(key),
                registration: Some(registration),
            } => AcmeAccount {
                email,
                key: Some(key),
                registration: Some(registration),
            },
            AcmeAccount { email, .. } => {
                info!(email = %email, "Registering ACME account");
                let (key, registration) = self.backend.register(&email).await?;
                AcmeAccount {
                    email,
                    key: Some(key),
                    registration: Some(registration),
                }
            }
        };

        self.account
            .set(account.clone())
            .map_err(|_| TlsError::Config("ACME account already initialized".to_string()))?;

        info!(email = %account.email, "ACME account initialized");
        Ok(account)
    }

    pub fn account(&self) -> Result<&AcmeAccount, TlsError> {
        self.account
            .get()
            .ok_or_else(|| TlsError::Config("ACME account not initialized".to_string()))
    }

    /// JWK thumbprint of the account key, computed once
    pub fn thumbprint(&self) -> Result<&str, TlsError> {
        if let Some(thumbprint) = self.thumbprint.get() {
            return Ok(thumbprint);
        }

        let key = self
            .account()?
            .key
            .as_ref()
            .ok_or_else(|| TlsError::Config("ACME account has no key".to_string()))?;
        let computed = key.jwk_thumbprint()?;
        Ok(self.thumbprint.get_or_init(|| computed))
    }

    /// Obtain a new certificate bundle for one or more domains
    pub async fn obtain(&self, domains: &[String]) -> Result<CertificateResource, TlsError> {
        self.order(domains, None).await
    }

    async fn order(
        &self,
        domains: &[String],
        key: Option<&PrivateKey>,
    ) -> Result<CertificateResource, TlsError> {
        let Some(primary) = domains.first() else {
            return Err(TlsError::Config(
                "no domains to obtain a certificate for".to_string(),
            ));
        };
        let account = self.account()?;

        info!(domains = ?domains, "Obtaining certificate via ACME");
        let resource = self
            .backend
            .obtain(account, domains, key)
            .await
            .map_err(|e| e.context(format!("obtain for {}", domains.join(","))))?
            .ok_or_else(|| TlsError::Acme(format!("no certificate returned for {}", primary)))?;

        if resource.certificate.is_empty() || resource.private_key.is_empty() {
            return Err(TlsError::Acme(format!(
                "certificate for {} is missing its chain or private key",
                primary
            )));
        }

        info!(domain = %primary, "Certificate obtained successfully");
        Ok(resource)
    }

    /// Re-issue a previously obtained certificate for the same identifiers,
    /// keeping its private key
    pub async fn renew(&self, resource: &CertificateResource) -> Result<CertificateResource, TlsError> {
        if resource.certificate.is_empty() {
            return Err(TlsError::Config(format!(
                "certificate for {} has no chain to renew",
                resource.domain
            )));
        }

        let chain = codec::decode_certificate_chain(&resource.certificate)
            .map_err(|e| e.context(format!("renew for {}", resource.domain)))?;
        let mut domains = codec::inspect_certificate(&chain[0])?.identifiers();
        if domains.is_empty() {
            domains.push(resource.domain.clone());
        }

        let key = if resource.private_key.is_empty() {
            None
        } else {
            let der = codec::pem_decode(&resource.private_key).ok_or_else(|| {
                TlsError::KeyDecode(format!("private key of {} is not PEM", resource.domain))
            })?;
            Some(codec::parse_private_key_auto(&der)?.0)
        };

        info!(domain = %resource.domain, "Renewing certificate");
        let mut renewed = self.order(&domains, key.as_ref()).await?;
        renewed.domain = resource.domain.clone();
        Ok(renewed)
    }
}

/// [`CaBackend`] speaking RFC 8555 through `instant-acme`
pub struct InstantAcmeBackend {
    ca_url: String,
    account: tokio::sync::OnceCell<Account>,
}

impl InstantAcmeBackend {
    pub fn new(ca_url: impl Into<String>) -> Self {
        Self {
            ca_url: ca_url.into(),
            account: tokio::sync::OnceCell::new(),
        }
    }

    /// The protocol-level account, rebuilt from the stored registration on first use
    async fn protocol_account(&self, identity: &AcmeAccount) -> Result<&Account, TlsError> {
        self.account
            .get_or_try_init(|| async {
                let registration = identity
                    .registration
                    .clone()
                    .ok_or_else(|| TlsError::Config("ACME account is not registered".to_string()))?;
                let credentials: AccountCredentials = serde_json::from_value(registration)?;
                Account::from_credentials(credentials)
                    .await
                    .map_err(|e| TlsError::Acme(e.to_string()))
            })
            .await
    }

    async fn obtain_inner(
        &self,
        identity: &AcmeAccount,
        domains: &[String],
        key: Option<&PrivateKey>,
    ) -> Result<Option<CertificateResource>, TlsError> {
        let account = self.protocol_account(identity).await?;

        // Create order
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| TlsError::Acme(e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| TlsError::Acme(e.to_string()))?;

        for auth in authorizations {
            match auth.status {
                AuthorizationStatus::Pending => {
                    let challenge = auth
                        .challenges
                        .iter()
                        .find(|c| c.r#type == ChallengeType::Http01)
                        .ok_or_else(|| {
                            TlsError::Acme("No supported challenge type found".to_string())
                        })?;

                    // The HTTP boundary answers with the account thumbprint
                    debug!(token = %challenge.token, "HTTP-01 challenge ready");
                    order
                        .set_challenge_ready(&challenge.url)
                        .await
                        .map_err(|e| TlsError::Acme(e.to_string()))?;
                }
                AuthorizationStatus::Valid => {
                    debug!("Authorization already valid");
                }
                status => {
                    return Err(TlsError::Acme(format!(
                        "Unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }

        wait_for_order_ready(&mut order, 10).await?;

        let mut params = CertificateParams::new(domains.to_vec())
            .map_err(|e| TlsError::Acme(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = match key {
            Some(key) => KeyPair::try_from(key.to_pkcs8_der()?.as_slice())
                .map_err(|e| TlsError::KeyDecode(format!("CSR signing key: {}", e)))?,
            None => KeyPair::generate().map_err(|e| TlsError::Acme(e.to_string()))?,
        };
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| TlsError::Acme(e.to_string()))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| TlsError::Acme(e.to_string()))?;
        wait_for_order_ready(&mut order, 10).await?;

        let mut chain = None;
        for _ in 0..10 {
            chain = order
                .certificate()
                .await
                .map_err(|e| TlsError::Acme(e.to_string()))?;
            if chain.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let Some(chain) = chain else {
            return Ok(None);
        };

        let cert_url = order.state().certificate.clone().unwrap_or_default();
        let issuer_certificate = codec::pem_decode_many(chain.as_bytes())
            .get(1)
            .map(|der| codec::pem_encode(PEM_CERTIFICATE, der))
            .unwrap_or_default();

        Ok(Some(CertificateResource {
            domain: domains[0].clone(),
            cert_stable_url: cert_url.clone(),
            cert_url,
            private_key: key_pair.serialize_pem().into_bytes(),
            certificate: chain.into_bytes(),
            issuer_certificate,
            csr: csr
                .pem()
                .map_err(|e| TlsError::Acme(e.to_string()))?
                .into_bytes(),
        }))
    }
}

#[async_trait]
impl CaBackend for InstantAcmeBackend {
    async fn register(&self, email: &str) -> Result<(PrivateKey, serde_json::Value), TlsError> {
        info!(email = %email, ca = %self.ca_url, "Creating ACME account");

        let contact = format!("mailto:{}", email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.ca_url,
            None,
        )
        .await
        .map_err(|e| TlsError::Acme(e.to_string()))?;

        let registration = serde_json::to_value(&credentials)?;
        let key = key_from_credentials(&registration)?;

        if self.account.set(account).is_err() {
            debug!("Protocol account already attached");
        }
        Ok((key, registration))
    }

    async fn obtain(
        &self,
        account: &AcmeAccount,
        domains: &[String],
        key: Option<&PrivateKey>,
    ) -> Result<Option<CertificateResource>, TlsError> {
        // Wrap the entire operation in a timeout
        let timeout_duration = Duration::from_secs(ACME_TOTAL_TIMEOUT_SECS);
        let order = self.obtain_inner(account, domains, key);
        match tokio::time::timeout(timeout_duration, order).await {
            Ok(result) => result,
            Err(_) => Err(TlsError::Acme(format!(
                "ACME certificate acquisition timed out after {} seconds",
                ACME_TOTAL_TIMEOUT_SECS
            ))),
        }
    }
}

/// Wait for order to be ready
async fn wait_for_order_ready(
    order: &mut instant_acme::Order,
    max_attempts: u32,
) -> Result<(), TlsError> {
    for i in 0..max_attempts {
        tokio::time::sleep(Duration::from_secs(2)).await;

        order
            .refresh()
            .await
            .map_err(|e| TlsError::Acme(e.to_string()))?;

        match order.state().status {
            OrderStatus::Ready | OrderStatus::Valid => {
                return Ok(());
            }
            OrderStatus::Invalid => {
                return Err(TlsError::Acme("Order became invalid".to_string()));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                debug!(attempt = i + 1, "Waiting for order to be ready");
            }
        }
    }

    Err(TlsError::Acme("Order did not become ready in time".to_string()))
}

/// Account key out of serialized `instant-acme` credentials
fn key_from_credentials(registration: &serde_json::Value) -> Result<PrivateKey, TlsError> {
    let encoded = registration
        .get("key_pkcs8")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| TlsError::Acme("registration carries no account key".to_string()))?;
    let der = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| TlsError::KeyDecode(format!("account key: {}", e)))?;

    let (key, _) = codec::parse_private_key_auto(&der)?;
    Ok(key)
}
