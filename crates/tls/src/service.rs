//! Administrative certificate operations
//!
//! [`CertificateService`] is what an admin surface (the CLI here) talks to:
//! create, get, list, refresh and delete certificates. [`bootstrap_account`]
//! attaches the persisted ACME account at startup, registering one on first
//! run.

use crate::acme::{AcmeAccount, AcmeClient};
use crate::codec::{marshal_private_key, parse_private_key};
use crate::error::TlsError;
use crate::renewal::{CertRefresher, RefreshSettings};
use crate::sni::{normalize, CertMatcher};
use crate::storage::{
    AccountRecord, AccountStore, CertificateFilter, CertificateInfo, CertificateRecord,
    CertificateStore, RefreshOptions, Selection,
};
use crate::verify::DomainVerifier;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default maximum rows for list and manual refresh
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Request to issue a certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub domain: String,
    /// Wait for issuance instead of running it in the background
    pub wait: bool,
    /// Auto-refresh settings; disabled when absent
    pub refresh: Option<RefreshOptions>,
}

/// Outcome of a manual refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: Vec<CertificateInfo>,
    pub failed: Vec<CertificateInfo>,
}

#[derive(Clone)]
pub struct CertificateService {
    store: Arc<dyn CertificateStore>,
    verifier: Arc<dyn DomainVerifier>,
    acme: Arc<AcmeClient>,
    matcher: Arc<CertMatcher>,
    refresher: Arc<CertRefresher>,
    list_limit: usize,
}

impl CertificateService {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        verifier: Arc<dyn DomainVerifier>,
        acme: Arc<AcmeClient>,
        matcher: Arc<CertMatcher>,
        settings: RefreshSettings,
    ) -> Self {
        let refresher = Arc::new(CertRefresher::new(
            store.clone(),
            verifier.clone(),
            acme.clone(),
            matcher.clone(),
            settings,
        ));
        Self {
            store,
            verifier,
            acme,
            matcher,
            refresher,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit;
        self
    }

    /// Refresher sharing this service's collaborators, for the scheduler
    pub fn refresher(&self) -> Arc<CertRefresher> {
        self.refresher.clone()
    }

    /// Verify ownership of a domain and issue a certificate for it.
    ///
    /// A failed verification is not an error: the returned info carries the
    /// failure status and nothing is stored. With `wait` unset, issuance runs
    /// in the background and `None` is returned.
    pub async fn create(&self, request: CreateRequest) -> Result<Option<CertificateInfo>, TlsError> {
        let domain = normalize(&request.domain);
        if domain.is_empty() {
            return Err(TlsError::Config("domain is required".to_string()));
        }
        if self.store.find_by_domain(&domain).await?.is_some() {
            return Err(TlsError::Storage(format!(
                "certificate for {} already exists",
                domain
            )));
        }

        let timeout = self.refresher.settings().verify_timeout;
        if let Err(e) = self.verifier.verify(&domain, timeout).await {
            warn!(domain = %domain, error = %e, "Domain verification failed, not issuing");
            return Ok(Some(CertificateInfo::unverified(&domain, &e)));
        }

        let options = request.refresh.unwrap_or_default();
        if !request.wait {
            let service = self.clone();
            tokio::spawn(async move {
                match service.issue(&domain, options).await {
                    Ok(_) => info!(domain = %domain, "Certificate created"),
                    Err(e) => error!(domain = %domain, error = %e, "Failed to create certificate"),
                }
            });
            return Ok(None);
        }

        self.issue(&domain, options).await.map(Some)
    }

    async fn issue(&self, domain: &str, options: RefreshOptions) -> Result<CertificateInfo, TlsError> {
        let resource = self.acme.obtain(&[domain.to_string()]).await?;
        let record = CertificateRecord::from_resource(&resource, options)?;
        let record = self.store.insert(record).await?;

        // Drop a cached miss for the new name
        if let Err(e) = self.matcher.invalidate(domain).await {
            warn!(domain = %domain, error = %e, "Failed to invalidate match cache");
        }

        Ok(record.info())
    }

    pub async fn get(&self, domain: &str) -> Result<Option<CertificateInfo>, TlsError> {
        Ok(self
            .store
            .find_by_domain(&normalize(domain))
            .await?
            .map(|record| record.info()))
    }

    pub async fn list(&self, filter: &CertificateFilter) -> Result<Vec<CertificateInfo>, TlsError> {
        Ok(self
            .store
            .list(filter, self.list_limit)
            .await?
            .iter()
            .map(CertificateRecord::info)
            .collect())
    }

    /// Refresh the certificates matching `filter`, regardless of schedule
    pub async fn refresh(&self, filter: CertificateFilter) -> Result<RefreshReport, TlsError> {
        let outcome = self
            .refresher
            .refresh(&Selection::Filtered {
                filter,
                limit: self.list_limit,
            })
            .await?;

        Ok(RefreshReport {
            refreshed: outcome.refreshed.iter().map(CertificateRecord::info).collect(),
            failed: outcome.failed.iter().map(CertificateRecord::info).collect(),
        })
    }

    /// Remove a certificate. Removing an unknown domain only clears its
    /// cached matches.
    pub async fn delete(&self, domain: &str) -> Result<(), TlsError> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return Err(TlsError::Config("domain is required".to_string()));
        }

        let result = self.delete_record(&domain).await;
        if let Err(e) = self.matcher.invalidate(&domain).await {
            warn!(domain = %domain, error = %e, "Failed to invalidate match cache");
        }
        result
    }

    async fn delete_record(&self, domain: &str) -> Result<(), TlsError> {
        let mut tx = self.store.begin().await?;

        if tx.lock(&Selection::Domain(domain.to_string())).await?.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }
        tx.delete(domain).await?;
        tx.commit().await?;
        info!(domain = %domain, "Certificate deleted");
        Ok(())
    }
}

/// Attach the stored ACME account to `acme`, registering and storing one if
/// there is none yet. Runs under the account store's exclusive lock.
pub async fn bootstrap_account(
    store: &dyn AccountStore,
    acme: &AcmeClient,
    email: &str,
) -> Result<AcmeAccount, TlsError> {
    let mut tx = store.begin_account().await?;

    if let Some(record) = tx.load().await? {
        if record.email != email {
            warn!(
                stored = %record.email,
                configured = %email,
                "Configured ACME email differs from the stored account"
            );
        }
        let key = parse_private_key(&record.private_key, record.private_key_type)
            .map_err(|e| e.context("parsing account key"))?;
        let account = acme
            .initialize_account(AcmeAccount {
                email: record.email,
                key: Some(key),
                registration: Some(record.registration),
            })
            .await?;
        tx.commit().await?;
        return Ok(account);
    }

    let account = acme.initialize_account(AcmeAccount::new(email)).await?;
    let key = account
        .key
        .as_ref()
        .ok_or_else(|| TlsError::Acme("registered account has no key".to_string()))?;
    let (private_key, private_key_type) = marshal_private_key(key)?;

    tx.insert(AccountRecord {
        email: account.email.clone(),
        private_key,
        private_key_type,
        registration: account.registration.clone().unwrap_or_default(),
        created_at: Utc::now(),
    })
    .await?;
    tx.commit().await?;

    info!(email = %account.email, "ACME account stored");
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMatchCache;
    use crate::storage::{CertificateStatus, FileStore};
    use crate::testing::{FakeCa, ScriptedVerifier};
    use crate::verify::VerifyError;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Arc<FileStore>,
        ca: Arc<FakeCa>,
        verifier: Arc<ScriptedVerifier>,
        matcher: Arc<CertMatcher>,
        service: CertificateService,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(temp.path()).await.unwrap());
        let ca = Arc::new(FakeCa::new());
        let acme = Arc::new(AcmeClient::new(ca.clone()));
        bootstrap_account(store.as_ref(), &acme, "admin@example.com")
            .await
            .unwrap();
        let verifier = Arc::new(ScriptedVerifier::new());
        let matcher = Arc::new(CertMatcher::new(
            Arc::new(MemoryMatchCache::new()),
            Duration::from_secs(600),
        ));
        let service = CertificateService::new(
            store.clone(),
            verifier.clone(),
            acme,
            matcher.clone(),
            RefreshSettings::default(),
        );

        Fixture {
            _temp: temp,
            store,
            ca,
            verifier,
            matcher,
            service,
        }
    }

    fn create(domain: &str) -> CreateRequest {
        CreateRequest {
            domain: domain.to_string(),
            wait: true,
            refresh: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let f = fixture().await;
        let options = RefreshOptions {
            auto_refresh: true,
            refresh_before_days: 30,
        };

        let info = f
            .service
            .create(CreateRequest {
                refresh: Some(options),
                ..create("Example.com")
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.domain, "example.com");
        assert_eq!(info.status, CertificateStatus::Ok);
        assert_eq!(info.refresh, options);
        assert_eq!(info.expires_at, Some(crate::testing::leaf_not_after()));

        assert_eq!(f.service.get("example.com").await.unwrap(), Some(info));
        assert_eq!(f.service.get("missing.com").await.unwrap(), None);
        assert_eq!(f.verifier.calls()[0].1, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_create_defaults_to_no_refresh() {
        let f = fixture().await;
        let info = f.service.create(create("example.com")).await.unwrap().unwrap();
        assert_eq!(info.refresh, RefreshOptions::default());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_and_duplicate() {
        let f = fixture().await;
        assert!(f.service.create(create("  ")).await.is_err());

        f.service.create(create("example.com")).await.unwrap();
        assert!(f.service.create(create("example.com")).await.is_err());
        assert_eq!(f.ca.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_create_unverified_stores_nothing() {
        let f = fixture().await;
        f.verifier.fail(
            "example.com",
            VerifyError::VerificationFailed("keys mismatch".to_string()),
        );

        let info = f.service.create(create("example.com")).await.unwrap().unwrap();
        assert_eq!(info.status, CertificateStatus::DomainVerificationFailed);
        assert_eq!(info.expires_at, None);
        assert!(f.store.find_by_domain("example.com").await.unwrap().is_none());
        assert!(f.ca.issued().is_empty());
    }

    #[tokio::test]
    async fn test_create_invalid_domain_never_reaches_ca() {
        let f = fixture().await;
        f.verifier.fail(
            "bad.invalid",
            VerifyError::InvalidDomain("no such host".to_string()),
        );

        let info = f.service.create(create("bad.invalid")).await.unwrap().unwrap();
        assert_eq!(info.domain, "bad.invalid");
        assert_eq!(info.status, CertificateStatus::InvalidDomain);
        assert_eq!(info.expires_at, None);
        assert!(f.ca.issued().is_empty());
        assert!(f.store.find_by_domain("bad.invalid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_in_background() {
        let f = fixture().await;
        let result = f
            .service
            .create(CreateRequest {
                wait: false,
                ..create("example.com")
            })
            .await
            .unwrap();
        assert!(result.is_none());

        for _ in 0..100 {
            if f.service.get("example.com").await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("certificate was not created in the background");
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let f = fixture().await;
        for domain in ["a.example.com", "b.example.com", "c.example.com"] {
            f.service.create(create(domain)).await.unwrap();
        }

        let all = f.service.list(&CertificateFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let some = f
            .service
            .list(&CertificateFilter {
                domains: vec!["b.example.com".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].domain, "b.example.com");

        let limited = f.service.clone().with_list_limit(2);
        assert_eq!(limited.list(&CertificateFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_manual_refresh() {
        let f = fixture().await;
        f.service.create(create("a.example.com")).await.unwrap();
        f.service.create(create("b.example.com")).await.unwrap();
        f.verifier
            .fail("b.example.com", VerifyError::InvalidDomain("nxdomain".to_string()));

        let report = f.service.refresh(CertificateFilter::default()).await.unwrap();
        assert_eq!(report.refreshed.len(), 1);
        assert_eq!(report.refreshed[0].domain, "a.example.com");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].status, CertificateStatus::InvalidDomain);

        // Verified again before renewal
        f.verifier.pass("b.example.com");
        let report = f
            .service
            .refresh(CertificateFilter {
                status: Some(CertificateStatus::InvalidDomain),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.refreshed.len(), 1);
        assert_eq!(report.refreshed[0].status, CertificateStatus::Ok);
    }

    #[tokio::test]
    async fn test_delete() {
        let f = fixture().await;
        f.service.create(create("a.example.com")).await.unwrap();

        let served = f
            .matcher
            .match_domain("a.example.com", f.store.as_ref())
            .await
            .unwrap();
        assert!(served.is_some());

        f.service.delete("a.example.com").await.unwrap();
        assert!(f.service.get("a.example.com").await.unwrap().is_none());
        let served = f
            .matcher
            .match_domain("a.example.com", f.store.as_ref())
            .await
            .unwrap();
        assert!(served.is_none());

        f.service.delete("a.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_requires_domain() {
        let f = fixture().await;
        assert!(matches!(f.service.delete("").await, Err(TlsError::Config(_))));
        assert!(matches!(f.service.delete("   ").await, Err(TlsError::Config(_))));
    }

    #[tokio::test]
    async fn test_delete_unknown_domain_clears_cached_miss() {
        let f = fixture().await;
        let resolver = crate::testing::MapResolver::new();

        let miss = f.matcher.match_domain("a.example.com", &resolver).await.unwrap();
        assert!(miss.is_none());
        let calls = resolver.calls();
        f.matcher.match_domain("a.example.com", &resolver).await.unwrap();
        assert_eq!(resolver.calls(), calls);

        f.service.delete("a.example.com").await.unwrap();

        f.matcher.match_domain("a.example.com", &resolver).await.unwrap();
        assert!(resolver.calls() > calls);
    }

    #[tokio::test]
    async fn test_bootstrap_account_registers_once() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).await.unwrap();
        let ca = Arc::new(FakeCa::new());

        let first = AcmeClient::new(ca.clone());
        let registered = bootstrap_account(&store, &first, "admin@example.com")
            .await
            .unwrap();
        assert_eq!(ca.registrations(), 1);

        let second = AcmeClient::new(ca.clone());
        let attached = bootstrap_account(&store, &second, "admin@example.com")
            .await
            .unwrap();
        assert_eq!(ca.registrations(), 1);
        assert_eq!(attached, registered);
        assert_eq!(second.thumbprint().unwrap(), first.thumbprint().unwrap());
    }
}
