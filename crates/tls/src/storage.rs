//! Certificate and account inventory
//!
//! The records persisted for issued certificates and the ACME account, the
//! store contracts the rest of the crate is written against, and
//! [`FileStore`], a JSON-on-disk implementation of those contracts.

use crate::acme::CertificateResource;
use crate::codec::{
    self, decode_certificate_chain, parse_private_key, CertificateDescriptor, KeyType,
    PEM_CERTIFICATE, PEM_CERTIFICATE_REQUEST,
};
use crate::error::TlsError;
use crate::sni::DomainResolver;
use crate::verify::VerifyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle status of a stored certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Ok,
    /// DNS resolution failed
    InvalidDomain,
    /// Echo check failed
    DomainVerificationFailed,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateStatus::Ok => "ok",
            CertificateStatus::InvalidDomain => "invalid_domain",
            CertificateStatus::DomainVerificationFailed => "domain_verification_failed",
        };
        f.write_str(name)
    }
}

impl FromStr for CertificateStatus {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(CertificateStatus::Ok),
            "invalid_domain" => Ok(CertificateStatus::InvalidDomain),
            "domain_verification_failed" => Ok(CertificateStatus::DomainVerificationFailed),
            other => Err(TlsError::Config(format!("unknown certificate status: {}", other))),
        }
    }
}

/// Auto-refresh settings attached to a certificate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOptions {
    pub auto_refresh: bool,
    /// Days before expiry at which the certificate becomes a refresh candidate
    pub refresh_before_days: u32,
}

/// A stored certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: u64,
    pub domain: String,
    pub cert_url: String,
    pub cert_stable_url: String,
    #[serde(with = "serde_b64")]
    pub private_key: Vec<u8>,
    pub private_key_type: KeyType,
    /// DER blocks, leaf first
    #[serde(with = "serde_b64::many")]
    pub certificate: Vec<Vec<u8>>,
    #[serde(with = "serde_b64")]
    pub issuer_certificate: Vec<u8>,
    #[serde(with = "serde_b64")]
    pub csr: Vec<u8>,
    pub status: CertificateStatus,
    pub failures: u32,
    pub auto_refresh: bool,
    pub refresh_before_days: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a new, not yet inserted, record from an issued resource
    pub fn from_resource(
        resource: &CertificateResource,
        options: RefreshOptions,
    ) -> Result<Self, TlsError> {
        let chain = decode_certificate_chain(&resource.certificate)
            .map_err(|e| e.context(format!("certificate for {}", resource.domain)))?;
        let expires_at = codec::inspect_certificate(&chain[0])?.not_after;
        let (key, _) = codec::pem_decode(&resource.private_key)
            .ok_or_else(|| TlsError::KeyDecode("no private key in resource".to_string()))
            .and_then(|der| codec::parse_private_key_auto(&der))?;
        let (private_key, private_key_type) = codec::marshal_private_key(&key)?;

        let now = Utc::now();
        Ok(Self {
            id: 0,
            domain: resource.domain.clone(),
            cert_url: resource.cert_url.clone(),
            cert_stable_url: resource.cert_stable_url.clone(),
            private_key,
            private_key_type,
            certificate: chain,
            issuer_certificate: codec::pem_decode(&resource.issuer_certificate).unwrap_or_default(),
            csr: codec::pem_decode(&resource.csr).unwrap_or_default(),
            status: CertificateStatus::Ok,
            failures: 0,
            auto_refresh: options.auto_refresh,
            refresh_before_days: options.refresh_before_days,
            created_at: now,
            updated_at: now,
            expires_at,
        })
    }

    /// Replace the issued material with a renewed resource and mark the record healthy
    pub fn apply_resource(&mut self, resource: &CertificateResource) -> Result<(), TlsError> {
        let renewed = Self::from_resource(resource, self.refresh_options())?;

        self.domain = renewed.domain;
        self.cert_url = renewed.cert_url;
        self.cert_stable_url = renewed.cert_stable_url;
        self.private_key = renewed.private_key;
        self.private_key_type = renewed.private_key_type;
        self.certificate = renewed.certificate;
        self.issuer_certificate = renewed.issuer_certificate;
        self.csr = renewed.csr;
        self.expires_at = renewed.expires_at;
        self.status = CertificateStatus::Ok;
        self.failures = 0;
        Ok(())
    }

    /// Convert back into the shape the ACME client renews from
    pub fn to_resource(&self) -> Result<CertificateResource, TlsError> {
        let private_key = if self.private_key.is_empty() {
            Vec::new()
        } else {
            parse_private_key(&self.private_key, self.private_key_type)
                .map_err(|e| e.context("parsing certificate private key"))?
                .to_pem()?
        };

        let pem_or_empty = |tag: &str, der: &[u8]| {
            if der.is_empty() {
                Vec::new()
            } else {
                codec::pem_encode(tag, der)
            }
        };

        Ok(CertificateResource {
            domain: self.domain.clone(),
            cert_url: self.cert_url.clone(),
            cert_stable_url: self.cert_stable_url.clone(),
            private_key,
            certificate: codec::pem_encode_many(PEM_CERTIFICATE, &self.certificate),
            issuer_certificate: pem_or_empty(PEM_CERTIFICATE, &self.issuer_certificate),
            csr: pem_or_empty(PEM_CERTIFICATE_REQUEST, &self.csr),
        })
    }

    pub fn descriptor(&self) -> CertificateDescriptor {
        CertificateDescriptor {
            chain: self.certificate.clone(),
            private_key: self.private_key.clone(),
            key_type: self.private_key_type,
        }
    }

    /// Flag the record without touching the served chain
    pub fn record_verification_failure(&mut self, error: &VerifyError) {
        self.status = error.status();
        self.failures += 1;
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions {
            auto_refresh: self.auto_refresh,
            refresh_before_days: self.refresh_before_days,
        }
    }

    pub fn info(&self) -> CertificateInfo {
        CertificateInfo {
            domain: self.domain.clone(),
            status: self.status,
            expires_at: Some(self.expires_at),
            refresh: self.refresh_options(),
        }
    }
}

/// Public view of a certificate, without key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub domain: String,
    pub status: CertificateStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh: RefreshOptions,
}

impl CertificateInfo {
    /// Outcome of a create that stopped at domain verification
    pub fn unverified(domain: &str, error: &VerifyError) -> Self {
        Self {
            domain: domain.to_string(),
            status: error.status(),
            expires_at: None,
            refresh: RefreshOptions::default(),
        }
    }
}

/// Listing filter; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateFilter {
    pub domains: Vec<String>,
    pub expires_before: Option<DateTime<Utc>>,
    pub status: Option<CertificateStatus>,
}

impl CertificateFilter {
    pub fn matches(&self, record: &CertificateRecord) -> bool {
        if !self.domains.is_empty() && !self.domains.contains(&record.domain) {
            return false;
        }
        if let Some(before) = self.expires_before {
            if record.expires_at >= before {
                return false;
            }
        }
        self.status.map_or(true, |status| record.status == status)
    }
}

/// Criteria for automatic refresh candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshCandidates {
    pub failure_threshold: u32,
    pub batch_size: usize,
    /// Minimum time since the last update
    pub cooldown: chrono::Duration,
}

impl RefreshCandidates {
    pub fn matches(&self, record: &CertificateRecord, now: DateTime<Utc>) -> bool {
        record.failures < self.failure_threshold
            && record.auto_refresh
            && record.updated_at < now - self.cooldown
            && record.expires_at <= now + chrono::Duration::days(i64::from(record.refresh_before_days))
    }
}

/// Rows a transaction locks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    RefreshCandidates(RefreshCandidates),
    Filtered { filter: CertificateFilter, limit: usize },
    Domain(String),
}

impl Selection {
    fn matches(&self, record: &CertificateRecord, now: DateTime<Utc>) -> bool {
        match self {
            Selection::RefreshCandidates(criteria) => criteria.matches(record, now),
            Selection::Filtered { filter, .. } => filter.matches(record),
            Selection::Domain(domain) => record.domain == *domain,
        }
    }

    fn limit(&self) -> usize {
        match self {
            Selection::RefreshCandidates(criteria) => criteria.batch_size,
            Selection::Filtered { limit, .. } => *limit,
            Selection::Domain(_) => 1,
        }
    }
}

/// Persistent certificate inventory
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_by_domain(&self, domain: &str) -> Result<Option<CertificateRecord>, TlsError>;

    /// Candidates ordered by id, at most `criteria.batch_size`
    async fn find_candidates_for_refresh(
        &self,
        criteria: &RefreshCandidates,
    ) -> Result<Vec<CertificateRecord>, TlsError>;

    async fn list(
        &self,
        filter: &CertificateFilter,
        limit: usize,
    ) -> Result<Vec<CertificateRecord>, TlsError>;

    /// Insert a new record, assigning its id. Domains are unique.
    async fn insert(&self, record: CertificateRecord) -> Result<CertificateRecord, TlsError>;

    async fn begin(&self) -> Result<Box<dyn CertificateTransaction>, TlsError>;
}

/// Unit of work over the certificate inventory
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait CertificateTransaction: Send {
    /// Claim the selected rows exclusively. An empty result means nothing to claim.
    async fn lock(&mut self, selection: &Selection) -> Result<Vec<CertificateRecord>, TlsError>;

    /// Stage an update, stamping `updated_at`
    async fn update(&mut self, record: &CertificateRecord) -> Result<(), TlsError>;

    async fn delete(&mut self, domain: &str) -> Result<(), TlsError>;

    async fn commit(self: Box<Self>) -> Result<(), TlsError>;

    async fn rollback(self: Box<Self>) -> Result<(), TlsError>;
}

/// The persisted ACME account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    #[serde(with = "serde_b64")]
    pub private_key: Vec<u8>,
    pub private_key_type: KeyType,
    pub registration: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Persistent account inventory (a single row)
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Open a transaction holding the account table exclusively
    async fn begin_account(&self) -> Result<Box<dyn AccountTransaction>, TlsError>;
}

#[async_trait]
pub trait AccountTransaction: Send {
    async fn load(&mut self) -> Result<Option<AccountRecord>, TlsError>;

    async fn insert(&mut self, record: AccountRecord) -> Result<(), TlsError>;

    async fn commit(self: Box<Self>) -> Result<(), TlsError>;
}

/// Lock file guarding writers across processes
const LOCK_FILE: &str = ".lock";

/// JSON files under a base directory
///
/// Certificates live in `<base>/certs/<domain>.json`, the account in
/// `<base>/account.json`. Writers and transactions hold an exclusive OS lock
/// on `<base>/.lock`, so a CLI process and a running server never work on
/// the inventory at the same time. Readers take no lock.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
    lock: Arc<Mutex<()>>,
}

/// Exclusive hold on a [`FileStore`], released on drop
struct StoreGuard {
    _file: std::fs::File,
    _local: OwnedMutexGuard<()>,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(base_path: P) -> Result<Self, TlsError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(base_path.join("certs")).await?;

        info!(path = ?base_path, "Certificate storage initialized");
        Ok(Self {
            base_path,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Get certificate file path
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.base_path
            .join("certs")
            .join(format!("{}.json", sanitize_domain(domain)))
    }

    fn account_path(&self) -> PathBuf {
        self.base_path.join("account.json")
    }

    /// Take the in-process lock, then the OS lock on the lock file
    async fn acquire(&self) -> Result<StoreGuard, TlsError> {
        let local = self.lock.clone().lock_owned().await;

        let path = self.base_path.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| TlsError::Storage(format!("store lock task failed: {}", e)))??;

        Ok(StoreGuard {
            _file: file,
            _local: local,
        })
    }

    async fn read_record(&self, domain: &str) -> Result<Option<CertificateRecord>, TlsError> {
        let content = match fs::read(self.cert_path(domain)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CertificateRecord = serde_json::from_slice(&content)?;

        // Sanitized file names may collide
        Ok((record.domain == domain).then_some(record))
    }

    /// All records ordered by id
    async fn read_records(&self) -> Result<Vec<CertificateRecord>, TlsError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.base_path.join("certs")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = fs::read(&path).await?;
            match serde_json::from_slice::<CertificateRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable certificate record"),
            }
        }

        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn select(&self, selection: &Selection) -> Result<Vec<CertificateRecord>, TlsError> {
        let now = Utc::now();
        Ok(self
            .read_records()
            .await?
            .into_iter()
            .filter(|r| selection.matches(r, now))
            .take(selection.limit())
            .collect())
    }

    pub(crate) async fn write_record(&self, record: &CertificateRecord) -> Result<(), TlsError> {
        write_atomic(&self.cert_path(&record.domain), &serde_json::to_vec_pretty(record)?).await?;
        debug!(domain = %record.domain, id = record.id, "Certificate record stored");
        Ok(())
    }

    async fn remove_record(&self, domain: &str) -> Result<(), TlsError> {
        match fs::remove_file(self.cert_path(domain)).await {
            Ok(()) => {
                debug!(domain = %domain, "Certificate record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), TlsError> {
    let tmp = staging_path(path, 0);
    write_staged(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Side file a commit writes before renaming it over `path`
fn staging_path(path: &Path, n: usize) -> PathBuf {
    path.with_extension(format!("json.{}.tmp", n))
}

async fn write_staged(tmp: &Path, content: &[u8]) -> Result<(), TlsError> {
    fs::write(tmp, content).await?;

    // Set restrictive permissions on private key material (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = fs::set_permissions(&tmp, permissions).await {
            warn!(path = ?tmp, error = %e, "Failed to set record file permissions");
        }
    }

    Ok(())
}

/// Sanitize domain name for use as filename
fn sanitize_domain(domain: &str) -> String {
    domain
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl CertificateStore for FileStore {
    async fn find_by_domain(&self, domain: &str) -> Result<Option<CertificateRecord>, TlsError> {
        self.read_record(domain).await
    }

    async fn find_candidates_for_refresh(
        &self,
        criteria: &RefreshCandidates,
    ) -> Result<Vec<CertificateRecord>, TlsError> {
        self.select(&Selection::RefreshCandidates(*criteria)).await
    }

    async fn list(
        &self,
        filter: &CertificateFilter,
        limit: usize,
    ) -> Result<Vec<CertificateRecord>, TlsError> {
        self.select(&Selection::Filtered {
            filter: filter.clone(),
            limit,
        })
        .await
    }

    async fn insert(&self, mut record: CertificateRecord) -> Result<CertificateRecord, TlsError> {
        let _guard = self.acquire().await?;

        let records = self.read_records().await?;
        if records.iter().any(|r| r.domain == record.domain) {
            return Err(TlsError::Storage(format!(
                "certificate for {} already exists",
                record.domain
            )));
        }
        // Sanitized file names may collide
        let path = self.cert_path(&record.domain);
        if fs::try_exists(&path).await? {
            return Err(TlsError::Storage(format!(
                "certificate file {:?} for {} belongs to another domain",
                path, record.domain
            )));
        }

        record.id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        record.updated_at = Utc::now();
        self.write_record(&record).await?;
        Ok(record)
    }

    async fn begin(&self) -> Result<Box<dyn CertificateTransaction>, TlsError> {
        let guard = self.acquire().await?;
        Ok(Box::new(FileTransaction {
            store: self.clone(),
            _guard: guard,
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl DomainResolver for FileStore {
    async fn resolve(&self, domain: &str) -> Result<Option<CertificateDescriptor>, TlsError> {
        Ok(self
            .find_by_domain(domain)
            .await?
            .filter(|record| !record.certificate.is_empty())
            .map(|record| record.descriptor()))
    }
}

enum StagedChange {
    Write(Box<CertificateRecord>),
    Delete(String),
}

struct FileTransaction {
    store: FileStore,
    _guard: StoreGuard,
    staged: Vec<StagedChange>,
}

#[async_trait]
impl CertificateTransaction for FileTransaction {
    async fn lock(&mut self, selection: &Selection) -> Result<Vec<CertificateRecord>, TlsError> {
        self.store.select(selection).await
    }

    async fn update(&mut self, record: &CertificateRecord) -> Result<(), TlsError> {
        let mut record = record.clone();
        record.updated_at = Utc::now();
        self.staged.push(StagedChange::Write(Box::new(record)));
        Ok(())
    }

    async fn delete(&mut self, domain: &str) -> Result<(), TlsError> {
        self.staged.push(StagedChange::Delete(domain.to_string()));
        Ok(())
    }

    /// Every document is written aside first; nothing becomes visible unless
    /// all of them were written.
    async fn commit(self: Box<Self>) -> Result<(), TlsError> {
        let mut prepared = Vec::new();
        for (n, change) in self.staged.iter().enumerate() {
            let StagedChange::Write(record) = change else {
                continue;
            };
            let path = self.store.cert_path(&record.domain);
            let tmp = staging_path(&path, n);
            let written = match serde_json::to_vec_pretty(record.as_ref()) {
                Ok(content) => write_staged(&tmp, &content).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = written {
                discard(prepared.iter().map(|(tmp, _)| tmp).chain([&tmp])).await;
                return Err(e);
            }
            prepared.push((tmp, path));
        }

        let mut prepared = prepared.into_iter();
        for change in &self.staged {
            match change {
                StagedChange::Write(record) => {
                    if let Some((tmp, path)) = prepared.next() {
                        fs::rename(&tmp, &path).await?;
                        debug!(domain = %record.domain, id = record.id, "Certificate record stored");
                    }
                }
                StagedChange::Delete(domain) => self.store.remove_record(domain).await?,
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TlsError> {
        debug!(changes = self.staged.len(), "Transaction rolled back");
        Ok(())
    }
}

async fn discard<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?path, error = %e, "Failed to remove staged record");
            }
        }
    }
}

#[async_trait]
impl AccountStore for FileStore {
    async fn begin_account(&self) -> Result<Box<dyn AccountTransaction>, TlsError> {
        let guard = self.acquire().await?;
        Ok(Box::new(FileAccountTransaction {
            store: self.clone(),
            _guard: guard,
            staged: None,
        }))
    }
}

struct FileAccountTransaction {
    store: FileStore,
    _guard: StoreGuard,
    staged: Option<AccountRecord>,
}

#[async_trait]
impl AccountTransaction for FileAccountTransaction {
    async fn load(&mut self) -> Result<Option<AccountRecord>, TlsError> {
        match fs::read(self.store.account_path()).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&mut self, record: AccountRecord) -> Result<(), TlsError> {
        if self.staged.is_some() || fs::try_exists(self.store.account_path()).await? {
            return Err(TlsError::Storage("account already exists".to_string()));
        }
        self.staged = Some(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), TlsError> {
        if let Some(record) = &self.staged {
            write_atomic(&self.store.account_path(), &serde_json::to_vec_pretty(record)?).await?;
            debug!(email = %record.email, "ACME account stored");
        }
        Ok(())
    }
}

/// Base64 for byte fields in JSON documents
mod serde_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod many {
        use super::*;

        pub fn serialize<S: Serializer>(
            blocks: &[Vec<u8>],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(blocks.iter().map(|b| STANDARD.encode(b)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Vec<u8>>, D::Error> {
            Vec::<String>::deserialize(deserializer)?
                .into_iter()
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}
