//! SNI (Server Name Indication) certificate matching
//!
//! [`CertMatcher`] answers "which certificate for this handshake". It checks a
//! static set loaded from disk first, then asks a [`DomainResolver`] (the
//! certificate inventory), then repeats both for the wildcard form of the
//! name, and finally falls back to a configured default domain. Outcomes,
//! including misses, are cached per requested domain and invalidated per
//! parent suffix.

use crate::cache::{CachedMatch, MatchCache};
use crate::codec::{load_certificate_bundle, CertificateDescriptor};
use crate::error::TlsError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const PEM_BEGINNING: &[u8] = b"-----BEGIN";

/// Persistent lookup consulted after the static set
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Option<CertificateDescriptor>, TlsError>;
}

/// Certificate matcher shared by every handshake
pub struct CertMatcher {
    /// SAN key -> certificate, swapped whole on reload
    static_set: ArcSwap<BTreeMap<String, CertificateDescriptor>>,
    default_domain: Option<String>,
    cache: Arc<dyn MatchCache>,
    ttl: Duration,
}

impl std::fmt::Debug for CertMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertMatcher")
            .field("static", &self.static_set.load().keys().collect::<Vec<_>>())
            .field("default_domain", &self.default_domain)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CertMatcher {
    pub fn new(cache: Arc<dyn MatchCache>, ttl: Duration) -> Self {
        Self {
            static_set: ArcSwap::from_pointee(BTreeMap::new()),
            default_domain: None,
            cache,
            ttl,
        }
    }

    /// Domain whose certificate is served when nothing else matches
    pub fn with_default_domain(mut self, domain: Option<&str>) -> Self {
        self.default_domain = domain.map(normalize).filter(|d| !d.is_empty());
        self
    }

    pub fn default_domain(&self) -> Option<&str> {
        self.default_domain.as_deref()
    }

    /// Get number of statically loaded certificates
    pub fn static_count(&self) -> usize {
        self.static_set.load().len()
    }

    /// Add or replace a static certificate under its SAN key
    pub fn insert_static(&self, san_key: impl Into<String>, descriptor: CertificateDescriptor) {
        let san_key = san_key.into();
        self.static_set.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(san_key.clone(), descriptor.clone());
            next
        });
    }

    /// Load every bundle under `dir` into the static set.
    ///
    /// Files are grouped by folder: a `.pem` file is a bundle by itself, other
    /// PEM files in the same folder are concatenated into one bundle. Entries
    /// are merged by SAN key, later loads winning. Nothing is merged if any
    /// bundle fails to load.
    pub fn load_directory(&self, dir: &Path) -> Result<usize, TlsError> {
        let bundles = collect_bundles(dir)?;

        let mut loaded = Vec::with_capacity(bundles.len());
        for (source, raw) in bundles {
            let cert = load_certificate_bundle(&raw)
                .map_err(|e| e.context(format!("loading {}", source.display())))?;
            let san_key = cert.summary.san_key();
            debug!(source = ?source, san_key = %san_key, "Loaded static certificate");
            loaded.push((san_key, CertificateDescriptor::from_key(cert.chain, &cert.key)?));
        }

        self.static_set.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            for (san_key, descriptor) in &loaded {
                next.insert(san_key.clone(), descriptor.clone());
            }
            next
        });

        info!(path = ?dir, count = loaded.len(), "Loaded static certificates");
        Ok(loaded.len())
    }

    /// Find the certificate to present for `domain`
    pub async fn match_domain(
        &self,
        domain: &str,
        resolver: &dyn DomainResolver,
    ) -> Result<Option<CertificateDescriptor>, TlsError> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return match self.default_domain.as_deref() {
                Some(default) => Ok(self.match_cached(default, resolver).await?.into_descriptor()),
                None => Ok(None),
            };
        }

        let outcome = self.match_cached(&domain, resolver).await?;
        if outcome == CachedMatch::NotFound {
            if let Some(default) = self.default_domain.as_deref().filter(|d| *d != domain) {
                debug!(domain = %domain, default = %default, "No certificate, using default");
                return Ok(self.match_cached(default, resolver).await?.into_descriptor());
            }
        }

        Ok(outcome.into_descriptor())
    }

    /// Drop cached outcomes for every domain sharing `domain`'s parent suffix
    pub async fn invalidate(&self, domain: &str) -> Result<(), TlsError> {
        let scope = cache_scope(&normalize(domain));
        self.cache.invalidate(&scope).await
    }

    async fn match_cached(
        &self,
        domain: &str,
        resolver: &dyn DomainResolver,
    ) -> Result<CachedMatch, TlsError> {
        let scope = cache_scope(domain);
        match self.cache.get(&scope, domain).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!(domain = %domain, error = %e, "Match cache read failed"),
        }

        let mut found = self.match_single(domain, resolver).await?;
        if found.is_none() {
            if let Some(default) = self.default_domain.as_deref().filter(|d| *d != domain) {
                found = self.match_single(default, resolver).await?;
            }
        }

        let outcome = found.map_or(CachedMatch::NotFound, CachedMatch::Found);
        if let Err(e) = self.cache.set(&scope, domain, outcome.clone(), self.ttl).await {
            warn!(domain = %domain, error = %e, "Match cache write failed");
        }
        Ok(outcome)
    }

    async fn match_single(
        &self,
        domain: &str,
        resolver: &dyn DomainResolver,
    ) -> Result<Option<CertificateDescriptor>, TlsError> {
        if let Some(found) = self.lookup_static(domain) {
            return Ok(Some(found));
        }
        if let Some(found) = resolver.resolve(domain).await? {
            return Ok(Some(found));
        }

        let Some(wildcard) = wildcard(domain) else {
            return Ok(None);
        };
        if let Some(found) = self.lookup_static(&wildcard) {
            return Ok(Some(found));
        }
        resolver.resolve(&wildcard).await
    }

    fn lookup_static(&self, domain: &str) -> Option<CertificateDescriptor> {
        self.static_set
            .load()
            .iter()
            .find(|(sans, _)| sans.split(',').any(|san| san_matches(domain, san)))
            .map(|(_, descriptor)| descriptor.clone())
    }
}

/// Trimmed, lower-cased server name
pub fn normalize(domain: &str) -> String {
    domain.trim().to_lowercase()
}

/// Invalidation scope: the domain without its first label, with a leading dot
pub fn cache_scope(domain: &str) -> String {
    match domain.split_once('.') {
        Some((_, parent)) => format!(".{}", parent),
        None => ".".to_string(),
    }
}

/// First label replaced with `*`, for names of three or more labels
pub fn wildcard(domain: &str) -> Option<String> {
    let (_, parent) = domain.split_once('.')?;
    parent.contains('.').then(|| format!("*.{}", parent))
}

/// A SAN entry matches when equal to the domain, ignoring its trailing dots
fn san_matches(domain: &str, san: &str) -> bool {
    domain == san || domain == san.trim_end_matches('.')
}

/// Read PEM bundles under `dir`, grouped by folder
fn collect_bundles(dir: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>, TlsError> {
    let mut tree: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            TlsError::Io(std::io::Error::other(format!(
                "failed to scan certificate dir {}: {}",
                dir.display(),
                e
            )))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let folder = entry.path().parent().unwrap_or(dir).to_path_buf();
        tree.entry(folder).or_default().push(entry.into_path());
    }

    let mut bundles = Vec::new();
    for (folder, files) in tree {
        let mut combined = Vec::new();
        for file in files {
            let raw = std::fs::read(&file)?;

            if file.extension().is_some_and(|ext| ext == "pem") {
                bundles.push((file, raw));
                continue;
            }
            if !raw.starts_with(PEM_BEGINNING) {
                continue;
            }

            if !combined.is_empty() {
                combined.push(b'\n');
            }
            combined.extend_from_slice(&raw);
        }

        if !combined.is_empty() {
            bundles.push((folder, combined));
        }
    }

    Ok(bundles)
}
