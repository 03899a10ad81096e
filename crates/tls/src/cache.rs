//! Match cache
//!
//! Results of certificate lookups keyed by requested domain and grouped under
//! an invalidation scope (the domain's parent suffix). A lookup that found
//! nothing is cached too, as [`CachedMatch::NotFound`], so that a miss can be
//! told apart from an absent entry.

use crate::codec::CertificateDescriptor;
use crate::error::TlsError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cached outcome of a certificate lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedMatch {
    Found(CertificateDescriptor),
    NotFound,
}

impl CachedMatch {
    pub fn into_descriptor(self) -> Option<CertificateDescriptor> {
        match self {
            CachedMatch::Found(descriptor) => Some(descriptor),
            CachedMatch::NotFound => None,
        }
    }
}

/// Scoped key/value cache with TTL
#[async_trait]
pub trait MatchCache: Send + Sync {
    /// `Ok(None)` means no live entry, not a negative result
    async fn get(&self, scope: &str, key: &str) -> Result<Option<CachedMatch>, TlsError>;

    async fn set(
        &self,
        scope: &str,
        key: &str,
        value: CachedMatch,
        ttl: Duration,
    ) -> Result<(), TlsError>;

    /// Drop every entry stored under `scope`
    async fn invalidate(&self, scope: &str) -> Result<(), TlsError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedMatch,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Process-local [`MatchCache`]
#[derive(Debug, Default)]
pub struct MemoryMatchCache {
    scopes: DashMap<String, HashMap<String, CacheEntry>>,
}

impl MemoryMatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries across all scopes
    pub fn len(&self) -> usize {
        self.scopes
            .iter()
            .map(|scope| scope.values().filter(|e| e.is_valid()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries and empty scopes
    pub fn purge_expired(&self) {
        self.scopes.retain(|_, entries| {
            entries.retain(|_, entry| entry.is_valid());
            !entries.is_empty()
        });
    }
}

#[async_trait]
impl MatchCache for MemoryMatchCache {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<CachedMatch>, TlsError> {
        let Some(entries) = self.scopes.get(scope) else {
            return Ok(None);
        };
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        scope: &str,
        key: &str,
        value: CachedMatch,
        ttl: Duration,
    ) -> Result<(), TlsError> {
        self.scopes.entry(scope.to_string()).or_default().insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, scope: &str) -> Result<(), TlsError> {
        if let Some((_, entries)) = self.scopes.remove(scope) {
            debug!(scope = %scope, entries = entries.len(), "Match cache scope invalidated");
        }
        Ok(())
    }
}
