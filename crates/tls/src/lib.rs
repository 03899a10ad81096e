//! tls: certificate lifecycle for acme-proxy
//!
//! This crate verifies domain ownership, provisions certificates via ACME,
//! keeps them in an inventory, renews them in batches and picks the right one
//! for each TLS handshake by SNI.

pub mod acme;
pub mod cache;
pub mod challenge;
pub mod codec;
pub mod error;
pub mod listener;
pub mod renewal;
pub mod service;
pub mod sni;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod testing;

pub use acme::{AcmeAccount, AcmeClient, CaBackend, CertificateResource, InstantAcmeBackend};
pub use cache::{CachedMatch, MatchCache, MemoryMatchCache};
pub use challenge::ChallengeResponder;
pub use codec::CertificateDescriptor;
pub use error::TlsError;
pub use listener::SniAcceptor;
pub use renewal::{shutdown_channel, CertRefresher, RefreshScheduler, RefreshSettings};
pub use service::{bootstrap_account, CertificateService, CreateRequest, RefreshReport};
pub use sni::{CertMatcher, DomainResolver};
pub use storage::{
    CertificateFilter, CertificateInfo, CertificateStatus, FileStore, RefreshOptions,
};
pub use verify::{DomainVerifier, HttpDomainVerifier, VerifyError};

// ============================================================================
// ACME Certificate Authority URLs
// ============================================================================

/// Let's Encrypt production CA
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging CA (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ZeroSSL production CA
pub const ZEROSSL_PRODUCTION: &str = "https://acme.zerossl.com/v2/DV90";

/// Google Trust Services production CA
pub const GOOGLE_TRUST_SERVICES: &str = "https://dv.acme-v02.api.pki.goog/directory";

/// Buypass production CA
pub const BUYPASS_PRODUCTION: &str = "https://api.buypass.com/acme/directory";

/// Buypass test CA
pub const BUYPASS_STAGING: &str = "https://api.test4.buypass.no/acme/directory";

/// Resolve ACME CA URL from provider name or direct URL
///
/// Supported provider names (case-insensitive):
/// - `letsencrypt` or `le` - Let's Encrypt production
/// - `letsencrypt-staging` or `le-staging` - Let's Encrypt staging
/// - `zerossl` - ZeroSSL
/// - `google` or `gts` - Google Trust Services
/// - `buypass` - Buypass production
/// - `buypass-staging` - Buypass staging
///
/// If the input is already a URL (starts with `http`), it's returned as-is.
pub fn resolve_acme_ca(provider_or_url: &str) -> String {
    let normalized = provider_or_url.trim().to_lowercase();

    if normalized.starts_with("http://") || normalized.starts_with("https://") {
        return provider_or_url.trim().to_string();
    }

    match normalized.as_str() {
        "letsencrypt" | "le" | "letsencrypt-production" => LETS_ENCRYPT_PRODUCTION.to_string(),
        "letsencrypt-staging" | "le-staging" | "staging" => LETS_ENCRYPT_STAGING.to_string(),
        "zerossl" => ZEROSSL_PRODUCTION.to_string(),
        "google" | "gts" => GOOGLE_TRUST_SERVICES.to_string(),
        "buypass" => BUYPASS_PRODUCTION.to_string(),
        "buypass-staging" | "buypass-test" => BUYPASS_STAGING.to_string(),
        // Default to Let's Encrypt staging if unknown
        _ => {
            tracing::warn!(
                provider = %provider_or_url,
                "Unknown ACME provider, defaulting to Let's Encrypt staging"
            );
            LETS_ENCRYPT_STAGING.to_string()
        }
    }
}

/// Get a human-readable name for an ACME CA URL
pub fn get_acme_ca_name(url: &str) -> &'static str {
    match url {
        LETS_ENCRYPT_PRODUCTION => "Let's Encrypt",
        LETS_ENCRYPT_STAGING => "Let's Encrypt (Staging)",
        ZEROSSL_PRODUCTION => "ZeroSSL",
        GOOGLE_TRUST_SERVICES => "Google Trust Services",
        BUYPASS_PRODUCTION => "Buypass",
        BUYPASS_STAGING => "Buypass (Staging)",
        _ => "Custom CA",
    }
}
