//! SNI-aware TLS termination
//!
//! The ClientHello is read before any certificate is chosen. Its server name
//! goes through the [`CertMatcher`], and the handshake then completes with a
//! one-off server config carrying the matched chain and key.

use crate::error::TlsError;
use crate::sni::{normalize, CertMatcher, DomainResolver};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{version, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// Default deadline for one handshake's certificate lookup
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Serves the same certificate whatever the hello says
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// TLS acceptor choosing its certificate per connection
#[derive(Clone)]
pub struct SniAcceptor {
    matcher: Arc<CertMatcher>,
    resolver: Arc<dyn DomainResolver>,
    fetch_timeout: Duration,
    alpn_protocols: Vec<Vec<u8>>,
}

impl SniAcceptor {
    pub fn new(matcher: Arc<CertMatcher>, resolver: Arc<dyn DomainResolver>) -> Self {
        Self {
            matcher,
            resolver,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            alpn_protocols: Vec::new(),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Advertise HTTP/1.1 over ALPN
    pub fn enable_http11(&mut self) {
        self.alpn_protocols = vec![b"http/1.1".to_vec()];
    }

    /// Run the server side of a handshake on `stream`
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let server_name = start
            .client_hello()
            .server_name()
            .map(normalize)
            .unwrap_or_default();

        let certified = self.certified_key(&server_name).await?;
        let config = self.server_config(certified)?;

        let stream = start.into_stream(config).await?;
        debug!(server_name = %server_name, "TLS handshake completed");
        Ok(stream)
    }

    async fn certified_key(&self, server_name: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let lookup = self.matcher.match_domain(server_name, self.resolver.as_ref());
        let descriptor = tokio::time::timeout(self.fetch_timeout, lookup)
            .await
            .map_err(|_| TlsError::Timeout(format!("certificate lookup for {:?}", server_name)))??
            .ok_or_else(|| TlsError::NoCertificate(server_name.to_string()))?;

        descriptor.certified_key()
    }

    fn server_config(&self, certified: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&version::TLS12, &version::TLS13])
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCertResolver(certified)));

        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}
