//! Domain ownership verification
//!
//! Before a certificate is issued or renewed the proxy proves it is actually
//! fronting the domain: the name must resolve, and a plain HTTP request for
//! `/.well-known/echo/<token>/` on that domain must come back with `<token>`.
//! Only a proxy instance serving the echo endpoint can answer that.

use crate::challenge::ECHO_PREFIX;
use crate::error::TlsError;
use crate::storage::CertificateStatus;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Length of the random echo token
pub const ECHO_TOKEN_LENGTH: usize = 8;

/// Why a domain failed verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("domain does not resolve: {0}")]
    InvalidDomain(String),

    #[error("domain verification failed: {0}")]
    VerificationFailed(String),
}

impl VerifyError {
    /// Status a certificate record takes on for this failure
    pub fn status(&self) -> CertificateStatus {
        match self {
            VerifyError::InvalidDomain(_) => CertificateStatus::InvalidDomain,
            VerifyError::VerificationFailed(_) => CertificateStatus::DomainVerificationFailed,
        }
    }
}

/// Ownership check run before acting on a domain
#[async_trait]
pub trait DomainVerifier: Send + Sync {
    /// Both steps share the `timeout` budget
    async fn verify(&self, domain: &str, timeout: Duration) -> Result<(), VerifyError>;
}

/// DNS lookup followed by an HTTP echo round trip
#[derive(Debug, Clone)]
pub struct HttpDomainVerifier {
    client: reqwest::Client,
    port: u16,
}

impl HttpDomainVerifier {
    pub fn new() -> Result<Self, TlsError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, port: 80 })
    }

    /// Port the echo request is sent to
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn echo_url(&self, domain: &str, token: &str) -> String {
        if self.port == 80 {
            format!("http://{}{}{}/", domain, ECHO_PREFIX, token)
        } else {
            format!("http://{}:{}{}{}/", domain, self.port, ECHO_PREFIX, token)
        }
    }

    async fn check_domain(&self, domain: &str, deadline: Instant) -> Result<(), VerifyError> {
        let lookup = tokio::time::timeout_at(deadline, tokio::net::lookup_host((domain, self.port)));
        match lookup.await {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    Ok(())
                } else {
                    Err(VerifyError::InvalidDomain(format!("{} has no addresses", domain)))
                }
            }
            Ok(Err(e)) => Err(VerifyError::InvalidDomain(e.to_string())),
            Err(_) => Err(VerifyError::InvalidDomain("lookup timed out".to_string())),
        }
    }

    async fn verify_echo(&self, domain: &str, deadline: Instant) -> Result<(), VerifyError> {
        let token = echo_token();
        let url = self.echo_url(domain, &token);
        debug!(domain = %domain, url = %url, "Sending echo challenge");

        let request = async {
            let response = self.client.get(&url).send().await?.error_for_status()?;
            response.bytes().await
        };

        match tokio::time::timeout_at(deadline, request).await {
            Ok(Ok(body)) if body.as_ref() == token.as_bytes() => Ok(()),
            Ok(Ok(_)) => Err(VerifyError::VerificationFailed("keys mismatch".to_string())),
            Ok(Err(e)) => Err(VerifyError::VerificationFailed(e.to_string())),
            Err(_) => Err(VerifyError::VerificationFailed(
                "echo request timed out".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DomainVerifier for HttpDomainVerifier {
    async fn verify(&self, domain: &str, timeout: Duration) -> Result<(), VerifyError> {
        let deadline = Instant::now() + timeout;
        self.check_domain(domain, deadline).await?;
        self.verify_echo(domain, deadline).await
    }
}

fn echo_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ECHO_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    enum Behaviour {
        Reflect,
        Reply(&'static str),
        Hang,
    }

    /// Minimal HTTP/1.1 server answering echo requests on a local port
    async fn echo_server(behaviour: Behaviour) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();

                let body = match &behaviour {
                    Behaviour::Reflect => path
                        .trim_start_matches(ECHO_PREFIX)
                        .trim_end_matches('/')
                        .to_string(),
                    Behaviour::Reply(body) => body.to_string(),
                    Behaviour::Hang => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        continue;
                    }
                };

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        port
    }

    #[test]
    fn test_echo_token() {
        let token = echo_token();
        assert_eq!(token.len(), ECHO_TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, echo_token());
    }

    #[test]
    fn test_echo_url() {
        let verifier = HttpDomainVerifier::new().unwrap();
        assert_eq!(
            verifier.echo_url("example.com", "abc"),
            "http://example.com/.well-known/echo/abc/"
        );
        assert_eq!(
            verifier.with_port(8000).echo_url("example.com", "abc"),
            "http://example.com:8000/.well-known/echo/abc/"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            VerifyError::InvalidDomain(String::new()).status(),
            CertificateStatus::InvalidDomain
        );
        assert_eq!(
            VerifyError::VerificationFailed(String::new()).status(),
            CertificateStatus::DomainVerificationFailed
        );
    }

    #[tokio::test]
    async fn test_verify_success() {
        let port = echo_server(Behaviour::Reflect).await;
        let verifier = HttpDomainVerifier::new().unwrap().with_port(port);

        verifier
            .verify("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        let port = echo_server(Behaviour::Reply("deadbeef")).await;
        let verifier = HttpDomainVerifier::new().unwrap().with_port(port);

        let err = verifier
            .verify("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::VerificationFailed("keys mismatch".to_string()));
    }

    #[tokio::test]
    async fn test_verify_timeout_is_verification_failure() {
        let port = echo_server(Behaviour::Hang).await;
        let verifier = HttpDomainVerifier::new().unwrap().with_port(port);

        let err = verifier
            .verify("127.0.0.1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.status(), CertificateStatus::DomainVerificationFailed);
    }

    #[tokio::test]
    async fn test_verify_unresolvable() {
        let verifier = HttpDomainVerifier::new().unwrap();
        let err = verifier
            .verify("bad.invalid", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.status(), CertificateStatus::InvalidDomain);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let verifier = HttpDomainVerifier::new().unwrap().with_port(port);
        let err = verifier
            .verify("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.status(), CertificateStatus::DomainVerificationFailed);
    }
}
