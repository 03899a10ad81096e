//! Well-known HTTP responders
//!
//! The plain HTTP boundary answers two kinds of challenge:
//!
//! - `/.well-known/acme-challenge/<token>`: the CA's HTTP-01 check, answered
//!   with `<token>.<account thumbprint>`.
//! - `/.well-known/echo/<token>/`: the proxy's own ownership check (see
//!   [`crate::verify`]), answered with `<token>` verbatim.

use crate::acme::AcmeClient;
use crate::error::TlsError;
use std::sync::Arc;

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
pub const ECHO_PREFIX: &str = "/.well-known/echo/";

/// Token carried by an echo path
pub fn echo_token(path: &str) -> Option<&str> {
    let token = path.strip_prefix(ECHO_PREFIX)?;
    let token = token.strip_suffix('/').unwrap_or(token);
    (!token.is_empty() && !token.contains('/')).then_some(token)
}

/// Answers challenge paths for the HTTP boundary
#[derive(Clone)]
pub struct ChallengeResponder {
    acme: Arc<AcmeClient>,
}

impl ChallengeResponder {
    pub fn new(acme: Arc<AcmeClient>) -> Self {
        Self { acme }
    }

    /// HTTP-01 key authorization for `token`
    pub fn key_authorization(&self, token: &str) -> Result<String, TlsError> {
        Ok(format!("{}.{}", token, self.acme.thumbprint()?))
    }

    /// Response body for a challenge path, `None` when the path is not one
    pub fn respond(&self, path: &str) -> Result<Option<String>, TlsError> {
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            if token.is_empty() || token.contains('/') {
                return Ok(None);
            }
            return self.key_authorization(token).map(Some);
        }

        Ok(echo_token(path).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::AcmeAccount;
    use crate::codec::PrivateKey;
    use crate::testing::FakeCa;

    async fn responder() -> (ChallengeResponder, String) {
        let key = PrivateKey::generate_ec();
        let thumbprint = key.jwk_thumbprint().unwrap();
        let acme = Arc::new(AcmeClient::new(Arc::new(FakeCa::new())));
        acme.initialize_account(AcmeAccount {
            email: "admin@example.com".to_string(),
            key: Some(key),
            registration: Some(serde_json::json!({})),
        })
        .await
        .unwrap();
        (ChallengeResponder::new(acme), thumbprint)
    }

    #[test]
    fn test_echo_token() {
        assert_eq!(echo_token("/.well-known/echo/abc123/"), Some("abc123"));
        assert_eq!(echo_token("/.well-known/echo/abc123"), Some("abc123"));
        assert_eq!(echo_token("/.well-known/echo/"), None);
        assert_eq!(echo_token("/.well-known/echo/a/b"), None);
        assert_eq!(echo_token("/other"), None);
    }

    #[tokio::test]
    async fn test_acme_challenge() {
        let (responder, thumbprint) = responder().await;
        assert_eq!(
            responder
                .respond("/.well-known/acme-challenge/tok3n")
                .unwrap(),
            Some(format!("tok3n.{}", thumbprint))
        );
        assert_eq!(responder.respond("/.well-known/acme-challenge/").unwrap(), None);
    }

    #[tokio::test]
    async fn test_echo_and_unknown() {
        let (responder, _) = responder().await;
        assert_eq!(
            responder.respond("/.well-known/echo/Ab3dEf9h/").unwrap(),
            Some("Ab3dEf9h".to_string())
        );
        assert_eq!(responder.respond("/index.html").unwrap(), None);
    }

    #[test]
    fn test_uninitialized_account() {
        let responder = ChallengeResponder::new(Arc::new(AcmeClient::new(Arc::new(FakeCa::new()))));
        assert!(responder.respond("/.well-known/acme-challenge/tok3n").is_err());
    }
}
