//! Plain HTTP boundary
//!
//! Answers the echo ownership check, ACME HTTP-01 challenges and
//! `/health`. Anything else is a 404; request routing lives elsewhere.

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tls::ChallengeResponder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const HEALTH_PATH: &str = "/health";

/// Build the response for one request
pub fn respond<B>(responder: &ChallengeResponder, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let path = req.uri().path();
    if path == HEALTH_PATH {
        return text(StatusCode::OK, "OK");
    }

    match responder.respond(path) {
        Ok(Some(body)) => {
            debug!(path = %path, "Answered challenge");
            text(StatusCode::OK, body)
        }
        Ok(None) => text(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            error!(path = %path, error = %e, "Failed to answer challenge");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    response
}

/// Serve HTTP/1.1 on one connection
pub async fn serve_connection<IO>(io: IO, responder: ChallengeResponder)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let response = respond(&responder, &req);
        async move { Ok::<_, std::convert::Infallible>(response) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        let msg = e.to_string();
        if !msg.contains("connection closed") && !msg.contains("not connected") {
            debug!(error = %e, "HTTP connection error");
        }
    }
}

/// Accept connections until shutdown is signalled
pub async fn serve(
    listener: TcpListener,
    responder: ChallengeResponder,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, responder.clone()));
                    }
                    Err(e) => error!(error = %e, "Failed to accept HTTP connection"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("HTTP listener shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tls::codec::PrivateKey;
    use tls::{AcmeAccount, AcmeClient, InstantAcmeBackend};

    async fn responder() -> (ChallengeResponder, String) {
        let key = PrivateKey::generate_ec();
        let thumbprint = key.jwk_thumbprint().unwrap();
        let acme = Arc::new(AcmeClient::new(Arc::new(InstantAcmeBackend::new(
            "http://127.0.0.1:1/directory",
        ))));
        acme.initialize_account(AcmeAccount {
            email: "admin@example.com".to_string(),
            key: Some(key),
            registration: Some(serde_json::json!({})),
        })
        .await
        .unwrap();
        (ChallengeResponder::new(acme), thumbprint)
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_echo() {
        let (responder, _) = responder().await;
        let response = respond(&responder, &get("/.well-known/echo/Xy12AbCd/"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "Xy12AbCd");
    }

    #[tokio::test]
    async fn test_acme_challenge() {
        let (responder, thumbprint) = responder().await;
        let response = respond(&responder, &get("/.well-known/acme-challenge/tok"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, format!("tok.{}", thumbprint));
    }

    #[tokio::test]
    async fn test_health_and_unknown() {
        let (responder, _) = responder().await;
        assert_eq!(respond(&responder, &get("/health")).status(), StatusCode::OK);
        assert_eq!(respond(&responder, &get("/index.html")).status(), StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .body(())
            .unwrap();
        assert_eq!(respond(&responder, &post).status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_uninitialized_account_is_server_error() {
        let acme = Arc::new(AcmeClient::new(Arc::new(InstantAcmeBackend::new(
            "http://127.0.0.1:1/directory",
        ))));
        let responder = ChallengeResponder::new(acme);
        let response = respond(&responder, &get("/.well-known/acme-challenge/tok"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
