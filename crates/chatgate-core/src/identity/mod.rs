use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::warn;

use crate::config::Config;
use crate::error::AuthError;
use crate::types::Identity;
use crate::util::http;

/// Address used when neither a forwarded-for header nor a transport peer
/// is available.
pub const UNKNOWN_ADDR: &str = "0.0.0.0";

/// An externally authenticated account.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// Validates a bearer token against the external identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError>;
}

/// GoTrue verifier: the Supabase project's `/auth/v1/user` endpoint
/// resolves a user token into `{id, email}`.
pub struct GotrueVerifier {
    url: String,
    api_key: String,
}

impl GotrueVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            url: format!("{}/auth/v1/user", config.auth_url().trim_end_matches('/')),
            api_key: config.store.service_key.clone(),
        }
    }
}

#[async_trait]
impl TokenVerifier for GotrueVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let response = http::client()
            .get(&self.url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AuthError::InvalidToken);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Upstream(format!("{status}: {message}")));
        }

        response
            .json::<AuthUser>()
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))
    }
}

/// Best-effort resolution for the chat path: any failure degrades to a
/// guest identity instead of surfacing an error (fails open by policy;
/// `require_user` is the strict counterpart).
pub async fn resolve(
    verifier: &dyn TokenVerifier,
    bearer: Option<&str>,
    fingerprint: &str,
    address: &str,
) -> Identity {
    if let Some(token) = bearer {
        match verifier.verify(token).await {
            Ok(user) => {
                return Identity::User {
                    id: user.id,
                    email: user.email,
                }
            }
            Err(e) => warn!("Auth error, treating caller as guest: {}", e),
        }
    }
    Identity::Guest {
        fingerprint: fingerprint.to_string(),
        address: address.to_string(),
    }
}

/// Strict resolution for the stats path: a missing or bad credential is
/// an error (fails closed by policy).
pub async fn require_user(
    verifier: &dyn TokenVerifier,
    bearer: Option<&str>,
) -> Result<AuthUser, AuthError> {
    let token = bearer.ok_or(AuthError::MissingCredential)?;
    verifier.verify(token).await
}

/// Extract the bearer token from an Authorization header value.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Originating client address. The first forwarded-for entry wins (only
/// trustworthy behind a reverse proxy that sets it), then the transport
/// peer, then the unspecified sentinel.
pub fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ADDR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    struct FailingVerifier;

    #[async_trait]
    impl TokenVerifier for FailingVerifier {
        async fn verify(&self, _token: &str) -> Result<AuthUser, AuthError> {
            Err(AuthError::InvalidToken)
        }
    }

    struct StaticVerifier(AuthUser);

    #[async_trait]
    impl TokenVerifier for StaticVerifier {
        async fn verify(&self, _token: &str) -> Result<AuthUser, AuthError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_resolve_without_credential_is_guest() {
        let identity = resolve(&FailingVerifier, None, "fp1", "1.2.3.4").await;
        assert_eq!(
            identity,
            Identity::Guest {
                fingerprint: "fp1".into(),
                address: "1.2.3.4".into()
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_swallows_auth_failure() {
        let identity = resolve(&FailingVerifier, Some("bad-token"), "fp1", "1.2.3.4").await;
        assert!(identity.is_guest());
    }

    #[tokio::test]
    async fn test_resolve_valid_token_is_user() {
        let verifier = StaticVerifier(AuthUser {
            id: "u1".into(),
            email: "u1@example.com".into(),
        });
        let identity = resolve(&verifier, Some("token"), "fp1", "1.2.3.4").await;
        assert_eq!(identity.user_id(), Some("u1"));
    }

    #[tokio::test]
    async fn test_require_user_fails_closed() {
        let verifier = StaticVerifier(AuthUser {
            id: "u1".into(),
            email: String::new(),
        });
        assert!(matches!(
            require_user(&verifier, None).await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            require_user(&FailingVerifier, Some("t")).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(require_user(&verifier, Some("t")).await.is_ok());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_client_addr_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1, 10.0.0.2"),
        );
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();
        assert_eq!(client_addr(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_client_addr_falls_back_to_peer_then_sentinel() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();
        assert_eq!(client_addr(&headers, Some(peer)), "192.0.2.1");
        assert_eq!(client_addr(&headers, None), UNKNOWN_ADDR);
    }
}
