//! Authorization snapshots fetched from the permission service over HTTP.

use async_trait::async_trait;
use log::*;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::json;
use sse::auth::{AuthSnapshot, AuthSnapshotResponse, Authorizer, Identity};
use sse::error::{authorization_error, AuthorizationErrorKind, Error, ErrorKind};
use std::time::Duration;

/// Request timeout for a single snapshot fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

// Session-expired statuses used by the permission service and its gateway.
const STATUS_AUTHENTICATION_TIMEOUT: u16 = 419;
const STATUS_LOGIN_TIMEOUT: u16 = 440;

/// Calls the permission service with the caller's own bearer token.
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuthorizer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(format!("event-gateway/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

fn unavailable(err: reqwest::Error) -> Error {
    Error {
        source: Some(Box::new(err)),
        error_kind: ErrorKind::Authorization(AuthorizationErrorKind::Unavailable),
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn fetch(&self, identity: &Identity) -> Result<AuthSnapshot, Error> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(identity.bearer_token.expose_secret())
            .json(&json!({ "projectId": identity.project_id }))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let snapshot: AuthSnapshotResponse = response.json().await.map_err(unavailable)?;
                trace!(
                    "Fetched authorization snapshot for principal {}",
                    snapshot.principal.id
                );
                Ok(snapshot.into())
            }
            StatusCode::UNAUTHORIZED => Err(authorization_error(
                AuthorizationErrorKind::Unauthenticated,
                "bearer token was rejected",
            )),
            StatusCode::FORBIDDEN => Err(authorization_error(
                AuthorizationErrorKind::Forbidden,
                "no access to the requested project",
            )),
            _ if matches!(
                status.as_u16(),
                STATUS_AUTHENTICATION_TIMEOUT | STATUS_LOGIN_TIMEOUT
            ) =>
            {
                Err(authorization_error(
                    AuthorizationErrorKind::Expired,
                    "session expired",
                ))
            }
            _ => {
                warn!("Permission service answered with unexpected status {status}");
                Err(authorization_error(
                    AuthorizationErrorKind::Unavailable,
                    &format!("permission service returned {status}"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::{EventRecord, PublicEventKind, ScopeType};
    use secrecy::SecretString;
    use sse::matcher::Candidate;

    fn identity() -> Identity {
        Identity {
            bearer_token: SecretString::new("caller-token".to_string()),
            project_id: "project-1".to_string(),
        }
    }

    async fn fetch_with_status(status: usize) -> Result<AuthSnapshot, Error> {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/authorize")
            .with_status(status)
            .create_async()
            .await;

        HttpAuthorizer::new(format!("{}/authorize", server.url()))
            .unwrap()
            .fetch(&identity())
            .await
    }

    #[tokio::test]
    async fn test_fetch_sends_caller_token_and_parses_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/authorize")
            .match_header("authorization", "Bearer caller-token")
            .match_body(mockito::Matcher::Json(json!({"projectId": "project-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "principal": {"id": "user-1", "kind": "user"},
                    "tenantId": "org-1",
                    "capabilities": [
                        {
                            "subject": "secret-manager",
                            "action": "subscribe-to-update-events",
                            "conditions": {"environment": "dev"}
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let snapshot = HttpAuthorizer::new(format!("{}/authorize", server.url()))
            .unwrap()
            .fetch(&identity())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(snapshot.tenant_id, "org-1");
        let dev = EventRecord::new("/app", "dev");
        let prod = EventRecord::new("/app", "prod");
        let update = |record| Candidate {
            kind: PublicEventKind::Update,
            record,
        };
        assert!(snapshot.capabilities.allows(ScopeType::SecretManager, &update(&dev)));
        assert!(!snapshot.capabilities.allows(ScopeType::SecretManager, &update(&prod)));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_authorization_kinds() {
        let cases = [
            (401, AuthorizationErrorKind::Unauthenticated),
            (403, AuthorizationErrorKind::Forbidden),
            (419, AuthorizationErrorKind::Expired),
            (440, AuthorizationErrorKind::Expired),
            (500, AuthorizationErrorKind::Unavailable),
            (404, AuthorizationErrorKind::Unavailable),
        ];

        for (status, kind) in cases {
            let err = fetch_with_status(status).await.unwrap_err();
            assert_eq!(err.error_kind, ErrorKind::Authorization(kind), "status {status}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Port 9 (discard) is not expected to serve HTTP.
        let err = HttpAuthorizer::new("http://127.0.0.1:9/authorize")
            .unwrap()
            .fetch(&identity())
            .await
            .unwrap_err();

        assert!(!err.is_recoverable_authorization());
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/authorize")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = HttpAuthorizer::new(format!("{}/authorize", server.url()))
            .unwrap()
            .fetch(&identity())
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::Authorization(AuthorizationErrorKind::Unavailable)
        );
    }
}
