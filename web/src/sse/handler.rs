use crate::error::{Error, Result};
use crate::AppState;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL};
use axum::http::{HeaderMap, HeaderName};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use events::ScopeType;
use futures_util::StreamExt;
use log::*;
use secrecy::SecretString;
use serde::Deserialize;
use sse::auth::Identity;
use sse::connection::OpenOptions;
use sse::error::{authorization_error, AuthorizationErrorKind};
use sse::matcher::RegisteredSubscription;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub project_id: String,
    pub scope_type: ScopeType,
    #[serde(default)]
    pub register: Vec<RegisteredSubscription>,
}

fn bearer_token(headers: &HeaderMap) -> Result<SecretString> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| SecretString::new(token.to_string()))
        .ok_or_else(|| {
            Error::from(authorization_error(
                AuthorizationErrorKind::Unauthenticated,
                "missing bearer token",
            ))
        })
}

/// POST open a long-lived event stream for one project and scope type.
///
/// Only events the caller registered for, and is currently allowed to see,
/// are written. The stream ends with an `error` event when access is
/// withdrawn.
pub(crate) async fn subscribe(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<SubscribeParams>,
) -> Result<impl IntoResponse> {
    let bearer_token = bearer_token(&headers)?;
    debug!(
        "Opening event stream for project {} ({})",
        params.project_id, params.scope_type
    );

    let subscription = app_state
        .sse_manager
        .subscribe(OpenOptions {
            identity: Identity {
                bearer_token,
                project_id: params.project_id.clone(),
            },
            project_id: params.project_id,
            scope_type: params.scope_type,
            subscriptions: params.register,
        })
        .await?;

    let stream = subscription
        .into_stream()
        .map(|item| item.map(Event::from));

    Ok((
        [(CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")],
        Sse::new(stream),
    ))
}

#[cfg(test)]
mod tests {
    use crate::router::define_routes;
    use crate::test_support::app_state;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn subscribe_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/events/subscribe")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = json!({
            "projectId": "project-1",
            "scopeType": "secret-manager",
            "register": [
                {"subject": "secret-manager", "action": "manage", "conditions": {"path": "/**"}}
            ]
        });
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_streams_with_proxy_friendly_headers() {
        let state = app_state(0);
        let manager = state.sse_manager.clone();

        let response = define_routes(state)
            .oneshot(subscribe_request(Some("good-token")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(manager.local_connection_count(), 1);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_missing_bearer_token_is_unauthorized() {
        let response = define_routes(app_state(0))
            .oneshot(subscribe_request(None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized_and_revoked_is_forbidden() {
        let unknown = define_routes(app_state(0))
            .oneshot(subscribe_request(Some("who-knows")))
            .await
            .unwrap();
        let revoked = define_routes(app_state(0))
            .oneshot(subscribe_request(Some("revoked-token")))
            .await
            .unwrap();

        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(revoked.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_connection_limit_is_too_many_requests() {
        let state = app_state(1);
        let manager = state.sse_manager.clone();
        let router = define_routes(state);

        let first = router
            .clone()
            .oneshot(subscribe_request(Some("good-token")))
            .await
            .unwrap();
        let second = router
            .oneshot(subscribe_request(Some("good-token")))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        drop(first);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = define_routes(app_state(0))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
