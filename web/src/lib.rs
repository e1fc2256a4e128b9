use axum::http::{header, HeaderValue, Method};
use log::*;
use service::config::Config;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub mod auth;
pub mod error;
pub mod router;
pub mod sse;

mod controller;

// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sse_manager: Arc<::sse::Manager>,
}

impl AppState {
    pub fn new(config: Config, sse_manager: Arc<::sse::Manager>) -> Self {
        Self {
            config,
            sse_manager,
        }
    }
}

/// Bind the configured interface and serve until `shutdown` resolves.
///
/// Open event streams hold the server open, so `shutdown` should close the
/// SSE manager before it returns.
pub async fn init_server<F>(app_state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let host = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let server_url = format!("{host}:{}", app_state.config.port);
    let cors_layer = cors_layer(&app_state.config);

    let listener = TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    let router = router::define_routes(app_state).layer(cors_layer);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {origin:?}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use ::sse::auth::{AuthSnapshot, Authorizer, Identity, Principal, PrincipalKind};
    use ::sse::error::{authorization_error, AuthorizationErrorKind, Error};
    use ::sse::matcher::{Action, CapabilityMatcher, Rule};
    use ::sse::registry::{ActiveConnections, MemoryStore};
    use ::sse::{Manager, ManagerSettings};
    use async_trait::async_trait;
    use clap::Parser;
    use events::{EventBus, ScopeType};
    use secrecy::ExposeSecret;
    use service::config::Config;
    use std::sync::Arc;
    use std::time::Duration;

    /// Grants every secret manager event to "good-token" and rejects anything else.
    pub(crate) struct TokenAuthorizer;

    #[async_trait]
    impl Authorizer for TokenAuthorizer {
        async fn fetch(&self, identity: &Identity) -> Result<AuthSnapshot, Error> {
            match identity.bearer_token.expose_secret().as_str() {
                "good-token" => Ok(AuthSnapshot {
                    principal: Principal {
                        id: "user-1".to_string(),
                        kind: PrincipalKind::User,
                    },
                    tenant_id: "org-1".to_string(),
                    capabilities: CapabilityMatcher::compile(&[Rule {
                        subject: ScopeType::SecretManager,
                        action: Action::Manage,
                        conditions: None,
                        inverted: false,
                    }]),
                }),
                "revoked-token" => Err(authorization_error(
                    AuthorizationErrorKind::Forbidden,
                    "no access to project",
                )),
                _ => Err(authorization_error(
                    AuthorizationErrorKind::Unauthenticated,
                    "unknown token",
                )),
            }
        }
    }

    pub(crate) fn app_state(max_connections_per_principal: usize) -> AppState {
        let registry = Arc::new(ActiveConnections::new(
            Arc::new(MemoryStore::new()),
            "sse",
            Duration::from_secs(60),
        ));
        let manager = Manager::new(
            EventBus::new(),
            registry,
            Arc::new(TokenAuthorizer),
            ManagerSettings {
                max_connections_per_principal,
                ..Default::default()
            },
        );
        AppState::new(Config::parse_from(["event_gateway"]), Arc::new(manager))
    }
}
