//! Shared fixtures for the unit tests in this crate.

use crate::auth::{AuthSnapshot, Authorizer, Identity, Principal, PrincipalKind};
use crate::connection::{OpenOptions, Outbound};
use crate::error::Error;
use crate::matcher::{Action, CapabilityMatcher, Conditions, RegisteredSubscription, Rule};
use crate::registry::{ActiveConnections, MemoryStore};
use async_trait::async_trait;
use events::ScopeType;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const TENANT: &str = "org-1";
pub(crate) const PRINCIPAL: &str = "user-1";
pub(crate) const PROJECT: &str = "project-1";

pub(crate) fn grant_all() -> Vec<Rule> {
    vec![Rule {
        subject: ScopeType::SecretManager,
        action: Action::Manage,
        conditions: None,
        inverted: false,
    }]
}

pub(crate) fn snapshot_with(rules: &[Rule]) -> AuthSnapshot {
    AuthSnapshot {
        principal: Principal {
            id: PRINCIPAL.to_string(),
            kind: PrincipalKind::User,
        },
        tenant_id: TENANT.to_string(),
        capabilities: CapabilityMatcher::compile(rules),
    }
}

/// Answers fetches from a script, then grants everything once the script runs out.
pub(crate) struct ScriptedAuthorizer {
    script: Mutex<VecDeque<Result<AuthSnapshot, Error>>>,
    calls: AtomicUsize,
}

impl ScriptedAuthorizer {
    pub(crate) fn granting() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub(crate) fn scripted(script: Vec<Result<AuthSnapshot, Error>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn push(&self, response: Result<AuthSnapshot, Error>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn fetch(&self, _identity: &Identity) -> Result<AuthSnapshot, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(snapshot_with(&grant_all())))
    }
}

/// Bearer token whose fetches never complete after the first one.
pub(crate) const STALLED_TOKEN: &str = "stalled-token";

/// Grants every fetch, except that a [`STALLED_TOKEN`] identity hangs on
/// every fetch after its first.
#[derive(Default)]
pub(crate) struct StallingAuthorizer {
    stalled_fetches: AtomicUsize,
}

impl StallingAuthorizer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetches that are hanging right now.
    pub(crate) fn stalled(&self) -> usize {
        self.stalled_fetches.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[async_trait]
impl Authorizer for StallingAuthorizer {
    async fn fetch(&self, identity: &Identity) -> Result<AuthSnapshot, Error> {
        if identity.bearer_token.expose_secret().as_str() == STALLED_TOKEN
            && self.stalled_fetches.fetch_add(1, Ordering::SeqCst) > 0
        {
            std::future::pending::<()>().await;
        }
        Ok(snapshot_with(&grant_all()))
    }
}

/// Grants everything after a fixed delay.
pub(crate) struct SlowAuthorizer(pub(crate) Duration);

#[async_trait]
impl Authorizer for SlowAuthorizer {
    async fn fetch(&self, _identity: &Identity) -> Result<AuthSnapshot, Error> {
        tokio::time::sleep(self.0).await;
        Ok(snapshot_with(&grant_all()))
    }
}

pub(crate) fn registry(store: Arc<MemoryStore>) -> Arc<ActiveConnections> {
    Arc::new(ActiveConnections::new(store, "sse", Duration::from_secs(60)))
}

pub(crate) fn subscribe_everything(scope_type: ScopeType) -> Vec<RegisteredSubscription> {
    vec![RegisteredSubscription {
        subject: scope_type,
        action: Action::Manage,
        conditions: Some(Conditions {
            path: Some("/**".to_string()),
            environment: None,
        }),
    }]
}

pub(crate) fn open_options(
    scope_type: ScopeType,
    subscriptions: Vec<RegisteredSubscription>,
) -> OpenOptions {
    OpenOptions {
        identity: Identity {
            bearer_token: SecretString::new("token".to_string()),
            project_id: PROJECT.to_string(),
        },
        project_id: PROJECT.to_string(),
        scope_type,
        subscriptions,
    }
}

/// Every secret manager event, under a default identity.
pub(crate) fn secrets_options() -> OpenOptions {
    open_options(
        ScopeType::SecretManager,
        subscribe_everything(ScopeType::SecretManager),
    )
}

/// Same as [`secrets_options`] with another bearer token.
pub(crate) fn secrets_options_with_token(token: &str) -> OpenOptions {
    let mut options = secrets_options();
    options.identity.bearer_token = SecretString::new(token.to_string());
    options
}

/// Everything currently buffered in a receiver, without waiting.
pub(crate) fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}
