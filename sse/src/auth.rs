//! Authorization snapshot types and the fetch boundary.

use crate::error::Error;
use crate::matcher::{CapabilityMatcher, Rule};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
}

/// Caller credentials and the project a stream is requested for.
#[derive(Debug, Clone)]
pub struct Identity {
    pub bearer_token: SecretString,
    pub project_id: String,
}

/// Permission state of a principal at one point in time.
///
/// Replaced whole on every refresh; never mutated in place.
#[derive(Debug)]
pub struct AuthSnapshot {
    pub principal: Principal,
    pub tenant_id: String,
    pub capabilities: CapabilityMatcher,
}

/// Wire shape returned by the permission service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSnapshotResponse {
    pub principal: Principal,
    pub tenant_id: String,
    #[serde(default)]
    pub capabilities: Vec<Rule>,
}

impl From<AuthSnapshotResponse> for AuthSnapshot {
    fn from(response: AuthSnapshotResponse) -> Self {
        Self {
            principal: response.principal,
            tenant_id: response.tenant_id,
            capabilities: CapabilityMatcher::compile(&response.capabilities),
        }
    }
}

/// Fetches the current permission state for an identity.
///
/// Implementations report revocations and expired credentials with the
/// recoverable authorization error kinds and everything else as
/// `AuthorizationErrorKind::Unavailable`.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn fetch(&self, identity: &Identity) -> Result<AuthSnapshot, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Candidate;
    use events::{EventRecord, PublicEventKind, ScopeType};

    #[test]
    fn test_snapshot_response_compiles_capabilities() {
        let response: AuthSnapshotResponse = serde_json::from_value(serde_json::json!({
            "principal": {"id": "user-1", "kind": "user"},
            "tenantId": "org-1",
            "capabilities": [
                {"subject": "secret-manager", "action": "manage"}
            ]
        }))
        .unwrap();

        let snapshot = AuthSnapshot::from(response);
        let record = EventRecord::new("/anything", "dev");

        assert_eq!(snapshot.principal.kind, PrincipalKind::User);
        assert!(snapshot.capabilities.allows(
            ScopeType::SecretManager,
            &Candidate {
                kind: PublicEventKind::Create,
                record: &record,
            }
        ));
    }

    #[test]
    fn test_snapshot_response_without_capabilities_denies_everything() {
        let response: AuthSnapshotResponse = serde_json::from_value(serde_json::json!({
            "principal": {"id": "machine-1", "kind": "identity"},
            "tenantId": "org-1"
        }))
        .unwrap();

        assert!(AuthSnapshot::from(response).capabilities.is_empty());
    }
}
