use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Product area a project-scoped event (or stream) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeType {
    SecretManager,
    CertManager,
    Kms,
    Ssh,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::SecretManager => "secret-manager",
            ScopeType::CertManager => "cert-manager",
            ScopeType::Kms => "kms",
            ScopeType::Ssh => "ssh",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event names exposed to stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublicEventKind {
    Create,
    Update,
    Delete,
    ImportMutation,
}

impl PublicEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicEventKind::Create => "create",
            PublicEventKind::Update => "update",
            PublicEventKind::Delete => "delete",
            PublicEventKind::ImportMutation => "import-mutation",
        }
    }
}

impl fmt::Display for PublicEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal business events as emitted by producers on the bus.
///
/// Several of these collapse onto a single [`PublicEventKind`]; clients only
/// ever see the public name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainEventKind {
    SecretCreated,
    SecretsBatchCreated,
    SecretUpdated,
    SecretsBatchUpdated,
    SecretRotated,
    SecretDeleted,
    SecretsBatchDeleted,
    SecretImportCreated,
    SecretImportUpdated,
    SecretImportDeleted,
    CertificateIssued,
    CertificateRenewed,
    CertificateRevoked,
}

impl DomainEventKind {
    pub fn public_kind(&self) -> PublicEventKind {
        match self {
            DomainEventKind::SecretCreated
            | DomainEventKind::SecretsBatchCreated
            | DomainEventKind::CertificateIssued => PublicEventKind::Create,
            DomainEventKind::SecretUpdated
            | DomainEventKind::SecretsBatchUpdated
            | DomainEventKind::SecretRotated
            | DomainEventKind::CertificateRenewed => PublicEventKind::Update,
            DomainEventKind::SecretDeleted
            | DomainEventKind::SecretsBatchDeleted
            | DomainEventKind::CertificateRevoked => PublicEventKind::Delete,
            DomainEventKind::SecretImportCreated
            | DomainEventKind::SecretImportUpdated
            | DomainEventKind::SecretImportDeleted => PublicEventKind::ImportMutation,
        }
    }
}

fn root_path() -> String {
    "/".to_string()
}

/// One affected resource. `path` and `environment` are the attributes
/// subscriptions are authorized against; everything else rides along in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default = "root_path")]
    pub path: String,
    pub environment: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    pub fn new(path: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            environment: environment.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Either a single record or an ordered batch of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Single(EventRecord),
    Batch(Vec<EventRecord>),
}

impl EventPayload {
    /// Builds a batch payload. Returns `None` for an empty batch.
    pub fn batch(records: Vec<EventRecord>) -> Option<Self> {
        if records.is_empty() {
            None
        } else {
            Some(EventPayload::Batch(records))
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        match self {
            EventPayload::Single(record) => std::slice::from_ref(record),
            EventPayload::Batch(records) => records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// An event as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub project_id: String,
    pub scope_type: ScopeType,
    pub kind: DomainEventKind,
    pub payload: EventPayload,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl BusEvent {
    pub fn public_kind(&self) -> PublicEventKind {
        self.kind.public_kind()
    }
}
