//! Fleet-wide connection liveness.
//!
//! Every gateway process records its open streams in a shared TTL store so
//! that any process can count a principal's live connections. Each connection
//! owns a marker key that expires unless a heartbeat renews it; a per-principal
//! set lists the connection ids. An id whose marker has expired is stale and is
//! pruned from the set the next time the set is counted.
//!
//! Key layout:
//!
//! - `{prefix}:active:{tenant}:{principal}`: set of connection ids
//! - `{prefix}:active:{tenant}:{principal}:{connection}`: liveness marker

use crate::error::Error;
use async_trait::async_trait;
use log::*;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Minimal TTL key/set operations the registry needs from its backing store.
///
/// Implementations must be safe under concurrent use from many processes; the
/// registry relies on each individual operation being atomic in the store.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<(), Error>;

    async fn members(&self, key: &str) -> Result<Vec<String>, Error>;

    /// Liveness of each key, in the order given.
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, Error>;
}

/// Registry coordinates of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub tenant_id: String,
    pub principal_id: String,
    pub connection_id: String,
}

pub struct ActiveConnections {
    store: Arc<dyn RegistryStore>,
    prefix: String,
    ttl: Duration,
}

impl ActiveConnections {
    pub fn new(store: Arc<dyn RegistryStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn set_key(&self, tenant_id: &str, principal_id: &str) -> String {
        format!("{}:active:{}:{}", self.prefix, tenant_id, principal_id)
    }

    fn record_key(&self, tenant_id: &str, principal_id: &str, connection_id: &str) -> String {
        format!(
            "{}:{}",
            self.set_key(tenant_id, principal_id),
            connection_id
        )
    }

    /// Mark a connection alive for one TTL period and list it under its principal.
    pub async fn register(&self, key: &ConnectionKey) -> Result<(), Error> {
        let set_key = self.set_key(&key.tenant_id, &key.principal_id);
        let record_key = self.record_key(&key.tenant_id, &key.principal_id, &key.connection_id);

        self.store.set_with_ttl(&record_key, self.ttl).await?;
        self.store.add_to_set(&set_key, &key.connection_id).await?;
        // The set outlives its members by at most one TTL once nobody renews it.
        self.store.expire(&set_key, self.ttl).await
    }

    /// Extend liveness. Re-lists the id in case a counter pruned it meanwhile.
    pub async fn renew(&self, key: &ConnectionKey) -> Result<(), Error> {
        self.register(key).await
    }

    pub async fn unregister(&self, key: &ConnectionKey) -> Result<(), Error> {
        let set_key = self.set_key(&key.tenant_id, &key.principal_id);
        let record_key = self.record_key(&key.tenant_id, &key.principal_id, &key.connection_id);

        self.store
            .remove_from_set(&set_key, std::slice::from_ref(&key.connection_id))
            .await?;
        self.store.delete(&record_key).await
    }

    /// Count live connections of a principal across the fleet, pruning stale ids.
    pub async fn count(&self, tenant_id: &str, principal_id: &str) -> Result<usize, Error> {
        let set_key = self.set_key(tenant_id, principal_id);
        let ids = self.store.members(&set_key).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let record_keys: Vec<String> = ids
            .iter()
            .map(|id| self.record_key(tenant_id, principal_id, id))
            .collect();
        let alive = self.store.exists_many(&record_keys).await?;

        let stale: Vec<String> = ids
            .into_iter()
            .zip(alive.iter())
            .filter(|(_, alive)| !**alive)
            .map(|(id, _)| id)
            .collect();

        if !stale.is_empty() {
            debug!(
                "Evicting {} stale connection(s) from {}",
                stale.len(),
                set_key
            );
            self.store.remove_from_set(&set_key, &stale).await?;
        }

        Ok(alive.iter().filter(|alive| **alive).count())
    }
}
