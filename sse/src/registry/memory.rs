//! Process-local registry store for single-instance deployments and tests.
//!
//! Expiry follows the tokio clock, so paused-time tests can drive TTLs.

use super::RegistryStore;
use crate::error::{registry_error, Error};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Marker,
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops `key` if its TTL has passed.
    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Marker,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        self.purge_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), Error> {
        self.purge_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Value::Marker => Err(registry_error(&format!("{key} does not hold a set"))),
        }
    }

    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<(), Error> {
        self.purge_expired(key);
        let now_empty = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::Set(set) => {
                    for member in members {
                        set.remove(member);
                    }
                    set.is_empty()
                }
                Value::Marker => {
                    return Err(registry_error(&format!("{key} does not hold a set")))
                }
            },
            None => false,
        };

        // Empty sets disappear, as they do in Redis.
        if now_empty {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, Value::Set(s) if s.is_empty()));
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, Error> {
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                Value::Marker => Err(registry_error(&format!("{key} does not hold a set"))),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, Error> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| self.entries.get(key).is_some_and(|entry| entry.is_live(now)))
            .collect())
    }
}
