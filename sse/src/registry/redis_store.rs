//! Redis-backed registry store shared by every gateway process.

use super::RegistryStore;
use crate::error::Error;
use async_trait::async_trait;
use log::*;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Marker value stored under liveness keys; only presence matters.
const MARKER: u8 = 1;

/// Redis store over an auto-reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected connection registry to Redis");
        Ok(Self { connection })
    }
}

/// Redis TTLs are whole seconds; never round a short TTL down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: () = connection.set_ex(key, MARKER, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: bool = connection.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: usize = connection.del(key).await?;
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: usize = connection.sadd(key, member).await?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, members: &[String]) -> Result<(), Error> {
        if members.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let _: usize = connection.srem(key, members.to_vec()).await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut connection = self.connection.clone();
        Ok(connection.smembers(key).await?)
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.exists(key);
        }

        let mut connection = self.connection.clone();
        let alive: Vec<bool> = pipe.query_async(&mut connection).await?;
        Ok(alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }
}
