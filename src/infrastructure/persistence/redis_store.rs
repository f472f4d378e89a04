//! Redis 会话存储
//!
//! 使用共享的 `ConnectionManager`（断线自动重连），每次操作克隆一个句柄。

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::domain::repository::SessionStore;
use crate::error::{RealtimeError, Result};

pub struct RedisSessionStore {
    connection: ConnectionManager,
}

impl RedisSessionStore {
    /// 建立连接
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await.map_err(|err| {
            RealtimeError::Store(format!("failed to open redis connection: {}", err))
        })?;
        tracing::info!(redis_url = %redis_url, "redis session store connected");
        Ok(Self { connection })
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    fn ttl_seconds(ttl: Duration) -> u64 {
        // Redis 过期时间最小粒度为 1 秒
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, value, Self::ttl_seconds(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: usize = conn.del(key).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let added: usize = conn.sadd(key, member).await?;
        Ok(added)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let removed: usize = conn.srem(key, member).await?;
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let contains: bool = conn.sismember(key, member).await?;
        Ok(contains)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let refreshed: bool = conn.expire(key, Self::ttl_seconds(ttl) as i64).await?;
        Ok(refreshed)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }
}
