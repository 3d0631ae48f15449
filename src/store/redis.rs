//! Redis-backed [`AtomicStore`].
//!
//! Scripts are sent with `EVALSHA` (falling back to `EVAL` on a cold script
//! cache) through [`::redis::Script`], so every compound mutation is one round
//! trip executed atomically by the server.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;

use super::{AtomicStore, Script, SetOptions};
use crate::{Result, StorefrontError};

#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    reserve: ::redis::Script,
    finalize_deduction: ::redis::Script,
    release: ::redis::Script,
    raise_stock: ::redis::Script,
}

impl RedisStore {
    /// Connects to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the first connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| StorefrontError::StorageError(format!("Failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StorefrontError::StorageError(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self {
            conn_manager,
            reserve: ::redis::Script::new(Script::Reserve.lua()),
            finalize_deduction: ::redis::Script::new(Script::FinalizeDeduction.lua()),
            release: ::redis::Script::new(Script::Release.lua()),
            raise_stock: ::redis::Script::new(Script::RaiseStock.lua()),
        })
    }

    fn script(&self, script: Script) -> &::redis::Script {
        match script {
            Script::Reserve => &self.reserve,
            Script::FinalizeDeduction => &self.finalize_deduction,
            Script::Release => &self.release,
            Script::RaiseStock => &self.raise_stock,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if options.if_not_exists {
            cmd.arg("NX");
        }
        if let Some(ttl) = options.ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        // Nil reply means the NX condition failed.
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = ::redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn eval(&self, script: Script, keys: &[&str], args: &[i64]) -> Result<Vec<i64>> {
        let mut conn = self.conn_manager.clone();
        let mut invocation = self.script(script).prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await.map_err(|e| {
            tracing::error!(script = ?script, error = %e, "Atomic script failed");
            StorefrontError::from(e)
        })?;
        Ok(reply)
    }

    async fn zadd(&self, set: &str, score: i64, member: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.zadd(set, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(&self, set: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn.zrangebyscore(set, min, max).await?;
        Ok(members)
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.zrem(set, member).await?;
        Ok(removed > 0)
    }
}
