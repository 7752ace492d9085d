//! Redis-backed [`LockStore`]: the run lock must survive process restarts,
//! since the racing callers are separate invocations, not threads.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::lock::{LockStore, LOCK_IDLE, LOCK_RUNNING};
use crate::models::{IngestionError, Result};

#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisLockStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| IngestionError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: "ingestion:lock:".to_string(),
        })
    }

    fn key(&self, scope: &str) -> String {
        format!("{}{}", self.key_prefix, scope)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, scope: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX is the atomic transition; an existing `termine` value is
        // rewritten through the non-NX path below.
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(scope))
            .arg(LOCK_RUNNING)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(true);
        }
        let current: Option<String> = redis::cmd("GET")
            .arg(self.key(scope))
            .query_async(&mut conn)
            .await?;
        if current.as_deref() == Some(LOCK_RUNNING) {
            return Ok(false);
        }
        let _: () = redis::cmd("SET")
            .arg(self.key(scope))
            .arg(LOCK_RUNNING)
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn release(&self, scope: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(scope))
            .arg(LOCK_IDLE)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn state(&self, scope: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let current: Option<String> = redis::cmd("GET")
            .arg(self.key(scope))
            .query_async(&mut conn)
            .await?;
        Ok(current.unwrap_or_else(|| LOCK_IDLE.to_string()))
    }

    async fn force_release(&self, scope: &str) -> Result<()> {
        tracing::warn!(scope = %scope, "Forcing run lock back to idle");
        self.release(scope).await
    }
}
