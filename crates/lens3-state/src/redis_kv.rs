//! Redis-backed `KvStore`.
//!
//! One `RedisKv` talks to one logical database. The connection manager
//! reconnects on its own; each operation clones the cheap handle.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{info, warn};

use crate::error::{StateError, StateResult};
use crate::kv::KvStore;

pub struct RedisKv {
    manager: ConnectionManager,
    db: u8,
}

impl RedisKv {
    /// Connects to database `db` at `url`, retrying PING until the server
    /// answers or `retries` attempts have failed.
    pub async fn connect(url: &str, db: u8, retries: u32, interval: Duration) -> StateResult<Self> {
        let url = format!("{}/{db}", url.trim_end_matches('/'));
        let client = Client::open(url.as_str())
            .map_err(|e| StateError::Connect(format!("bad redis url {url}: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_connect(&client).await {
                Ok(manager) => {
                    info!(db, "redis connected");
                    return Ok(Self { manager, db });
                }
                Err(e) if attempt < retries.max(1) => {
                    warn!(db, attempt, error = %e, "redis not ready, retrying");
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    return Err(StateError::Connect(format!(
                        "redis db={db} unreachable after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }

    async fn try_connect(client: &Client) -> redis::RedisResult<ConnectionManager> {
        let mut manager = ConnectionManager::new(client.clone()).await?;
        redis::cmd("PING").query_async::<String>(&mut manager).await?;
        Ok(manager)
    }

    fn backend_error(&self, op: &str, e: redis::RedisError) -> StateError {
        StateError::Backend(format!("redis {op} failed (db={}): {e}", self.db))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(|e| self.backend_error("GET", e))
    }

    async fn set(&self, key: &str, value: &str) -> StateResult<()> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| self.backend_error("SET", e))
    }

    async fn set_nx(&self, key: &str, value: &str) -> StateResult<bool> {
        let mut conn = self.manager.clone();
        conn.set_nx(key, value)
            .await
            .map_err(|e| self.backend_error("SETNX", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<bool> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1) as i64;
        conn.expire(key, secs)
            .await
            .map_err(|e| self.backend_error("EXPIRE", e))
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        let mut conn = self.manager.clone();
        let n: i64 = conn.del(key).await.map_err(|e| self.backend_error("DEL", e))?;
        Ok(n > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.backend_error("SCAN", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
