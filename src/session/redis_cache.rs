use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use redis::aio::ConnectionManager;
use tracing::debug;

use super::record::StoredSession;
use super::{ExpiryMode, RecordStream, SessionRecord, Storage};
use crate::error::{Result, SessionError, token_preview};

/// Address used when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Namespace prepended to every token.
pub const DEFAULT_KEY_PREFIX: &str = "session:";

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

fn unavailable(e: redis::RedisError) -> SessionError {
    SessionError::BackendUnavailable(format!("redis: {}", e))
}

/// `SCAN MATCH` pattern selecting every key under `prefix`, with glob
/// metacharacters in the prefix matched literally.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Redis-backed session storage.
///
/// Each session is a JSON string under `<prefix><token>`, written with
/// `SET NX PX` so Redis evicts it at the TTL and refuses to overwrite an
/// existing token.
pub struct RedisStorage {
    conn: ConnectionManager,
    key_prefix: String,
    closed: AtomicBool,
}

impl RedisStorage {
    /// Connect to `url` (falls back to [`DEFAULT_REDIS_URL`] when empty).
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let url = if url.trim().is_empty() {
            DEFAULT_REDIS_URL
        } else {
            url
        };

        let client = redis::Client::open(url)
            .map_err(|e| SessionError::Config(format!("invalid redis url '{}': {}", url, e)))?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;

        debug!(url, "connected to redis");

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::BackendUnavailable(
                "redis session store is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn redis_key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token)
    }

    /// One `SCAN` step plus an `MGET` of whatever it returned.
    async fn scan_page(
        mut conn: ConnectionManager,
        pattern: String,
        cursor: Option<u64>,
    ) -> Result<Option<(Vec<SessionRecord>, Option<u64>)>> {
        let Some(cursor) = cursor else {
            return Ok(None);
        };

        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut records = Vec::with_capacity(keys.len());
        if !keys.is_empty() {
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            // Keys evicted between SCAN and MGET come back as nil
            for value in values.into_iter().flatten() {
                let stored: StoredSession =
                    serde_json::from_str(&value).context("corrupt session payload in redis")?;
                records.push(SessionRecord::from(stored));
            }
        }

        let next = if next == 0 { None } else { Some(next) };
        Ok(Some((records, next)))
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &str {
        "remote-cache"
    }

    fn expiry_mode(&self) -> ExpiryMode {
        ExpiryMode::NativeTtl
    }

    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let payload = serde_json::to_string(&StoredSession::from(record))
            .context("failed to serialize session")?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(&record.token))
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match reply {
            Some(_) => {
                debug!(token = token_preview(&record.token), ttl_ms, "stored session");
                Ok(())
            }
            None => Err(SessionError::duplicate(&record.token)),
        }
    }

    async fn get(&self, token: &str) -> Result<SessionRecord> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.redis_key(token))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let value = value.ok_or_else(|| SessionError::not_found(token))?;
        let stored: StoredSession =
            serde_json::from_str(&value).context("corrupt session payload in redis")?;
        Ok(SessionRecord::from(stored))
    }

    async fn delete(&self, token: &str) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.redis_key(token))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if removed > 0 {
            debug!(token = token_preview(token), "deleted session");
        }
        Ok(())
    }

    fn list_active(&self) -> RecordStream {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let conn = self.conn.clone();
        let pattern = scan_pattern(&self.key_prefix);

        stream::try_unfold(Some(0u64), move |cursor| {
            Self::scan_page(conn.clone(), pattern.clone(), cursor)
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SessionError>)))
        .try_flatten()
        .boxed()
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection is dropped with the last handle
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(prefix = %self.key_prefix, "closed redis session store");
        }
        Ok(())
    }
}
