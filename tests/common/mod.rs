#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use futures::stream;

use session_keeper::{
    BackendConfig, ExpiryMode, RecordStream, SessionError, SessionRecord, SessionService, Storage,
};

/// Build a service backed by an in-process store (native TTL).
pub async fn embedded_service() -> SessionService {
    SessionService::builder()
        .backend(BackendConfig::Embedded { path: None })
        .build()
        .await
        .expect("build embedded service")
}

/// Build a service backed by a SQLite file (manual expiry).
pub async fn relational_service(db_path: &Path) -> SessionService {
    SessionService::builder()
        .backend(BackendConfig::Relational {
            path: db_path.to_path_buf(),
        })
        .build()
        .await
        .expect("build relational service")
}

/// A record for direct storage tests, expiring `ttl_secs` from now.
pub fn sample_record(token: &str, ttl_secs: i64) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        key: "user-1".into(),
        token: token.into(),
        ip: "192.0.2.10".into(),
        issued_at: now,
        expires_at: now + TimeDelta::seconds(ttl_secs),
        expiry_in: ttl_secs,
    }
}

/// Wait a little longer than `ms` milliseconds.
pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// A manual-expiry backend whose listing always fails, for recovery tests.
pub struct BrokenListing;

#[async_trait]
impl Storage for BrokenListing {
    fn name(&self) -> &str {
        "broken-listing"
    }

    fn expiry_mode(&self) -> ExpiryMode {
        ExpiryMode::Manual
    }

    async fn put(&self, _record: &SessionRecord, _ttl: Duration) -> session_keeper::Result<()> {
        Ok(())
    }

    async fn get(&self, token: &str) -> session_keeper::Result<SessionRecord> {
        Err(SessionError::NotFound(token.to_string()))
    }

    async fn delete(&self, _token: &str) -> session_keeper::Result<()> {
        Ok(())
    }

    fn list_active(&self) -> RecordStream {
        stream::once(async {
            Err(SessionError::BackendUnavailable(
                "listing unavailable".into(),
            ))
        })
        .boxed()
    }
}
