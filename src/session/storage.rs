use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::SessionRecord;
use crate::error::Result;

/// Lazy, one-shot sequence of live records produced by [`Storage::list_active`].
pub type RecordStream = BoxStream<'static, Result<SessionRecord>>;

/// How a backend gets rid of expired entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryMode {
    /// The backend evicts entries on its own once their TTL passes
    NativeTtl,
    /// Entries stay until deleted; an [`ExpiryCoordinator`](super::ExpiryCoordinator) must do it
    Manual,
}

impl std::fmt::Display for ExpiryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NativeTtl => write!(f, "native_ttl"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Storage backend for sessions
///
/// Implementations must be safe to share between concurrent callers; any
/// connection or handle they own is guarded internally.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    /// Whether the backend expires entries itself
    fn expiry_mode(&self) -> ExpiryMode;

    /// Store a new session. Fails with `DuplicateToken` if the token is already present.
    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()>;

    /// Load a live session. Fails with `NotFound` if it is absent, evicted or deleted.
    async fn get(&self, token: &str) -> Result<SessionRecord>;

    /// Delete a session. Deleting an unknown or already deleted token succeeds.
    async fn delete(&self, token: &str) -> Result<()>;

    /// Enumerate every currently recorded session
    fn list_active(&self) -> RecordStream;

    /// Release the underlying handle. Later calls fail with `BackendUnavailable`.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
