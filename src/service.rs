use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::builder::SessionServiceBuilder;
use crate::config::DisplayZone;
use crate::error::{Result, SessionError, token_preview};
use crate::session::{
    ExpiryCoordinator, ExpiryMode, RecordStream, RecoveryAction, SessionRecord, Storage,
    TokenMinter,
};

/// Shared inner state, wrapped in Arc so clones of the service share one backend.
struct Inner {
    storage: Arc<dyn Storage>,
    minter: TokenMinter,
    coordinator: Option<ExpiryCoordinator>,
    default_expiry_seconds: u64,
    display_zone: DisplayZone,
}

/// Outcome of a startup recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records enumerated from storage
    pub scanned: usize,
    /// Records already past their expiry, deleted during recovery
    pub expired: usize,
    /// Records whose deletion was re-armed
    pub scheduled: usize,
}

/// Issues, validates and expires session tokens.
///
/// Use [`SessionService::builder()`] to construct an instance. Building
/// connects the backend and runs [`recover`](Self::recover) before
/// returning, so a service that exists has a known expiry schedule.
/// The handle is cheap to clone; clones share the same backend.
///
/// # Example
///
/// ```no_run
/// # use session_keeper::SessionService;
/// # async fn example() -> Result<(), session_keeper::SessionError> {
/// let service = SessionService::builder()
///     .default_expiry_seconds(3600)
///     .build()
///     .await?;
///
/// let session = service.new_session("user-42", "10.0.0.7", None).await?;
/// let checked = service.check_status(&session.token).await?;
/// assert_eq!(checked.key, "user-42");
/// service.delete_session(&session.token).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<Inner>,
}

impl SessionService {
    pub(crate) fn from_parts(
        storage: Arc<dyn Storage>,
        default_expiry_seconds: u64,
        display_zone: DisplayZone,
    ) -> Self {
        let coordinator = match storage.expiry_mode() {
            ExpiryMode::Manual => Some(ExpiryCoordinator::start(Arc::clone(&storage))),
            ExpiryMode::NativeTtl => None,
        };

        Self {
            inner: Arc::new(Inner {
                storage,
                minter: TokenMinter::new(),
                coordinator,
                default_expiry_seconds,
                display_zone,
            }),
        }
    }

    /// Create a new builder for configuring a `SessionService`.
    pub fn builder() -> SessionServiceBuilder {
        SessionServiceBuilder::new()
    }

    /// How the configured backend expires sessions
    pub fn expiry_mode(&self) -> ExpiryMode {
        self.inner.storage.expiry_mode()
    }

    /// Lifetime applied when `new_session` gets no override
    pub fn default_expiry_seconds(&self) -> u64 {
        self.inner.default_expiry_seconds
    }

    /// Zone used by [`display_expires_at`](Self::display_expires_at)
    pub fn display_zone(&self) -> DisplayZone {
        self.inner.display_zone
    }

    /// Deletions queued on the expiry coordinator (always 0 for native-TTL backends)
    pub fn pending_expiries(&self) -> usize {
        self.inner
            .coordinator
            .as_ref()
            .map(ExpiryCoordinator::pending)
            .unwrap_or(0)
    }

    /// Start a new session for `key` issued to `ip`.
    ///
    /// `ttl_override` of `None` or `Some(0)` uses the configured default.
    pub async fn new_session(
        &self,
        key: &str,
        ip: &str,
        ttl_override: Option<u64>,
    ) -> Result<SessionRecord> {
        let ttl_secs = ttl_override
            .filter(|ttl| *ttl > 0)
            .unwrap_or(self.inner.default_expiry_seconds);

        let now = Utc::now();
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| SessionError::Config(format!("ttl out of range: {}s", ttl_secs)))?;

        let mut record = SessionRecord {
            key: key.to_string(),
            token: self.inner.minter.mint(key, ip),
            ip: ip.to_string(),
            issued_at: now,
            expires_at,
            expiry_in: 0,
        };

        self.inner
            .storage
            .put(&record, Duration::from_secs(ttl_secs))
            .await?;

        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.schedule(&record.token, record.expires_at);
        }

        record.refresh_expiry(Utc::now());
        info!(
            token = token_preview(&record.token),
            ttl_secs,
            backend = self.inner.storage.name(),
            "created session"
        );

        Ok(record)
    }

    /// Look up a live session by token.
    ///
    /// Fails with `NotFound` if the token is unknown, deleted, or its
    /// `expires_at` has passed, whatever the backend still holds.
    pub async fn check_status(&self, token: &str) -> Result<SessionRecord> {
        let mut record = self.inner.storage.get(token).await?;
        let now = Utc::now();
        record.refresh_expiry(now);

        if record.is_expired_at(now) {
            debug!(token = token_preview(token), "session past expiry");
            return Err(SessionError::not_found(token));
        }
        Ok(record)
    }

    /// Same as [`check_status`](Self::check_status), for callers holding a
    /// record with only the token filled in.
    pub async fn fetch_session_data(&self, session: &SessionRecord) -> Result<SessionRecord> {
        self.check_status(&session.token).await
    }

    /// Delete a session. Succeeds whether or not the session still exists.
    pub async fn delete_session(&self, token: &str) -> Result<()> {
        self.inner.storage.delete(token).await?;
        info!(token = token_preview(token), "deleted session");
        Ok(())
    }

    /// Every session the backend currently records
    pub fn list_active_sessions(&self) -> RecordStream {
        self.inner.storage.list_active()
    }

    /// Rebuild the expiry schedule from storage.
    ///
    /// Sessions already past `expires_at` are deleted; the rest get a
    /// deletion queued for their original expiry. Backends with native TTL
    /// need nothing and return an empty report.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let Some(coordinator) = &self.inner.coordinator else {
            debug!(backend = self.inner.storage.name(), "native ttl backend, nothing to recover");
            return Ok(RecoveryReport::default());
        };

        let mut report = RecoveryReport::default();
        let mut sessions = self.inner.storage.list_active();

        while let Some(record) = sessions
            .try_next()
            .await
            .map_err(|e| SessionError::Recovery(e.to_string()))?
        {
            report.scanned += 1;
            let action = coordinator
                .recover(&record)
                .await
                .map_err(|e| SessionError::Recovery(e.to_string()))?;
            match action {
                RecoveryAction::Expired => report.expired += 1,
                RecoveryAction::Scheduled(_) => report.scheduled += 1,
            }
        }

        info!(
            backend = self.inner.storage.name(),
            scanned = report.scanned,
            expired = report.expired,
            scheduled = report.scheduled,
            "recovered session expiries"
        );

        Ok(report)
    }

    /// `expires_at` in the configured display zone.
    pub fn display_expires_at(&self, record: &SessionRecord) -> DateTime<FixedOffset> {
        self.inner.display_zone.render(record.expires_at)
    }

    /// Close the storage handle. Later operations fail with `BackendUnavailable`.
    pub async fn close(&self) -> Result<()> {
        self.inner.storage.close().await
    }
}
