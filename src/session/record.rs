use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A session as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Caller-supplied identifier; several sessions may share one key
    pub key: String,

    /// Opaque lookup handle minted for this session
    pub token: String,

    /// Client address the session was issued to
    pub ip: String,

    /// When the session was issued
    pub issued_at: DateTime<Utc>,

    /// When the session stops being valid
    pub expires_at: DateTime<Utc>,

    /// Whole seconds left until `expires_at`, recomputed on every read
    #[serde(default)]
    pub expiry_in: i64,
}

impl SessionRecord {
    /// Record carrying only a token, for [`fetch_session_data`](crate::SessionService::fetch_session_data).
    pub fn with_token(token: impl Into<String>) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            key: String::new(),
            token: token.into(),
            ip: String::new(),
            issued_at: epoch,
            expires_at: epoch,
            expiry_in: 0,
        }
    }

    /// Issue time as epoch seconds.
    pub fn issued_at_epoch(&self) -> i64 {
        self.issued_at.timestamp()
    }

    /// Refresh `expiry_in` against `now`.
    pub fn refresh_expiry(&mut self, now: DateTime<Utc>) {
        self.expiry_in = seconds_until(self.expires_at, now);
    }

    /// Whether `expires_at` has been reached at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `expires_at` has been reached.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Seconds from `now` to `deadline`, rounded up so that a session with any
/// time left reports at least 1.
pub(crate) fn seconds_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let remaining = deadline - now;
    let whole = remaining.num_seconds();
    if remaining > TimeDelta::seconds(whole) {
        whole + 1
    } else {
        whole
    }
}

/// On-disk / on-wire form of a session. `expiry_in` is derived and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredSession {
    pub token: String,
    pub key: String,
    pub ip: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&SessionRecord> for StoredSession {
    fn from(record: &SessionRecord) -> Self {
        Self {
            token: record.token.clone(),
            key: record.key.clone(),
            ip: record.ip.clone(),
            issued_at: record.issued_at,
            expires_at: record.expires_at,
        }
    }
}

impl From<StoredSession> for SessionRecord {
    fn from(stored: StoredSession) -> Self {
        let mut record = Self {
            key: stored.key,
            token: stored.token,
            ip: stored.ip,
            issued_at: stored.issued_at,
            expires_at: stored.expires_at,
            expiry_in: 0,
        };
        record.refresh_expiry(Utc::now());
        record
    }
}
