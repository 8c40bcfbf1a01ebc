use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, warn};

use super::record::StoredSession;
use super::{ExpiryMode, RecordStream, SessionRecord, Storage};
use crate::error::{Result, SessionError, token_preview};

/// Entry kept in the map, with the instant the store evicts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    session: StoredSession,
    evict_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    closed: bool,
}

impl State {
    /// Drop every entry whose TTL has passed. Returns how many were evicted.
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.evict_at > now);
        before - self.entries.len()
    }
}

/// Embedded session store with native TTL eviction.
///
/// Lives in process memory. When opened with a file path, every mutation is
/// written through to a JSON snapshot (tmp file + rename) and the snapshot is
/// reloaded on the next open, minus whatever expired in between.
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    path: Option<PathBuf>,
}

impl MemoryStorage {
    /// Create a purely in-memory store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            path: None,
        }
    }

    /// Open a store persisted at `path`, loading any previous snapshot
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))
                .map_err(|e| SessionError::BackendUnavailable(format!("{:#}", e)))?;
        }

        let mut state = State::default();
        if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read snapshot: {}", path.display()))
                .map_err(|e| SessionError::BackendUnavailable(format!("{:#}", e)))?;
            if !data.trim().is_empty() {
                let entries: Vec<Entry> = serde_json::from_str(&data)
                    .with_context(|| format!("corrupt snapshot: {}", path.display()))?;
                for entry in entries {
                    state.entries.insert(entry.session.token.clone(), entry);
                }
            }
            let evicted = state.evict_expired(Utc::now());
            debug!(
                path = %path.display(),
                loaded = state.entries.len(),
                evicted,
                "loaded embedded session snapshot"
            );
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            path: Some(path),
        })
    }

    /// Snapshot file backing this store, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `op` against the locked state on the blocking pool.
    ///
    /// Expired entries are evicted first. When `op` reports a change, the
    /// snapshot is rewritten before the lock is released.
    async fn with_state<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> Result<(T, bool)> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();

        task::spawn_blocking(move || -> Result<T> {
            let mut guard = state
                .lock()
                .map_err(|_| anyhow!("embedded session store lock poisoned"))?;
            if guard.closed {
                return Err(SessionError::BackendUnavailable(
                    "embedded session store is closed".to_string(),
                ));
            }

            let evicted = guard.evict_expired(Utc::now());
            let (value, changed) = op(&mut *guard)?;

            if let Some(path) = path.as_deref() {
                if changed || evicted > 0 {
                    write_snapshot(path, &guard.entries)?;
                }
            }
            Ok(value)
        })
        .await
        .context("spawn_blocking failed")?
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn write_snapshot(path: &Path, entries: &HashMap<String, Entry>) -> Result<()> {
    let snapshot: Vec<&Entry> = entries.values().collect();
    let data = serde_json::to_vec(&snapshot).context("failed to serialize snapshot")?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "sessions".to_string());
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let write = || -> std::io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, path)
    };
    write().map_err(|e| {
        SessionError::BackendUnavailable(format!(
            "failed to write snapshot {}: {}",
            path.display(),
            e
        ))
    })
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "embedded"
    }

    fn expiry_mode(&self) -> ExpiryMode {
        ExpiryMode::NativeTtl
    }

    async fn put(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        let session = StoredSession::from(record);
        let ttl = chrono::Duration::from_std(ttl).context("ttl out of range")?;

        self.with_state(move |state| {
            if state.entries.contains_key(&session.token) {
                return Err(SessionError::duplicate(&session.token));
            }
            let token = session.token.clone();
            debug!(token = token_preview(&token), ttl_secs = ttl.num_seconds(), "stored session");
            state.entries.insert(
                token,
                Entry {
                    session,
                    evict_at: Utc::now() + ttl,
                },
            );
            Ok(((), true))
        })
        .await
    }

    async fn get(&self, token: &str) -> Result<SessionRecord> {
        let token = token.to_string();

        self.with_state(move |state| match state.entries.get(&token) {
            Some(entry) => Ok((SessionRecord::from(entry.session.clone()), false)),
            None => Err(SessionError::not_found(&token)),
        })
        .await
    }

    async fn delete(&self, token: &str) -> Result<()> {
        let token = token.to_string();

        self.with_state(move |state| {
            let removed = state.entries.remove(&token).is_some();
            if removed {
                debug!(token = token_preview(&token), "deleted session");
            }
            Ok(((), removed))
        })
        .await
    }

    fn list_active(&self) -> RecordStream {
        let now = Utc::now();

        let snapshot = match self.state.lock() {
            Ok(guard) if guard.closed => Err(SessionError::BackendUnavailable(
                "embedded session store is closed".to_string(),
            )),
            Ok(guard) => Ok(guard
                .entries
                .values()
                .filter(|entry| entry.evict_at > now)
                .map(|entry| entry.session.clone())
                .collect::<Vec<_>>()),
            Err(_) => Err(anyhow!("embedded session store lock poisoned").into()),
        };

        match snapshot {
            Ok(sessions) => stream::iter(sessions.into_iter().map(|s| Ok(SessionRecord::from(s))))
                .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn close(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();

        task::spawn_blocking(move || -> Result<()> {
            let mut guard = state
                .lock()
                .map_err(|_| anyhow!("embedded session store lock poisoned"))?;
            if guard.closed {
                return Ok(());
            }
            if let Some(path) = path.as_deref() {
                guard.evict_expired(Utc::now());
                if let Err(e) = write_snapshot(path, &guard.entries) {
                    warn!(error = %e, "failed to flush snapshot on close");
                }
            }
            guard.closed = true;
            guard.entries.clear();
            debug!("closed embedded session store");
            Ok(())
        })
        .await
        .context("spawn_blocking failed")?
    }
}
