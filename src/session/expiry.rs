use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info, warn};

use super::{SessionRecord, Storage};
use crate::error::{Result, token_preview};

/// Far-off deadline used while the queue is empty.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// What [`ExpiryCoordinator::recover`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Already past `expires_at`; deleted on the spot
    Expired,
    /// Deletion queued after the remaining time
    Scheduled(Duration),
}

struct ScheduleRequest {
    token: String,
    deadline: Instant,
}

/// Deletes sessions from backends that cannot expire entries themselves.
///
/// All pending deletions live in one delay queue owned by a background task.
/// Nothing is ever cancelled: deleting a session early leaves its entry in
/// the queue, and the eventual delete is a no-op because storage deletes
/// are idempotent. The queue is not persisted; [`recover`](Self::recover)
/// rebuilds it from storage on startup.
pub struct ExpiryCoordinator {
    storage: Arc<dyn Storage>,
    requests: mpsc::UnboundedSender<ScheduleRequest>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl ExpiryCoordinator {
    /// Start the scheduler. Must be called from within a tokio runtime.
    pub fn start(storage: Arc<dyn Storage>) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_scheduler(
            Arc::clone(&storage),
            rx,
            Arc::clone(&pending),
        ));

        debug!(backend = storage.name(), "expiry coordinator started");

        Self {
            storage,
            requests,
            pending,
            worker,
        }
    }

    /// Queue a deletion of `token` at `expires_at`.
    pub fn schedule(&self, token: &str, expires_at: DateTime<Utc>) {
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_after(token, remaining);
    }

    fn schedule_after(&self, token: &str, delay: Duration) {
        let request = ScheduleRequest {
            token: token.to_string(),
            deadline: Instant::now() + delay,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.requests.send(request).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(token = token_preview(token), "expiry scheduler stopped, deletion not queued");
            return;
        }
        debug!(token = token_preview(token), delay_ms = delay.as_millis() as u64, "scheduled expiry");
    }

    /// Re-arm expiry for a record found in storage after a restart.
    ///
    /// Records already past `expires_at` are deleted before this returns.
    pub async fn recover(&self, record: &SessionRecord) -> Result<RecoveryAction> {
        let remaining = record.expires_at - Utc::now();

        match remaining.to_std() {
            Ok(delay) if !delay.is_zero() => {
                self.schedule_after(&record.token, delay);
                Ok(RecoveryAction::Scheduled(delay))
            }
            _ => {
                self.storage.delete(&record.token).await?;
                debug!(token = token_preview(&record.token), "deleted overdue session");
                Ok(RecoveryAction::Expired)
            }
        }
    }

    /// Number of deletions queued but not yet fired.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for ExpiryCoordinator {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_scheduler(
    storage: Arc<dyn Storage>,
    mut requests: mpsc::UnboundedReceiver<ScheduleRequest>,
    pending: Arc<AtomicUsize>,
) {
    let mut queue: BinaryHeap<Reverse<(Instant, String)>> = BinaryHeap::new();

    loop {
        let next_deadline = queue
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            request = requests.recv() => {
                match request {
                    Some(ScheduleRequest { token, deadline }) => {
                        queue.push(Reverse((deadline, token)));
                    }
                    None => {
                        info!(dropped = queue.len(), "expiry scheduler stopped");
                        break;
                    }
                }
            }
            _ = sleep_until(next_deadline), if !queue.is_empty() => {
                let now = Instant::now();
                while let Some(Reverse((deadline, _))) = queue.peek() {
                    if *deadline > now {
                        break;
                    }
                    let Some(Reverse((_, token))) = queue.pop() else {
                        break;
                    };
                    pending.fetch_sub(1, Ordering::SeqCst);
                    spawn_delete(Arc::clone(&storage), token);
                }
            }
        }
    }
}

/// Run one expiry deletion as its own task, detached from the scheduler.
fn spawn_delete(storage: Arc<dyn Storage>, token: String) {
    tokio::spawn(async move {
        match storage.delete(&token).await {
            Ok(()) => debug!(token = token_preview(&token), "expired session"),
            Err(e) => warn!(
                token = token_preview(&token),
                error = %e,
                "scheduled expiry failed; session will be retried on next recovery"
            ),
        }
    });
}
