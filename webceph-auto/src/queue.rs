//! Durable queue of remote-sync operations that failed and must be retried.
//!
//! The whole queue lives in one JSON array that is read, modified and
//! rewritten on every mutation. Access from one process is serialized with
//! internal locks; sharing the file between processes is not supported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::AutomationError;

pub const QUEUE_FILE_NAME: &str = "offline_queue.json";
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(action_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: format!("{action_type}_{}", Uuid::new_v4().simple()),
            action_type: action_type.to_string(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn exhausted_error(&self) -> AutomationError {
        AutomationError::QueueExhausted {
            id: self.id.clone(),
            action: self.action_type.clone(),
            attempts: self.retry_count,
            last_error: self.last_error.clone().unwrap_or_default(),
        }
    }
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub processed: usize,
    pub failed: usize,
    pub remaining: usize,
    /// Items dropped during this pass after using up their retries
    pub exhausted: Vec<QueueItem>,
}

impl ReplaySummary {
    pub fn errors(&self) -> Vec<AutomationError> {
        self.exhausted.iter().map(QueueItem::exhausted_error).collect()
    }
}

#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    file_lock: Mutex<()>,
    replay_lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
        }
    }

    /// Queue stored as `offline_queue.json` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(QUEUE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
        lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self) -> Result<Vec<QueueItem>, AutomationError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn store(&self, items: &[QueueItem]) -> Result<(), AutomationError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(items)?)?;
        Ok(())
    }

    /// Persist a new item and return its id.
    pub fn enqueue(
        &self,
        action_type: &str,
        payload: serde_json::Value,
    ) -> Result<String, AutomationError> {
        let item = QueueItem::new(action_type, payload);
        let id = item.id.clone();

        let _guard = Self::lock(&self.file_lock);
        let mut items = self.load()?;
        items.push(item);
        self.store(&items)?;

        info!(
            "Queued '{}' for later sync ({} item(s) pending)",
            id,
            items.len()
        );
        Ok(id)
    }

    pub fn items(&self) -> Result<Vec<QueueItem>, AutomationError> {
        let _guard = Self::lock(&self.file_lock);
        self.load()
    }

    pub fn len(&self) -> Result<usize, AutomationError> {
        Ok(self.items()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, AutomationError> {
        Ok(self.items()?.is_empty())
    }

    /// Drop every pending item. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, AutomationError> {
        let _guard = Self::lock(&self.file_lock);
        let removed = self.load()?.len();
        self.store(&[])?;
        warn!("Cleared {} pending item(s) from the offline queue", removed);
        Ok(removed)
    }

    /// Attempt every item currently queued once, using `submit` for the remote call.
    ///
    /// Succeeded items are removed. A failed item is kept with its retry count
    /// increased until it reaches `max_retries`, then dropped and reported in
    /// [`ReplaySummary::exhausted`]. Items enqueued while the pass is running
    /// are kept untouched for the next pass.
    #[instrument(level = "info", skip(self, submit), fields(path = %self.path.display()))]
    pub fn replay<F>(&self, mut submit: F) -> Result<ReplaySummary, AutomationError>
    where
        F: FnMut(&QueueItem) -> Result<(), AutomationError>,
    {
        let _replaying = Self::lock(&self.replay_lock);

        let snapshot = {
            let _guard = Self::lock(&self.file_lock);
            self.load()?
        };
        if snapshot.is_empty() {
            debug!("Offline queue is empty, nothing to replay");
            return Ok(ReplaySummary::default());
        }
        info!("Replaying {} queued operation(s)", snapshot.len());

        let mut summary = ReplaySummary::default();
        // None means the item leaves the queue
        let mut outcomes: HashMap<String, Option<QueueItem>> = HashMap::new();

        for mut item in snapshot {
            match submit(&item) {
                Ok(()) => {
                    info!("Replayed '{}'", item.id);
                    summary.processed += 1;
                    outcomes.insert(item.id.clone(), None);
                }
                Err(AutomationError::Cancelled(reason)) => {
                    // Leave the rest untouched; persist what already happened
                    warn!("Replay cancelled before '{}': {}", item.id, reason);
                    self.merge(&outcomes)?;
                    return Err(AutomationError::Cancelled(reason));
                }
                Err(e) => {
                    item.retry_count += 1;
                    item.last_error = Some(e.to_string());
                    if item.is_exhausted() {
                        error!(
                            "Dropping '{}' after {} attempt(s): {}",
                            item.id, item.retry_count, e
                        );
                        summary.failed += 1;
                        outcomes.insert(item.id.clone(), None);
                        summary.exhausted.push(item);
                    } else {
                        warn!(
                            "Replay of '{}' failed ({}/{}): {}",
                            item.id, item.retry_count, item.max_retries, e
                        );
                        outcomes.insert(item.id.clone(), Some(item));
                    }
                }
            }
        }

        summary.remaining = self.merge(&outcomes)?;
        info!(
            "Offline queue replay finished: {} processed, {} failed, {} remaining",
            summary.processed, summary.failed, summary.remaining
        );
        Ok(summary)
    }

    /// Apply replay outcomes to the current file content, keeping anything
    /// enqueued meanwhile. Returns the new queue length.
    fn merge(&self, outcomes: &HashMap<String, Option<QueueItem>>) -> Result<usize, AutomationError> {
        let _guard = Self::lock(&self.file_lock);
        let merged: Vec<QueueItem> = self
            .load()?
            .into_iter()
            .filter_map(|item| match outcomes.get(&item.id) {
                Some(Some(updated)) => Some(updated.clone()),
                Some(None) => None,
                None => Some(item),
            })
            .collect();
        self.store(&merged)?;
        Ok(merged.len())
    }
}
