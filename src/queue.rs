//! Outgoing queue - persistent JSON record of sends awaiting their database row
//!
//! Reactions and attachments land in chat.db with text that has to be
//! reconstructed ("Loved “hello”", "Loved an image"). Each send through the
//! basic mechanism leaves a QueueItem here so a row can be tied back to its
//! client `tempGuid`, even after a restart.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pending::texts_match;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A queued outgoing send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub temp_guid: String,
    pub chat_guid: String,
    pub date_created: DateTime<Utc>,
    pub text: String,
}

impl QueueItem {
    pub fn new(temp_guid: &str, chat_guid: &str, text: &str) -> Self {
        Self {
            temp_guid: temp_guid.to_string(),
            chat_guid: chat_guid.to_string(),
            date_created: Utc::now(),
            text: text.to_string(),
        }
    }
}

/// File-backed queue, oldest item first
pub struct QueueStore {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
}

impl QueueStore {
    pub fn new(config: &Config) -> Self {
        Self::with_path(config.queue_file.clone())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load queue from disk
    pub fn load(&self) -> Result<usize> {
        let mut items = self.lock();
        if !self.path.exists() {
            items.clear();
            return Ok(0);
        }

        let content = fs::read_to_string(&self.path)?;
        *items = serde_json::from_str(&content)?;
        Ok(items.len())
    }

    /// Save queue to disk atomically
    fn save(&self, items: &[QueueItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Temp file in the same directory so the rename stays on one filesystem
        let parent = self.path.parent().unwrap_or(std::path::Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;

        let json = serde_json::to_string_pretty(items)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    pub fn add(&self, item: QueueItem) -> Result<()> {
        let mut items = self.lock();
        items.retain(|i| i.temp_guid != item.temp_guid);
        items.push(item);
        self.save(&items)
    }

    /// Remove and return the oldest item for this chat whose text matches
    pub fn take_match(&self, chat_guid: &str, text: &str) -> Result<Option<QueueItem>> {
        let mut items = self.lock();
        let position = items
            .iter()
            .position(|i| i.chat_guid == chat_guid && texts_match(&i.text, text));

        match position {
            Some(idx) => {
                let item = items.remove(idx);
                self.save(&items)?;
                debug!(temp_guid = %item.temp_guid, "queue item matched");
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, temp_guid: &str) -> Result<Option<QueueItem>> {
        let mut items = self.lock();
        let position = items.iter().position(|i| i.temp_guid == temp_guid);
        match position {
            Some(idx) => {
                let item = items.remove(idx);
                self.save(&items)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Drop items older than `max_age`. Returns how many were removed.
    pub fn prune_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut items = self.lock();
        let before = items.len();
        items.retain(|i| i.date_created >= cutoff);
        let removed = before - items.len();
        if removed > 0 {
            self.save(&items)?;
        }
        Ok(removed)
    }

    pub fn get(&self, temp_guid: &str) -> Option<QueueItem> {
        self.lock().iter().find(|i| i.temp_guid == temp_guid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drop items older than `max_age` on a fixed interval
pub fn spawn_prune_task(queue: Arc<QueueStore>, max_age: Duration, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match queue.prune_stale(max_age) {
                Ok(0) => {}
                Ok(count) => info!(count, "pruned stale queue items"),
                Err(e) => warn!(error = %e, "queue prune failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> QueueStore {
        QueueStore::new(&Config::for_test(temp_dir.path()))
    }

    #[test]
    fn test_queue_persists_across_reload() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        queue
            .add(QueueItem::new("abc123", "iMessage;-;+15551234567", "Loved an image"))
            .unwrap();

        let reloaded = store(&temp_dir);
        assert_eq!(reloaded.load().unwrap(), 1);
        let item = reloaded.get("abc123").unwrap();
        assert_eq!(item.text, "Loved an image");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        assert_eq!(queue.load().unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_match_is_chat_scoped_and_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        queue.add(QueueItem::new("first", "chat-a", "hi")).unwrap();
        queue.add(QueueItem::new("other", "chat-b", "hi")).unwrap();
        queue.add(QueueItem::new("second", "chat-a", "hi")).unwrap();

        let taken = queue.take_match("chat-a", "hi").unwrap().unwrap();
        assert_eq!(taken.temp_guid, "first");
        let taken = queue.take_match("chat-a", " hi ").unwrap().unwrap();
        assert_eq!(taken.temp_guid, "second");
        assert!(queue.take_match("chat-a", "hi").unwrap().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_add_replaces_same_temp_guid() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        queue.add(QueueItem::new("abc", "chat", "one")).unwrap();
        queue.add(QueueItem::new("abc", "chat", "two")).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get("abc").unwrap().text, "two");
    }

    #[test]
    fn test_prune_stale() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        let mut old = QueueItem::new("old", "chat", "x");
        old.date_created = Utc::now() - Duration::hours(48);
        queue.add(old).unwrap();
        queue.add(QueueItem::new("fresh", "chat", "y")).unwrap();

        assert_eq!(queue.prune_stale(Duration::hours(24)).unwrap(), 1);
        assert!(queue.get("old").is_none());
        assert!(queue.get("fresh").is_some());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let queue = store(&temp_dir);
        queue.add(QueueItem::new("abc", "chat", "x")).unwrap();
        assert!(queue.remove("abc").unwrap().is_some());
        assert!(queue.remove("abc").unwrap().is_none());
    }
}
