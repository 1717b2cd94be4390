//! Row observer - polls chat.db for new rows
//!
//! From-me rows are offered to the reconciler first. A row no live awaiter
//! claims is looked up in the persisted queue, which recovers the tempGuid of
//! sends whose handler has gone away. Every row is broadcast as `new-message`.

use crate::error::{Error, Result};
use crate::messages::{Message, MessagesReader};
use crate::queue::QueueStore;
use crate::reconciler::PendingRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Where new rows come from
pub trait RowSource: Send + Sync + 'static {
    fn max_rowid(&self) -> Result<i64>;
    fn rows_after(&self, rowid: i64) -> Result<Vec<Message>>;
}

impl RowSource for MessagesReader {
    fn max_rowid(&self) -> Result<i64> {
        self.get_max_rowid()
    }

    fn rows_after(&self, rowid: i64) -> Result<Vec<Message>> {
        self.poll(rowid)
    }
}

/// Payload of the `new-message` event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    #[serde(flatten)]
    pub message: Message,
    pub temp_guid: Option<String>,
}

pub struct RowObserver {
    source: Arc<dyn RowSource>,
    registry: PendingRegistry,
    queue: Arc<QueueStore>,
    events: broadcast::Sender<NewMessageEvent>,
    interval: Duration,
}

impl RowObserver {
    pub fn new(
        source: Arc<dyn RowSource>,
        registry: PendingRegistry,
        queue: Arc<QueueStore>,
        events: broadcast::Sender<NewMessageEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            queue,
            events,
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Start from the current max; history is never replayed
        let mut last_rowid = loop {
            ticker.tick().await;
            match self.blocking(|s| s.max_rowid()).await {
                Ok(rowid) => break rowid,
                Err(e) => warn!(error = %e, "cannot read chat.db yet; retrying"),
            }
        };
        info!(rowid = last_rowid, "observer starting");

        loop {
            ticker.tick().await;
            match self.poll_once(last_rowid).await {
                Ok(rowid) => last_rowid = rowid,
                Err(e) => error!(error = %e, "failed to poll messages"),
            }
        }
    }

    /// Process every row after `since_rowid`; returns the new high-water mark
    pub async fn poll_once(&self, since_rowid: i64) -> Result<i64> {
        let rows = self.blocking(move |s| s.rows_after(since_rowid)).await?;
        let mut last_rowid = since_rowid;
        for row in rows {
            last_rowid = last_rowid.max(row.rowid);
            self.handle_row(row).await;
        }
        Ok(last_rowid)
    }

    async fn handle_row(&self, row: Message) {
        let temp_guid = if row.is_from_me {
            match self.registry.offer(row.clone()).await {
                Some(claim) => {
                    // A live awaiter took it; its queue entry is no longer needed
                    if let Some(g) = &claim.temp_guid {
                        if let Err(e) = self.queue.remove(g) {
                            warn!(temp_guid = %g, error = %e, "failed to drop queue item");
                        }
                    }
                    claim.temp_guid
                }
                None => self.match_queue(&row),
            }
        } else {
            None
        };

        debug!(rowid = row.rowid, guid = %row.guid, from_me = row.is_from_me, temp_guid = ?temp_guid, "new message");
        // No subscribers is fine
        let _ = self.events.send(NewMessageEvent {
            message: row,
            temp_guid,
        });
    }

    fn match_queue(&self, row: &Message) -> Option<String> {
        let found = if row.attachments.is_empty() {
            self.queue.take_match(&row.chat_guid, &row.text)
        } else {
            row.attachments
                .iter()
                .map(|a| self.queue.take_match(&row.chat_guid, &a.transfer_name))
                .find(|r| !matches!(r, Ok(None)))
                .unwrap_or(Ok(None))
        };

        match found {
            Ok(Some(item)) => {
                info!(temp_guid = %item.temp_guid, guid = %row.guid, "matched row to queued send");
                Some(item.temp_guid)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(guid = %row.guid, error = %e, "queue lookup failed");
                None
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn RowSource) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || f(source.as_ref()))
            .await
            .map_err(|e| Error::CommandFailed(format!("poll task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingSend;
    use crate::queue::QueueItem;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CHAT: &str = "iMessage;-;+15551234567";

    #[derive(Default)]
    struct FakeSource {
        rows: Mutex<Vec<Message>>,
    }

    impl FakeSource {
        fn push(&self, rowid: i64, text: &str, from_me: bool) {
            let mut m = Message::sent(&format!("G{}", rowid), CHAT, text, Utc::now());
            m.rowid = rowid;
            m.is_from_me = from_me;
            self.rows.lock().unwrap().push(m);
        }
    }

    impl RowSource for FakeSource {
        fn max_rowid(&self) -> Result<i64> {
            Ok(self.rows.lock().unwrap().iter().map(|m| m.rowid).max().unwrap_or(0))
        }

        fn rows_after(&self, rowid: i64) -> Result<Vec<Message>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.rowid > rowid)
                .cloned()
                .collect())
        }
    }

    fn setup(temp: &TempDir) -> (Arc<FakeSource>, RowObserver, PendingRegistry, Arc<QueueStore>, broadcast::Receiver<NewMessageEvent>) {
        let source = Arc::new(FakeSource::default());
        let (registry, _) = PendingRegistry::spawn(Duration::from_secs(30), Duration::from_millis(100));
        let queue = Arc::new(QueueStore::with_path(temp.path().join("queue.json")));
        let (tx, rx) = broadcast::channel(16);
        let observer = RowObserver::new(
            source.clone(),
            registry.clone(),
            queue.clone(),
            tx,
            Duration::from_millis(10),
        );
        (source, observer, registry, queue, rx)
    }

    #[tokio::test]
    async fn test_claimed_row_carries_temp_guid() {
        let temp = TempDir::new().unwrap();
        let (source, observer, registry, queue, mut rx) = setup(&temp);
        queue.add(QueueItem::new("tmp-1", CHAT, "hello")).unwrap();
        let handle = registry
            .register(PendingSend::text(CHAT, "hello", chrono::Duration::seconds(10)).with_temp_guid("tmp-1"))
            .unwrap();

        source.push(1, "hello", true);
        assert_eq!(observer.poll_once(0).await.unwrap(), 1);

        assert_eq!(handle.wait().await.unwrap().guid, "G1");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.temp_guid.as_deref(), Some("tmp-1"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_row_falls_back_to_queue() {
        let temp = TempDir::new().unwrap();
        let (source, observer, _registry, queue, mut rx) = setup(&temp);
        queue.add(QueueItem::new("orphan", CHAT, "late one")).unwrap();

        source.push(5, "late one", true);
        observer.poll_once(4).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().temp_guid.as_deref(), Some("orphan"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_rows_broadcast_without_claim() {
        let temp = TempDir::new().unwrap();
        let (source, observer, registry, _queue, mut rx) = setup(&temp);
        let _handle = registry
            .register(PendingSend::text(CHAT, "hey", chrono::Duration::seconds(10)))
            .unwrap();

        source.push(1, "hey", false);
        observer.poll_once(0).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(!event.message.is_from_me);
        assert!(event.temp_guid.is_none());
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_high_water_mark_advances() {
        let temp = TempDir::new().unwrap();
        let (source, observer, _registry, _queue, _rx) = setup(&temp);
        source.push(3, "a", false);
        source.push(7, "b", true);
        assert_eq!(observer.poll_once(0).await.unwrap(), 7);
        assert_eq!(observer.poll_once(7).await.unwrap(), 7);
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = NewMessageEvent {
            message: Message::sent("G", CHAT, "hi", Utc::now()),
            temp_guid: Some("t".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["guid"], "G");
        assert_eq!(json["tempGuid"], "t");
        assert_eq!(json["chatGuid"], CHAT);
    }
}
