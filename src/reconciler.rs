//! Reconciler - single task that owns the awaiter pool
//!
//! Registrations, observed rows and cancellations all arrive on one FIFO
//! channel, so the pool never needs a lock: a registration sent before the
//! send action fires is always processed before any row observed afterwards.

use crate::error::{Error, Result};
use crate::messages::Message;
use crate::pending::{AwaiterPool, PendingId, PendingSend};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type Responder = oneshot::Sender<Result<Message>>;

enum Command {
    Register {
        pending: PendingSend,
        deadline: Instant,
        responder: Responder,
    },
    Row {
        row: Message,
        claimed: Option<oneshot::Sender<Option<Claim>>>,
    },
    Cancel {
        id: PendingId,
        reason: String,
    },
    /// The send's row is already known by GUID; the awaiter steps aside
    Identified {
        id: PendingId,
        guid: String,
    },
    Count(oneshot::Sender<usize>),
}

/// Which awaiter took an observed row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: PendingId,
    pub temp_guid: Option<String>,
}

/// Cloneable handle to the reconciliation task
#[derive(Clone)]
pub struct PendingRegistry {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

/// Waits for the row a registered send produces
#[derive(Debug)]
pub struct PendingHandle {
    id: PendingId,
    rx: oneshot::Receiver<Result<Message>>,
}

impl PendingHandle {
    pub fn id(&self) -> PendingId {
        self.id
    }

    /// Resolves with the matched row, or fails on timeout or cancellation.
    /// Dropping the handle instead leaves the awaiter to resolve or time out on its own.
    pub async fn wait(self) -> Result<Message> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled("reconciler stopped".to_string())),
        }
    }
}

impl PendingRegistry {
    /// Start the reconciliation task
    pub fn spawn(timeout: Duration, sweep_every: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, timeout, sweep_every));
        let registry = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        };
        (registry, task)
    }

    /// Add an awaiter. Must be called before the send action fires.
    pub fn register(&self, mut pending: PendingSend) -> Result<PendingHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        pending.id = id;
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                pending,
                deadline: Instant::now() + self.timeout,
                responder,
            })
            .map_err(|_| Error::Cancelled("reconciler stopped".to_string()))?;
        Ok(PendingHandle { id, rx })
    }

    /// Feed an observed row without waiting for the outcome
    pub fn observe(&self, row: Message) {
        if self.tx.send(Command::Row { row, claimed: None }).is_err() {
            warn!("reconciler stopped; dropping observed row");
        }
    }

    /// Feed an observed row and report which awaiter, if any, claimed it
    pub async fn offer(&self, row: Message) -> Option<Claim> {
        let (claimed, rx) = oneshot::channel();
        self.tx
            .send(Command::Row {
                row,
                claimed: Some(claimed),
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Remove an awaiter and fail its waiter (handler abort)
    pub fn cancel(&self, id: PendingId, reason: &str) {
        let _ = self.tx.send(Command::Cancel {
            id,
            reason: reason.to_string(),
        });
    }

    /// The send was confirmed by its message GUID. The awaiter leaves the pool,
    /// but the row still carries its tempGuid when the observer sees it.
    pub fn resolve_by_identifier(&self, id: PendingId, guid: &str) {
        let _ = self.tx.send(Command::Identified {
            id,
            guid: guid.to_string(),
        });
    }

    pub async fn active_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, timeout: Duration, sweep_every: Duration) {
    let mut pool: AwaiterPool<Responder> = AwaiterPool::new();
    // Rows already resolved by GUID, kept until observed or expired
    let mut identified: HashMap<String, (Claim, Instant)> = HashMap::new();
    let mut ticker = tokio::time::interval(sweep_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let timeout_secs = timeout.as_secs().max(1);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Register { pending, deadline, responder } => {
                        debug!(id = pending.id, chat = %pending.chat_guid, attachment = pending.is_attachment, "awaiter registered");
                        pool.push(pending, deadline, responder);
                    }
                    Command::Row { row, claimed } => {
                        let claim = match identified.remove(&row.guid) {
                            Some((claim, _)) => Some(claim),
                            None => match pool.claim(&row) {
                                Some((mut pending, responder)) => {
                                    info!(id = pending.id, guid = %row.guid, chat = %row.chat_guid, "send matched to message row");
                                    let result = pending.result.take().unwrap_or(row);
                                    // Receiver may be gone (client disconnected); the awaiter is settled either way
                                    let _ = responder.send(Ok(result));
                                    Some(Claim { id: pending.id, temp_guid: pending.temp_guid })
                                }
                                None => None,
                            },
                        };
                        if let Some(claimed) = claimed {
                            let _ = claimed.send(claim);
                        }
                    }
                    Command::Cancel { id, reason } => {
                        if let Some((pending, responder)) = pool.cancel(id) {
                            debug!(id = pending.id, %reason, "awaiter cancelled");
                            let _ = responder.send(Err(Error::Cancelled(reason)));
                        }
                    }
                    Command::Identified { id, guid } => {
                        // Already claimed by its row if the observer got there first
                        if let Some((pending, _)) = pool.cancel(id) {
                            debug!(id, guid = %guid, "awaiter resolved by identifier");
                            let claim = Claim { id, temp_guid: pending.temp_guid };
                            identified.insert(guid, (claim, Instant::now() + timeout));
                        }
                    }
                    Command::Count(reply) => {
                        let _ = reply.send(pool.len());
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                identified.retain(|_, (_, until)| *until > now);
                for (pending, responder) in pool.expire(now) {
                    warn!(id = pending.id, chat = %pending.chat_guid, text = %pending.expected_text, "send timed out waiting for message row");
                    let _ = responder.send(Err(Error::SendTimeout(timeout_secs)));
                }
            }
        }
    }

    for (pending, responder) in pool.drain() {
        let _ = responder.send(Err(Error::Cancelled(format!("reconciler stopped (awaiter {})", pending.id))));
    }
    debug!("reconciler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    const CHAT: &str = "iMessage;-;+15551234567";

    fn skew() -> ChronoDuration {
        ChronoDuration::seconds(10)
    }

    fn spawn() -> PendingRegistry {
        PendingRegistry::spawn(Duration::from_secs(30), Duration::from_millis(100)).0
    }

    #[tokio::test]
    async fn test_row_resolves_registered_awaiter() {
        let registry = spawn();
        let handle = registry.register(PendingSend::text(CHAT, "hello", skew())).unwrap();
        registry.observe(Message::sent("G1", CHAT, "hello", Utc::now()));

        let row = handle.wait().await.unwrap();
        assert_eq!(row.guid, "G1");
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_reports_claim() {
        let registry = spawn();
        let handle = registry
            .register(PendingSend::text(CHAT, "hi", skew()).with_temp_guid("tmp-1"))
            .unwrap();
        let id = handle.id();

        assert!(registry.offer(Message::sent("X", CHAT, "other", Utc::now())).await.is_none());
        let claim = registry.offer(Message::sent("Y", CHAT, "hi", Utc::now())).await.unwrap();
        assert_eq!(claim.id, id);
        assert_eq!(claim.temp_guid.as_deref(), Some("tmp-1"));
        assert!(registry.offer(Message::sent("Z", CHAT, "hi", Utc::now())).await.is_none());
    }

    #[tokio::test]
    async fn test_two_rows_two_awaiters() {
        let registry = spawn();
        let a = registry.register(PendingSend::text(CHAT, "A", skew())).unwrap();
        let b = registry.register(PendingSend::text(CHAT, "B", skew())).unwrap();

        registry.observe(Message::sent("ROW-A", CHAT, "A", Utc::now()));
        registry.observe(Message::sent("ROW-B", CHAT, "B", Utc::now()));

        assert_eq!(a.wait().await.unwrap().guid, "ROW-A");
        assert_eq!(b.wait().await.unwrap().guid, "ROW-B");
    }

    #[tokio::test]
    async fn test_row_before_floor_is_ignored() {
        let registry = spawn();
        let handle = registry.register(PendingSend::text(CHAT, "hello", skew())).unwrap();
        let stale = Utc::now() - ChronoDuration::seconds(60);

        assert!(registry.offer(Message::sent("OLD", CHAT, "hello", stale)).await.is_none());
        registry.observe(Message::sent("NEW", CHAT, "hello", Utc::now()));
        assert_eq!(handle.wait().await.unwrap().guid, "NEW");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_block_others() {
        let registry = spawn();
        let early = registry.register(PendingSend::text(CHAT, "early", skew())).unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        let late = registry.register(PendingSend::text(CHAT, "late", skew())).unwrap();

        let err = early.wait().await.unwrap_err();
        assert!(matches!(err, Error::SendTimeout(30)));
        assert_eq!(registry.active_count().await, 1);

        registry.observe(Message::sent("L", CHAT, "late", Utc::now()));
        assert_eq!(late.wait().await.unwrap().guid, "L");
    }

    #[tokio::test]
    async fn test_cancel_fails_waiter() {
        let registry = spawn();
        let handle = registry.register(PendingSend::text(CHAT, "x", skew())).unwrap();
        registry.cancel(handle.id(), "dispatch failed");
        assert!(matches!(handle.wait().await, Err(Error::Cancelled(_))));
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_still_times_out() {
        let registry = spawn();
        drop(registry.register(PendingSend::text(CHAT, "nobody listening", skew())).unwrap());
        assert_eq!(registry.active_count().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_identified_row_keeps_temp_guid() {
        let registry = spawn();
        let handle = registry
            .register(PendingSend::text(CHAT, "via helper", skew()).with_temp_guid("pa-1"))
            .unwrap();
        let id = handle.id();
        registry.resolve_by_identifier(id, "HELPER-GUID");
        assert_eq!(registry.active_count().await, 0);

        // Another send's identical text does not take the identified row's place
        let claim = registry
            .offer(Message::sent("HELPER-GUID", CHAT, "via helper", Utc::now()))
            .await
            .unwrap();
        assert_eq!(claim.id, id);
        assert_eq!(claim.temp_guid.as_deref(), Some("pa-1"));
        assert!(registry
            .offer(Message::sent("HELPER-GUID", CHAT, "via helper", Utc::now()))
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identified_entry_expires() {
        let registry = spawn();
        let handle = registry
            .register(PendingSend::text(CHAT, "never observed", skew()).with_temp_guid("pa-2"))
            .unwrap();
        registry.resolve_by_identifier(handle.id(), "LOST");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry
            .offer(Message::sent("LOST", CHAT, "never observed", Utc::now()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_dropped_handle_still_claims_row() {
        let registry = spawn();
        let id = registry.register(PendingSend::text(CHAT, "bye", skew())).unwrap().id();
        let claim = registry.offer(Message::sent("B", CHAT, "bye", Utc::now())).await;
        assert_eq!(claim.map(|c| c.id), Some(id));
        assert_eq!(registry.active_count().await, 0);
    }
}
