//! Pending sends and the awaiter pool
//!
//! A `PendingSend` describes the row a send is expected to produce. The pool
//! keeps them in registration order; a row is claimed by the first awaiter it
//! satisfies and that awaiter leaves the pool in the same step, so no row
//! resolves two awaiters and no awaiter resolves twice.
//!
//! Matching on rendered text is a heuristic. Two identical texts sent to the
//! same chat inside the skew window are indistinguishable; the earlier
//! registration takes the earlier row.

use crate::messages::Message;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::Instant;

pub type PendingId = u64;

/// Lifecycle of a pending send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Pending,
    Resolved,
    TimedOut,
    Failed,
}

/// The row a dispatched send is waiting for
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub id: PendingId,
    pub chat_guid: String,
    pub expected_text: String,
    pub is_attachment: bool,
    /// Client correlation id, echoed on the broadcast row
    pub temp_guid: Option<String>,
    /// Rows dated before this cannot satisfy the awaiter
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub state: PendingState,
    pub result: Option<Message>,
}

impl PendingSend {
    /// `skew` widens the floor to absorb clock drift between Messages.app and us
    pub fn new(chat_guid: &str, expected_text: &str, is_attachment: bool, skew: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            chat_guid: chat_guid.to_string(),
            expected_text: expected_text.to_string(),
            is_attachment,
            temp_guid: None,
            not_before: now - skew,
            created_at: now,
            state: PendingState::Pending,
            result: None,
        }
    }

    pub fn text(chat_guid: &str, text: &str, skew: Duration) -> Self {
        Self::new(chat_guid, text, false, skew)
    }

    pub fn attachment(chat_guid: &str, skew: Duration) -> Self {
        Self::new(chat_guid, "", true, skew)
    }

    pub fn with_temp_guid(mut self, temp_guid: &str) -> Self {
        self.temp_guid = Some(temp_guid.to_string());
        self
    }

    /// Same chat, not before the floor, and either the text or the attachment flag fits
    pub fn matches(&self, row: &Message) -> bool {
        if row.chat_guid != self.chat_guid || row.date < self.not_before {
            return false;
        }
        let text_hit = texts_match(&row.text, &self.expected_text);
        let attachment_hit = self.is_attachment && !row.attachments.is_empty();
        text_hit || attachment_hit
    }
}

/// Compare rendered texts, ignoring surrounding whitespace and U+FFFC placeholders
pub fn texts_match(a: &str, b: &str) -> bool {
    let a = normalize_text(a);
    let b = normalize_text(b);
    !a.is_empty() && a == b
}

fn normalize_text(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\u{fffc}')
}

struct Entry<S> {
    pending: PendingSend,
    deadline: Instant,
    responder: S,
}

/// Ordered set of active awaiters, generic over how each one is settled
pub struct AwaiterPool<S> {
    entries: Vec<Entry<S>>,
}

impl<S> Default for AwaiterPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> AwaiterPool<S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, pending: PendingSend, deadline: Instant, responder: S) {
        self.entries.push(Entry {
            pending,
            deadline,
            responder,
        });
    }

    /// First awaiter (oldest registration) that the row satisfies, removed from the pool
    pub fn claim(&mut self, row: &Message) -> Option<(PendingSend, S)> {
        let idx = self.entries.iter().position(|e| e.pending.matches(row))?;
        let Entry {
            mut pending,
            responder,
            ..
        } = self.entries.remove(idx);
        pending.state = PendingState::Resolved;
        pending.result = Some(row.clone());
        Some((pending, responder))
    }

    /// Remove every awaiter whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(PendingSend, S)> {
        let (expired, active): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| e.deadline <= now);
        self.entries = active;
        expired
            .into_iter()
            .map(|mut e| {
                e.pending.state = PendingState::TimedOut;
                (e.pending, e.responder)
            })
            .collect()
    }

    pub fn cancel(&mut self, id: PendingId) -> Option<(PendingSend, S)> {
        let idx = self.entries.iter().position(|e| e.pending.id == id)?;
        let mut entry = self.entries.remove(idx);
        entry.pending.state = PendingState::Failed;
        Some((entry.pending, entry.responder))
    }

    /// Drain everything (shutdown)
    pub fn drain(&mut self) -> Vec<(PendingSend, S)> {
        self.entries
            .drain(..)
            .map(|mut e| {
                e.pending.state = PendingState::Failed;
                (e.pending, e.responder)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Attachment;

    const CHAT: &str = "iMessage;-;+15551234567";

    fn row(chat: &str, text: &str, date: DateTime<Utc>) -> Message {
        Message::sent(&format!("guid-{}", text), chat, text, date)
    }

    fn pending(id: PendingId, text: &str) -> PendingSend {
        let mut p = PendingSend::text(CHAT, text, Duration::seconds(10));
        p.id = id;
        p
    }

    #[test]
    fn test_not_before_has_skew() {
        let p = PendingSend::text(CHAT, "hello", Duration::seconds(10));
        assert_eq!(p.created_at - p.not_before, Duration::seconds(10));
        assert_eq!(p.state, PendingState::Pending);
    }

    #[test]
    fn test_match_requires_same_chat() {
        let p = pending(1, "hello");
        assert!(p.matches(&row(CHAT, "hello", Utc::now())));
        assert!(!p.matches(&row("iMessage;-;+15550000000", "hello", Utc::now())));
    }

    #[test]
    fn test_match_respects_floor() {
        let p = pending(1, "hello");
        let too_old = p.not_before - Duration::milliseconds(1);
        assert!(!p.matches(&row(CHAT, "hello", too_old)));
        assert!(p.matches(&row(CHAT, "hello", p.not_before)));
    }

    #[test]
    fn test_match_text_normalization() {
        let p = pending(1, "hello");
        assert!(p.matches(&row(CHAT, " hello\n", Utc::now())));
        assert!(p.matches(&row(CHAT, "\u{fffc}hello", Utc::now())));
        assert!(!p.matches(&row(CHAT, "Hello", Utc::now())));
    }

    #[test]
    fn test_empty_texts_never_match() {
        assert!(!texts_match("", ""));
        assert!(!texts_match("\u{fffc}", "  "));
    }

    #[test]
    fn test_attachment_awaiter_matches_on_attachments() {
        let mut p = PendingSend::attachment(CHAT, Duration::seconds(10));
        p.id = 1;
        let mut r = row(CHAT, "\u{fffc}", Utc::now());
        assert!(!p.matches(&r));
        r.attachments.push(Attachment {
            guid: "att".to_string(),
            path: "/tmp/a.png".to_string(),
            mime_type: "image/png".to_string(),
            transfer_name: "a.png".to_string(),
            total_bytes: 10,
        });
        assert!(p.matches(&r));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let mut pool = AwaiterPool::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        pool.push(pending(1, "A"), deadline, "a");
        pool.push(pending(2, "B"), deadline, "b");

        let (p, who) = pool.claim(&row(CHAT, "A", Utc::now())).unwrap();
        assert_eq!((p.id, who), (1, "a"));
        assert_eq!(p.state, PendingState::Resolved);
        assert_eq!(p.result.unwrap().text, "A");

        // Same row again finds nobody
        assert!(pool.claim(&row(CHAT, "A", Utc::now())).is_none());

        let (p, _) = pool.claim(&row(CHAT, "B", Utc::now())).unwrap();
        assert_eq!(p.id, 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_oldest_awaiter_wins_tie() {
        let mut pool = AwaiterPool::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        pool.push(pending(1, "same"), deadline, ());
        pool.push(pending(2, "same"), deadline, ());

        assert_eq!(pool.claim(&row(CHAT, "same", Utc::now())).unwrap().0.id, 1);
        assert_eq!(pool.claim(&row(CHAT, "same", Utc::now())).unwrap().0.id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_past_deadline() {
        let mut pool = AwaiterPool::new();
        let now = Instant::now();
        pool.push(pending(1, "A"), now + std::time::Duration::from_secs(5), ());
        pool.push(pending(2, "B"), now + std::time::Duration::from_secs(30), ());

        let expired = pool.expire(now + std::time::Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.id, 1);
        assert_eq!(expired[0].0.state, PendingState::TimedOut);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut pool = AwaiterPool::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        pool.push(pending(7, "A"), deadline, ());
        let (p, _) = pool.cancel(7).unwrap();
        assert_eq!(p.state, PendingState::Failed);
        assert!(pool.cancel(7).is_none());
    }
}
