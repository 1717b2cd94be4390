//! Action dispatcher - fires the platform send action
//!
//! Plain sends go through AppleScript. Rich sends (subject, effect, reply),
//! reactions and typing indicators need the private API helper. Nothing here
//! waits for the database row; that is the reconciler's job.

use crate::error::{Error, Result};
use crate::queue::{QueueItem, QueueStore};
use crate::reaction::Reaction;
use async_trait::async_trait;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the backend reported after issuing an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Fire-and-forget; the row must be found by the reconciler
    Acknowledged,
    /// Message GUID reported by the private helper, usable for a direct re-fetch
    Identifier(String),
}

/// Optional extras of a text send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMeta {
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    pub selected_message_guid: Option<String>,
}

impl SendMeta {
    pub fn is_rich(&self) -> bool {
        self.subject.as_deref().is_some_and(|s| !s.is_empty())
            || self.effect_id.as_deref().is_some_and(|s| !s.is_empty())
            || self.selected_message_guid.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMethod {
    #[default]
    AppleScript,
    PrivateApi,
}

impl FromStr for SendMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "apple-script" | "applescript" => Ok(SendMethod::AppleScript),
            "private-api" => Ok(SendMethod::PrivateApi),
            other => Err(Error::Validation(format!(
                "invalid method '{}'; expected apple-script or private-api",
                other
            ))),
        }
    }
}

/// A mechanism that can drive Messages.app
#[async_trait]
pub trait ActionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start Messages.app if it is not running. Idempotent.
    async fn ensure_running(&self) -> Result<()>;

    async fn send_text(&self, chat_guid: &str, text: &str, meta: &SendMeta) -> Result<ActionResult>;

    async fn send_attachment(&self, chat_guid: &str, path: &Path) -> Result<ActionResult>;

    async fn send_reaction(
        &self,
        chat_guid: &str,
        target_guid: &str,
        reaction: Reaction,
    ) -> Result<ActionResult>;

    async fn set_typing(&self, chat_guid: &str, typing: bool) -> Result<()>;
}

pub struct ActionDispatcher {
    basic: Arc<dyn ActionBackend>,
    private: Option<Arc<dyn ActionBackend>>,
    queue: Arc<QueueStore>,
}

impl ActionDispatcher {
    pub fn new(
        basic: Arc<dyn ActionBackend>,
        private: Option<Arc<dyn ActionBackend>>,
        queue: Arc<QueueStore>,
    ) -> Self {
        Self {
            basic,
            private,
            queue,
        }
    }

    fn private_backend(&self, what: &str) -> Result<&Arc<dyn ActionBackend>> {
        self.private
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("{} requires the private API, which is not enabled", what)))
    }

    /// Pick the backend and say whether it is the basic one
    fn select(&self, method: SendMethod, rich: bool) -> Result<(&Arc<dyn ActionBackend>, bool)> {
        if method == SendMethod::PrivateApi || rich {
            let what = if rich { "subject, effect or reply" } else { "private-api method" };
            Ok((self.private_backend(what)?, false))
        } else {
            Ok((&self.basic, true))
        }
    }

    pub async fn dispatch_text(
        &self,
        chat_guid: &str,
        text: &str,
        temp_guid: &str,
        method: SendMethod,
        meta: &SendMeta,
    ) -> Result<ActionResult> {
        let (backend, basic) = self.select(method, meta.is_rich())?;
        if basic {
            self.enqueue(temp_guid, chat_guid, text)?;
        }

        info!(chat = chat_guid, temp_guid, backend = backend.name(), "dispatching text");
        self.run(backend, temp_guid, basic, backend.send_text(chat_guid, text, meta))
            .await
    }

    pub async fn dispatch_attachment(
        &self,
        chat_guid: &str,
        path: &Path,
        name: &str,
        temp_guid: &str,
        method: SendMethod,
    ) -> Result<ActionResult> {
        let (backend, basic) = self.select(method, false)?;
        if basic {
            self.enqueue(temp_guid, chat_guid, name)?;
        }

        info!(chat = chat_guid, temp_guid, name, backend = backend.name(), "dispatching attachment");
        self.run(backend, temp_guid, basic, backend.send_attachment(chat_guid, path))
            .await
    }

    /// `expected_text` is the reconstructed row text, recorded before the action fires
    pub async fn dispatch_reaction(
        &self,
        chat_guid: &str,
        target_guid: &str,
        reaction: Reaction,
        expected_text: &str,
        temp_guid: &str,
    ) -> Result<ActionResult> {
        let backend = self.private_backend("reactions")?;
        self.enqueue(temp_guid, chat_guid, expected_text)?;

        info!(chat = chat_guid, target = target_guid, %reaction, temp_guid, "dispatching reaction");
        self.run(
            backend,
            temp_guid,
            true,
            backend.send_reaction(chat_guid, target_guid, reaction),
        )
        .await
    }

    pub async fn set_typing(&self, chat_guid: &str, typing: bool) -> Result<()> {
        let backend = self.private_backend("typing indicators")?;
        debug!(chat = chat_guid, typing, "toggling typing indicator");
        backend.set_typing(chat_guid, typing).await
    }

    fn enqueue(&self, temp_guid: &str, chat_guid: &str, text: &str) -> Result<()> {
        self.queue.add(QueueItem::new(temp_guid, chat_guid, text))
    }

    /// Ensure Messages.app is up, run the action, and drop the queue item if it failed outright
    async fn run(
        &self,
        backend: &Arc<dyn ActionBackend>,
        temp_guid: &str,
        queued: bool,
        action: impl std::future::Future<Output = Result<ActionResult>>,
    ) -> Result<ActionResult> {
        let result = match self.basic.ensure_running().await {
            Ok(()) => action.await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(temp_guid, backend = backend.name(), error = %e, "send action failed");
            // An unanswered action may still produce its row; the queue item ties it back
            if queued && !e.is_unknown_outcome() {
                if let Err(qe) = self.queue.remove(temp_guid) {
                    warn!(temp_guid, error = %qe, "failed to drop queue item");
                }
            }
        }
        result
    }
}
