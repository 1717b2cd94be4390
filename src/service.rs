//! Send service - the send pipeline shared by the HTTP and socket surfaces
//!
//! validate -> claim tempGuid -> register awaiter -> dispatch -> wait for row -> re-fetch.
//! The awaiter is always registered before the action fires.

use crate::config::{Config, DIRECT_FETCH_ATTEMPTS, DIRECT_FETCH_DELAY_MS};
use crate::dispatcher::{ActionDispatcher, ActionResult, SendMeta, SendMethod};
use crate::error::{Error, Result};
use crate::event_cache::EventCache;
use crate::messages::{Attachment, Chat, ChatQuery, Message, MessageCountQuery, MessageStore};
use crate::pending::PendingSend;
use crate::reaction::Reaction;
use crate::reconciler::{PendingHandle, PendingRegistry};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Text send request, as posted by clients
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextSend {
    pub chat_guid: String,
    pub temp_guid: String,
    pub message: String,
    pub method: Option<String>,
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    pub selected_message_guid: Option<String>,
}

/// Attachment send; the file is already on disk
#[derive(Debug, Clone, Default)]
pub struct AttachmentSend {
    pub chat_guid: String,
    pub temp_guid: String,
    pub name: String,
    pub path: PathBuf,
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReactionSend {
    pub chat_guid: String,
    pub selected_message_guid: String,
    /// Rendered text of the target; looked up when absent
    pub selected_message_text: Option<String>,
    pub reaction: String,
    pub temp_guid: Option<String>,
}

/// Cheap to clone; every clone drives the same pipeline
#[derive(Clone)]
pub struct SendService {
    store: Arc<dyn MessageStore>,
    cache: Arc<EventCache>,
    registry: PendingRegistry,
    dispatcher: Arc<ActionDispatcher>,
    skew: chrono::Duration,
    direct_fetch_delay: Duration,
}

impl SendService {
    pub fn new(
        config: &Config,
        store: Arc<dyn MessageStore>,
        cache: Arc<EventCache>,
        registry: PendingRegistry,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            dispatcher: Arc::new(dispatcher),
            skew: chrono::Duration::seconds(config.not_before_skew_secs),
            direct_fetch_delay: Duration::from_millis(DIRECT_FETCH_DELAY_MS),
        }
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn event_cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    /// Run a store query off the async runtime
    pub async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn MessageStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::CommandFailed(format!("store query task: {}", e)))?
    }

    pub async fn get_chat(&self, guid: &str) -> Result<Chat> {
        let key = guid.to_string();
        self.with_store(move |s| s.get_chat(&key))
            .await?
            .ok_or_else(|| Error::ChatNotFound(guid.to_string()))
    }

    pub async fn get_chats(&self, query: ChatQuery) -> Result<Vec<Chat>> {
        self.with_store(move |s| s.get_chats(&query)).await
    }

    pub async fn get_message(&self, guid: &str) -> Result<Message> {
        let key = guid.to_string();
        self.with_store(move |s| s.get_message(&key))
            .await?
            .ok_or_else(|| Error::MessageNotFound(guid.to_string()))
    }

    pub async fn get_attachment(&self, guid: &str) -> Result<Attachment> {
        let key = guid.to_string();
        self.with_store(move |s| s.get_attachment(&key))
            .await?
            .ok_or_else(|| Error::AttachmentNotFound(guid.to_string()))
    }

    pub async fn get_message_count(&self, query: MessageCountQuery) -> Result<i64> {
        self.with_store(move |s| s.get_message_count(&query)).await
    }

    pub async fn send_text(&self, req: TextSend) -> Result<Message> {
        require("chatGuid", &req.chat_guid)?;
        require("tempGuid", &req.temp_guid)?;
        require("message", &req.message)?;
        let method: SendMethod = req.method.as_deref().unwrap_or_default().parse()?;
        let meta = SendMeta {
            subject: req.subject.clone(),
            effect_id: req.effect_id.clone(),
            selected_message_guid: req.selected_message_guid.clone(),
        };

        self.get_chat(&req.chat_guid).await?;
        if let Some(target) = meta.selected_message_guid.as_deref().filter(|g| !g.is_empty()) {
            self.get_message(target).await?;
        }

        self.claim_temp_guid(&req.temp_guid)?;
        let pending = PendingSend::text(&req.chat_guid, &req.message, self.skew)
            .with_temp_guid(&req.temp_guid);
        let handle = self.register(pending, &req.temp_guid)?;

        let service = self.clone();
        detach(async move {
            let dispatched = service
                .dispatcher
                .dispatch_text(&req.chat_guid, &req.message, &req.temp_guid, method, &meta)
                .await;
            service.finish(handle, dispatched, Some(&req.temp_guid)).await
        })
        .await
    }

    pub async fn send_attachment(&self, req: AttachmentSend) -> Result<Message> {
        require("chatGuid", &req.chat_guid)?;
        require("tempGuid", &req.temp_guid)?;
        require("name", &req.name)?;
        let method: SendMethod = req.method.as_deref().unwrap_or_default().parse()?;
        if !tokio::fs::try_exists(&req.path).await.unwrap_or(false) {
            return Err(Error::Validation(format!(
                "attachment file does not exist: {}",
                req.path.display()
            )));
        }

        self.get_chat(&req.chat_guid).await?;

        self.claim_temp_guid(&req.temp_guid)?;
        let pending = PendingSend::attachment(&req.chat_guid, self.skew).with_temp_guid(&req.temp_guid);
        let handle = self.register(pending, &req.temp_guid)?;

        let service = self.clone();
        detach(async move {
            let dispatched = service
                .dispatcher
                .dispatch_attachment(&req.chat_guid, &req.path, &req.name, &req.temp_guid, method)
                .await;
            service.finish(handle, dispatched, Some(&req.temp_guid)).await
        })
        .await
    }

    pub async fn send_reaction(&self, req: ReactionSend) -> Result<Message> {
        require("chatGuid", &req.chat_guid)?;
        require("selectedMessageGuid", &req.selected_message_guid)?;
        let reaction: Reaction = req.reaction.parse()?;

        self.get_chat(&req.chat_guid).await?;
        let target = self.get_message(&req.selected_message_guid).await?;
        let target_text = match req.selected_message_text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => text.to_string(),
            None => describe_target(&target),
        };
        let expected = reaction.describe(&target_text);

        // tempGuid is optional for reactions; only a client-supplied one participates in dedup
        let temp_guid = match req.temp_guid.as_deref().filter(|g| !g.is_empty()) {
            Some(g) => {
                self.claim_temp_guid(g)?;
                Some(g.to_string())
            }
            None => None,
        };
        let queue_key = temp_guid.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let pending = PendingSend::text(&req.chat_guid, &expected, self.skew).with_temp_guid(&queue_key);
        let handle = match self.registry.register(pending) {
            Ok(h) => h,
            Err(e) => {
                if let Some(g) = &temp_guid {
                    self.cache.remove(g);
                }
                return Err(e);
            }
        };

        let service = self.clone();
        detach(async move {
            let dispatched = service
                .dispatcher
                .dispatch_reaction(&req.chat_guid, &req.selected_message_guid, reaction, &expected, &queue_key)
                .await;
            service.finish(handle, dispatched, temp_guid.as_deref()).await
        })
        .await
    }

    pub async fn start_typing(&self, chat_guid: &str) -> Result<()> {
        require("chatGuid", chat_guid)?;
        self.get_chat(chat_guid).await?;
        self.dispatcher.set_typing(chat_guid, true).await
    }

    pub async fn stop_typing(&self, chat_guid: &str) -> Result<()> {
        require("chatGuid", chat_guid)?;
        self.get_chat(chat_guid).await?;
        self.dispatcher.set_typing(chat_guid, false).await
    }

    fn claim_temp_guid(&self, temp_guid: &str) -> Result<()> {
        if !self.cache.try_add(temp_guid) {
            warn!(temp_guid, "duplicate send rejected");
            return Err(Error::DuplicateInFlight(temp_guid.to_string()));
        }
        Ok(())
    }

    fn register(&self, pending: PendingSend, temp_guid: &str) -> Result<PendingHandle> {
        self.registry.register(pending).inspect_err(|_| self.cache.remove(temp_guid))
    }

    /// Wait for the dispatched send's row, or unwind if the dispatch failed
    async fn finish(
        &self,
        handle: PendingHandle,
        dispatched: Result<ActionResult>,
        temp_guid: Option<&str>,
    ) -> Result<Message> {
        let id = handle.id();
        let row = match dispatched {
            Ok(ActionResult::Acknowledged) => handle.wait().await?,
            Ok(ActionResult::Identifier(guid)) => {
                let wait = handle.wait();
                tokio::pin!(wait);
                tokio::select! {
                    result = &mut wait => result?,
                    Some(found) = self.direct_fetch(&guid) => {
                        debug!(id, guid = %guid, "send resolved by identifier");
                        self.registry.resolve_by_identifier(id, &found.guid);
                        found
                    }
                }
            }
            // The action may have gone through; its row can still turn up before the deadline
            Err(e) if e.is_unknown_outcome() => {
                warn!(id, temp_guid = ?temp_guid, error = %e, "send outcome unknown; waiting for its row");
                handle.wait().await?
            }
            Err(e) => {
                self.registry.cancel(id, "send action failed");
                if let Some(g) = temp_guid {
                    self.cache.remove(g);
                }
                return Err(e);
            }
        };

        info!(guid = %row.guid, chat = %row.chat_guid, temp_guid = ?temp_guid, "send confirmed");
        self.refetch(row).await
    }

    /// Poll the store for a message the helper reported by GUID
    async fn direct_fetch(&self, guid: &str) -> Option<Message> {
        for attempt in 0..DIRECT_FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.direct_fetch_delay).await;
            }
            let key = guid.to_string();
            match self.with_store(move |s| s.get_message(&key)).await {
                Ok(Some(message)) if !message.chat_guid.is_empty() => return Some(message),
                Ok(_) => {}
                Err(e) => debug!(guid, error = %e, "direct fetch failed"),
            }
        }
        None
    }

    /// Full message for the response; the matched row stands in if the store has no better copy
    async fn refetch(&self, row: Message) -> Result<Message> {
        let key = row.guid.clone();
        match self.with_store(move |s| s.get_message(&key)).await {
            Ok(Some(full)) => Ok(full),
            Ok(None) => Ok(row),
            Err(e) => {
                warn!(guid = %row.guid, error = %e, "re-fetch failed; returning observed row");
                Ok(row)
            }
        }
    }
}

/// Run the rest of a send on its own task. Dropping the caller abandons only
/// the wait; the action, its rollback and the awaiter still run to the end.
async fn detach<F>(send: F) -> Result<Message>
where
    F: Future<Output = Result<Message>> + Send + 'static,
{
    tokio::spawn(send)
        .await
        .map_err(|e| Error::CommandFailed(format!("send task: {}", e)))?
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// How Messages.app names a reaction target that has no text of its own
fn describe_target(target: &Message) -> String {
    let text = target.text.trim_matches(|c: char| c.is_whitespace() || c == '\u{fffc}');
    if !text.is_empty() {
        return text.to_string();
    }
    match target.attachments.first().map(|a| a.mime_type.as_str()) {
        Some(mime) if mime.starts_with("image/") => "an image".to_string(),
        Some(mime) if mime.starts_with("video/") => "a movie".to_string(),
        Some(mime) if mime.starts_with("audio/") => "an audio message".to_string(),
        _ => "an attachment".to_string(),
    }
}
