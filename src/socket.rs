//! WebSocket surface
//!
//! Client -> server frames:
//! ```json
//! {"event": "send-message", "data": {"chatGuid": "...", "tempGuid": "...", "message": "hi"}, "ack": 1}
//! ```
//!
//! Replies echo `ack`, using the request's event name on success and
//! `<event>-error` on failure. The server also pushes `new-message` frames.

use crate::error::{Error, Result};
use crate::observer::NewMessageEvent;
use crate::server::{AppState, AuthQuery, ErrorBody};
use crate::service::{AttachmentSend, ReactionSend, TextSend};
use crate::uploads::AttachmentChunk;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub mod events {
    pub const SEND_MESSAGE: &str = "send-message";
    pub const SEND_MESSAGE_CHUNK: &str = "send-message-chunk";
    pub const SEND_REACTION: &str = "send-reaction";
    pub const STARTED_TYPING: &str = "started-typing";
    pub const STOPPED_TYPING: &str = "stopped-typing";
    pub const NEW_MESSAGE: &str = "new-message";
}

#[derive(Debug, Deserialize)]
struct Incoming {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Outgoing {
    event: String,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<Value>,
}

impl Outgoing {
    fn reply(event: &str, result: Result<Value>, ack: Option<Value>) -> Self {
        match result {
            Ok(data) => Self {
                event: event.to_string(),
                data,
                ack,
            },
            Err(e) => Self {
                event: format!("{}-error", event),
                data: json!({ "status": e.status_code(), "error": ErrorBody::from(&e) }),
                ack,
            },
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"error","data":{{"message":"encode failed: {}"}}}}"#, e)
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TypingRequest {
    chat_guid: String,
}

/// Upgrade handler; the password comes from the query string
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AuthQuery>,
    State(state): State<AppState>,
) -> Response {
    if !state.auth.check(query.password.as_deref()) {
        return Error::Unauthorized.into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// One task writes to the socket, one forwards broadcast rows, and the
/// read loop spawns a task per request so slow sends do not block the socket.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    info!("socket client connected");

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let events_task = tokio::spawn(forward_events(state.events.subscribe(), tx.clone()));

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let incoming: Incoming = match serde_json::from_str(text.as_str()) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "invalid socket frame");
                        let reply = Outgoing::reply(
                            "error",
                            Err(Error::Validation(format!("invalid frame: {}", e))),
                            None,
                        );
                        let _ = tx.send(reply.encode()).await;
                        continue;
                    }
                };
                handle_frame(&state, incoming, &tx).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // In-flight sends keep running; their replies go nowhere
    debug!("socket client disconnected");
    events_task.abort();
    drop(tx);
    let _ = sender_task.await;
}

async fn handle_frame(state: &AppState, incoming: Incoming, tx: &mpsc::Sender<String>) {
    let Incoming { event, data, ack } = incoming;

    // Chunks are appended in arrival order; only the final send runs in the background
    if event == events::SEND_MESSAGE_CHUNK {
        let chunk: AttachmentChunk = match from_data(data) {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(Outgoing::reply(&event, Err(e), ack).encode()).await;
                return;
            }
        };
        match state.uploads.append(&chunk).await {
            Ok(None) => {
                let data = json!({ "attachmentGuid": chunk.attachment_guid, "hasMore": true });
                let _ = tx.send(Outgoing::reply(&event, Ok(data), ack).encode()).await;
            }
            Ok(Some(path)) => {
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = finish_upload(&state, chunk, path).await;
                    let _ = tx.send(Outgoing::reply(&event, result, ack).encode()).await;
                });
            }
            Err(e) => {
                let _ = tx.send(Outgoing::reply(&event, Err(e), ack).encode()).await;
            }
        }
        return;
    }

    let state = state.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = handle_event(&state, &event, data).await;
        let _ = tx.send(Outgoing::reply(&event, result, ack).encode()).await;
    });
}

/// Run one request event and produce its reply payload
pub async fn handle_event(state: &AppState, event: &str, data: Value) -> Result<Value> {
    match event {
        events::SEND_MESSAGE => {
            let req: TextSend = from_data(data)?;
            let message = state.service.send_text(req).await?;
            Ok(serde_json::to_value(message)?)
        }
        events::SEND_REACTION => {
            let req: ReactionSend = from_data(data)?;
            let message = state.service.send_reaction(req).await?;
            Ok(serde_json::to_value(message)?)
        }
        events::STARTED_TYPING => {
            let req: TypingRequest = from_data(data)?;
            state.service.start_typing(&req.chat_guid).await?;
            Ok(json!({}))
        }
        events::STOPPED_TYPING => {
            let req: TypingRequest = from_data(data)?;
            state.service.stop_typing(&req.chat_guid).await?;
            Ok(json!({}))
        }
        other => Err(Error::Validation(format!("unknown event '{}'", other))),
    }
}

/// Send a fully assembled upload, with its text first if the client sent one.
/// A rejected upload is removed from disk.
pub async fn finish_upload(state: &AppState, chunk: AttachmentChunk, path: PathBuf) -> Result<Value> {
    let result = send_upload(state, chunk, path.clone()).await;
    if let Err(e) = &result {
        if e.is_rejection() {
            state.uploads.discard(&path).await;
        }
    }
    result
}

async fn send_upload(state: &AppState, chunk: AttachmentChunk, path: PathBuf) -> Result<Value> {
    if let Some(text) = chunk.message.as_deref().filter(|t| !t.trim().is_empty()) {
        let req = TextSend {
            chat_guid: chunk.chat_guid.clone(),
            temp_guid: format!("{}-text", chunk.temp_guid),
            message: text.to_string(),
            method: chunk.method.clone(),
            ..Default::default()
        };
        state.service.send_text(req).await?;
    }

    let req = AttachmentSend {
        chat_guid: chunk.chat_guid,
        temp_guid: chunk.temp_guid,
        name: chunk.name,
        path,
        method: chunk.method,
    };
    let message = state.service.send_attachment(req).await?;
    Ok(serde_json::to_value(message)?)
}

async fn forward_events(
    mut rows: broadcast::Receiver<NewMessageEvent>,
    tx: mpsc::Sender<String>,
) {
    loop {
        match rows.recv().await {
            Ok(event) => {
                let frame = Outgoing {
                    event: events::NEW_MESSAGE.to_string(),
                    data: serde_json::to_value(&event).unwrap_or(Value::Null),
                    ack: None,
                };
                if tx.send(frame.encode()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "socket client lagging; dropped new-message events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn from_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::Validation(format!("invalid event data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_minimal() {
        let frame: Incoming = serde_json::from_str(r#"{"event":"send-message"}"#).unwrap();
        assert_eq!(frame.event, "send-message");
        assert!(frame.data.is_null());
        assert!(frame.ack.is_none());
    }

    #[test]
    fn test_success_reply_echoes_ack() {
        let reply = Outgoing::reply("send-message", Ok(json!({"guid": "G"})), Some(json!(7)));
        let json: Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(json["event"], "send-message");
        assert_eq!(json["ack"], 7);
        assert_eq!(json["data"]["guid"], "G");
    }

    #[test]
    fn test_error_reply_uses_error_event() {
        let reply = Outgoing::reply(
            "send-reaction",
            Err(Error::DuplicateInFlight("t".to_string())),
            Some(json!("abc")),
        );
        let json: Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(json["event"], "send-reaction-error");
        assert_eq!(json["ack"], "abc");
        assert_eq!(json["data"]["status"], 400);
        assert_eq!(json["data"]["error"]["type"], "duplicate_in_flight");
    }

    #[test]
    fn test_reply_without_ack_omits_field() {
        let reply = Outgoing::reply("started-typing", Ok(json!({})), None);
        let json: Value = serde_json::from_str(&reply.encode()).unwrap();
        assert!(json.get("ack").is_none());
    }

    #[test]
    fn test_from_data_rejects_wrong_shape() {
        let err = from_data::<TypingRequest>(json!("nope")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
