//! Private API helper client
//!
//! The helper runs inside Messages.app and listens on a local TCP port.
//! Requests and replies are newline-delimited JSON, correlated by `transactionId`.

use crate::dispatcher::{ActionBackend, ActionResult, SendMeta};
use crate::error::{Error, Result};
use crate::reaction::Reaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Request<'a> {
    action: &'a str,
    data: Value,
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reply {
    transaction_id: Option<String>,
    identifier: Option<String>,
    error: Option<String>,
}

pub struct PrivateApiBackend {
    addr: String,
    reply_timeout: Duration,
}

impl PrivateApiBackend {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Send one action and wait for its reply
    async fn call(&self, action: &str, data: Value) -> Result<ActionResult> {
        let transaction_id = Uuid::new_v4().to_string();
        let request = Request {
            action,
            data,
            transaction_id: transaction_id.clone(),
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        debug!(action, transaction_id = %transaction_id, addr = %self.addr, "private API request");

        // Until the request is written nothing has reached the helper
        let stream = tokio::time::timeout(self.reply_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Dispatch(format!("private API connect {}: timed out", self.addr)))?
            .map_err(|e| Error::Dispatch(format!("private API connect {}: {}", self.addr, e)))?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Dispatch(format!("private API write: {}", e)))?;

        tokio::time::timeout(self.reply_timeout, read_reply(reader, &transaction_id))
            .await
            .map_err(|_| {
                Error::NoReply(format!(
                    "private API did not reply to {} within {}s",
                    action,
                    self.reply_timeout.as_secs()
                ))
            })?
    }
}

/// Read lines until the reply for `transaction_id` shows up
async fn read_reply(reader: OwnedReadHalf, transaction_id: &str) -> Result<ActionResult> {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(Error::NoReply(
                    "private API closed the connection without replying".to_string(),
                ))
            }
            Err(e) => return Err(Error::NoReply(format!("private API read: {}", e))),
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply: Reply = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable private API line");
                continue;
            }
        };
        if reply.transaction_id.as_deref() == Some(transaction_id) {
            return reply_to_result(reply);
        }
    }
}

fn reply_to_result(reply: Reply) -> Result<ActionResult> {
    if let Some(error) = reply.error.filter(|e| !e.is_empty()) {
        return Err(Error::Dispatch(error));
    }
    Ok(match reply.identifier.filter(|i| !i.is_empty()) {
        Some(guid) => ActionResult::Identifier(guid),
        None => ActionResult::Acknowledged,
    })
}

#[async_trait]
impl ActionBackend for PrivateApiBackend {
    fn name(&self) -> &'static str {
        "private-api"
    }

    async fn ensure_running(&self) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, chat_guid: &str, text: &str, meta: &SendMeta) -> Result<ActionResult> {
        self.call(
            "send-message",
            json!({
                "chatGuid": chat_guid,
                "message": text,
                "subject": meta.subject,
                "effectId": meta.effect_id,
                "selectedMessageGuid": meta.selected_message_guid,
            }),
        )
        .await
    }

    async fn send_attachment(&self, chat_guid: &str, path: &Path) -> Result<ActionResult> {
        self.call(
            "send-attachment",
            json!({
                "chatGuid": chat_guid,
                "filePath": path.display().to_string(),
            }),
        )
        .await
    }

    async fn send_reaction(&self, chat_guid: &str, target_guid: &str, reaction: Reaction) -> Result<ActionResult> {
        self.call(
            "send-reaction",
            json!({
                "chatGuid": chat_guid,
                "selectedMessageGuid": target_guid,
                "reactionType": reaction.to_string(),
            }),
        )
        .await
    }

    async fn set_typing(&self, chat_guid: &str, typing: bool) -> Result<()> {
        let action = if typing { "start-typing" } else { "stop-typing" };
        self.call(action, json!({ "chatGuid": chat_guid })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake helper: answers every request line with `respond(request)`
    async fn fake_helper(respond: fn(&Value) -> Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        // Noise from another transaction first
                        writer.write_all(b"{\"transactionId\":\"other\"}\n").await.unwrap();
                        let mut reply = respond(&request).to_string();
                        reply.push('\n');
                        writer.write_all(reply.as_bytes()).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_text_returns_identifier() {
        let addr = fake_helper(|req| {
            assert_eq!(req["action"], "send-message");
            assert_eq!(req["data"]["message"], "hello");
            json!({ "transactionId": req["transactionId"], "identifier": "MSG-GUID-1" })
        })
        .await;

        let backend = PrivateApiBackend::new(&addr);
        let result = backend
            .send_text("iMessage;-;+15551234567", "hello", &SendMeta::default())
            .await
            .unwrap();
        assert_eq!(result, ActionResult::Identifier("MSG-GUID-1".to_string()));
    }

    #[tokio::test]
    async fn test_helper_error_is_dispatch_error() {
        let addr = fake_helper(|req| {
            json!({ "transactionId": req["transactionId"], "error": "chat does not exist" })
        })
        .await;

        let backend = PrivateApiBackend::new(&addr);
        let reaction: Reaction = "like".parse().unwrap();
        let err = backend.send_reaction("chat", "target", reaction).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(msg) if msg == "chat does not exist"));
    }

    #[tokio::test]
    async fn test_typing_acknowledged() {
        let addr = fake_helper(|req| {
            assert_eq!(req["action"], "start-typing");
            json!({ "transactionId": req["transactionId"] })
        })
        .await;
        PrivateApiBackend::new(&addr).set_typing("chat", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let backend = PrivateApiBackend::new(&addr);
        let err = backend
            .send_text("chat", "hi", &SendMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }

    #[tokio::test]
    async fn test_silent_helper_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let backend = PrivateApiBackend::new(&addr).with_reply_timeout(Duration::from_millis(100));
        let err = backend
            .send_text("chat", "hi", &SendMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoReply(ref msg) if msg.contains("did not reply")));
        assert!(err.is_unknown_outcome());
    }

    #[tokio::test]
    async fn test_helper_hangs_up_after_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            // Take the request, then drop the connection unanswered
            let _ = lines.next_line().await;
        });

        let backend = PrivateApiBackend::new(&addr);
        let err = backend
            .send_text("chat", "hi", &SendMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoReply(_)));
    }
}
