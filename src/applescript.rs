//! AppleScript send mechanism
//!
//! Drives Messages.app through `osascript`. Plain text and file sends only.

use crate::config::Config;
use crate::dispatcher::{ActionBackend, ActionResult, SendMeta};
use crate::error::{Error, Result};
use crate::reaction::Reaction;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// How long to let Messages.app finish launching before the first send
const LAUNCH_SETTLE: Duration = Duration::from_secs(2);

pub struct AppleScriptBackend {
    osascript: PathBuf,
}

impl AppleScriptBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            osascript: config.osascript.clone(),
        }
    }

    /// Check if Messages.app is running (exact process name)
    pub async fn is_running(&self) -> bool {
        let result = Command::new("pgrep").args(["-x", "Messages"]).output().await;
        matches!(result, Ok(o) if o.status.success())
    }

    async fn run_script(&self, script: &str) -> Result<String> {
        debug!(script, "running osascript");
        let output = Command::new(&self.osascript)
            .arg("-e")
            .arg(script)
            .output()
            .await
            .map_err(|e| Error::Dispatch(format!("osascript: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Dispatch(format!(
                "osascript failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ActionBackend for AppleScriptBackend {
    fn name(&self) -> &'static str {
        "apple-script"
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.is_running().await {
            return Ok(());
        }
        info!("Messages.app not running, launching");
        self.run_script("tell application \"Messages\" to launch").await?;
        tokio::time::sleep(LAUNCH_SETTLE).await;
        Ok(())
    }

    async fn send_text(&self, chat_guid: &str, text: &str, _meta: &SendMeta) -> Result<ActionResult> {
        self.run_script(&text_script(chat_guid, text)).await?;
        Ok(ActionResult::Acknowledged)
    }

    async fn send_attachment(&self, chat_guid: &str, path: &Path) -> Result<ActionResult> {
        self.run_script(&file_script(chat_guid, path)).await?;
        Ok(ActionResult::Acknowledged)
    }

    async fn send_reaction(&self, _chat_guid: &str, _target_guid: &str, _reaction: Reaction) -> Result<ActionResult> {
        Err(Error::Dispatch(
            "reactions cannot be sent through AppleScript".to_string(),
        ))
    }

    async fn set_typing(&self, _chat_guid: &str, _typing: bool) -> Result<()> {
        Err(Error::Dispatch(
            "typing indicators cannot be set through AppleScript".to_string(),
        ))
    }
}

/// Escape a value for use inside an AppleScript string literal
pub fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn text_script(chat_guid: &str, text: &str) -> String {
    format!(
        "tell application \"Messages\"\n\
         \tset targetChat to a reference to chat id \"{}\"\n\
         \tsend \"{}\" to targetChat\n\
         end tell",
        escape(chat_guid),
        escape(text)
    )
}

fn file_script(chat_guid: &str, path: &Path) -> String {
    format!(
        "set theFile to (POSIX file \"{}\") as alias\n\
         tell application \"Messages\"\n\
         \tset targetChat to a reference to chat id \"{}\"\n\
         \tsend theFile to targetChat\n\
         end tell",
        escape(&path.display().to_string()),
        escape(chat_guid)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape(r"C:\path"), r"C:\\path");
    }

    #[test]
    fn test_text_script_targets_chat() {
        let script = text_script("iMessage;-;+15551234567", "he said \"yo\"");
        assert!(script.contains("chat id \"iMessage;-;+15551234567\""));
        assert!(script.contains("send \"he said \\\"yo\\\"\" to targetChat"));
    }

    #[test]
    fn test_file_script_uses_posix_path() {
        let script = file_script("chat", Path::new("/tmp/a b/pic.png"));
        assert!(script.starts_with("set theFile to (POSIX file \"/tmp/a b/pic.png\") as alias"));
        assert!(script.contains("send theFile to targetChat"));
    }

    #[tokio::test]
    async fn test_reaction_unsupported() {
        let backend = AppleScriptBackend::new(&Config::default());
        let reaction: Reaction = "love".parse().unwrap();
        let err = backend.send_reaction("chat", "target", reaction).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }

    #[tokio::test]
    async fn test_missing_osascript_is_dispatch_error() {
        let backend = AppleScriptBackend {
            osascript: PathBuf::from("/nonexistent/osascript"),
        };
        let err = backend
            .send_text("chat", "hi", &SendMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }
}
