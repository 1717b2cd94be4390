//! Chunked attachment uploads from socket clients

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One `send-message-chunk` frame
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachmentChunk {
    pub attachment_guid: String,
    pub attachment_chunk_start: u64,
    /// Base64 bytes of this chunk
    pub attachment_data: String,
    pub has_more: bool,
    pub name: String,
    pub chat_guid: String,
    pub temp_guid: String,
    /// Text to send ahead of the attachment
    pub message: Option<String>,
    pub method: Option<String>,
}

/// Appends chunks to `<dir>/<attachmentGuid>/<name>`
pub struct ChunkAssembler {
    dir: PathBuf,
    // Appends are serialized so offsets are checked against a settled length
    write_lock: Mutex<()>,
}

impl ChunkAssembler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append a chunk. Returns the finished file once `hasMore` is false.
    pub async fn append(&self, chunk: &AttachmentChunk) -> Result<Option<PathBuf>> {
        let path = self.path_for(&chunk.attachment_guid, &chunk.name)?;
        let bytes = B64
            .decode(chunk.attachment_data.trim())
            .map_err(|e| Error::Validation(format!("attachmentData is not valid base64: {}", e)))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let current = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if chunk.attachment_chunk_start != current {
            return Err(Error::Validation(format!(
                "chunk starts at {} but {} bytes are already written",
                chunk.attachment_chunk_start, current
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        debug!(
            attachment = %chunk.attachment_guid,
            start = chunk.attachment_chunk_start,
            len = bytes.len(),
            has_more = chunk.has_more,
            "attachment chunk written"
        );

        Ok((!chunk.has_more).then_some(path))
    }

    /// Remove an upload that will never be sent, along with its per-upload directory
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove upload");
            }
        }
        if let Some(parent) = path.parent().filter(|p| *p != self.dir && p.starts_with(&self.dir)) {
            // Only succeeds once the directory is empty
            let _ = tokio::fs::remove_dir(parent).await;
        }
        debug!(path = %path.display(), "upload discarded");
    }

    /// Storage path for an upload; both parts must be plain file names
    pub fn path_for(&self, attachment_guid: &str, name: &str) -> Result<PathBuf> {
        if attachment_guid.is_empty()
            || !attachment_guid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "invalid attachmentGuid '{}'",
                attachment_guid
            )));
        }
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty() && n != "..")
            .ok_or_else(|| Error::Validation(format!("invalid attachment name '{}'", name)))?;
        Ok(self.dir.join(attachment_guid).join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(start: u64, data: &[u8], has_more: bool) -> AttachmentChunk {
        AttachmentChunk {
            attachment_guid: "upload-1".to_string(),
            attachment_chunk_start: start,
            attachment_data: B64.encode(data),
            has_more,
            name: "photo.jpg".to_string(),
            chat_guid: "chat".to_string(),
            temp_guid: "tmp".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chunks_assemble_in_order() {
        let temp = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new(temp.path());

        assert!(assembler.append(&chunk(0, b"hello ", true)).await.unwrap().is_none());
        let done = assembler.append(&chunk(6, b"world", false)).await.unwrap().unwrap();

        assert_eq!(done, temp.path().join("upload-1/photo.jpg"));
        assert_eq!(std::fs::read(done).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_rejected() {
        let temp = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new(temp.path());
        assembler.append(&chunk(0, b"abc", true)).await.unwrap();

        let err = assembler.append(&chunk(10, b"def", false)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // Replaying the first chunk is rejected too
        assert!(assembler.append(&chunk(0, b"abc", true)).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_base64_rejected() {
        let temp = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new(temp.path());
        let mut c = chunk(0, b"", false);
        c.attachment_data = "%%%".to_string();
        assert!(matches!(assembler.append(&c).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_discard_removes_file_and_directory() {
        let temp = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new(temp.path());
        let done = assembler.append(&chunk(0, b"bytes", false)).await.unwrap().unwrap();

        assembler.discard(&done).await;
        assert!(!done.exists());
        assert!(!temp.path().join("upload-1").exists());
        assert!(temp.path().exists());

        // Already gone is fine
        assembler.discard(&done).await;
    }

    #[test]
    fn test_path_for_rejects_traversal() {
        let assembler = ChunkAssembler::new("/tmp/uploads");
        assert!(assembler.path_for("../etc", "x").is_err());
        assert!(assembler.path_for("ok", "..").is_err());
        assert_eq!(
            assembler.path_for("ok", "../../secret.txt").unwrap(),
            PathBuf::from("/tmp/uploads/ok/secret.txt")
        );
    }
}
