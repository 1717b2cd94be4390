//! Messages.app database reader
//!
//! Reads chats, messages and attachments from ~/Library/Messages/chat.db.
//! The database is written by Messages.app; this side only ever opens it read-only.

use crate::attributed_body;
use crate::config::{Config, MACOS_EPOCH_OFFSET};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A message row from Messages.app
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "originalROWID")]
    pub rowid: i64,
    pub guid: String,
    /// Chat GUID, e.g. `iMessage;-;+15551234567`. Empty if the join row is missing.
    pub chat_guid: String,
    pub chat_identifier: Option<String>,
    pub handle: Option<String>,
    pub text: String,
    #[serde(rename = "dateCreated", with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub is_from_me: bool,
    pub attachments: Vec<Attachment>,
    pub associated_message_guid: Option<String>,
    pub associated_message_type: Option<i64>,
    pub thread_originator_guid: Option<String>,
    pub subject: Option<String>,
    pub expressive_send_style_id: Option<String>,
}

impl Message {
    /// A message sent from this account with no extra metadata
    pub fn sent(guid: &str, chat_guid: &str, text: &str, date: DateTime<Utc>) -> Self {
        Self {
            rowid: 0,
            guid: guid.to_string(),
            chat_guid: chat_guid.to_string(),
            chat_identifier: None,
            handle: None,
            text: text.to_string(),
            date,
            is_from_me: true,
            attachments: Vec::new(),
            associated_message_guid: None,
            associated_message_type: None,
            thread_originator_guid: None,
            subject: None,
            expressive_send_style_id: None,
        }
    }
}

/// An attachment row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub guid: String,
    pub path: String,
    pub mime_type: String,
    pub transfer_name: String,
    pub total_bytes: i64,
}

/// A chat row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(rename = "originalROWID")]
    pub rowid: i64,
    pub guid: String,
    pub chat_identifier: String,
    pub display_name: Option<String>,
    pub style: Option<i32>,
    pub service_name: Option<String>,
}

impl Chat {
    /// Style 43 = group, 45 = 1:1
    pub fn is_group(&self) -> bool {
        self.style == Some(43)
    }
}

/// Filter for chat listing
#[derive(Debug, Clone, Default)]
pub struct ChatQuery {
    /// Substring matched against identifier and display name
    pub query: Option<String>,
    pub limit: Option<u32>,
}

/// Filter for message counts
#[derive(Debug, Clone, Default)]
pub struct MessageCountQuery {
    pub chat_guid: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub is_from_me: Option<bool>,
}

/// Read-only view of the iMessage store
///
/// `MessagesReader` is the real implementation; tests substitute in-memory fakes.
pub trait MessageStore: Send + Sync {
    fn get_chats(&self, query: &ChatQuery) -> Result<Vec<Chat>>;
    fn get_chat(&self, guid: &str) -> Result<Option<Chat>>;
    fn get_message(&self, guid: &str) -> Result<Option<Message>>;
    fn get_attachment(&self, guid: &str) -> Result<Option<Attachment>>;
    fn get_message_count(&self, query: &MessageCountQuery) -> Result<i64>;
}

const MESSAGE_SELECT: &str = r#"
    SELECT
        message.ROWID,
        message.guid,
        message.date,
        handle.id,
        message.text,
        message.attributedBody,
        message.cache_has_attachments,
        message.is_from_me,
        chat.guid,
        chat.chat_identifier,
        message.associated_message_guid,
        message.associated_message_type,
        message.thread_originator_guid,
        message.subject,
        message.expressive_send_style_id
    FROM message
    LEFT JOIN handle ON message.handle_id = handle.ROWID
    LEFT JOIN chat_message_join ON message.ROWID = chat_message_join.message_id
    LEFT JOIN chat ON chat_message_join.chat_id = chat.ROWID
"#;

const CHAT_SELECT: &str = r#"
    SELECT ROWID, guid, chat_identifier, display_name, style, service_name
    FROM chat
"#;

/// Raw columns of a message row, before attachment lookup
struct RawMessage {
    rowid: i64,
    guid: String,
    date: i64,
    handle: Option<String>,
    text: Option<String>,
    attributed_body: Option<Vec<u8>>,
    has_attachments: bool,
    is_from_me: bool,
    chat_guid: Option<String>,
    chat_identifier: Option<String>,
    associated_message_guid: Option<String>,
    associated_message_type: Option<i64>,
    thread_originator_guid: Option<String>,
    subject: Option<String>,
    expressive_send_style_id: Option<String>,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rowid: row.get(0)?,
            guid: row.get(1)?,
            date: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            handle: row.get(3)?,
            text: row.get(4)?,
            attributed_body: row.get(5)?,
            has_attachments: row.get::<_, Option<i32>>(6)?.unwrap_or(0) != 0,
            is_from_me: row.get::<_, Option<i32>>(7)?.unwrap_or(0) != 0,
            chat_guid: row.get(8)?,
            chat_identifier: row.get(9)?,
            associated_message_guid: row.get(10)?,
            associated_message_type: row.get(11)?,
            thread_originator_guid: row.get(12)?,
            subject: row.get(13)?,
            expressive_send_style_id: row.get(14)?,
        })
    }
}

/// Reader for Messages.app database
pub struct MessagesReader {
    db_path: PathBuf,
}

impl MessagesReader {
    pub fn new(config: &Config) -> Self {
        Self {
            db_path: config.messages_db.clone(),
        }
    }

    pub fn with_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Open database connection (read-only to avoid lock contention)
    fn open_db(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// Get messages newer than the given ROWID, in ROWID order
    pub fn poll(&self, since_rowid: i64) -> Result<Vec<Message>> {
        let conn = self.open_db()?;
        let sql = format!("{} WHERE message.ROWID > ?1 ORDER BY message.ROWID ASC", MESSAGE_SELECT);
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map([since_rowid], RawMessage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut messages = Vec::with_capacity(raws.len());
        for mut raw in raws {
            if raw.chat_guid.is_none() {
                self.requery_chat(&conn, &mut raw);
            }
            messages.push(self.hydrate(&conn, raw)?);
        }

        Ok(messages)
    }

    /// Get the maximum ROWID (where the observer starts)
    pub fn get_max_rowid(&self) -> Result<i64> {
        let conn = self.open_db()?;
        let rowid: Option<i64> =
            conn.query_row("SELECT MAX(ROWID) FROM message", [], |row| row.get(0))?;
        Ok(rowid.unwrap_or(0))
    }

    /// Messages.app can insert the message row before its chat_message_join row.
    /// Give the join one short chance to appear.
    fn requery_chat(&self, conn: &Connection, raw: &mut RawMessage) {
        let started = std::time::Instant::now();
        std::thread::sleep(Duration::from_millis(50));

        let requery: rusqlite::Result<Option<(Option<String>, Option<String>)>> = conn
            .query_row(
                r#"
                SELECT chat.guid, chat.chat_identifier
                FROM chat_message_join
                JOIN chat ON chat_message_join.chat_id = chat.ROWID
                WHERE chat_message_join.message_id = ?1
                "#,
                [raw.rowid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional();

        let elapsed_ms = started.elapsed().as_millis();
        match requery {
            Ok(Some((guid, identifier))) => {
                info!(rowid = raw.rowid, elapsed_ms, chat_guid = ?guid, "chat join found after re-query");
                raw.chat_guid = guid;
                raw.chat_identifier = identifier;
            }
            Ok(None) => {
                warn!(rowid = raw.rowid, elapsed_ms, "chat join still missing after re-query");
            }
            Err(e) => {
                warn!(rowid = raw.rowid, elapsed_ms, error = ?e, "chat re-query failed");
            }
        }
    }

    fn hydrate(&self, conn: &Connection, raw: RawMessage) -> Result<Message> {
        let text = match (&raw.text, &raw.attributed_body) {
            (Some(t), _) if !t.is_empty() && t != "\u{fffc}" => t.clone(),
            (_, Some(blob)) => attributed_body::decode_text(blob).unwrap_or_default(),
            (Some(t), None) => t.clone(),
            (None, None) => String::new(),
        };

        let attachments = if raw.has_attachments {
            self.get_attachments(conn, raw.rowid)?
        } else {
            Vec::new()
        };

        Ok(Message {
            rowid: raw.rowid,
            guid: raw.guid,
            chat_guid: raw.chat_guid.unwrap_or_default(),
            chat_identifier: raw.chat_identifier,
            handle: raw.handle,
            text,
            date: macos_to_datetime(raw.date),
            is_from_me: raw.is_from_me,
            attachments,
            associated_message_guid: raw.associated_message_guid,
            associated_message_type: raw.associated_message_type,
            thread_originator_guid: raw.thread_originator_guid,
            subject: raw.subject,
            expressive_send_style_id: raw.expressive_send_style_id,
        })
    }

    /// Get attachments for a message
    fn get_attachments(&self, conn: &Connection, message_rowid: i64) -> Result<Vec<Attachment>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT
                attachment.guid,
                attachment.filename,
                attachment.mime_type,
                attachment.transfer_name,
                attachment.total_bytes
            FROM attachment
            JOIN message_attachment_join ON attachment.ROWID = message_attachment_join.attachment_id
            WHERE message_attachment_join.message_id = ?1
            "#,
        )?;

        let attachments = stmt
            .query_map([message_rowid], attachment_from_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(attachments)
    }
}

impl MessageStore for MessagesReader {
    fn get_chats(&self, query: &ChatQuery) -> Result<Vec<Chat>> {
        let conn = self.open_db()?;
        let pattern = format!("%{}%", query.query.as_deref().unwrap_or(""));
        let limit = query.limit.unwrap_or(1000) as i64;
        let sql = format!(
            "{} WHERE chat_identifier LIKE ?1 OR IFNULL(display_name, '') LIKE ?1 ORDER BY ROWID ASC LIMIT ?2",
            CHAT_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let chats = stmt
            .query_map(rusqlite::params![pattern, limit], chat_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chats)
    }

    fn get_chat(&self, guid: &str) -> Result<Option<Chat>> {
        let conn = self.open_db()?;
        let sql = format!("{} WHERE guid = ?1", CHAT_SELECT);
        let chat = conn.query_row(&sql, [guid], chat_from_row).optional()?;
        Ok(chat)
    }

    fn get_message(&self, guid: &str) -> Result<Option<Message>> {
        let conn = self.open_db()?;
        let sql = format!("{} WHERE message.guid = ?1", MESSAGE_SELECT);
        let raw = conn.query_row(&sql, [guid], RawMessage::from_row).optional()?;
        raw.map(|raw| self.hydrate(&conn, raw)).transpose()
    }

    fn get_attachment(&self, guid: &str) -> Result<Option<Attachment>> {
        let conn = self.open_db()?;
        let attachment = conn
            .query_row(
                "SELECT guid, filename, mime_type, transfer_name, total_bytes FROM attachment WHERE guid = ?1",
                [guid],
                attachment_from_row,
            )
            .optional()?;
        Ok(attachment)
    }

    fn get_message_count(&self, query: &MessageCountQuery) -> Result<i64> {
        let conn = self.open_db()?;
        let after = query.after.map(datetime_to_macos).unwrap_or(i64::MIN);
        let is_from_me = query.is_from_me.map(i32::from);
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(DISTINCT message.ROWID)
            FROM message
            LEFT JOIN chat_message_join ON message.ROWID = chat_message_join.message_id
            LEFT JOIN chat ON chat_message_join.chat_id = chat.ROWID
            WHERE (?1 IS NULL OR chat.guid = ?1)
              AND message.date > ?2
              AND (?3 IS NULL OR message.is_from_me = ?3)
            "#,
            rusqlite::params![query.chat_guid, after, is_from_me],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        rowid: row.get(0)?,
        guid: row.get(1)?,
        chat_identifier: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        display_name: row.get::<_, Option<String>>(3)?.filter(|n| !n.is_empty()),
        style: row.get(4)?,
        service_name: row.get(5)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let guid: String = row.get(0)?;
    let filename: Option<String> = row.get(1)?;
    let mime_type: Option<String> = row.get(2)?;
    let transfer_name: Option<String> = row.get(3)?;
    let total_bytes: Option<i64> = row.get(4)?;

    let path = filename.map(|p| expand_home(&p)).unwrap_or_default();
    let transfer_name = transfer_name.unwrap_or_else(|| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    Ok(Attachment {
        guid,
        path,
        mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
        transfer_name,
        total_bytes: total_bytes.unwrap_or(0),
    })
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest).to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string()),
        None => path.to_string(),
    }
}

/// Convert a chat.db `date` to DateTime<Utc>.
/// Modern databases store nanoseconds since 2001-01-01, older ones seconds.
pub fn macos_to_datetime(ts: i64) -> DateTime<Utc> {
    let (secs, nanos) = if ts.abs() > 10_000_000_000 {
        (ts.div_euclid(1_000_000_000), ts.rem_euclid(1_000_000_000) as u32)
    } else {
        (ts, 0)
    };
    DateTime::from_timestamp(secs + MACOS_EPOCH_OFFSET, nanos).unwrap_or_default()
}

/// Inverse of `macos_to_datetime`, in nanoseconds
pub fn datetime_to_macos(dt: DateTime<Utc>) -> i64 {
    let secs = dt.timestamp() - MACOS_EPOCH_OFFSET;
    secs * 1_000_000_000 + dt.timestamp_subsec_nanos() as i64
}
