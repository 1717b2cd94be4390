//! Error types for imessage-bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Message with tempGuid {0} is already being sent")]
    DuplicateInFlight(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("Send action failed: {0}")]
    Dispatch(String),

    /// The action was issued but no matching row showed up in time.
    /// The message may or may not have been delivered.
    #[error("Send outcome unknown: no matching message appeared within {0}s")]
    SendTimeout(u64),

    /// The private helper took the request but never answered it.
    /// Also an unknown outcome.
    #[error("Send outcome unknown: {0}")]
    NoReply(String),

    #[error("Send was cancelled: {0}")]
    Cancelled(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status code used by both the REST and socket surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::DuplicateInFlight(_) => 400,
            Error::Unauthorized => 401,
            Error::ChatNotFound(_) | Error::MessageNotFound(_) | Error::AttachmentNotFound(_) => {
                404
            }
            Error::SendTimeout(_) | Error::NoReply(_) => 504,
            _ => 500,
        }
    }

    /// The action may or may not have reached Messages.app
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, Error::SendTimeout(_) | Error::NoReply(_))
    }

    /// Turned away before any send action was attempted
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DuplicateInFlight(_)
                | Error::ChatNotFound(_)
                | Error::MessageNotFound(_)
        )
    }

    /// Stable machine-readable error type for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::DuplicateInFlight(_) => "duplicate_in_flight",
            Error::ChatNotFound(_) | Error::MessageNotFound(_) | Error::AttachmentNotFound(_) => {
                "not_found"
            }
            Error::Unauthorized => "unauthorized",
            Error::Dispatch(_) | Error::CommandFailed(_) => "send_failed",
            Error::SendTimeout(_) | Error::NoReply(_) => "unknown_outcome",
            Error::Cancelled(_) => "cancelled",
            _ => "server_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
