//! iMessage bridge - Rust daemon
//!
//! Serves Messages.app's chat.db over HTTP and WebSocket, and sends messages,
//! attachments and reactions. A send is answered with the database row it
//! produced, found by matching newly observed rows against registered awaiters.

pub mod applescript;
pub mod attributed_body;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_cache;
pub mod messages;
pub mod observer;
pub mod pending;
pub mod private_api;
pub mod queue;
pub mod reaction;
pub mod reconciler;
pub mod server;
pub mod service;
pub mod socket;
pub mod uploads;

pub use error::{Error, Result};
