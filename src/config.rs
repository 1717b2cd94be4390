//! Configuration and paths

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// All configurable paths and constants
#[derive(Clone)]
pub struct Config {
    pub messages_db: PathBuf,
    pub state_dir: PathBuf,
    pub queue_file: PathBuf,
    pub attachments_dir: PathBuf,
    pub osascript: PathBuf,
    pub host: String,
    pub port: u16,
    /// Shared secret clients pass as `password`. `None` rejects every request.
    pub password: Option<String>,
    /// Address of the private API helper, e.g. `127.0.0.1:45670`.
    pub private_api_addr: Option<String>,
    pub poll_interval_ms: u64,
    pub send_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub not_before_skew_secs: i64,
    pub event_cache_capacity: usize,
    pub event_cache_purge_secs: u64,
    pub queue_max_age_hours: i64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("messages_db", &self.messages_db)
            .field("state_dir", &self.state_dir)
            .field("attachments_dir", &self.attachments_dir)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("private_api_addr", &self.private_api_addr)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let bridge_dir = home.join("Library/Application Support/imessage-bridge");

        Self {
            messages_db: home.join("Library/Messages/chat.db"),
            state_dir: bridge_dir.join("state"),
            queue_file: bridge_dir.join("state/queue.json"),
            attachments_dir: bridge_dir.join("attachments"),
            osascript: PathBuf::from("/usr/bin/osascript"),
            host: "0.0.0.0".to_string(),
            port: 1234,
            password: None,
            private_api_addr: None,
            poll_interval_ms: 1000,
            send_timeout_secs: 30,
            sweep_interval_ms: 500,
            not_before_skew_secs: 10,
            event_cache_capacity: 10_000,
            event_cache_purge_secs: 6 * 60 * 60,
            queue_max_age_hours: 24,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            messages_db: temp_dir.join("chat.db"),
            state_dir: temp_dir.join("state"),
            queue_file: temp_dir.join("state/queue.json"),
            attachments_dir: temp_dir.join("attachments"),
            osascript: PathBuf::from("/usr/bin/osascript"),
            host: "127.0.0.1".to_string(),
            port: 0,
            password: Some("test-password".to_string()),
            private_api_addr: None,
            poll_interval_ms: 50,
            send_timeout_secs: 2,
            sweep_interval_ms: 50,
            not_before_skew_secs: 10,
            event_cache_capacity: 100,
            event_cache_purge_secs: 60,
            queue_max_age_hours: 24,
        }
    }

    /// Default config with `IMESSAGE_BRIDGE_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (split out so tests need not touch the process env)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("MESSAGES_DB") {
            self.messages_db = PathBuf::from(v);
        }
        if let Some(v) = var("STATE_DIR") {
            self.state_dir = PathBuf::from(&v);
            self.queue_file = self.state_dir.join("queue.json");
        }
        if let Some(v) = var("ATTACHMENTS_DIR") {
            self.attachments_dir = PathBuf::from(v);
        }
        if let Some(v) = var("HOST") {
            self.host = v;
        }
        if let Some(v) = var("PORT") {
            self.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = var("PASSWORD") {
            self.password = Some(v).filter(|p| !p.is_empty());
        }
        if let Some(v) = var("PRIVATE_API_ADDR") {
            self.private_api_addr = Some(v).filter(|a| !a.is_empty());
        }
        if let Some(v) = var("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("SEND_TIMEOUT_SECS") {
            self.send_timeout_secs = parse_var("SEND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("EVENT_CACHE_PURGE_SECS") {
            self.event_cache_purge_secs = parse_var("EVENT_CACHE_PURGE_SECS", &v)?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        if self.send_timeout_secs == 0 {
            return Err(Error::Config("send timeout must be non-zero".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep interval must be non-zero".to_string()));
        }
        if self.event_cache_purge_secs == 0 {
            return Err(Error::Config("event cache purge interval must be non-zero".to_string()));
        }
        if self.event_cache_capacity == 0 {
            return Err(Error::Config("event cache capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn event_cache_purge_interval(&self) -> Duration {
        Duration::from_secs(self.event_cache_purge_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}{} has invalid value '{}'", ENV_PREFIX, name, value)))
}

pub const ENV_PREFIX: &str = "IMESSAGE_BRIDGE_";

/// macOS epoch offset (2001-01-01 to 1970-01-01 in seconds)
pub const MACOS_EPOCH_OFFSET: i64 = 978307200;

/// Direct re-fetch of a private API send: attempts and spacing
pub const DIRECT_FETCH_ATTEMPTS: u32 = 10;
pub const DIRECT_FETCH_DELAY_MS: u64 = 500;
