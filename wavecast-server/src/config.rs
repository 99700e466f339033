use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::AVG_MESSAGE_SIZE_BYTES;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// Chat engine limits and feature switches.
///
/// Every field except `inactive_stream_timeout_secs` can be overridden with a
/// `CHAT_*` environment variable; see [`ChatConfig::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub max_memory_mb: usize,
    pub max_messages_per_stream: usize,
    pub max_users_per_stream: usize,
    pub message_retention_minutes: u64,
    pub cleanup_interval_minutes: u64,
    pub max_messages_per_minute: usize,
    pub max_chars_per_message: usize,
    pub spam_threshold_messages: usize,
    pub spam_timeout_minutes: u64,
    pub enable_viewer_list: bool,
    pub enable_mentions: bool,
    pub enable_typing_status: bool,
    pub enable_emojis: bool,
    /// Rooms with an empty roster and no activity for this long are reaped.
    /// Deliberately not environment-configurable.
    #[serde(default = "default_inactive_stream_timeout_secs")]
    pub inactive_stream_timeout_secs: u64,
}

/// Derived capacity figures reported by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityEstimate {
    pub max_memory_mb: usize,
    pub max_messages_per_stream: usize,
    pub max_users_per_stream: usize,
    pub estimated_max_streams: u64,
    pub total_message_capacity: u64,
    pub avg_message_size_bytes: usize,
    pub memory_per_stream_kb: u64,
}

fn default_inactive_stream_timeout_secs() -> u64 {
    600
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 100,
            max_messages_per_stream: 500,
            max_users_per_stream: 100,
            message_retention_minutes: 30,
            cleanup_interval_minutes: 5,
            max_messages_per_minute: 10,
            max_chars_per_message: 500,
            spam_threshold_messages: 20,
            spam_timeout_minutes: 5,
            enable_viewer_list: true,
            enable_mentions: true,
            enable_typing_status: false,
            enable_emojis: true,
            inactive_stream_timeout_secs: default_inactive_stream_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: Server::default(),
            chat: ChatConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ChatConfig {
    /// Defaults overlaid with any `CHAT_*` variables from the process
    /// environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Apply environment overrides through a lookup function. Integer values
    /// are decimal and silently keep the default when unparsable; boolean
    /// values are enabled only by the literal `true`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        override_num(&mut self.max_memory_mb, get("CHAT_MAX_MEMORY_MB"));
        override_num(
            &mut self.max_messages_per_stream,
            get("CHAT_MAX_MESSAGES_PER_STREAM"),
        );
        override_num(
            &mut self.max_users_per_stream,
            get("CHAT_MAX_USERS_PER_STREAM"),
        );
        override_num(
            &mut self.message_retention_minutes,
            get("CHAT_MESSAGE_RETENTION_MINUTES"),
        );
        override_num(
            &mut self.cleanup_interval_minutes,
            get("CHAT_CLEANUP_INTERVAL_MINUTES"),
        );
        override_num(
            &mut self.max_messages_per_minute,
            get("CHAT_MAX_MESSAGES_PER_MINUTE"),
        );
        override_num(
            &mut self.max_chars_per_message,
            get("CHAT_MAX_CHARACTERS_PER_MESSAGE"),
        );
        override_num(
            &mut self.spam_threshold_messages,
            get("CHAT_SPAM_THRESHOLD_MESSAGES"),
        );
        override_num(
            &mut self.spam_timeout_minutes,
            get("CHAT_SPAM_TIMEOUT_MINUTES"),
        );
        override_bool(&mut self.enable_viewer_list, get("CHAT_ENABLE_VIEWER_LIST"));
        override_bool(&mut self.enable_mentions, get("CHAT_ENABLE_MENTIONS"));
        override_bool(
            &mut self.enable_typing_status,
            get("CHAT_ENABLE_TYPING_STATUS"),
        );
        override_bool(&mut self.enable_emojis, get("CHAT_ENABLE_EMOJIS"));
    }

    /// Configured memory envelope in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_memory_mb as u64 * 1024 * 1024
    }

    /// Derived capacity estimates for the stats endpoint.
    pub fn capacity(&self) -> CapacityEstimate {
        let memory_per_stream =
            (self.max_messages_per_stream * AVG_MESSAGE_SIZE_BYTES).max(1) as u64;
        let estimated_max_streams = self.max_bytes() / memory_per_stream;
        CapacityEstimate {
            max_memory_mb: self.max_memory_mb,
            max_messages_per_stream: self.max_messages_per_stream,
            max_users_per_stream: self.max_users_per_stream,
            estimated_max_streams,
            total_message_capacity: estimated_max_streams
                * self.max_messages_per_stream as u64,
            avg_message_size_bytes: AVG_MESSAGE_SIZE_BYTES,
            memory_per_stream_kb: memory_per_stream / 1024,
        }
    }
}

fn override_num<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|s| s.trim().parse().ok()) {
        *slot = value;
    }
}

fn override_bool(slot: &mut bool, raw: Option<String>) {
    if let Some(value) = raw {
        *slot = value == "true";
    }
}
