//! Configuration management.
//!
//! Every section has defaults matching the reference client behavior, so an
//! empty source deserializes into a usable configuration. Environment
//! variables override file values: `EVENTCONNECT__RECONNECT__MAX_ATTEMPTS=8`.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::telemetry::logging::LoggingConfig;

/// Main client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Server endpoints
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Offline outbound queue
    #[serde(default)]
    pub queue: QueueConfig,

    /// Message confirmation and reconciliation
    #[serde(default)]
    pub messages: MessageConfig,

    /// Typing indicators and presence
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Local message cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Session runtime channels
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Realtime socket endpoint
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// REST API base URL (history backfill)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Handshake timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// REST request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubled per consecutive failure
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum age of a queued envelope before it is abandoned
    #[serde(default = "default_queue_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum queued envelopes; the oldest is evicted when full
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: default_queue_ttl(),
            max_size: default_queue_max_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageConfig {
    /// Window for the server to acknowledge a sent message
    #[serde(default = "default_confirm_timeout", with = "humantime_serde")]
    pub confirm_timeout: Duration,

    /// Status updates buffered for ids not yet known
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_updates: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: default_confirm_timeout(),
            max_pending_updates: default_max_pending_updates(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Silence after which a typing indicator clears itself
    #[serde(default = "default_typing_timeout", with = "humantime_serde")]
    pub typing_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_timeout: default_typing_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Messages kept per conversation
    #[serde(default = "default_cache_capacity")]
    pub max_messages_per_conversation: usize,

    /// Directory for the file cache; in-memory when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Quiet period before changed conversations are written back
    #[serde(default = "default_cache_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: default_cache_capacity(),
            directory: None,
            flush_interval: default_cache_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Buffered session events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Buffered commands from client handles
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

// Default value functions
fn default_ws_url() -> String { "ws://localhost:3000/socket".to_string() }
fn default_api_url() -> String { "http://localhost:3000/api".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(20) }
fn default_request_timeout() -> Duration { Duration::from_secs(30) }
fn default_base_delay() -> Duration { Duration::from_secs(1) }
fn default_max_delay() -> Duration { Duration::from_secs(30) }
fn default_max_attempts() -> u32 { 5 }
fn default_queue_ttl() -> Duration { Duration::from_secs(5 * 60) }
fn default_queue_max_size() -> usize { 1000 }
fn default_confirm_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_pending_updates() -> usize { 1000 }
fn default_typing_timeout() -> Duration { Duration::from_secs(3) }
fn default_cache_capacity() -> usize { 100 }
fn default_cache_flush_interval() -> Duration { Duration::from_millis(500) }
fn default_event_capacity() -> usize { 1024 }
fn default_command_capacity() -> usize { 256 }

impl ClientConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EVENTCONNECT").separator("__"))
            .build()?;

        let cfg: ClientConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EVENTCONNECT").separator("__"))
            .build()?;

        let cfg: ClientConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall or spin the session.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.base_delay.is_zero() {
            return Err(ChatError::invalid_config("reconnect.base_delay must be positive"));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(ChatError::invalid_config(
                "reconnect.base_delay must not exceed reconnect.max_delay",
            ));
        }
        if self.queue.max_size == 0 {
            return Err(ChatError::invalid_config("queue.max_size must be positive"));
        }
        if self.cache.max_messages_per_conversation == 0 {
            return Err(ChatError::invalid_config(
                "cache.max_messages_per_conversation must be positive",
            ));
        }
        if self.session.event_capacity == 0 || self.session.command_capacity == 0 {
            return Err(ChatError::invalid_config("session channel capacities must be positive"));
        }
        Ok(())
    }
}
