//! Agent configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use studysync_db::DbRuntimeSettings;
use studysync_realtime::SyncSettings;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP status server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sync layer tunables.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Who the agent syncs for.
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Network configuration for the status server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "studysync_realtime=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Sync layer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Conversation list debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Window for matching an optimistic message to its confirmed copy by
    /// content, in seconds.
    #[serde(default = "default_pending_match_window_secs")]
    pub pending_match_window_secs: i64,

    /// Buffered change events per subscription.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Delay before retrying a dropped subscription, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Identity configuration. Without a user the agent runs as a guest and
/// opens no subscriptions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "studysync.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_pending_match_window_secs() -> i64 {
    30
}

fn default_channel_capacity() -> usize {
    256
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            pending_match_window_secs: default_pending_match_window_secs(),
            channel_capacity: default_channel_capacity(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl SyncConfig {
    /// The settings handed to the sync client.
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            pending_match_window: self.pending_match_window(),
            channel_capacity: self.channel_capacity.max(1),
        }
    }

    /// Negative values count as zero; values past chrono's range clamp to
    /// its maximum.
    fn pending_match_window(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.pending_match_window_secs.max(0))
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `STUDYSYNC_HOST` overrides `server.host`
/// - `STUDYSYNC_PORT` overrides `server.port`
/// - `STUDYSYNC_DB_PATH` overrides `database.path`
/// - `STUDYSYNC_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `STUDYSYNC_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `STUDYSYNC_LOG_LEVEL` overrides `logging.level`
/// - `STUDYSYNC_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `STUDYSYNC_DEBOUNCE_MS` overrides `sync.debounce_ms`
/// - `STUDYSYNC_PENDING_MATCH_WINDOW_SECS` overrides `sync.pending_match_window_secs`
/// - `STUDYSYNC_CHANNEL_CAPACITY` overrides `sync.channel_capacity`
/// - `STUDYSYNC_RECONNECT_DELAY_MS` overrides `sync.reconnect_delay_ms`
/// - `STUDYSYNC_USER_ID` overrides `identity.user_id` (empty signs out)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies `STUDYSYNC_*` overrides read through `var`. Unparseable values
/// are ignored.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("STUDYSYNC_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("STUDYSYNC_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(db_path) = var("STUDYSYNC_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(parsed) = var("STUDYSYNC_BUSY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.database.busy_timeout_ms = parsed;
    }
    if let Some(parsed) = var("STUDYSYNC_POOL_MAX_SIZE").and_then(|v| v.parse().ok()) {
        config.database.pool_max_size = parsed;
    }
    if let Some(level) = var("STUDYSYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("STUDYSYNC_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(parsed) = var("STUDYSYNC_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        config.sync.debounce_ms = parsed;
    }
    if let Some(parsed) =
        var("STUDYSYNC_PENDING_MATCH_WINDOW_SECS").and_then(|v| v.parse().ok())
    {
        config.sync.pending_match_window_secs = parsed;
    }
    if let Some(parsed) = var("STUDYSYNC_CHANNEL_CAPACITY").and_then(|v| v.parse().ok()) {
        config.sync.channel_capacity = parsed;
    }
    if let Some(parsed) = var("STUDYSYNC_RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        config.sync.reconnect_delay_ms = parsed;
    }
    if let Some(user_id) = var("STUDYSYNC_USER_ID") {
        let user_id = user_id.trim();
        config.identity.user_id = (!user_id.is_empty()).then(|| user_id.to_string());
    }
}
