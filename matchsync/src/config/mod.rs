//! Configuration for the `MatchSync` engine.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. Values set programmatically on the resolved [`SyncConfig`]
//! 2. TOML config file (`~/.config/matchsync/config.toml`)
//! 3. Compiled defaults
//!
//! Missing default config file is not an error (defaults are used). An
//! explicit path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    endpoints: EndpointsFileConfig,
    connection: ConnectionFileConfig,
    sync: SyncFileConfig,
    read: ReadFileConfig,
}

/// `[endpoints]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EndpointsFileConfig {
    gateway_url: Option<String>,
    api_base_url: Option<String>,
    auth_token: Option<String>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    connect_timeout_secs: Option<u64>,
    grace_period_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_check_delay_ms: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    initial_page_size: Option<usize>,
    older_page_size: Option<usize>,
    poll_initial_delay_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    dedup_window_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[read]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReadFileConfig {
    read_interval_ms: Option<u64>,
    read_initial_delay_ms: Option<u64>,
    focus_read_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Where the gateway and REST backend live.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    /// WebSocket URL of the messaging gateway.
    pub gateway_url: Option<String>,
    /// Base URL of the REST history/read API.
    pub api_base_url: Option<String>,
    /// Opaque bearer token handed over by the host application.
    pub auth_token: Option<String>,
}

/// Connection Manager timings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long `acquire` waits for the connection to open.
    pub connect_timeout: Duration,
    /// Delay between the last `release` and the actual close.
    pub grace_period: Duration,
    /// How long `send` waits for a correlated confirmation.
    pub send_timeout: Duration,
    /// First reconnect delay; doubles on every further attempt.
    pub reconnect_base_delay: Duration,
    /// Automatic reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay of the post-foreground connection check.
    pub reconnect_check_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            send_timeout: Duration::from_secs(15),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            reconnect_check_delay: Duration::from_secs(2),
        }
    }
}

/// History paging and poll cadence.
#[derive(Debug, Clone)]
pub struct SyncTimings {
    /// Page size of the initial load and of every poll.
    pub initial_page_size: usize,
    /// Page size of "load older" requests.
    pub older_page_size: usize,
    /// Delay before the first poll of a session.
    pub poll_initial_delay: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Creation-time window within which equal content counts as one message.
    pub dedup_window: Duration,
    /// Upper bound on every history and read-receipt request.
    pub request_timeout: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            initial_page_size: 20,
            older_page_size: 15,
            poll_initial_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(3),
            dedup_window: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Read Tracker cadence.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// Delay between read passes while foregrounded.
    pub read_interval: Duration,
    /// Delay of the read pass following the initial load.
    pub read_initial_delay: Duration,
    /// Delay of the read pass following a focus gain.
    pub focus_read_delay: Duration,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            read_interval: Duration::from_secs(2),
            read_initial_delay: Duration::from_millis(500),
            focus_read_delay: Duration::from_millis(500),
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Backend locations.
    pub endpoints: EndpointConfig,
    /// Connection Manager timings.
    pub connection: ConnectionConfig,
    /// History paging and polling.
    pub sync: SyncTimings,
    /// Read tracking.
    pub read: ReadConfig,
}

impl SyncConfig {
    /// Load configuration from a TOML file layered over the defaults.
    ///
    /// If `explicit_path` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/matchsync/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = load_config_file(explicit_path)?;
        Ok(Self::resolve(&file))
    }

    /// Parse configuration from TOML text layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseToml`] if the text is not valid config.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(Self::resolve(&file))
    }

    /// Resolve a `SyncConfig` from a parsed config file.
    ///
    /// Priority: file > default.
    fn resolve(file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let conn = &file.connection;
        let sync = &file.sync;
        let read = &file.read;

        Self {
            endpoints: EndpointConfig {
                gateway_url: file.endpoints.gateway_url.clone(),
                api_base_url: file.endpoints.api_base_url.clone(),
                auth_token: file.endpoints.auth_token.clone(),
            },
            connection: ConnectionConfig {
                connect_timeout: conn
                    .connect_timeout_secs
                    .map_or(defaults.connection.connect_timeout, Duration::from_secs),
                grace_period: conn
                    .grace_period_secs
                    .map_or(defaults.connection.grace_period, Duration::from_secs),
                send_timeout: conn
                    .send_timeout_secs
                    .map_or(defaults.connection.send_timeout, Duration::from_secs),
                reconnect_base_delay: conn
                    .reconnect_base_delay_ms
                    .map_or(defaults.connection.reconnect_base_delay, Duration::from_millis),
                max_reconnect_attempts: conn
                    .max_reconnect_attempts
                    .unwrap_or(defaults.connection.max_reconnect_attempts),
                reconnect_check_delay: conn
                    .reconnect_check_delay_ms
                    .map_or(defaults.connection.reconnect_check_delay, Duration::from_millis),
            },
            sync: SyncTimings {
                initial_page_size: sync
                    .initial_page_size
                    .unwrap_or(defaults.sync.initial_page_size),
                older_page_size: sync
                    .older_page_size
                    .unwrap_or(defaults.sync.older_page_size),
                poll_initial_delay: sync
                    .poll_initial_delay_ms
                    .map_or(defaults.sync.poll_initial_delay, Duration::from_millis),
                poll_interval: sync
                    .poll_interval_ms
                    .map_or(defaults.sync.poll_interval, Duration::from_millis),
                dedup_window: sync
                    .dedup_window_secs
                    .map_or(defaults.sync.dedup_window, Duration::from_secs),
                request_timeout: sync
                    .request_timeout_secs
                    .map_or(defaults.sync.request_timeout, Duration::from_secs),
            },
            read: ReadConfig {
                read_interval: read
                    .read_interval_ms
                    .map_or(defaults.read.read_interval, Duration::from_millis),
                read_initial_delay: read
                    .read_initial_delay_ms
                    .map_or(defaults.read.read_initial_delay, Duration::from_millis),
                focus_read_delay: read
                    .focus_read_delay_ms
                    .map_or(defaults.read.focus_read_delay, Duration::from_millis),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("matchsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
