//! Gateway settings.
//!
//! Each knob is a command-line flag with an environment fallback. A TOML
//! settings file given with `--settings` supplies whatever the command line
//! leaves unset:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9300"
//! max_page_size = 50
//! confirmations = false
//! ```

use std::path::{Path, PathBuf};

/// A settings file that could not be used.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The file could not be read.
    #[error("cannot read settings {path}: {source}")]
    Read {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid gateway settings.
    #[error("invalid settings {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// What was wrong with it.
        source: toml::de::Error,
    },
}

/// How the gateway listens and behaves.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Largest history page handed out, whatever `limit` asks for.
    pub max_page_size: usize,
    /// Whether senders get a `sendConfirmation`. Turning it off lets a
    /// client's send timeout be exercised against a live gateway.
    pub confirmations: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9300".to_string(),
            max_page_size: 100,
            confirmations: true,
        }
    }
}

impl GatewayConfig {
    /// Read settings from a TOML file; keys it omits keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if the file is unreadable or malformed.
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Command line of `matchsync-gateway`.
#[derive(clap::Parser, Debug)]
#[command(version, about = "MatchSync development gateway")]
pub struct GatewayArgs {
    /// Listen address.
    #[arg(short, long, env = "GATEWAY_ADDR")]
    pub bind: Option<String>,

    /// TOML settings file.
    #[arg(short, long, env = "GATEWAY_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Largest history page handed out.
    #[arg(long, env = "GATEWAY_MAX_PAGE_SIZE")]
    pub max_page_size: Option<usize>,

    /// Store and push messages but never confirm them to the sender.
    #[arg(long)]
    pub no_confirmations: bool,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "GATEWAY_LOG")]
    pub log_level: String,
}

impl GatewayArgs {
    /// Settings file, if any, overridden by the flags that were given.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if `--settings` names an unusable file.
    pub fn config(&self) -> Result<GatewayConfig, SettingsError> {
        let mut config = match &self.settings {
            Some(path) => GatewayConfig::from_toml_file(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr.clone_from(bind);
        }
        if let Some(size) = self.max_page_size {
            config.max_page_size = size;
        }
        if self.no_confirmations {
            config.confirmations = false;
        }
        config.max_page_size = config.max_page_size.max(1);
        Ok(config)
    }
}
