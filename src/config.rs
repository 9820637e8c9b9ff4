//! TOML configuration for guardsync.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration against a local backend. The config file path can
//! be overridden with `GUARDSYNC_CONFIG`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::IdentityKey;
use crate::poller::{FailurePolicy, PollerOptions};
use crate::writes::WriteOptions;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "GUARDSYNC_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "guardsync.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardsyncConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub writes: WritesConfig,
    #[serde(default)]
    pub highlight: HighlightConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub field_groups: Vec<FieldGroupConfig>,
}

impl Default for GuardsyncConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            poller: PollerConfig::default(),
            writes: WritesConfig::default(),
            highlight: HighlightConfig::default(),
            push: PushConfig::default(),
            logging: LoggingConfig::default(),
            streams: default_streams(),
            field_groups: Vec::new(),
        }
    }
}

impl GuardsyncConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), streams = config.streams.len(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `GUARDSYNC_CONFIG`.
    /// 2. `./guardsync.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "GUARDSYNC_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.poller.interval_ms > 0, "poller.interval_ms must be greater than 0");
        ensure!(self.writes.debounce_ms > 0, "writes.debounce_ms must be greater than 0");
        ensure!(
            self.push.reconnect_min_ms > 0 && self.push.reconnect_min_ms <= self.push.reconnect_max_ms,
            "push.reconnect_min_ms must be positive and no larger than push.reconnect_max_ms"
        );

        let mut names = HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                bail!("duplicate stream name '{}'", stream.name);
            }
            ensure!(!stream.path.is_empty(), "stream '{}' has an empty path", stream.name);
            if stream.identity_key().is_none() {
                bail!("stream '{}' has no identity fields", stream.name);
            }
        }

        let mut groups = HashSet::new();
        for group in &self.field_groups {
            if !groups.insert(group.name.as_str()) {
                bail!("duplicate field group '{}'", group.name);
            }
        }
        Ok(())
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Poller options for one configured stream.
    pub fn poller_options(&self, stream: &StreamConfig) -> PollerOptions {
        PollerOptions::new(stream.name.clone(), self.poller.interval())
            .on_failure(self.poller.on_failure)
            .identity(stream.identity_key().unwrap_or_default())
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            debounce: Duration::from_millis(self.writes.debounce_ms),
            follow_up_read: self.writes.follow_up_read,
        }
    }

    pub fn highlight_window(&self) -> Duration {
        Duration::from_millis(self.highlight.window_ms)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Where the backend lives and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            request_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// What a failed poll shows: `keep_last` or `show_empty`.
    pub on_failure: FailurePolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            on_failure: FailurePolicy::KeepLast,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritesConfig {
    pub debounce_ms: u64,
    /// Re-read a field-group after each confirmed write.
    pub follow_up_read: bool,
}

impl Default for WritesConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            follow_up_read: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Highlight
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HighlightConfig {
    /// How long newly arrived rows stay highlighted.
    pub window_ms: u64,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self { window_ms: 3_000 }
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Optional real-time push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub enabled: bool,
    /// `host:port` of the line-delimited JSON push endpoint.
    pub address: String,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:8765".to_string(),
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// A named, polled read collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Path under `backend.base_url`.
    pub path: String,
    /// Fields forming the record identity. Several fields form a composite key.
    #[serde(default = "default_identity")]
    pub identity: Vec<String>,
    /// Maximum number of records requested, sent as `?limit=`.
    #[serde(default = "default_limit")]
    pub limit: Option<usize>,
    /// JSON pointer to the record array inside the response body.
    #[serde(default)]
    pub items_pointer: Option<String>,
    /// Fields searched by free-text search. Empty searches every scalar.
    #[serde(default)]
    pub searchable: Vec<String>,
    /// Push message types that trigger a refresh of this stream.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl StreamConfig {
    pub fn identity_key(&self) -> Option<IdentityKey> {
        IdentityKey::from_fields(&self.identity)
    }
}

fn default_identity() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_limit() -> Option<usize> {
    Some(50)
}

fn default_streams() -> Vec<StreamConfig> {
    vec![
        StreamConfig {
            name: "live-feed".to_string(),
            path: "/api/ai/live-feed".to_string(),
            identity: default_identity(),
            limit: default_limit(),
            items_pointer: None,
            searchable: vec![
                "threat_type".to_string(),
                "process_name".to_string(),
                "file_path".to_string(),
            ],
            topics: vec!["threat_detected".to_string(), "live_event".to_string()],
        },
        StreamConfig {
            name: "process-tree".to_string(),
            path: "/api/process-monitor/tree".to_string(),
            identity: vec!["pid".to_string(), "name".to_string()],
            limit: Some(1000),
            items_pointer: None,
            searchable: vec!["name".to_string(), "pid".to_string(), "username".to_string()],
            topics: vec!["process_started".to_string()],
        },
    ]
}

// ---------------------------------------------------------------------------
// Field groups
// ---------------------------------------------------------------------------

/// A remotely persisted settings group edited through the write coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldGroupConfig {
    pub name: String,
    pub write_path: String,
    #[serde(default)]
    pub write_method: WriteMethod,
    /// Path returning the group's current value.
    #[serde(default)]
    pub read_path: Option<String>,
    /// JSON pointer to the group's value in responses.
    #[serde(default)]
    pub value_pointer: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
    #[default]
    Post,
    Put,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
