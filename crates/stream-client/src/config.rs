//! Stream client configuration.
//!
//! Loaded from `~/.config/agentdeck/stream.json` (or an explicit path);
//! every field is optional in the file and falls back to its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agentdeck_protocol::Scope;
use agentdeck_protocol::constants::{
    AGENT_ID_PLACEHOLDER, DEFAULT_AGENT_PATH, DEFAULT_BUFFER_CAPACITY, DEFAULT_GLOBAL_PATH,
    DEFAULT_OUTBOUND_CAPACITY,
};

use crate::error::StreamError;
use crate::types::{KeepaliveConfig, ReconnectConfig};

/// Environment variable overriding [`StreamConfig::base_url`].
pub const ENV_BASE_URL: &str = "AGENTDECK_BASE_URL";

/// Environment variable holding a bearer token, read by the CLI.
pub const ENV_TOKEN: &str = "AGENTDECK_TOKEN";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// On-disk shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StreamConfigFile {
    base_url: Option<String>,
    global_path: Option<String>,
    agent_path: Option<String>,
    buffer_capacity: Option<usize>,
    outbound_capacity: Option<usize>,
    reconnect: ReconnectFile,
    keepalive: KeepaliveFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReconnectFile {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_factor: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct KeepaliveFile {
    ping_period_ms: Option<u64>,
    pong_wait_ms: Option<u64>,
    write_wait_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// StreamConfig
// ---------------------------------------------------------------------------

/// Runtime configuration of a [`StreamClient`](crate::StreamClient).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Base address, including the scheme (`ws://` or `wss://`).
    pub base_url: String,

    /// Path of the global stream.
    pub global_path: String,

    /// Path of a per-agent stream; `{agent_id}` is substituted.
    pub agent_path: String,

    /// Envelopes retained per scope.
    pub buffer_capacity: usize,

    /// Outbound frames queued per scope while not open.
    pub outbound_capacity: usize,

    pub reconnect: ReconnectConfig,

    pub keepalive: KeepaliveConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:5000".into(),
            global_path: DEFAULT_GLOBAL_PATH.into(),
            agent_path: DEFAULT_AGENT_PATH.into(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Loads configuration from `path`, or from the default location when
    /// `None`. A missing file yields the defaults. Environment overrides are
    /// applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                tracing::debug!(path = %p.display(), "loading stream configuration");
                Self::from_json(&content)?
            }
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let file: StreamConfigFile = serde_json::from_str(content)?;
        let mut config = Self::default();

        if let Some(v) = file.base_url {
            config.base_url = v;
        }
        if let Some(v) = file.global_path {
            config.global_path = v;
        }
        if let Some(v) = file.agent_path {
            config.agent_path = v;
        }
        if let Some(v) = file.buffer_capacity {
            config.buffer_capacity = v;
        }
        if let Some(v) = file.outbound_capacity {
            config.outbound_capacity = v;
        }

        let r = &mut config.reconnect;
        if let Some(ms) = file.reconnect.initial_delay_ms {
            r.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.reconnect.max_delay_ms {
            r.max_delay = Duration::from_millis(ms);
        }
        if let Some(v) = file.reconnect.backoff_factor {
            r.backoff_factor = v;
        }
        if let Some(v) = file.reconnect.jitter {
            r.jitter = v;
        }

        let k = &mut config.keepalive;
        if let Some(ms) = file.keepalive.ping_period_ms {
            k.ping_period = Duration::from_millis(ms);
        }
        if let Some(ms) = file.keepalive.pong_wait_ms {
            k.pong_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = file.keepalive.write_wait_ms {
            k.write_wait = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Applies environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.is_empty()) {
            self.base_url = url;
        }
    }

    /// Checks capacities, timings and the base address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be > 0".into()));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be > 0".into()));
        }
        if self.reconnect.initial_delay.is_zero() {
            return Err(ConfigError::Invalid("reconnect.initial_delay_ms must be > 0".into()));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms must be >= initial_delay_ms".into(),
            ));
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid("reconnect.backoff_factor must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid("reconnect.jitter must be in [0, 1)".into()));
        }
        if self.keepalive.ping_period.is_zero()
            || self.keepalive.pong_wait <= self.keepalive.ping_period
        {
            return Err(ConfigError::Invalid(
                "keepalive.pong_wait_ms must exceed a non-zero ping_period_ms".into(),
            ));
        }
        if self.keepalive.write_wait.is_zero() {
            return Err(ConfigError::Invalid("keepalive.write_wait_ms must be > 0".into()));
        }
        if !self.agent_path.contains(AGENT_ID_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "agent_path must contain {AGENT_ID_PLACEHOLDER}"
            )));
        }
        self.endpoint(&Scope::Global)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Resolves the WebSocket URL of a scope.
    pub fn endpoint(&self, scope: &Scope) -> Result<String, StreamError> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| StreamError::InvalidEndpoint(format!("{}: {e}", self.base_url)))?;
        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(StreamError::InvalidEndpoint(format!(
                "unsupported scheme {:?} (expected ws or wss)",
                base.scheme()
            )));
        }

        let path = match scope {
            Scope::Global => self.global_path.clone(),
            Scope::Agent(id) => self
                .agent_path
                .replace(AGENT_ID_PLACEHOLDER, &urlencoding::encode(id)),
        };
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url::Url::parse(&joined)
            .map(String::from)
            .map_err(|e| StreamError::InvalidEndpoint(format!("{joined}: {e}")))
    }
}

/// Default configuration path: `<config dir>/agentdeck/stream.json`.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("agentdeck").join("stream.json"))
}

/// Default session path: `<config dir>/agentdeck/session.json`.
pub fn default_session_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("agentdeck").join("session.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
