//! Transport configuration.
//!
//! Compiled defaults cover every knob; an optional TOML file overrides
//! individual fields. Durations are expressed in the file as integer
//! units noted per field (seconds or milliseconds).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::policy::ReconnectPolicy;

/// Heartbeat probe schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often a probe frame is sent while connected.
    pub interval: Duration,
    /// How long to wait for any inbound traffic after an unanswered probe
    /// before declaring the connection dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(25),
            timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP fallback poller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between polling rounds while the fallback is active.
    pub interval: Duration,
    /// Grace period after connect() before the fallback activates, covering
    /// a slow initial handshake.
    pub grace: Duration,
    /// Per-request timeout for fallback fetches.
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Pending-message ledger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Total transmission attempts allowed per message, counting the first
    /// send and explicit retries.
    pub max_send_attempts: u32,
    /// How long an acknowledged entry is kept before the sweep removes it,
    /// so a fast echo of the confirmed copy still dedups against it.
    pub ack_grace: Duration,
    /// Upper bound on each dedup set (seen server ids, resolved nonces).
    pub max_seen_ids: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            ack_grace: Duration::from_secs(3),
            max_seen_ids: 10_000,
        }
    }
}

/// Top-level transport engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Websocket endpoint, e.g. `ws://gateway.example/ws`.
    pub url: String,
    /// Budget for a single connection attempt (dial + handshake).
    pub connect_timeout: Duration,
    /// Capacity of the event channel handed to the application.
    pub event_buffer: usize,
    /// Capacity of the command channel feeding the engine.
    pub command_buffer: usize,
    /// Heartbeat schedule.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff schedule.
    pub reconnect: ReconnectPolicy,
    /// Fallback poller settings.
    pub poll: PollConfig,
    /// Pending-message ledger settings.
    pub ledger: LedgerConfig,
}

impl TransportConfig {
    /// Compiled defaults pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            event_buffer: 256,
            command_buffer: 64,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            poll: PollConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    /// Loads overrides from a TOML file on top of the defaults.
    ///
    /// A missing file is not an error; the defaults are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read or parsed.
    pub fn load(url: impl Into<String>, path: &Path) -> Result<Self, ConfigError> {
        let base = Self::new(url);
        if !path.exists() {
            return Ok(base);
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        base.merged_with(&text)
    }

    /// Applies TOML overrides from `text` on top of `self`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the TOML is malformed.
    pub fn merged_with(mut self, text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        if let Some(t) = file.transport {
            if let Some(url) = t.url {
                self.url = url;
            }
            if let Some(secs) = t.connect_timeout_secs {
                self.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(n) = t.event_buffer {
                self.event_buffer = n;
            }
            if let Some(n) = t.command_buffer {
                self.command_buffer = n;
            }
        }
        if let Some(h) = file.heartbeat {
            if let Some(secs) = h.interval_secs {
                self.heartbeat.interval = Duration::from_secs(secs);
            }
            if let Some(secs) = h.timeout_secs {
                self.heartbeat.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(r) = file.reconnect {
            if let Some(millis) = r.base_delay_ms {
                self.reconnect.base_delay = Duration::from_millis(millis);
            }
            if let Some(millis) = r.max_delay_ms {
                self.reconnect.max_delay = Duration::from_millis(millis);
            }
            if let Some(n) = r.max_attempts {
                self.reconnect.max_attempts = n;
            }
        }
        if let Some(p) = file.poll {
            if let Some(secs) = p.interval_secs {
                self.poll.interval = Duration::from_secs(secs);
            }
            if let Some(secs) = p.grace_secs {
                self.poll.grace = Duration::from_secs(secs);
            }
            if let Some(secs) = p.request_timeout_secs {
                self.poll.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(l) = file.ledger {
            if let Some(n) = l.max_send_attempts {
                self.ledger.max_send_attempts = n;
            }
            if let Some(millis) = l.ack_grace_ms {
                self.ledger.ack_grace = Duration::from_millis(millis);
            }
            if let Some(n) = l.max_seen_ids {
                self.ledger.max_seen_ids = n;
            }
        }
        Ok(self)
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that failed.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    transport: Option<TransportSection>,
    #[serde(default)]
    heartbeat: Option<HeartbeatSection>,
    #[serde(default)]
    reconnect: Option<ReconnectSection>,
    #[serde(default)]
    poll: Option<PollSection>,
    #[serde(default)]
    ledger: Option<LedgerSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TransportSection {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
    command_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatSection {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReconnectSection {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PollSection {
    interval_secs: Option<u64>,
    grace_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LedgerSection {
    max_send_attempts: Option<u32>,
    ack_grace_ms: Option<u64>,
    max_seen_ids: Option<usize>,
}
