//! Configuration system for Shuttle.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHUTTLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shuttle/config.toml
//!   3. ~/.config/shuttle/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ack::MAX_ACK_BODY;
use crate::codec::ParcelLimits;
use crate::wire::HEADER_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub transport: TransportSettings,
    pub endpoint: EndpointSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Hard ceiling of one frame on the underlying primitive, header included.
    pub max_parcel_bytes: usize,
    /// Largest payload sent as a single unsliced parcel.
    pub max_single_parcel_bytes: usize,
    /// Body size of each slice.
    pub slice_size: usize,
    /// How long the sender waits for acks before resending.
    pub retry_interval_ms: u64,
    /// Resend rounds before a send fails. 0 = retry forever.
    pub max_retries: u32,
    /// Completed message ids remembered for duplicate suppression.
    pub completed_history: usize,
    /// Partially received messages are dropped after this long.
    pub assembly_timeout_secs: u64,
}

/// Which side of the harness this process is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Device-resident service, bridging towards the remote controller.
    #[default]
    Service,
    /// Instrumented engine running inside the application under test.
    Engine,
}

impl std::str::FromStr for EndpointRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(EndpointRole::Service),
            "engine" => Ok(EndpointRole::Engine),
            other => Err(ConfigError::Invalid(format!("unknown endpoint role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub role: EndpointRole,
    /// Local UDP address the daemon binds.
    pub bind_addr: String,
    /// UDP address of the peer endpoint.
    pub peer_addr: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// UDP's datagram payload ceiling over IPv4.
pub const DEFAULT_MAX_PARCEL_BYTES: usize = 65_507;

impl Default for TransportSettings {
    fn default() -> Self {
        let max_single = DEFAULT_MAX_PARCEL_BYTES / 4;
        Self {
            max_parcel_bytes: DEFAULT_MAX_PARCEL_BYTES,
            max_single_parcel_bytes: max_single,
            slice_size: max_single - 1024,
            retry_interval_ms: 5_000,
            max_retries: 12,
            completed_history: 16,
            assembly_timeout_secs: 300,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            role: EndpointRole::Service,
            bind_addr: "127.0.0.1:7600".to_string(),
            peer_addr: "127.0.0.1:7601".to_string(),
        }
    }
}

impl TransportSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_secs(self.assembly_timeout_secs)
    }

    /// `None` means unbounded.
    pub fn retry_limit(&self) -> Option<u32> {
        (self.max_retries > 0).then_some(self.max_retries)
    }

    pub fn limits(&self) -> Result<ParcelLimits, ConfigError> {
        self.validate()?;
        ParcelLimits::new(self.max_single_parcel_bytes, self.slice_size)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject settings that would let a frame exceed the primitive's ceiling,
    /// or let the receiver drop a message the sender is still retrying.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_size == 0 {
            return Err(ConfigError::Invalid("slice_size must be non-zero".into()));
        }
        if self.slice_size > self.max_single_parcel_bytes {
            return Err(ConfigError::Invalid(format!(
                "slice_size {} exceeds max_single_parcel_bytes {}",
                self.slice_size, self.max_single_parcel_bytes
            )));
        }
        if self.max_single_parcel_bytes < MAX_ACK_BODY {
            return Err(ConfigError::Invalid(format!(
                "max_single_parcel_bytes {} cannot carry a {MAX_ACK_BODY}-byte ack",
                self.max_single_parcel_bytes
            )));
        }
        if self.max_single_parcel_bytes + HEADER_LEN > self.max_parcel_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_single_parcel_bytes {} plus the {HEADER_LEN}-byte header exceeds max_parcel_bytes {}",
                self.max_single_parcel_bytes, self.max_parcel_bytes
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("retry_interval_ms must be non-zero".into()));
        }
        if self.completed_history == 0 {
            return Err(ConfigError::Invalid("completed_history must be non-zero".into()));
        }
        // A bounded sender stops resending after `max_retries + 1` intervals;
        // the receiver must hold its partial buffer at least that long.
        let rounds = self.retry_limit().map_or(1, |max| max.saturating_add(1));
        let needed = self.retry_interval().checked_mul(rounds);
        if needed.map_or(true, |needed| self.assembly_timeout() < needed) {
            return Err(ConfigError::Invalid(format!(
                "assembly_timeout_secs {} is shorter than {rounds} retry intervals of {} ms",
                self.assembly_timeout_secs, self.retry_interval_ms
            )));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shuttle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShuttleConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ShuttleConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.transport.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHUTTLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShuttleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SHUTTLE_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SHUTTLE_TRANSPORT__RETRY_INTERVAL_MS") {
            self.transport.retry_interval_ms = parse_number(&v, "retry_interval_ms")?;
        }
        if let Some(v) = lookup("SHUTTLE_TRANSPORT__MAX_RETRIES") {
            self.transport.max_retries = parse_number(&v, "max_retries")?;
        }
        if let Some(v) = lookup("SHUTTLE_TRANSPORT__SLICE_SIZE") {
            self.transport.slice_size = parse_number(&v, "slice_size")?;
        }
        if let Some(v) = lookup("SHUTTLE_ENDPOINT__ROLE") {
            self.endpoint.role = v.parse()?;
        }
        if let Some(v) = lookup("SHUTTLE_ENDPOINT__BIND_ADDR") {
            self.endpoint.bind_addr = v;
        }
        if let Some(v) = lookup("SHUTTLE_ENDPOINT__PEER_ADDR") {
            self.endpoint.peer_addr = v;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{field}: not a number: {value}")))
}
