//! TOML configuration for the lanlink daemon.
//!
//! The file is read from `--config <path>` or, by default, from the
//! platform-appropriate location:
//! - Windows:  `%APPDATA%\lanlink\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/lanlink/config.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/lanlink/config.toml`
//!
//! A missing file is not an error: every field has a default, so the daemon
//! runs with no configuration at all.
//!
//! ```toml
//! [device]
//! name = "Living room PC"
//! device_type = "desktop"
//!
//! [network]
//! port = 1714
//! broadcast_address = "192.168.1.255"
//!
//! [link]
//! handshake_timeout_ms = 10000
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent, so partial files and files written
//! for older versions keep working.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanlink_core::IdentityPacket;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::provider::ProviderConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// An address field does not hold an IP address.
    #[error("invalid {field}: {value:?} is not an IP address")]
    InvalidAddress { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How this device presents itself to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Display name sent as `deviceName`.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Stable device id.  When absent a random UUID is used for this process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Free-form device kind sent as `deviceType`.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Well-known port shared by UDP discovery and TCP links.
    #[serde(default = "default_port")]
    pub port: u16,
    /// IP address to bind both listeners to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Where announcements are sent.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    /// Outbound dial timeout in milliseconds; `0` waits for the OS.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Session and framing limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// How long an inbound session may stay silent before it is closed;
    /// `0` disables the deadline.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Longest accepted line in bytes; `0` disables the limit.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "lanlink".to_string())
}
fn default_device_type() -> String {
    "desktop".to_string()
}
fn default_port() -> u16 {
    lanlink_core::protocol::DEFAULT_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_max_line_length() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            id: None,
            device_type: default_device_type(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
            tcp_keepalive: default_true(),
            reuse_address: default_true(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl NodeConfig {
    /// Builds the runtime settings for [`LinkProvider`](crate::provider::LinkProvider).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if an address field is not an
    /// IP address.
    pub fn to_provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        let bind_ip = parse_ip("network.bind_address", &self.network.bind_address)?;
        let broadcast_ip = parse_ip("network.broadcast_address", &self.network.broadcast_address)?;
        let port = self.network.port;

        Ok(ProviderConfig {
            tcp_bind_addr: SocketAddr::new(bind_ip, port),
            udp_bind_addr: SocketAddr::new(bind_ip, port),
            broadcast_addr: SocketAddr::new(broadcast_ip, port),
            default_peer_port: port,
            reuse_address: self.network.reuse_address,
            tcp_keepalive: self.network.tcp_keepalive,
            connect_timeout: non_zero_millis(self.network.connect_timeout_ms),
            handshake_timeout: non_zero_millis(self.link.handshake_timeout_ms),
            max_line_length: (self.link.max_line_length > 0).then_some(self.link.max_line_length),
        })
    }

    /// Builds the identity this device announces.
    ///
    /// Without a configured id a fresh UUID is drawn on every call, so call
    /// this once per process.
    pub fn local_identity(&self) -> IdentityPacket {
        let device_id = self
            .device
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        IdentityPacket::new(device_id, self.device.name.clone())
            .with_device_type(self.device.device_type.clone())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from `path`, or defaults when the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<NodeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Loads the config from the platform default location.
///
/// # Errors
///
/// See [`config_file_path`] and [`load_config_from`].
pub fn load_config() -> Result<NodeConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Resolves the platform config base directory including the `lanlink`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("lanlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("lanlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lanlink"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
