use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Kind of device a peer process hosts.
///
/// The discriminant is the index sent on the wire; 16-19 are reserved and
/// decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    Unknown = 0,
    Serverd = 1,
    Mount = 2,
    Ccd = 3,
    Dome = 4,
    Weather = 5,
    Arch = 6,
    Phot = 7,
    Plan = 8,
    Grb = 9,
    Focus = 10,
    Mirror = 11,
    Cupola = 12,
    Filter = 13,
    Augersh = 14,
    Sensor = 15,
    Exec = 20,
    Imgp = 21,
    Selector = 22,
    Xmlrpc = 23,
    Indi = 24,
    Logd = 25,
    Scriptor = 26,
}

impl DeviceType {
    const TABLE: [DeviceType; 23] = [
        DeviceType::Unknown,
        DeviceType::Serverd,
        DeviceType::Mount,
        DeviceType::Ccd,
        DeviceType::Dome,
        DeviceType::Weather,
        DeviceType::Arch,
        DeviceType::Phot,
        DeviceType::Plan,
        DeviceType::Grb,
        DeviceType::Focus,
        DeviceType::Mirror,
        DeviceType::Cupola,
        DeviceType::Filter,
        DeviceType::Augersh,
        DeviceType::Sensor,
        DeviceType::Exec,
        DeviceType::Imgp,
        DeviceType::Selector,
        DeviceType::Xmlrpc,
        DeviceType::Indi,
        DeviceType::Logd,
        DeviceType::Scriptor,
    ];

    /// Wire index of this type
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Decodes a wire index; unknown and reserved indices map to `Unknown`
    pub fn from_index(index: u32) -> Self {
        Self::TABLE
            .iter()
            .copied()
            .find(|t| t.index() == index)
            .unwrap_or(DeviceType::Unknown)
    }

    /// Diagnostic name
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Unknown => "UNKNOWN",
            DeviceType::Serverd => "SERVERD",
            DeviceType::Mount => "MOUNT",
            DeviceType::Ccd => "CCD",
            DeviceType::Dome => "DOME",
            DeviceType::Weather => "WEATHER",
            DeviceType::Arch => "ARCH",
            DeviceType::Phot => "PHOT",
            DeviceType::Plan => "PLAN",
            DeviceType::Grb => "GRB",
            DeviceType::Focus => "FOCUS",
            DeviceType::Mirror => "MIRROR",
            DeviceType::Cupola => "CUPOLA",
            DeviceType::Filter => "FILTER",
            DeviceType::Augersh => "AUGERSH",
            DeviceType::Sensor => "SENSOR",
            DeviceType::Exec => "EXEC",
            DeviceType::Imgp => "IMGP",
            DeviceType::Selector => "SELECTOR",
            DeviceType::Xmlrpc => "XMLRPC",
            DeviceType::Indi => "INDI",
            DeviceType::Logd => "LOGD",
            DeviceType::Scriptor => "SCRIPTOR",
        }
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Central authority the process registers with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentraldConfig {
    /// Central authority number, unique within the configuration
    pub num: i32,
    pub host: String,
    pub port: u16,
    /// Whether this authority is the state master
    #[serde(default)]
    pub master: bool,
}

/// Bootstrap directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub centrald_num: i32,
}

/// Configuration for a process hosting a `Block`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device or process name
    pub name: String,
    /// Device type advertised to peers
    pub device_type: DeviceType,
    /// Local address to listen on
    pub listen_addr: IpAddr,
    /// Listen port, 0 picks an ephemeral port
    pub port: u16,
    /// Central authorities to connect to
    pub centrald: Vec<CentraldConfig>,
    /// Bootstrap peer addresses
    pub peers: Vec<PeerConfig>,
    /// Longest reactor wait when no timer is due
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub idle_timeout: Duration,
    /// Keep-alive ping interval, zero disables pings
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub keep_alive: Duration,
    /// Delay before a broken outbound connection is dialled again
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub reconnect_delay: Duration,
    /// Offer shared memory for bulk data to local peers
    pub shared_memory: bool,
    /// Maximum number of shared segments allocated at once
    pub shared_segments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "obsnet".to_string(),
            device_type: DeviceType::Unknown,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            centrald: Vec::new(),
            peers: Vec::new(),
            idle_timeout: Duration::from_secs(10),
            keep_alive: Duration::ZERO,
            reconnect_delay: Duration::from_secs(5),
            shared_memory: false,
            shared_segments: 8,
        }
    }
}

impl Config {
    /// Creates a configuration with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parses a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| Error::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serializes the configuration back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Checks the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(Error::config("Name must be non-empty and without whitespace"));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::config("Idle timeout must be positive"));
        }

        let mut nums = HashSet::new();
        for centrald in &self.centrald {
            if !nums.insert(centrald.num) {
                return Err(Error::config(format!(
                    "Duplicate central authority number {}",
                    centrald.num
                )));
            }
        }
        if self.centrald.iter().filter(|c| c.master).count() > 1 {
            return Err(Error::config("At most one central authority can be state master"));
        }

        for peer in &self.peers {
            if peer.name.is_empty() || peer.name.chars().any(char::is_whitespace) {
                return Err(Error::config(format!("Invalid peer name '{}'", peer.name)));
            }
        }
        Ok(())
    }
}
