//! Core types shared by every layer of the coordination core
//!
//! This module contains the error type, configuration, device type table
//! and the composite state bit layout.

pub mod error;
pub mod serde;
pub mod state;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{CentraldConfig, Config, DeviceType, PeerConfig};

/// Protocol version announced in `base_info`
pub const PROTOCOL_VERSION: u8 = 1;

/// Default listen port of a central authority
pub const DEFAULT_CENTRALD_PORT: u16 = 617;

/// Maximum accepted length of one protocol line in bytes
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Bytes read from a socket per receive call
pub const READ_CHUNK: usize = 8192;

/// Largest binary transfer or raw block a peer may announce
pub const MAX_DATA_SIZE: usize = 1 << 30;
