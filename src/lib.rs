//! obsnet: coordination core for networks of observatory device daemons
//!
//! Every process of an observatory (central authority, device daemons,
//! clients) runs one `Block`: a single-threaded reactor holding its
//! connections to peers, the shared master state, a timer queue and the
//! queued commands waiting for the composite block-of-operation mask to
//! clear. Device processes host their device with `daemon::Daemon`.

pub mod core;
pub mod daemon;
pub mod network;
pub mod protocol;
pub mod time;
pub mod util;
pub mod value;

// Re-export commonly used items
pub use crate::core::{Config, DeviceType, Error, Result};
pub use crate::daemon::{Daemon, DaemonCore, Device, DeviceContext};
pub use crate::network::{Block, ConnId, Connection, Host};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
