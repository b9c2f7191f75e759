//! Network management and peer communication module
//!
//! This module owns everything that talks to peers: the connection arena,
//! the address directory, the per-peer protocol state machine, bulk data
//! transfer, device clients and the `Block` reactor driving them.

pub mod arena;
pub mod block;
pub mod client;
pub mod connection;
pub mod data;
pub mod directory;
pub mod host;

pub use self::arena::{Arena, ConnId};
pub use self::block::{Block, DeleteStatus};
pub use self::client::{ClientFactory, ClientRegistry, DeviceClient, GenericClient};
pub use self::connection::{ConnEvent, ConnKind, Connection};
pub use self::data::{BinaryData, SegmentPool, SharedSegment, CHUNK_SIZE};
pub use self::directory::{Address, Directory, DirectoryUpdate};
pub use self::host::{BasicHost, Host};
