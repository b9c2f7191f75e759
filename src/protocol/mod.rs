//! Wire protocol
//!
//! This module defines the text protocol spoken between peers: line
//! framing with raw binary chunks, message parsing, the command queue,
//! the connection state machine and the image header.

pub mod codec;
pub mod command;
pub mod imghdr;
pub mod message;
pub mod params;
pub mod state;

pub use self::codec::{Frame, ProtocolCodec};
pub use self::command::{Command, CommandQueue, CommandStatus, Reply, ReplyCode};
pub use self::imghdr::ImageHeader;
pub use self::message::{Message, MessageLevel, SetOp};
pub use self::params::{quote, Params};
pub use self::state::ConnState;
