use crate::core::{DeviceType, Error, Result};
use crate::protocol::{Command, MessageLevel, Params, Reply, ReplyCode, SetOp};
use crate::time::Event;

use super::arena::ConnId;
use super::block::Block;
use super::data::BinaryData;
use super::directory::Address;

/// Callbacks through which a `Block` hands protocol events to its process
///
/// Every hook receives the block so it can send, queue and query while
/// handling the event. All hooks have defaults, a host overrides what it
/// needs.
pub trait Host {
    /// Whether an outbound connection to a newly advertised peer may be opened
    fn will_connect(&mut self, _address: &Address) -> bool {
        false
    }

    /// Whether an inbound peer may complete its handshake
    fn authorize(&mut self, _block: &mut Block, _conn: ConnId, _name: &str, _key: u32) -> bool {
        true
    }

    /// A connection reached `AUTH_OK`
    fn connection_ready(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// Handshake with a dialled peer device completed
    fn device_ready(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// Every command queued on `conn` has been answered
    fn device_idle(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// A connection was reaped; its id is no longer valid
    fn connection_removed(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// Device command from a peer
    fn command(
        &mut self,
        _block: &mut Block,
        _conn: ConnId,
        verb: &str,
        _params: &mut Params,
    ) -> Result<Reply> {
        Err(Error::command(format!("Unknown command {}", verb)))
    }

    /// Remote `SET` request
    fn set_value(
        &mut self,
        _block: &mut Block,
        _conn: ConnId,
        name: &str,
        _op: SetOp,
        _params: &mut Params,
    ) -> Result<Reply> {
        Err(Error::parameter(format!("Unknown value {}", name)))
    }

    /// A command sent to `conn` was answered
    fn command_returned(
        &mut self,
        _block: &mut Block,
        _conn: ConnId,
        _command: &Command,
        _code: ReplyCode,
    ) {
    }

    /// Status bits of the master state changed
    fn change_master_state(&mut self, _block: &mut Block, _old: u32, _new: u32) {}

    /// Composite BOP mask changed
    fn bop_state_changed(&mut self, _block: &mut Block, _state: u32) {}

    /// A peer device reported a new state
    fn device_state_changed(&mut self, _block: &mut Block, _conn: ConnId, _old: u32, _new: u32) {}

    fn value_changed(&mut self, _block: &mut Block, _conn: ConnId, _name: &str) {}

    /// A remote value entered an error state
    fn value_error(&mut self, _block: &mut Block, _conn: ConnId, _name: &str) {}

    fn binary_data(&mut self, _block: &mut Block, _conn: ConnId, _data: BinaryData) {}

    /// A child process was reaped
    fn child_returned(&mut self, _block: &mut Block, _pid: i32) {}

    /// Event broadcast after every device client has seen it
    fn post_event(&mut self, _block: &mut Block, _event: &Event) {}

    fn message(&mut self, _block: &mut Block, conn: ConnId, level: MessageLevel, text: &str) {
        match level {
            MessageLevel::Error => tracing::error!(%conn, "{}", text),
            MessageLevel::Warning => tracing::warn!(%conn, "{}", text),
            MessageLevel::Info => tracing::info!(%conn, "{}", text),
            MessageLevel::Debug => tracing::debug!(%conn, "{}", text),
        }
    }

    /// Peer asked for value metadata
    fn meta_requested(&mut self, _block: &mut Block, _conn: ConnId) {}

    /// Type advertised to peers in `AUTH_OK`
    fn device_type(&self, block: &Block) -> DeviceType {
        block.config().device_type
    }
}

/// Host accepting every default
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicHost;

impl Host for BasicHost {}
