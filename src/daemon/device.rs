use std::time::Duration;

use crate::core::state::BOP_MASK;
use crate::core::{DeviceType, Error, Result, PROTOCOL_VERSION};
use crate::network::{Block, ConnId, Host};
use crate::protocol::{Params, Reply, SetOp};
use crate::time::{Event, TimerId};
use crate::value::value::VALUE_ERROR;
use crate::value::{Value, ValueChange, ValueData};

use super::core::DaemonCore;

/// What a device hook may touch
pub struct DeviceContext<'a> {
    pub core: &'a mut DaemonCore,
    pub block: &'a mut Block,
}

impl DeviceContext<'_> {
    pub fn mask_state(&mut self, mask: u32, new: u32, text: Option<&str>) {
        self.core.mask_state(self.block, mask, new, text);
    }

    pub fn set_value(&mut self, name: &str, data: ValueData) -> Result<bool> {
        self.core.set_value(self.block, name, data)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.core.value(name)
    }

    pub fn send_value_all(&mut self, name: &str) -> Result<()> {
        self.core.send_value_all(self.block, name)
    }

    pub fn add_timer(&mut self, delay: Duration, event: Event) -> TimerId {
        self.block.add_timer(delay, event)
    }
}

/// Device specific behaviour hosted by a `Daemon`
pub trait Device {
    fn device_type(&self) -> DeviceType;

    /// Registers the device values
    fn init_values(&mut self, _core: &mut DaemonCore) -> Result<()> {
        Ok(())
    }

    /// Device command; `info`, `base_info` and `meta` are answered by the daemon
    fn command(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _conn: ConnId,
        verb: &str,
        _params: &mut Params,
    ) -> Result<Reply> {
        Err(Error::command(format!("Unknown command {}", verb)))
    }

    /// Called before a remote change is stored; an error leaves the value unchanged
    fn set_value(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _name: &str,
        _old: &ValueData,
        _new: &ValueData,
    ) -> Result<()> {
        Ok(())
    }

    /// BOP bits raised while a change with `que_condition` waits
    fn que_value_bop(&self, que_condition: u32) -> u32 {
        que_condition & BOP_MASK
    }

    /// Refreshes values before `info` sends them
    fn info(&mut self, _ctx: &mut DeviceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn master_state_changed(&mut self, _ctx: &mut DeviceContext<'_>, _old: u32, _new: u32) {}

    fn bop_state_changed(&mut self, _ctx: &mut DeviceContext<'_>, _state: u32) {}

    fn event(&mut self, _ctx: &mut DeviceContext<'_>, _event: &Event) {}
}

/// Host for a process exposing one local device
#[derive(Debug)]
pub struct Daemon<D> {
    core: DaemonCore,
    device: D,
}

impl<D: Device> Daemon<D> {
    pub fn new(mut device: D) -> Result<Self> {
        let mut core = DaemonCore::new();
        device.init_values(&mut core)?;
        Ok(Daemon { core, device })
    }

    pub fn core(&self) -> &DaemonCore {
        &self.core
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Changes device state bits, then applies changes the new state allows
    pub fn mask_state(&mut self, block: &mut Block, mask: u32, new: u32, text: Option<&str>) {
        self.core.mask_state(block, mask, new, text);
        self.drain_queue(block);
    }

    /// Applies queued changes whose condition cleared, oldest first
    pub fn drain_queue(&mut self, block: &mut Block) {
        loop {
            let state = self.core.state() | block.full_state();
            let Some(change) = self.core.queue_mut().pop_next(state) else {
                break;
            };
            tracing::debug!(value = %change.name, "applying queued change");
            if let Err(e) = self.apply_change(block, &change.name, change.data) {
                tracing::warn!(value = %change.name, error = %e, "queued change failed");
            }
        }
        let Daemon { core, device } = self;
        core.check_bop_status(block, |condition| device.que_value_bop(condition));
    }

    fn apply_change(&mut self, block: &mut Block, name: &str, data: ValueData) -> Result<()> {
        let Daemon { core, device } = self;
        let old = core
            .value(name)
            .map(|value| value.data().clone())
            .ok_or_else(|| Error::value(format!("Unknown value {}", name)))?;
        let mut ctx = DeviceContext { core, block };
        if let Err(e) = device.set_value(&mut ctx, name, &old, &data) {
            ctx.core.value_mask_error(ctx.block, name, VALUE_ERROR)?;
            return Err(e);
        }
        ctx.core.value_mask_error(ctx.block, name, 0)?;
        ctx.core.set_value(ctx.block, name, data)?;
        Ok(())
    }

    fn builtin(&mut self, block: &mut Block, conn: ConnId, verb: &str) -> Option<Result<Reply>> {
        let result = match verb {
            "info" => {
                let Daemon { core, device } = self;
                let mut ctx = DeviceContext { core, block };
                device
                    .info(&mut ctx)
                    .and_then(|()| ctx.core.send_values(ctx.block, conn))
                    .map(|()| Reply::Ok)
            }
            "base_info" => Ok(Reply::OkWith(format!(
                "{} {} {}",
                block.name(),
                self.device.device_type(),
                PROTOCOL_VERSION
            ))),
            "meta" => self
                .core
                .send_meta_info(block, conn, true)
                .map(|()| Reply::Ok),
            _ => return None,
        };
        Some(result)
    }
}

impl<D: Device> Host for Daemon<D> {
    fn connection_ready(&mut self, block: &mut Block, conn: ConnId) {
        let sent = self
            .core
            .send_state(block, conn)
            .and_then(|()| self.core.send_meta_info(block, conn, false));
        if let Err(e) = sent {
            tracing::warn!(%conn, error = %e, "cannot send device information");
        }
    }

    fn connection_removed(&mut self, block: &mut Block, conn: ConnId) {
        if self.core.queue_mut().drop_connection(conn) > 0 {
            self.drain_queue(block);
        }
    }

    fn command(
        &mut self,
        block: &mut Block,
        conn: ConnId,
        verb: &str,
        params: &mut Params,
    ) -> Result<Reply> {
        let result = match self.builtin(block, conn, verb) {
            Some(result) => result,
            None => {
                let Daemon { core, device } = self;
                device.command(&mut DeviceContext { core, block }, conn, verb, params)
            }
        };
        self.drain_queue(block);
        result
    }

    fn set_value(
        &mut self,
        block: &mut Block,
        conn: ConnId,
        name: &str,
        op: SetOp,
        params: &mut Params,
    ) -> Result<Reply> {
        let value = self
            .core
            .value(name)
            .ok_or_else(|| Error::parameter(format!("Unknown value {}", name)))?;
        if !value.is_writable() {
            return Err(Error::parameter(format!("Value {} is read-only", name)));
        }
        let operand = ValueData::parse(value.kind(), params)?;
        params.expect_end()?;
        let data = value.data().apply(op, operand)?;
        value.check(&data)?;

        let que_condition = value.que_condition();
        if que_condition & (self.core.state() | block.full_state()) != 0 {
            tracing::debug!(value = name, condition = que_condition, "queueing change");
            self.core.queue_mut().push(ValueChange {
                conn: Some(conn),
                name: name.to_string(),
                data,
                que_condition,
            });
            let Daemon { core, device } = self;
            core.check_bop_status(block, |condition| device.que_value_bop(condition));
            return Ok(Reply::OkWith("queued".to_string()));
        }

        self.apply_change(block, name, data)?;
        self.drain_queue(block);
        Ok(Reply::Ok)
    }

    fn change_master_state(&mut self, block: &mut Block, old: u32, new: u32) {
        let Daemon { core, device } = self;
        device.master_state_changed(&mut DeviceContext { core, block }, old, new);
        self.drain_queue(block);
    }

    fn bop_state_changed(&mut self, block: &mut Block, state: u32) {
        let Daemon { core, device } = self;
        device.bop_state_changed(&mut DeviceContext { core, block }, state);
        self.drain_queue(block);
    }

    fn post_event(&mut self, block: &mut Block, event: &Event) {
        let Daemon { core, device } = self;
        device.event(&mut DeviceContext { core, block }, event);
        self.drain_queue(block);
    }

    fn meta_requested(&mut self, block: &mut Block, conn: ConnId) {
        if let Err(e) = self.core.send_meta_info(block, conn, true) {
            tracing::warn!(%conn, error = %e, "cannot send metadata");
        }
    }

    fn device_type(&self, _block: &Block) -> DeviceType {
        self.device.device_type()
    }
}
