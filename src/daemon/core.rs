use crate::core::state::{mask_bits, StateTransition, BOP_MASK};
use crate::core::{Error, Result};
use crate::network::{Block, ConnId, Connection};
use crate::protocol::Message;
use crate::value::{Value, ValueData, ValueQueue, ValueTable};

/// State and values of a process hosting a local device
#[derive(Debug, Default)]
pub struct DaemonCore {
    state: u32,
    values: ValueTable,
    queue: ValueQueue,
    /// BOP bits raised while value changes wait in the queue
    queue_bop: u32,
}

impl DaemonCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device state as set by the device
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Device state as broadcast, including BOP bits of queued changes
    pub fn full_state(&self) -> u32 {
        self.state | self.queue_bop
    }

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn queue(&self) -> &ValueQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut ValueQueue {
        &mut self.queue
    }

    pub fn add_value(&mut self, value: Value) -> Result<()> {
        self.values.insert(value)
    }

    /// Replaces the bits of `mask` and broadcasts the parts that changed
    pub fn mask_state(&mut self, block: &mut Block, mask: u32, new: u32, text: Option<&str>) {
        let old = self.full_state();
        self.state = mask_bits(self.state, mask, new);
        self.publish(block, old, text);
    }

    pub fn set_state(&mut self, block: &mut Block, new: u32, text: Option<&str>) {
        self.mask_state(block, u32::MAX, new, text);
    }

    /// Sends `STATUS` when status bits changed and `BOP_STATE` when BOP bits did
    fn publish(&mut self, block: &mut Block, old: u32, text: Option<&str>) {
        let transition = StateTransition::new(old, self.full_state());
        if transition.status_changed() {
            tracing::debug!(old = transition.old, new = transition.new, "device state changed");
            block.send_status_message(transition.new, text, None);
        }
        if transition.bop_changed() {
            block.send_bop_message(transition.new, transition.new & BOP_MASK, None);
        }
    }

    /// Recomputes the BOP bits of queued changes
    pub fn check_bop_status<F>(&mut self, block: &mut Block, bop_of: F)
    where
        F: Fn(u32) -> u32,
    {
        let old = self.full_state();
        self.queue_bop = self
            .queue
            .iter()
            .fold(0, |acc, change| acc | bop_of(change.que_condition));
        self.publish(block, old, None);
    }

    /// Stores a local value and broadcasts it when it changed
    pub fn set_value(&mut self, block: &mut Block, name: &str, data: ValueData) -> Result<bool> {
        let value = self
            .values
            .get_mut(name)
            .ok_or_else(|| Error::value(format!("Unknown value {}", name)))?;
        if !value.set(data)? {
            return Ok(false);
        }
        block.send_all(&value.value_message());
        Ok(true)
    }

    /// Broadcasts the current payload of a value whether or not it changed
    pub fn send_value_all(&self, block: &mut Block, name: &str) -> Result<()> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::value(format!("Unknown value {}", name)))?;
        block.send_all(&value.value_message());
        Ok(())
    }

    /// Updates the error bits of a value; metadata is resent only on change
    pub fn value_mask_error(&mut self, block: &mut Block, name: &str, mask: u32) -> Result<()> {
        let value = self
            .values
            .get_mut(name)
            .ok_or_else(|| Error::value(format!("Unknown value {}", name)))?;
        if value.set_error_mask(mask) {
            self.update_meta_informations(block, name)?;
        }
        Ok(())
    }

    /// Sends the metadata of one value to every peer lacking its current version
    pub fn update_meta_informations(&self, block: &mut Block, name: &str) -> Result<()> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::value(format!("Unknown value {}", name)))?;
        for id in block.authenticated_ids() {
            if let Some(conn) = block.connection_mut(id) {
                send_value_meta(conn, value, false)?;
            }
        }
        Ok(())
    }

    /// Sends metadata and current payload of every value to one peer
    ///
    /// Values whose metadata the peer already holds are skipped unless
    /// `force` is set.
    pub fn send_meta_info(&self, block: &mut Block, id: ConnId, force: bool) -> Result<()> {
        let conn = block
            .connection_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        for value in self.values.iter() {
            send_value_meta(conn, value, force)?;
        }
        Ok(())
    }

    /// Sends every current payload to one peer
    pub fn send_values(&self, block: &mut Block, id: ConnId) -> Result<()> {
        let conn = block
            .connection_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        for value in self.values.iter() {
            conn.send(value.value_message())?;
        }
        Ok(())
    }

    /// Tells one peer the current device state
    pub fn send_state(&self, block: &mut Block, id: ConnId) -> Result<()> {
        let conn = block
            .connection_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        conn.send(Message::status(self.full_state()))
    }
}

fn send_value_meta(conn: &mut Connection, value: &Value, force: bool) -> Result<()> {
    if !force && !conn.meta_outdated(value.name(), value.meta_version()) {
        return Ok(());
    }
    for message in value.meta_messages() {
        conn.send(message)?;
    }
    conn.send(value.value_message())?;
    conn.mark_meta_sent(value.name(), value.meta_version());
    Ok(())
}
