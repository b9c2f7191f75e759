//! Composite state bit-fields
//!
//! Master and device states are single `u32` values made of disjoint
//! fields. The BOP field is shared by both and is always compared
//! separately from the rest of the word.

/// Operational phase of the fleet
pub const SERVERD_STATUS_MASK: u32 = 0x0f;
pub const SERVERD_DAY: u32 = 0x00;
pub const SERVERD_EVENING: u32 = 0x01;
pub const SERVERD_DUSK: u32 = 0x02;
pub const SERVERD_NIGHT: u32 = 0x03;
pub const SERVERD_DAWN: u32 = 0x04;
pub const SERVERD_MORNING: u32 = 0x05;
pub const SERVERD_SOFT_OFF: u32 = 0x0e;
pub const SERVERD_HARD_OFF: u32 = 0x0f;

pub const SERVERD_STANDBY_MASK: u32 = 0x30;
pub const SERVERD_ON: u32 = 0x00;
pub const SERVERD_STANDBY: u32 = 0x10;
pub const SERVERD_OFF: u32 = 0x20;

pub const WEATHER_MASK: u32 = 0x8000_0000;
pub const GOOD_WEATHER: u32 = 0x0000_0000;
pub const BAD_WEATHER: u32 = 0x8000_0000;

/// Block operation bits
pub const BOP_MASK: u32 = 0x3f00_0000;
pub const BOP_EXPOSURE: u32 = 0x0100_0000;
pub const BOP_READOUT: u32 = 0x0200_0000;
pub const BOP_TEL_MOVE: u32 = 0x0400_0000;
pub const BOP_WILL_EXPOSE: u32 = 0x0800_0000;
pub const BOP_TRIG_EXPOSE: u32 = 0x1000_0000;
pub const BOP_TRIG_AUTO: u32 = 0x2000_0000;

/// Set only on a STATUS sent to the connection whose command caused it
pub const DEVICE_SC_CURR: u32 = 0x4000_0000;

pub const DEVICE_ERROR_MASK: u32 = 0x00ff_0000;
pub const DEVICE_NO_ERROR: u32 = 0x0000_0000;
pub const DEVICE_ERROR_KILL: u32 = 0x0001_0000;
pub const DEVICE_ERROR_HW: u32 = 0x0002_0000;
pub const DEVICE_NOT_READY: u32 = 0x0004_0000;

/// Device specific status bits
pub const DEVICE_STATUS_MASK: u32 = 0x0000_ffff;

/// Comparison of two composite state words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub old: u32,
    pub new: u32,
}

impl StateTransition {
    pub fn new(old: u32, new: u32) -> Self {
        StateTransition { old, new }
    }

    /// Whether anything outside the BOP field changed
    pub fn status_changed(&self) -> bool {
        (self.old & !BOP_MASK) != (self.new & !BOP_MASK)
    }

    /// Whether the BOP field changed
    pub fn bop_changed(&self) -> bool {
        (self.old & BOP_MASK) != (self.new & BOP_MASK)
    }

    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }
}

/// Applies `new` under `mask`, leaving other bits of `state` untouched
pub fn mask_bits(state: u32, mask: u32, new: u32) -> u32 {
    (state & !mask) | (new & mask)
}

/// Human readable name of the master status phase
pub fn status_name(state: u32) -> &'static str {
    match state & SERVERD_STATUS_MASK {
        SERVERD_DAY => "day",
        SERVERD_EVENING => "evening",
        SERVERD_DUSK => "dusk",
        SERVERD_NIGHT => "night",
        SERVERD_DAWN => "dawn",
        SERVERD_MORNING => "morning",
        SERVERD_SOFT_OFF => "soft off",
        SERVERD_HARD_OFF => "hard off",
        _ => "unknown",
    }
}
