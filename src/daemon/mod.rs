//! Device processes
//!
//! A `Daemon` hosts one local device on a `Block`: it owns the device
//! state word and values, answers the built-in commands and holds back
//! value changes the current state forbids.

pub mod core;
pub mod device;

pub use self::core::DaemonCore;
pub use self::device::{Daemon, Device, DeviceContext};
