//! Timers and events
//!
//! Events are either posted directly or scheduled on the `TimerQueue`
//! embedded in the reactor. A due timer is delivered during the idle
//! phase of the pass in which its fire time has been reached.

mod event;
mod timer;

pub use self::event::{Event, EventKind, EventPayload};
pub use self::timer::{TimerId, TimerQueue};
