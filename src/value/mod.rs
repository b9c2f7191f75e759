//! Typed attributes synchronised between peers
//!
//! A process owns its local values in a `ValueTable`; every connection
//! mirrors the values advertised by its peer in another table. Remote
//! changes which the current state forbids wait in a `ValueQueue`.

pub mod queue;
pub mod table;
#[allow(clippy::module_inception)]
pub mod value;

pub use self::queue::{ValueChange, ValueQueue};
pub use self::table::{MetaUpdate, ValueTable};
pub use self::value::{StatData, Value, ValueData, ValueKind};
