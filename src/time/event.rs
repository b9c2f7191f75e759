use crate::network::ConnId;
use crate::value::ValueData;

/// Type of an event, used to select and cancel timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Camera exposure finished
    ExposureEnd,
    /// Camera readout finished
    ReadoutEnd,
    /// Mount reached its target
    MoveEnd,
    /// Periodic ping of authenticated connections
    KeepAlive,
    /// Re-dial a broken outbound connection
    Reconnect,
    /// Periodic refresh of device values
    InfoTimer,
    /// Host defined event
    Custom(u32),
}

/// Typed argument carried by an event
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    #[default]
    None,
    Integer(i64),
    Double(f64),
    Text(String),
    Value { name: String, data: ValueData },
}

/// Event posted directly or delivered by a timer
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Connection the event is addressed to; `None` broadcasts
    pub target: Option<ConnId>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event {
            kind,
            target: None,
            payload: EventPayload::None,
        }
    }

    pub fn targeted(kind: EventKind, target: ConnId) -> Self {
        Event {
            target: Some(target),
            ..Event::new(kind)
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }
}
