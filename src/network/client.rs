use std::collections::HashMap;

use crate::core::DeviceType;
use crate::protocol::{Command, ReplyCode};
use crate::time::Event;
use crate::value::ValueData;

/// Local view of a remote device, attached to its connection
pub trait DeviceClient: Send {
    fn device_type(&self) -> DeviceType;

    /// Remote device state changed
    fn state_changed(&mut self, _old: u32, _new: u32) {}

    /// Remote value changed
    fn value_changed(&mut self, _name: &str, _data: &ValueData) {}

    /// Event addressed to this connection or broadcast
    fn post_event(&mut self, _event: &Event) {}

    fn command_returned(&mut self, _command: &Command, _code: ReplyCode) {}
}

/// Client used when no factory is registered for a device type
#[derive(Debug, Clone)]
pub struct GenericClient {
    device_type: DeviceType,
}

impl GenericClient {
    pub fn new(device_type: DeviceType) -> Self {
        GenericClient { device_type }
    }
}

impl DeviceClient for GenericClient {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }
}

pub type ClientFactory = Box<dyn Fn(&str) -> Box<dyn DeviceClient> + Send>;

/// Factories creating device clients, keyed by device type
#[derive(Default)]
pub struct ClientRegistry {
    factories: HashMap<DeviceType, ClientFactory>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory for a device type, replacing any previous one
    pub fn register<F>(&mut self, device_type: DeviceType, factory: F)
    where
        F: Fn(&str) -> Box<dyn DeviceClient> + Send + 'static,
    {
        self.factories.insert(device_type, Box::new(factory));
    }

    pub fn is_registered(&self, device_type: DeviceType) -> bool {
        self.factories.contains_key(&device_type)
    }

    /// Creates the client for a device named `name`
    pub fn create(&self, device_type: DeviceType, name: &str) -> Box<dyn DeviceClient> {
        match self.factories.get(&device_type) {
            Some(factory) => factory(name),
            None => Box::new(GenericClient::new(device_type)),
        }
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
