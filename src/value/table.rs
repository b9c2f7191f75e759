use std::collections::HashMap;

use crate::core::{Error, Result};

use super::value::{Value, ValueData, ValueKind};

/// Outcome of applying a peer's metadata line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaUpdate {
    pub previous_error: u32,
    pub error: u32,
}

impl MetaUpdate {
    /// The value entered an error state with this update
    pub fn entered_error(&self) -> bool {
        self.previous_error == 0 && self.error != 0
    }
}

/// Ordered set of values indexed by name
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    values: Vec<Value>,
    index: HashMap<String, usize>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value; names are unique within a table
    pub fn insert(&mut self, value: Value) -> Result<()> {
        if self.index.contains_key(value.name()) {
            return Err(Error::value(format!("Duplicate value {}", value.name())));
        }
        self.index.insert(value.name().to_string(), self.values.len());
        self.values.push(value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&i| &self.values[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        match self.index.get(name) {
            Some(&i) => self.values.get_mut(i),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Names of values with a non-zero error mask
    pub fn failed(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|v| v.error_mask() != 0)
            .map(|v| v.name().to_string())
            .collect()
    }

    /// Entry for a value advertised by a peer, created on first sight
    fn remote_entry(&mut self, name: &str, kind: ValueKind) -> &mut Value {
        let index = match self.index.get(name) {
            Some(&i) => i,
            None => {
                let placeholder = default_data(kind);
                self.index.insert(name.to_string(), self.values.len());
                self.values.push(Value::new(name, "", placeholder));
                self.values.len() - 1
            }
        };
        &mut self.values[index]
    }

    /// Stores a peer's `VALUE`; returns whether it changed
    pub fn apply_remote(&mut self, name: &str, data: ValueData) -> bool {
        let kind = data.kind();
        let value = self.remote_entry(name, kind);
        if value.kind() != kind {
            *value = Value::new(name, value.description().to_string(), data);
            return true;
        }
        value.set_remote(data)
    }

    /// Stores a peer's `META`
    pub fn apply_meta(
        &mut self,
        name: &str,
        kind: ValueKind,
        flags: u32,
        description: &str,
    ) -> MetaUpdate {
        let value = self.remote_entry(name, kind);
        if value.kind() != kind {
            *value = Value::new(name, description, default_data(kind));
        }
        value.set_description(description);
        let previous_error = value.set_flags(flags);
        MetaUpdate {
            previous_error,
            error: value.error_mask(),
        }
    }

    pub fn apply_labels(&mut self, name: &str, labels: Vec<String>) {
        self.remote_entry(name, ValueKind::Selection).set_labels(labels);
    }

    pub fn apply_limits(&mut self, name: &str, min: f64, max: f64) {
        self.remote_entry(name, ValueKind::Double).set_limits(min, max);
    }
}

fn default_data(kind: ValueKind) -> ValueData {
    match kind {
        ValueKind::Integer => ValueData::Integer(0),
        ValueKind::Double => ValueData::Double(0.0),
        ValueKind::Bool => ValueData::Bool(false),
        ValueKind::String => ValueData::String(String::new()),
        ValueKind::Time => ValueData::Time(0.0),
        ValueKind::Selection => ValueData::Selection(0),
        ValueKind::Rectangle => ValueData::Rectangle {
            x: 0,
            y: 0,
            w: 0,
            h: 0,
        },
        ValueKind::Stat => ValueData::Stat(Default::default()),
    }
}
