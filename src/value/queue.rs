use std::collections::{HashSet, VecDeque};

use crate::network::ConnId;

use super::value::ValueData;

/// Remote value change held back by the current state
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Requesting connection, `None` for local requests
    pub conn: Option<ConnId>,
    pub name: String,
    pub data: ValueData,
    /// State bits which must be clear before the change applies
    pub que_condition: u32,
}

impl ValueChange {
    pub fn is_blocked(&self, state: u32) -> bool {
        self.que_condition & state != 0
    }
}

/// Pending value changes, FIFO per requesting connection
#[derive(Debug, Default)]
pub struct ValueQueue {
    entries: VecDeque<ValueChange>,
}

impl ValueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: ValueChange) {
        self.entries.push_back(change);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueChange> {
        self.entries.iter()
    }

    /// Removes the oldest change that may apply under `state`
    ///
    /// A blocked entry also holds back every later entry of the same
    /// connection.
    pub fn pop_next(&mut self, state: u32) -> Option<ValueChange> {
        let mut blocked: HashSet<Option<ConnId>> = HashSet::new();
        let position = self.entries.iter().position(|change| {
            if blocked.contains(&change.conn) {
                return false;
            }
            if change.is_blocked(state) {
                blocked.insert(change.conn);
                return false;
            }
            true
        })?;
        self.entries.remove(position)
    }

    /// Union of the conditions of every pending change
    pub fn pending_conditions(&self) -> u32 {
        self.entries.iter().fold(0, |acc, c| acc | c.que_condition)
    }

    /// Drops the changes requested by a connection that is going away
    pub fn drop_connection(&mut self, conn: ConnId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|change| change.conn != Some(conn));
        before - self.entries.len()
    }

    pub fn pending_for(&self, conn: ConnId) -> usize {
        self.entries
            .iter()
            .filter(|change| change.conn == Some(conn))
            .count()
    }

    /// Whether a change for `name` is waiting
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|change| change.name == name)
    }
}
