use std::fmt;

use chrono::{DateTime, Utc};

use crate::core::{Error, Result};
use crate::protocol::{quote, Message, Params, SetOp};

/// Value is recorded into image headers
pub const VALUE_FITS: u32 = 0x0000_0100;
/// Remote peers may change the value with `SET`
pub const VALUE_WRITABLE: u32 = 0x1000_0000;

pub const DISPLAY_MASK: u32 = 0x0007_0000;
pub const DISPLAY_DEFAULT: u32 = 0x0000_0000;
pub const DISPLAY_DEGREES: u32 = 0x0001_0000;
pub const DISPLAY_HEX: u32 = 0x0002_0000;
pub const DISPLAY_TIME: u32 = 0x0003_0000;

pub const VALUE_ERROR_MASK: u32 = 0x0f00_0000;
pub const VALUE_WARNING: u32 = 0x0100_0000;
pub const VALUE_ERROR: u32 = 0x0200_0000;
pub const VALUE_OUT_OF_RANGE: u32 = 0x0400_0000;

/// Type of a value, sent as a one character tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Double,
    Bool,
    String,
    /// Seconds since the epoch
    Time,
    /// Index into a label table
    Selection,
    Rectangle,
    /// Running statistics of pushed samples
    Stat,
}

impl ValueKind {
    pub fn tag(self) -> char {
        match self {
            ValueKind::Integer => 'i',
            ValueKind::Double => 'd',
            ValueKind::Bool => 'b',
            ValueKind::String => 's',
            ValueKind::Time => 't',
            ValueKind::Selection => 'z',
            ValueKind::Rectangle => 'r',
            ValueKind::Stat => 'S',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'i' => Some(ValueKind::Integer),
            'd' => Some(ValueKind::Double),
            'b' => Some(ValueKind::Bool),
            's' => Some(ValueKind::String),
            't' => Some(ValueKind::Time),
            'z' => Some(ValueKind::Selection),
            'r' => Some(ValueKind::Rectangle),
            'S' => Some(ValueKind::Stat),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueKind::Integer | ValueKind::Double | ValueKind::Time | ValueKind::Selection
        )
    }
}

/// Aggregate of pushed samples; only the summary goes on the wire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatData {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stdev: f64,
}

impl StatData {
    /// Adds one sample using Welford's update
    pub fn push(&mut self, sample: f64) {
        let previous_mean = self.mean;
        let previous_m2 = if self.count > 1 {
            self.stdev * self.stdev * (self.count - 1) as f64
        } else {
            0.0
        };

        self.count += 1;
        if self.count == 1 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.mean = previous_mean + (sample - previous_mean) / self.count as f64;
        let m2 = previous_m2 + (sample - previous_mean) * (sample - self.mean);
        self.stdev = if self.count > 1 {
            (m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        };
    }
}

/// Typed payload of a value
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Integer(i64),
    Double(f64),
    Bool(bool),
    String(String),
    Time(f64),
    Selection(usize),
    Rectangle { x: i32, y: i32, w: i32, h: i32 },
    Stat(StatData),
}

impl ValueData {
    pub fn kind(&self) -> ValueKind {
        match self {
            ValueData::Integer(_) => ValueKind::Integer,
            ValueData::Double(_) => ValueKind::Double,
            ValueData::Bool(_) => ValueKind::Bool,
            ValueData::String(_) => ValueKind::String,
            ValueData::Time(_) => ValueKind::Time,
            ValueData::Selection(_) => ValueKind::Selection,
            ValueData::Rectangle { .. } => ValueKind::Rectangle,
            ValueData::Stat(_) => ValueKind::Stat,
        }
    }

    /// Payload tokens as sent after the type tag
    pub fn to_wire(&self) -> String {
        match self {
            ValueData::Integer(v) => v.to_string(),
            ValueData::Double(v) | ValueData::Time(v) => v.to_string(),
            ValueData::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            ValueData::String(v) => quote(v),
            ValueData::Selection(v) => v.to_string(),
            ValueData::Rectangle { x, y, w, h } => format!("{} {} {} {}", x, y, w, h),
            ValueData::Stat(s) => format!(
                "{} {} {} {} {}",
                s.count, s.mean, s.min, s.max, s.stdev
            ),
        }
    }

    /// Decodes a payload of the given kind, consuming its tokens
    pub fn parse(kind: ValueKind, params: &mut Params) -> Result<Self> {
        Ok(match kind {
            ValueKind::Integer => ValueData::Integer(params.next_i64()?),
            ValueKind::Double => ValueData::Double(params.next_f64()?),
            ValueKind::Bool => ValueData::Bool(params.next_bool()?),
            ValueKind::String => ValueData::String(params.next_str()?),
            ValueKind::Time => ValueData::Time(params.next_f64()?),
            ValueKind::Selection => ValueData::Selection(params.next_usize()?),
            ValueKind::Rectangle => ValueData::Rectangle {
                x: params.next_i32()?,
                y: params.next_i32()?,
                w: params.next_i32()?,
                h: params.next_i32()?,
            },
            ValueKind::Stat => ValueData::Stat(StatData {
                count: params.next_usize()?,
                mean: params.next_f64()?,
                min: params.next_f64()?,
                max: params.next_f64()?,
                stdev: params.next_f64()?,
            }),
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueData::Integer(v) => Some(*v as f64),
            ValueData::Double(v) | ValueData::Time(v) => Some(*v),
            ValueData::Selection(v) => Some(*v as f64),
            ValueData::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ValueData::Stat(s) => Some(s.mean),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueData::Integer(v) => Some(*v),
            ValueData::Selection(v) => i64::try_from(*v).ok(),
            ValueData::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Result of applying `op` with `operand` to the current payload
    pub fn apply(&self, op: SetOp, operand: ValueData) -> Result<ValueData> {
        if op == SetOp::Assign {
            return Ok(operand);
        }
        let sign = if op == SetOp::Add { 1 } else { -1 };
        match (self, &operand) {
            (ValueData::Integer(a), ValueData::Integer(b)) => {
                let result = if sign > 0 {
                    a.checked_add(*b)
                } else {
                    a.checked_sub(*b)
                };
                result.map(ValueData::Integer).ok_or_else(|| {
                    Error::value(format!("Integer overflow applying {} {}", op.as_str(), b))
                })
            }
            (ValueData::Double(a), ValueData::Double(b)) => {
                Ok(ValueData::Double(a + sign as f64 * b))
            }
            (ValueData::Time(a), ValueData::Time(b)) => Ok(ValueData::Time(a + sign as f64 * b)),
            (ValueData::Selection(a), ValueData::Selection(b)) => {
                let result = if sign > 0 {
                    a.checked_add(*b)
                } else {
                    a.checked_sub(*b)
                };
                result
                    .map(ValueData::Selection)
                    .ok_or_else(|| Error::value("Selection index out of range"))
            }
            _ => Err(Error::parameter(format!(
                "Operator {} not supported for type '{}'",
                op.as_str(),
                self.kind().tag()
            ))),
        }
    }
}

impl fmt::Display for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::Time(secs) => {
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                match DateTime::<Utc>::from_timestamp(whole as i64, nanos) {
                    Some(time) => write!(f, "{}", time.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
                    None => write!(f, "{}", secs),
                }
            }
            ValueData::String(v) => f.write_str(v),
            other => f.write_str(&other.to_wire()),
        }
    }
}

/// Named, typed attribute with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    name: String,
    description: String,
    data: ValueData,
    flags: u32,
    limits: Option<(f64, f64)>,
    labels: Vec<String>,
    /// State bits which hold back remote changes of this value
    que_condition: u32,
    /// Bumped on every metadata change
    meta_version: u32,
}

impl Value {
    pub fn new(name: impl Into<String>, description: impl Into<String>, data: ValueData) -> Self {
        Value {
            name: name.into(),
            description: description.into(),
            data,
            flags: 0,
            limits: None,
            labels: Vec::new(),
            que_condition: 0,
            meta_version: 0,
        }
    }

    pub fn writable(mut self) -> Self {
        self.flags |= VALUE_WRITABLE;
        self
    }

    pub fn fits(mut self) -> Self {
        self.flags |= VALUE_FITS;
        self
    }

    pub fn with_display(mut self, display: u32) -> Self {
        self.flags = (self.flags & !DISPLAY_MASK) | (display & DISPLAY_MASK);
        self
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_que_condition(mut self, condition: u32) -> Self {
        self.que_condition = condition;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> ValueKind {
        self.data.kind()
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_writable(&self) -> bool {
        self.flags & VALUE_WRITABLE != 0
    }

    pub fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn que_condition(&self) -> u32 {
        self.que_condition
    }

    pub fn meta_version(&self) -> u32 {
        self.meta_version
    }

    pub fn error_mask(&self) -> u32 {
        self.flags & VALUE_ERROR_MASK
    }

    /// Label of the current selection
    pub fn selected_label(&self) -> Option<&str> {
        match self.data {
            ValueData::Selection(index) => self.labels.get(index).map(String::as_str),
            _ => None,
        }
    }

    /// Checks `data` against the kind and limits of this value
    pub fn check(&self, data: &ValueData) -> Result<()> {
        if data.kind() != self.kind() {
            return Err(Error::value(format!(
                "Value {} expects type '{}', got '{}'",
                self.name,
                self.kind().tag(),
                data.kind().tag()
            )));
        }
        if let ValueData::Selection(index) = data {
            if !self.labels.is_empty() && *index >= self.labels.len() {
                return Err(Error::value(format!(
                    "Selection {} out of range for {}",
                    index, self.name
                )));
            }
        }
        if let (Some((min, max)), Some(v)) = (self.limits, data.as_f64()) {
            if v < min || v > max {
                return Err(Error::value(format!(
                    "{} outside limits [{}, {}] of {}",
                    v, min, max, self.name
                )));
            }
        }
        Ok(())
    }

    /// Replaces the payload; returns whether it changed
    pub fn set(&mut self, data: ValueData) -> Result<bool> {
        self.check(&data)?;
        if self.data == data {
            return Ok(false);
        }
        self.data = data;
        Ok(true)
    }

    /// Stores a payload received from the owning peer without checks
    pub fn set_remote(&mut self, data: ValueData) -> bool {
        if self.data == data {
            return false;
        }
        self.data = data;
        true
    }

    /// Adds a sample to a stat value
    pub fn push(&mut self, sample: f64) -> Result<()> {
        match &mut self.data {
            ValueData::Stat(stat) => {
                stat.push(sample);
                Ok(())
            }
            _ => Err(Error::value(format!("{} is not a statistics value", self.name))),
        }
    }

    /// Replaces the error bits; returns whether they changed
    pub fn set_error_mask(&mut self, mask: u32) -> bool {
        let new_flags = (self.flags & !VALUE_ERROR_MASK) | (mask & VALUE_ERROR_MASK);
        if new_flags == self.flags {
            return false;
        }
        self.flags = new_flags;
        self.meta_version += 1;
        true
    }

    /// Replaces flags received from a peer; returns the previous error bits
    pub fn set_flags(&mut self, flags: u32) -> u32 {
        let previous = self.error_mask();
        if flags != self.flags {
            self.flags = flags;
            self.meta_version += 1;
        }
        previous
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        let description = description.into();
        if description != self.description {
            self.description = description;
            self.meta_version += 1;
        }
    }

    pub fn set_limits(&mut self, min: f64, max: f64) {
        if self.limits != Some((min, max)) {
            self.limits = Some((min, max));
            self.meta_version += 1;
        }
    }

    pub fn set_labels(&mut self, labels: Vec<String>) {
        if labels != self.labels {
            self.labels = labels;
            self.meta_version += 1;
        }
    }

    /// `VALUE` line for the current payload
    pub fn value_message(&self) -> Message {
        Message::Value {
            name: self.name.clone(),
            data: self.data.clone(),
        }
    }

    /// `META` line followed by `SELECTION` and `LIMITS` where present
    pub fn meta_messages(&self) -> Vec<Message> {
        let mut messages = vec![Message::Meta {
            name: self.name.clone(),
            kind: self.kind(),
            flags: self.flags,
            description: self.description.clone(),
        }];
        if !self.labels.is_empty() {
            messages.push(Message::Selection {
                name: self.name.clone(),
                labels: self.labels.clone(),
            });
        }
        if let Some((min, max)) = self.limits {
            messages.push(Message::Limits {
                name: self.name.clone(),
                min,
                max,
            });
        }
        messages
    }
}
