use std::fmt;

use crate::core::{DeviceType, Error, Result};
use crate::network::Address;
use crate::value::{ValueData, ValueKind};

use super::command::ReplyCode;
use super::params::{quote, Params};

/// Operator of a remote `SET`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Assign,
    Add,
    Subtract,
}

impl SetOp {
    pub fn as_str(self) -> &'static str {
        match self {
            SetOp::Assign => "=",
            SetOp::Add => "+=",
            SetOp::Subtract => "-=",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "=" => Ok(SetOp::Assign),
            "+=" => Ok(SetOp::Add),
            "-=" => Ok(SetOp::Subtract),
            _ => Err(Error::parameter(format!("Unknown operator '{}'", token))),
        }
    }
}

/// Severity of a `MSG` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl MessageLevel {
    pub fn bits(self) -> u32 {
        match self {
            MessageLevel::Error => 0x01,
            MessageLevel::Warning => 0x02,
            MessageLevel::Info => 0x04,
            MessageLevel::Debug => 0x08,
        }
    }

    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            0x01 => Ok(MessageLevel::Error),
            0x02 => Ok(MessageLevel::Warning),
            0x04 => Ok(MessageLevel::Info),
            0x08 => Ok(MessageLevel::Debug),
            _ => Err(Error::parameter(format!("Unknown message level {}", bits))),
        }
    }
}

/// One parsed protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Device or master status
    Status { state: u32, message: Option<String> },
    /// Status word together with the BOP mask
    BopState { state: u32, bop: u32 },
    Value { name: String, data: ValueData },
    Meta {
        name: String,
        kind: ValueKind,
        flags: u32,
        description: String,
    },
    Selection { name: String, labels: Vec<String> },
    Limits { name: String, min: f64, max: f64 },
    /// Remote change request, the payload is decoded against the local value
    Set {
        name: String,
        op: SetOp,
        payload: Vec<String>,
    },
    Address(Address),
    DeleteAddress { centrald_num: i32, name: String },
    Auth {
        name: String,
        centrald_id: i32,
        key: u32,
    },
    AuthOk { name: String, device_type: DeviceType },
    /// In-band transfer announcement, one size per channel
    Data {
        id: u32,
        data_type: i16,
        sizes: Vec<usize>,
    },
    /// Shared memory transfer announcement, `(shmid, len)` per channel
    Shared {
        id: u32,
        data_type: i16,
        segments: Vec<(i32, usize)>,
    },
    SharedRelease { id: u32 },
    Msg { level: MessageLevel, text: String },
    MetaRequest,
    Ping,
    Pong,
    Reply { code: ReplyCode, text: String },
    /// Anything else is a device command
    Command { verb: String, line: String },
}

impl Message {
    pub fn status(state: u32) -> Self {
        Message::Status {
            state,
            message: None,
        }
    }

    pub fn reply(code: ReplyCode, text: impl Into<String>) -> Self {
        Message::Reply {
            code,
            text: text.into(),
        }
    }

    /// Parses one line without its terminator
    pub fn parse(line: &str) -> Result<Self> {
        let mut params = Params::parse(line)?;
        let verb = params
            .next_str()
            .map_err(|_| Error::protocol("Empty line"))?;

        if let Some(code) = ReplyCode::parse(&verb) {
            return Ok(Message::Reply {
                code,
                text: params.rest().join(" "),
            });
        }

        let message = match verb.as_str() {
            "STATUS" => {
                let state = params.next_u32()?;
                let message = if params.is_empty() {
                    None
                } else {
                    Some(params.next_str()?)
                };
                Message::Status { state, message }
            }
            "BOP_STATE" => Message::BopState {
                state: params.next_u32()?,
                bop: params.next_u32()?,
            },
            "VALUE" => {
                let name = params.next_str()?;
                let kind = parse_kind(&params.next_str()?)?;
                let data = ValueData::parse(kind, &mut params)?;
                Message::Value { name, data }
            }
            "META" => Message::Meta {
                name: params.next_str()?,
                kind: parse_kind(&params.next_str()?)?,
                flags: params.next_u32()?,
                description: params.next_str()?,
            },
            "SELECTION" => Message::Selection {
                name: params.next_str()?,
                labels: params.rest(),
            },
            "LIMITS" => Message::Limits {
                name: params.next_str()?,
                min: params.next_f64()?,
                max: params.next_f64()?,
            },
            "SET" => Message::Set {
                name: params.next_str()?,
                op: SetOp::parse(&params.next_str()?)?,
                payload: params.rest(),
            },
            "ADDRESS" => Message::Address(Address {
                host_num: params.next_i32()?,
                centrald_num: params.next_i32()?,
                centrald_id: params.next_i32()?,
                name: params.next_str()?,
                host: params.next_str()?,
                port: params.next_u16()?,
                device_type: DeviceType::from_index(params.next_u32()?),
            }),
            "DELETE_ADDRESS" => Message::DeleteAddress {
                centrald_num: params.next_i32()?,
                name: params.next_str()?,
            },
            "AUTH" => Message::Auth {
                name: params.next_str()?,
                centrald_id: params.next_i32()?,
                key: params.next_u32()?,
            },
            "AUTH_OK" => Message::AuthOk {
                name: params.next_str()?,
                device_type: DeviceType::from_index(params.next_u32()?),
            },
            "DATA" => {
                let id = params.next_u32()?;
                let data_type = params.next_parsed("data type")?;
                let count = params.next_usize()?;
                let sizes = (0..count)
                    .map(|_| params.next_usize())
                    .collect::<Result<Vec<_>>>()?;
                Message::Data {
                    id,
                    data_type,
                    sizes,
                }
            }
            "SHARED" => {
                let id = params.next_u32()?;
                let data_type = params.next_parsed("data type")?;
                let count = params.next_usize()?;
                let segments = (0..count)
                    .map(|_| parse_segment(&params.next_str()?))
                    .collect::<Result<Vec<_>>>()?;
                Message::Shared {
                    id,
                    data_type,
                    segments,
                }
            }
            "SHARED_RELEASE" => Message::SharedRelease {
                id: params.next_u32()?,
            },
            "MSG" => Message::Msg {
                level: MessageLevel::from_bits(params.next_u32()?)?,
                text: params.next_str()?,
            },
            "META_REQUEST" => Message::MetaRequest,
            "PING" => Message::Ping,
            "PONG" => Message::Pong,
            _ => {
                return Ok(Message::Command {
                    verb,
                    line: line.trim().to_string(),
                })
            }
        };

        params.expect_end()?;
        Ok(message)
    }

    /// Formats the message as one line without terminator
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

/// Whether `verb` names a protocol line rather than a device command
pub fn is_protocol_verb(verb: &str) -> bool {
    matches!(
        verb,
        "STATUS"
            | "BOP_STATE"
            | "VALUE"
            | "META"
            | "SELECTION"
            | "LIMITS"
            | "SET"
            | "ADDRESS"
            | "DELETE_ADDRESS"
            | "AUTH"
            | "AUTH_OK"
            | "DATA"
            | "CHUNK"
            | "SHARED"
            | "SHARED_RELEASE"
            | "MSG"
            | "META_REQUEST"
            | "PING"
            | "PONG"
    ) || ReplyCode::parse(verb).is_some()
}

/// Whether a line with `verb` expects a reply from the receiving side
pub fn is_request_verb(verb: &str) -> bool {
    matches!(verb, "SET" | "META_REQUEST") || !is_protocol_verb(verb)
}

fn parse_kind(tag: &str) -> Result<ValueKind> {
    let mut chars = tag.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => ValueKind::from_tag(c)
            .ok_or_else(|| Error::parameter(format!("Unknown value type '{}'", tag))),
        _ => Err(Error::parameter(format!("Unknown value type '{}'", tag))),
    }
}

fn parse_segment(token: &str) -> Result<(i32, usize)> {
    let (id, len) = token
        .split_once(':')
        .ok_or_else(|| Error::parameter(format!("Invalid segment '{}'", token)))?;
    let id = id
        .parse()
        .map_err(|_| Error::parameter(format!("Invalid segment id '{}'", id)))?;
    let len = len
        .parse()
        .map_err(|_| Error::parameter(format!("Invalid segment length '{}'", len)))?;
    Ok((id, len))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Status { state, message } => match message {
                Some(text) => write!(f, "STATUS {} {}", state, quote(text)),
                None => write!(f, "STATUS {}", state),
            },
            Message::BopState { state, bop } => write!(f, "BOP_STATE {} {}", state, bop),
            Message::Value { name, data } => {
                write!(f, "VALUE {} {} {}", name, data.kind().tag(), data.to_wire())
            }
            Message::Meta {
                name,
                kind,
                flags,
                description,
            } => write!(
                f,
                "META {} {} {} {}",
                name,
                kind.tag(),
                flags,
                quote(description)
            ),
            Message::Selection { name, labels } => {
                write!(f, "SELECTION {}", name)?;
                for label in labels {
                    write!(f, " {}", quote(label))?;
                }
                Ok(())
            }
            Message::Limits { name, min, max } => write!(f, "LIMITS {} {} {}", name, min, max),
            Message::Set { name, op, payload } => {
                write!(f, "SET {} {}", name, op.as_str())?;
                for token in payload {
                    write!(f, " {}", token)?;
                }
                Ok(())
            }
            Message::Address(address) => write!(
                f,
                "ADDRESS {} {} {} {} {} {} {}",
                address.host_num,
                address.centrald_num,
                address.centrald_id,
                address.name,
                address.host,
                address.port,
                address.device_type.index()
            ),
            Message::DeleteAddress { centrald_num, name } => {
                write!(f, "DELETE_ADDRESS {} {}", centrald_num, name)
            }
            Message::Auth {
                name,
                centrald_id,
                key,
            } => write!(f, "AUTH {} {} {}", name, centrald_id, key),
            Message::AuthOk { name, device_type } => {
                write!(f, "AUTH_OK {} {}", name, device_type.index())
            }
            Message::Data {
                id,
                data_type,
                sizes,
            } => {
                write!(f, "DATA {} {} {}", id, data_type, sizes.len())?;
                for size in sizes {
                    write!(f, " {}", size)?;
                }
                Ok(())
            }
            Message::Shared {
                id,
                data_type,
                segments,
            } => {
                write!(f, "SHARED {} {} {}", id, data_type, segments.len())?;
                for (shmid, len) in segments {
                    write!(f, " {}:{}", shmid, len)?;
                }
                Ok(())
            }
            Message::SharedRelease { id } => write!(f, "SHARED_RELEASE {}", id),
            Message::Msg { level, text } => write!(f, "MSG {} {}", level.bits(), quote(text)),
            Message::MetaRequest => f.write_str("META_REQUEST"),
            Message::Ping => f.write_str("PING"),
            Message::Pong => f.write_str("PONG"),
            Message::Reply { code, text } => {
                if text.is_empty() {
                    write!(f, "{}", code)
                } else {
                    write!(f, "{} {}", code, text)
                }
            }
            Message::Command { line, .. } => f.write_str(line),
        }
    }
}
