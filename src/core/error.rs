use std::io;
use thiserror::Error;

use crate::protocol::ReplyCode;

/// Custom error types for the coordination core
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Reactor error: {0}")]
    Reactor(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new parameter error
    pub fn parameter(msg: impl Into<String>) -> Self {
        Error::Parameter(msg.into())
    }

    /// Creates a new command error
    pub fn command(msg: impl Into<String>) -> Self {
        Error::Command(msg.into())
    }

    /// Creates a new value error
    pub fn value(msg: impl Into<String>) -> Self {
        Error::Value(msg.into())
    }

    /// Creates a new authorization error
    pub fn authorization(msg: impl Into<String>) -> Self {
        Error::Authorization(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new reactor error
    pub fn reactor(msg: impl Into<String>) -> Self {
        Error::Reactor(msg.into())
    }

    /// Reply code sent to the originator of a command that failed with this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Error::Parameter(_) => ReplyCode::Parameter,
            Error::Value(_) => ReplyCode::Value,
            Error::Command(_) | Error::Authorization(_) => ReplyCode::Command,
            _ => ReplyCode::System,
        }
    }
}
