use std::collections::VecDeque;
use std::fmt;

use crate::network::ConnId;

/// Status prefix of a command reply line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    /// `+000`
    Ok,
    /// `-001` unknown command or refused
    Command,
    /// `-002` malformed or missing parameters
    Parameter,
    /// `-003` a value could not be changed
    Value,
    /// `-004` anything else
    System,
}

impl ReplyCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyCode::Ok => "+000",
            ReplyCode::Command => "-001",
            ReplyCode::Parameter => "-002",
            ReplyCode::Value => "-003",
            ReplyCode::System => "-004",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "+000" => Some(ReplyCode::Ok),
            "-001" => Some(ReplyCode::Command),
            "-002" => Some(ReplyCode::Parameter),
            "-003" => Some(ReplyCode::Value),
            "-004" => Some(ReplyCode::System),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ReplyCode::Ok
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successfully handled device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send `+000 OK` now
    Ok,
    /// Send `+000 <text>` now
    OkWith(String),
    /// The handler answers later with `Block::send_reply`
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Queued,
    Sent,
}

/// Command queued for sending to a peer
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Line sent to the peer
    pub text: String,
    /// Connection whose request caused this command
    pub originator: Option<ConnId>,
    /// BOP bits that must be clear before the command may be sent
    pub bop_mask: u32,
    pub status: CommandStatus,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            originator: None,
            bop_mask: 0,
            status: CommandStatus::Queued,
        }
    }

    /// Command which waits until none of `bop_mask` is set in the composite state
    pub fn with_bop(text: impl Into<String>, bop_mask: u32) -> Self {
        Command {
            bop_mask,
            ..Command::new(text)
        }
    }

    pub fn originated_by(mut self, originator: ConnId) -> Self {
        self.originator = Some(originator);
        self
    }

    /// Whether the BOP precondition currently blocks this command
    pub fn is_blocked(&self, full_bop: u32) -> bool {
        self.bop_mask & full_bop != 0
    }

    /// Fresh unsent copy for another connection
    pub fn duplicate(&self) -> Self {
        Command {
            status: CommandStatus::Queued,
            ..self.clone()
        }
    }
}

/// Per-connection command FIFO with at most one command awaiting a reply
#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
    executing: Option<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    /// Moves the head to the executing slot when nothing is awaiting a
    /// reply and its BOP precondition is clear
    pub fn start_next(&mut self, full_bop: u32) -> Option<&Command> {
        if self.executing.is_some() {
            return None;
        }
        if self.queue.front()?.is_blocked(full_bop) {
            return None;
        }
        let mut command = self.queue.pop_front()?;
        command.status = CommandStatus::Sent;
        self.executing = Some(command);
        self.executing.as_ref()
    }

    /// Completes the executing command
    pub fn complete(&mut self) -> Option<Command> {
        self.executing.take()
    }

    pub fn executing(&self) -> Option<&Command> {
        self.executing.as_ref()
    }

    /// Whether the queue head is held back by the BOP mask
    pub fn head_blocked(&self, full_bop: u32) -> bool {
        self.queue
            .front()
            .map(|command| command.is_blocked(full_bop))
            .unwrap_or(false)
    }

    /// No command queued and none awaiting a reply
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.executing.is_none()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.executing.iter().chain(self.queue.iter())
    }

    /// Drops queued commands, the executing one still waits for its reply
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Drops the executing command and everything queued
    pub fn reset(&mut self) -> Vec<Command> {
        let mut dropped: Vec<Command> = self.executing.take().into_iter().collect();
        dropped.extend(self.queue.drain(..));
        dropped
    }

    /// Whether any command originated by `originator` is still pending
    pub fn originator_pending(&self, originator: ConnId) -> bool {
        self.iter().any(|command| command.originator == Some(originator))
    }

    /// Clears references to a connection that is going away
    pub fn forget_originator(&mut self, originator: ConnId) {
        for command in self.executing.iter_mut().chain(self.queue.iter_mut()) {
            if command.originator == Some(originator) {
                command.originator = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{BOP_EXPOSURE, BOP_TEL_MOVE};

    #[test]
    fn test_reply_codes() {
        for code in [
            ReplyCode::Ok,
            ReplyCode::Command,
            ReplyCode::Parameter,
            ReplyCode::Value,
            ReplyCode::System,
        ] {
            assert_eq!(ReplyCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ReplyCode::parse("+001"), None);
        assert!(ReplyCode::Ok.is_ok());
    }

    #[test]
    fn test_queue_order_and_single_executing() {
        let mut queue = CommandQueue::new();
        queue.push(Command::new("first"));
        queue.push(Command::new("second"));

        assert_eq!(queue.start_next(0).unwrap().text, "first");
        // awaiting reply
        assert!(queue.start_next(0).is_none());
        assert!(!queue.is_empty());

        assert_eq!(queue.complete().unwrap().text, "first");
        assert_eq!(queue.start_next(0).unwrap().text, "second");
        queue.complete();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_bop_blocks_head() {
        let mut queue = CommandQueue::new();
        queue.push(Command::with_bop("expose", BOP_EXPOSURE));
        queue.push(Command::new("status"));

        assert!(queue.head_blocked(BOP_EXPOSURE));
        assert!(queue.start_next(BOP_EXPOSURE).is_none());
        // unrelated bits do not block
        assert!(!queue.head_blocked(BOP_TEL_MOVE));
        assert_eq!(queue.start_next(BOP_TEL_MOVE).unwrap().text, "expose");
    }

    #[test]
    fn test_clear_keeps_executing() {
        let mut queue = CommandQueue::new();
        queue.push(Command::new("a"));
        queue.push(Command::new("b"));
        queue.start_next(0);
        queue.clear();
        assert!(!queue.is_empty());
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.reset().len(), 1);
        assert!(queue.is_empty());
    }
}
