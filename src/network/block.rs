//! Connection multiplexer
//!
//! A `Block` owns every connection of a process, the peer directory and
//! the timer queue, and drives them from a single task. One pass of the
//! reactor waits for socket readiness, the listener, host name lookups or
//! the next deadline, dispatches readiness to the connections that were
//! live when the wait started, then performs the idle work: child reaping,
//! splicing of staged connections, due timers and reaping of deleted
//! connections.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{pending, select_all};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep_until, Instant};

use crate::core::state::{
    mask_bits, StateTransition, BAD_WEATHER, BOP_MASK, DEVICE_SC_CURR, SERVERD_HARD_OFF,
    SERVERD_ON, SERVERD_SOFT_OFF, SERVERD_STANDBY, SERVERD_STANDBY_MASK, SERVERD_STATUS_MASK,
    WEATHER_MASK,
};
use crate::core::{Config, DeviceType, Error, Result};
use crate::protocol::{Command, ConnState, Message, MessageLevel, Params, Reply, ReplyCode};
use crate::time::{Event, EventKind, TimerId, TimerQueue};
use crate::value::{Value, ValueData};

use super::arena::{Arena, ConnId};
use super::client::ClientRegistry;
use super::connection::{ConnEvent, ConnKind, Connection};
use super::data::SegmentPool;
use super::directory::{Address, Directory, DirectoryUpdate, Lookups};
use super::host::Host;

/// Answer of `Block::delete_connection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// No reference remains, the connection may be destroyed
    Deletable,
    /// The connection is not marked for deletion yet
    Retry,
}

enum Wake {
    Io,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Resolved(ConnId, Result<SocketAddr>),
    Timeout,
}

/// Whether a failed `accept` concerns only the peer being accepted
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || e.raw_os_error() == Some(libc::EPROTO)
}

/// Owner of all connections and the reactor loop
#[derive(Debug)]
pub struct Block {
    config: Config,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: Arena<Connection>,
    /// Device connections taking part in dispatch
    live: Vec<ConnId>,
    /// Central authority connections taking part in dispatch
    centrals: Vec<ConnId>,
    /// Added during this pass, `true` for central connections
    staged: Vec<(ConnId, bool)>,
    directory: Directory,
    lookups: Lookups,
    registry: ClientRegistry,
    timers: TimerQueue,
    master_state: u32,
    /// Composite state last announced through the host
    published_state: u32,
    state_master: Option<ConnId>,
    segments: SegmentPool,
    end_loop: bool,
}

impl Block {
    /// Creates a block without a listener
    pub fn new(config: Config) -> Self {
        let segments = SegmentPool::new(config.shared_segments);
        Block {
            config,
            listener: None,
            local_addr: None,
            connections: Arena::new(),
            live: Vec::new(),
            centrals: Vec::new(),
            staged: Vec::new(),
            directory: Directory::new(),
            lookups: Lookups::default(),
            registry: ClientRegistry::new(),
            timers: TimerQueue::new(),
            master_state: 0,
            published_state: 0,
            state_master: None,
            segments,
            end_loop: false,
        }
    }

    /// Binds the listener and opens the configured central connections
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind((config.listen_addr, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let mut block = Block::new(config);
        block.listener = Some(listener);
        block.local_addr = Some(local_addr);
        tracing::info!(name = %block.config.name, addr = %local_addr, "block listening");

        for centrald in block.config.centrald.clone() {
            let conn = Connection::central(&centrald)?;
            let id = block.add_centrald_connection(conn, true);
            if centrald.master {
                block.state_master = Some(id);
            }
        }
        for peer in &block.config.peers {
            block.directory.insert(Address::from(peer));
        }
        if !block.config.keep_alive.is_zero() {
            block
                .timers
                .schedule_in(block.config.keep_alive, Event::new(EventKind::KeepAlive));
        }
        Ok(block)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Connections taking part in dispatch, devices first
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.live.iter().chain(self.centrals.iter()).copied().collect()
    }

    /// Connections added since the last splice
    pub fn staged_ids(&self) -> Vec<ConnId> {
        self.staged.iter().map(|&(id, _)| id).collect()
    }

    fn all_ids(&self) -> Vec<ConnId> {
        let mut ids = self.connection_ids();
        ids.extend(self.staged.iter().map(|&(id, _)| id));
        ids
    }

    pub fn master_state(&self) -> u32 {
        self.master_state
    }

    /// BOP mask of the master state combined with every peer's sub-mask
    pub fn full_bop(&self) -> u32 {
        self.connections
            .iter()
            .fold(self.master_state & BOP_MASK, |acc, (_, conn)| acc | conn.remote_bop())
    }

    /// Master state with the composite BOP mask
    pub fn full_state(&self) -> u32 {
        (self.master_state & !BOP_MASK) | self.full_bop()
    }

    pub fn state_master(&self) -> Option<ConnId> {
        self.state_master
    }

    /// Designates the connection whose master state requests are authoritative
    pub fn set_state_master(&mut self, id: Option<ConnId>) {
        self.state_master = id;
    }

    fn attach_client(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.client().is_none() && conn.device_type() != DeviceType::Unknown {
            let client = self.registry.create(conn.device_type(), conn.name());
            conn.set_client(client);
        }
    }

    /// Registers a device connection; it takes part in dispatch from the next pass
    pub fn add_connection(&mut self, conn: Connection) -> ConnId {
        tracing::debug!(conn = %conn.name(), kind = ?conn.kind(), "adding connection");
        let id = self.connections.insert(conn);
        self.staged.push((id, false));
        self.attach_client(id);
        self.start_lookup(id);
        id
    }

    /// Registers a central authority connection
    pub fn add_centrald_connection(&mut self, conn: Connection, immediate: bool) -> ConnId {
        tracing::debug!(conn = %conn.name(), immediate, "adding central connection");
        let id = self.connections.insert(conn);
        if immediate {
            self.centrals.push(id);
        } else {
            self.staged.push((id, true));
        }
        self.start_lookup(id);
        id
    }

    fn start_lookup(&mut self, id: ConnId) {
        let address = match self.connections.get(id) {
            Some(conn) if conn.awaiting_lookup() => conn.address().cloned(),
            _ => None,
        };
        if let Some(address) = address {
            self.lookups.start(id, address);
        }
    }

    /// Dials a connection whose host name lookup finished
    fn lookup_done<H: Host + ?Sized>(&mut self, host: &mut H, id: ConnId, result: Result<SocketAddr>) {
        let result = match self.connections.get_mut(id) {
            Some(conn) if conn.awaiting_lookup() => result.and_then(|addr| conn.resolved(addr)),
            _ => return,
        };
        if let Err(e) = result {
            self.connection_failed(host, id, e);
        }
    }

    /// Removes a connection from every list; unknown ids are ignored
    pub fn remove_connection(&mut self, id: ConnId) -> Option<Connection> {
        self.live.retain(|&c| c != id);
        self.centrals.retain(|&c| c != id);
        self.staged.retain(|&(c, _)| c != id);
        if self.state_master == Some(id) {
            self.state_master = None;
        }
        self.connections.remove(id)
    }

    /// Second phase of deletion
    ///
    /// The connection must already be in the `DELETE` state. Every other
    /// connection and the block drop their references to it, after which
    /// the caller may destroy it.
    pub fn delete_connection(&mut self, id: ConnId) -> DeleteStatus {
        let central = match self.connections.get(id) {
            Some(conn) if conn.state() == ConnState::Delete => {
                conn.centrald_num()
            }
            Some(_) => return DeleteStatus::Retry,
            None => return DeleteStatus::Deletable,
        };
        for (other, conn) in self.connections.iter_mut() {
            if other != id {
                conn.forget(id);
            }
        }
        if self.state_master == Some(id) {
            self.state_master = None;
        }
        self.timers.delete_targeted(id);
        if let Some(num) = central {
            let withdrawn = self.directory.remove_centrald(num);
            if !withdrawn.is_empty() {
                tracing::debug!(centrald = num, count = withdrawn.len(), "withdrew addresses");
            }
        }
        DeleteStatus::Deletable
    }

    /// First open connection named `name`
    pub fn find_by_name(&self, name: &str) -> Option<ConnId> {
        self.all_ids().into_iter().find(|&id| {
            self.connections
                .get(id)
                .map(|conn| conn.name() == name && conn.state() != ConnState::Delete)
                .unwrap_or(false)
        })
    }

    /// First open connection to a peer of `device_type`
    pub fn find_by_type(&self, device_type: DeviceType) -> Option<ConnId> {
        self.all_ids().into_iter().find(|&id| {
            self.connections
                .get(id)
                .map(|conn| conn.device_type() == device_type && conn.state() != ConnState::Delete)
                .unwrap_or(false)
        })
    }

    /// Id the central authority numbered `centrald_num` assigned to this process
    pub fn centrald_id_at_num(&self, centrald_num: i32) -> Option<i32> {
        self.centrals
            .iter()
            .chain(self.staged.iter().filter(|(_, central)| *central).map(|(id, _)| id))
            .filter_map(|&id| self.connections.get(id))
            .find(|conn| conn.centrald_num() == Some(centrald_num))
            .map(|conn| conn.centrald_id())
    }

    pub fn find_address(&self, name: &str) -> Option<&Address> {
        self.directory.find(name)
    }

    pub fn find_address_in(&self, centrald_num: i32, name: &str) -> Option<&Address> {
        self.directory.find_in(centrald_num, name)
    }

    fn open_connection(&mut self, address: Address) -> Result<ConnId> {
        tracing::info!(conn = %address.name, host = %address.host, port = address.port, "opening connection");
        let conn = Connection::connect(address)?;
        Ok(self.add_connection(conn))
    }

    /// Records a directory entry and connects to it when the host wants to
    pub fn add_address<H: Host + ?Sized>(&mut self, host: &mut H, address: Address) -> DirectoryUpdate {
        let update = self.directory.insert(address.clone());
        if update == DirectoryUpdate::Unchanged || address.name == self.config.name {
            return update;
        }
        match self.find_by_name(&address.name) {
            Some(id) => {
                if let Some(conn) = self.connections.get_mut(id) {
                    if conn.address().is_some() {
                        tracing::debug!(conn = %address.name, "address updated");
                        conn.update_address(address);
                    }
                }
            }
            None => {
                if host.will_connect(&address) {
                    let name = address.name.clone();
                    if let Err(e) = self.open_connection(address) {
                        tracing::warn!(conn = %name, error = %e, "cannot open connection");
                    }
                }
            }
        }
        update
    }

    /// Withdraws a directory entry
    pub fn delete_address(&mut self, centrald_num: i32, name: &str) -> Option<Address> {
        self.directory.remove(centrald_num, name)
    }

    /// Returns the connection named `name`, opening it from the directory if needed
    pub fn get_or_open_connection<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        name: &str,
    ) -> Result<ConnId> {
        if let Some(id) = self.find_by_name(name) {
            return Ok(id);
        }
        let address = self
            .directory
            .find(name)
            .cloned()
            .ok_or_else(|| Error::network(format!("No connection or address for {}", name)))?;
        if !host.will_connect(&address) {
            return Err(Error::authorization(format!(
                "Connection to {} not allowed",
                name
            )));
        }
        self.open_connection(address)
    }

    /// Connections past the handshake, staged ones included
    pub fn authenticated_ids(&self) -> Vec<ConnId> {
        self.all_ids()
            .into_iter()
            .filter(|&id| {
                self.connections
                    .get(id)
                    .map(|conn| conn.state().is_authenticated())
                    .unwrap_or(false)
            })
            .collect()
    }

    fn send_to(&mut self, id: ConnId, message: Message) {
        if let Some(conn) = self.connections.get_mut(id) {
            if let Err(e) = conn.send(message) {
                tracing::warn!(conn = %conn.name(), error = %e, "cannot queue message");
            }
        }
    }

    /// Sends a line to every authenticated connection
    pub fn send_all(&mut self, message: &Message) {
        for id in self.authenticated_ids() {
            self.send_to(id, message.clone());
        }
    }

    pub fn send_all_except(&mut self, message: &Message, excluded: ConnId) {
        for id in self.authenticated_ids() {
            if id != excluded {
                self.send_to(id, message.clone());
            }
        }
    }

    /// Broadcasts a state; the commanding connection sees the current-command flag
    pub fn send_status_message(&mut self, state: u32, text: Option<&str>, commanded: Option<ConnId>) {
        for id in self.authenticated_ids() {
            let state = if Some(id) == commanded {
                state | DEVICE_SC_CURR
            } else {
                state
            };
            self.send_to(
                id,
                Message::Status {
                    state,
                    message: text.map(str::to_string),
                },
            );
        }
    }

    /// Sends `BOP_STATE` to one connection or to all
    pub fn send_bop_message(&mut self, state: u32, bop: u32, target: Option<ConnId>) {
        let message = Message::BopState { state, bop };
        match target {
            Some(id) => self.send_to(id, message),
            None => self.send_all(&message),
        }
    }

    pub fn send_message_all(&mut self, level: MessageLevel, text: &str) {
        self.send_all(&Message::Msg {
            level,
            text: text.to_string(),
        });
    }

    /// Answers a command whose handler returned `Reply::Deferred`
    pub fn send_reply(&mut self, id: ConnId, code: ReplyCode, text: &str) -> Result<()> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        conn.send_reply(code, text)
    }

    /// Sends image channels to a peer, through shared memory when enabled
    pub fn send_binary_data(&mut self, id: ConnId, data_type: i16, channels: Vec<bytes::Bytes>) -> Result<u32> {
        let pool = self.config.shared_memory.then_some(&self.segments);
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        conn.send_binary_data(data_type, channels, pool)
    }

    /// Queues a command on one connection
    pub fn queue_command(&mut self, id: ConnId, command: Command) -> Result<()> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::invalid_state(format!("No connection {}", id)))?;
        conn.queue_command(command);
        self.drive_queues();
        Ok(())
    }

    fn device_ids(&self) -> Vec<ConnId> {
        self.all_ids()
            .into_iter()
            .filter(|&id| {
                self.connections
                    .get(id)
                    .map(|conn| conn.kind() == ConnKind::Outbound && conn.state().is_live())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Queues a copy of `command` on every directory peer
    pub fn que_all(&mut self, command: Command) {
        for id in self.device_ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.queue_command(command.duplicate());
            }
        }
        self.drive_queues();
    }

    /// Queues a copy of `command` on every directory peer of one type
    pub fn que_all_type(&mut self, device_type: DeviceType, command: Command) {
        for id in self.device_ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                if conn.device_type() == device_type {
                    conn.queue_command(command.duplicate());
                }
            }
        }
        self.drive_queues();
    }

    pub fn que_all_centralds(&mut self, text: &str) {
        for id in self.centrals.clone() {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.queue_command(Command::new(text));
            }
        }
        self.drive_queues();
    }

    /// Asks every central authority to forward only messages of `mask`
    pub fn set_message_mask(&mut self, mask: u32) {
        self.que_all_centralds(&format!("message_mask {}", mask));
    }

    /// Sends the head of every command queue whose precondition holds
    fn drive_queues(&mut self) {
        let full_bop = self.full_bop();
        for (_, conn) in self.connections.iter_mut() {
            if let Err(e) = conn.send_next_command(full_bop) {
                tracing::warn!(conn = %conn.name(), error = %e, "cannot send command");
            }
        }
    }

    /// Whether no command is queued or awaiting a reply anywhere
    pub fn command_queue_empty(&self) -> bool {
        self.connections.iter().all(|(_, conn)| conn.commands().is_empty())
    }

    /// Drops every queued command; commands awaiting a reply are kept
    pub fn clear_all(&mut self) {
        for (_, conn) in self.connections.iter_mut() {
            conn.clear_commands();
        }
    }

    pub fn command_originator_pending(&self, originator: ConnId, exclude: Option<ConnId>) -> bool {
        self.connections
            .iter()
            .filter(|&(id, _)| Some(id) != exclude)
            .any(|(_, conn)| conn.commands().originator_pending(originator))
    }

    /// Names of failing remote values, per connection name
    pub fn failed_values(&self) -> Vec<(String, Vec<String>)> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| {
                let failed = conn.values().failed();
                (!failed.is_empty()).then(|| (conn.name().to_string(), failed))
            })
            .collect()
    }

    pub fn all_centrald_running(&self) -> bool {
        !self.centrals.is_empty()
            && self.centrals.iter().all(|&id| {
                self.connections
                    .get(id)
                    .map(|conn| conn.state().is_authenticated())
                    .unwrap_or(false)
            })
    }

    pub fn some_centrald_running(&self) -> bool {
        self.centrals.iter().any(|&id| {
            self.connections
                .get(id)
                .map(|conn| conn.state().is_authenticated())
                .unwrap_or(false)
        })
    }

    pub fn is_good_weather(&self) -> bool {
        self.all_centrald_running() && self.master_state & WEATHER_MASK != BAD_WEATHER
    }

    /// Whether the mount may move under the current master state
    pub fn can_move(&self) -> bool {
        let status = self.master_state & SERVERD_STATUS_MASK;
        self.is_good_weather()
            && self.master_state & SERVERD_STANDBY_MASK == SERVERD_ON
            && status != SERVERD_SOFT_OFF
            && status != SERVERD_HARD_OFF
    }

    /// Whether an authenticated central connection reports any bit of `mask`
    pub fn central_server_in_state(&self, mask: u32) -> bool {
        self.centrals.iter().any(|&id| {
            self.connections
                .get(id)
                .map(|conn| conn.state().is_authenticated() && conn.remote_state() & mask != 0)
                .unwrap_or(false)
        })
    }

    /// Authenticated connection with the smallest non-negative value `name`
    pub fn min_connection(&self, name: &str) -> Option<ConnId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.state().is_authenticated() && !conn.is_central())
            .filter_map(|(id, conn)| {
                conn.remote_value(name)
                    .and_then(|value| value.data().as_i64())
                    .filter(|&v| v >= 0)
                    .map(|v| (v, id))
            })
            .min()
            .map(|(_, id)| id)
    }

    /// Value `name` advertised by the peer named `device`
    pub fn remote_value(&self, device: &str, name: &str) -> Option<&Value> {
        let id = self.find_by_name(device)?;
        self.connections.get(id)?.remote_value(name)
    }

    pub fn bind_child(&mut self, id: ConnId, pid: i32) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.bind_child(pid);
        }
    }

    /// Marks a connection for reaping at the end of the pass
    pub fn mark_for_deletion(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.mark_delete();
        }
    }

    /// Changes the master state, subject to arbitration
    ///
    /// Once a state master is designated, requests from any other source
    /// are applied only when they enter HARD_OFF, BAD_WEATHER or STANDBY,
    /// and never when they would bring a HARD_OFF system to STANDBY.
    /// Returns whether the state was applied.
    pub fn set_master_state<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        from: Option<ConnId>,
        new: u32,
    ) -> bool {
        if let Some(master) = self.state_master {
            if from != Some(master) {
                if new & SERVERD_STATUS_MASK != SERVERD_HARD_OFF
                    && new & WEATHER_MASK != BAD_WEATHER
                    && new & SERVERD_STANDBY_MASK != SERVERD_STANDBY
                {
                    if (new & !BOP_MASK) != (self.master_state & !BOP_MASK) {
                        tracing::debug!(
                            from = ?from,
                            state = new,
                            "ignoring state request from non-master"
                        );
                    }
                    return false;
                }
                if self.master_state & SERVERD_STATUS_MASK == SERVERD_HARD_OFF
                    && new & SERVERD_STANDBY_MASK == SERVERD_STANDBY
                {
                    tracing::debug!(from = ?from, state = new, "ignoring standby request while hard off");
                    return false;
                }
            }
        }
        self.master_state = new;
        self.refresh_state(host);
        true
    }

    /// Recomputes the composite state and notifies the host of changed parts
    pub fn refresh_state<H: Host + ?Sized>(&mut self, host: &mut H) {
        let transition = StateTransition::new(self.published_state, self.full_state());
        self.published_state = transition.new;
        if transition.status_changed() {
            tracing::info!(
                old = transition.old,
                new = transition.new,
                status = crate::core::state::status_name(transition.new),
                "master state changed"
            );
            host.change_master_state(self, transition.old, transition.new);
        }
        if transition.bop_changed() {
            tracing::debug!(bop = transition.new & BOP_MASK, "bop state changed");
            host.bop_state_changed(self, transition.new);
        }
        self.drive_queues();
    }

    /// Schedules an event
    pub fn add_timer(&mut self, delay: Duration, event: Event) -> TimerId {
        self.timers.schedule_in(delay, event)
    }

    /// Discards all pending timers of a kind
    pub fn delete_timers(&mut self, kind: EventKind) -> usize {
        self.timers.delete_timers(kind)
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Delivers an event
    ///
    /// A targeted event goes to the device client of that connection only.
    /// Anything else reaches every connection's client, then the host.
    pub fn post_event<H: Host + ?Sized>(&mut self, host: &mut H, event: Event) {
        match (event.kind, event.target) {
            (EventKind::Reconnect, Some(target)) => {
                self.reconnect(target);
                return;
            }
            (EventKind::KeepAlive, None) => self.keep_alive(),
            _ => {}
        }
        match event.target {
            Some(target) => {
                if let Some(client) = self
                    .connections
                    .get_mut(target)
                    .and_then(|conn| conn.client_mut())
                {
                    client.post_event(&event);
                }
            }
            None => {
                for id in self.connection_ids() {
                    if let Some(client) = self.connections.get_mut(id).and_then(|c| c.client_mut()) {
                        client.post_event(&event);
                    }
                }
                host.post_event(self, &event);
            }
        }
    }

    fn keep_alive(&mut self) {
        self.send_all(&Message::Ping);
        if !self.config.keep_alive.is_zero() {
            self.timers
                .schedule_in(self.config.keep_alive, Event::new(EventKind::KeepAlive));
        }
    }

    fn reconnect(&mut self, id: ConnId) {
        let delay = self.config.reconnect_delay;
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.state() != ConnState::Broken {
            return;
        }
        match conn.reconnect() {
            Ok(()) => {
                tracing::info!(conn = %conn.name(), "reconnecting");
                self.start_lookup(id);
            }
            Err(e) => {
                tracing::warn!(conn = %conn.name(), error = %e, "reconnect failed");
                self.timers
                    .schedule_in(delay, Event::targeted(EventKind::Reconnect, id));
            }
        }
    }

    fn connection_failed<H: Host + ?Sized>(&mut self, host: &mut H, id: ConnId, error: Error) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        tracing::warn!(conn = %conn.name(), error = %error, "connection failed");
        let redial = matches!(conn.kind(), ConnKind::Outbound | ConnKind::Central { .. });
        let pending = conn.mark_broken();
        if !redial {
            conn.mark_delete();
        }
        if let Some(command) = pending {
            host.command_returned(self, id, &command, ReplyCode::System);
        }
        if redial {
            self.timers.schedule_in(
                self.config.reconnect_delay,
                Event::targeted(EventKind::Reconnect, id),
            );
        }
        self.refresh_state(host);
    }

    /// Feeds bytes to a connection as if read from its socket
    pub fn feed<H: Host + ?Sized>(&mut self, host: &mut H, id: ConnId, bytes: &[u8]) {
        let result = match self.connections.get_mut(id) {
            Some(conn) => conn.process_input(bytes),
            None => return,
        };
        match result {
            Ok(events) => self.process_events(host, id, events),
            Err(e) => self.connection_failed(host, id, e),
        }
    }

    fn process_events<H: Host + ?Sized>(&mut self, host: &mut H, id: ConnId, events: Vec<ConnEvent>) {
        for event in events {
            if let Err(e) = self.handle_event(host, id, event) {
                self.connection_failed(host, id, e);
                return;
            }
        }
    }

    fn handle_event<H: Host + ?Sized>(&mut self, host: &mut H, id: ConnId, event: ConnEvent) -> Result<()> {
        match event {
            ConnEvent::Connected => {
                let name = self.config.name.clone();
                if let Some(conn) = self.connections.get_mut(id) {
                    tracing::info!(conn = %conn.name(), "connected");
                    let centrald_id = conn.address().map(|a| a.centrald_id).unwrap_or(-1);
                    conn.begin_auth(&name, centrald_id)?;
                }
            }
            ConnEvent::AuthRequest {
                name,
                centrald_id,
                key,
            } => {
                if host.authorize(self, id, &name, key) {
                    let local_name = self.config.name.clone();
                    let local_type = host.device_type(self);
                    if let Some(conn) = self.connections.get_mut(id) {
                        conn.accept_auth(name, centrald_id, &local_name, local_type)?;
                        tracing::info!(conn = %conn.name(), "peer authenticated");
                    }
                    host.connection_ready(self, id);
                } else if let Some(conn) = self.connections.get_mut(id) {
                    tracing::info!(conn = %name, "authorization refused");
                    conn.refuse_auth()?;
                }
            }
            ConnEvent::Authenticated { name, device_type } => {
                tracing::info!(conn = %name, device_type = %device_type, "authenticated");
                self.attach_client(id);
                host.connection_ready(self, id);
                if self.connections.get(id).map(|conn| conn.kind()) == Some(ConnKind::Outbound) {
                    host.device_ready(self, id);
                }
                self.drive_queues();
            }
            ConnEvent::MasterState { state, bop } => {
                let new = match bop {
                    Some(bop) => mask_bits(state, BOP_MASK, bop),
                    None => mask_bits(state, BOP_MASK, self.master_state),
                };
                self.set_master_state(host, Some(id), new);
            }
            ConnEvent::PeerState { old, new } => {
                host.device_state_changed(self, id, old, new);
                self.refresh_state(host);
            }
            ConnEvent::Address(address) => {
                self.add_address(host, address);
            }
            ConnEvent::AddressWithdrawn { centrald_num, name } => {
                self.delete_address(centrald_num, &name);
            }
            ConnEvent::Command { verb, line } => {
                let result = Params::parse(&line).and_then(|mut params| {
                    params.next_str()?;
                    host.command(self, id, &verb, &mut params)
                });
                self.finish_command(id, &verb, result)?;
            }
            ConnEvent::SetValue { name, op, payload } => {
                let mut params = Params::from_tokens(payload);
                let result = host.set_value(self, id, &name, op, &mut params);
                self.finish_command(id, "SET", result)?;
            }
            ConnEvent::CommandReturned { command, code, text } => {
                if !code.is_ok() {
                    tracing::debug!(%id, command = %command.text, %code, text, "command failed");
                }
                host.command_returned(self, id, &command, code);
                self.drive_queues();
                let idle = self
                    .connections
                    .get(id)
                    .map(|conn| conn.commands().is_empty())
                    .unwrap_or(false);
                if idle {
                    host.device_idle(self, id);
                }
            }
            ConnEvent::ValueChanged { name } => host.value_changed(self, id, &name),
            ConnEvent::ValueError { name } => {
                tracing::warn!(%id, value = %name, "remote value failed");
                host.value_error(self, id, &name);
            }
            ConnEvent::BinaryData(data) => host.binary_data(self, id, data),
            ConnEvent::MetaRequest => host.meta_requested(self, id),
            ConnEvent::Log { level, text } => host.message(self, id, level, &text),
        }
        Ok(())
    }

    fn finish_command(&mut self, id: ConnId, verb: &str, result: Result<Reply>) -> Result<()> {
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(());
        };
        match result {
            Ok(Reply::Ok) => conn.send_reply(ReplyCode::Ok, "OK"),
            Ok(Reply::OkWith(text)) => conn.send_reply(ReplyCode::Ok, &text),
            Ok(Reply::Deferred) => Ok(()),
            Err(e) => {
                tracing::debug!(conn = %conn.name(), command = verb, error = %e, "command refused");
                conn.send_reply(e.reply_code(), &e.to_string())
            }
        }
    }

    /// Requests the run loop to stop after the current pass
    pub fn end_run_loop(&mut self) {
        self.end_loop = true;
    }

    /// Runs passes until `end_run_loop`
    pub async fn run<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        self.end_loop = false;
        while !self.end_loop {
            self.one_run_loop(host).await?;
        }
        Ok(())
    }

    /// One reactor pass
    ///
    /// Fails only when the listener itself is unusable; peer errors are
    /// handled per connection.
    pub async fn one_run_loop<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<()> {
        let idle = Instant::now() + self.config.idle_timeout;
        let deadline = self.timers.next_deadline().map_or(idle, |at| at.min(idle));

        match self.wait(deadline).await {
            Wake::Io => {
                self.accept_pending()?;
                self.dispatch(host);
            }
            Wake::Accepted(result) => {
                match result {
                    Ok((stream, addr)) => self.stage_inbound(stream, addr),
                    Err(e) => self.accept_failed(e)?,
                }
                self.accept_pending()?;
                self.dispatch(host);
            }
            Wake::Resolved(id, result) => self.lookup_done(host, id, result),
            Wake::Timeout => {}
        }
        self.idle(host);
        Ok(())
    }

    fn accept_failed(&self, e: io::Error) -> Result<()> {
        if is_transient_accept_error(&e) {
            tracing::warn!(error = %e, "accept failed");
            return Ok(());
        }
        tracing::error!(error = %e, "listener failed");
        Err(Error::reactor(format!("Accept failed: {}", e)))
    }

    async fn wait(&mut self, deadline: Instant) -> Wake {
        let mut readiness = Vec::new();
        for id in self.connection_ids() {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            if !conn.state().is_live() {
                continue;
            }
            if let Some(stream) = conn.stream() {
                readiness.push(Box::pin(stream.ready(conn.interest())));
            }
        }

        let io = async {
            if readiness.is_empty() {
                pending::<()>().await;
            } else {
                let _ = select_all(readiness).await;
            }
        };
        let listener = &self.listener;
        let accept = async {
            match listener {
                Some(listener) => listener.accept().await,
                None => pending().await,
            }
        };
        let lookups = &mut self.lookups;

        tokio::select! {
            _ = io => Wake::Io,
            result = accept => Wake::Accepted(result),
            (id, result) = lookups.next() => Wake::Resolved(id, result),
            _ = sleep_until(deadline) => Wake::Timeout,
        }
    }

    /// Accepts every connection already waiting on the listener
    fn accept_pending(&mut self) -> Result<()> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            let polled = match &self.listener {
                Some(listener) => listener.poll_accept(&mut cx),
                None => return Ok(()),
            };
            match polled {
                Poll::Ready(Ok((stream, addr))) => self.stage_inbound(stream, addr),
                Poll::Ready(Err(e)) => return self.accept_failed(e),
                Poll::Pending => return Ok(()),
            }
        }
    }

    fn stage_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "cannot set TCP_NODELAY");
        }
        tracing::info!(%addr, "accepted connection");
        self.add_connection(Connection::inbound(stream));
    }

    /// Hands readiness to every connection live when the wait started
    fn dispatch<H: Host + ?Sized>(&mut self, host: &mut H) {
        for id in self.connection_ids() {
            let result = match self.connections.get_mut(id) {
                Some(conn) if conn.state().is_live() && conn.has_stream() => conn.handle_io(),
                _ => continue,
            };
            match result {
                Ok(events) => self.process_events(host, id, events),
                Err(e) => self.connection_failed(host, id, e),
            }
        }
    }

    fn idle<H: Host + ?Sized>(&mut self, host: &mut H) {
        self.reap_children(host);
        self.splice_staged();

        let now = Instant::now();
        while let Some(event) = self.timers.pop_due(now) {
            self.post_event(host, event);
        }

        self.flush_all(host);
        self.reap_deleted(host);
    }

    fn reap_children<H: Host + ?Sized>(&mut self, host: &mut H) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        self.child_ended(host, pid.as_raw());
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "waitpid failed");
                    return;
                }
            }
        }
    }

    fn child_ended<H: Host + ?Sized>(&mut self, host: &mut H, pid: i32) {
        tracing::debug!(pid, "child exited");
        for (_, conn) in self.connections.iter_mut() {
            if conn.child_pid() == Some(pid) {
                conn.mark_delete();
            }
        }
        host.child_returned(self, pid);
    }

    fn splice_staged(&mut self) {
        for (id, central) in std::mem::take(&mut self.staged) {
            if central {
                self.centrals.push(id);
            } else {
                self.live.push(id);
            }
        }
    }

    fn flush_all<H: Host + ?Sized>(&mut self, host: &mut H) {
        for id in self.connection_ids() {
            let result = match self.connections.get_mut(id) {
                Some(conn) if conn.has_stream() && !conn.pending_output().is_empty() => conn.flush(),
                _ => continue,
            };
            if let Err(e) = result {
                self.connection_failed(host, id, e);
            }
        }
    }

    fn reap_deleted<H: Host + ?Sized>(&mut self, host: &mut H) {
        let doomed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state() == ConnState::Delete)
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            if self.delete_connection(id) == DeleteStatus::Deletable {
                if let Some(conn) = self.remove_connection(id) {
                    tracing::info!(conn = %conn.name(), "connection removed");
                }
                host.connection_removed(self, id);
                self.refresh_state(host);
            }
        }
    }

    /// Current value of a remote value as a typed payload
    pub fn remote_data(&self, device: &str, name: &str) -> Option<ValueData> {
        self.remote_value(device, name).map(|value| value.data().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{BOP_EXPOSURE, SERVERD_NIGHT};
    use crate::time::EventPayload;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        connect: bool,
        ready: Vec<ConnId>,
        idle: Vec<ConnId>,
        children: Vec<i32>,
    }

    impl Host for Recorder {
        fn will_connect(&mut self, _address: &Address) -> bool {
            self.connect
        }

        fn change_master_state(&mut self, block: &mut Block, _old: u32, new: u32) {
            // the block state is already updated when this runs
            assert_eq!(block.full_state(), new);
            self.log.push(format!("status {}", new & !BOP_MASK));
        }

        fn bop_state_changed(&mut self, _block: &mut Block, state: u32) {
            self.log.push(format!("bop {:#x}", state & BOP_MASK));
        }

        fn post_event(&mut self, _block: &mut Block, event: &Event) {
            self.log.push(format!("event {:?}", event.payload));
        }

        fn device_ready(&mut self, _block: &mut Block, conn: ConnId) {
            self.ready.push(conn);
        }

        fn device_idle(&mut self, _block: &mut Block, conn: ConnId) {
            self.idle.push(conn);
        }

        fn child_returned(&mut self, _block: &mut Block, pid: i32) {
            self.children.push(pid);
        }
    }

    fn output(block: &mut Block, id: ConnId) -> String {
        let output = block.connection_mut(id).unwrap().take_output();
        String::from_utf8_lossy(&output).into_owned()
    }

    fn config(name: &str) -> Config {
        let mut config = Config::new(name);
        config.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.idle_timeout = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_idle_pass_changes_nothing() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let id = block.add_connection(Connection::detached("C0"));
        block.one_run_loop(&mut host).await.unwrap();
        assert_eq!(block.connection_ids(), vec![id]);

        let before = format!("{:?}", block.connection(id).unwrap());
        block.one_run_loop(&mut host).await.unwrap();
        let conn = block.connection(id).unwrap();
        assert_eq!(format!("{:?}", conn), before);
        assert_eq!(conn.dispatched(), 0);
        assert!(conn.pending_output().is_empty());
        assert_eq!(block.full_state(), 0);
        assert!(host.log.is_empty());
    }

    #[tokio::test]
    async fn test_staged_connections_skip_current_pass() {
        let mut host = Recorder::default();
        let mut block = Block::bind(config("B")).await.unwrap();
        let addr = block.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"PING\n").await.unwrap();
            clients.push(client);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        // accepted in this pass, spliced only after dispatch
        block.one_run_loop(&mut host).await.unwrap();
        let staged = block.connection_ids();
        assert_eq!(staged.len(), 3);
        for &id in &staged {
            assert_eq!(block.connection(id).unwrap().dispatched(), 0);
        }

        block.one_run_loop(&mut host).await.unwrap();
        for &id in &staged {
            assert_eq!(block.connection(id).unwrap().dispatched(), 1);
        }

        for client in &mut clients {
            let mut buf = [0u8; 5];
            loop {
                block.one_run_loop(&mut host).await.unwrap();
                if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(10), client.read(&mut buf)).await {
                    assert_eq!(&buf[..n], b"PONG\n");
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_state_split_notifications() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));

        assert!(block.set_master_state(&mut host, None, BOP_EXPOSURE));
        assert_eq!(host.log, vec!["bop 0x1000000"]);

        host.log.clear();
        assert!(block.set_master_state(&mut host, None, SERVERD_NIGHT));
        assert_eq!(host.log, vec!["status 3", "bop 0x0"]);

        host.log.clear();
        assert!(block.set_master_state(&mut host, None, SERVERD_NIGHT));
        assert!(host.log.is_empty());
    }

    #[tokio::test]
    async fn test_master_arbitration() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let master = block.add_centrald_connection(Connection::detached_central(0), true);
        let other = block.add_centrald_connection(Connection::detached_central(1), true);
        block.set_state_master(Some(master));

        block.feed(&mut host, master, b"STATUS 15\n");
        assert_eq!(block.master_state(), SERVERD_HARD_OFF);
        host.log.clear();

        // leaving HARD_OFF is reserved to the master
        block.feed(&mut host, other, b"STATUS 3\n");
        block.feed(&mut host, other, b"STATUS 19\n");
        assert_eq!(block.master_state(), SERVERD_HARD_OFF);
        assert!(host.log.is_empty());

        block.feed(&mut host, master, b"STATUS 3\n");
        assert_eq!(block.master_state(), SERVERD_NIGHT);
        assert_eq!(host.log, vec!["status 3"]);

        // any peer may signal bad weather
        block.feed(&mut host, other, b"STATUS 2147483651\n");
        assert_eq!(block.master_state(), SERVERD_NIGHT | BAD_WEATHER);
        assert!(!block.is_good_weather());
    }

    #[tokio::test]
    async fn test_commands_wait_for_bop() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let camera = block.add_connection(Connection::detached("C0"));

        block
            .queue_command(camera, Command::with_bop("expose", BOP_EXPOSURE))
            .unwrap();
        assert_eq!(
            block.connection_mut(camera).unwrap().take_output(),
            bytes::Bytes::from_static(b"expose\n")
        );

        block.feed(&mut host, camera, b"BOP_STATE 0 16777216\n+000 OK\n");
        assert_eq!(block.full_bop(), BOP_EXPOSURE);
        block
            .queue_command(camera, Command::with_bop("expose", BOP_EXPOSURE))
            .unwrap();
        assert!(block.connection(camera).unwrap().pending_output().is_empty());
        assert!(!block.command_queue_empty());

        block.feed(&mut host, camera, b"BOP_STATE 0 0\n");
        assert_eq!(
            block.connection_mut(camera).unwrap().take_output(),
            bytes::Bytes::from_static(b"expose\n")
        );
        assert_eq!(host.log, vec!["bop 0x1000000", "bop 0x0"]);
    }

    #[tokio::test]
    async fn test_timers_fire_in_order() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        for n in 0..3 {
            block.add_timer(
                Duration::ZERO,
                Event::new(EventKind::Custom(1)).with_payload(EventPayload::Integer(n)),
            );
        }
        block.add_timer(Duration::from_secs(3600), Event::new(EventKind::Custom(2)));
        block.add_timer(Duration::from_secs(3600), Event::new(EventKind::ExposureEnd));
        assert_eq!(block.delete_timers(EventKind::ExposureEnd), 1);

        block.one_run_loop(&mut host).await.unwrap();
        assert_eq!(
            host.log,
            vec!["event Integer(0)", "event Integer(1)", "event Integer(2)"]
        );
        assert_eq!(block.timers().len(), 1);
    }

    #[tokio::test]
    async fn test_two_phase_delete() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let origin = block.add_connection(Connection::detached("B2"));
        let target = block.add_connection(Connection::detached("C0"));
        block
            .queue_command(target, Command::new("expose").originated_by(origin))
            .unwrap();
        assert!(block.command_originator_pending(origin, None));

        assert_eq!(block.delete_connection(origin), DeleteStatus::Retry);
        block.mark_for_deletion(origin);
        assert_eq!(block.delete_connection(origin), DeleteStatus::Deletable);
        assert!(!block.command_originator_pending(origin, None));

        block.one_run_loop(&mut host).await.unwrap();
        assert!(block.connection(origin).is_none());
        assert!(block.remove_connection(origin).is_none());
        assert_eq!(block.connection_ids(), vec![target]);
    }

    #[tokio::test]
    async fn test_directory_lookups() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        assert!(block.get_or_open_connection(&mut host, "C0").is_err());

        let mut address = Address::new("C0", "127.0.0.1", 1, DeviceType::Ccd);
        address.centrald_num = 2;
        assert_eq!(block.add_address(&mut host, address), DirectoryUpdate::Added);
        assert!(block.find_address_in(2, "C0").is_some());
        assert!(block.find_address_in(1, "C0").is_none());
        // not allowed to connect
        assert!(matches!(
            block.get_or_open_connection(&mut host, "C0"),
            Err(Error::Authorization(_))
        ));
        assert!(block.find_by_name("C0").is_none());

        let existing = block.add_connection(Connection::detached("T0"));
        assert_eq!(block.get_or_open_connection(&mut host, "T0").unwrap(), existing);

        assert!(block.delete_address(2, "C0").is_some());
        assert!(block.find_address("C0").is_none());
    }

    #[tokio::test]
    async fn test_min_connection_and_failed_values() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let a = block.add_connection(Connection::detached("P0"));
        let b = block.add_connection(Connection::detached("P1"));
        block.feed(&mut host, a, b"VALUE queue i 4\n");
        block.feed(&mut host, b, b"VALUE queue i 2\nMETA temp d 33554432 \"temperature\"\n");

        assert_eq!(block.min_connection("queue"), Some(b));
        assert_eq!(
            block.remote_data("P0", "queue"),
            Some(ValueData::Integer(4))
        );
        assert_eq!(
            block.failed_values(),
            vec![("P1".to_string(), vec!["temp".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_status_message_flags_commanded_connection() {
        let mut block = Block::new(config("B"));
        let a = block.add_connection(Connection::detached("P0"));
        let b = block.add_connection(Connection::detached("P1"));
        block.send_status_message(2, None, Some(b));

        let out_a = block.connection_mut(a).unwrap().take_output();
        let out_b = block.connection_mut(b).unwrap().take_output();
        assert_eq!(out_a, bytes::Bytes::from_static(b"STATUS 2\n"));
        assert_eq!(out_b, format!("STATUS {}\n", 2 | DEVICE_SC_CURR).into_bytes());
        assert_eq!(block.connection(a).unwrap().state(), ConnState::AuthOk);
    }

    #[tokio::test]
    async fn test_broadcast_helpers() {
        let mut block = Block::new(config("B"));
        let a = block.add_connection(Connection::detached("P0"));
        let b = block.add_connection(Connection::detached("P1"));
        let central = block.add_centrald_connection(Connection::detached_central(0), true);

        block.send_all_except(&Message::Ping, b);
        assert_eq!(output(&mut block, a), "PING\n");
        assert_eq!(output(&mut block, b), "");
        assert_eq!(output(&mut block, central), "PING\n");

        block.set_message_mask(7);
        assert_eq!(output(&mut block, central), "message_mask 7\n");
        assert_eq!(output(&mut block, a), "");
        block.que_all_centralds("ready");
        // still waiting for the reply to message_mask
        assert_eq!(output(&mut block, central), "");
        let commands = block.connection(central).unwrap().commands();
        assert_eq!(commands.executing().map(|c| c.text.as_str()), Some("message_mask 7"));
        assert_eq!(commands.queued(), 1);
    }

    #[tokio::test]
    async fn test_que_all_type_and_clear_all() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let camera = block.add_connection(Connection::detached_device("C0", DeviceType::Ccd));
        let mount = block.add_connection(Connection::detached_device("T0", DeviceType::Mount));
        let watcher = block.add_connection(Connection::detached("EXEC"));

        assert_eq!(block.find_by_type(DeviceType::Mount), Some(mount));
        assert_eq!(block.find_by_type(DeviceType::Dome), None);

        block.que_all_type(DeviceType::Ccd, Command::new("expose"));
        assert_eq!(output(&mut block, camera), "expose\n");
        assert_eq!(output(&mut block, mount), "");

        block.que_all(Command::new("stop"));
        assert_eq!(output(&mut block, mount), "stop\n");
        assert_eq!(output(&mut block, watcher), "");
        // queued behind the exposure
        assert_eq!(output(&mut block, camera), "");

        block.clear_all();
        assert!(!block.command_queue_empty());
        block.feed(&mut host, camera, b"+000 OK\n");
        block.feed(&mut host, mount, b"+000 OK\n");
        assert!(block.command_queue_empty());
        assert_eq!(output(&mut block, camera), "");
        assert_eq!(host.idle, vec![camera, mount]);
    }

    #[tokio::test]
    async fn test_keep_alive_pings_and_rearms() {
        let mut host = Recorder::default();
        let mut cfg = config("B");
        cfg.keep_alive = Duration::from_secs(60);
        let mut block = Block::new(cfg);
        let a = block.add_connection(Connection::detached("P0"));
        let central = block.add_centrald_connection(Connection::detached_central(0), true);

        block.post_event(&mut host, Event::new(EventKind::KeepAlive));
        assert_eq!(output(&mut block, a), "PING\n");
        assert_eq!(output(&mut block, central), "PING\n");
        assert_eq!(block.timers().len(), 1);

        block.feed(&mut host, a, b"PONG\n");
        assert_eq!(block.connection(a).unwrap().state(), ConnState::AuthOk);
    }

    #[tokio::test]
    async fn test_centrald_id_at_num() {
        let mut block = Block::new(config("B"));
        let mut central = Connection::detached_central(1);
        central.set_centrald_id(12);
        block.add_centrald_connection(central, false);
        block.add_centrald_connection(Connection::detached_central(0), true);

        assert_eq!(block.centrald_id_at_num(1), Some(12));
        assert_eq!(block.centrald_id_at_num(0), Some(-1));
        assert_eq!(block.centrald_id_at_num(5), None);
    }

    #[tokio::test]
    async fn test_broken_peer_is_redialled() {
        let mut host = Recorder::default();
        let mut cfg = config("B");
        cfg.reconnect_delay = Duration::from_millis(20);
        let mut block = Block::new(cfg);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address = Address::new("C0", "127.0.0.1", port, DeviceType::Ccd);
        let id = block.add_connection(Connection::connect(address).unwrap());
        for _ in 0..50 {
            block.one_run_loop(&mut host).await.unwrap();
            if block.connection(id).unwrap().state() == ConnState::Broken {
                break;
            }
        }
        assert_eq!(block.connection(id).unwrap().state(), ConnState::Broken);
        assert_eq!(block.timers().len(), 1);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            block.one_run_loop(&mut host).await.unwrap();
            if let Ok(Ok((stream, _))) =
                tokio::time::timeout(Duration::from_millis(5), listener.accept()).await
            {
                accepted = Some(stream);
                break;
            }
        }
        let mut peer = accepted.expect("peer was not redialled");
        let mut buf = [0u8; 64];
        loop {
            block.one_run_loop(&mut host).await.unwrap();
            if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(10), peer.read(&mut buf)).await {
                assert!(String::from_utf8_lossy(&buf[..n]).starts_with("AUTH B "));
                break;
            }
        }
        assert_eq!(block.connection(id).unwrap().state(), ConnState::AuthPending);
    }

    #[tokio::test]
    async fn test_host_name_dialled_after_lookup() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));

        let resolved = Address::new("C0", "localhost", 0, DeviceType::Ccd)
            .resolve()
            .await
            .unwrap();
        let listener = tokio::net::TcpListener::bind((resolved.ip(), 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let address = Address::new("C0", "localhost", port, DeviceType::Ccd);
        let id = block.add_connection(Connection::connect(address).unwrap());
        let conn = block.connection(id).unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);
        assert!(!conn.has_stream());
        assert_eq!(block.lookups.len(), 1);

        let mut accepted = None;
        for _ in 0..100 {
            block.one_run_loop(&mut host).await.unwrap();
            if let Ok(Ok((stream, _))) =
                tokio::time::timeout(Duration::from_millis(5), listener.accept()).await
            {
                accepted = Some(stream);
                break;
            }
        }
        let mut peer = accepted.expect("host name was not dialled");
        assert!(block.lookups.is_empty());

        let mut buf = [0u8; 64];
        loop {
            block.one_run_loop(&mut host).await.unwrap();
            if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(10), peer.read(&mut buf)).await {
                assert!(String::from_utf8_lossy(&buf[..n]).starts_with("AUTH B "));
                break;
            }
        }
        peer.write_all(format!("AUTH_OK C0 {}\n", DeviceType::Ccd.index()).as_bytes())
            .await
            .unwrap();
        for _ in 0..100 {
            block.one_run_loop(&mut host).await.unwrap();
            if !host.ready.is_empty() {
                break;
            }
        }
        assert_eq!(host.ready, vec![id]);
        assert_eq!(block.connection(id).unwrap().state(), ConnState::AuthOk);
    }

    #[tokio::test]
    async fn test_unresolvable_host_breaks_connection() {
        let mut host = Recorder::default();
        let mut cfg = config("B");
        cfg.reconnect_delay = Duration::from_secs(3600);
        let mut block = Block::new(cfg);

        let address = Address::new("C0", "no-such-host.invalid", 6170, DeviceType::Ccd);
        let id = block.add_connection(Connection::connect(address).unwrap());
        for _ in 0..500 {
            block.one_run_loop(&mut host).await.unwrap();
            if block.lookups.is_empty() {
                break;
            }
        }
        assert_eq!(block.connection(id).unwrap().state(), ConnState::Broken);
        assert_eq!(block.timers().len(), 1);
    }

    #[tokio::test]
    async fn test_only_transient_accept_errors_are_survived() {
        let block = Block::new(config("B"));
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)));
            assert!(block.accept_failed(io::Error::from(kind)).is_ok());
        }
        for errno in [libc::EBADF, libc::EINVAL, libc::EMFILE] {
            let e = io::Error::from_raw_os_error(errno);
            assert!(!is_transient_accept_error(&e));
            assert!(matches!(block.accept_failed(e), Err(Error::Reactor(_))));
        }
    }

    #[tokio::test]
    async fn test_child_exit_deletes_bound_connection() {
        let mut host = Recorder::default();
        let mut block = Block::new(config("B"));
        let bound = block.add_connection(Connection::detached("script"));
        let other = block.add_connection(Connection::detached("P0"));

        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        block.bind_child(bound, pid);

        for _ in 0..200 {
            block.one_run_loop(&mut host).await.unwrap();
            if !host.children.is_empty() {
                break;
            }
        }
        assert_eq!(host.children, vec![pid]);
        assert!(block.connection(bound).is_none());
        assert!(block.connection(other).is_some());
    }
}
