use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::state::{mask_bits, BOP_MASK};
use crate::core::{CentraldConfig, DeviceType, Error, Result, READ_CHUNK};
use crate::protocol::message::is_request_verb;
use crate::protocol::{
    Command, CommandQueue, ConnState, Frame, Message, MessageLevel, ProtocolCodec, ReplyCode,
    SetOp,
};
use crate::value::{Value, ValueTable};

use super::client::DeviceClient;
use super::data::{BinaryData, IncomingData, SegmentPool, SharedSegment, CHUNK_SIZE};
use super::directory::Address;

/// How a connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Dialled by this process
    Outbound,
    /// Accepted on the listener
    Inbound,
    /// Central authority with its configured number
    Central { num: i32 },
    /// Socketless; output is kept in memory
    Detached,
}

/// Something the owning `Block` must act on
#[derive(Debug)]
pub enum ConnEvent {
    /// Outbound transport established
    Connected,
    /// Inbound peer asks to authenticate
    AuthRequest {
        name: String,
        centrald_id: i32,
        key: u32,
    },
    /// Outbound handshake accepted by the peer
    Authenticated { name: String, device_type: DeviceType },
    /// Master state request from a central authority
    MasterState { state: u32, bop: Option<u32> },
    /// Remote device state changed
    PeerState { old: u32, new: u32 },
    Address(Address),
    AddressWithdrawn { centrald_num: i32, name: String },
    Command { verb: String, line: String },
    SetValue {
        name: String,
        op: SetOp,
        payload: Vec<String>,
    },
    CommandReturned {
        command: Command,
        code: ReplyCode,
        text: String,
    },
    ValueChanged { name: String },
    /// A remote value entered an error state
    ValueError { name: String },
    BinaryData(BinaryData),
    MetaRequest,
    Log { level: MessageLevel, text: String },
}

/// Protocol state of one peer
pub struct Connection {
    name: String,
    kind: ConnKind,
    state: ConnState,
    stream: Option<TcpStream>,
    /// Where to dial, for outbound and central connections
    address: Option<Address>,
    device_type: DeviceType,
    centrald_id: i32,
    codec: ProtocolCodec,
    input: BytesMut,
    output: BytesMut,
    commands: CommandQueue,
    /// Values advertised by the peer
    values: ValueTable,
    /// Metadata version of each local value sent to this peer
    meta_sent: HashMap<String, u32>,
    remote_state: u32,
    child_pid: Option<i32>,
    incoming: HashMap<u32, IncomingData>,
    /// Shared segments waiting for `SHARED_RELEASE`
    outgoing: HashMap<u32, Vec<SharedSegment>>,
    next_data_id: u32,
    shm_disabled: bool,
    client: Option<Box<dyn DeviceClient>>,
    dispatched: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("device_type", &self.device_type)
            .field("remote_state", &self.remote_state)
            .field("commands", &self.commands)
            .finish()
    }
}

fn dial(addr: SocketAddr) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            return Err(Error::network(format!("Connect to {} failed: {}", addr, e)));
        }
    }
    Ok(TcpStream::from_std(socket.into())?)
}

impl Connection {
    fn new(name: String, kind: ConnKind, state: ConnState) -> Self {
        Connection {
            name,
            kind,
            state,
            stream: None,
            address: None,
            device_type: DeviceType::Unknown,
            centrald_id: -1,
            codec: ProtocolCodec::new(),
            input: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::new(),
            commands: CommandQueue::new(),
            values: ValueTable::new(),
            meta_sent: HashMap::new(),
            remote_state: 0,
            child_pid: None,
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            next_data_id: 1,
            shm_disabled: false,
            client: None,
            dispatched: 0,
        }
    }

    /// Starts a non-blocking connect to a directory entry
    pub fn connect(address: Address) -> Result<Self> {
        let mut conn = Connection::new(
            address.name.clone(),
            ConnKind::Outbound,
            ConnState::Connecting,
        );
        conn.device_type = address.device_type;
        conn.start_dial(address)?;
        Ok(conn)
    }

    /// Starts a non-blocking connect to a central authority
    pub fn central(config: &CentraldConfig) -> Result<Self> {
        let address = Address {
            centrald_num: config.num,
            ..Address::new(
                format!("centrald{}", config.num),
                config.host.clone(),
                config.port,
                DeviceType::Serverd,
            )
        };
        let mut conn = Connection::new(
            address.name.clone(),
            ConnKind::Central { num: config.num },
            ConnState::Connecting,
        );
        conn.device_type = DeviceType::Serverd;
        conn.start_dial(address)?;
        Ok(conn)
    }

    /// Dials a literal address at once; host names wait for a lookup
    fn start_dial(&mut self, address: Address) -> Result<()> {
        if let Some(addr) = address.literal_addr() {
            self.stream = Some(dial(addr)?);
        }
        self.address = Some(address);
        Ok(())
    }

    /// Whether the connection waits for its host name to resolve
    pub(crate) fn awaiting_lookup(&self) -> bool {
        self.state == ConnState::Connecting && self.stream.is_none() && self.address.is_some()
    }

    /// Completes a connect deferred by a host name lookup
    pub(crate) fn resolved(&mut self, addr: SocketAddr) -> Result<()> {
        if !self.awaiting_lookup() {
            return Ok(());
        }
        self.stream = Some(dial(addr)?);
        Ok(())
    }

    /// Wraps a socket accepted on the listener; the name arrives with `AUTH`
    pub fn inbound(stream: TcpStream) -> Self {
        let mut conn = Connection::new(String::new(), ConnKind::Inbound, ConnState::Connected);
        conn.stream = Some(stream);
        conn
    }

    /// Authenticated connection without a socket
    pub fn detached(name: impl Into<String>) -> Self {
        Connection::new(name.into(), ConnKind::Detached, ConnState::AuthOk)
    }

    /// Authenticated dialled peer without a socket
    #[cfg(test)]
    pub(crate) fn detached_device(name: impl Into<String>, device_type: DeviceType) -> Self {
        let mut conn = Connection::new(name.into(), ConnKind::Outbound, ConnState::AuthOk);
        conn.device_type = device_type;
        conn
    }

    /// Authenticated central authority connection without a socket
    pub fn detached_central(num: i32) -> Self {
        let mut conn = Connection::new(
            format!("centrald{}", num),
            ConnKind::Central { num },
            ConnState::AuthOk,
        );
        conn.device_type = DeviceType::Serverd;
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn is_central(&self) -> bool {
        matches!(self.kind, ConnKind::Central { .. })
    }

    /// Number of the central authority, for central connections
    pub fn centrald_num(&self) -> Option<i32> {
        match self.kind {
            ConnKind::Central { num } => Some(num),
            _ => None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn centrald_id(&self) -> i32 {
        self.centrald_id
    }

    /// Records the id a central authority assigned to this process
    pub fn set_centrald_id(&mut self, centrald_id: i32) {
        self.centrald_id = centrald_id;
    }

    /// Last state reported by the peer
    pub fn remote_state(&self) -> u32 {
        self.remote_state
    }

    /// BOP bits this peer contributes to the composite state
    pub fn remote_bop(&self) -> u32 {
        if self.state.is_live() && !self.is_central() {
            self.remote_state & BOP_MASK
        } else {
            0
        }
    }

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn remote_value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn client(&self) -> Option<&dyn DeviceClient> {
        self.client.as_deref()
    }

    pub fn client_mut(&mut self) -> Option<&mut (dyn DeviceClient + 'static)> {
        self.client.as_deref_mut()
    }

    pub(crate) fn set_client(&mut self, client: Box<dyn DeviceClient>) {
        self.client = Some(client);
    }

    pub fn child_pid(&self) -> Option<i32> {
        self.child_pid
    }

    pub fn bind_child(&mut self, pid: i32) {
        self.child_pid = Some(pid);
    }

    /// Number of readiness callbacks this connection has received
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn shm_disabled(&self) -> bool {
        self.shm_disabled
    }

    /// Bytes queued for the peer
    pub fn pending_output(&self) -> &[u8] {
        &self.output
    }

    /// Takes the queued output of a socketless connection
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Readiness to wait for in the reactor
    pub(crate) fn interest(&self) -> Interest {
        if self.state == ConnState::Connecting || !self.output.is_empty() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Whether the peer runs on this host
    pub fn peer_is_local(&self) -> bool {
        match &self.stream {
            Some(stream) => stream
                .peer_addr()
                .map(|addr| addr.ip().is_loopback())
                .unwrap_or(false),
            None => true,
        }
    }

    pub(crate) fn update_address(&mut self, address: Address) {
        self.device_type = address.device_type;
        self.address = Some(address);
    }

    /// Queues a message for the peer
    pub fn send(&mut self, message: Message) -> Result<()> {
        Encoder::<Message>::encode(&mut self.codec, message, &mut self.output)
    }

    pub fn send_reply(&mut self, code: ReplyCode, text: &str) -> Result<()> {
        self.send(Message::reply(code, text))
    }

    pub fn queue_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Drops queued commands; the one awaiting a reply is kept
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub(crate) fn forget(&mut self, conn: super::ConnId) {
        self.commands.forget_originator(conn);
    }

    /// Sends the head of the command queue when allowed
    pub(crate) fn send_next_command(&mut self, full_bop: u32) -> Result<bool> {
        if !self.state.is_authenticated() {
            return Ok(false);
        }
        let line = match self.commands.start_next(full_bop) {
            Some(command) => command.text.clone(),
            None => return Ok(false),
        };
        tracing::trace!(conn = %self.name, command = %line, "sending command");
        Encoder::<Frame>::encode(&mut self.codec, Frame::Line(line), &mut self.output)?;
        Ok(true)
    }

    /// Whether the peer still lacks the current metadata of a value
    pub fn meta_outdated(&self, name: &str, version: u32) -> bool {
        self.meta_sent.get(name) != Some(&version)
    }

    pub fn mark_meta_sent(&mut self, name: &str, version: u32) {
        self.meta_sent.insert(name.to_string(), version);
    }

    pub(crate) fn begin_auth(&mut self, local_name: &str, centrald_id: i32) -> Result<()> {
        self.state.transition(ConnState::AuthPending)?;
        let key = rand::random::<u32>();
        self.send(Message::Auth {
            name: local_name.to_string(),
            centrald_id,
            key,
        })
    }

    pub(crate) fn accept_auth(
        &mut self,
        name: String,
        centrald_id: i32,
        local_name: &str,
        local_type: DeviceType,
    ) -> Result<()> {
        self.name = name;
        self.centrald_id = centrald_id;
        self.state.transition(ConnState::AuthOk)?;
        self.send(Message::AuthOk {
            name: local_name.to_string(),
            device_type: local_type,
        })
    }

    pub(crate) fn refuse_auth(&mut self) -> Result<()> {
        self.send_reply(ReplyCode::Command, "authorization refused")?;
        // the connection is reaped next either way
        if let Err(e) = self.flush() {
            tracing::debug!(conn = %self.name, error = %e, "refusal not delivered");
        }
        self.state.transition(ConnState::Delete)
    }

    /// Tears down the transport; returns the command left without reply
    pub(crate) fn mark_broken(&mut self) -> Option<Command> {
        if self.state.can_transition_to(ConnState::Broken) {
            self.state = ConnState::Broken;
        }
        self.stream = None;
        self.codec = ProtocolCodec::new();
        self.input.clear();
        self.output.clear();
        self.incoming.clear();
        self.outgoing.clear();
        self.meta_sent.clear();
        self.remote_state = 0;
        self.commands.complete()
    }

    /// Marks the connection for reaping
    pub fn mark_delete(&mut self) {
        if self.state == ConnState::Delete {
            return;
        }
        if !self.state.can_transition_to(ConnState::Delete) {
            self.mark_broken();
        }
        self.state = ConnState::Delete;
    }

    /// Dials a broken outbound connection again
    pub(crate) fn reconnect(&mut self) -> Result<()> {
        let address = self
            .address
            .clone()
            .ok_or_else(|| Error::invalid_state("Connection has no address to dial"))?;
        self.state.transition(ConnState::Connecting)?;
        if let Err(e) = self.start_dial(address) {
            self.state = ConnState::Broken;
            return Err(e);
        }
        Ok(())
    }

    /// Handles socket readiness
    pub(crate) fn handle_io(&mut self) -> Result<Vec<ConnEvent>> {
        self.dispatched += 1;
        let mut events = Vec::new();
        if self.state == ConnState::Connecting {
            if !self.check_connected()? {
                return Ok(events);
            }
            events.push(ConnEvent::Connected);
        }
        self.receive(&mut events)?;
        self.flush()?;
        Ok(events)
    }

    fn check_connected(&mut self) -> Result<bool> {
        let Some(stream) = &self.stream else {
            return Ok(false);
        };
        if let Some(err) = stream.take_error()? {
            return Err(Error::network(format!("Connect failed: {}", err)));
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.state.transition(ConnState::Connected)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, events: &mut Vec<ConnEvent>) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        let mut buf = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.input.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.process_buffered(events)?;
        if closed {
            return Err(Error::network("Connection closed by peer"));
        }
        Ok(())
    }

    /// Writes queued output until the socket would block
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.state == ConnState::Connecting {
            return Ok(());
        }
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        while !self.output.is_empty() {
            match stream.try_write(&self.output) {
                Ok(0) => return Err(Error::network("Socket accepted no data")),
                Ok(n) => self.output.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Feeds bytes as if read from the socket
    pub fn process_input(&mut self, bytes: &[u8]) -> Result<Vec<ConnEvent>> {
        self.input.extend_from_slice(bytes);
        let mut events = Vec::new();
        self.process_buffered(&mut events)?;
        Ok(events)
    }

    fn process_buffered(&mut self, events: &mut Vec<ConnEvent>) -> Result<()> {
        while let Some(frame) = self.codec.decode(&mut self.input)? {
            match frame {
                Frame::Line(line) => self.handle_line(&line, events)?,
                Frame::Invalid(line) => self.handle_invalid(&line)?,
                Frame::Chunk { id, channel, data } => {
                    self.handle_chunk(id, channel, &data, events)?
                }
            }
        }
        Ok(())
    }

    fn handle_invalid(&mut self, line: &str) -> Result<()> {
        let verb = line.split_whitespace().next().unwrap_or("");
        if !is_request_verb(verb) {
            tracing::warn!(conn = %self.name, line, "ignoring line that is not UTF-8");
            return Ok(());
        }
        self.send_reply(ReplyCode::Parameter, "Line is not valid UTF-8")
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ConnEvent>) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let message = match Message::parse(line) {
            Ok(message) => message,
            Err(e) => {
                let verb = line.split_whitespace().next().unwrap_or("");
                if !is_request_verb(verb) {
                    tracing::warn!(conn = %self.name, line, error = %e, "ignoring malformed line");
                    return Ok(());
                }
                tracing::debug!(conn = %self.name, line, error = %e, "malformed request");
                return self.send_reply(e.reply_code(), &e.to_string());
            }
        };

        match message {
            Message::Ping => self.send(Message::Pong)?,
            Message::Pong => {}
            Message::Status { state, .. } => self.remote_status(state, None, events),
            Message::BopState { state, bop } => self.remote_status(state, Some(bop), events),
            Message::Value { name, data } => {
                if self.values.apply_remote(&name, data) {
                    if let (Some(client), Some(value)) =
                        (self.client.as_mut(), self.values.get(&name))
                    {
                        client.value_changed(&name, value.data());
                    }
                    events.push(ConnEvent::ValueChanged { name });
                }
            }
            Message::Meta {
                name,
                kind,
                flags,
                description,
            } => {
                let update = self.values.apply_meta(&name, kind, flags, &description);
                if update.entered_error() {
                    events.push(ConnEvent::ValueError { name });
                }
            }
            Message::Selection { name, labels } => self.values.apply_labels(&name, labels),
            Message::Limits { name, min, max } => self.values.apply_limits(&name, min, max),
            Message::Set { name, op, payload } => {
                if !self.state.is_authenticated() {
                    return self.send_reply(ReplyCode::Command, "not authorized");
                }
                events.push(ConnEvent::SetValue { name, op, payload });
            }
            Message::Address(address) => events.push(ConnEvent::Address(address)),
            Message::DeleteAddress { centrald_num, name } => {
                events.push(ConnEvent::AddressWithdrawn { centrald_num, name })
            }
            Message::Auth {
                name,
                centrald_id,
                key,
            } => {
                if self.kind == ConnKind::Inbound && self.state == ConnState::Connected {
                    self.state.transition(ConnState::AuthPending)?;
                    events.push(ConnEvent::AuthRequest {
                        name,
                        centrald_id,
                        key,
                    });
                } else {
                    tracing::warn!(conn = %self.name, state = %self.state, "unexpected AUTH");
                }
            }
            Message::AuthOk { name, device_type } => {
                if self.state == ConnState::AuthPending && self.kind != ConnKind::Inbound {
                    self.state.transition(ConnState::AuthOk)?;
                    self.device_type = device_type;
                    events.push(ConnEvent::Authenticated { name, device_type });
                } else {
                    tracing::warn!(conn = %self.name, state = %self.state, "unexpected AUTH_OK");
                }
            }
            Message::Data {
                id,
                data_type,
                sizes,
            } => {
                let incoming = IncomingData::new(data_type, sizes)?;
                if incoming.is_complete() {
                    events.push(ConnEvent::BinaryData(incoming.finish(id)));
                } else {
                    self.incoming.insert(id, incoming);
                }
            }
            Message::Shared {
                id,
                data_type,
                segments,
            } => self.receive_shared(id, data_type, &segments, events)?,
            Message::SharedRelease { id } => {
                if self.outgoing.remove(&id).is_none() {
                    tracing::warn!(conn = %self.name, id, "release of unknown shared transfer");
                }
            }
            Message::Msg { level, text } => events.push(ConnEvent::Log { level, text }),
            Message::MetaRequest => events.push(ConnEvent::MetaRequest),
            Message::Reply { code, text } => match self.commands.complete() {
                Some(command) => {
                    if let Some(client) = self.client.as_mut() {
                        client.command_returned(&command, code);
                    }
                    events.push(ConnEvent::CommandReturned {
                        command,
                        code,
                        text,
                    });
                }
                None => tracing::warn!(conn = %self.name, %code, "reply without pending command"),
            },
            Message::Command { verb, line } => {
                if !self.state.is_authenticated() {
                    return self.send_reply(ReplyCode::Command, "not authorized");
                }
                events.push(ConnEvent::Command { verb, line });
            }
        }
        Ok(())
    }

    fn remote_status(&mut self, state: u32, bop: Option<u32>, events: &mut Vec<ConnEvent>) {
        if self.is_central() {
            self.remote_state = state;
            events.push(ConnEvent::MasterState { state, bop });
            return;
        }
        let new = match bop {
            Some(bop) => mask_bits(state, BOP_MASK, bop),
            None => state,
        };
        let old = self.remote_state;
        if old == new {
            return;
        }
        self.remote_state = new;
        if let Some(client) = self.client.as_mut() {
            client.state_changed(old, new);
        }
        events.push(ConnEvent::PeerState { old, new });
    }

    fn handle_chunk(
        &mut self,
        id: u32,
        channel: usize,
        data: &[u8],
        events: &mut Vec<ConnEvent>,
    ) -> Result<()> {
        let Some(incoming) = self.incoming.get_mut(&id) else {
            tracing::warn!(conn = %self.name, id, "chunk for unknown transfer");
            return Ok(());
        };
        incoming.append(channel, data)?;
        if incoming.is_complete() {
            if let Some(incoming) = self.incoming.remove(&id) {
                events.push(ConnEvent::BinaryData(incoming.finish(id)));
            }
        }
        Ok(())
    }

    fn receive_shared(
        &mut self,
        id: u32,
        data_type: i16,
        segments: &[(i32, usize)],
        events: &mut Vec<ConnEvent>,
    ) -> Result<()> {
        let channels: Result<Vec<Bytes>> = segments
            .iter()
            .map(|&(shmid, len)| {
                let segment = SharedSegment::attach(shmid, len)?;
                Ok(Bytes::copy_from_slice(segment.as_slice()))
            })
            .collect();
        // the writer keeps the segments until released
        self.send(Message::SharedRelease { id })?;
        match channels {
            Ok(channels) => events.push(ConnEvent::BinaryData(BinaryData {
                id,
                data_type,
                channels,
            })),
            Err(e) => tracing::error!(conn = %self.name, id, error = %e, "cannot read shared data"),
        }
        Ok(())
    }

    /// Sends image channels, through shared memory when possible
    ///
    /// Shared memory is only offered to local peers. A failed allocation is
    /// retried once; after that the connection sends in-band for the rest
    /// of its life.
    pub fn send_binary_data(
        &mut self,
        data_type: i16,
        channels: Vec<Bytes>,
        pool: Option<&SegmentPool>,
    ) -> Result<u32> {
        let id = self.next_data_id;
        self.next_data_id = self.next_data_id.wrapping_add(1);

        if let Some(pool) = pool {
            if !self.shm_disabled && self.peer_is_local() {
                let shared = pool.share(&channels).or_else(|e| {
                    tracing::debug!(conn = %self.name, error = %e, "retrying shared allocation");
                    pool.share(&channels)
                });
                match shared {
                    Ok(segments) => {
                        let announced = segments.iter().map(|s| (s.id(), s.len())).collect();
                        self.send(Message::Shared {
                            id,
                            data_type,
                            segments: announced,
                        })?;
                        self.outgoing.insert(id, segments);
                        return Ok(id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            conn = %self.name,
                            error = %e,
                            "shared memory unavailable, sending data in-band"
                        );
                        self.shm_disabled = true;
                    }
                }
            }
        }

        self.send(Message::Data {
            id,
            data_type,
            sizes: channels.iter().map(Bytes::len).collect(),
        })?;
        for (channel, payload) in channels.into_iter().enumerate() {
            let mut offset = 0;
            while offset < payload.len() {
                let end = (offset + CHUNK_SIZE).min(payload.len());
                Encoder::<Frame>::encode(
                    &mut self.codec,
                    Frame::Chunk {
                        id,
                        channel,
                        data: payload.slice(offset..end),
                    },
                    &mut self.output,
                )?;
                offset = end;
            }
        }
        Ok(id)
    }

    /// Transfers whose shared segments the peer has not released yet
    pub fn pending_shared(&self) -> usize {
        self.outgoing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{BOP_EXPOSURE, SERVERD_NIGHT};
    use crate::protocol::imghdr::{ImageHeader, DATA_USHORT};
    use crate::value::value::VALUE_ERROR;
    use crate::value::ValueData;
    use crate::network::data::channel_payload;

    fn output_lines(conn: &mut Connection) -> Vec<String> {
        let output = conn.take_output();
        String::from_utf8_lossy(&output)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_ping_pong_and_partial_input() {
        let mut conn = Connection::detached("T0");
        assert!(conn.process_input(b"PI").unwrap().is_empty());
        assert!(conn.pending_output().is_empty());
        conn.process_input(b"NG\n").unwrap();
        assert_eq!(output_lines(&mut conn), vec!["PONG"]);
    }

    #[test]
    fn test_peer_state_and_bop() {
        let mut conn = Connection::detached("C0");
        let events = conn.process_input(b"BOP_STATE 3 16777216\n").unwrap();
        assert!(matches!(
            events.as_slice(),
            [ConnEvent::PeerState { old: 0, new }] if *new == SERVERD_NIGHT | BOP_EXPOSURE
        ));
        assert_eq!(conn.remote_bop(), BOP_EXPOSURE);

        // unchanged state produces no event
        let events = conn.process_input(b"STATUS 16777219\n").unwrap();
        assert!(events.is_empty());

        conn.mark_delete();
        assert_eq!(conn.remote_bop(), 0);
    }

    #[test]
    fn test_central_status_is_master_request() {
        let mut conn = Connection::detached_central(0);
        let events = conn.process_input(b"STATUS 3\nBOP_STATE 3 0\n").unwrap();
        assert!(matches!(
            events.as_slice(),
            [
                ConnEvent::MasterState { state: 3, bop: None },
                ConnEvent::MasterState { state: 3, bop: Some(0) }
            ]
        ));
        assert_eq!(conn.remote_bop(), 0);
    }

    #[test]
    fn test_commands_and_replies() {
        let mut conn = Connection::detached("C0");
        conn.queue_command(Command::new("expose 10"));
        conn.queue_command(Command::new("readout"));
        assert!(conn.send_next_command(0).unwrap());
        assert!(!conn.send_next_command(0).unwrap());
        assert_eq!(output_lines(&mut conn), vec!["expose 10"]);

        let events = conn.process_input(b"+000 OK\n").unwrap();
        match events.as_slice() {
            [ConnEvent::CommandReturned { command, code, .. }] => {
                assert_eq!(command.text, "expose 10");
                assert_eq!(*code, ReplyCode::Ok);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(conn.send_next_command(0).unwrap());
        assert!(!conn.commands().is_empty());
    }

    #[test]
    fn test_malformed_command_gets_parameter_error() {
        let mut conn = Connection::detached("B");
        let events = conn.process_input(b"expose \"unterminated\n").unwrap();
        assert!(events.is_empty());
        let lines = output_lines(&mut conn);
        assert!(lines[0].starts_with("-002"), "{:?}", lines);

        // malformed protocol lines are dropped without a reply
        assert!(conn.process_input(b"STATUS abc\n").unwrap().is_empty());
        assert!(conn.pending_output().is_empty());
    }

    #[test]
    fn test_oversized_transfer_fails_connection_only() {
        let mut conn = Connection::detached("C0");
        assert!(conn
            .process_input(b"DATA 1 20 1 18446744073709551615\n")
            .is_err());

        let mut conn = Connection::detached("C0");
        assert!(conn
            .process_input(b"DATA 1 20 2 1073741824 1073741824\n")
            .is_err());

        let mut conn = Connection::detached("C0");
        assert!(conn
            .process_input(b"CHUNK 1 0 18446744073709551615\nxx")
            .is_err());
    }

    #[test]
    fn test_invalid_utf8_request_gets_parameter_error() {
        let mut conn = Connection::detached("B");
        assert!(conn.process_input(b"SET g\xffin = 1\n").unwrap().is_empty());
        let lines = output_lines(&mut conn);
        assert!(lines[0].starts_with("-002"), "{:?}", lines);

        // notifications are dropped, the connection keeps working
        assert!(conn.process_input(b"VALUE \xff i 1\n").unwrap().is_empty());
        assert!(conn.pending_output().is_empty());
        conn.process_input(b"PING\n").unwrap();
        assert_eq!(output_lines(&mut conn), vec!["PONG"]);
    }

    #[test]
    fn test_malformed_set_gets_parameter_error() {
        let mut conn = Connection::detached("B");
        for line in [&b"SET gain *= 3\n"[..], b"SET gain\n", b"SET\n"] {
            let events = conn.process_input(line).unwrap();
            assert!(events.is_empty());
            let lines = output_lines(&mut conn);
            assert_eq!(lines.len(), 1);
            assert!(lines[0].starts_with("-002"), "{:?}", lines);
        }
        assert_eq!(conn.state(), ConnState::AuthOk);
    }

    #[test]
    fn test_unauthenticated_command_refused() {
        let mut conn = Connection::detached("B");
        conn.state = ConnState::AuthPending;
        let events = conn.process_input(b"expose 1\n").unwrap();
        assert!(events.is_empty());
        assert!(output_lines(&mut conn)[0].starts_with("-001"));
    }

    #[tokio::test]
    async fn test_refused_peer_reads_reply() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::inbound(stream);
        conn.state = ConnState::AuthPending;
        conn.stream().unwrap().writable().await.unwrap();

        tokio_test::assert_ok!(conn.refuse_auth());
        assert_eq!(conn.state(), ConnState::Delete);
        assert!(conn.pending_output().is_empty());

        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("-001 authorization refused"));

        // nothing left to deliver once the socket is gone
        let mut detached = Connection::detached("B");
        detached.state = ConnState::AuthPending;
        tokio_test::assert_ok!(detached.refuse_auth());
        assert_eq!(detached.state(), ConnState::Delete);
    }

    #[test]
    fn test_remote_value_error_transition() {
        let mut conn = Connection::detached("T0");
        let events = conn
            .process_input(b"META ra d 0 \"right ascension\"\nVALUE ra d 10.5\n")
            .unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::ValueChanged { .. }]));
        assert_eq!(
            conn.remote_value("ra").unwrap().data(),
            &ValueData::Double(10.5)
        );

        let line = format!("META ra d {} \"right ascension\"\n", VALUE_ERROR);
        let events = conn.process_input(line.as_bytes()).unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::ValueError { name }] if name == "ra"));
        // repeated error state is not reported again
        assert!(conn.process_input(line.as_bytes()).unwrap().is_empty());
    }

    fn image(channels: usize) -> Vec<Bytes> {
        (0..channels)
            .map(|channel| {
                let mut header = ImageHeader::new_2d(DATA_USHORT, 200, 100);
                header.channel = channel as u16;
                let pixels: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
                channel_payload(&header, &pixels)
            })
            .collect()
    }

    #[test]
    fn test_in_band_transfer() {
        let mut writer = Connection::detached("C0");
        let mut reader = Connection::detached("B");
        let channels = image(2);

        let id = writer
            .send_binary_data(DATA_USHORT, channels.clone(), None)
            .unwrap();
        let wire = writer.take_output();
        // delivered in pieces, as from a socket
        let mut received = Vec::new();
        for piece in wire.chunks(1000) {
            received.extend(reader.process_input(piece).unwrap());
        }
        match received.as_slice() {
            [ConnEvent::BinaryData(data)] => {
                assert_eq!(data.id, id);
                assert_eq!(data.channels, channels);
                assert_eq!(data.header(1).unwrap().channel, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shared_transfer_with_fallback() {
        let pool = SegmentPool::new(4);
        let mut writer = Connection::detached("C0");
        let mut reader = Connection::detached("B");
        let channels = image(1);

        writer
            .send_binary_data(DATA_USHORT, channels.clone(), Some(&pool))
            .unwrap();
        let events = reader.process_input(&writer.take_output()).unwrap();
        match events.as_slice() {
            [ConnEvent::BinaryData(data)] => assert_eq!(data.channels, channels),
            other => panic!("unexpected {:?}", other),
        }

        if writer.shm_disabled() {
            // no shared memory here, in-band fallback was used
            assert_eq!(pool.in_use(), 0);
            return;
        }
        assert_eq!(writer.pending_shared(), 1);
        assert_eq!(pool.in_use(), 1);
        writer.process_input(&reader.take_output()).unwrap();
        assert_eq!(writer.pending_shared(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_shared_allocation_failure_disables_shm() {
        let pool = SegmentPool::new(0);
        let mut writer = Connection::detached("C0");
        writer
            .send_binary_data(DATA_USHORT, image(1), Some(&pool))
            .unwrap();
        assert!(writer.shm_disabled());
        assert!(String::from_utf8_lossy(writer.pending_output()).starts_with("DATA 1 20 1"));
    }

    #[test]
    fn test_meta_versions() {
        let mut conn = Connection::detached("B");
        assert!(conn.meta_outdated("gain", 0));
        conn.mark_meta_sent("gain", 0);
        assert!(!conn.meta_outdated("gain", 0));
        assert!(conn.meta_outdated("gain", 1));
    }
}
