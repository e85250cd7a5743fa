// Client side of a RoRnet connection.
//
// `ConnectionSession` owns one TCP connection to a server. Architecture:
// - `connect()` performs TCP connect and the whole handshake on the calling
//   thread (HELLO -> server settings -> USER_INFO -> WELCOME), registers the
//   peer's Character and Chat streams, then spawns a background reader
//   thread.
// - The reader thread calls `FrameReader::next_frame()` in a loop and pushes
//   every frame into an `mpsc` channel. Socket reads time out every
//   `read_timeout`, which is when the thread checks its stop flag.
// - The consumer pulls frames with `receive()` and hands them to `process()`,
//   which updates the local `StreamRegistry` and turns the frame into a
//   `SessionEvent` for bot or mission logic.
// - All sends go through one `Mutex`-guarded write half, so frames from
//   different threads never interleave on the wire. The inbox sits behind
//   its own `Mutex`, which keeps the session `Sync`: a worker thread can send
//   through `&ConnectionSession` while the owner is blocked in `receive()`.
//
// States: Disconnected -> Connecting -> AwaitingServerInfo -> AwaitingWelcome
// -> Connected -> Disconnecting -> Disconnected. Any handshake failure closes
// the socket and returns to Disconnected. When the reader thread hits EOF or
// a socket error it marks the session Disconnected; `receive()` then
// returns `Received::Closed` once the queued frames are drained. A
// USER_LEAVE naming the session's own id means the server dropped it, and
// `process()` closes the session the same way.
//
// The server only starts relaying a peer's traffic after that peer has sent
// stream data, so `connect()` ends by sending a character position at the
// origin.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rornet_protocol::{
    CharacterAttach, CharacterPosition, Frame, FrameReader, MessageType, NetQuality, PrivateChat,
    ProtocolError, ReadOutcome, ServerInfo, StreamId, StreamRegistration, StreamType,
    TruckStreamData, UserId, UserInfo, Vec3, write_frame,
};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectError, RejectReason, SessionError};
use crate::streams::{Stream, StreamRegistry, StreamUpdate};

/// Language sent when the identity does not name one.
pub const DEFAULT_LANGUAGE: &str = "en_GB";

/// Longest chat line `send_chat_split` sends, in characters.
pub const CHAT_CHUNK_CHARS: usize = 100;

const CHAT_CONTINUATION: &str = "| ";

const KNOCK_POLL: Duration = Duration::from_millis(50);

/// Text a master-server probe sends in its HELLO.
pub const MASTER_SERVER_KNOCK: &str = "MasterServer";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingServerInfo,
    AwaitingWelcome,
    Connected,
    Disconnecting,
}

/// A server to connect to, with whatever is known about it.
#[derive(Clone, Debug, Default)]
pub struct ServerTarget {
    /// `host:port`.
    pub address: String,
    /// Cached settings; refreshed by each handshake.
    pub info: ServerInfo,
}

impl ServerTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            info: ServerInfo::default(),
        }
    }
}

/// Result of one `receive` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Frame(Frame),
    /// Nothing arrived in time.
    Timeout,
    /// The connection is gone and the queue is empty.
    Closed,
}

/// What a received frame meant, as reported by `process`.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    PeerJoined(UserInfo),
    PeerUpdated(UserInfo),
    PeerLeft {
        id: UserId,
        username: String,
        reason: String,
    },
    StreamRegistered {
        owner: UserId,
        stream: StreamId,
        registration: StreamRegistration,
    },
    StreamRegisterResult {
        from: UserId,
        registration: StreamRegistration,
    },
    StreamUnregistered {
        owner: UserId,
        stream: StreamId,
    },
    Stream(StreamUpdate),
    Chat {
        from: UserId,
        text: String,
    },
    PrivateChat {
        from: UserId,
        text: String,
    },
    GameCommand {
        from: UserId,
        text: String,
    },
    NetQuality(u32),
}

pub struct ConnectionSession {
    config: ClientConfig,
    state: Arc<Mutex<SessionState>>,
    writer: Mutex<Option<TcpStream>>,
    inbox: Mutex<Option<Receiver<Frame>>>,
    reader_thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    identity: UserInfo,
    server_info: ServerInfo,
    streams: StreamRegistry,
    next_stream_id: i32,
    net_quality: u32,
}

impl ConnectionSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            writer: Mutex::new(None),
            inbox: Mutex::new(None),
            reader_thread: None,
            stop: Arc::new(AtomicBool::new(false)),
            identity: UserInfo::default(),
            server_info: ServerInfo::default(),
            streams: StreamRegistry::new(),
            next_stream_id: StreamId::FIRST_LOCAL.0,
            net_quality: 0,
        }
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Connect and run the handshake. On success the session is `Connected`,
    /// owns a Character and a Chat stream, and `target.info` holds the
    /// server's settings.
    pub fn connect(
        &mut self,
        identity: UserInfo,
        target: &mut ServerTarget,
    ) -> Result<ServerInfo, ConnectError> {
        if self.state() != SessionState::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }
        // Leftovers of a connection the server dropped.
        self.teardown();
        *self.inbox_guard() = None;
        self.streams = StreamRegistry::new();
        self.next_stream_id = StreamId::FIRST_LOCAL.0;
        self.net_quality = 0;
        self.stop = Arc::new(AtomicBool::new(false));

        let mut identity = identity;
        if identity.language.is_empty() {
            identity.language = DEFAULT_LANGUAGE.to_string();
        }
        self.identity = identity;

        self.set_state(SessionState::Connecting);
        let result = self.handshake(target);
        if let Err(e) = &result {
            warn!(server = %target.address, error = %e, "connect failed");
            self.close_socket();
            self.set_state(SessionState::Disconnected);
        }
        result
    }

    fn handshake(&mut self, target: &mut ServerTarget) -> Result<ServerInfo, ConnectError> {
        let addr = resolve(&target.address)?;
        debug!(server = %addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        let mut reader = FrameReader::new(stream.try_clone()?);
        *self.writer_guard() = Some(stream);

        let hello = Frame::new(
            MessageType::Hello,
            UserId(0),
            StreamId(0),
            self.config.protocol_version.as_bytes().to_vec(),
        );
        self.send(&hello)?;
        self.set_state(SessionState::AwaitingServerInfo);

        let reply = self.await_reply(&mut reader, "server info")?;
        let info = match reply.command {
            MessageType::Hello => ServerInfo::decode(&reply.payload)?,
            MessageType::WrongVersion => {
                return Err(ConnectError::Rejected(RejectReason::WrongVersion));
            }
            got => {
                return Err(ConnectError::ProtocolViolation {
                    expected: MessageType::Hello,
                    got,
                });
            }
        };
        target.info = target.info.merged_with(&info);
        self.server_info = target.info.clone();
        debug!(
            server = %self.server_info.server_name,
            terrain = %self.server_info.terrain,
            version = %self.server_info.protocol_version,
            "server settings received"
        );

        let user_info = Frame::new(
            MessageType::UserInfo,
            UserId(0),
            StreamId(0),
            self.identity.encode(),
        );
        self.send(&user_info)?;
        self.set_state(SessionState::AwaitingWelcome);

        let reply = self.await_reply(&mut reader, "welcome")?;
        if reply.command != MessageType::Welcome {
            return Err(ConnectError::Rejected(RejectReason::from_command(reply.command)));
        }
        let assigned = UserInfo::decode(&reply.payload)?;
        self.identity = self.identity.merged_with(&assigned);
        self.streams.add_peer(self.identity.clone());

        self.register_stream(StreamType::Character, "default", vec![2])?;
        self.register_stream(StreamType::Chat, "chat", Vec::new())?;
        self.stream_character(&CharacterPosition::idle(Vec3::ORIGIN))?;

        let (tx, rx) = mpsc::channel();
        let stop = self.stop.clone();
        let state = self.state.clone();
        self.reader_thread = Some(thread::spawn(move || {
            reader_loop(reader, tx, stop, state);
        }));
        *self.inbox_guard() = Some(rx);
        self.set_state(SessionState::Connected);
        info!(
            server = %target.address,
            id = %self.identity.unique_id,
            username = %self.identity.username,
            "connected"
        );
        Ok(self.server_info.clone())
    }

    fn await_reply(
        &self,
        reader: &mut FrameReader<TcpStream>,
        what: &'static str,
    ) -> Result<Frame, ConnectError> {
        match reader.next_frame_timeout(self.config.handshake_timeout)? {
            ReadOutcome::Frame(frame) => {
                debug!(command = %frame.command, len = frame.len(), "handshake reply");
                Ok(frame)
            }
            ReadOutcome::Timeout => Err(ConnectError::Timeout(what)),
            ReadOutcome::Closed => Err(ConnectError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("server closed the connection while waiting for {what}"),
            ))),
        }
    }

    /// Leave the server: best-effort USER_LEAVE, then close the socket and
    /// join the reader thread. Safe to call in any state.
    pub fn disconnect(&mut self) {
        let connected = self.writer_guard().is_some();
        if connected {
            self.set_state(SessionState::Disconnecting);
            let leave = Frame::empty(MessageType::UserLeave, self.user_id(), StreamId(0));
            if let Err(e) = self.send(&leave) {
                debug!(error = %e, "USER_LEAVE not sent");
            }
        }
        self.teardown();
        *self.inbox_guard() = None;
        self.set_state(SessionState::Disconnected);
        if connected {
            info!(id = %self.identity.unique_id, "disconnected");
        }
    }

    fn teardown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.close_socket();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }

    fn close_socket(&self) {
        if let Some(stream) = self.writer_guard().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    // -- Receiving -----------------------------------------------------------

    /// Next inbound frame. With `blocking` the call waits up to `timeout`;
    /// otherwise it only looks at what is already queued.
    pub fn receive(&self, timeout: Duration, blocking: bool) -> Received {
        let guard = self.inbox_guard();
        let Some(inbox) = guard.as_ref() else {
            return Received::Closed;
        };
        if blocking {
            match inbox.recv_timeout(timeout) {
                Ok(frame) => Received::Frame(frame),
                Err(RecvTimeoutError::Timeout) => Received::Timeout,
                Err(RecvTimeoutError::Disconnected) => Received::Closed,
            }
        } else {
            match inbox.try_recv() {
                Ok(frame) => Received::Frame(frame),
                Err(TryRecvError::Empty) => Received::Timeout,
                Err(TryRecvError::Disconnected) => Received::Closed,
            }
        }
    }

    /// Apply one received frame to the session and describe it.
    pub fn process(&mut self, frame: &Frame) -> Option<SessionEvent> {
        let from = frame.source;
        if !frame.command.is_high_rate() {
            trace!(command = %frame.command, source = %from, stream = %frame.stream_id, "processing");
        }
        match frame.command {
            MessageType::UserJoin | MessageType::UserInfo => {
                let info = decoded(UserInfo::decode(&frame.payload), frame)?;
                let id = info.unique_id;
                if id == self.user_id() {
                    self.identity = self.identity.merged_with(&info);
                }
                self.streams.update_peer(info);
                let info = self.streams.identity(id);
                if frame.command == MessageType::UserJoin {
                    info!(peer = %id, username = %info.username, "peer joined");
                    Some(SessionEvent::PeerJoined(info))
                } else {
                    Some(SessionEvent::PeerUpdated(info))
                }
            }
            MessageType::UserLeave => {
                let username = self.streams.username(from);
                self.streams.remove_peer(from);
                let reason = frame.text();
                if from == self.user_id() && self.is_connected() {
                    info!(%reason, "server dropped us");
                    self.teardown();
                    self.set_state(SessionState::Disconnected);
                    return Some(SessionEvent::PeerLeft {
                        id: from,
                        username,
                        reason,
                    });
                }
                info!(peer = %from, %username, %reason, "peer left");
                Some(SessionEvent::PeerLeft {
                    id: from,
                    username,
                    reason,
                })
            }
            MessageType::StreamRegister => {
                let registration = decoded(StreamRegistration::decode(&frame.payload), frame)?;
                if registration.kind == StreamType::Truck && from != self.user_id() {
                    let status = if self.config.accept_vehicles {
                        StreamRegistration::STATUS_SUCCESS
                    } else {
                        StreamRegistration::STATUS_FAILED
                    };
                    if let Err(e) = self.reply_to_stream_register(&registration, status) {
                        debug!(peer = %from, error = %e, "stream register reply not sent");
                    }
                }
                let stream = Stream::from_registration(from, frame.stream_id, &registration);
                if !self.streams.register_stream(from, stream) {
                    return None;
                }
                debug!(peer = %from, stream = %frame.stream_id, name = %registration.name, "remote stream");
                Some(SessionEvent::StreamRegistered {
                    owner: from,
                    stream: frame.stream_id,
                    registration,
                })
            }
            MessageType::StreamRegisterResult => {
                let registration = decoded(StreamRegistration::decode(&frame.payload), frame)?;
                Some(SessionEvent::StreamRegisterResult { from, registration })
            }
            MessageType::StreamUnregister => self
                .streams
                .unregister_stream(from, frame.stream_id)
                .map(|_| SessionEvent::StreamUnregistered {
                    owner: from,
                    stream: frame.stream_id,
                }),
            MessageType::StreamData => self
                .streams
                .apply_stream_data(from, frame.stream_id, &frame.payload)
                .map(SessionEvent::Stream),
            MessageType::UtfChat => Some(SessionEvent::Chat {
                from,
                text: frame.text(),
            }),
            MessageType::UtfPrivateChat => Some(SessionEvent::PrivateChat {
                from,
                text: frame.text(),
            }),
            MessageType::GameCommand => Some(SessionEvent::GameCommand {
                from,
                text: frame.text(),
            }),
            MessageType::NetQuality => {
                let NetQuality(quality) = decoded(NetQuality::decode(&frame.payload), frame)?;
                if quality != self.net_quality {
                    debug!(quality, "net quality changed");
                }
                self.net_quality = quality;
                Some(SessionEvent::NetQuality(quality))
            }
            MessageType::Unknown(code) => {
                warn!(code, source = %from, "unknown command ignored");
                None
            }
            other => {
                debug!(command = %other, source = %from, "unexpected command ignored");
                None
            }
        }
    }

    // -- Sending -------------------------------------------------------------

    /// Write one frame. Fails with `NotConnected` when there is no socket.
    pub fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        let mut guard = self.writer_guard();
        let stream = guard.as_mut().ok_or(SessionError::NotConnected)?;
        write_frame(stream, frame)?;
        if !frame.command.is_high_rate() {
            trace!(command = %frame.command, stream = %frame.stream_id, len = frame.len(), "sent");
        }
        Ok(())
    }

    pub fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.send(&Frame::new(
            MessageType::UtfChat,
            self.user_id(),
            self.chat_stream(),
            text.as_bytes().to_vec(),
        ))
    }

    /// Send a long message as several chat lines of at most
    /// `CHAT_CHUNK_CHARS` characters each.
    pub fn send_chat_split(&self, text: &str) -> Result<(), SessionError> {
        for line in split_chat(text) {
            self.send_chat(&line)?;
        }
        Ok(())
    }

    pub fn send_private_chat(&self, target: UserId, text: &str) -> Result<(), SessionError> {
        let payload = PrivateChat {
            target,
            text: text.to_string(),
        };
        self.send(&Frame::new(
            MessageType::UtfPrivateChat,
            self.user_id(),
            self.chat_stream(),
            payload.encode(),
        ))
    }

    pub fn send_game_command(&self, command: &str) -> Result<(), SessionError> {
        self.send(&Frame::new(
            MessageType::GameCommand,
            self.user_id(),
            StreamId(0),
            command.as_bytes().to_vec(),
        ))
    }

    /// Announce a new stream with the next free local id. Truck streams
    /// are registered for packets carrying only the reference position; use
    /// `register_truck` when `stream_truck` sends node data.
    pub fn register_stream(
        &mut self,
        kind: StreamType,
        name: &str,
        data: Vec<u8>,
    ) -> Result<StreamId, SessionError> {
        let buffer_size = if kind == StreamType::Truck {
            TruckStreamData::MIN_BUFFER_SIZE
        } else {
            0
        };
        self.announce(StreamRegistration {
            buffer_size,
            ..StreamRegistration::new(kind, name, data)
        })
    }

    /// Announce a truck whose packets have a node buffer of `buffer_size`
    /// bytes (see `TruckStreamData::buffer_size`). The server drops packets
    /// of any other length.
    pub fn register_truck(&mut self, name: &str, buffer_size: i32) -> Result<StreamId, SessionError> {
        self.announce(StreamRegistration {
            buffer_size,
            ..StreamRegistration::new(StreamType::Truck, name, Vec::new())
        })
    }

    fn announce(&mut self, registration: StreamRegistration) -> Result<StreamId, SessionError> {
        let me = self.user_id();
        let id = StreamId(self.next_stream_id);
        let registration = StreamRegistration {
            origin_source: me,
            origin_stream: id,
            ..registration
        };
        self.send(&Frame::new(
            MessageType::StreamRegister,
            me,
            id,
            registration.encode(),
        ))?;
        self.next_stream_id += 1;
        self.streams
            .register_stream(me, Stream::from_registration(me, id, &registration));
        debug!(stream = %id, name = %registration.name, kind = ?registration.kind, "stream registered");
        Ok(id)
    }

    /// Forget a local stream. RoRnet_2.37 servers have no unregister
    /// command, so nothing is sent.
    pub fn unregister_stream(&mut self, id: StreamId) -> bool {
        self.streams.unregister_stream(self.user_id(), id).is_some()
    }

    /// Answer a peer's STREAM_REGISTER.
    pub fn reply_to_stream_register(
        &self,
        registration: &StreamRegistration,
        status: i32,
    ) -> Result<(), SessionError> {
        let reply = StreamRegistration {
            status,
            ..registration.clone()
        };
        self.send(&Frame::new(
            MessageType::StreamRegisterResult,
            self.user_id(),
            registration.origin_stream,
            reply.encode(),
        ))
    }

    /// Move the own character and tell the server. Walking gets the
    /// character out of any vehicle it was attached to.
    pub fn stream_character(&mut self, position: &CharacterPosition) -> Result<(), SessionError> {
        let me = self.user_id();
        let character = self.streams.character_stream(me);
        self.streams.set_current_stream(me, me, character);
        self.streams.set_position(me, character, position.position);
        self.streams.set_rotation(me, character, position.rotation);
        self.send(&Frame::new(
            MessageType::StreamData,
            me,
            character,
            position.encode(),
        ))
    }

    /// Get into a vehicle (`enabled`) or back out of it.
    pub fn stream_character_attach(&mut self, attach: CharacterAttach) -> Result<(), SessionError> {
        let me = self.user_id();
        let character = self.streams.character_stream(me);
        if attach.enabled {
            self.streams.set_current_stream(me, attach.source, attach.stream);
        } else {
            self.streams.set_current_stream(me, me, character);
        }
        self.send(&Frame::new(
            MessageType::StreamData,
            me,
            character,
            attach.encode(),
        ))
    }

    /// Send one truck state update on a local truck stream.
    pub fn stream_truck(&mut self, id: StreamId, data: &TruckStreamData) -> Result<(), SessionError> {
        let me = self.user_id();
        self.streams.set_position(me, id, data.ref_position);
        self.send(&Frame::new(MessageType::StreamData, me, id, data.encode()))
    }

    // -- Accessors -----------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn writer_guard(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbox_guard(&self) -> MutexGuard<'_, Option<Receiver<Frame>>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn user_id(&self) -> UserId {
        self.identity.unique_id
    }

    pub fn identity(&self) -> &UserInfo {
        &self.identity
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn character_stream(&self) -> StreamId {
        self.streams.character_stream(self.user_id())
    }

    pub fn chat_stream(&self) -> StreamId {
        self.streams.chat_stream(self.user_id())
    }

    /// Last NETQUALITY value from the server: 0 good, 1 lagging.
    pub fn net_quality(&self) -> u32 {
        self.net_quality
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reader thread: read frames in a loop, push to the channel.
fn reader_loop(
    mut reader: FrameReader<TcpStream>,
    tx: Sender<Frame>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
) {
    while !stop.load(Ordering::SeqCst) {
        match reader.next_frame() {
            Ok(ReadOutcome::Frame(frame)) => {
                if tx.send(frame).is_err() {
                    break; // Session dropped the receiver
                }
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::Closed) => {
                if !stop.load(Ordering::SeqCst) {
                    info!("server closed the connection");
                }
                break;
            }
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(error = %e, "connection lost");
                }
                break;
            }
        }
    }
    if !stop.load(Ordering::SeqCst) {
        *state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Disconnected;
    }
}

fn decoded<T>(result: Result<T, ProtocolError>, frame: &Frame) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(command = %frame.command, source = %frame.source, error = %e, "malformed payload");
            None
        }
    }
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {address}"),
        )
    })
}

/// Break `text` into chat lines; every line after the first starts with
/// `"| "`.
pub fn split_chat(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHAT_CHUNK_CHARS)
        .enumerate()
        .map(|(i, chunk)| {
            let prefix = if i == 0 { "" } else { CHAT_CONTINUATION };
            let mut line = String::from(prefix);
            line.extend(chunk);
            line
        })
        .collect()
}

/// Probe a server the way the master server does: HELLO from the master
/// server id, answered by MASTERINFO.
pub fn knock(address: &str, timeout: Duration) -> Result<Frame, ConnectError> {
    let addr = resolve(address)?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(KNOCK_POLL))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    let hello = Frame::new(
        MessageType::Hello,
        UserId::MASTER_SERVER,
        StreamId(0),
        MASTER_SERVER_KNOCK.as_bytes().to_vec(),
    );
    write_frame(&mut writer, &hello)?;
    let mut reader = FrameReader::new(stream);
    let reply = match reader.next_frame_timeout(timeout)? {
        ReadOutcome::Frame(frame) => frame,
        ReadOutcome::Timeout => return Err(ConnectError::Timeout("master info")),
        ReadOutcome::Closed => {
            return Err(ConnectError::Transport(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }
    };
    let _ = writer.shutdown(Shutdown::Both);
    if reply.command != MessageType::MasterInfo {
        return Err(ConnectError::ProtocolViolation {
            expected: MessageType::MasterInfo,
            got: reply.command,
        });
    }
    Ok(reply)
}
