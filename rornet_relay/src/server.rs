// TCP server for the RoRnet relay.
//
// Architecture: thread-per-connection around a shared `Registry`.
//
// - **Accept thread** (`TcpListener::accept()` loop, non-blocking so it can
//   poll `keep_running`): spawns one connection thread per accepted socket.
// - **Connection threads**: run the server half of the handshake, then read
//   frames in a loop and route each one through the `Registry`, which
//   writes to the other peers' sockets under its own lock. On EOF or a read
//   error the peer is removed.
//
// Every frame a peer sends is stamped with that peer's id before it is
// routed; whatever `source` the client wrote is discarded.
//
// Chat lines starting with `!` are handed to the command callback instead of
// being broadcast. `start_relay` installs `builtin_commands`.
//
// Shutdown: `RelayHandle::stop()` clears `keep_running`, joins the accept
// thread and disconnects every peer. Shutting a peer's socket down makes its
// connection thread see EOF and exit.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rornet_protocol::{
    Frame, FrameReader, MessageType, ReadOutcome, StreamId, StreamRegistration, UserId, UserInfo,
    write_frame,
};
use tracing::{debug, info, trace, warn};

use crate::client::MASTER_SERVER_KNOCK;
use crate::config::RelayConfig;
use crate::error::RejectReason;
use crate::registry::{Audience, Registry, RegistryLimits};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Handles a `!command` chat line: registry, sender, full line.
pub type CommandCallback = Arc<dyn Fn(&Registry, UserId, &str) + Send + Sync>;

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    registry: Arc<Registry>,
}

impl RelayHandle {
    /// The live peer table, for inspection.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop accepting, disconnect every peer and wait for the accept thread.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.registry.disconnect_all("server shutting down");
        info!("relay stopped");
    }
}

/// Start the relay on a background thread with the built-in chat commands.
/// Returns a handle for stopping it and the bound address (port 0 lets the
/// OS pick a free port).
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    start_relay_with_commands(config, Arc::new(builtin_commands))
}

pub fn start_relay_with_commands(
    config: RelayConfig,
    commands: CommandCallback,
) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let registry = Arc::new(Registry::new(RegistryLimits {
        max_players: config.max_players,
        max_streams_per_peer: config.max_streams_per_peer,
    }));
    let keep_running = Arc::new(AtomicBool::new(true));

    let thread = {
        let keep_running = keep_running.clone();
        let registry = registry.clone();
        let config = Arc::new(config);
        thread::spawn(move || accept_loop(listener, config, registry, commands, keep_running))
    };
    info!(%addr, "relay listening");

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
            registry,
        },
        addr,
    ))
}

fn accept_loop(
    listener: TcpListener,
    config: Arc<RelayConfig>,
    registry: Arc<Registry>,
    commands: CommandCallback,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "connection accepted");
                let config = config.clone();
                let registry = registry.clone();
                let commands = commands.clone();
                let keep_running = keep_running.clone();
                thread::spawn(move || {
                    serve_connection(stream, addr, &config, &registry, &commands, &keep_running);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                // EMFILE, ECONNABORTED and the like pass; keep listening.
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Handshake, then the read loop, for one socket.
fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: &RelayConfig,
    registry: &Registry,
    commands: &CommandCallback,
    keep_running: &AtomicBool,
) {
    let setup = (|| -> io::Result<(FrameReader<TcpStream>, TcpStream)> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.read_timeout()))?;
        stream.set_write_timeout(Some(config.write_timeout()))?;
        let writer = stream.try_clone()?;
        Ok((FrameReader::new(stream), writer))
    })();
    let (mut reader, mut writer) = match setup {
        Ok(halves) => halves,
        Err(e) => {
            warn!(%addr, error = %e, "cannot set up connection");
            return;
        }
    };

    let identity = match handshake(&mut reader, &mut writer, addr, config) {
        Some(identity) => identity,
        None => {
            let _ = writer.shutdown(Shutdown::Both);
            return;
        }
    };
    if !keep_running.load(Ordering::SeqCst) {
        let _ = writer.shutdown(Shutdown::Both);
        return;
    }

    let id = match registry.add_peer(identity, writer, addr) {
        Ok(info) => info.unique_id,
        Err(reason) => {
            // The write half went to `add_peer`; answer on the read half.
            info!(%addr, %reason, "connection refused");
            let rejection = Frame::empty(reason.command(), UserId::SERVER, StreamId(0));
            let mut socket = reader.get_ref();
            let _ = write_frame(&mut socket, &rejection);
            let _ = socket.shutdown(Shutdown::Both);
            return;
        }
    };

    read_loop(&mut reader, id, registry, commands);
}

/// Server half of the handshake. Returns the identity to admit, or `None`
/// when the connection should be closed (after any rejection was sent).
fn handshake(
    reader: &mut FrameReader<TcpStream>,
    writer: &mut TcpStream,
    addr: SocketAddr,
    config: &RelayConfig,
) -> Option<UserInfo> {
    let hello = expect_frame(reader, addr, config, "HELLO")?;
    if hello.command != MessageType::Hello {
        debug!(%addr, command = %hello.command, "first frame was not HELLO");
        reject(writer, RejectReason::WrongVersion);
        return None;
    }
    let version = hello.text();
    if hello.source == UserId::MASTER_SERVER && version == MASTER_SERVER_KNOCK {
        debug!(%addr, "master server knock");
        let reply = Frame::new(
            MessageType::MasterInfo,
            UserId::SERVER,
            StreamId(0),
            config.protocol_version.as_bytes().to_vec(),
        );
        let _ = write_frame(writer, &reply);
        return None;
    }
    if version != config.protocol_version {
        info!(%addr, %version, "wrong protocol version");
        reject(writer, RejectReason::WrongVersion);
        return None;
    }

    let settings = Frame::new(
        MessageType::Hello,
        UserId::SERVER,
        StreamId(0),
        config.server_info().encode(),
    );
    if let Err(e) = write_frame(writer, &settings) {
        warn!(%addr, error = %e, "cannot send server settings");
        return None;
    }

    let user_info = expect_frame(reader, addr, config, "USER_INFO")?;
    if user_info.command != MessageType::UserInfo {
        debug!(%addr, command = %user_info.command, "expected USER_INFO");
        return None;
    }
    let mut identity = match UserInfo::decode(&user_info.payload) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%addr, error = %e, "malformed USER_INFO");
            return None;
        }
    };
    if config.is_banned(&identity.username) {
        info!(%addr, username = %identity.username, "banned user refused");
        reject(writer, RejectReason::Banned);
        return None;
    }
    if !config.password_matches(&identity.server_password) {
        info!(%addr, username = %identity.username, "wrong password");
        reject(writer, RejectReason::WrongPassword);
        return None;
    }
    identity.auth = config.auth_for(&identity);
    Some(identity)
}

fn expect_frame(
    reader: &mut FrameReader<TcpStream>,
    addr: SocketAddr,
    config: &RelayConfig,
    what: &str,
) -> Option<Frame> {
    match reader.next_frame_timeout(config.handshake_timeout()) {
        Ok(ReadOutcome::Frame(frame)) => Some(frame),
        Ok(ReadOutcome::Timeout) => {
            info!(%addr, "handshake timed out waiting for {what}");
            None
        }
        Ok(ReadOutcome::Closed) => {
            debug!(%addr, "closed during handshake");
            None
        }
        Err(e) => {
            warn!(%addr, error = %e, "handshake read failed");
            None
        }
    }
}

fn reject(writer: &mut TcpStream, reason: RejectReason) {
    let frame = Frame::empty(reason.command(), UserId::SERVER, StreamId(0));
    let _ = write_frame(writer, &frame);
}

/// Read frames until the peer leaves or its socket dies.
fn read_loop(
    reader: &mut FrameReader<TcpStream>,
    id: UserId,
    registry: &Registry,
    commands: &CommandCallback,
) {
    loop {
        match reader.next_frame() {
            Ok(ReadOutcome::Frame(mut frame)) => {
                frame.source = id;
                if !route(registry, id, &frame, commands) {
                    break;
                }
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::Closed) => {
                registry.remove_peer(id, "connection lost");
                break;
            }
            Err(e) => {
                debug!(peer = %id, error = %e, "read failed");
                registry.remove_peer(id, "connection lost");
                break;
            }
        }
    }
}

/// Handle one frame from an admitted peer. Returns false once the peer is
/// gone and the read loop should stop.
fn route(registry: &Registry, id: UserId, frame: &Frame, commands: &CommandCallback) -> bool {
    if !frame.command.is_high_rate() {
        trace!(peer = %id, command = %frame.command, stream = %frame.stream_id, "received");
    }
    match frame.command {
        MessageType::StreamRegister => match StreamRegistration::decode(&frame.payload) {
            Ok(reg) => {
                if !registry.register_stream(id, frame.stream_id, &reg) {
                    registry.remove_peer(id, "too many streams");
                    return false;
                }
            }
            Err(e) => warn!(peer = %id, error = %e, "malformed stream registration"),
        },
        MessageType::StreamRegisterResult => {
            registry.forward_register_result(id, frame);
        }
        MessageType::StreamUnregister => {
            registry.unregister_stream(id, frame.stream_id);
        }
        MessageType::StreamData => {
            registry.apply_stream_data(frame);
        }
        MessageType::UtfChat => {
            let text = frame.text();
            if text.starts_with('!') {
                debug!(peer = %id, command = %text, "chat command");
                commands(registry, id, &text);
            } else {
                info!(peer = %id, %text, "chat");
                registry.broadcast(frame, Audience::All);
            }
        }
        MessageType::UtfPrivateChat => {
            registry.send_private_chat(id, frame);
        }
        MessageType::UserInfo => match UserInfo::decode(&frame.payload) {
            Ok(update) => {
                registry.update_identity(id, &update);
            }
            Err(e) => warn!(peer = %id, error = %e, "malformed user info"),
        },
        MessageType::UserLeave => {
            registry.remove_peer(id, "disconnected on request");
            return false;
        }
        MessageType::GameCommand => {
            debug!(peer = %id, command = %frame.text(), "game command dropped");
        }
        MessageType::Unknown(code) => {
            warn!(peer = %id, code, "unknown command ignored");
        }
        other => {
            debug!(peer = %id, command = %other, "unexpected command ignored");
        }
    }
    registry.contains_peer(id)
}

/// Answer a line from the server to one peer.
pub fn reply(registry: &Registry, to: UserId, text: &str) -> bool {
    let frame = Frame::new(
        MessageType::UtfChat,
        UserId::SERVER,
        StreamId(0),
        text.as_bytes().to_vec(),
    );
    registry.send_to(to, &frame)
}

/// `!players` lists who is online; `!stats` reports the travel totals.
pub fn builtin_commands(registry: &Registry, from: UserId, line: &str) {
    match line.split_whitespace().next().unwrap_or_default() {
        "!players" => {
            let names: Vec<String> = registry
                .peer_ids()
                .into_iter()
                .map(|id| format!("{} ({id})", registry.identity(id).username))
                .collect();
            reply(registry, from, &format!("online: {}", names.join(", ")));
        }
        "!stats" => {
            let stats = registry.global_stats();
            let average = stats
                .average_connect_time()
                .map_or_else(|| "n/a".to_string(), |d| format!("{}s", d.as_secs()));
            reply(
                registry,
                from,
                &format!(
                    "players seen: {}, walked {:.0} m, driven {:.0} m, flown {:.0} m, sailed {:.0} m, average visit {average}",
                    stats.peer_count,
                    stats.distance_walked_total,
                    stats.distance_driven_total,
                    stats.distance_flown_total,
                    stats.distance_sailed_total,
                ),
            );
        }
        other => {
            reply(registry, from, &format!("unknown command {other}"));
        }
    }
}
