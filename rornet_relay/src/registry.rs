// Server-side peer table and fan-out.
//
// `Registry` is the structure `server.rs` drives. Each connection thread
// calls into it with the frames its peer sent; the registry updates its
// bookkeeping and writes the resulting frames to the other peers' sockets.
// One `Mutex` covers the peer table, the `StreamRegistry` and the id
// counter, and broadcasts write while holding it. That keeps the frames of a
// broadcast in the same order on every socket and keeps two threads from
// interleaving writes on one socket.
//
// The cost is that one slow socket delays everyone. Every peer socket gets
// a write timeout in `server.rs`; a write that fails or times out removes
// the peer (USER_LEAVE to the rest, socket shut down so its reader thread
// exits). The USER_LEAVE sent on removal can itself fail on another socket,
// which removes that peer in turn.
//
// Peer ids start at 1 and are never reused within a process. Slots and
// colours are the lowest values not held by a connected peer.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufWriter;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rornet_protocol::{
    AuthFlags, Frame, MessageType, NetQuality, PrivateChat, StreamId, StreamRegistration,
    StreamType, TruckStreamData, UserId, UserInfo, encode, write_encoded, write_frame,
};
use tracing::{debug, info, trace, warn};

use crate::error::RejectReason;
use crate::stats::{GlobalStats, PeerStats};
use crate::streams::{Stream, StreamRegistry};

/// Which connected peers a broadcast reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Everyone but the given peer (normally the frame's source).
    Others(UserId),
    /// Everyone, the source included.
    All,
    /// Peers with the ADMIN flag, except the given one.
    AdminsExcept(UserId),
}

impl Audience {
    fn includes(self, id: UserId, auth: AuthFlags) -> bool {
        match self {
            Audience::Others(excluded) => id != excluded,
            Audience::All => true,
            Audience::AdminsExcept(excluded) => id != excluded && auth.contains(AuthFlags::ADMIN),
        }
    }
}

/// A connected, admitted peer.
pub struct PeerSession {
    pub identity: UserInfo,
    writer: BufWriter<TcpStream>,
    /// Whether broadcasts are written to this peer.
    pub flow_enabled: bool,
    /// Set once the peer has been sent the existing peers and streams.
    pub initialized: bool,
    pub addr: SocketAddr,
}

impl PeerSession {
    fn shutdown(&self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegistryLimits {
    pub max_players: usize,
    pub max_streams_per_peer: usize,
}

struct RegistryState {
    peers: BTreeMap<UserId, PeerSession>,
    streams: StreamRegistry,
    next_id: i32,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    limits: RegistryLimits,
}

impl Registry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                peers: BTreeMap::new(),
                streams: StreamRegistry::new(),
                next_id: 1,
            }),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a peer whose handshake passed: assign id, slot, colour and a
    /// unique username, send WELCOME, and announce it with USER_JOIN to
    /// everyone (the new peer included).
    pub fn add_peer(
        &self,
        identity: UserInfo,
        writer: TcpStream,
        addr: SocketAddr,
    ) -> Result<UserInfo, RejectReason> {
        let mut state = self.lock();
        if state.peers.len() >= self.limits.max_players {
            return Err(RejectReason::Full);
        }

        let id = UserId(state.next_id);
        state.next_id += 1;

        let slots: BTreeSet<i32> = state.peers.values().map(|p| p.identity.slot_num).collect();
        let colours: BTreeSet<i32> = state.peers.values().map(|p| p.identity.colour_num).collect();
        let username = unique_username(&identity.username, &state.peers);
        let identity = UserInfo {
            unique_id: id,
            username,
            slot_num: lowest_free(&slots),
            colour_num: lowest_free(&colours),
            ..identity
        };

        let mut writer = BufWriter::new(writer);
        let welcome = Frame::new(
            MessageType::Welcome,
            UserId::SERVER,
            StreamId(0),
            identity.without_credentials().encode(),
        );
        if let Err(e) = write_frame(&mut writer, &welcome) {
            // The reader thread will see the dead socket and clean up.
            warn!(peer = %id, error = %e, "failed to send WELCOME");
        }

        state.peers.insert(
            id,
            PeerSession {
                identity: identity.clone(),
                writer,
                flow_enabled: true,
                initialized: false,
                addr,
            },
        );
        state.streams.add_peer(identity.clone());
        info!(
            peer = %id,
            username = %identity.username,
            %addr,
            slot = identity.slot_num,
            "peer joined"
        );

        let join = Frame::new(
            MessageType::UserJoin,
            id,
            StreamId(0),
            identity.without_credentials().encode(),
        );
        self.fan_out(&mut state, &join, Audience::All);
        Ok(identity)
    }

    /// Suspend or resume broadcasts to a peer. A change is reported to the
    /// peer with NETQUALITY: 1 while suspended, 0 once resumed.
    pub fn set_flow(&self, id: UserId, enabled: bool) {
        let mut state = self.lock();
        let Some(peer) = state.peers.get_mut(&id) else {
            return;
        };
        if peer.flow_enabled == enabled {
            return;
        }
        peer.flow_enabled = enabled;
        debug!(peer = %id, enabled, "flow changed");
        let quality = NetQuality(u32::from(!enabled));
        let frame = Frame::new(MessageType::NetQuality, UserId::SERVER, StreamId(0), quality.encode());
        self.send_locked(&mut state, id, &frame);
    }

    /// Apply a USER_INFO an admitted peer sent. Only the fields a client
    /// owns are taken; id, name, slot, colour and auth stay as assigned.
    /// Everyone, the peer included, gets the result.
    pub fn update_identity(&self, id: UserId, update: &UserInfo) -> bool {
        let mut state = self.lock();
        if !state.peers.contains_key(&id) {
            return false;
        }
        let allowed = UserInfo {
            language: update.language.clone(),
            client_name: update.client_name.clone(),
            client_version: update.client_version.clone(),
            session_type: update.session_type.clone(),
            session_options: update.session_options.clone(),
            ..UserInfo::default()
        };
        let merged = state.streams.identity(id).merged_with(&allowed);
        state.streams.update_peer(merged.clone());
        if let Some(peer) = state.peers.get_mut(&id) {
            peer.identity = merged.clone();
        }
        debug!(peer = %id, "identity updated");
        let info = Frame::new(
            MessageType::UserInfo,
            id,
            StreamId(0),
            merged.without_credentials().encode(),
        );
        self.fan_out(&mut state, &info, Audience::All);
        true
    }

    /// Write `frame` to every selected peer with flow enabled. Peers whose
    /// socket fails are removed. Returns the number of successful writes.
    pub fn broadcast(&self, frame: &Frame, audience: Audience) -> usize {
        let mut state = self.lock();
        self.fan_out(&mut state, frame, audience)
    }

    /// Write one frame to one peer. Returns false if the peer is unknown or
    /// the write failed (the peer is then removed).
    pub fn send_to(&self, id: UserId, frame: &Frame) -> bool {
        let mut state = self.lock();
        self.send_locked(&mut state, id, frame)
    }

    /// Remove a peer, fold its stats, drop its streams and tell the others.
    pub fn remove_peer(&self, id: UserId, reason: &str) -> Option<PeerSession> {
        let mut state = self.lock();
        self.remove_locked(&mut state, id, reason)
    }

    /// Remove everyone, e.g. on shutdown.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<UserId> = state.peers.keys().copied().collect();
        for id in ids {
            self.remove_locked(&mut state, id, reason);
        }
    }

    /// Store a stream registration and announce it to the other peers.
    /// Returns false when the peer already holds `max_streams_per_peer`
    /// streams.
    pub fn register_stream(&self, owner: UserId, stream_id: StreamId, reg: &StreamRegistration) -> bool {
        let mut state = self.lock();
        if !state.peers.contains_key(&owner) {
            return false;
        }
        if state.streams.stream_count(owner) >= self.limits.max_streams_per_peer {
            warn!(peer = %owner, limit = self.limits.max_streams_per_peer, "stream limit reached");
            return false;
        }
        let stream = Stream::from_registration(owner, stream_id, reg);
        state.streams.register_stream(owner, stream.clone());
        debug!(peer = %owner, stream = %stream_id, name = %stream.name, kind = ?stream.kind, "stream registered");

        let announce = Frame::new(
            MessageType::StreamRegister,
            owner,
            stream_id,
            stream.registration().encode(),
        );
        self.fan_out(&mut state, &announce, Audience::Others(owner));
        true
    }

    /// Drop a stream and tell everyone. Returns false for unknown streams.
    pub fn unregister_stream(&self, owner: UserId, stream_id: StreamId) -> bool {
        let mut state = self.lock();
        if state.streams.unregister_stream(owner, stream_id).is_none() {
            return false;
        }
        debug!(peer = %owner, stream = %stream_id, "stream unregistered");
        let notice = Frame::empty(MessageType::StreamUnregister, owner, stream_id);
        self.fan_out(&mut state, &notice, Audience::All);
        true
    }

    /// Record and relay one STREAM_DATA frame. The first one a peer sends
    /// syncs that peer with everyone already present. Data for streams that
    /// were never registered, and truck data whose length does not match the
    /// registered buffer, is dropped. Returns whether the frame was relayed.
    pub fn apply_stream_data(&self, frame: &Frame) -> bool {
        let mut state = self.lock();
        let owner = frame.source;
        let needs_sync = match state.peers.get(&owner) {
            Some(peer) => !peer.initialized,
            None => return false,
        };
        if needs_sync {
            self.sync_locked(&mut state, owner);
        }
        if !state.streams.contains_stream(owner, frame.stream_id) {
            trace!(peer = %owner, stream = %frame.stream_id, "data for unregistered stream dropped");
            return false;
        }
        let stream = state.streams.stream(owner, frame.stream_id);
        if stream.kind == StreamType::Truck
            && let Err(e) = TruckStreamData::check_len(&frame.payload, stream.buffer_size)
        {
            debug!(peer = %owner, stream = %frame.stream_id, error = %e, "truck data dropped");
            return false;
        }
        state
            .streams
            .apply_stream_data(owner, frame.stream_id, &frame.payload);
        self.fan_out(&mut state, frame, Audience::Others(owner));
        true
    }

    /// Route a STREAM_REGISTER_RESULT back to the peer that owns the stream.
    pub fn forward_register_result(&self, from: UserId, frame: &Frame) -> bool {
        let reg = match StreamRegistration::decode(&frame.payload) {
            Ok(reg) => reg,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed stream register result");
                return false;
            }
        };
        let forwarded = Frame::new(
            MessageType::StreamRegisterResult,
            from,
            frame.stream_id,
            frame.payload.clone(),
        );
        self.send_to(reg.origin_source, &forwarded)
    }

    /// Deliver a UTF_PRIVCHAT to its target only. The target id is stripped;
    /// the target receives the bare text.
    pub fn send_private_chat(&self, from: UserId, frame: &Frame) -> bool {
        let chat = match PrivateChat::decode(&frame.payload) {
            Ok(chat) => chat,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed private chat");
                return false;
            }
        };
        let forwarded = Frame::new(
            MessageType::UtfPrivateChat,
            from,
            frame.stream_id,
            chat.text.into_bytes(),
        );
        self.send_to(chat.target, &forwarded)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn peer_ids(&self) -> Vec<UserId> {
        self.lock().peers.keys().copied().collect()
    }

    pub fn contains_peer(&self, id: UserId) -> bool {
        self.lock().peers.contains_key(&id)
    }

    pub fn identity(&self, id: UserId) -> UserInfo {
        self.lock().streams.identity(id)
    }

    pub fn flow_enabled(&self, id: UserId) -> bool {
        self.lock().peers.get(&id).is_some_and(|p| p.flow_enabled)
    }

    pub fn stream_count(&self, id: UserId) -> usize {
        self.lock().streams.stream_count(id)
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.lock().streams.global_stats().clone()
    }

    pub fn peer_stats(&self, id: UserId) -> Option<PeerStats> {
        self.lock().streams.peer_stats(id)
    }

    // -- Locked internals ----------------------------------------------------

    fn fan_out(&self, state: &mut RegistryState, frame: &Frame, audience: Audience) -> usize {
        let bytes = match encode(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(command = %frame.command, error = %e, "cannot encode broadcast");
                return 0;
            }
        };
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (&id, peer) in state.peers.iter_mut() {
            if !peer.flow_enabled || !audience.includes(id, peer.identity.auth) {
                continue;
            }
            match write_encoded(&mut peer.writer, &bytes) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %id, command = %frame.command, error = %e, "write failed");
                    failed.push(id);
                }
            }
        }
        if !frame.command.is_high_rate() {
            trace!(command = %frame.command, source = %frame.source, delivered, "broadcast");
        }
        for id in failed {
            self.remove_locked(state, id, "write failed");
        }
        delivered
    }

    fn send_locked(&self, state: &mut RegistryState, id: UserId, frame: &Frame) -> bool {
        let Some(peer) = state.peers.get_mut(&id) else {
            return false;
        };
        match write_frame(&mut peer.writer, frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %id, command = %frame.command, error = %e, "write failed");
                self.remove_locked(state, id, "write failed");
                false
            }
        }
    }

    fn remove_locked(&self, state: &mut RegistryState, id: UserId, reason: &str) -> Option<PeerSession> {
        let peer = state.peers.remove(&id)?;
        peer.shutdown();
        let stats = state.streams.remove_peer(id);
        info!(
            peer = %id,
            username = %peer.identity.username,
            reason,
            online_secs = stats.map(|s| s.online_since.elapsed().as_secs()),
            "peer left"
        );
        let leave = Frame::new(
            MessageType::UserLeave,
            id,
            StreamId(0),
            reason.as_bytes().to_vec(),
        );
        self.fan_out(state, &leave, Audience::All);
        Some(peer)
    }

    /// Send `id` the identity and streams of every other peer.
    fn sync_locked(&self, state: &mut RegistryState, id: UserId) {
        let Some(peer) = state.peers.get_mut(&id) else {
            return;
        };
        peer.initialized = true;

        let mut frames = Vec::new();
        for other in state.streams.peer_ids() {
            if other == id || !state.peers.contains_key(&other) {
                continue;
            }
            frames.push(Frame::new(
                MessageType::UserInfo,
                other,
                StreamId(0),
                state.streams.identity(other).without_credentials().encode(),
            ));
            for stream in state.streams.streams_of(other) {
                frames.push(Frame::new(
                    MessageType::StreamRegister,
                    other,
                    stream.id,
                    stream.registration().encode(),
                ));
            }
        }
        debug!(peer = %id, frames = frames.len(), "syncing peer");
        for frame in &frames {
            if !self.send_locked(state, id, frame) {
                break;
            }
        }
    }
}

/// `name`, or `name_2`, `name_3`, ... whichever no connected peer holds.
fn unique_username(name: &str, peers: &BTreeMap<UserId, PeerSession>) -> String {
    let taken = |candidate: &str| peers.values().any(|p| p.identity.username == candidate);
    if !taken(name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

fn lowest_free(used: &BTreeSet<i32>) -> i32 {
    (0..).find(|n| !used.contains(n)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use rornet_protocol::{FrameReader, ReadOutcome, StreamType, TruckStreamData, Vec3};

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn registry(max_players: usize) -> Registry {
        Registry::new(RegistryLimits {
            max_players,
            max_streams_per_peer: 3,
        })
    }

    struct TestPeer {
        id: UserId,
        reader: FrameReader<TcpStream>,
    }

    impl TestPeer {
        fn recv(&mut self) -> Frame {
            match self.reader.next_frame_timeout(Duration::from_secs(5)).unwrap() {
                ReadOutcome::Frame(frame) => frame,
                other => panic!("expected frame, got {other:?}"),
            }
        }

        /// Read frames until one with `command` arrives.
        fn recv_command(&mut self, command: MessageType) -> Frame {
            loop {
                let frame = self.recv();
                if frame.command == command {
                    return frame;
                }
            }
        }

        /// True if nothing arrives within a short window.
        fn is_quiet(&mut self) -> bool {
            matches!(
                self.reader.next_frame_timeout(Duration::from_millis(150)).unwrap(),
                ReadOutcome::Timeout
            )
        }
    }

    /// Admit a peer and consume its WELCOME and own USER_JOIN.
    fn join(registry: &Registry, name: &str) -> TestPeer {
        let (client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = server.peer_addr().unwrap();
        let identity = registry.add_peer(UserInfo::named(name), server, addr).unwrap();
        let mut peer = TestPeer {
            id: identity.unique_id,
            reader: FrameReader::new(client),
        };
        assert_eq!(peer.recv().command, MessageType::Welcome);
        assert_eq!(peer.recv().command, MessageType::UserJoin);
        peer
    }

    fn chat(source: UserId, text: &str) -> Frame {
        Frame::new(MessageType::UtfChat, source, StreamId(11), text.as_bytes().to_vec())
    }

    #[test]
    fn add_peer_assigns_identity_and_welcomes() {
        let registry = registry(4);
        let (client, server) = tcp_pair();
        let addr = server.peer_addr().unwrap();
        let identity = UserInfo {
            user_token: "tok".into(),
            ..UserInfo::named("Alice")
        };
        let assigned = registry.add_peer(identity, server, addr).unwrap();
        assert_eq!(assigned.unique_id, UserId(1));
        assert_eq!(assigned.slot_num, 0);
        assert_eq!(assigned.colour_num, 0);

        let mut reader = FrameReader::new(client);
        let ReadOutcome::Frame(welcome) = reader.next_frame().unwrap() else {
            panic!("expected WELCOME");
        };
        assert_eq!(welcome.command, MessageType::Welcome);
        let info = UserInfo::decode(&welcome.payload).unwrap();
        assert_eq!(info.unique_id, UserId(1));
        assert_eq!(info.username, "Alice");
        assert!(info.user_token.is_empty());
    }

    #[test]
    fn ids_slots_and_names() {
        let registry = registry(4);
        let a = join(&registry, "Bot");
        let b = join(&registry, "Bot");
        let c = join(&registry, "Bot");
        assert_eq!((a.id, b.id, c.id), (UserId(1), UserId(2), UserId(3)));
        assert_eq!(registry.identity(b.id).username, "Bot_2");
        assert_eq!(registry.identity(c.id).username, "Bot_3");

        // Slot 1 frees up; the next peer takes it, but ids keep climbing.
        registry.remove_peer(b.id, "bye");
        let d = join(&registry, "Dan");
        assert_eq!(d.id, UserId(4));
        assert_eq!(registry.identity(d.id).slot_num, 1);
        assert_eq!(registry.identity(d.id).colour_num, 1);
    }

    #[test]
    fn full_registry_rejects() {
        let registry = registry(1);
        let _a = join(&registry, "Alice");
        let (_client, server) = tcp_pair();
        let addr = server.peer_addr().unwrap();
        let result = registry.add_peer(UserInfo::named("Bob"), server, addr);
        assert_eq!(result.unwrap_err(), RejectReason::Full);
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn join_is_announced_to_existing_peers() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        let frame = a.recv();
        assert_eq!(frame.command, MessageType::UserJoin);
        assert_eq!(frame.source, b.id);
        assert_eq!(UserInfo::decode(&frame.payload).unwrap().username, "Bob");
    }

    #[test]
    fn broadcast_others_excludes_source() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        let delivered = registry.broadcast(&chat(a.id, "hi"), Audience::Others(a.id));
        assert_eq!(delivered, 1);
        assert_eq!(b.recv().text(), "hi");
        assert!(a.is_quiet());
    }

    #[test]
    fn broadcast_all_includes_source() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        assert_eq!(registry.broadcast(&chat(a.id, "all"), Audience::All), 2);
        assert_eq!(a.recv().text(), "all");
        assert_eq!(b.recv().text(), "all");
    }

    #[test]
    fn admins_audience() {
        let registry = registry(4);
        let (client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = server.peer_addr().unwrap();
        let admin = UserInfo {
            auth: AuthFlags::ADMIN,
            ..UserInfo::named("Op")
        };
        let op_id = registry.add_peer(admin, server, addr).unwrap().unique_id;
        let mut op = TestPeer {
            id: op_id,
            reader: FrameReader::new(client),
        };
        op.recv_command(MessageType::UserJoin);
        let mut user = join(&registry, "User");
        op.recv_command(MessageType::UserJoin);

        assert_eq!(registry.broadcast(&chat(user.id, "report"), Audience::AdminsExcept(user.id)), 1);
        assert_eq!(op.recv().text(), "report");
        assert!(user.is_quiet());
        assert_eq!(registry.broadcast(&chat(op.id, "self"), Audience::AdminsExcept(op.id)), 0);
    }

    #[test]
    fn suspended_flow_skips_peer() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        registry.set_flow(b.id, false);
        assert!(!registry.flow_enabled(b.id));
        let lagging = b.recv();
        assert_eq!(lagging.command, MessageType::NetQuality);
        assert_eq!(lagging.source, UserId::SERVER);
        assert_eq!(NetQuality::decode(&lagging.payload).unwrap(), NetQuality(1));
        assert_eq!(registry.broadcast(&chat(a.id, "quiet"), Audience::Others(a.id)), 0);
        assert!(b.is_quiet());

        // No change, no report.
        registry.set_flow(b.id, false);
        assert!(b.is_quiet());

        registry.set_flow(b.id, true);
        let recovered = b.recv();
        assert_eq!(NetQuality::decode(&recovered.payload).unwrap(), NetQuality(0));
        assert_eq!(registry.broadcast(&chat(a.id, "loud"), Audience::Others(a.id)), 1);
        assert_eq!(b.recv().text(), "loud");
        assert!(a.is_quiet());
    }

    #[test]
    fn remove_peer_notifies_only_remaining() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        let removed = registry.remove_peer(b.id, "kicked").unwrap();
        assert_eq!(removed.identity.username, "Bob");
        let leave = a.recv();
        assert_eq!(leave.command, MessageType::UserLeave);
        assert_eq!(leave.source, b.id);
        assert_eq!(leave.text(), "kicked");
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.remove_peer(b.id, "again").is_none());
        assert_eq!(registry.global_stats().connect_durations.len(), 1);
    }

    #[test]
    fn dead_socket_is_removed_on_broadcast() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);
        drop(b.reader);

        // The first writes after the peer closes may still succeed; keep
        // broadcasting until the failure is noticed.
        for _ in 0..50 {
            registry.broadcast(&chat(a.id, "ping"), Audience::Others(a.id));
            if registry.peer_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(registry.peer_count(), 1);
        let leave = a.recv_command(MessageType::UserLeave);
        assert_eq!(leave.source, b.id);
    }

    #[test]
    fn stream_register_and_limit() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        let reg = StreamRegistration::new(StreamType::Truck, "agoras.truck", Vec::new());
        assert!(registry.register_stream(b.id, StreamId(10), &reg));
        let announce = a.recv();
        assert_eq!(announce.command, MessageType::StreamRegister);
        assert_eq!(announce.source, b.id);
        assert_eq!(announce.stream_id, StreamId(10));
        let decoded = StreamRegistration::decode(&announce.payload).unwrap();
        assert_eq!(decoded.origin_source, b.id);
        assert_eq!(decoded.name, "agoras.truck");

        assert!(registry.register_stream(b.id, StreamId(11), &reg));
        assert!(registry.register_stream(b.id, StreamId(12), &reg));
        assert!(!registry.register_stream(b.id, StreamId(13), &reg));
        assert_eq!(registry.stream_count(b.id), 3);
    }

    #[test]
    fn stream_data_syncs_then_relays() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        let truck = StreamRegistration {
            buffer_size: TruckStreamData::MIN_BUFFER_SIZE,
            ..StreamRegistration::new(StreamType::Truck, "agoras.truck", Vec::new())
        };
        assert!(registry.register_stream(a.id, StreamId(10), &truck));
        b.recv_command(MessageType::StreamRegister);
        assert!(registry.register_stream(b.id, StreamId(10), &truck));
        a.recv_command(MessageType::StreamRegister);

        // Bob's first data: he gets Alice's identity and streams first.
        let data = Frame::new(
            MessageType::StreamData,
            b.id,
            StreamId(10),
            TruckStreamData::at(Vec3::new(1.0, 0.0, 0.0)).encode(),
        );
        assert!(registry.apply_stream_data(&data));
        let info = b.recv();
        assert_eq!(info.command, MessageType::UserInfo);
        assert_eq!(info.source, a.id);
        let reg = b.recv();
        assert_eq!(reg.command, MessageType::StreamRegister);
        assert_eq!(reg.source, a.id);

        assert_eq!(a.recv(), data);
        assert_eq!(registry.peer_stats(b.id).unwrap().distance_driven, 1.0);

        // Second data: no sync, just relay.
        assert!(registry.apply_stream_data(&data));
        assert_eq!(a.recv(), data);
        assert!(b.is_quiet());
    }

    #[test]
    fn truck_data_of_wrong_length_is_dropped() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);
        let truck = StreamRegistration {
            buffer_size: 52,
            ..StreamRegistration::new(StreamType::Truck, "agoras.truck", Vec::new())
        };
        assert!(registry.register_stream(b.id, StreamId(10), &truck));
        a.recv_command(MessageType::StreamRegister);

        let short = Frame::new(
            MessageType::StreamData,
            b.id,
            StreamId(10),
            TruckStreamData::at(Vec3::new(1.0, 0.0, 0.0)).encode(),
        );
        assert!(!registry.apply_stream_data(&short));
        assert!(a.is_quiet());
        assert_eq!(registry.peer_stats(b.id).unwrap().distance_driven, 0.0);

        let full = TruckStreamData {
            node_data: vec![0; 40],
            ..TruckStreamData::at(Vec3::new(1.0, 0.0, 0.0))
        };
        let frame = Frame::new(MessageType::StreamData, b.id, StreamId(10), full.encode());
        assert!(registry.apply_stream_data(&frame));
        assert_eq!(a.recv_command(MessageType::StreamData), frame);
    }

    #[test]
    fn identity_update_keeps_assigned_fields() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);

        let update = UserInfo {
            unique_id: UserId(77),
            username: "Admin".into(),
            language: "de_DE".into(),
            client_version: "2022.12".into(),
            auth: AuthFlags::ADMIN,
            slot_num: 9,
            user_token: "secret".into(),
            ..UserInfo::default()
        };
        assert!(registry.update_identity(b.id, &update));

        let b_id = b.id;
        for peer in [&mut a, &mut b] {
            let info = peer.recv_command(MessageType::UserInfo);
            assert_eq!(info.source, b_id);
            let info = UserInfo::decode(&info.payload).unwrap();
            assert_eq!(info.unique_id, b_id);
            assert_eq!(info.username, "Bob");
            assert_eq!(info.language, "de_DE");
            assert_eq!(info.client_version, "2022.12");
            assert_eq!(info.auth, AuthFlags::NONE);
            assert_eq!(info.slot_num, 1);
            assert!(info.user_token.is_empty());
        }
        assert_eq!(registry.identity(b.id).language, "de_DE");
        assert!(!registry.update_identity(UserId(77), &update));
    }

    #[test]
    fn data_for_unknown_stream_is_dropped() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let b = join(&registry, "Bob");
        a.recv_command(MessageType::UserJoin);
        let data = Frame::new(MessageType::StreamData, b.id, StreamId(44), vec![0; 28]);
        assert!(!registry.apply_stream_data(&data));
        assert!(a.is_quiet());
    }

    #[test]
    fn unregister_is_broadcast_to_all() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let reg = StreamRegistration::new(StreamType::Truck, "agoras.truck", Vec::new());
        assert!(registry.register_stream(a.id, StreamId(10), &reg));
        assert!(registry.unregister_stream(a.id, StreamId(10)));
        let notice = a.recv();
        assert_eq!(notice.command, MessageType::StreamUnregister);
        assert_eq!(notice.stream_id, StreamId(10));
        assert!(!registry.unregister_stream(a.id, StreamId(10)));
    }

    #[test]
    fn private_chat_and_register_result_reach_target_only() {
        let registry = registry(4);
        let mut a = join(&registry, "Alice");
        let mut b = join(&registry, "Bob");
        let mut c = join(&registry, "Carol");
        a.recv_command(MessageType::UserJoin);
        a.recv_command(MessageType::UserJoin);
        b.recv_command(MessageType::UserJoin);

        let whisper = PrivateChat {
            target: c.id,
            text: "psst".into(),
        };
        let frame = Frame::new(MessageType::UtfPrivateChat, a.id, StreamId(11), whisper.encode());
        assert!(registry.send_private_chat(a.id, &frame));
        let got = c.recv();
        assert_eq!(got.source, a.id);
        assert_eq!(got.payload, b"psst".to_vec());

        let result = StreamRegistration {
            status: StreamRegistration::STATUS_SUCCESS,
            origin_source: a.id,
            origin_stream: StreamId(10),
            ..StreamRegistration::new(StreamType::Truck, "agoras.truck", Vec::new())
        };
        let frame = Frame::new(MessageType::StreamRegisterResult, b.id, StreamId(10), result.encode());
        assert!(registry.forward_register_result(b.id, &frame));
        let got = a.recv();
        assert_eq!(got.command, MessageType::StreamRegisterResult);
        assert_eq!(got.source, b.id);

        assert!(b.is_quiet());
        assert!(c.is_quiet());
    }

    #[test]
    fn helpers() {
        let mut used = BTreeSet::from([0, 1, 3]);
        assert_eq!(lowest_free(&used), 2);
        used.insert(2);
        assert_eq!(lowest_free(&used), 4);
        assert_eq!(lowest_free(&BTreeSet::new()), 0);
    }
}
