// Per-peer logical stream table.
//
// RoRnet multiplexes several independent channels over one connection: each
// peer owns a Character stream (its avatar), a Chat stream, and any number
// of Truck/AI streams for the vehicles it spawns. Streams are keyed by
// `(owner, stream id)`; ids are chosen by the owner and only unique per
// owner.
//
// `StreamRegistry` is used on both sides of the wire. A client keeps one to
// know who is online and where their avatars and vehicles are; the server's
// `Registry` keeps one behind its lock for stats and for replaying stream
// registrations to peers that join later.
//
// Each peer also has a "current stream" pointer: the stream its camera and
// stats follow. It points at the own character stream normally and at a
// vehicle while the character is attached to one. Switching away from the
// own character parks the avatar at the origin.
//
// Lookups of unknown peers or streams return defaults; the registry never
// fails on a miss, since frames for streams that were just removed are
// routine on a live session.

use std::collections::BTreeMap;
use std::time::Instant;

use rornet_protocol::{
    AuthFlags, CharacterPacket, StreamId, StreamRegistration, StreamType, TruckStreamData,
    UserId, UserInfo, Vec3, Vec4,
};
use tracing::debug;

use crate::stats::{self, GlobalStats, PeerStats};

/// One registered stream and its last known state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stream {
    pub owner: UserId,
    pub id: StreamId,
    pub kind: StreamType,
    pub name: String,
    /// Lower-cased suffix after the last '.', or the whole lower-cased name.
    pub file_extension: String,
    pub status: i32,
    pub buffer_size: i32,
    pub last_position: Vec3,
    pub last_rotation: Vec4,
    pub setup_data: Vec<u8>,
}

impl Stream {
    pub fn from_registration(owner: UserId, id: StreamId, reg: &StreamRegistration) -> Self {
        Self {
            owner,
            id,
            kind: reg.kind,
            name: reg.name.clone(),
            file_extension: file_extension(&reg.name),
            status: reg.status,
            buffer_size: reg.buffer_size,
            last_position: Vec3::ORIGIN,
            last_rotation: Vec4::default(),
            setup_data: reg.data.clone(),
        }
    }

    /// Registration payload announcing this stream to another peer.
    pub fn registration(&self) -> StreamRegistration {
        StreamRegistration {
            name: self.name.clone(),
            kind: self.kind,
            status: self.status,
            origin_source: self.owner,
            origin_stream: self.id,
            buffer_size: self.buffer_size,
            data: self.setup_data.clone(),
        }
    }
}

pub fn file_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => name.to_lowercase(),
    }
}

/// What a STREAM_DATA frame changed.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamUpdate {
    CharacterMoved {
        owner: UserId,
        stream: StreamId,
        position: Vec3,
        rotation: Vec4,
        animation: String,
    },
    /// Character got into a vehicle.
    Attached {
        owner: UserId,
        target_owner: UserId,
        target_stream: StreamId,
    },
    /// Character got out and is embodied in its own avatar again.
    Detached { owner: UserId },
    VehicleMoved {
        owner: UserId,
        stream: StreamId,
        position: Vec3,
    },
}

struct PeerEntry {
    identity: UserInfo,
    streams: BTreeMap<StreamId, Stream>,
    stats: PeerStats,
}

impl PeerEntry {
    fn new(identity: UserInfo, now: Instant) -> Self {
        Self {
            identity,
            streams: BTreeMap::new(),
            stats: PeerStats::new(now),
        }
    }
}

#[derive(Default)]
pub struct StreamRegistry {
    peers: BTreeMap<UserId, PeerEntry>,
    global: GlobalStats,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Peers ---------------------------------------------------------------

    /// Start tracking a peer. An already known peer is updated instead.
    pub fn add_peer(&mut self, identity: UserInfo) {
        let id = identity.unique_id;
        if self.peers.contains_key(&id) {
            self.update_peer(identity);
            return;
        }
        self.global.record_join(&identity.username);
        self.peers.insert(id, PeerEntry::new(identity, Instant::now()));
    }

    /// Sparse-merge a new identity into a known peer, or add it.
    pub fn update_peer(&mut self, identity: UserInfo) {
        match self.peers.get_mut(&identity.unique_id) {
            Some(entry) => {
                entry.identity = entry.identity.merged_with(&identity);
                if !identity.username.is_empty() {
                    self.global.usernames_seen.insert(identity.username);
                }
            }
            None => self.add_peer(identity),
        }
    }

    /// Forget a peer and all its streams, folding its stats into the totals.
    pub fn remove_peer(&mut self, id: UserId) -> Option<PeerStats> {
        let entry = self.peers.remove(&id)?;
        stats::fold_into(&entry.stats, &mut self.global, Instant::now());
        Some(entry.stats)
    }

    pub fn contains_peer(&self, id: UserId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn peer_ids(&self) -> Vec<UserId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn identity(&self, id: UserId) -> UserInfo {
        self.peers
            .get(&id)
            .map(|e| e.identity.clone())
            .unwrap_or_default()
    }

    pub fn username(&self, id: UserId) -> String {
        self.peers
            .get(&id)
            .map(|e| e.identity.username.clone())
            .unwrap_or_default()
    }

    pub fn auth(&self, id: UserId) -> AuthFlags {
        self.peers.get(&id).map_or(AuthFlags::NONE, |e| e.identity.auth)
    }

    pub fn online_since(&self, id: UserId) -> Option<Instant> {
        self.peers.get(&id).map(|e| e.stats.online_since)
    }

    pub fn peer_stats(&self, id: UserId) -> Option<PeerStats> {
        self.peers.get(&id).map(|e| e.stats.clone())
    }

    pub fn global_stats(&self) -> &GlobalStats {
        &self.global
    }

    // -- Streams -------------------------------------------------------------

    /// Store a stream under `owner`. Streams of peers that are not tracked
    /// are dropped; returns whether the stream was stored.
    pub fn register_stream(&mut self, owner: UserId, mut stream: Stream) -> bool {
        let Some(entry) = self.peers.get_mut(&owner) else {
            debug!(%owner, stream = %stream.id, "stream of unknown peer dropped");
            return false;
        };
        stream.owner = owner;
        stream.file_extension = file_extension(&stream.name);
        let id = stream.id;
        match stream.kind {
            StreamType::Character => {
                entry.stats.character_stream = Some(id);
                if entry.stats.current_stream.is_none() {
                    entry.stats.current_stream = Some((owner, id));
                }
            }
            StreamType::Chat => entry.stats.chat_stream = Some(id),
            StreamType::Truck | StreamType::Ai => {}
        }
        entry.streams.insert(id, stream);
        true
    }

    pub fn unregister_stream(&mut self, owner: UserId, id: StreamId) -> Option<Stream> {
        let entry = self.peers.get_mut(&owner)?;
        let stream = entry.streams.remove(&id)?;
        if entry.stats.character_stream == Some(id) {
            entry.stats.character_stream = None;
        }
        if entry.stats.chat_stream == Some(id) {
            entry.stats.chat_stream = None;
        }
        Some(stream)
    }

    pub fn stream(&self, owner: UserId, id: StreamId) -> Stream {
        self.stream_ref(owner, id).cloned().unwrap_or_default()
    }

    pub fn contains_stream(&self, owner: UserId, id: StreamId) -> bool {
        self.stream_ref(owner, id).is_some()
    }

    fn stream_ref(&self, owner: UserId, id: StreamId) -> Option<&Stream> {
        self.peers.get(&owner)?.streams.get(&id)
    }

    /// All streams of `owner`, in id order.
    pub fn streams_of(&self, owner: UserId) -> Vec<Stream> {
        self.peers
            .get(&owner)
            .map(|e| e.streams.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stream_count(&self, owner: UserId) -> usize {
        self.peers.get(&owner).map_or(0, |e| e.streams.len())
    }

    pub fn character_stream(&self, owner: UserId) -> StreamId {
        self.peers
            .get(&owner)
            .and_then(|e| e.stats.character_stream)
            .unwrap_or(StreamId::NONE)
    }

    pub fn chat_stream(&self, owner: UserId) -> StreamId {
        self.peers
            .get(&owner)
            .and_then(|e| e.stats.chat_stream)
            .unwrap_or(StreamId::NONE)
    }

    // -- Positions -----------------------------------------------------------

    /// Move a stream, crediting the step to its owner's stats.
    pub fn set_position(&mut self, owner: UserId, id: StreamId, position: Vec3) {
        if let Some(entry) = self.peers.get_mut(&owner)
            && let Some(stream) = entry.streams.get_mut(&id)
        {
            stats::record_position(&mut entry.stats, stream, position);
        }
    }

    pub fn set_rotation(&mut self, owner: UserId, id: StreamId, rotation: Vec4) {
        if let Some(stream) = self
            .peers
            .get_mut(&owner)
            .and_then(|e| e.streams.get_mut(&id))
        {
            stream.last_rotation = rotation;
        }
    }

    /// Last position of a stream; `None` means the owner's current stream.
    pub fn position(&self, owner: UserId, id: Option<StreamId>) -> Vec3 {
        match id {
            Some(id) => self.stream(owner, id).last_position,
            None => self.current_stream(owner).last_position,
        }
    }

    pub fn rotation(&self, owner: UserId, id: Option<StreamId>) -> Vec4 {
        match id {
            Some(id) => self.stream(owner, id).last_rotation,
            None => self.current_stream(owner).last_rotation,
        }
    }

    // -- Embodiment ----------------------------------------------------------

    /// Point `person` at another stream (a vehicle, or back at its own
    /// character). Ignored unless both the person and the target exist.
    /// Leaving the own character parks the avatar at the origin.
    pub fn set_current_stream(
        &mut self,
        person: UserId,
        target_owner: UserId,
        target_stream: StreamId,
    ) -> bool {
        if !self.peers.contains_key(&person) || !self.contains_stream(target_owner, target_stream)
        {
            return false;
        }
        let character = self.character_stream(person);
        if let Some(entry) = self.peers.get_mut(&person) {
            entry.stats.current_stream = Some((target_owner, target_stream));
        }
        if target_owner != person || target_stream != character {
            self.set_position(person, character, Vec3::ORIGIN);
        }
        true
    }

    /// The stream `person` is embodied in; default if the pointer dangles.
    pub fn current_stream(&self, person: UserId) -> Stream {
        self.peers
            .get(&person)
            .and_then(|e| e.stats.current_stream)
            .map(|(owner, id)| self.stream(owner, id))
            .unwrap_or_default()
    }

    pub fn current_stream_id(&self, person: UserId) -> Option<(UserId, StreamId)> {
        self.peers.get(&person).and_then(|e| e.stats.current_stream)
    }

    // -- Stream data ---------------------------------------------------------

    /// Interpret a STREAM_DATA payload and update the stream it belongs to.
    /// Data on unknown streams, on chat/AI streams, or that fails to decode
    /// changes nothing.
    pub fn apply_stream_data(
        &mut self,
        owner: UserId,
        id: StreamId,
        payload: &[u8],
    ) -> Option<StreamUpdate> {
        let kind = self.stream_ref(owner, id)?.kind;
        match kind {
            StreamType::Character => match CharacterPacket::decode(payload) {
                Ok(CharacterPacket::Position(p)) => {
                    // Walking means the character is its own body again.
                    self.set_current_stream(owner, owner, id);
                    self.set_position(owner, id, p.position);
                    self.set_rotation(owner, id, p.rotation);
                    Some(StreamUpdate::CharacterMoved {
                        owner,
                        stream: id,
                        position: p.position,
                        rotation: p.rotation,
                        animation: p.animation_mode,
                    })
                }
                Ok(CharacterPacket::Attach(a)) if a.enabled => {
                    self.set_current_stream(owner, a.source, a.stream)
                        .then_some(StreamUpdate::Attached {
                            owner,
                            target_owner: a.source,
                            target_stream: a.stream,
                        })
                }
                Ok(CharacterPacket::Attach(_)) => {
                    let own = self.character_stream(owner);
                    self.set_current_stream(owner, owner, own)
                        .then_some(StreamUpdate::Detached { owner })
                }
                Err(e) => {
                    debug!(%owner, stream = %id, error = %e, "undecodable character data");
                    None
                }
            },
            StreamType::Truck => match TruckStreamData::decode(payload) {
                Ok(data) => {
                    self.set_position(owner, id, data.ref_position);
                    Some(StreamUpdate::VehicleMoved {
                        owner,
                        stream: id,
                        position: data.ref_position,
                    })
                }
                Err(e) => {
                    debug!(%owner, stream = %id, error = %e, "undecodable truck data");
                    None
                }
            },
            StreamType::Ai | StreamType::Chat => None,
        }
    }
}
