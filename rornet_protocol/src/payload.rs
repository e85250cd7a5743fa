// Fixed-width payload layouts of the RoRnet_2.37 revision.
//
// Every structured payload is a packed C struct: little-endian scalars,
// NUL-padded character arrays of fixed width, and explicit padding bytes
// where the C compiler would align the next 4-byte field. Each type here has
// a `SIZE` constant, an `encode` producing exactly that many bytes, and a
// `decode` that rejects short input with `ProtocolError::Truncated`. Extra
// trailing bytes are ignored so that slightly larger structs from newer
// clients still decode.
//
// Strings are written truncated to `width - 1` bytes (on a char boundary) so
// the field always carries a terminator, and are read up to the first NUL
// with lossy UTF-8 conversion.
//
// `UserInfo::merged_with` implements the sparse identity update: only fields
// that differ from a freshly-constructed `UserInfo` overwrite the current
// value. Credential fields are never taken from an update.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{AuthFlags, StreamId, StreamType, UserId, Vec3, Vec4};

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

struct FieldWriter {
    out: Vec<u8>,
}

impl FieldWriter {
    fn with_capacity(size: usize) -> Self {
        Self {
            out: Vec::with_capacity(size),
        }
    }

    fn str(&mut self, value: &str, width: usize) {
        let mut end = value.len().min(width.saturating_sub(1));
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.out.extend_from_slice(&value.as_bytes()[..end]);
        self.pad(width - end);
    }

    fn bytes(&mut self, value: &[u8], width: usize) {
        let end = value.len().min(width);
        self.out.extend_from_slice(&value[..end]);
        self.pad(width - end);
    }

    fn pad(&mut self, n: usize) {
        self.out.resize(self.out.len() + n, 0);
    }

    fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    fn i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Fails unless `bytes` holds at least `size` bytes.
    fn new(bytes: &'a [u8], size: usize, what: &'static str) -> Result<Self> {
        if bytes.len() < size {
            return Err(ProtocolError::Truncated {
                what,
                expected: size,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes, pos: 0 })
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    fn word(&mut self) -> [u8; 4] {
        let w = self.take(4);
        [w[0], w[1], w[2], w[3]]
    }

    fn str(&mut self, width: usize) -> String {
        nul_terminated(self.take(width))
    }

    fn bytes(&mut self, width: usize) -> Vec<u8> {
        let field = self.take(width);
        let end = field.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        field[..end].to_vec()
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.word())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.word())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.word())
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// Text up to the first NUL, lossily decoded.
pub fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_i32_at(bytes: &[u8], offset: usize) -> Option<i32> {
    bytes
        .get(offset..offset + 4)
        .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

// ---------------------------------------------------------------------------
// ServerInfo
// ---------------------------------------------------------------------------

/// Server settings sent in the server's HELLO reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub protocol_version: String,
    pub terrain: String,
    pub server_name: String,
    pub has_password: bool,
    /// Message of the day.
    pub info: String,
}

impl ServerInfo {
    pub const SIZE: usize = 20 + 128 + 128 + 1 + 4096;

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(Self::SIZE);
        w.str(&self.protocol_version, 20);
        w.str(&self.terrain, 128);
        w.str(&self.server_name.replace(' ', "%20"), 128);
        w.u8(u8::from(self.has_password));
        w.str(&self.info, 4096);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, Self::SIZE, "server info")?;
        Ok(Self {
            protocol_version: r.str(20),
            terrain: r.str(128),
            server_name: r.str(128).replace("%20", " "),
            has_password: r.u8() != 0,
            info: r.str(4096),
        })
    }

    /// Overlay the non-empty fields of `update` onto a copy of `self`.
    pub fn merged_with(&self, update: &ServerInfo) -> ServerInfo {
        let pick = |current: &String, new: &String| {
            if new.is_empty() {
                current.clone()
            } else {
                new.clone()
            }
        };
        ServerInfo {
            protocol_version: pick(&self.protocol_version, &update.protocol_version),
            terrain: pick(&self.terrain, &update.terrain),
            server_name: pick(&self.server_name, &update.server_name),
            has_password: update.has_password,
            info: pick(&self.info, &update.info),
        }
    }
}

// ---------------------------------------------------------------------------
// UserInfo
// ---------------------------------------------------------------------------

/// Peer identity, exchanged in USER_INFO, WELCOME and USER_JOIN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub unique_id: UserId,
    pub username: String,
    pub user_token: String,
    pub server_password: String,
    pub language: String,
    pub client_name: String,
    pub client_version: String,
    pub client_guid: String,
    pub session_type: String,
    pub session_options: String,
    pub auth: AuthFlags,
    pub slot_num: i32,
    pub colour_num: i32,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            unique_id: UserId(0),
            username: String::new(),
            user_token: String::new(),
            server_password: String::new(),
            language: String::new(),
            client_name: String::new(),
            client_version: String::new(),
            client_guid: String::new(),
            session_type: String::new(),
            session_options: String::new(),
            auth: AuthFlags::NONE,
            slot_num: -1,
            colour_num: -1,
        }
    }
}

impl UserInfo {
    pub const SIZE: usize = 360;

    pub fn named(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(Self::SIZE);
        w.u32(self.unique_id.0 as u32);
        w.str(&self.username, 40);
        w.str(&self.user_token, 40);
        w.str(&self.server_password, 40);
        w.str(&self.language, 10);
        w.str(&self.client_name, 10);
        w.str(&self.client_version, 25);
        w.str(&self.client_guid, 40);
        w.str(&self.session_type, 10);
        w.str(&self.session_options, 128);
        w.pad(1);
        w.i32(self.auth.0 as i32);
        w.i32(self.slot_num);
        w.i32(self.colour_num);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, Self::SIZE, "user info")?;
        let unique_id = UserId(r.u32() as i32);
        let username = r.str(40);
        let user_token = r.str(40);
        let server_password = r.str(40);
        let language = r.str(10);
        let client_name = r.str(10);
        let client_version = r.str(25);
        let client_guid = r.str(40);
        let session_type = r.str(10);
        let session_options = r.str(128);
        r.skip(1);
        Ok(Self {
            unique_id,
            username,
            user_token,
            server_password,
            language,
            client_name,
            client_version,
            client_guid,
            session_type,
            session_options,
            auth: AuthFlags(r.i32() as u32),
            slot_num: r.i32(),
            colour_num: r.i32(),
        })
    }

    /// Sparse update: fields of `update` that still hold their default value
    /// leave the current value alone. Token, password and GUID are kept.
    pub fn merged_with(&self, update: &UserInfo) -> UserInfo {
        let blank = UserInfo::default();
        let mut merged = self.clone();
        if update.unique_id != blank.unique_id {
            merged.unique_id = update.unique_id;
        }
        for (dst, src) in [
            (&mut merged.username, &update.username),
            (&mut merged.language, &update.language),
            (&mut merged.client_name, &update.client_name),
            (&mut merged.client_version, &update.client_version),
            (&mut merged.session_type, &update.session_type),
            (&mut merged.session_options, &update.session_options),
        ] {
            if !src.is_empty() {
                dst.clone_from(src);
            }
        }
        if update.auth != blank.auth {
            merged.auth = update.auth;
        }
        if update.slot_num != blank.slot_num {
            merged.slot_num = update.slot_num;
        }
        if update.colour_num != blank.colour_num {
            merged.colour_num = update.colour_num;
        }
        merged
    }

    /// Copy safe to relay to other peers: token, password and GUID blanked.
    pub fn without_credentials(&self) -> UserInfo {
        UserInfo {
            user_token: String::new(),
            server_password: String::new(),
            client_guid: String::new(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// StreamRegistration
// ---------------------------------------------------------------------------

/// Announces a new logical stream (STREAM_REGISTER) or answers one
/// (STREAM_REGISTER_RESULT, with `status` set by the receiver).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRegistration {
    /// Resource file name, e.g. `"agoras.truck"`, or `"default"`/`"chat"`.
    pub name: String,
    pub kind: StreamType,
    pub status: i32,
    pub origin_source: UserId,
    pub origin_stream: StreamId,
    /// Truck layout only.
    pub buffer_size: i32,
    /// Setup data with trailing NUL padding removed.
    pub data: Vec<u8>,
}

impl StreamRegistration {
    pub const GENERIC_SIZE: usize = 128 + 4 * 4 + 8000;
    pub const TRUCK_SIZE: usize = 128 + 5 * 4 + 600;
    const TYPE_OFFSET: usize = 128;

    pub const STATUS_SUCCESS: i32 = 1;
    pub const STATUS_FAILED: i32 = -1;

    pub fn new(kind: StreamType, name: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            data,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let truck = self.kind == StreamType::Truck;
        let size = if truck {
            Self::TRUCK_SIZE
        } else {
            Self::GENERIC_SIZE
        };
        let mut w = FieldWriter::with_capacity(size);
        w.str(&self.name, 128);
        w.i32(self.kind.to_wire());
        w.i32(self.status);
        w.i32(self.origin_source.0);
        w.i32(self.origin_stream.0);
        if truck {
            w.i32(self.buffer_size);
            w.bytes(&self.data, 600);
        } else {
            w.bytes(&self.data, 8000);
        }
        w.finish()
    }

    /// Truck registrations shorter than the generic layout use the truck
    /// layout; everything else uses the generic one.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw_type =
            read_i32_at(bytes, Self::TYPE_OFFSET).ok_or(ProtocolError::Truncated {
                what: "stream registration",
                expected: Self::TYPE_OFFSET + 4,
                actual: bytes.len(),
            })?;
        let kind = StreamType::from_wire(raw_type).ok_or(ProtocolError::UnknownStreamType(raw_type))?;
        let truck = kind == StreamType::Truck && bytes.len() < Self::GENERIC_SIZE;
        let size = if truck {
            Self::TRUCK_SIZE
        } else {
            Self::GENERIC_SIZE
        };
        let mut r = FieldReader::new(bytes, size, "stream registration")?;
        let name = r.str(128);
        r.skip(4);
        let status = r.i32();
        let origin_source = UserId(r.i32());
        let origin_stream = StreamId(r.i32());
        let (buffer_size, data) = if truck {
            (r.i32(), r.bytes(600))
        } else {
            (0, r.bytes(8000))
        };
        Ok(Self {
            name,
            kind,
            status,
            origin_source,
            origin_stream,
            buffer_size,
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// Character stream data
// ---------------------------------------------------------------------------

/// Animation used for a character standing still.
pub const IDLE_ANIMATION: &str = "Idle_sway";

const CHARACTER_CMD_POSITION: i32 = 0;
const CHARACTER_CMD_ATTACH: i32 = 1;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CharacterPosition {
    pub position: Vec3,
    pub rotation: Vec4,
    pub animation_mode: String,
    pub animation_time: f32,
}

impl CharacterPosition {
    pub const SIZE: usize = 4 + 7 * 4 + 255 + 1 + 4;

    /// Standing at `position` with the idle animation.
    pub fn idle(position: Vec3) -> Self {
        Self {
            position,
            rotation: Vec4::default(),
            animation_mode: IDLE_ANIMATION.to_string(),
            animation_time: 0.0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(Self::SIZE);
        w.i32(CHARACTER_CMD_POSITION);
        w.f32(self.position.x);
        w.f32(self.position.z);
        w.f32(self.position.y);
        w.f32(self.rotation.x);
        w.f32(self.rotation.y);
        w.f32(self.rotation.z);
        w.f32(self.rotation.w);
        w.str(&self.animation_mode, 255);
        w.pad(1);
        w.f32(self.animation_time);
        w.finish()
    }

    fn decode_body(r: &mut FieldReader<'_>) -> Self {
        let x = r.f32();
        let z = r.f32();
        let y = r.f32();
        let rotation = Vec4::new(r.f32(), r.f32(), r.f32(), r.f32());
        let animation_mode = r.str(255);
        r.skip(1);
        Self {
            position: Vec3::new(x, y, z),
            rotation,
            animation_mode,
            animation_time: r.f32(),
        }
    }
}

/// Character getting into (or out of) a vehicle stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CharacterAttach {
    pub enabled: bool,
    pub source: UserId,
    pub stream: StreamId,
    /// Seat index inside the vehicle.
    pub position: i32,
}

impl CharacterAttach {
    pub const SIZE: usize = 4 + 1 + 3 + 4 + 4 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(Self::SIZE);
        w.i32(CHARACTER_CMD_ATTACH);
        w.u8(u8::from(self.enabled));
        w.pad(3);
        w.i32(self.source.0);
        w.i32(self.stream.0);
        w.i32(self.position);
        w.finish()
    }

    fn decode_body(r: &mut FieldReader<'_>) -> Self {
        let enabled = r.u8() != 0;
        r.skip(3);
        Self {
            enabled,
            source: UserId(r.i32()),
            stream: StreamId(r.i32()),
            position: r.i32(),
        }
    }
}

/// Payload of STREAM_DATA on a Character stream.
#[derive(Clone, Debug, PartialEq)]
pub enum CharacterPacket {
    Position(CharacterPosition),
    Attach(CharacterAttach),
}

impl CharacterPacket {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            CharacterPacket::Position(p) => p.encode(),
            CharacterPacket::Attach(a) => a.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let command = read_i32_at(bytes, 0).ok_or(ProtocolError::Truncated {
            what: "character command",
            expected: 4,
            actual: bytes.len(),
        })?;
        match command {
            CHARACTER_CMD_POSITION => {
                let mut r = FieldReader::new(bytes, CharacterPosition::SIZE, "character position")?;
                r.skip(4);
                Ok(CharacterPacket::Position(CharacterPosition::decode_body(&mut r)))
            }
            CHARACTER_CMD_ATTACH => {
                let mut r = FieldReader::new(bytes, CharacterAttach::SIZE, "character attach")?;
                r.skip(4);
                Ok(CharacterPacket::Attach(CharacterAttach::decode_body(&mut r)))
            }
            other => Err(ProtocolError::UnknownCharacterCommand(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Truck stream data
// ---------------------------------------------------------------------------

/// Payload of STREAM_DATA on a Truck stream: a fixed header followed by
/// compressed node positions the engine does not interpret.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TruckStreamData {
    /// Sender's simulation time in milliseconds.
    pub time: i32,
    pub engine_speed: f32,
    pub engine_force: f32,
    pub flag_mask: u32,
    pub ref_position: Vec3,
    pub node_data: Vec<u8>,
}

impl TruckStreamData {
    pub const HEADER_SIZE: usize = Self::OOB_SIZE + 3 * 4;

    /// Time, engine speed, engine force and flag mask. Everything after it
    /// is the node buffer whose size the stream registered.
    pub const OOB_SIZE: usize = 16;

    /// Node buffer holding only the reference position.
    pub const MIN_BUFFER_SIZE: i32 = (Self::HEADER_SIZE - Self::OOB_SIZE) as i32;

    /// Node buffer size this packet needs registered.
    pub fn buffer_size(&self) -> i32 {
        Self::MIN_BUFFER_SIZE + self.node_data.len() as i32
    }

    /// A truck packet must be exactly the registered node buffer plus the
    /// out-of-band header.
    pub fn check_len(bytes: &[u8], buffer_size: i32) -> Result<()> {
        let expected = usize::try_from(buffer_size)
            .ok()
            .map(|size| size + Self::OOB_SIZE);
        if expected == Some(bytes.len()) {
            Ok(())
        } else {
            Err(ProtocolError::BadLength {
                what: "truck stream data",
                actual: bytes.len(),
            })
        }
    }

    pub fn at(position: Vec3) -> Self {
        Self {
            ref_position: position,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::with_capacity(Self::HEADER_SIZE + self.node_data.len());
        w.i32(self.time);
        w.f32(self.engine_speed);
        w.f32(self.engine_force);
        w.u32(self.flag_mask);
        w.f32(self.ref_position.x);
        w.f32(self.ref_position.z);
        w.f32(self.ref_position.y);
        let mut out = w.finish();
        out.extend_from_slice(&self.node_data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, Self::HEADER_SIZE, "truck stream data")?;
        let time = r.i32();
        let engine_speed = r.f32();
        let engine_force = r.f32();
        let flag_mask = r.u32();
        let x = r.f32();
        let z = r.f32();
        let y = r.f32();
        Ok(Self {
            time,
            engine_speed,
            engine_force,
            flag_mask,
            ref_position: Vec3::new(x, y, z),
            node_data: r.rest().to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Small payloads
// ---------------------------------------------------------------------------

/// NETQUALITY payload: 0 good, 1 lagging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetQuality(pub u32);

impl NetQuality {
    pub const SIZE: usize = 4;

    pub fn encode(self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, Self::SIZE, "net quality")?;
        Ok(NetQuality(r.u32()))
    }
}

/// UTF_PRIVCHAT payload as a peer sends it: target peer id followed by the
/// message text. The server strips the target before delivery, so inbound
/// private chat is plain text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateChat {
    pub target: UserId,
    pub text: String,
}

impl PrivateChat {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.text.len());
        out.extend_from_slice(&(self.target.0 as u32).to_le_bytes());
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(bytes, 4, "private chat")?;
        let target = UserId(r.u32() as i32);
        Ok(Self {
            target,
            text: nul_terminated(r.rest()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(ServerInfo::SIZE, 4373);
        assert_eq!(ServerInfo::default().encode().len(), 4373);
        assert_eq!(UserInfo::default().encode().len(), UserInfo::SIZE);
        assert_eq!(StreamRegistration::GENERIC_SIZE, 8144);
        assert_eq!(StreamRegistration::TRUCK_SIZE, 748);
        assert_eq!(CharacterPosition::SIZE, 292);
        assert_eq!(CharacterPosition::default().encode().len(), 292);
        assert_eq!(CharacterAttach::default().encode().len(), 20);
        assert_eq!(TruckStreamData::default().encode().len(), 28);
    }

    #[test]
    fn user_info_field_offsets() {
        let info = UserInfo {
            unique_id: UserId(3),
            username: "Bob".into(),
            auth: AuthFlags::BOT,
            slot_num: 2,
            colour_num: 5,
            ..UserInfo::default()
        };
        let bytes = info.encode();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..7], b"Bob");
        assert_eq!(bytes[7], 0);
        assert_eq!(&bytes[348..352], &8i32.to_le_bytes());
        assert_eq!(&bytes[352..356], &2i32.to_le_bytes());
        assert_eq!(&bytes[356..360], &5i32.to_le_bytes());
        assert_eq!(UserInfo::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn long_strings_keep_a_terminator() {
        let info = UserInfo::named(&"x".repeat(80));
        let decoded = UserInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.username.len(), 39);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 20 two-byte chars: the 39-byte cut lands mid-char.
        let info = UserInfo::named(&"é".repeat(20));
        let decoded = UserInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.username, "é".repeat(19));
    }

    #[test]
    fn short_user_info_is_truncated_error() {
        let err = UserInfo::decode(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 360,
                actual: 100,
                ..
            }
        ));
    }

    #[test]
    fn sparse_merge_only_takes_set_fields() {
        let current = UserInfo {
            unique_id: UserId(4),
            username: "Alice".into(),
            user_token: "secret".into(),
            language: "en_GB".into(),
            slot_num: 1,
            colour_num: 2,
            ..UserInfo::default()
        };
        let update = UserInfo {
            username: "Alicia".into(),
            user_token: "other".into(),
            colour_num: 7,
            ..UserInfo::default()
        };
        let merged = current.merged_with(&update);
        assert_eq!(merged.unique_id, UserId(4));
        assert_eq!(merged.username, "Alicia");
        assert_eq!(merged.language, "en_GB");
        assert_eq!(merged.user_token, "secret");
        assert_eq!(merged.slot_num, 1);
        assert_eq!(merged.colour_num, 7);
        // Pure: the original is untouched.
        assert_eq!(current.username, "Alice");
    }

    #[test]
    fn merge_with_default_is_identity() {
        let current = UserInfo {
            unique_id: UserId(9),
            username: "Carol".into(),
            auth: AuthFlags::ADMIN,
            ..UserInfo::default()
        };
        assert_eq!(current.merged_with(&UserInfo::default()), current);
    }

    #[test]
    fn credentials_are_blanked_for_relay() {
        let info = UserInfo {
            username: "Dan".into(),
            user_token: "t".into(),
            server_password: "p".into(),
            client_guid: "g".into(),
            ..UserInfo::default()
        };
        let public = info.without_credentials();
        assert_eq!(public.username, "Dan");
        assert!(public.user_token.is_empty());
        assert!(public.server_password.is_empty());
        assert!(public.client_guid.is_empty());
    }

    #[test]
    fn server_name_spaces() {
        let info = ServerInfo {
            protocol_version: "RoRnet_2.37".into(),
            terrain: "testmap".into(),
            server_name: "My Server".into(),
            has_password: true,
            info: String::new(),
        };
        let bytes = info.encode();
        assert_eq!(&bytes[148..159], b"My%20Server");
        assert_eq!(ServerInfo::decode(&bytes).unwrap(), info);
    }

    #[test]
    fn server_info_merge_keeps_known_fields() {
        let cached = ServerInfo {
            server_name: "cached".into(),
            terrain: "old".into(),
            ..ServerInfo::default()
        };
        let fresh = ServerInfo {
            terrain: "testmap".into(),
            ..ServerInfo::default()
        };
        let merged = cached.merged_with(&fresh);
        assert_eq!(merged.server_name, "cached");
        assert_eq!(merged.terrain, "testmap");
    }

    #[test]
    fn truck_registration_uses_truck_layout() {
        let reg = StreamRegistration {
            buffer_size: 1234,
            origin_source: UserId(2),
            origin_stream: StreamId(11),
            ..StreamRegistration::new(StreamType::Truck, "agoras.truck", vec![1, 2, 3])
        };
        let bytes = reg.encode();
        assert_eq!(bytes.len(), StreamRegistration::TRUCK_SIZE);
        assert_eq!(StreamRegistration::decode(&bytes).unwrap(), reg);
    }

    #[test]
    fn character_registration_uses_generic_layout() {
        let reg = StreamRegistration::new(StreamType::Character, "default", vec![2]);
        let bytes = reg.encode();
        assert_eq!(bytes.len(), StreamRegistration::GENERIC_SIZE);
        assert_eq!(&bytes[128..132], &1i32.to_le_bytes());
        assert_eq!(StreamRegistration::decode(&bytes).unwrap(), reg);
    }

    #[test]
    fn registration_with_bad_type() {
        let mut bytes = StreamRegistration::new(StreamType::Chat, "chat", Vec::new()).encode();
        bytes[128..132].copy_from_slice(&42i32.to_le_bytes());
        assert!(matches!(
            StreamRegistration::decode(&bytes),
            Err(ProtocolError::UnknownStreamType(42))
        ));
    }

    #[test]
    fn character_position_axis_order() {
        let packet = CharacterPacket::Position(CharacterPosition {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec4::new(0.0, 0.0, 0.0, 1.0),
            animation_mode: "Walk".into(),
            animation_time: 0.5,
        });
        let bytes = packet.encode();
        // Wire order is x, z, y.
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2.0f32.to_le_bytes());
        assert_eq!(CharacterPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn character_attach() {
        let packet = CharacterPacket::Attach(CharacterAttach {
            enabled: true,
            source: UserId(3),
            stream: StreamId(12),
            position: 1,
        });
        let bytes = packet.encode();
        assert_eq!(bytes[4], 1);
        assert_eq!(CharacterPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn unknown_character_command() {
        let mut bytes = CharacterAttach::default().encode();
        bytes[0..4].copy_from_slice(&9i32.to_le_bytes());
        assert!(matches!(
            CharacterPacket::decode(&bytes),
            Err(ProtocolError::UnknownCharacterCommand(9))
        ));
    }

    #[test]
    fn truck_data_keeps_node_bytes() {
        let data = TruckStreamData {
            time: 1500,
            engine_speed: 800.0,
            flag_mask: 0x10,
            node_data: vec![7; 40],
            ..TruckStreamData::at(Vec3::new(10.0, 0.5, -4.0))
        };
        let decoded = TruckStreamData::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn truck_data_length_must_match_registration() {
        let bare = TruckStreamData::at(Vec3::ORIGIN);
        assert_eq!(bare.buffer_size(), 12);
        assert!(TruckStreamData::check_len(&bare.encode(), bare.buffer_size()).is_ok());

        let loaded = TruckStreamData {
            node_data: vec![0; 40],
            ..bare
        };
        assert_eq!(loaded.buffer_size(), 52);
        assert!(TruckStreamData::check_len(&loaded.encode(), 52).is_ok());
        assert!(matches!(
            TruckStreamData::check_len(&loaded.encode(), 12),
            Err(ProtocolError::BadLength { actual: 68, .. })
        ));
        assert!(TruckStreamData::check_len(&[], -16).is_err());
    }

    #[test]
    fn private_chat_and_quality() {
        let chat = PrivateChat {
            target: UserId(6),
            text: "psst".into(),
        };
        assert_eq!(PrivateChat::decode(&chat.encode()).unwrap(), chat);
        assert_eq!(NetQuality::decode(&NetQuality(1).encode()).unwrap(), NetQuality(1));
        assert!(NetQuality::decode(&[1, 0]).is_err());
    }
}
