// RoRnet command set and the `Frame` value.
//
// `MessageType` is the closed command enumeration of the RoRnet_2.37
// revision (plus the STREAM_UNREGISTER extension code). Values outside the
// set decode to `MessageType::Unknown` so the payload is still consumed and
// the byte stream stays aligned; callers log and ignore those frames.
//
// A `Frame` is the only unit crossing the wire: a header (command, source,
// stream id, length) followed by `length` payload bytes. The length is never
// stored separately (it is always `payload.len()`), so a frame cannot be
// built with a mismatched header.

use std::fmt;
use std::time::Instant;

use crate::types::{StreamId, UserId};

/// Protocol revision string exchanged in the HELLO frame.
pub const RORNET_VERSION: &str = "RoRnet_2.37";

/// Command carried in the first header field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client sends its version as first message; server answers with settings.
    Hello,
    /// No more slots.
    Full,
    WrongPassword,
    WrongVersion,
    Banned,
    /// Handshake accepted; carries the assigned identity.
    Welcome,
    Version,
    ChatObsolete,
    ServerSettings,
    /// Script message, both directions.
    GameCommand,
    UserInfo,
    PrivateChatObsolete,
    StreamRegister,
    StreamRegisterResult,
    StreamData,
    UserJoin,
    UserLeave,
    NetQuality,
    MasterInfo,
    UtfChat,
    UtfPrivateChat,
    /// Extension code; 2.37 servers without it ignore the frame.
    StreamUnregister,
    Unknown(u32),
}

impl MessageType {
    pub fn to_wire(self) -> u32 {
        match self {
            MessageType::Hello => 1000,
            MessageType::Full => 1001,
            MessageType::WrongPassword => 1002,
            MessageType::WrongVersion => 1003,
            MessageType::Banned => 1004,
            MessageType::Welcome => 1005,
            MessageType::Version => 1006,
            MessageType::ChatObsolete => 1007,
            MessageType::ServerSettings => 1008,
            MessageType::GameCommand => 1009,
            MessageType::UserInfo => 1010,
            MessageType::PrivateChatObsolete => 1011,
            MessageType::StreamRegister => 1012,
            MessageType::StreamRegisterResult => 1013,
            MessageType::StreamData => 1014,
            MessageType::UserJoin => 1015,
            MessageType::UserLeave => 1016,
            MessageType::NetQuality => 1017,
            MessageType::MasterInfo => 1018,
            MessageType::UtfChat => 1019,
            MessageType::UtfPrivateChat => 1020,
            MessageType::StreamUnregister => 1021,
            MessageType::Unknown(code) => code,
        }
    }

    pub fn from_wire(code: u32) -> Self {
        match code {
            1000 => MessageType::Hello,
            1001 => MessageType::Full,
            1002 => MessageType::WrongPassword,
            1003 => MessageType::WrongVersion,
            1004 => MessageType::Banned,
            1005 => MessageType::Welcome,
            1006 => MessageType::Version,
            1007 => MessageType::ChatObsolete,
            1008 => MessageType::ServerSettings,
            1009 => MessageType::GameCommand,
            1010 => MessageType::UserInfo,
            1011 => MessageType::PrivateChatObsolete,
            1012 => MessageType::StreamRegister,
            1013 => MessageType::StreamRegisterResult,
            1014 => MessageType::StreamData,
            1015 => MessageType::UserJoin,
            1016 => MessageType::UserLeave,
            1017 => MessageType::NetQuality,
            1018 => MessageType::MasterInfo,
            1019 => MessageType::UtfChat,
            1020 => MessageType::UtfPrivateChat,
            1021 => MessageType::StreamUnregister,
            other => MessageType::Unknown(other),
        }
    }

    /// True for the admission results a server may send instead of WELCOME.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            MessageType::Full
                | MessageType::WrongPassword
                | MessageType::WrongVersion
                | MessageType::Banned
        )
    }

    /// High-rate traffic kept out of per-frame debug logging.
    pub fn is_high_rate(self) -> bool {
        matches!(
            self,
            MessageType::StreamData | MessageType::UtfChat | MessageType::NetQuality
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::Full => "FULL",
            MessageType::WrongPassword => "WRONG_PW",
            MessageType::WrongVersion => "WRONG_VER",
            MessageType::Banned => "BANNED",
            MessageType::Welcome => "WELCOME",
            MessageType::Version => "VERSION",
            MessageType::ChatObsolete => "CHAT_OBSOLETE",
            MessageType::ServerSettings => "SERVER_SETTINGS",
            MessageType::GameCommand => "GAME_CMD",
            MessageType::UserInfo => "USER_INFO",
            MessageType::PrivateChatObsolete => "PRIVCHAT_OBSOLETE",
            MessageType::StreamRegister => "STREAM_REGISTER",
            MessageType::StreamRegisterResult => "STREAM_REGISTER_RESULT",
            MessageType::StreamData => "STREAM_DATA",
            MessageType::UserJoin => "USER_JOIN",
            MessageType::UserLeave => "USER_LEAVE",
            MessageType::NetQuality => "NETQUALITY",
            MessageType::MasterInfo => "MASTERINFO",
            MessageType::UtfChat => "UTF_CHAT",
            MessageType::UtfPrivateChat => "UTF_PRIVCHAT",
            MessageType::StreamUnregister => "STREAM_UNREGISTER",
            MessageType::Unknown(code) => return write!(f, "UNKNOWN({code})"),
        };
        f.write_str(name)
    }
}

/// One discrete protocol message.
#[derive(Clone, Debug)]
pub struct Frame {
    pub command: MessageType,
    pub source: UserId,
    pub stream_id: StreamId,
    pub payload: Vec<u8>,
    /// Set by the decoder when the frame was read off a socket.
    pub received_at: Option<Instant>,
}

impl Frame {
    pub fn new(command: MessageType, source: UserId, stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            command,
            source,
            stream_id,
            payload,
            received_at: None,
        }
    }

    /// Header-only frame.
    pub fn empty(command: MessageType, source: UserId, stream_id: StreamId) -> Self {
        Self::new(command, source, stream_id, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, up to the first NUL. Invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

// Equality is over wire contents; `received_at` is local bookkeeping.
impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.source == other.source
            && self.stream_id == other.stream_id
            && self.payload == other.payload
    }
}

impl Eq for Frame {}
