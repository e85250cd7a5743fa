// rornet_protocol: wire protocol shared by RoRnet servers and clients.
//
// This crate defines the frame format, the command set and the fixed-width
// payload layouts of the RoRnet_2.37 revision. It is used by the relay
// (`rornet_relay`), which contains both the client session engine and the
// server, and has no knowledge of sockets beyond `std::io::Read`/`Write`.
//
// Module overview:
// - `types.rs`:    Id newtypes (`UserId`, `StreamId`), `StreamType`,
//                  `AuthFlags`, `Vec3`/`Vec4`.
// - `message.rs`:  `MessageType` command enumeration and the `Frame` value.
// - `framing.rs`:  16-byte little-endian header + payload; `FrameReader`
//                  reassembles frames from arbitrarily chunked reads.
// - `payload.rs`:  Packed payload structs (server info, user info, stream
//                  registration, character/truck stream data, net quality,
//                  private chat) and the sparse identity merge.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **Binary, not serde, on the wire.** The layouts are packed C structs
//   fixed by the protocol revision, so they are encoded by hand. Serde
//   derives on the value types are for configuration files and logs.
// - **Unknown commands are values.** `MessageType::Unknown` keeps the stream
//   aligned; deciding to ignore a frame is the caller's job.
// - **No async runtime.** Blocking `Read`/`Write` with socket timeouts, the
//   same model for client and server.

pub mod error;
pub mod framing;
pub mod message;
pub mod payload;
pub mod types;

pub use error::{ProtocolError, Result};
pub use framing::{
    FrameReader, HEADER_SIZE, MAX_MESSAGE_LENGTH, MAX_PAYLOAD_SIZE, ReadOutcome, decode_frame,
    encode, write_encoded, write_frame,
};
pub use message::{Frame, MessageType, RORNET_VERSION};
pub use payload::{
    CharacterAttach, CharacterPacket, CharacterPosition, IDLE_ANIMATION, NetQuality, PrivateChat,
    ServerInfo, StreamRegistration, TruckStreamData, UserInfo,
};
pub use types::{AuthFlags, StreamId, StreamType, UserId, Vec3, Vec4};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Frame a payload, push it through a reader, return what came out.
    fn through_wire(frame: &Frame) -> Frame {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame).unwrap();
        let mut reader = FrameReader::new(Cursor::new(wire));
        match reader.next_frame().unwrap() {
            ReadOutcome::Frame(frame) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn hello_carries_version_string() {
        let hello = Frame::new(
            MessageType::Hello,
            UserId(0),
            StreamId(0),
            RORNET_VERSION.as_bytes().to_vec(),
        );
        assert_eq!(through_wire(&hello).text(), "RoRnet_2.37");
    }

    #[test]
    fn welcome_carries_user_info() {
        let identity = UserInfo {
            unique_id: UserId(12),
            username: "Bob".into(),
            language: "en_GB".into(),
            slot_num: 0,
            colour_num: 0,
            ..UserInfo::default()
        };
        let welcome = Frame::new(
            MessageType::Welcome,
            UserId::SERVER,
            StreamId(0),
            identity.encode(),
        );
        let received = through_wire(&welcome);
        assert_eq!(received.command, MessageType::Welcome);
        assert_eq!(UserInfo::decode(&received.payload).unwrap(), identity);
    }

    #[test]
    fn largest_fixed_payload_fits_in_a_frame() {
        assert!(StreamRegistration::GENERIC_SIZE <= MAX_PAYLOAD_SIZE);
        assert!(ServerInfo::SIZE <= MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn identity_loads_from_json() {
        let json = r#"{"username": "bot", "language": "de_DE", "auth": 8}"#;
        let info: UserInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.username, "bot");
        assert_eq!(info.auth, AuthFlags::BOT);
        assert_eq!(info.slot_num, -1);
        assert_eq!(info.unique_id, UserId(0));
    }

    #[test]
    fn positions_serialize_by_name() {
        let json = serde_json::to_value(Vec3::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(json["y"], 2.0);
    }
}
