// Core value types for the RoRnet protocol.
//
// Lightweight newtypes and small enums shared by `message.rs` (frames),
// `payload.rs` (fixed-width payload layouts) and the relay's registries.
// Ids are the server-assigned 32-bit values that travel in every frame
// header; the server itself speaks as `UserId::SERVER` (-1).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned peer id, carried in the `source` field of the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i32);

impl UserId {
    /// Source id used for frames originating from the server itself.
    pub const SERVER: UserId = UserId(-1);
    /// Magic source id of the master-server probe.
    pub const MASTER_SERVER: UserId = UserId(5000);
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-peer stream id. Ids below `StreamId::FIRST_LOCAL` are reserved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub i32);

impl StreamId {
    pub const NONE: StreamId = StreamId(-1);
    pub const FIRST_LOCAL: StreamId = StreamId(10);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a logical stream, as carried in the registration payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    #[default]
    Truck,
    Character,
    Ai,
    Chat,
}

impl StreamType {
    pub fn to_wire(self) -> i32 {
        match self {
            StreamType::Truck => 0,
            StreamType::Character => 1,
            StreamType::Ai => 2,
            StreamType::Chat => 3,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(StreamType::Truck),
            1 => Some(StreamType::Character),
            2 => Some(StreamType::Ai),
            3 => Some(StreamType::Chat),
            _ => None,
        }
    }
}

/// Authorization bitmask attached to a peer identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthFlags(pub u32);

impl AuthFlags {
    pub const NONE: AuthFlags = AuthFlags(0);
    pub const ADMIN: AuthFlags = AuthFlags(1);
    pub const RANKED: AuthFlags = AuthFlags(2);
    pub const MOD: AuthFlags = AuthFlags(4);
    pub const BOT: AuthFlags = AuthFlags(8);
    pub const BANNED: AuthFlags = AuthFlags(16);

    pub fn contains(self, other: AuthFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AuthFlags {
    type Output = AuthFlags;

    fn bitor(self, rhs: AuthFlags) -> AuthFlags {
        AuthFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AuthFlags {
    fn bitor_assign(&mut self, rhs: AuthFlags) {
        self.0 |= rhs.0;
    }
}

/// World-space position. The wire order is x, z, y.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ORIGIN: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance, computed in f64 to keep small deltas exact.
    pub fn distance_squared(self, other: Vec3) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        let dz = f64::from(self.z) - f64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// Rotation quaternion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec4 {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_type_wire_values() {
        for kind in [
            StreamType::Truck,
            StreamType::Character,
            StreamType::Ai,
            StreamType::Chat,
        ] {
            assert_eq!(StreamType::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(StreamType::from_wire(7), None);
    }

    #[test]
    fn auth_flags_bitmask() {
        let flags = AuthFlags::ADMIN | AuthFlags::BOT;
        assert!(flags.contains(AuthFlags::ADMIN));
        assert!(flags.contains(AuthFlags::BOT));
        assert!(!flags.contains(AuthFlags::MOD));
        assert!(!flags.contains(AuthFlags::NONE));
        assert!(AuthFlags::NONE.is_empty());
    }

    #[test]
    fn distance_squared_is_symmetric() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 6.0, 3.0);
        assert_eq!(a.distance_squared(b), 25.0);
        assert_eq!(b.distance_squared(a), 25.0);
        assert_eq!(a.distance_squared(a), 0.0);
    }
}
