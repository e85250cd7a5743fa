// Per-peer and global usage statistics.
//
// Every position update on a stream goes through `record_position`, which
// credits the distance covered to one of four counters picked by the kind of
// stream (walking for characters, then driving/flying/sailing by the
// stream's file extension). A step whose squared length reaches
// `MAX_STEP_SQUARED` is a teleport or a respawn and is not credited; the
// position is still updated so the next step is measured from the new place.
//
// Counters hold the sum of squared step lengths, the same quantity the
// guard compares. When a peer leaves, `fold_into` adds its counters to the
// process-wide `GlobalStats` and records how long it was connected.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use rornet_protocol::{StreamId, StreamType, UserId, Vec3};

use crate::streams::Stream;

/// Squared step length at or above which movement is not counted.
pub const MAX_STEP_SQUARED: f64 = 10.0;

/// What a stream's movement counts as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Travel {
    Walked,
    Driven,
    Flown,
    Sailed,
}

impl Travel {
    pub fn of(stream: &Stream) -> Option<Travel> {
        if stream.kind == StreamType::Character {
            return Some(Travel::Walked);
        }
        match stream.file_extension.as_str() {
            "truck" => Some(Travel::Driven),
            "airplane" => Some(Travel::Flown),
            "boat" => Some(Travel::Sailed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerStats {
    pub online_since: Instant,
    /// Stream the peer is currently embodied in: its character, or a
    /// vehicle it sits in.
    pub current_stream: Option<(UserId, StreamId)>,
    pub character_stream: Option<StreamId>,
    pub chat_stream: Option<StreamId>,
    pub distance_driven: f64,
    pub distance_sailed: f64,
    pub distance_walked: f64,
    pub distance_flown: f64,
}

impl PeerStats {
    pub fn new(online_since: Instant) -> Self {
        Self {
            online_since,
            current_stream: None,
            character_stream: None,
            chat_stream: None,
            distance_driven: 0.0,
            distance_sailed: 0.0,
            distance_walked: 0.0,
            distance_flown: 0.0,
        }
    }

    fn counter(&mut self, travel: Travel) -> &mut f64 {
        match travel {
            Travel::Walked => &mut self.distance_walked,
            Travel::Driven => &mut self.distance_driven,
            Travel::Flown => &mut self.distance_flown,
            Travel::Sailed => &mut self.distance_sailed,
        }
    }
}

impl Default for PeerStats {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[derive(Clone, Debug)]
pub struct GlobalStats {
    pub distance_driven_total: f64,
    pub distance_sailed_total: f64,
    pub distance_walked_total: f64,
    pub distance_flown_total: f64,
    pub usernames_seen: BTreeSet<String>,
    /// Peers that have ever joined.
    pub peer_count: usize,
    pub connect_durations: Vec<Duration>,
    pub started_at: Instant,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            distance_driven_total: 0.0,
            distance_sailed_total: 0.0,
            distance_walked_total: 0.0,
            distance_flown_total: 0.0,
            usernames_seen: BTreeSet::new(),
            peer_count: 0,
            connect_durations: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn record_join(&mut self, username: &str) {
        self.usernames_seen.insert(username.to_string());
        self.peer_count += 1;
    }

    pub fn average_connect_time(&self) -> Option<Duration> {
        let count = u32::try_from(self.connect_durations.len()).ok().filter(|n| *n > 0)?;
        let total: Duration = self.connect_durations.iter().sum();
        Some(total / count)
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Credit the step from `stream.last_position` to `new_pos`, then move the
/// stream there.
pub fn record_position(stats: &mut PeerStats, stream: &mut Stream, new_pos: Vec3) {
    let step = stream.last_position.distance_squared(new_pos);
    if step < MAX_STEP_SQUARED
        && let Some(travel) = Travel::of(stream)
    {
        *stats.counter(travel) += step;
    }
    stream.last_position = new_pos;
}

/// Add a departing peer's counters to the global totals.
pub fn fold_into(stats: &PeerStats, global: &mut GlobalStats, now: Instant) {
    global.distance_driven_total += stats.distance_driven;
    global.distance_sailed_total += stats.distance_sailed;
    global.distance_walked_total += stats.distance_walked;
    global.distance_flown_total += stats.distance_flown;
    global
        .connect_durations
        .push(now.saturating_duration_since(stats.online_since));
}

#[cfg(test)]
mod tests {
    use rornet_protocol::StreamRegistration;

    use super::*;

    fn stream(kind: StreamType, name: &str) -> Stream {
        Stream::from_registration(
            UserId(1),
            StreamId(10),
            &StreamRegistration::new(kind, name, Vec::new()),
        )
    }

    #[test]
    fn travel_kind_by_stream() {
        assert_eq!(Travel::of(&stream(StreamType::Character, "default")), Some(Travel::Walked));
        assert_eq!(Travel::of(&stream(StreamType::Truck, "agoras.truck")), Some(Travel::Driven));
        assert_eq!(Travel::of(&stream(StreamType::Truck, "an-2.AIRPLANE")), Some(Travel::Flown));
        assert_eq!(Travel::of(&stream(StreamType::Truck, "ship.boat")), Some(Travel::Sailed));
        assert_eq!(Travel::of(&stream(StreamType::Truck, "crate.load")), None);
        assert_eq!(Travel::of(&stream(StreamType::Chat, "chat")), None);
    }

    #[test]
    fn small_steps_are_counted() {
        let mut stats = PeerStats::default();
        let mut s = stream(StreamType::Truck, "agoras.truck");
        record_position(&mut stats, &mut s, Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(stats.distance_driven, 9.0);
        assert_eq!(s.last_position, Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn threshold_is_exclusive() {
        let mut stats = PeerStats::default();
        let mut s = stream(StreamType::Character, "default");
        // 9.99 is counted.
        record_position(&mut stats, &mut s, Vec3::new(0.0, 0.0, 9.99f64.sqrt() as f32));
        assert!(stats.distance_walked > 9.98 && stats.distance_walked < 10.0);

        // Exactly 10.0 is not.
        let mut stats = PeerStats::default();
        let mut s = stream(StreamType::Character, "default");
        record_position(&mut stats, &mut s, Vec3::new(1.0, 0.0, 3.0));
        assert_eq!(stats.distance_walked, 0.0);
        assert_eq!(s.last_position, Vec3::new(1.0, 0.0, 3.0));
    }

    #[test]
    fn teleport_moves_without_credit() {
        let mut stats = PeerStats::default();
        let mut s = stream(StreamType::Truck, "ship.boat");
        record_position(&mut stats, &mut s, Vec3::new(500.0, 0.0, 0.0));
        assert_eq!(stats.distance_sailed, 0.0);
        record_position(&mut stats, &mut s, Vec3::new(501.0, 0.0, 0.0));
        assert_eq!(stats.distance_sailed, 1.0);
    }

    #[test]
    fn fold_adds_counters_and_duration() {
        let start = Instant::now();
        let stats = PeerStats {
            distance_driven: 42.0,
            distance_walked: 1.5,
            ..PeerStats::new(start)
        };
        let mut global = GlobalStats::new();
        global.distance_driven_total = 8.0;
        fold_into(&stats, &mut global, start + Duration::from_secs(30));
        assert_eq!(global.distance_driven_total, 50.0);
        assert_eq!(global.distance_walked_total, 1.5);
        assert_eq!(global.connect_durations, vec![Duration::from_secs(30)]);
        assert_eq!(global.average_connect_time(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn joins_are_counted() {
        let mut global = GlobalStats::new();
        global.record_join("Alice");
        global.record_join("Bob");
        global.record_join("Alice");
        assert_eq!(global.peer_count, 3);
        assert_eq!(global.usernames_seen.len(), 2);
        assert_eq!(global.average_connect_time(), None);
    }
}
