// Test-only bot for multiplayer integration tests.
//
// Wraps the real `ConnectionSession` (from `rornet_relay::client`) to provide
// a synchronous, test-friendly API for exercising the whole pipeline:
// connect -> relay -> other peers -> process() -> verify state.
//
// The only test-specific code here is the blocking polling wrappers (loops
// around `ConnectionSession::receive()`). All networking and bookkeeping uses
// the same code paths a real bot would.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rornet_protocol::{
    CharacterAttach, CharacterPosition, StreamId, StreamType, TruckStreamData, UserId, UserInfo,
    Vec3,
};
use rornet_relay::client::{ConnectionSession, Received, ServerTarget, SessionEvent};
use rornet_relay::config::ClientConfig;
use rornet_relay::error::ConnectError;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest single wait inside a poll loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A scripted peer wrapping a real ConnectionSession.
pub struct TestBot {
    session: ConnectionSession,
    /// Every event processed so far, in arrival order.
    pub seen: Vec<SessionEvent>,
}

fn client_config() -> ClientConfig {
    ClientConfig {
        read_timeout: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

impl TestBot {
    /// Connect and complete the handshake, panicking on failure.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        Self::try_connect(addr, UserInfo::named(name)).expect("TestBot::connect failed")
    }

    pub fn try_connect(addr: SocketAddr, identity: UserInfo) -> Result<Self, ConnectError> {
        let mut session = ConnectionSession::new(client_config());
        session.connect(identity, &mut ServerTarget::new(addr.to_string()))?;
        Ok(Self {
            session,
            seen: Vec::new(),
        })
    }

    pub fn id(&self) -> UserId {
        self.session.user_id()
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn say(&self, text: &str) {
        self.session.send_chat(text).expect("send_chat failed");
    }

    pub fn whisper(&self, to: UserId, text: &str) {
        self.session
            .send_private_chat(to, text)
            .expect("send_private_chat failed");
    }

    /// Move the bot's character.
    pub fn walk_to(&mut self, position: Vec3) {
        let packet = CharacterPosition {
            animation_mode: "Walk".into(),
            ..CharacterPosition::idle(position)
        };
        self.session
            .stream_character(&packet)
            .expect("stream_character failed");
    }

    /// Walk through every point of `path` in order.
    pub fn walk_path(&mut self, path: &[Vec3]) {
        for point in path {
            self.walk_to(*point);
        }
    }

    /// Register a vehicle stream, e.g. `"agoras.truck"`.
    pub fn spawn_vehicle(&mut self, file_name: &str) -> StreamId {
        self.session
            .register_stream(StreamType::Truck, file_name, Vec::new())
            .expect("register_stream failed")
    }

    pub fn drive_to(&mut self, vehicle: StreamId, position: Vec3) {
        self.session
            .stream_truck(vehicle, &TruckStreamData::at(position))
            .expect("stream_truck failed");
    }

    /// Get the character into a vehicle owned by `owner`.
    pub fn enter(&mut self, owner: UserId, vehicle: StreamId) {
        self.session
            .stream_character_attach(CharacterAttach {
                enabled: true,
                source: owner,
                stream: vehicle,
                position: 0,
            })
            .expect("attach failed");
    }

    pub fn exit_vehicle(&mut self) {
        self.session
            .stream_character_attach(CharacterAttach {
                enabled: false,
                source: UserId(0),
                stream: StreamId(0),
                position: 0,
            })
            .expect("detach failed");
    }

    /// Blocking poll until an event matching `pred` is processed. Events
    /// before it are processed too and kept in `seen`.
    pub fn poll_until(&mut self, what: &str, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            match self.session.receive(POLL_INTERVAL, true) {
                Received::Frame(frame) => {
                    if let Some(event) = self.session.process(&frame) {
                        self.seen.push(event.clone());
                        if pred(&event) {
                            return event;
                        }
                    }
                }
                Received::Timeout => {}
                Received::Closed => panic!("connection closed while waiting for {what}"),
            }
        }
    }

    /// Non-blocking: process everything already queued and return the
    /// resulting events.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Received::Frame(frame) = self.session.receive(Duration::ZERO, false) {
            if let Some(event) = self.session.process(&frame) {
                self.seen.push(event.clone());
                events.push(event);
            }
        }
        events
    }

    /// Block until the server closes the connection.
    pub fn wait_closed(&mut self) {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "connection stayed open");
            match self.session.receive(POLL_INTERVAL, true) {
                Received::Closed => return,
                Received::Frame(frame) => {
                    if let Some(event) = self.session.process(&frame) {
                        self.seen.push(event);
                    }
                }
                Received::Timeout => {}
            }
        }
    }

    /// Send USER_LEAVE and close the connection.
    pub fn disconnect(&mut self) {
        self.session.disconnect();
    }
}

/// Poll `condition` until it holds or `POLL_TIMEOUT` passes.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        std::thread::sleep(POLL_INTERVAL);
    }
}
