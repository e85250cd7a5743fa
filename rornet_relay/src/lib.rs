// rornet_relay: session engine and relay server for RoRnet_2.37.
//
// Two halves share the same bookkeeping:
// - the client side (`client.rs`) connects to a server, runs the handshake,
//   owns the peer's streams and turns incoming frames into events;
// - the server side (`server.rs` + `registry.rs`) accepts connections,
//   admits peers and relays their frames to one another.
//
// Module overview:
// - `config.rs`:   `RelayConfig` (JSON file + CLI flags) and `ClientConfig`.
// - `error.rs`:    `ConnectError`, `SessionError`, `ConfigError`,
//                  `RejectReason`.
// - `streams.rs`:  `StreamRegistry`, the per-peer table of identities,
//                  streams, positions and stats, used by both halves.
// - `stats.rs`:    Travel distance accounting and server-wide totals.
// - `client.rs`:   `ConnectionSession` and the master-server `knock`.
// - `registry.rs`: Server peer table with locked fan-out.
// - `server.rs`:   Accept loop, server handshake and frame routing.
//
// Wire format and payload layouts live in `rornet_protocol`.

pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod stats;
pub mod streams;

pub use client::{ConnectionSession, Received, ServerTarget, SessionEvent, SessionState, knock};
pub use config::{ClientConfig, RelayConfig};
pub use error::{ConfigError, ConnectError, RejectReason, SessionError};
pub use registry::{Audience, Registry};
pub use server::{RelayHandle, start_relay, start_relay_with_commands};
pub use streams::{Stream, StreamRegistry, StreamUpdate};
