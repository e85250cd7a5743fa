// Relay and client configuration.
//
// `RelayConfig` is read from an optional JSON file (every field optional,
// missing fields take the `Default` value) and then overridden by command-line
// flags in `main.rs`. Durations are stored as milliseconds so the file stays
// plain JSON.
//
// `ClientConfig` carries the socket timeouts used by `ConnectionSession` and
// how it answers vehicle registrations.
// `read_timeout` doubles as the reader thread's stop-flag polling interval.

use std::path::Path;
use std::time::Duration;

use rornet_protocol::{AuthFlags, RORNET_VERSION, ServerInfo, UserInfo};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default RoRnet server port.
pub const DEFAULT_PORT: u16 = 12000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface to listen on.
    pub bind: String,
    pub port: u16,
    pub server_name: String,
    pub terrain: String,
    pub password: Option<String>,
    pub max_players: usize,
    pub max_streams_per_peer: usize,
    /// Message of the day, sent in the server info block.
    pub motd: String,
    /// Version string clients must present in HELLO.
    pub protocol_version: String,
    /// Usernames refused with BANNED (case-insensitive).
    pub banned_names: Vec<String>,
    /// User tokens granted admin rights.
    pub admin_tokens: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            server_name: "RoRnet relay".into(),
            terrain: "any".into(),
            password: None,
            max_players: 16,
            max_streams_per_peer: 20,
            motd: String::new(),
            protocol_version: RORNET_VERSION.into(),
            banned_names: Vec::new(),
            admin_tokens: Vec::new(),
            handshake_timeout_ms: 5_000,
            read_timeout_ms: 100,
            write_timeout_ms: 2_000,
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    /// Settings block sent in reply to a client's HELLO.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: self.protocol_version.clone(),
            terrain: self.terrain.clone(),
            server_name: self.server_name.clone(),
            has_password: self.password.is_some(),
            info: self.motd.clone(),
        }
    }

    pub fn is_banned(&self, username: &str) -> bool {
        self.banned_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(username))
    }

    pub fn password_matches(&self, offered: &str) -> bool {
        match &self.password {
            Some(password) => password == offered,
            None => true,
        }
    }

    /// Auth flags the server grants; whatever the client claimed is ignored.
    pub fn auth_for(&self, identity: &UserInfo) -> AuthFlags {
        let mut auth = AuthFlags::NONE;
        if !identity.user_token.is_empty() && self.admin_tokens.contains(&identity.user_token) {
            auth |= AuthFlags::ADMIN;
        }
        if identity.session_type.eq_ignore_ascii_case("bot") {
            auth |= AuthFlags::BOT;
        }
        auth
    }
}

/// Settings for `ConnectionSession`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Version string sent in HELLO.
    pub protocol_version: String,
    pub connect_timeout: Duration,
    /// Upper bound for each handshake reply.
    pub handshake_timeout: Duration,
    /// Socket read timeout of the reader thread.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Answer to other peers' vehicle registrations: success when true.
    pub accept_vehicles: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: RORNET_VERSION.into(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(5),
            accept_vehicles: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RelayConfig::from_json_str(
            r#"{"port": 0, "server_name": "Test Server", "banned_names": ["Griefer"]}"#,
        )
        .unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.server_name, "Test Server");
        assert_eq!(config.max_players, 16);
        assert_eq!(config.protocol_version, RORNET_VERSION);
        assert!(config.is_banned("griefer"));
        assert!(!config.is_banned("Bob"));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = RelayConfig::from_json_str("{port: }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = RelayConfig::load(Path::new("/nonexistent/rornet-relay.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn password_check() {
        let open = RelayConfig::default();
        assert!(open.password_matches("anything"));

        let locked = RelayConfig {
            password: Some("secret".into()),
            ..RelayConfig::default()
        };
        assert!(locked.password_matches("secret"));
        assert!(!locked.password_matches(""));
        assert!(locked.server_info().has_password);
    }

    #[test]
    fn auth_is_granted_not_claimed() {
        let config = RelayConfig {
            admin_tokens: vec!["tok-admin".into()],
            ..RelayConfig::default()
        };
        let claimed = UserInfo {
            auth: AuthFlags::ADMIN,
            ..UserInfo::named("Mallory")
        };
        assert_eq!(config.auth_for(&claimed), AuthFlags::NONE);

        let admin = UserInfo {
            user_token: "tok-admin".into(),
            session_type: "bot".into(),
            ..UserInfo::named("Op")
        };
        assert_eq!(config.auth_for(&admin), AuthFlags::ADMIN | AuthFlags::BOT);
    }
}
