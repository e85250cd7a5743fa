// Error types for the session engine.
//
// `ConnectError` covers everything that can end a `ConnectionSession::connect`
// attempt; `SessionError` covers sends on an established session. Both fold
// `ProtocolError::Io` into their `Transport` variant so callers only have one
// place to look for socket failures. `RejectReason` is the server's
// admission verdict and is shared by the client (decoding the reply) and the
// server (choosing which rejection frame to send).

use std::fmt;
use std::io;
use std::path::PathBuf;

use rornet_protocol::{MessageType, ProtocolError};
use thiserror::Error;

/// Why the server refused a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Full,
    Banned,
    WrongPassword,
    WrongVersion,
    /// Any other reply to USER_INFO; carries the raw command code.
    Unknown(u32),
}

impl RejectReason {
    pub fn from_command(command: MessageType) -> Self {
        match command {
            MessageType::Full => RejectReason::Full,
            MessageType::Banned => RejectReason::Banned,
            MessageType::WrongPassword => RejectReason::WrongPassword,
            MessageType::WrongVersion => RejectReason::WrongVersion,
            other => RejectReason::Unknown(other.to_wire()),
        }
    }

    /// Command the server sends to signal this rejection.
    pub fn command(self) -> MessageType {
        match self {
            RejectReason::Full => MessageType::Full,
            RejectReason::Banned => MessageType::Banned,
            RejectReason::WrongPassword => MessageType::WrongPassword,
            RejectReason::WrongVersion => MessageType::WrongVersion,
            RejectReason::Unknown(code) => MessageType::from_wire(code),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Full => f.write_str("server is full"),
            RejectReason::Banned => f.write_str("banned from this server"),
            RejectReason::WrongPassword => f.write_str("wrong password"),
            RejectReason::WrongVersion => f.write_str("protocol version mismatch"),
            RejectReason::Unknown(code) => write!(f, "unexpected reply {code}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection failed: {0}")]
    Transport(#[source] io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol violation: expected {expected}, got {got}")]
    ProtocolViolation {
        expected: MessageType,
        got: MessageType,
    },

    #[error("rejected: {0}")]
    Rejected(RejectReason),

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("malformed handshake payload: {0}")]
    Protocol(#[source] ProtocolError),
}

impl From<ProtocolError> for ConnectError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ConnectError::Transport(e),
            other => ConnectError::Protocol(other),
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> Self {
        ConnectError::Transport(err)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Transport(#[source] io::Error),

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => SessionError::Transport(e),
            other => SessionError::Protocol(other),
        }
    }
}

// Sends made while the handshake is still running.
impl From<SessionError> for ConnectError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected => {
                ConnectError::Transport(io::Error::from(io::ErrorKind::NotConnected))
            }
            SessionError::Transport(e) => ConnectError::Transport(e),
            SessionError::Protocol(e) => ConnectError::Protocol(e),
        }
    }
}

/// Failure loading a `RelayConfig` file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
