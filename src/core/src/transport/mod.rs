//! Socket transport abstraction.
//!
//! A [`Transport`] owns at most one socket. Lifecycle and inbound events are
//! pushed to the session as [`TransportSignal`]s tagged with the epoch passed
//! to [`Transport::open`], so events from a torn-down socket can be told
//! apart from the live one.

pub mod mock;
pub mod websocket;

use std::fmt;

use crate::error::Result;
use crate::protocol::{ClientEvent, ServerEvent, UserId};
use crate::reconnect::CloseReason;

pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

/// Handshake credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

impl Credentials {
    pub fn new(token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Why a socket could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server refused the credentials; never retried
    AuthRejected { reason: String },
    /// Connect or I/O failure; retried with backoff
    Network { message: String },
}

/// Lifecycle and inbound events from a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Closed(CloseReason),
    Error(TransportFailure),
    Inbound(ServerEvent),
}

/// A [`TransportEvent`] tagged with the epoch of the socket that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSignal {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// One bidirectional socket connection.
pub trait Transport: Send {
    /// Start connecting. Tears down any socket that is already open.
    fn open(&mut self, credentials: &Credentials, epoch: u64) -> Result<()>;

    /// Close the socket, if any. Emits no further signals for its epoch.
    fn close(&mut self);

    /// Queue an event for the socket.
    ///
    /// Fails with `NotConnected` when no socket is open.
    fn emit(&mut self, event: &ClientEvent) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = Credentials::new("secret-token", "u1");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("u1"));
    }
}
