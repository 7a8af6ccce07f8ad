#![allow(clippy::result_large_err)]
//! # EventConnect Core
//!
//! Client-side realtime chat session for EventConnect.
//!
//! ## Architecture
//!
//! - **Transport**: one socket per epoch, with a WebSocket and an in-memory implementation
//! - **Reconnect**: connection state machine with capped exponential backoff
//! - **Queue**: outbound envelopes held while offline, drained in order on reconnect
//! - **Store**: optimistic messages reconciled with server confirmations and status updates
//! - **Presence**: online users and per-conversation typing with expiry
//! - **Session**: the facade composing all of the above, driven by signals and timers
//! - **Runtime**: a tokio task owning the session behind a cloneable handle
//! - **History / Cache**: REST backfill and a bounded local message cache
//! - **Telemetry**: structured logging and metrics

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod message;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod runtime;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timers;
pub mod transport;

pub use error::{ChatError, ErrorCode, ErrorContext, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{FileMessageCache, InMemoryMessageCache, MessageCache};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::ClientConfig;
    pub use crate::error::{ChatError, ErrorCode, ErrorContext, ErrorSeverity, Result};
    pub use crate::events::{EventBus, SessionEvent};
    pub use crate::history::{HistoryClient, RestHistoryClient};
    pub use crate::message::{Message, MessageStatus, MessageType};
    pub use crate::protocol::{ClientEvent, ConversationId, ServerEvent, UserId, WireMessage};
    pub use crate::reconnect::{CloseReason, ConnectionState};
    pub use crate::runtime::{ChatClient, ChatClientBuilder};
    pub use crate::session::ChatSession;
    pub use crate::transport::{
        Credentials, MockTransport, Transport, TransportEvent, TransportFailure,
        TransportSignal, WebSocketTransport,
    };
}
