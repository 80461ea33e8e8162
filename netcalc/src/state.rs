//! Connection handler finite-state machine (FSM) types.
//!
//! Transitions are driven by [`crate::connection`]; this module only names
//! the states and the legal moves between them.
//!
//! ```text
//!  AWAITING_CONNECT ──CONNECT──▶ AUTHENTICATED ──DISCONNECT──▶ CLOSED
//!        │  ▲                          │  ▲                      ▲
//!        └──┘ other mode               └──┘ any other request    │
//!             (refused)                                          │
//!        └──────────── transport loss / server shutdown ─────────┘
//! ```

use crate::datagram::SessionId;

/// All possible states of a connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Socket accepted; no session bound yet.  Only CONNECT is served.
    #[default]
    AwaitingConnect,
    /// CONNECT succeeded; every request must present this session id.
    Authenticated(SessionId),
    /// Terminal.  The socket is closed and the session removed.
    Closed,
}

impl ConnectionState {
    /// Session bound to the connection, if any.
    pub fn session_id(self) -> Option<SessionId> {
        match self {
            ConnectionState::Authenticated(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::AwaitingConnect => write!(f, "AWAITING_CONNECT"),
            ConnectionState::Authenticated(id) => write!(f, "AUTHENTICATED({id})"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}
