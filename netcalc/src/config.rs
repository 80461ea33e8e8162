//! Runtime parameters for the server and client.
//!
//! `main.rs` fills these from command-line flags; tests build them directly.

use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1500;

/// Listener and connection-handler settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind.  Port 0 lets the OS pick one.
    pub addr: String,
    /// How often the accept loop wakes to check the stop flag.
    pub accept_poll: Duration,
    /// How long the remainder of a partially received datagram may take
    /// before the fragment is discarded.
    pub frame_timeout: Duration,
    /// Refuse CONNECT while this many sessions are live.
    pub max_sessions: Option<usize>,
    /// Evict a session's oldest results beyond this many.
    pub max_results_per_session: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            accept_poll: Duration::from_secs(1),
            frame_timeout: Duration::from_millis(500),
            max_sessions: None,
            max_results_per_session: None,
        }
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server: String,
    /// Interval between IS_ALIVE probes.
    pub probe_interval: Duration,
    /// Upper bound on waiting for any single response datagram.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            probe_interval: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
        }
    }
}
