//! TCP listener and shutdown sequence.
//!
//! ```text
//!  Server::run ──accept──▶ Connection::run (one task per socket)
//!       │                        │
//!       └── stop (watch) ────────┘
//! ```
//!
//! [`Server::run`] accepts until the stop flag is raised, then waits for
//! every connection task to reach `CLOSED` before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::calc::ArithmeticFn;
use crate::config::ServerConfig;
use crate::connection::{Connection, SharedState};
use crate::datagram::{ResultId, ResultRecord, SessionId};
use crate::session::{Session, SessionError, SessionTable};
use crate::socket::DatagramStream;
use crate::state::ConnectionState;
use crate::store::{ResultStore, StoreError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bound, not yet running, netcalc server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: SharedState,
    stop: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let sessions = match config.max_sessions {
            Some(max) => SessionTable::with_limit(max),
            None => SessionTable::new(),
        };
        let results = match config.max_results_per_session {
            Some(max) => ResultStore::with_capacity_per_session(max),
            None => ResultStore::new(),
        };
        let (stop, _) = watch::channel(false);

        Ok(Self {
            config,
            listener,
            local_addr,
            shared: SharedState::new(sessions, results),
            stop: Arc::new(stop),
        })
    }

    /// Replace the arithmetic provider used by every connection.
    pub fn with_arithmetic(mut self, arithmetic: Box<ArithmeticFn>) -> Self {
        self.shared = self.shared.with_arithmetic(arithmetic);
        self
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Control handle usable after `run` has consumed the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            sessions: self.shared.sessions.clone(),
            results: self.shared.results.clone(),
        }
    }

    /// Accept connections until stopped, then drain every handler.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            listener,
            local_addr,
            shared,
            stop,
        } = self;

        log::info!("listening on {local_addr}");
        let mut stop_rx = stop.subscribe();
        let mut handlers: JoinSet<ConnectionState> = JoinSet::new();
        let mut poll = tokio::time::interval(config.accept_poll);

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        log::info!("connected by {peer}");
                        if let Err(e) = socket.set_nodelay(true) {
                            log::warn!("{peer}: cannot disable Nagle: {e}");
                        }
                        let stream = DatagramStream::new(socket)
                            .with_frame_timeout(config.frame_timeout);
                        let conn = Connection::new(stream, peer, shared.clone());
                        handlers.spawn(conn.run(stop.subscribe()));
                    }
                    Err(e) => log::error!("accept failed: {e}"),
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("connection task failed: {e}");
                    }
                }
                _ = poll.tick() => {}
            }
        }

        drop(listener);
        log::info!("listening stopped");

        stop.send_replace(true);
        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                log::error!("connection task failed: {e}");
            }
        }
        log::info!("all sessions closed");
        Ok(())
    }
}

/// Cloneable handle for stopping and inspecting a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<watch::Sender<bool>>,
    sessions: SessionTable,
    results: ResultStore,
}

impl ServerHandle {
    /// Raise the stop flag.  [`Server::run`] returns once every connection
    /// has closed.
    pub fn stop(&self) {
        log::info!("stopping listening...");
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Mark a session dead.  Its client sees IS_ALIVE refused and every
    /// other request fails with SESSION_ID_NOT_FOUND.
    pub fn expire(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.sessions.mark_dead(session_id)?;
        log::info!("session {session_id} expired by operator");
        Ok(())
    }

    /// Live sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.snapshot()
    }

    /// Every stored result of `session_id`, oldest first.
    pub fn query_by_session(&self, session_id: SessionId) -> Result<Vec<ResultRecord>, StoreError> {
        self.results.list(session_id)
    }

    /// A stored result regardless of which session owns it.
    pub fn query_by_result(&self, result_id: ResultId) -> Result<ResultRecord, StoreError> {
        self.results.find(result_id).ok_or(StoreError::NotExistingData)
    }
}
