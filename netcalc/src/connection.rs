//! Per-connection handler.
//!
//! A [`Connection`] owns one accepted socket for its whole life.  Its
//! responsibilities are:
//! - Driving the FSM in [`crate::state`].
//! - Reading requests strictly in arrival order and answering each one.
//! - Consulting the shared [`SessionTable`] and [`ResultStore`].
//! - Streaming multi-datagram responses (see [`ResultStream`]).
//!
//! Per-request faults (undecodable bytes, domain errors, a panicking
//! arithmetic provider) become ERROR datagrams and never end the connection.
//! Only DISCONNECT, server shutdown or a transport failure do.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::calc::{self, ArithmeticFn};
use crate::datagram::{
    ErrorCode, Operation, RecordMode, Request, Response, ResultId, ResultRecord, SessionId, Status,
    Trailer,
};
use crate::session::SessionTable;
use crate::socket::{DatagramStream, StreamError};
use crate::state::ConnectionState;
use crate::store::ResultStore;

// ---------------------------------------------------------------------------
// Shared server state
// ---------------------------------------------------------------------------

/// State shared by every connection handler of one server.
#[derive(Clone)]
pub struct SharedState {
    pub sessions: SessionTable,
    pub results: ResultStore,
    pub arithmetic: Arc<ArithmeticFn>,
}

impl SharedState {
    pub fn new(sessions: SessionTable, results: ResultStore) -> Self {
        let arithmetic: Arc<ArithmeticFn> = Arc::new(calc::evaluate);
        Self {
            sessions,
            results,
            arithmetic,
        }
    }

    /// Replace the arithmetic provider.
    pub fn with_arithmetic(mut self, arithmetic: Box<ArithmeticFn>) -> Self {
        self.arithmetic = Arc::from(arithmetic);
        self
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(SessionTable::new(), ResultStore::new())
    }
}

// ---------------------------------------------------------------------------
// Streamed responses
// ---------------------------------------------------------------------------

/// One step of a logical response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outbound {
    /// Write now; more datagrams follow.
    More(Response),
    /// Final datagram; goes through the handler's normal reply path.
    Last(Response),
}

/// Lazy, finite producer of record datagrams for one query.
///
/// Yields one [`Outbound`] per record; only the final one is
/// [`Outbound::Last`].  Consumed once.
#[derive(Debug)]
pub struct ResultStream {
    mode: RecordMode,
    records: std::iter::Peekable<std::vec::IntoIter<ResultRecord>>,
}

impl ResultStream {
    pub fn new(mode: RecordMode, records: Vec<ResultRecord>) -> Self {
        Self {
            mode,
            records: records.into_iter().peekable(),
        }
    }
}

impl Iterator for ResultStream {
    type Item = Outbound;

    fn next(&mut self) -> Option<Outbound> {
        let record = self.records.next()?;
        let trailer = if self.records.peek().is_some() {
            Trailer::More
        } else {
            Trailer::Last
        };
        let response = Response::Record {
            mode: self.mode,
            record,
            trailer,
        };
        Some(match trailer {
            Trailer::More => Outbound::More(response),
            Trailer::Last => Outbound::Last(response),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Handler for a single accepted connection.
pub struct Connection<S> {
    /// Current FSM state.
    pub state: ConnectionState,
    stream: DatagramStream<S>,
    peer: SocketAddr,
    shared: SharedState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// New handler in [`ConnectionState::AwaitingConnect`].
    pub fn new(stream: DatagramStream<S>, peer: SocketAddr, shared: SharedState) -> Self {
        Self {
            state: ConnectionState::AwaitingConnect,
            stream,
            peer,
            shared,
        }
    }

    /// Serve requests until DISCONNECT, transport loss, or `stop` flips to
    /// `true`.  Always ends in [`ConnectionState::Closed`].
    ///
    /// The stop signal is only observed between requests, so a request that
    /// is already being answered is answered in full.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> ConnectionState {
        loop {
            if *stop.borrow() {
                log::debug!("{}: stop requested", self.peer);
                break;
            }

            let inbound = tokio::select! {
                inbound = self.stream.recv_request() => inbound,
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Server dropped the stop sender without signalling.
                        break;
                    }
                    continue;
                }
            };

            let reply = match inbound {
                Ok(request) => match self.handle(request).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("{}: write failed mid-stream: {e}", self.peer);
                        break;
                    }
                },
                Err(StreamError::Codec(e)) => {
                    log::warn!("{}: unreadable datagram: {e}", self.peer);
                    self.fail(Operation::default(), e.code(), "decode")
                }
                Err(e) => {
                    log::info!("{}: connection lost: {e}", self.peer);
                    break;
                }
            };

            if let Err(e) = self.stream.send_response(&reply).await {
                log::info!("{}: connection lost while replying: {e}", self.peer);
                break;
            }
            if self.state.is_closed() {
                break;
            }
        }

        self.close().await;
        self.state
    }

    /// Answer one request, advancing the FSM.
    ///
    /// Returns the final datagram of the logical response.  For streamed
    /// responses every earlier datagram has already been written.
    pub async fn handle(&mut self, request: Request) -> Result<Response, StreamError> {
        let session_id = match self.state {
            ConnectionState::Closed => {
                return Ok(self.fail(Operation::default(), ErrorCode::SessionIdNotFound, "closed"))
            }
            ConnectionState::AwaitingConnect => {
                return Ok(match request {
                    Request::Connect => self.connect(),
                    other => self.refuse(other),
                });
            }
            ConnectionState::Authenticated(id) => id,
        };

        if request == Request::Connect {
            log::warn!("{}: repeated CONNECT on session {session_id}", self.peer);
            return Ok(Response::Connect {
                status: Status::Refused,
                session_id,
            });
        }

        if request.session_id() != session_id {
            log::warn!(
                "{}: session {session_id} presented foreign id {}",
                self.peer,
                request.session_id()
            );
            // The handler stays bound; the session itself is no longer trusted.
            if let Err(e) = self.shared.sessions.mark_dead(session_id) {
                log::debug!("{}: cannot mark session {session_id} dead: {e}", self.peer);
            }
            return Ok(self.fail(operation_of(&request), ErrorCode::Unauthorised, "session mismatch"));
        }

        let Some(session) = self.shared.sessions.lookup(session_id) else {
            return Ok(self.fail(operation_of(&request), ErrorCode::SessionIdNotFound, "lookup"));
        };

        let reply = match request {
            Request::IsAlive { .. } => Response::IsAlive {
                status: if session.alive {
                    Status::Ok
                } else {
                    Status::Refused
                },
                session_id,
            },
            Request::Disconnect { .. } => self.disconnect(session_id),
            _ if !session.alive => {
                self.fail(operation_of(&request), ErrorCode::SessionIdNotFound, "dead session")
            }
            Request::Operation {
                operation, a, b, ..
            } => self.operation(session_id, operation, a, b),
            Request::QueryBySessionId { .. } => return self.query_by_session(session_id).await,
            Request::QueryByResultId { result_id, .. } => {
                self.query_by_result(session_id, result_id)
            }
            Request::Connect => unreachable!("handled above"),
        };
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Request handlers
    // -----------------------------------------------------------------------

    fn connect(&mut self) -> Response {
        match self.shared.sessions.allocate(self.peer) {
            Ok(id) => {
                self.shared.results.open(id);
                self.state = ConnectionState::Authenticated(id);
                log::info!("new session: {id} : {}", self.peer);
                Response::Connect {
                    status: Status::Ok,
                    session_id: id,
                }
            }
            Err(e) => {
                log::warn!("{}: refusing CONNECT: {e}", self.peer);
                Response::Connect {
                    status: Status::Refused,
                    session_id: 0,
                }
            }
        }
    }

    fn refuse(&self, request: Request) -> Response {
        log::warn!(
            "{}: {} before CONNECT refused",
            self.peer,
            request.mode()
        );
        Response::Error {
            status: Status::Refused,
            session_id: 0,
            operation: operation_of(&request),
            code: ErrorCode::Unauthorised,
        }
    }

    fn disconnect(&mut self, session_id: SessionId) -> Response {
        if let Err(e) = self.shared.sessions.mark_dead(session_id) {
            log::debug!("{}: disconnecting unknown session: {e}", self.peer);
        }
        self.shared.sessions.remove(session_id);
        self.state = ConnectionState::Closed;
        log::info!("removed session: {session_id} : {}", self.peer);
        Response::Disconnect {
            status: Status::Ok,
            session_id,
        }
    }

    fn operation(&self, session_id: SessionId, operation: Operation, a: f64, b: f64) -> Response {
        log::info!("received call for {operation} from session: {session_id}");

        let arithmetic = Arc::clone(&self.shared.arithmetic);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| arithmetic(operation, a, b)));
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return self.fail(operation, e.code(), &e.to_string()),
            Err(_) => {
                return self.fail(operation, ErrorCode::InternalServerError, "arithmetic panicked")
            }
        };

        match self.shared.results.insert(session_id, operation, a, b, value) {
            Ok(record) => Response::Record {
                mode: RecordMode::Operation,
                record,
                trailer: Trailer::Last,
            },
            Err(e) => self.fail(operation, e.code(), &e.to_string()),
        }
    }

    async fn query_by_session(&mut self, session_id: SessionId) -> Result<Response, StreamError> {
        log::info!("querying by session_id: {session_id}");
        let records = match self.shared.results.list(session_id) {
            Ok(records) => records,
            Err(e) => return Ok(self.fail(Operation::default(), e.code(), "query by session")),
        };

        for item in ResultStream::new(RecordMode::QueryBySessionId, records) {
            match item {
                Outbound::More(response) => self.stream.send_response(&response).await?,
                Outbound::Last(response) => return Ok(response),
            }
        }
        // `list` never returns an empty set.
        Ok(self.fail(Operation::default(), ErrorCode::NotExistingData, "query by session"))
    }

    fn query_by_result(&self, session_id: SessionId, result_id: ResultId) -> Response {
        log::info!("querying result {result_id} for session: {session_id}");
        match self.shared.results.get(session_id, result_id) {
            Ok(record) => Response::Record {
                mode: RecordMode::QueryByResultId,
                record,
                trailer: Trailer::Last,
            },
            Err(e) => self.fail(Operation::default(), e.code(), "query by result"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Build an ERROR datagram and log it.
    fn fail(&self, operation: Operation, code: ErrorCode, context: &str) -> Response {
        let session_id = self.state.session_id().unwrap_or(0);
        log::error!("{code} on session: {session_id} ({context})");
        Response::Error {
            status: Status::Error,
            session_id,
            operation,
            code,
        }
    }

    /// Enter [`ConnectionState::Closed`]: drop the session and the socket.
    async fn close(&mut self) {
        if let Some(id) = self.state.session_id() {
            if let Err(e) = self.shared.sessions.mark_dead(id) {
                log::debug!("{}: session already gone on close: {e}", self.peer);
            }
            self.shared.sessions.remove(id);
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("{}: shutdown failed: {e}", self.peer);
        }
        log::info!("connection closed: {}", self.peer);
    }
}

fn operation_of(request: &Request) -> Operation {
    match *request {
        Request::Operation { operation, .. } => operation,
        _ => Operation::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::ArithmeticError;
    use tokio::io::{duplex, DuplexStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn handler(shared: SharedState) -> (Connection<DuplexStream>, DatagramStream<DuplexStream>) {
        let (server, client) = duplex(4096);
        (
            Connection::new(DatagramStream::new(server), peer(), shared),
            DatagramStream::new(client),
        )
    }

    async fn connected(shared: SharedState) -> (Connection<DuplexStream>, DatagramStream<DuplexStream>, SessionId) {
        let (mut conn, client) = handler(shared);
        let reply = conn.handle(Request::Connect).await.unwrap();
        let Response::Connect {
            status: Status::Ok,
            session_id,
        } = reply
        else {
            panic!("unexpected reply {reply:?}");
        };
        (conn, client, session_id)
    }

    #[test]
    fn result_stream_marks_only_the_final_item_last() {
        let record = |id| ResultRecord {
            result_id: id,
            session_id: 1,
            operation: Operation::Power,
            a: 1.0,
            b: 1.0,
            value: 1.0,
        };
        let items: Vec<_> =
            ResultStream::new(RecordMode::QueryBySessionId, vec![record(1), record(2), record(3)])
                .collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], Outbound::More(_)));
        assert!(matches!(items[1], Outbound::More(_)));
        assert!(matches!(items[2], Outbound::Last(r) if r.trailer() == Trailer::Last));
        assert_eq!(ResultStream::new(RecordMode::QueryBySessionId, vec![]).count(), 0);
    }

    #[tokio::test]
    async fn requests_before_connect_are_refused_and_connection_waits() {
        let (mut conn, _client) = handler(SharedState::default());
        let reply = conn
            .handle(Request::QueryBySessionId { session_id: 1 })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Response::Error {
                status: Status::Refused,
                session_id: 0,
                operation: Operation::Power,
                code: ErrorCode::Unauthorised,
            }
        );
        assert_eq!(conn.state, ConnectionState::AwaitingConnect);

        conn.handle(Request::Connect).await.unwrap();
        assert_eq!(conn.state, ConnectionState::Authenticated(1));
    }

    #[tokio::test]
    async fn second_connect_does_not_reassign() {
        let (mut conn, _client, id) = connected(SharedState::default()).await;
        let reply = conn.handle(Request::Connect).await.unwrap();
        assert_eq!(
            reply,
            Response::Connect {
                status: Status::Refused,
                session_id: id
            }
        );
        assert_eq!(conn.state, ConnectionState::Authenticated(id));
    }

    #[tokio::test]
    async fn foreign_session_id_is_unauthorised_and_kills_session() {
        let shared = SharedState::default();
        let (mut conn, _client, id) = connected(shared.clone()).await;
        let reply = conn
            .handle(Request::IsAlive { session_id: id + 1 })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Response::Error {
                code: ErrorCode::Unauthorised,
                ..
            }
        ));
        assert_eq!(conn.state, ConnectionState::Authenticated(id));

        let reply = conn.handle(Request::IsAlive { session_id: id }).await.unwrap();
        assert_eq!(
            reply,
            Response::IsAlive {
                status: Status::Refused,
                session_id: id
            }
        );
        assert!(!shared.sessions.is_alive(id));

        // Everything but IS_ALIVE and DISCONNECT is now refused.
        let reply = conn
            .handle(Request::QueryBySessionId { session_id: id })
            .await
            .unwrap();
        assert_eq!(reply, Response::error(id, ErrorCode::SessionIdNotFound));
        assert_eq!(conn.state, ConnectionState::Authenticated(id));
    }

    #[tokio::test]
    async fn removed_session_is_not_found() {
        let shared = SharedState::default();
        let (mut conn, _client, id) = connected(shared.clone()).await;
        shared.sessions.remove(id);
        let reply = conn.handle(Request::IsAlive { session_id: id }).await.unwrap();
        assert_eq!(reply, Response::error(id, ErrorCode::SessionIdNotFound));
    }

    #[tokio::test]
    async fn failed_operation_stores_nothing() {
        let shared = SharedState::default();
        let (mut conn, _client, id) = connected(shared.clone()).await;
        let reply = conn
            .handle(Request::Operation {
                session_id: id,
                operation: Operation::BinCoe,
                a: 3.0,
                b: 5.0,
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Response::Error {
                status: Status::Error,
                session_id: id,
                operation: Operation::BinCoe,
                code: ErrorCode::InvalidArgument,
            }
        );
        assert!(shared.results.is_empty());
        assert_eq!(shared.results.next_result_id(), Ok(1));
    }

    #[tokio::test]
    async fn panicking_provider_is_internal_server_error() {
        let shared = SharedState::default().with_arithmetic(Box::new(
            |_op: Operation, _a: f64, _b: f64| -> Result<f64, ArithmeticError> {
                panic!("provider bug")
            },
        ));
        let (mut conn, _client, id) = connected(shared).await;
        let reply = conn
            .handle(Request::Operation {
                session_id: id,
                operation: Operation::Log,
                a: 2.0,
                b: 8.0,
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Response::Error {
                code: ErrorCode::InternalServerError,
                ..
            }
        ));
        assert_eq!(conn.state, ConnectionState::Authenticated(id));
    }

    #[tokio::test]
    async fn query_by_session_streams_all_but_last_directly() {
        let (mut conn, mut client, id) = connected(SharedState::default()).await;
        for b in 1..=3 {
            conn.handle(Request::Operation {
                session_id: id,
                operation: Operation::Power,
                a: 2.0,
                b: f64::from(b),
            })
            .await
            .unwrap();
        }

        let last = conn
            .handle(Request::QueryBySessionId { session_id: id })
            .await
            .unwrap();
        assert_eq!(last.trailer(), Trailer::Last);

        for expected in [2.0, 4.0] {
            let Response::Record { record, trailer, .. } = client.recv_response().await.unwrap()
            else {
                panic!("expected record");
            };
            assert_eq!(record.value, expected);
            assert_eq!(trailer, Trailer::More);
        }
        let Response::Record { record, .. } = last else {
            panic!("expected record");
        };
        assert_eq!(record.value, 8.0);
    }

    #[tokio::test]
    async fn disconnect_closes_and_removes_session() {
        let shared = SharedState::default();
        let (mut conn, _client, id) = connected(shared.clone()).await;
        let reply = conn
            .handle(Request::Disconnect { session_id: id })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Response::Disconnect {
                status: Status::Ok,
                session_id: id
            }
        );
        assert!(conn.state.is_closed());
        assert!(shared.sessions.lookup(id).is_none());
    }

    #[tokio::test]
    async fn run_answers_garbage_and_survives() {
        let shared = SharedState::default();
        let (conn, mut client) = handler(shared.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(conn.run(stop_rx));

        client.send_request(&Request::Connect).await.unwrap();
        let id = client.recv_response().await.unwrap().session_id();

        let mut raw = client.into_inner();
        tokio::io::AsyncWriteExt::write_all(&mut raw, &[0xFF, 0x00, 0x00])
            .await
            .unwrap();
        let mut client = DatagramStream::new(raw);
        assert_eq!(
            client.recv_response().await.unwrap(),
            Response::error(id, ErrorCode::CannotReadDatagram)
        );

        client
            .send_request(&Request::Disconnect { session_id: id })
            .await
            .unwrap();
        assert_eq!(client.recv_response().await.unwrap().status(), Status::Ok);
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert!(shared.sessions.is_empty());
    }

    #[tokio::test]
    async fn stop_signal_closes_idle_connection() {
        let shared = SharedState::default();
        let (conn, mut client) = handler(shared.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(conn.run(stop_rx));

        client.send_request(&Request::Connect).await.unwrap();
        client.recv_response().await.unwrap();
        assert_eq!(shared.sessions.len(), 1);

        stop_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert!(shared.sessions.is_empty());
        assert!(matches!(
            client.recv_response().await,
            Err(StreamError::Closed)
        ));
    }
}
