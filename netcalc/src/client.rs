//! netcalc client: session setup, requests and the liveness probe.
//!
//! # Usage
//!
//! ```ignore
//! let client = Client::connect(ClientConfig::default()).await?;
//! let record = client.operation(Operation::Power, 2.0, 10.0).await?;
//! let all = client.query_by_session().await?;
//! client.disconnect().await?;
//! ```
//!
//! The probe task and the caller share one connection.  Every exchange holds
//! the connection lock from the request write to the final response datagram
//! so probe traffic never interleaves with a streamed answer.
//!
//! A reply that misses `response_timeout` may still arrive later and would be
//! read as the answer to the next request, so a timeout (or any other
//! transport fault) marks the client dead for good.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::datagram::{
    ErrorCode, Mode, Operation, RecordMode, Request, Response, ResultId, ResultRecord, SessionId,
    Status, Trailer,
};
use crate::socket::{DatagramStream, StreamError};

type SharedStream = Arc<Mutex<DatagramStream<TcpStream>>>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("server refused to {mode}")]
    Refused { mode: Mode, code: Option<ErrorCode> },
    #[error("error on server: {code}")]
    Server { code: ErrorCode },
    #[error("unexpected {got} response to {sent}")]
    UnexpectedResponse { sent: Mode, got: Mode },
    #[error("connection is no longer alive")]
    Dead,
}

impl ClientError {
    /// Protocol error code reported by the server, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code } => Some(*code),
            ClientError::Refused { code, .. } => *code,
            _ => None,
        }
    }
}

/// A connected client session.
pub struct Client {
    stream: SharedStream,
    session_id: SessionId,
    response_timeout: Duration,
    alive: Arc<watch::Sender<bool>>,
    probe_stop: watch::Sender<bool>,
    probe: JoinHandle<()>,
}

impl Client {
    /// Connect to `config.server`, open a session and start the probe.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        log::info!("connecting to : {}", config.server);
        let mut stream = DatagramStream::connect(&config.server).await?;

        stream.send_request(&Request::Connect).await?;
        let response = recv(&mut stream, config.response_timeout).await?;
        let session_id = match response {
            Response::Connect {
                status: Status::Ok,
                session_id,
            } => session_id,
            Response::Connect { .. } => {
                log::warn!("{} refused to connect", config.server);
                return Err(ClientError::Refused {
                    mode: Mode::Connect,
                    code: None,
                });
            }
            other => return Err(unexpected(Mode::Connect, other)),
        };
        log::info!("connected to : {} as session {session_id}", config.server);

        let stream = Arc::new(Mutex::new(stream));
        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);
        let (probe_stop, stop_rx) = watch::channel(false);
        let probe = tokio::spawn(probe(
            Arc::clone(&stream),
            session_id,
            config.probe_interval,
            config.response_timeout,
            Arc::clone(&alive),
            stop_rx,
        ));

        Ok(Self {
            stream,
            session_id,
            response_timeout: config.response_timeout,
            alive,
            probe_stop,
            probe,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// `false` once a refusal, a timeout or a transport failure was seen.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Resolves when the connection is found dead.
    pub async fn dead(&self) {
        let mut alive = self.alive.subscribe();
        // The sender lives as long as `self`, so this only ends on `false`.
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    /// Run `operation` on the server and return the stored record.
    pub async fn operation(
        &self,
        operation: Operation,
        a: f64,
        b: f64,
    ) -> Result<ResultRecord, ClientError> {
        let request = Request::Operation {
            session_id: self.session_id,
            operation,
            a,
            b,
        };
        let response = self.exchange(request).await?;
        let (record, _) = self.record(RecordMode::Operation, response)?;
        if record.operation != operation {
            return Err(self.desync(Mode::Operation, response));
        }
        Ok(record)
    }

    /// Fetch every result stored by this session, oldest first.
    ///
    /// An empty history is reported by the server as
    /// [`ErrorCode::NotExistingData`].
    pub async fn query_by_session(&self) -> Result<Vec<ResultRecord>, ClientError> {
        self.ensure_alive()?;
        let mut stream = self.stream.lock().await;
        let request = Request::QueryBySessionId {
            session_id: self.session_id,
        };
        if let Err(e) = stream.send_request(&request).await {
            return Err(self.fault(e.into()));
        }

        let mut records = Vec::new();
        loop {
            let response = recv(&mut stream, self.response_timeout)
                .await
                .map_err(|e| self.fault(e))?;
            let (record, trailer) =
                self.record(RecordMode::QueryBySessionId, check(Mode::QueryBySessionId, response)?)?;
            records.push(record);
            if trailer.is_last() {
                return Ok(records);
            }
        }
    }

    /// Fetch one of this session's results by id.
    pub async fn query_by_result(&self, result_id: ResultId) -> Result<ResultRecord, ClientError> {
        let request = Request::QueryByResultId {
            session_id: self.session_id,
            result_id,
        };
        let response = self.exchange(request).await?;
        let (record, _) = self.record(RecordMode::QueryByResultId, response)?;
        if record.result_id != result_id {
            return Err(self.desync(Mode::QueryByResultId, response));
        }
        Ok(record)
    }

    /// Ask the server whether this session is still alive.
    pub async fn ping(&self) -> Result<bool, ClientError> {
        self.ensure_alive()?;
        let request = Request::IsAlive {
            session_id: self.session_id,
        };
        let mut stream = self.stream.lock().await;
        is_alive(&mut stream, request, self.response_timeout)
            .await
            .map_err(|e| self.fault(e))
    }

    /// Send DISCONNECT, wait for OK and stop the probe.
    ///
    /// A dead client only stops its probe; the server drops the session once
    /// the socket closes.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        log::info!("disconnecting session {}", self.session_id);
        self.probe_stop.send_replace(true);
        if !self.is_alive() {
            let _ = self.probe.await;
            return Err(ClientError::Dead);
        }

        let outcome = self
            .exchange(Request::Disconnect {
                session_id: self.session_id,
            })
            .await;

        let _ = self.probe.await;
        match outcome? {
            Response::Disconnect {
                status: Status::Ok, ..
            } => {
                log::info!("disconnected session {}", self.session_id);
                Ok(())
            }
            Response::Disconnect { .. } => Err(ClientError::Refused {
                mode: Mode::Disconnect,
                code: None,
            }),
            other => Err(unexpected(Mode::Disconnect, other)),
        }
    }

    /// One request, one response datagram.
    async fn exchange(&self, request: Request) -> Result<Response, ClientError> {
        self.ensure_alive()?;
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.send_request(&request).await {
            return Err(self.fault(e.into()));
        }
        let response = recv(&mut stream, self.response_timeout)
            .await
            .map_err(|e| self.fault(e))?;
        check(request.mode(), response)
    }

    /// Unpack a record reply, rejecting one produced for another request.
    fn record(
        &self,
        expected: RecordMode,
        response: Response,
    ) -> Result<(ResultRecord, Trailer), ClientError> {
        match response {
            Response::Record {
                mode,
                record,
                trailer,
            } if mode == expected && record.session_id == self.session_id => {
                Ok((record, trailer))
            }
            other => Err(self.desync(expected.into(), other)),
        }
    }

    /// The reply belongs to some other exchange: the stream is out of step.
    fn desync(&self, sent: Mode, got: Response) -> ClientError {
        log::warn!("{} reply to {sent} on session {}", got.mode(), self.session_id);
        self.fault(unexpected(sent, got))
    }

    /// Mark the client dead after a fault that leaves the stream unusable.
    fn fault(&self, e: ClientError) -> ClientError {
        log::warn!("session {} unusable: {e}", self.session_id);
        self.alive.send_replace(false);
        e
    }

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ClientError::Dead)
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness probe
// ---------------------------------------------------------------------------

async fn probe(
    stream: SharedStream,
    session_id: SessionId,
    interval: Duration,
    response_timeout: Duration,
    alive: Arc<watch::Sender<bool>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the session was just confirmed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() || !*alive.borrow() {
            break;
        }

        let request = Request::IsAlive { session_id };
        let outcome = {
            let mut stream = stream.lock().await;
            is_alive(&mut stream, request, response_timeout).await
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("server no longer recognises session {session_id}");
                alive.send_replace(false);
                break;
            }
            Err(e) => {
                log::warn!("liveness probe failed: {e}");
                alive.send_replace(false);
                break;
            }
        }
    }
}

async fn is_alive(
    stream: &mut DatagramStream<TcpStream>,
    request: Request,
    response_timeout: Duration,
) -> Result<bool, ClientError> {
    stream.send_request(&request).await?;
    match recv(stream, response_timeout).await? {
        Response::IsAlive { status, .. } => Ok(status == Status::Ok),
        Response::Error { .. } => Ok(false),
        other => Err(unexpected(Mode::IsAlive, other)),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn recv(
    stream: &mut DatagramStream<TcpStream>,
    limit: Duration,
) -> Result<Response, ClientError> {
    timeout(limit, stream.recv_response())
        .await
        .map_err(|_| ClientError::Timeout(limit))?
        .map_err(ClientError::from)
}

/// Turn ERROR / REFUSED error datagrams into [`ClientError`]s.
fn check(sent: Mode, response: Response) -> Result<Response, ClientError> {
    match response {
        Response::Error {
            status: Status::Refused,
            code,
            ..
        } => Err(ClientError::Refused {
            mode: sent,
            code: Some(code),
        }),
        Response::Error { code, .. } => Err(ClientError::Server { code }),
        other => Ok(other),
    }
}

fn unexpected(sent: Mode, got: Response) -> ClientError {
    ClientError::UnexpectedResponse {
        sent,
        got: got.mode(),
    }
}
