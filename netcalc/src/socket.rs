//! Datagram-oriented stream wrapper.
//!
//! [`DatagramStream`] sits on top of any async byte stream (a `TcpStream` in
//! production, an in-memory duplex pipe in tests) and speaks
//! [`crate::datagram`] values instead of raw bytes.  All protocol logic
//! lives elsewhere; this module owns only framing and byte I/O.
//!
//! The wire carries no length prefix, so framing relies on the codec: bytes
//! are buffered until a whole datagram decodes, and anything left over is
//! kept for the next call.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::datagram::{CodecError, Request, Response, MAX_DATAGRAM_LEN};

const READ_CHUNK: usize = 4 * MAX_DATAGRAM_LEN;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from stream operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Underlying I/O error from the OS.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The buffered bytes could not be decoded.  The stream itself is still
    /// usable; the offending bytes have been discarded.
    #[error("datagram decode error: {0}")]
    Codec(#[from] CodecError),
    /// The peer closed its half of the connection.
    #[error("connection closed by peer")]
    Closed,
}

impl StreamError {
    /// `true` for errors after which the connection is unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamError::Codec(_))
    }
}

// ---------------------------------------------------------------------------
// DatagramStream
// ---------------------------------------------------------------------------

/// A datagram-framed byte stream.
#[derive(Debug)]
pub struct DatagramStream<S> {
    inner: S,
    /// Bytes received but not yet decoded.
    pending: Vec<u8>,
    /// How long the rest of a partially received datagram may take.
    frame_timeout: Duration,
}

impl DatagramStream<TcpStream> {
    /// Open a TCP connection to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, StreamError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> DatagramStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(READ_CHUNK),
            frame_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_frame_timeout(mut self, frame_timeout: Duration) -> Self {
        self.frame_timeout = frame_timeout;
        self
    }

    /// Receive the next request (server side).
    ///
    /// Cancel-safe: dropping the future never loses buffered bytes.
    pub async fn recv_request(&mut self) -> Result<Request, StreamError> {
        self.recv_with(Request::decode).await
    }

    /// Receive the next response (client side).
    ///
    /// Cancel-safe: dropping the future never loses buffered bytes.
    pub async fn recv_response(&mut self) -> Result<Response, StreamError> {
        self.recv_with(Response::decode).await
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<(), StreamError> {
        self.write(&request.encode()).await
    }

    pub async fn send_response(&mut self, response: &Response) -> Result<(), StreamError> {
        self.write(&response.encode()).await
    }

    /// Close the write half.
    pub async fn shutdown(&mut self) -> Result<(), StreamError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn recv_with<T>(
        &mut self,
        decode: fn(&[u8]) -> Result<(T, usize), CodecError>,
    ) -> Result<T, StreamError> {
        loop {
            if !self.pending.is_empty() {
                match decode(&self.pending) {
                    Ok((value, used)) => {
                        self.pending.drain(..used);
                        return Ok(value);
                    }
                    Err(e) if e.is_truncated() => {}
                    Err(e) => {
                        // No length field to resynchronise on: drop everything.
                        self.pending.clear();
                        return Err(e.into());
                    }
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = if self.pending.is_empty() {
                self.inner.read(&mut chunk).await?
            } else {
                match timeout(self.frame_timeout, self.inner.read(&mut chunk)).await {
                    Ok(read) => read?,
                    Err(_elapsed) => {
                        let partial = std::mem::take(&mut self.pending);
                        log::debug!("dropping {} byte(s) of incomplete datagram", partial.len());
                        return Err(match decode(&partial) {
                            Err(e) => e.into(),
                            Ok(_) => StreamError::Closed,
                        });
                    }
                }
            };

            if n == 0 {
                return Err(StreamError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}
