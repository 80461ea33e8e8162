//! Wire-format definitions for netcalc datagrams.
//!
//! Every message exchanged between client and server is a [`Datagram`]:
//! either a [`Request`] (client → server) or a [`Response`]
//! (server → client).  This module is responsible for:
//! - Defining the bit-packed layout of the header and every payload shape.
//! - Encoding a [`Datagram`] into bytes ready for transmission.
//! - Decoding bytes back into a [`Datagram`], returning errors for truncated
//!   or out-of-range input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! Multi-bit fields are big-endian (MSB first) and packed with no padding
//! between them.  The datagram as a whole is zero-padded to a byte boundary.
//! There is no length field: the receiver derives the length from `mode` and
//! from which side of the conversation it is on.
//!
//! ```text
//!  header (21 bits, always present)
//!  +--------+----------+----------------------------------+
//!  | status |   mode   |            session_id            |
//!  |   2    |    3     |                16                |
//!  +--------+----------+----------------------------------+
//!
//!  OPERATION request           op(2) a(64) b(64)
//!  QUERY_BY_RESULT_ID request  result_id(32)
//!  record response             op(2) a(64) b(64) result(64) result_id(32) last(1)
//!  ERROR response              op(2) a(64, error code) last(1)
//! ```
//!
//! CONNECT, DISCONNECT, IS_ALIVE and QUERY_BY_SESSION_ID requests, and
//! CONNECT, DISCONNECT and IS_ALIVE responses, are header-only.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::bits::{BitReader, BitWriter};

pub type SessionId = u16;
pub type ResultId = u32;

/// Bit length of the fixed header.
pub const HEADER_BITS: usize = 2 + 3 + 16;

const STATUS_BITS: u32 = 2;
const MODE_BITS: u32 = 3;
const SESSION_BITS: u32 = 16;
const OPERATION_BITS: u32 = 2;
const F64_BITS: u32 = 64;
const RESULT_ID_BITS: u32 = 32;

const OPERATION_REQUEST_BITS: usize = 2 + 64 + 64;
const RESULT_QUERY_REQUEST_BITS: usize = 32;
const RECORD_RESPONSE_BITS: usize = 2 + 64 + 64 + 64 + 32 + 1;
const ERROR_RESPONSE_BITS: usize = 2 + 64 + 1;

/// Largest encoded datagram, in bytes (a record response).
pub const MAX_DATAGRAM_LEN: usize = (HEADER_BITS + RECORD_RESPONSE_BITS).div_ceil(8);

// ---------------------------------------------------------------------------
// Enumerated header and payload fields
// ---------------------------------------------------------------------------

/// Outcome / role marker carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    New,
    Ok,
    Refused,
    Error,
}

impl Status {
    fn from_bits(value: u64) -> Self {
        match value & 0b11 {
            0 => Status::New,
            1 => Status::Ok,
            2 => Status::Refused,
            _ => Status::Error,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Status::New => 0,
            Status::Ok => 1,
            Status::Refused => 2,
            Status::Error => 3,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::New => "NEW",
            Status::Ok => "OK",
            Status::Refused => "REFUSED",
            Status::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Selects the request/response schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Connect,
    Disconnect,
    Operation,
    QueryBySessionId,
    QueryByResultId,
    Error,
    IsAlive,
}

impl Mode {
    pub fn from_bits(value: u64) -> Option<Self> {
        Some(match value {
            0 => Mode::Connect,
            1 => Mode::Disconnect,
            2 => Mode::Operation,
            3 => Mode::QueryBySessionId,
            4 => Mode::QueryByResultId,
            5 => Mode::Error,
            6 => Mode::IsAlive,
            _ => return None,
        })
    }

    pub fn to_bits(self) -> u64 {
        match self {
            Mode::Connect => 0,
            Mode::Disconnect => 1,
            Mode::Operation => 2,
            Mode::QueryBySessionId => 3,
            Mode::QueryByResultId => 4,
            Mode::Error => 5,
            Mode::IsAlive => 6,
        }
    }

    /// Payload length in bits following the header, or `None` when the mode
    /// is not valid for `role`.
    pub fn payload_bits(self, role: Role) -> Option<usize> {
        match (role, self) {
            (Role::Request, Mode::Operation) => Some(OPERATION_REQUEST_BITS),
            (Role::Request, Mode::QueryByResultId) => Some(RESULT_QUERY_REQUEST_BITS),
            (Role::Request, Mode::Error) => None,
            (Role::Request, _) => Some(0),
            (
                Role::Response,
                Mode::Operation | Mode::QueryBySessionId | Mode::QueryByResultId,
            ) => Some(RECORD_RESPONSE_BITS),
            (Role::Response, Mode::Error) => Some(ERROR_RESPONSE_BITS),
            (Role::Response, _) => Some(0),
        }
    }

    /// Whole-datagram length in bytes, including padding.
    pub fn encoded_len(self, role: Role) -> Option<usize> {
        self.payload_bits(role)
            .map(|bits| (HEADER_BITS + bits).div_ceil(8))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Connect => "CONNECT",
            Mode::Disconnect => "DISCONNECT",
            Mode::Operation => "OPERATION",
            Mode::QueryBySessionId => "QUERY_BY_SESSION_ID",
            Mode::QueryByResultId => "QUERY_BY_RESULT_ID",
            Mode::Error => "ERROR",
            Mode::IsAlive => "IS_ALIVE",
        };
        f.write_str(name)
    }
}

/// Arithmetic operation requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operation {
    #[default]
    Power,
    Log,
    GeoMean,
    BinCoe,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Power,
        Operation::Log,
        Operation::GeoMean,
        Operation::BinCoe,
    ];

    fn from_bits(value: u64) -> Self {
        match value & 0b11 {
            0 => Operation::Power,
            1 => Operation::Log,
            2 => Operation::GeoMean,
            _ => Operation::BinCoe,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Operation::Power => 0,
            Operation::Log => 1,
            Operation::GeoMean => 2,
            Operation::BinCoe => 3,
        }
    }

    /// Console keyword for this operation.
    pub fn command(self) -> &'static str {
        match self {
            Operation::Power => "power",
            Operation::Log => "log",
            Operation::GeoMean => "GM",
            Operation::BinCoe => "aCb",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.command() == s)
            .ok_or_else(|| format!("Unknown operation: {}", s))
    }
}

/// Protocol error codes, carried in the `a` field of ERROR datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SessionIdNotFound,
    Unauthorised,
    CannotReadDatagram,
    InternalServerError,
    NotExistingData,
    InvalidArgument,
    MaxValueExceeded,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ErrorCode::SessionIdNotFound,
            1 => ErrorCode::Unauthorised,
            2 => ErrorCode::CannotReadDatagram,
            3 => ErrorCode::InternalServerError,
            4 => ErrorCode::NotExistingData,
            5 => ErrorCode::InvalidArgument,
            6 => ErrorCode::MaxValueExceeded,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ErrorCode::SessionIdNotFound => 0,
            ErrorCode::Unauthorised => 1,
            ErrorCode::CannotReadDatagram => 2,
            ErrorCode::InternalServerError => 3,
            ErrorCode::NotExistingData => 4,
            ErrorCode::InvalidArgument => 5,
            ErrorCode::MaxValueExceeded => 6,
        }
    }

    /// Recover a code from the floating-point `a` slot.
    fn from_f64(value: f64) -> Option<Self> {
        if value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
            return None;
        }
        Self::from_u8(value as u8)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::SessionIdNotFound => "SESSION_ID_NOT_FOUND",
            ErrorCode::Unauthorised => "UNAUTHORISED",
            ErrorCode::CannotReadDatagram => "CANNOT_READ_DATAGRAM",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::NotExistingData => "NOT_EXISTING_DATA",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::MaxValueExceeded => "MAX_VALUE_EXCEEDED",
        };
        f.write_str(name)
    }
}

/// Streaming trailer: whether more datagrams of the same logical response
/// follow this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    More,
    Last,
}

impl Trailer {
    pub fn is_last(self) -> bool {
        self == Trailer::Last
    }

    fn from_bit(bit: bool) -> Self {
        if bit {
            Trailer::Last
        } else {
            Trailer::More
        }
    }
}

/// Which side produced a datagram; decides the payload shape for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

// ---------------------------------------------------------------------------
// Datagram variants
// ---------------------------------------------------------------------------

/// One stored computation, as carried by record responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRecord {
    pub result_id: ResultId,
    pub session_id: SessionId,
    pub operation: Operation,
    pub a: f64,
    pub b: f64,
    pub value: f64,
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [session {}] {} {} {} -> {}",
            self.result_id, self.session_id, self.operation, self.a, self.b, self.value
        )
    }
}

/// Client → server messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    Connect,
    Disconnect {
        session_id: SessionId,
    },
    IsAlive {
        session_id: SessionId,
    },
    Operation {
        session_id: SessionId,
        operation: Operation,
        a: f64,
        b: f64,
    },
    QueryBySessionId {
        session_id: SessionId,
    },
    QueryByResultId {
        session_id: SessionId,
        result_id: ResultId,
    },
}

impl Request {
    pub fn mode(&self) -> Mode {
        match self {
            Request::Connect => Mode::Connect,
            Request::Disconnect { .. } => Mode::Disconnect,
            Request::IsAlive { .. } => Mode::IsAlive,
            Request::Operation { .. } => Mode::Operation,
            Request::QueryBySessionId { .. } => Mode::QueryBySessionId,
            Request::QueryByResultId { .. } => Mode::QueryByResultId,
        }
    }

    /// Session id presented by the client; `0` for CONNECT.
    pub fn session_id(&self) -> SessionId {
        match *self {
            Request::Connect => 0,
            Request::Disconnect { session_id }
            | Request::IsAlive { session_id }
            | Request::Operation { session_id, .. }
            | Request::QueryBySessionId { session_id }
            | Request::QueryByResultId { session_id, .. } => session_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = header(Status::New, self.mode(), self.session_id(), Role::Request);
        match *self {
            Request::Operation {
                operation, a, b, ..
            } => {
                w.write_bits(operation.to_bits(), OPERATION_BITS);
                w.write_f64(a);
                w.write_f64(b);
            }
            Request::QueryByResultId { result_id, .. } => {
                w.write_bits(u64::from(result_id), RESULT_ID_BITS);
            }
            _ => {}
        }
        w.finish()
    }

    /// Decode one request from the front of `buf`.
    ///
    /// Returns the request and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (mut r, status, mode, session_id) = read_header(buf, Role::Request)?;
        if status != Status::New {
            return Err(CodecError::UnexpectedStatus { status, mode });
        }

        let request = match mode {
            Mode::Connect => Request::Connect,
            Mode::Disconnect => Request::Disconnect { session_id },
            Mode::IsAlive => Request::IsAlive { session_id },
            Mode::QueryBySessionId => Request::QueryBySessionId { session_id },
            Mode::Operation => Request::Operation {
                session_id,
                operation: Operation::from_bits(field(&mut r, OPERATION_BITS)?),
                a: f64_field(&mut r)?,
                b: f64_field(&mut r)?,
            },
            Mode::QueryByResultId => Request::QueryByResultId {
                session_id,
                result_id: field(&mut r, RESULT_ID_BITS)? as ResultId,
            },
            Mode::Error => {
                return Err(CodecError::ModeNotAllowed {
                    mode,
                    role: Role::Request,
                })
            }
        };
        Ok((request, r.consumed_bytes()))
    }
}

/// Modes whose response carries a [`ResultRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Operation,
    QueryBySessionId,
    QueryByResultId,
}

impl From<RecordMode> for Mode {
    fn from(mode: RecordMode) -> Self {
        match mode {
            RecordMode::Operation => Mode::Operation,
            RecordMode::QueryBySessionId => Mode::QueryBySessionId,
            RecordMode::QueryByResultId => Mode::QueryByResultId,
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    Connect {
        status: Status,
        session_id: SessionId,
    },
    Disconnect {
        status: Status,
        session_id: SessionId,
    },
    IsAlive {
        status: Status,
        session_id: SessionId,
    },
    /// A stored computation. The header session id is the record's owner.
    Record {
        mode: RecordMode,
        record: ResultRecord,
        trailer: Trailer,
    },
    /// Always terminates its logical response.
    Error {
        status: Status,
        session_id: SessionId,
        operation: Operation,
        code: ErrorCode,
    },
}

impl Response {
    pub fn mode(&self) -> Mode {
        match self {
            Response::Connect { .. } => Mode::Connect,
            Response::Disconnect { .. } => Mode::Disconnect,
            Response::IsAlive { .. } => Mode::IsAlive,
            Response::Record { mode, .. } => (*mode).into(),
            Response::Error { .. } => Mode::Error,
        }
    }

    pub fn status(&self) -> Status {
        match *self {
            Response::Connect { status, .. }
            | Response::Disconnect { status, .. }
            | Response::IsAlive { status, .. }
            | Response::Error { status, .. } => status,
            Response::Record { .. } => Status::Ok,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match *self {
            Response::Connect { session_id, .. }
            | Response::Disconnect { session_id, .. }
            | Response::IsAlive { session_id, .. }
            | Response::Error { session_id, .. } => session_id,
            Response::Record { record, .. } => record.session_id,
        }
    }

    pub fn trailer(&self) -> Trailer {
        match *self {
            Response::Record { trailer, .. } => trailer,
            _ => Trailer::Last,
        }
    }

    /// Shorthand for an ERROR-status error datagram.
    pub fn error(session_id: SessionId, code: ErrorCode) -> Self {
        Response::Error {
            status: Status::Error,
            session_id,
            operation: Operation::default(),
            code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = header(self.status(), self.mode(), self.session_id(), Role::Response);
        match *self {
            Response::Record {
                record, trailer, ..
            } => {
                w.write_bits(record.operation.to_bits(), OPERATION_BITS);
                w.write_f64(record.a);
                w.write_f64(record.b);
                w.write_f64(record.value);
                w.write_bits(u64::from(record.result_id), RESULT_ID_BITS);
                w.write_bool(trailer.is_last());
            }
            Response::Error {
                operation, code, ..
            } => {
                w.write_bits(operation.to_bits(), OPERATION_BITS);
                w.write_f64(f64::from(code.to_u8()));
                w.write_bool(true);
            }
            _ => {}
        }
        w.finish()
    }

    /// Decode one response from the front of `buf`.
    ///
    /// Returns the response and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (mut r, status, mode, session_id) = read_header(buf, Role::Response)?;

        let response = match mode {
            Mode::Connect => Response::Connect { status, session_id },
            Mode::Disconnect => Response::Disconnect { status, session_id },
            Mode::IsAlive => Response::IsAlive { status, session_id },
            Mode::Operation | Mode::QueryBySessionId | Mode::QueryByResultId => {
                if status != Status::Ok {
                    return Err(CodecError::UnexpectedStatus { status, mode });
                }
                let operation = Operation::from_bits(field(&mut r, OPERATION_BITS)?);
                let a = f64_field(&mut r)?;
                let b = f64_field(&mut r)?;
                let value = f64_field(&mut r)?;
                let result_id = field(&mut r, RESULT_ID_BITS)? as ResultId;
                let trailer = Trailer::from_bit(field(&mut r, 1)? == 1);
                let mode = match mode {
                    Mode::Operation => RecordMode::Operation,
                    Mode::QueryBySessionId => RecordMode::QueryBySessionId,
                    _ => RecordMode::QueryByResultId,
                };
                Response::Record {
                    mode,
                    record: ResultRecord {
                        result_id,
                        session_id,
                        operation,
                        a,
                        b,
                        value,
                    },
                    trailer,
                }
            }
            Mode::Error => {
                let operation = Operation::from_bits(field(&mut r, OPERATION_BITS)?);
                let raw = f64_field(&mut r)?;
                let code = ErrorCode::from_f64(raw).ok_or(CodecError::InvalidErrorCode(raw))?;
                // The trailer bit of an error datagram is always set.
                field(&mut r, 1)?;
                Response::Error {
                    status,
                    session_id,
                    operation,
                    code,
                }
            }
        };
        Ok((response, r.consumed_bytes()))
    }
}

/// Either side of the conversation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datagram {
    Request(Request),
    Response(Response),
}

impl Datagram {
    pub fn role(&self) -> Role {
        match self {
            Datagram::Request(_) => Role::Request,
            Datagram::Response(_) => Role::Response,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Datagram::Request(req) => req.encode(),
            Datagram::Response(resp) => resp.encode(),
        }
    }

    /// Decode a datagram produced by `role`.
    pub fn decode(buf: &[u8], role: Role) -> Result<(Self, usize), CodecError> {
        match role {
            Role::Request => Request::decode(buf).map(|(r, n)| (Datagram::Request(r), n)),
            Role::Response => Response::decode(buf).map(|(r, n)| (Datagram::Response(r), n)),
        }
    }
}

impl From<Request> for Datagram {
    fn from(req: Request) -> Self {
        Datagram::Request(req)
    }
}

impl From<Response> for Datagram {
    fn from(resp: Response) -> Self {
        Datagram::Response(resp)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can arise when decoding a datagram.
///
/// Every variant is reported to the peer as
/// [`ErrorCode::CannotReadDatagram`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("datagram truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid mode value {0}")]
    InvalidMode(u8),
    #[error("mode {mode} is not valid in a {role:?}")]
    ModeNotAllowed { mode: Mode, role: Role },
    #[error("unexpected status {status} for mode {mode}")]
    UnexpectedStatus { status: Status, mode: Mode },
    #[error("invalid error code {0}")]
    InvalidErrorCode(f64),
}

impl CodecError {
    /// `true` when more bytes could turn this input into a valid datagram.
    pub fn is_truncated(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::CannotReadDatagram
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn header(status: Status, mode: Mode, session_id: SessionId, role: Role) -> BitWriter {
    let len = mode.encoded_len(role).unwrap_or(MAX_DATAGRAM_LEN);
    let mut w = BitWriter::with_capacity(len);
    w.write_bits(status.to_bits(), STATUS_BITS);
    w.write_bits(mode.to_bits(), MODE_BITS);
    w.write_bits(u64::from(session_id), SESSION_BITS);
    w
}

/// Read and validate the header, then check that the whole payload for the
/// mode is present so field reads below cannot run short.
fn read_header(
    buf: &[u8],
    role: Role,
) -> Result<(BitReader<'_>, Status, Mode, SessionId), CodecError> {
    let header_len = HEADER_BITS.div_ceil(8);
    if buf.len() < header_len {
        return Err(CodecError::Truncated {
            needed: header_len,
            available: buf.len(),
        });
    }

    let mut r = BitReader::new(buf);
    let status = Status::from_bits(field(&mut r, STATUS_BITS)?);
    let raw_mode = field(&mut r, MODE_BITS)?;
    let mode = Mode::from_bits(raw_mode).ok_or(CodecError::InvalidMode(raw_mode as u8))?;
    let session_id = field(&mut r, SESSION_BITS)? as SessionId;

    let needed = mode
        .encoded_len(role)
        .ok_or(CodecError::ModeNotAllowed { mode, role })?;
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok((r, status, mode, session_id))
}

fn field(r: &mut BitReader<'_>, width: u32) -> Result<u64, CodecError> {
    let available = r.remaining_bits() / 8;
    r.read_bits(width).ok_or(CodecError::Truncated {
        needed: available + (width as usize).div_ceil(8),
        available,
    })
}

fn f64_field(r: &mut BitReader<'_>) -> Result<f64, CodecError> {
    field(r, F64_BITS).map(f64::from_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(result_id: ResultId, session_id: SessionId) -> ResultRecord {
        ResultRecord {
            result_id,
            session_id,
            operation: Operation::Power,
            a: 2.0,
            b: 10.0,
            value: 1024.0,
        }
    }

    fn request_roundtrip(req: Request) {
        let bytes = req.encode();
        assert_eq!(Some(bytes.len()), req.mode().encoded_len(Role::Request));
        assert_eq!(Request::decode(&bytes), Ok((req, bytes.len())));
    }

    fn response_roundtrip(resp: Response) {
        let bytes = resp.encode();
        assert_eq!(Some(bytes.len()), resp.mode().encoded_len(Role::Response));
        assert_eq!(Response::decode(&bytes), Ok((resp, bytes.len())));
    }

    #[test]
    fn every_request_shape_roundtrips() {
        request_roundtrip(Request::Connect);
        request_roundtrip(Request::Disconnect { session_id: 7 });
        request_roundtrip(Request::IsAlive { session_id: 7 });
        request_roundtrip(Request::QueryBySessionId { session_id: 65535 });
        request_roundtrip(Request::QueryByResultId {
            session_id: 3,
            result_id: u32::MAX,
        });
        for operation in Operation::ALL {
            request_roundtrip(Request::Operation {
                session_id: 12,
                operation,
                a: -0.25,
                b: f64::MAX,
            });
        }
    }

    #[test]
    fn every_response_shape_roundtrips() {
        for status in [Status::Ok, Status::Refused] {
            response_roundtrip(Response::Connect {
                status,
                session_id: 1,
            });
            response_roundtrip(Response::IsAlive {
                status,
                session_id: 1,
            });
        }
        response_roundtrip(Response::Disconnect {
            status: Status::Ok,
            session_id: 9,
        });
        for mode in [
            RecordMode::Operation,
            RecordMode::QueryBySessionId,
            RecordMode::QueryByResultId,
        ] {
            for trailer in [Trailer::More, Trailer::Last] {
                response_roundtrip(Response::Record {
                    mode,
                    record: record(42, 5),
                    trailer,
                });
            }
        }
        for code in (0..7).filter_map(ErrorCode::from_u8) {
            response_roundtrip(Response::Error {
                status: Status::Error,
                session_id: 4,
                operation: Operation::BinCoe,
                code,
            });
        }
        response_roundtrip(Response::Error {
            status: Status::Refused,
            session_id: 0,
            operation: Operation::Power,
            code: ErrorCode::Unauthorised,
        });
    }

    #[test]
    fn encoded_sizes_match_layout() {
        assert_eq!(Request::Connect.encode().len(), 3);
        assert_eq!(
            Request::Operation {
                session_id: 1,
                operation: Operation::Log,
                a: 1.0,
                b: 2.0
            }
            .encode()
            .len(),
            19
        );
        assert_eq!(
            Request::QueryByResultId {
                session_id: 1,
                result_id: 1
            }
            .encode()
            .len(),
            7
        );
        assert_eq!(Response::error(1, ErrorCode::Unauthorised).encode().len(), 11);
        assert_eq!(MAX_DATAGRAM_LEN, 31);
    }

    #[test]
    fn header_bits_are_laid_out_big_endian() {
        // status OK(01), mode CONNECT(000), session 0x0102
        let bytes = Response::Connect {
            status: Status::Ok,
            session_id: 0x0102,
        }
        .encode();
        // 01000000 00001000 00010|000
        assert_eq!(bytes, vec![0b0100_0000, 0b0000_1000, 0b0001_0000]);
    }

    #[test]
    fn decode_consumes_only_its_own_bytes() {
        let first = Request::Operation {
            session_id: 2,
            operation: Operation::GeoMean,
            a: 4.0,
            b: 9.0,
        };
        let second = Request::IsAlive { session_id: 2 };
        let mut bytes = first.encode();
        let first_len = bytes.len();
        bytes.extend(second.encode());

        let (decoded, used) = Request::decode(&bytes).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(used, first_len);
        assert_eq!(Request::decode(&bytes[used..]).unwrap().0, second);
    }

    #[test]
    fn decode_empty_buffer_is_truncated() {
        assert_eq!(
            Request::decode(&[]),
            Err(CodecError::Truncated {
                needed: 3,
                available: 0
            })
        );
    }

    #[test]
    fn decode_short_payload_is_truncated() {
        let bytes = Request::Operation {
            session_id: 1,
            operation: Operation::Power,
            a: 1.0,
            b: 1.0,
        }
        .encode();
        let err = Request::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 19,
                available: 18
            }
        );
        assert!(err.is_truncated());
    }

    #[test]
    fn decode_rejects_mode_seven() {
        // status NEW(00), mode 111
        let bytes = [0b0011_1000, 0, 0];
        assert_eq!(Request::decode(&bytes), Err(CodecError::InvalidMode(7)));
        assert_eq!(Response::decode(&bytes), Err(CodecError::InvalidMode(7)));
    }

    #[test]
    fn error_mode_is_not_a_request() {
        let bytes = Response::error(1, ErrorCode::Unauthorised).encode();
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::ModeNotAllowed {
                mode: Mode::Error,
                role: Role::Request
            })
        ));
    }

    #[test]
    fn request_must_carry_new_status() {
        let mut bytes = Request::IsAlive { session_id: 1 }.encode();
        bytes[0] |= 0b0100_0000; // status OK
        assert_eq!(
            Request::decode(&bytes),
            Err(CodecError::UnexpectedStatus {
                status: Status::Ok,
                mode: Mode::IsAlive
            })
        );
    }

    #[test]
    fn out_of_range_error_code_is_rejected() {
        let mut w = header(Status::Error, Mode::Error, 1, Role::Response);
        w.write_bits(0, OPERATION_BITS);
        w.write_f64(9.0);
        w.write_bool(true);
        let bytes = w.finish();
        assert_eq!(
            Response::decode(&bytes),
            Err(CodecError::InvalidErrorCode(9.0))
        );
    }

    #[test]
    fn error_code_travels_in_a_slot() {
        let bytes = Response::error(3, ErrorCode::NotExistingData).encode();
        let mut r = BitReader::new(&bytes);
        r.read_bits(HEADER_BITS as u32 + OPERATION_BITS);
        assert_eq!(r.read_f64(), Some(4.0));
        assert_eq!(r.read_bool(), Some(true));
    }

    #[test]
    fn operation_parses_console_keywords() {
        assert_eq!("power".parse(), Ok(Operation::Power));
        assert_eq!("GM".parse(), Ok(Operation::GeoMean));
        assert_eq!("aCb".parse(), Ok(Operation::BinCoe));
        assert!("gm".parse::<Operation>().is_err());
    }
}
