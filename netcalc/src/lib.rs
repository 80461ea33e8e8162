//! `netcalc`: a calculator service speaking a bit-packed datagram protocol
//! over TCP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  requests   ┌──────────────────────────────┐
//!  │  Client  │────────────▶│ Server (accept loop)         │
//!  │ + probe  │◀────────────│   └─ Connection per socket   │
//!  └────┬─────┘  responses  └──────┬───────────────┬───────┘
//!       │                          │               │
//!  ┌────▼──────────┐        ┌──────▼──────┐ ┌──────▼──────┐
//!  │DatagramStream │        │SessionTable │ │ ResultStore │
//!  │ (framing)     │        └─────────────┘ └─────────────┘
//!  └────┬──────────┘
//!  ┌────▼──────┐
//!  │ datagram  │  (bit-level codec over `bits`)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`bits`]        : MSB-first bit reader / writer
//! - [`datagram`]    : wire format (serialise / deserialise)
//! - [`socket`]      : datagram framing over an async byte stream
//! - [`state`]       : connection finite-state-machine types
//! - [`connection`]  : per-connection request handling
//! - [`session`]     : session id allocation and liveness
//! - [`store`]       : per-session result storage
//! - [`calc`]        : default arithmetic provider
//! - [`server`]      : listener, shutdown and operator queries
//! - [`client`]      : client session and liveness probe
//! - [`console`]     : stdin command consoles
//! - [`config`]      : runtime parameters

pub mod bits;
pub mod calc;
pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod datagram;
pub mod server;
pub mod session;
pub mod socket;
pub mod state;
pub mod store;
