//! # Postroom
//!
//! A symmetric TCP messaging framework: the same connection abstraction
//! serves both client and server roles, frames have a fixed compiled-in
//! size, and each endpoint funnels everything it receives into one
//! thread-safe inbound queue for the application to drain.
//!
//! This crate provides:
//! - **Frame**: the fixed-layout wire message (kind + sender + payload +
//!   timestamp)
//! - **TsQueue**: a blocking thread-safe deque, used for per-connection
//!   outbound buffering and for the endpoint-wide inbound mailbox
//! - **Connection**: one live socket driven by an async read loop and an
//!   async write loop
//! - **Server**: accept loop, identity registry, and a hook-driven
//!   dispatch loop with broadcast-with-exclusion
//! - **Client**: connect/disconnect/send/receive over a single connection
//!
//! Each endpoint owns its own background I/O thread with an explicit
//! start/stop lifecycle, so multiple endpoints coexist in one process.
//!
//! Protocol semantics live entirely in the application: it picks the kind
//! tags and reacts to them in the server hooks (see the chat examples).

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Client endpoint.
pub mod client;

/// Connection state machine and I/O loops.
pub mod connection;

/// Error types for endpoint lifecycle operations.
pub mod error;

/// Fixed-layout wire frames.
pub mod message;

/// Thread-safe blocking deque.
pub mod queue;

/// Server endpoint and dispatcher.
pub mod server;

mod context;

pub use client::Client;
pub use connection::{Connection, Role};
pub use error::{ConnectError, StartError};
pub use message::{Frame, OwnedMessage, FRAME_LEN, NAME_CAPACITY, PAYLOAD_CAPACITY};
pub use queue::TsQueue;
pub use server::{Server, ServerContext, ServerHandler};
