//! Error types for endpoint lifecycle operations.
//!
//! Mid-session socket failures never surface here: they are terminal for
//! the affected connection and are reported through connection state
//! (`is_connected`) or the server's disconnect hook, not as errors.

use std::io;
use thiserror::Error;

/// Errors from establishing an outbound connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The host/port pair did not resolve to any address.
    #[error("address resolution failed: {0}")]
    Resolve(#[source] io::Error),

    /// Every resolved candidate address refused the connection.
    #[error("no candidate address accepted the connection")]
    Exhausted,

    /// The endpoint's I/O context could not be brought up.
    #[error("failed to start I/O context: {0}")]
    Context(#[source] io::Error),
}

/// Errors from starting a server endpoint.
#[derive(Debug, Error)]
pub enum StartError {
    /// The listening socket could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// The endpoint's I/O context could not be brought up.
    #[error("failed to start I/O context: {0}")]
    Context(#[source] io::Error),
}
