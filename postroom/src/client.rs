//! Client endpoint: one connection, one I/O thread, one inbound queue.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::connection::Connection;
use crate::context::IoContext;
use crate::error::ConnectError;
use crate::message::{Frame, OwnedMessage};
use crate::queue::TsQueue;

/// A client endpoint.
///
/// Owns exactly one [`Connection`] to a server, the background thread
/// driving its I/O, and the inbound queue the application drains. Inbound
/// messages carry no origin tag: there is only one peer.
pub struct Client {
    inbox: Arc<TsQueue<OwnedMessage>>,
    connection: Option<Arc<Connection>>,
    context: Option<IoContext>,
}

impl Client {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            inbox: Arc::new(TsQueue::new()),
            connection: None,
            context: None,
        }
    }

    /// Resolve `host:port` and connect, trying each candidate address in
    /// order.
    ///
    /// Returns `true` on success. Failures are logged and reported as
    /// `false`; no partial state is left behind, and this never panics
    /// across the public boundary. An existing connection is torn down
    /// first.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        match self.try_connect(host, port) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(host, port, %error, "connect failed");
                false
            }
        }
    }

    fn try_connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        self.disconnect();

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(ConnectError::Resolve)?
            .collect();

        let runtime = IoContext::build_runtime().map_err(ConnectError::Context)?;
        let connection =
            runtime.block_on(Connection::connect_to_server(&addrs, Arc::clone(&self.inbox)))?;
        connection.spawn_loops(runtime.handle());

        self.context = Some(IoContext::launch(runtime, "postroom-client-io").map_err(ConnectError::Context)?);
        self.connection = Some(connection);
        tracing::info!(host, port, "connected to server");
        Ok(())
    }

    /// Close the connection and join the I/O thread.
    ///
    /// Safe to call repeatedly, and on a client that never connected.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(mut context) = self.context.take() {
            context.shutdown();
        }
    }

    /// Whether the underlying connection is still live.
    ///
    /// Connectivity loss mid-session is surfaced only here: a failed read
    /// or write flips the connection to disconnected and this starts
    /// returning `false`.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Queue a frame for the server. Silently dropped if not connected.
    pub fn send(&self, frame: Frame) {
        if let Some(connection) = &self.connection {
            connection.send(frame);
        }
    }

    /// Handle on the inbound queue, for the application layer to drain.
    pub fn incoming(&self) -> Arc<TsQueue<OwnedMessage>> {
        Arc::clone(&self.inbox)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
