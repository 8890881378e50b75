//! Server endpoint: accept loop, connection registry, and dispatch loop.
//!
//! The server owns a listening socket, the shared inbound queue, and a
//! registry of live connections keyed by assigned identity. An accept task
//! on the I/O context wraps each new socket in a [`Connection`], consults
//! the protocol's connect hook, and registers approved connections under a
//! fresh identity. The application thread then calls [`Server::update`] to
//! drain the inbound queue and run the protocol hooks.
//!
//! Dead peers are detected lazily: a broadcast that touches a connection
//! whose socket has already failed removes it from the registry and fires
//! the disconnect hook. There is no liveness-polling thread, so a silent
//! peer can linger in the registry until a broadcast reaches it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpListener;
use tokio::runtime::Handle;

use crate::connection::{Connection, Role};
use crate::context::IoContext;
use crate::error::StartError;
use crate::message::{Frame, OwnedMessage};
use crate::queue::TsQueue;

/// First identity handed out; the counter only ever increases, so an
/// identity is never reused within a process lifetime.
const ID_SEED: u32 = 10000;

type Registry = Mutex<HashMap<u32, Arc<Connection>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Protocol hooks invoked by the server dispatcher.
///
/// `on_client_connect` runs on the I/O thread inside the accept loop; the
/// other hooks run on whichever thread calls [`Server::update`] or the
/// broadcast operations. Hooks must not block indefinitely or they stall
/// everything queued behind them. Domain errors (malformed payloads and
/// the like) are the hook's own business and must not panic.
pub trait ServerHandler: Send + 'static {
    /// Vet a new connection before it is registered. Sends issued here are
    /// flushed once the connection's loops start; returning `false` closes
    /// the socket without registering it.
    fn on_client_connect(&mut self, client: &Arc<Connection>) -> bool {
        let _ = client;
        true
    }

    /// A registered connection was found dead and has been removed.
    fn on_client_disconnect(&mut self, ctx: &ServerContext<'_>, client: &Arc<Connection>) {
        let _ = (ctx, client);
    }

    /// A frame arrived from a registered connection.
    fn on_message(&mut self, ctx: &ServerContext<'_>, client: &Arc<Connection>, message: Frame) {
        let _ = (ctx, client, message);
    }
}

/// Registry operations available to hooks while the dispatcher holds the
/// handler lock.
///
/// Hooks cannot call back into [`Server`] (the handler lock is already
/// held), so broadcast and targeted sends go through this context instead.
/// Connections found dead are collected here and reaped by the dispatcher
/// after the hook returns, which is what makes the disconnect hook fire
/// exactly once per removed connection.
pub struct ServerContext<'a> {
    registry: &'a Registry,
    dead: Mutex<Vec<Arc<Connection>>>,
}

impl<'a> ServerContext<'a> {
    fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            dead: Mutex::new(Vec::new()),
        }
    }

    /// Send a frame to every registered connection except `exclude`.
    ///
    /// Iteration order over the registry is unspecified. Connections whose
    /// sockets have already failed are deregistered as a side effect.
    pub fn message_all(&self, frame: &Frame, exclude: Option<&Arc<Connection>>) {
        let mut registry = lock(self.registry);
        registry.retain(|_, conn| {
            if conn.is_connected() {
                let excluded = exclude.is_some_and(|skip| Arc::ptr_eq(skip, conn));
                if !excluded {
                    conn.send(frame.clone());
                }
                true
            } else {
                lock(&self.dead).push(Arc::clone(conn));
                false
            }
        });
    }

    /// Send a frame to one registered connection, deregistering it instead
    /// if its socket has already failed.
    pub fn message_client(&self, client: &Arc<Connection>, frame: &Frame) {
        if client.is_connected() {
            client.send(frame.clone());
            return;
        }
        if lock(self.registry).remove(&client.id()).is_some() {
            lock(&self.dead).push(Arc::clone(client));
        }
    }

    /// Number of currently registered connections.
    pub fn client_count(&self) -> usize {
        lock(self.registry).len()
    }

    fn take_dead(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *lock(&self.dead))
    }
}

/// A server endpoint: listening socket, I/O context, registry, dispatch.
///
/// `update` and the broadcast operations are meant to be driven from a
/// single application thread; the I/O context thread handles everything
/// socket-side.
pub struct Server<H: ServerHandler> {
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    inbox: Arc<TsQueue<OwnedMessage>>,
    registry: Arc<Registry>,
    handler: Arc<Mutex<H>>,
    next_id: Arc<AtomicU32>,
    context: Option<IoContext>,
}

impl<H: ServerHandler> Server<H> {
    /// Create a server that will listen on `bind_addr` once started.
    pub fn new(bind_addr: SocketAddr, handler: H) -> Self {
        Self {
            bind_addr,
            local_addr: None,
            inbox: Arc::new(TsQueue::new()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            handler: Arc::new(Mutex::new(handler)),
            next_id: Arc::new(AtomicU32::new(ID_SEED)),
            context: None,
        }
    }

    /// Bind the listener, spawn the accept task, and start the I/O thread.
    ///
    /// No-op if the server is already running.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.context.is_some() {
            return Ok(());
        }

        let runtime = IoContext::build_runtime().map_err(StartError::Context)?;
        let listener = runtime
            .block_on(TcpListener::bind(self.bind_addr))
            .map_err(StartError::Bind)?;
        self.local_addr = listener.local_addr().ok();

        runtime.handle().spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
            Arc::clone(&self.inbox),
            Arc::clone(&self.next_id),
        ));
        self.context = Some(IoContext::launch(runtime, "postroom-server-io").map_err(StartError::Context)?);

        tracing::info!(addr = ?self.local_addr, "server started");
        Ok(())
    }

    /// Close the listener, drop every connection, and join the I/O thread.
    ///
    /// Idempotent. Registered connections are disconnected without firing
    /// the disconnect hook; the whole endpoint is going away.
    pub fn stop(&mut self) {
        let Some(mut context) = self.context.take() else {
            return;
        };
        for (_, conn) in lock(&self.registry).drain() {
            conn.disconnect();
        }
        context.shutdown();
        tracing::info!("server stopped");
    }

    /// The bound listening address, once started. Useful with a `:0` bind.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently registered connections.
    pub fn client_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Drain up to `max_messages` inbound frames (all available if `None`)
    /// and run the message hook for each.
    ///
    /// Frames whose origin connection has been dropped or deregistered
    /// since arrival are counted against the limit but silently discarded.
    /// With `wait_if_empty`, an empty queue blocks the calling thread via
    /// the queue's wait primitive instead of busy-polling.
    pub fn update(&self, max_messages: Option<usize>, wait_if_empty: bool) {
        if wait_if_empty && self.inbox.is_empty() {
            self.inbox.wait_for_item();
        }

        let limit = max_messages.unwrap_or(usize::MAX);
        let ctx = ServerContext::new(&self.registry);
        let mut processed = 0;
        while processed < limit && !self.inbox.is_empty() {
            let owned = self.inbox.pop_front();
            processed += 1;

            let Some(origin) = owned.origin.and_then(|weak| weak.upgrade()) else {
                tracing::debug!("discarding frame from dropped connection");
                continue;
            };
            if !lock(&self.registry).contains_key(&origin.id()) {
                tracing::debug!(id = origin.id(), "discarding frame from deregistered connection");
                continue;
            }

            lock(&self.handler).on_message(&ctx, &origin, owned.message);
            self.reap(&ctx);
        }
    }

    /// Send a frame to every registered connection except `exclude`,
    /// lazily reaping connections found dead along the way.
    pub fn message_all(&self, frame: &Frame, exclude: Option<&Arc<Connection>>) {
        let ctx = ServerContext::new(&self.registry);
        ctx.message_all(frame, exclude);
        self.reap(&ctx);
    }

    /// Send a frame to one connection, reaping it if already dead.
    pub fn message_client(&self, client: &Arc<Connection>, frame: &Frame) {
        let ctx = ServerContext::new(&self.registry);
        ctx.message_client(client, frame);
        self.reap(&ctx);
    }

    /// Fire the disconnect hook for connections the context found dead.
    /// The hook may broadcast and uncover more dead peers, so loop until
    /// the context comes back clean.
    fn reap(&self, ctx: &ServerContext<'_>) {
        loop {
            let dead = ctx.take_dead();
            if dead.is_empty() {
                return;
            }
            let mut handler = lock(&self.handler);
            for conn in dead {
                tracing::info!(id = conn.id(), "removing dead connection");
                handler.on_client_disconnect(ctx, &conn);
            }
        }
    }
}

impl<H: ServerHandler> Drop for Server<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept task: wrap, vet, assign identity, register.
async fn accept_loop<H: ServerHandler>(
    listener: TcpListener,
    registry: Arc<Registry>,
    handler: Arc<Mutex<H>>,
    inbox: Arc<TsQueue<OwnedMessage>>,
    next_id: Arc<AtomicU32>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!(%addr, "new connection attempt");
                let conn = Connection::new(Role::Server, stream, Arc::clone(&inbox));

                let approved = lock(&handler).on_client_connect(&conn);
                if approved {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    conn.connect_to_client(&Handle::current(), id);
                    lock(&registry).insert(id, conn);
                    tracing::info!(id, %addr, "connection approved");
                } else {
                    tracing::info!(%addr, "connection denied");
                    conn.disconnect();
                }
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
            }
        }
    }
}
