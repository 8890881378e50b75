//! Per-endpoint I/O context.
//!
//! Each endpoint (client or server) owns one background OS thread driving a
//! current-thread tokio runtime. All of the endpoint's socket work runs as
//! tasks on that runtime; the thread parks inside `block_on` until shutdown
//! is requested. This keeps the I/O loop explicit per-endpoint state with a
//! start/stop lifecycle rather than a hidden process-wide singleton, so
//! several endpoints can coexist in one process (and in one test).

use std::io;
use std::thread;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;

/// A background thread driving one endpoint's tokio runtime.
///
/// Dropping (or shutting down) the context drops the runtime, which cancels
/// every task spawned on it: connection loops unwind and their sockets
/// close. Shutdown therefore doubles as the endpoint-wide cancellation
/// point.
pub(crate) struct IoContext {
    shutdown_tx: mpsc::UnboundedSender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IoContext {
    /// Build the single-threaded runtime an endpoint will hand to
    /// [`IoContext::launch`].
    ///
    /// Exposed separately so endpoints can `block_on` their initial
    /// connect/bind on the caller's thread before the background thread
    /// takes the runtime over.
    pub(crate) fn build_runtime() -> io::Result<Runtime> {
        Builder::new_current_thread().enable_io().enable_time().build()
    }

    /// Move `runtime` onto a named background thread and start driving it.
    ///
    /// Tasks must already be spawned (or be spawned later via a retained
    /// `Handle`); the context itself only drives and tears down.
    pub(crate) fn launch(runtime: Runtime, thread_name: &str) -> io::Result<Self> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.recv().await;
                });
                tracing::debug!("I/O context thread exiting");
            })?;

        Ok(Self {
            shutdown_tx,
            thread: Some(thread),
        })
    }

    /// Request shutdown and join the background thread.
    ///
    /// Idempotent; safe to call from `Drop` paths.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
