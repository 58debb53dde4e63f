//! Core host server implementation.
//!
//! [`HostServer`] accepts WebSocket clients, registers each one with the
//! [`Core`] so its interceptor is spliced in, and tears everything down on
//! shutdown.

use crate::config::HostConfig;
use crate::error::HostError;
use crate::server::handlers::handle_connection;
use crate::terminal::{LoggingTerminal, TerminalStage};
use keystone_core::Core;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The reference host server.
///
/// The server contains no game logic. Everything a client sends is handed
/// to the core's interceptor and then to the [`TerminalStage`].
pub struct HostServer {
    /// Server configuration settings
    config: HostConfig,

    /// The interception core every connection is registered with
    core: Arc<Core>,

    /// Where forwarded inbound messages end up
    terminal: Arc<dyn TerminalStage>,

    /// Channel for coordinating server shutdown
    shutdown_sender: broadcast::Sender<()>,

    /// Set once shutdown has been requested
    stopping: AtomicBool,

    /// Connections currently being served
    active: Arc<AtomicUsize>,
}

impl HostServer {
    /// Creates a server with the [`LoggingTerminal`].
    pub fn new(config: HostConfig, core: Arc<Core>) -> Self {
        Self::with_terminal(config, core, Arc::new(LoggingTerminal))
    }

    /// Creates a server that hands forwarded messages to `terminal`.
    pub fn with_terminal(
        config: HostConfig,
        core: Arc<Core>,
        terminal: Arc<dyn TerminalStage>,
    ) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);
        Self {
            config,
            core,
            terminal,
            shutdown_sender,
            stopping: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, HostError> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| HostError::Network(format!("Bind failed: {e}")))?;
        info!("✅ Listener bound on {}", self.config.bind_address);
        Ok(listener)
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn start(&self) -> Result<(), HostError> {
        info!("🚀 Starting host server on {}", self.config.bind_address);
        info!("🧬 Running revision {}", self.core.resolve_revision());
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on `listener` until [`shutdown`](Self::shutdown)
    /// is called or accepting fails.
    ///
    /// Clients beyond `max_connections` are refused by closing the socket
    /// before the handshake. On exit every open connection is told to close
    /// and the core releases all interceptors.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HostError> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        if self.stopping.load(Ordering::Acquire) {
            self.core.shutdown();
            return Ok(());
        }

        let result = tokio::select! {
            result = self.accept_loop(&listener) => result,
            _ = shutdown_receiver.recv() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        info!("🧹 Performing host cleanup...");
        self.core.shutdown();
        info!("✅ Host server stopped");
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), HostError> {
        loop {
            let (stream, addr) = listener.accept().await.map_err(|e| {
                error!("Failed to accept connection: {}", e);
                HostError::Network(format!("Accept failed: {e}"))
            })?;

            let active = self.active.fetch_add(1, Ordering::AcqRel);
            if active >= self.config.max_connections {
                self.active.fetch_sub(1, Ordering::AcqRel);
                warn!("🚫 Refusing {}: {} connections already open", addr, active);
                drop(stream);
                continue;
            }

            let guard = ActiveGuard(self.active.clone());
            let core = self.core.clone();
            let terminal = self.terminal.clone();
            let shutdown = self.shutdown_sender.subscribe();
            let handshake_timeout_ms = self.config.handshake_timeout_ms;

            // Spawn individual connection handler
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(
                    stream,
                    addr,
                    core,
                    terminal,
                    handshake_timeout_ms,
                    shutdown,
                )
                .await
                {
                    error!("Connection error: {}", e);
                }
            });
        }
    }

    /// Asks the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.shutdown_sender.send(()) {
            Ok(receivers) => debug!("Shutdown delivered to {} receivers", receivers),
            Err(_) => debug!("Shutdown requested before the server was serving"),
        }
    }
}

/// Decrements the active-connection count when a handler finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
