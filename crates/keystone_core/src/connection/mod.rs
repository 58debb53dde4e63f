//! # Connection Registry
//!
//! Tracks every live client connection and owns the interceptor spliced
//! into it.
//!
//! ## Lifecycle
//!
//! 1. The host reports a new client via [`ConnectionRegistry::on_connect`]
//!    together with its [`ConnectionPipeline`].
//! 2. The registry claims the client's slot atomically, then splices a
//!    [`PacketInterceptor`] into the pipeline just before its terminal
//!    stage. A failed splice frees the slot again, so no half-installed
//!    handle is ever visible.
//! 3. [`ConnectionRegistry::on_disconnect`] removes the slot and unsplices
//!    the interceptor. Unknown clients are ignored because disconnect
//!    notifications may race with a failed connect.
//!
//! Install and uninstall are guarded by an atomic flag on the handle, so
//! duplicate calls are harmless.

mod interceptor;

pub use interceptor::PacketInterceptor;

use crate::dispatch::EventDispatcher;
use crate::error::{ConnectionError, PipelineError};
use crate::types::{current_timestamp, ClientId, Packet};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name under which hosts register the interceptor stage.
pub const INTERCEPTOR_STAGE: &str = "keystone_interceptor";

/// A host connection's message pipeline, as seen by the core.
///
/// Implemented by the host's networking layer. All methods must be cheap
/// and non-blocking; they are called from registry operations that may run
/// on any thread.
pub trait ConnectionPipeline: Send + Sync {
    /// Inserts `interceptor` immediately before the terminal processing
    /// stage, so it sees fully decoded inbound messages and outbound
    /// messages before encoding.
    ///
    /// # Errors
    ///
    /// [`PipelineError::StageExists`] if an interceptor is already present,
    /// [`PipelineError::AnchorMissing`] if there is no terminal stage and
    /// [`PipelineError::Closed`] if the connection is gone.
    fn splice(&self, interceptor: Arc<PacketInterceptor>) -> Result<(), PipelineError>;

    /// Removes the interceptor. Removing an absent interceptor is not an error.
    fn unsplice(&self) -> Result<(), PipelineError>;

    /// Writes a message straight to the wire, skipping interception.
    fn send_raw(&self, packet: Packet) -> Result<(), PipelineError>;

    fn is_open(&self) -> bool;
}

/// One client's live connection and its interceptor.
pub struct ConnectionHandle {
    client: ClientId,
    pipeline: Arc<dyn ConnectionPipeline>,
    interceptor: Arc<PacketInterceptor>,
    installed: AtomicBool,
    connected_at: u64,
}

impl ConnectionHandle {
    fn new(
        client: ClientId,
        pipeline: Arc<dyn ConnectionPipeline>,
        interceptor: Arc<PacketInterceptor>,
    ) -> Self {
        Self {
            client,
            pipeline,
            interceptor,
            installed: AtomicBool::new(false),
            connected_at: current_timestamp(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn interceptor(&self) -> &Arc<PacketInterceptor> {
        &self.interceptor
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.pipeline.is_open()
    }

    /// Milliseconds since the Unix epoch at which the client connected.
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Splices the interceptor. Returns `Ok(false)` if it already was, or
    /// if an [`uninstall`](Self::uninstall) overtook the splice.
    pub fn install(&self) -> Result<bool, PipelineError> {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        if let Err(e) = self.pipeline.splice(self.interceptor.clone()) {
            self.installed.store(false, Ordering::Release);
            return Err(e);
        }
        // An uninstall that ran during the splice found nothing to remove.
        if !self.installed.load(Ordering::Acquire) {
            if let Err(e) = self.pipeline.unsplice() {
                debug!("Unsplice for client {} reported: {}", self.client, e);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Removes the interceptor. Returns false if it was not installed.
    pub fn uninstall(&self) -> bool {
        if self
            .installed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(e) = self.pipeline.unsplice() {
            // The connection is usually already closed here.
            debug!("Unsplice for client {} reported: {}", self.client, e);
        }
        true
    }

    /// Writes `packets` in order, bypassing interception.
    pub fn send(&self, packets: impl IntoIterator<Item = Packet>) -> Result<usize, PipelineError> {
        let mut sent = 0;
        for packet in packets {
            self.pipeline.send_raw(packet)?;
            sent += 1;
        }
        Ok(sent)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client", &self.client)
            .field("installed", &self.is_installed())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Concurrent map from client identity to its [`ConnectionHandle`].
pub struct ConnectionRegistry {
    handles: DashMap<ClientId, Arc<ConnectionHandle>>,
    dispatcher: Arc<EventDispatcher>,
}

impl ConnectionRegistry {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            handles: DashMap::new(),
            dispatcher,
        }
    }

    /// Registers `client` and installs its interceptor.
    ///
    /// # Errors
    ///
    /// * [`ConnectionError::DuplicateConnectionRegistration`] if `client` is
    ///   still registered
    /// * [`ConnectionError::Pipeline`] if the interceptor could not be
    ///   spliced; the client is left unregistered
    pub fn on_connect(
        &self,
        client: ClientId,
        pipeline: Arc<dyn ConnectionPipeline>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let interceptor = Arc::new(PacketInterceptor::new(client, self.dispatcher.clone()));
        let handle = Arc::new(ConnectionHandle::new(client, pipeline, interceptor));

        match self.handles.entry(client) {
            Entry::Occupied(_) => {
                warn!("❌ Duplicate connect for client {}", client);
                return Err(ConnectionError::DuplicateConnectionRegistration(client));
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        if let Err(source) = handle.install() {
            self.handles
                .remove_if(&client, |_, registered| Arc::ptr_eq(registered, &handle));
            warn!("❌ Failed to install interceptor for client {}: {}", client, source);
            return Err(ConnectionError::Pipeline { client, source });
        }

        info!("🔗 Client {} connected and intercepted", client);
        Ok(handle)
    }

    /// Unregisters `client` and uninstalls its interceptor.
    ///
    /// Returns false, without error, for unknown clients.
    pub fn on_disconnect(&self, client: ClientId) -> bool {
        match self.handles.remove(&client) {
            Some((_, handle)) => {
                handle.uninstall();
                info!(
                    "🔌 Client {} disconnected ({} forwarded, {} dropped)",
                    client,
                    handle.interceptor.forwarded(),
                    handle.interceptor.dropped()
                );
                true
            }
            None => {
                debug!("Ignoring disconnect for unknown client {}", client);
                false
            }
        }
    }

    pub fn lookup(&self, client: ClientId) -> Option<Arc<ConnectionHandle>> {
        self.handles.get(&client).map(|entry| entry.value().clone())
    }

    /// Writes `packets` directly to `client`, bypassing interception.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`] for unknown clients and
    /// [`ConnectionError::Pipeline`] if the write fails.
    pub fn send(
        &self,
        client: ClientId,
        packets: impl IntoIterator<Item = Packet>,
    ) -> Result<usize, ConnectionError> {
        let handle = self
            .lookup(client)
            .ok_or(ConnectionError::NotConnected(client))?;
        handle
            .send(packets)
            .map_err(|source| ConnectionError::Pipeline { client, source })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.handles.iter().map(|entry| *entry.key()).collect()
    }

    /// Uninstalls and forgets every connection. Returns how many there were.
    pub fn shutdown(&self) -> usize {
        let clients = self.clients();
        let removed = clients
            .into_iter()
            .filter(|client| self.on_disconnect(*client))
            .count();
        info!("🔌 Released {} connections", removed);
        removed
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.handles.len())
            .finish()
    }
}
