//! The [`Core`] facade handed to feature modules and to the host.

use crate::connection::{ConnectionHandle, ConnectionPipeline, ConnectionRegistry};
use crate::dispatch::{
    DispatchStatsSnapshot, DispatcherConfig, EventDispatcher, ListenerId, ListenerOptions,
};
use crate::error::{ConnectionError, ConsumerError, CoreError, FeatureError};
use crate::events::ProtocolEvent;
use crate::features::{Feature, FeatureRegistry, ResolvedFeature};
use crate::lookup::{ConstructorArg, ImplementationCatalog};
use crate::revision::{BuildIdentity, RevisionTag, VersionResolver};
use crate::scheduler::MainThreadScheduler;
use crate::types::{ClientId, Direction, Packet};
use std::sync::Arc;
use tracing::info;

/// Startup options for [`Core::bootstrap`].
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub dispatcher: DispatcherConfig,
    /// Additional exact release mappings, e.g. for a fork's version scheme.
    pub releases: Vec<(String, RevisionTag)>,
    /// Additional overrides that win over the structural signal.
    pub overrides: Vec<(String, RevisionTag)>,
}

/// Entry point of the interception layer.
///
/// Owns the resolved revision, the feature registry, the dispatcher and
/// the connection registry. The host drives it with `connected` and
/// `disconnected`; feature modules use the rest.
pub struct Core {
    resolver: VersionResolver,
    revision: RevisionTag,
    features: FeatureRegistry,
    dispatcher: Arc<EventDispatcher>,
    connections: ConnectionRegistry,
    scheduler: Arc<dyn MainThreadScheduler>,
}

impl Core {
    /// Resolves the running revision and assembles the core.
    ///
    /// # Arguments
    ///
    /// * `identity` - The host's self-reported build
    /// * `scheduler` - Runs consumers on the authoritative thread
    /// * `catalog` - Every per-revision implementation the host ships
    /// * `config` - Dispatcher and resolver options
    ///
    /// # Errors
    ///
    /// [`CoreError::Revision`] when the build is not recognized. Startup
    /// must abort in that case.
    pub fn bootstrap(
        identity: BuildIdentity,
        scheduler: Arc<dyn MainThreadScheduler>,
        catalog: ImplementationCatalog,
        config: CoreConfig,
    ) -> Result<Self, CoreError> {
        let mut resolver = VersionResolver::new(identity);
        for (release, tag) in config.releases {
            resolver = resolver.with_release(release, tag);
        }
        for (release, tag) in config.overrides {
            resolver = resolver.with_override(release, tag);
        }
        let revision = resolver.resolve()?;

        let features = FeatureRegistry::new(revision, Arc::new(catalog));
        let dispatcher = Arc::new(EventDispatcher::new(scheduler.clone(), config.dispatcher));
        let connections = ConnectionRegistry::new(dispatcher.clone());

        info!(
            "🚀 Core ready for revision {} (dispatch timeout {:?}, on timeout: {})",
            revision, config.dispatcher.timeout, config.dispatcher.timeout_policy
        );

        Ok(Self {
            resolver,
            revision,
            features,
            dispatcher,
            connections,
            scheduler,
        })
    }

    // ========================================================================
    // Revision and features
    // ========================================================================

    pub fn resolve_revision(&self) -> RevisionTag {
        self.revision
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    /// The implementation of feature `name` for the running revision.
    pub fn get_feature_implementation(&self, name: &str) -> Result<ResolvedFeature, FeatureError> {
        self.features.get(name)
    }

    /// Typed access to a feature's capability.
    pub fn feature<F: Feature>(&self) -> Result<Arc<F::Implementation>, FeatureError> {
        self.features.get_typed::<F>()
    }

    /// Declares a host-specific feature. See [`FeatureRegistry::declare`].
    pub fn declare_feature(
        &self,
        name: impl Into<String>,
        template: impl Into<String>,
        args: Vec<ConstructorArg>,
    ) -> bool {
        self.features.declare(name, template, args)
    }

    pub fn features(&self) -> &FeatureRegistry {
        &self.features
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Registers a consumer for intercepted messages.
    ///
    /// # Arguments
    ///
    /// * `direction` - Only this direction, or both when `None`
    /// * `predicate` - Cheap filter; the consumer only runs when it is true
    /// * `consumer` - Runs on the authoritative thread and may cancel
    pub fn on_event<P, C>(&self, direction: Option<Direction>, predicate: P, consumer: C) -> ListenerId
    where
        P: Fn(&ProtocolEvent) -> bool + Send + Sync + 'static,
        C: Fn(&mut ProtocolEvent) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        let options = ListenerOptions {
            direction,
            ..Default::default()
        };
        self.dispatcher.register(options, predicate, consumer)
    }

    /// Like [`on_event`](Self::on_event) with full registration options.
    pub fn on_event_with<P, C>(&self, options: ListenerOptions, predicate: P, consumer: C) -> ListenerId
    where
        P: Fn(&ProtocolEvent) -> bool + Send + Sync + 'static,
        C: Fn(&mut ProtocolEvent) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        self.dispatcher.register(options, predicate, consumer)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove(id)
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Writes messages straight to a client, bypassing interception.
    pub fn send(
        &self,
        client: ClientId,
        packets: impl IntoIterator<Item = Packet>,
    ) -> Result<usize, ConnectionError> {
        self.connections.send(client, packets)
    }

    /// Host notification: a client connected.
    pub fn connected(
        &self,
        client: ClientId,
        pipeline: Arc<dyn ConnectionPipeline>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        self.connections.on_connect(client, pipeline)
    }

    /// Host notification: a client disconnected.
    pub fn disconnected(&self, client: ClientId) -> bool {
        self.connections.on_disconnect(client)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn scheduler(&self) -> &Arc<dyn MainThreadScheduler> {
        &self.scheduler
    }

    /// Uninstalls every interceptor.
    pub fn shutdown(&self) {
        let released = self.connections.shutdown();
        info!("🛑 Core shut down, {} connections released", released);
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("revision", &self.revision)
            .field("connections", &self.connections.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
