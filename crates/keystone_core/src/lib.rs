//! # Keystone Core - Version-Adaptive Packet Interception
//!
//! The mechanism by which game features reach the wire of a host server
//! whose internal protocol changes between releases.
//!
//! ## What it does
//!
//! * **Interception** - every client connection gets a [`PacketInterceptor`]
//!   spliced into its pipeline. Each message crossing it becomes a
//!   [`ProtocolEvent`] that consumers on the authoritative thread may
//!   inspect and cancel. Cancelled messages are dropped; all others are
//!   forwarded byte-for-byte.
//! * **Revision resolution** - at startup the [`VersionResolver`] turns the
//!   host's build identity into a [`RevisionTag`], or refuses to start.
//! * **Implementation selection** - the [`FeatureRegistry`] picks, once per
//!   feature, the variant registered for the running revision in the
//!   [`ImplementationCatalog`].
//!
//! ## Threading model
//!
//! Connections are served by many network tasks. Game state belongs to one
//! authoritative thread, provided through [`MainThreadScheduler`]
//! ([`TickLoop`] is the built-in one). Dispatch hands each event to that
//! thread and waits, with a timeout, for the verdict. Per-connection
//! message order is preserved; across connections it is not.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keystone_core::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), CoreError> {
//! let scheduler = Arc::new(TickLoop::spawn(Duration::from_millis(50))?);
//! let mut catalog = ImplementationCatalog::new();
//! variants::install_builtin(&mut catalog);
//!
//! let core = Core::bootstrap(
//!     BuildIdentity::new("git-Paper-196 (MC: 1.20.4)"),
//!     scheduler,
//!     catalog,
//!     CoreConfig::default(),
//! )?;
//!
//! core.on_event(Some(Direction::Inbound), |e| e.is_kind("Chat"), |e| {
//!     e.cancel();
//!     Ok(())
//! });
//!
//! let titles = core.feature::<TitleFeature>()?;
//! let packets = titles.show("Welcome", "", TitleTimes::default());
//! # let _ = packets;
//! # Ok(())
//! # }
//! ```

// Re-export core types for easy access
pub use connection::{
    ConnectionHandle, ConnectionPipeline, ConnectionRegistry, PacketInterceptor,
    INTERCEPTOR_STAGE,
};
pub use dispatch::{
    DispatchOutcome, DispatchStats, DispatchStatsSnapshot, DispatchStatus, DispatcherConfig,
    EventDispatcher, ListenerId, ListenerOptions, ListenerPriority, TimeoutPolicy,
    DEFAULT_DISPATCH_TIMEOUT,
};
pub use error::{
    ConnectionError, ConsumerError, CoreError, DispatchError, FeatureError, FieldError,
    LookupError, PipelineError, RevisionError, SchedulerError,
};
pub use events::ProtocolEvent;
pub use facade::{Core, CoreConfig};
pub use features::{
    variants, BarColor, BoundaryEffect, BoundaryEffectFeature, Feature, FeatureRegistry,
    FloatingText, FloatingTextFeature, InputDialog, InputDialogFeature, MenuFeature,
    MenuRenderer, ResolvedFeature, StatusBar, StatusBarFeature, TitleDisplay, TitleFeature,
    TitleTimes,
};
pub use lookup::{ArgKind, ConstructorArg, Factory, ImplementationCatalog, Instance};
pub use revision::{BuildIdentity, RevisionOrder, RevisionTag, VersionResolver};
pub use scheduler::{MainTask, MainThreadScheduler, TaskId, TickLoop};
pub use types::{ClientId, Direction, Packet};

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod features;
pub mod lookup;
pub mod revision;
pub mod scheduler;
pub mod types;

mod facade;
