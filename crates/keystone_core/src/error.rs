//! Error types for the core.
//!
//! Errors are split by concern. Two of them indicate an unsafe process
//! state and are surfaced immediately without retry:
//! [`RevisionError::Unrecognized`] and
//! [`ConnectionError::DuplicateConnectionRegistration`]. The rest are local
//! to one feature, one consumer or one dispatch and are contained where they
//! occur.

use crate::revision::RevisionTag;
use crate::types::{ClientId, Direction};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while determining the running server revision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
    /// The build string matched no known revision. Fatal at startup.
    #[error("Unrecognized server revision: {build}")]
    Unrecognized {
        /// The build string exactly as the host reported it.
        build: String,
    },
}

/// Failures of the implementation catalog.
///
/// Each variant names the fully qualified implementation it was looking
/// for, so a report says exactly which revision lacks what.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// No implementation is registered under the qualified name.
    #[error("No implementation registered as {name}")]
    NotFound { name: String },

    /// An implementation exists but its constructor signature does not
    /// accept the supplied arguments, or it produced a different type.
    #[error("Constructor mismatch for {name}: expected {expected}, got {found}")]
    ConstructorMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// The constructor ran and failed.
    #[error("Construction of {name} failed: {reason}")]
    ConstructionFailed { name: String, reason: String },
}

impl LookupError {
    /// The qualified implementation name this error refers to.
    pub fn name(&self) -> &str {
        match self {
            LookupError::NotFound { name }
            | LookupError::ConstructorMismatch { name, .. }
            | LookupError::ConstructionFailed { name, .. } => name,
        }
    }
}

/// Failures of the feature registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    /// The feature has no usable implementation for the running revision.
    #[error("Feature '{feature}' is not supported on revision {revision}: {cause}")]
    UnsupportedRevision {
        feature: String,
        revision: RevisionTag,
        #[source]
        cause: LookupError,
    },
}

impl FeatureError {
    /// Name of the feature that could not be provided.
    pub fn feature(&self) -> &str {
        match self {
            FeatureError::UnsupportedRevision { feature, .. } => feature,
        }
    }

    /// Revision the lookup was made against.
    pub fn revision(&self) -> RevisionTag {
        match self {
            FeatureError::UnsupportedRevision { revision, .. } => *revision,
        }
    }
}

/// Errors reported by a host's connection pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The underlying connection has already closed.
    #[error("Connection pipeline is closed")]
    Closed,
    /// The interceptor stage is already present in the pipeline.
    #[error("Pipeline stage already present: {0}")]
    StageExists(String),
    /// The terminal stage the interceptor anchors to is missing.
    #[error("Pipeline anchor stage missing: {0}")]
    AnchorMissing(String),
}

/// Errors raised by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A connect notification arrived for a client that is still registered.
    #[error("Client {0} is already registered; a previous handle was leaked")]
    DuplicateConnectionRegistration(ClientId),

    /// The client has no registered connection.
    #[error("Client {0} is not connected")]
    NotConnected(ClientId),

    /// Splicing or writing through the pipeline failed.
    #[error("Pipeline error for client {client}: {source}")]
    Pipeline {
        client: ClientId,
        #[source]
        source: PipelineError,
    },
}

/// Anomalies observed while dispatching a protocol event.
///
/// These are logged, never propagated: the interceptor always reaches a
/// forwarding decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The authoritative thread did not finish the consumers in time.
    #[error("Dispatch of {direction} event for client {client} timed out after {waited:?}")]
    Timeout {
        client: ClientId,
        direction: Direction,
        waited: Duration,
    },

    /// The scheduler refused or dropped the task, normally during shutdown.
    #[error("Dispatch of {direction} event for client {client} abandoned: {reason}")]
    Abandoned {
        client: ClientId,
        direction: Direction,
        reason: String,
    },
}

/// Error returned by a consumer. Isolated to that consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Consumer error: {0}")]
pub struct ConsumerError(pub String);

impl ConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<FieldError> for ConsumerError {
    fn from(err: FieldError) -> Self {
        Self(err.to_string())
    }
}

/// Errors from named-field extraction on a packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The payload has no member with this name.
    #[error("Field not found: {field}")]
    NotFound { field: String },
    /// The payload is not a JSON object.
    #[error("Malformed payload: {0}")]
    Malformed(String),
    /// The member exists but has an unexpected shape.
    #[error("Field {field} has unexpected type: {reason}")]
    TypeMismatch { field: String, reason: String },
}

/// Errors from the main-thread scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The authoritative thread has stopped accepting work.
    #[error("Main-thread scheduler is shut down")]
    ShutDown,
    /// The authoritative thread could not be started.
    #[error("Failed to start main thread: {0}")]
    Spawn(String),
}

/// Umbrella error for operations on the [`Core`](crate::Core) facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
