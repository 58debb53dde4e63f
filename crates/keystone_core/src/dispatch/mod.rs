//! Cross-thread event dispatch.
//!
//! A connection's network task wraps each message in a [`ProtocolEvent`]
//! and calls [`EventDispatcher::dispatch`]. The event is moved to the
//! authoritative thread together with a one-shot reply channel; the
//! consumers run there, and the final cancelled flag travels back over the
//! channel. The network task waits for that reply before it forwards or
//! drops the message, bounded by the configured timeout.
//!
//! ## Ordering
//!
//! The network task of one connection awaits each dispatch before reading
//! its next message, and the authoritative thread runs tasks in submission
//! order. Messages of one connection therefore reach consumers in arrival
//! order. Different connections interleave freely.
//!
//! ## Failure handling
//!
//! | situation | outcome |
//! |---|---|
//! | no consumer for the direction | `Skipped`, forwarded, no handoff |
//! | consumer returns an error or panics | counted, remaining consumers still run |
//! | no reply within the timeout | `TimedOut`, decided by [`TimeoutPolicy`] |
//! | scheduler refuses or drops the task | `Abandoned`, decided by [`TimeoutPolicy`] |

pub mod listeners;
mod stats;

pub use listeners::{
    invoke_all, EventConsumer, EventPredicate, Listener, ListenerId, ListenerOptions,
    ListenerPriority, ListenerRegistry,
};
pub use stats::{DispatchStats, DispatchStatsSnapshot};

use crate::error::DispatchError;
use crate::events::ProtocolEvent;
use crate::scheduler::{MainTask, MainThreadScheduler};
use crate::types::{ClientId, Direction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Default upper bound on waiting for the authoritative thread.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_millis(3000);

/// What to do with a message whose consumers did not finish in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Treat the message as not cancelled. Favours availability.
    #[default]
    Forward,
    /// Treat the message as cancelled. Favours never leaking a message a
    /// consumer might have suppressed.
    Drop,
}

impl std::fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPolicy::Forward => f.write_str("forward"),
            TimeoutPolicy::Drop => f.write_str("drop"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DISPATCH_TIMEOUT,
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every consumer ran.
    Completed,
    /// Nobody was listening.
    Skipped,
    TimedOut,
    /// The scheduler refused or dropped the task.
    Abandoned,
}

/// Final decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub cancelled: bool,
    pub consumer_errors: usize,
    pub status: DispatchStatus,
}

impl DispatchOutcome {
    fn skipped() -> Self {
        Self {
            cancelled: false,
            consumer_errors: 0,
            status: DispatchStatus::Skipped,
        }
    }
}

/// Hands protocol events to consumers on the authoritative thread.
pub struct EventDispatcher {
    listeners: Arc<ListenerRegistry>,
    scheduler: Arc<dyn MainThreadScheduler>,
    config: DispatcherConfig,
    stats: DispatchStats,
}

impl EventDispatcher {
    pub fn new(scheduler: Arc<dyn MainThreadScheduler>, config: DispatcherConfig) -> Self {
        Self {
            listeners: Arc::new(ListenerRegistry::new()),
            scheduler,
            config,
            stats: DispatchStats::default(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Registers a consumer. See [`ListenerOptions`] for filtering.
    pub fn register<P, C>(&self, options: ListenerOptions, predicate: P, consumer: C) -> ListenerId
    where
        P: Fn(&ProtocolEvent) -> bool + Send + Sync + 'static,
        C: Fn(&mut ProtocolEvent) -> Result<(), crate::error::ConsumerError> + Send + Sync + 'static,
    {
        self.listeners
            .register(options, Arc::new(predicate), Arc::new(consumer))
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Runs every interested consumer for `event` on the authoritative
    /// thread and waits for the final cancelled flag.
    ///
    /// Never fails: timeouts and scheduler refusals are logged and resolved
    /// according to the configured [`TimeoutPolicy`].
    pub async fn dispatch(&self, event: ProtocolEvent) -> DispatchOutcome {
        let client = event.client();
        let direction = event.direction();
        let (tx, rx) = oneshot::channel();

        if let Some(outcome) = self.submit(event, move |reply| {
            let _ = tx.send(reply);
        }) {
            return outcome;
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok((cancelled, errors))) => self.completed(cancelled, errors),
            Ok(Err(_)) => self.abandoned(client, direction, "task dropped before it ran".into()),
            Err(_) => self.timed_out(client, direction),
        }
    }

    /// Like [`dispatch`](Self::dispatch) for callers on a plain OS thread.
    ///
    /// Must not be called from inside an async task.
    pub fn dispatch_blocking(&self, event: ProtocolEvent) -> DispatchOutcome {
        let client = event.client();
        let direction = event.direction();
        let (tx, rx) = crossbeam::channel::bounded(1);

        if let Some(outcome) = self.submit(event, move |reply| {
            let _ = tx.send(reply);
        }) {
            return outcome;
        }

        match rx.recv_timeout(self.config.timeout) {
            Ok((cancelled, errors)) => self.completed(cancelled, errors),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                self.abandoned(client, direction, "task dropped before it ran".into())
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => self.timed_out(client, direction),
        }
    }

    /// Starts a dispatch. Returns the outcome directly when no handoff is
    /// needed, otherwise `None` and `reply` receives the result later.
    fn submit<R>(&self, event: ProtocolEvent, reply: R) -> Option<DispatchOutcome>
    where
        R: FnOnce((bool, usize)) + Send + 'static,
    {
        let direction = event.direction();
        if !self.listeners.has_listeners(direction) {
            self.stats.record_skipped();
            return Some(DispatchOutcome::skipped());
        }
        self.stats.record_dispatched();

        if self.scheduler.is_main_thread() {
            let mut event = event;
            let errors = invoke_all(&self.listeners.snapshot(direction), &mut event);
            return Some(self.completed(event.is_cancelled(), errors));
        }

        let client = event.client();
        let listeners = self.listeners.clone();
        let task: MainTask = Box::new(move || {
            let mut event = event;
            let errors = invoke_all(&listeners.snapshot(direction), &mut event);
            reply((event.is_cancelled(), errors));
        });

        match self.scheduler.run_on_main(task) {
            Ok(()) => None,
            Err(e) => Some(self.abandoned(client, direction, e.to_string())),
        }
    }

    fn completed(&self, cancelled: bool, consumer_errors: usize) -> DispatchOutcome {
        self.stats.record_consumer_errors(consumer_errors);
        if cancelled {
            self.stats.record_cancelled();
        }
        trace!("Dispatch completed, cancelled={}", cancelled);
        DispatchOutcome {
            cancelled,
            consumer_errors,
            status: DispatchStatus::Completed,
        }
    }

    fn timed_out(&self, client: ClientId, direction: Direction) -> DispatchOutcome {
        self.stats.record_timed_out();
        let error = DispatchError::Timeout {
            client,
            direction,
            waited: self.config.timeout,
        };
        warn!("⏱️ {} (policy: {})", error, self.config.timeout_policy);
        self.fallback(DispatchStatus::TimedOut)
    }

    fn abandoned(&self, client: ClientId, direction: Direction, reason: String) -> DispatchOutcome {
        self.stats.record_abandoned();
        let error = DispatchError::Abandoned {
            client,
            direction,
            reason,
        };
        warn!("{} (policy: {})", error, self.config.timeout_policy);
        self.fallback(DispatchStatus::Abandoned)
    }

    fn fallback(&self, status: DispatchStatus) -> DispatchOutcome {
        let cancelled = self.config.timeout_policy == TimeoutPolicy::Drop;
        if cancelled {
            self.stats.record_cancelled();
        }
        DispatchOutcome {
            cancelled,
            consumer_errors: 0,
            status,
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish()
    }
}
