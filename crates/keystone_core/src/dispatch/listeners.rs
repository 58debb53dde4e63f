//! Registered consumers of protocol events.

use crate::error::ConsumerError;
use crate::events::ProtocolEvent;
use crate::lookup::panic_message;
use crate::types::Direction;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Identifier returned when a consumer is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Order in which consumers see an event.
///
/// Consumers run from `Lowest` to `Monitor`, so higher priorities have the
/// final say on cancellation. `Monitor` consumers observe the final state
/// and must not change it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ListenerPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

pub type EventPredicate = Arc<dyn Fn(&ProtocolEvent) -> bool + Send + Sync>;
pub type EventConsumer = Arc<dyn Fn(&mut ProtocolEvent) -> Result<(), ConsumerError> + Send + Sync>;

/// Registration options for a consumer.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Only events travelling this way; `None` means both directions.
    pub direction: Option<Direction>,
    pub priority: ListenerPriority,
    /// Skip this consumer when an earlier one already cancelled the event.
    pub ignore_cancelled: bool,
    /// Shown in diagnostics.
    pub name: Option<String>,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_priority(mut self, priority: ListenerPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ignoring_cancelled(mut self) -> Self {
        self.ignore_cancelled = true;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One registered consumer.
pub struct Listener {
    id: ListenerId,
    options: ListenerOptions,
    predicate: EventPredicate,
    consumer: EventConsumer,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn priority(&self) -> ListenerPriority {
        self.options.priority
    }

    pub fn direction(&self) -> Option<Direction> {
        self.options.direction
    }

    fn label(&self) -> String {
        match &self.options.name {
            Some(name) => format!("{} ({})", name, self.id),
            None => self.id.to_string(),
        }
    }

    fn accepts(&self, direction: Direction) -> bool {
        self.options.direction.map_or(true, |d| d == direction)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

/// Priority-ordered set of consumers.
///
/// Registration and removal may happen from any thread. Each dispatch works
/// on a snapshot, so a consumer added while an event is being processed
/// first sees the next event.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer behind every registered consumer of the same or
    /// lower priority.
    pub fn register(
        &self,
        options: ListenerOptions,
        predicate: EventPredicate,
        consumer: EventConsumer,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let listener = Arc::new(Listener {
            id,
            options,
            predicate,
            consumer,
        });

        let mut listeners = self.listeners.write();
        let position = listeners.partition_point(|l| l.priority() <= listener.priority());
        debug!(
            "Registered {} at {:?} priority for {:?}",
            listener.label(),
            listener.priority(),
            listener.direction()
        );
        listeners.insert(position, listener);
        id
    }

    /// Removes a consumer. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }

    /// Whether any consumer wants events travelling in `direction`.
    pub fn has_listeners(&self, direction: Direction) -> bool {
        self.listeners.read().iter().any(|l| l.accepts(direction))
    }

    /// Consumers for `direction`, in invocation order.
    pub fn snapshot(&self, direction: Direction) -> Vec<Arc<Listener>> {
        self.listeners
            .read()
            .iter()
            .filter(|l| l.accepts(direction))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

/// Runs `listeners` against `event` in order and returns the number of
/// consumers that failed.
///
/// A failing or panicking consumer is logged and skipped; the remaining
/// consumers still run.
pub fn invoke_all(listeners: &[Arc<Listener>], event: &mut ProtocolEvent) -> usize {
    let mut failures = 0;

    for listener in listeners {
        if listener.options.ignore_cancelled && event.is_cancelled() {
            continue;
        }

        let wanted = catch_unwind(AssertUnwindSafe(|| (listener.predicate)(event)));
        match wanted {
            Ok(true) => {}
            Ok(false) => continue,
            Err(panic) => {
                failures += 1;
                error!(
                    "Predicate of {} panicked: {}",
                    listener.label(),
                    panic_message(panic.as_ref())
                );
                continue;
            }
        }

        let cancelled_before = event.is_cancelled();
        match catch_unwind(AssertUnwindSafe(|| (listener.consumer)(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                error!(
                    "Consumer {} failed on {} event from {}: {}",
                    listener.label(),
                    event.direction(),
                    event.client(),
                    e
                );
            }
            Err(panic) => {
                failures += 1;
                error!(
                    "Consumer {} panicked on {} event from {}: {}",
                    listener.label(),
                    event.direction(),
                    event.client(),
                    panic_message(panic.as_ref())
                );
            }
        }

        if listener.priority() == ListenerPriority::Monitor
            && event.is_cancelled() != cancelled_before
        {
            warn!(
                "Monitor consumer {} changed the cancelled flag; change reverted",
                listener.label()
            );
            event.set_cancelled(cancelled_before);
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, Packet};
    use parking_lot::Mutex;

    fn predicate<P>(p: P) -> EventPredicate
    where
        P: Fn(&ProtocolEvent) -> bool + Send + Sync + 'static,
    {
        Arc::new(p)
    }

    fn consumer<C>(c: C) -> EventConsumer
    where
        C: Fn(&mut ProtocolEvent) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        Arc::new(c)
    }

    fn always() -> EventPredicate {
        predicate(|_| true)
    }

    fn event(direction: Direction) -> ProtocolEvent {
        ProtocolEvent::new(ClientId::new(), direction, Packet::from(r#"{"type":"Chat"}"#))
    }

    #[test]
    fn test_priority_then_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [
            ("high", ListenerPriority::High),
            ("normal-1", ListenerPriority::Normal),
            ("lowest", ListenerPriority::Lowest),
            ("normal-2", ListenerPriority::Normal),
        ] {
            let seen = seen.clone();
            registry.register(
                ListenerOptions::new().with_priority(priority),
                always(),
                consumer(move |_| {
                    seen.lock().push(label);
                    Ok(())
                }),
            );
        }

        let mut event = event(Direction::Inbound);
        invoke_all(&registry.snapshot(Direction::Inbound), &mut event);
        assert_eq!(*seen.lock(), vec!["lowest", "normal-1", "normal-2", "high"]);
    }

    #[test]
    fn test_direction_filter_and_removal() {
        let registry = ListenerRegistry::new();
        let id = registry.register(
            ListenerOptions::new().with_direction(Direction::Outbound),
            always(),
            consumer(|_| Ok(())),
        );
        assert!(registry.has_listeners(Direction::Outbound));
        assert!(!registry.has_listeners(Direction::Inbound));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failures_are_isolated() {
        let registry = ListenerRegistry::new();
        registry.register(
            ListenerOptions::new(),
            always(),
            consumer(|_| Err(ConsumerError::new("bad state"))),
        );
        registry.register(
            ListenerOptions::new(),
            always(),
            consumer(|_| panic!("consumer bug")),
        );
        registry.register(
            ListenerOptions::new(),
            always(),
            consumer(|event| {
                event.cancel();
                Ok(())
            }),
        );

        let mut event = event(Direction::Inbound);
        let failures = invoke_all(&registry.snapshot(Direction::Inbound), &mut event);
        assert_eq!(failures, 2);
        assert!(event.is_cancelled());
    }

    #[test]
    fn test_monitor_cannot_change_outcome() {
        let registry = ListenerRegistry::new();
        registry.register(
            ListenerOptions::new().with_priority(ListenerPriority::Monitor),
            always(),
            consumer(|event| {
                event.cancel();
                Ok(())
            }),
        );
        let mut event = event(Direction::Inbound);
        invoke_all(&registry.snapshot(Direction::Inbound), &mut event);
        assert!(!event.is_cancelled());
    }

    #[test]
    fn test_ignore_cancelled_and_predicate() {
        let registry = ListenerRegistry::new();
        let reached = Arc::new(AtomicU64::new(0));

        registry.register(
            ListenerOptions::new().with_priority(ListenerPriority::Low),
            predicate(|event| event.is_kind("Chat")),
            consumer(|event| {
                event.cancel();
                Ok(())
            }),
        );
        let counter = reached.clone();
        registry.register(
            ListenerOptions::new().ignoring_cancelled(),
            always(),
            consumer(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let mut chat = event(Direction::Inbound);
        invoke_all(&registry.snapshot(Direction::Inbound), &mut chat);
        assert!(chat.is_cancelled());
        assert_eq!(reached.load(Ordering::SeqCst), 0);

        let mut other = ProtocolEvent::new(
            ClientId::new(),
            Direction::Inbound,
            Packet::from(r#"{"type":"Move"}"#),
        );
        invoke_all(&registry.snapshot(Direction::Inbound), &mut other);
        assert!(!other.is_cancelled());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
