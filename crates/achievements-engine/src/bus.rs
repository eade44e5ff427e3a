use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use achievements_core::HostEvent;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

pub type EventHandler = Arc<dyn Fn(&HostEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

/// Named-event bus supplied by the host platform.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, event_name: &str, handler: EventHandler) -> SubscriptionId;

    /// Returns `false` when the subscription was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Runs every handler subscribed to `event.name` to completion and
    /// returns how many ran.
    fn emit(&self, event: &HostEvent) -> usize;
}

/// Synchronous bus that invokes handlers on the emitting thread.
#[derive(Default)]
pub struct InProcessBus {
    next_id: AtomicU64,
    handlers: DashMap<String, Vec<(SubscriptionId, EventHandler)>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.handlers
            .get(event_name)
            .map_or(0, |entry| entry.value().len())
    }
}

impl EventBus for InProcessBus {
    fn subscribe(&self, event_name: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.handlers
            .entry(event_name.to_string())
            .or_default()
            .push((id, handler));
        debug!(event = event_name, subscription = id.0, "handler subscribed");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.handlers.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(existing, _)| *existing != id);
            removed |= entry.value().len() != before;
        }
        self.handlers.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    fn emit(&self, event: &HostEvent) -> usize {
        // Handlers run outside the shard lock so they may subscribe or emit.
        let handlers: Vec<EventHandler> = match self.handlers.get(&event.name) {
            Some(entry) => entry
                .value()
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            None => Vec::new(),
        };

        trace!(event = %event.name, handlers = handlers.len(), "emitting event");
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use achievements_core::{EventPayload, UserId};
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: &HostEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn event(name: &str) -> HostEvent {
        HostEvent::new(name, EventPayload::UserAction { user_id: UserId(1) })
    }

    #[test]
    fn emit_reaches_only_matching_subscribers() {
        let bus = InProcessBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("post_published", counting_handler(&hits));
        bus.subscribe("post_published", counting_handler(&hits));
        bus.subscribe("user_registered", counting_handler(&hits));

        assert_eq!(bus.emit(&event("post_published")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.emit(&event("unknown_event")), 0);
    }

    #[test]
    fn unsubscribe_detaches_handler_once() {
        let bus = InProcessBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("post_published", counting_handler(&hits));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count("post_published"), 0);
        assert_eq!(bus.emit(&event("post_published")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(InProcessBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("inner", counting_handler(&hits));

        let reentrant = Arc::clone(&bus);
        bus.subscribe(
            "outer",
            Arc::new(move |_event: &HostEvent| {
                reentrant.emit(&event("inner"));
            }),
        );

        bus.emit(&event("outer"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
