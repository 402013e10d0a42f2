//! Typed publish/subscribe for job notifications
//!
//! Handlers run synchronously in registration order on the publishing
//! thread. A handler returning [`Propagation::Stop`] keeps the event from
//! reaching handlers registered after it. Queues publish while holding their
//! own lock so per-job ordering is preserved; handlers must therefore never
//! call back into a queue synchronously. Hand the work to a task instead.

use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use transfer_protocol::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobUpdated,
    BatchProgress,
    QueueDrained,
    JobRemoved,
}

impl EventKind {
    pub fn of(event: &Event) -> Self {
        match event {
            Event::JobUpdated(_) => EventKind::JobUpdated,
            Event::BatchProgress(_) => EventKind::BatchProgress,
            Event::QueueDrained(_) => EventKind::QueueDrained,
            Event::JobRemoved(_) => EventKind::JobRemoved,
        }
    }
}

/// Returned by every handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&Event) -> Propagation + Send + Sync>;

struct Subscription {
    token: SubscriptionToken,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to one kind of event
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) -> Propagation + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Listen to every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) -> Propagation + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.lock().push(Subscription {
            token,
            kind,
            handler,
        });
        token
    }

    /// Returns false when the token was already gone
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.token != token);
        subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn publish(&self, event: &Event) {
        let kind = EventKind::of(event);
        // Snapshot the handler list so handlers may (un)subscribe or publish.
        let handlers: Vec<Handler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if handler(event) == Propagation::Stop {
                debug!("event_propagation_stopped: {}", event.event_type());
                break;
            }
        }
    }
}
