//! Typed publish/subscribe registry for realtime events.
//!
//! Every `on` call returns its own [`Subscription`]; removal is keyed by that token only, so
//! independent consumers of the same event never unregister each other.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use shared::protocol::{EventName, RealtimeEvent};
use tracing::debug;

pub type EventHandler = Arc<dyn Fn(RealtimeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    name: EventName,
    id: u64,
}

impl Subscription {
    pub fn event_name(&self) -> EventName {
        self.name
    }
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventName, Vec<(u64, EventHandler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(RealtimeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler =
            Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(handler(event)) });
        self.handlers
            .write()
            .entry(name)
            .or_default()
            .push((id, handler));
        Subscription { name, id }
    }

    /// Returns false when the subscription was already removed.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut guard = self.handlers.write();
        let Some(entries) = guard.get_mut(&subscription.name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            guard.remove(&subscription.name);
        }
        removed
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers.read().get(&name).map_or(0, Vec::len)
    }

    /// Runs the handlers registered for the event, one after another, in registration order.
    pub async fn dispatch(&self, event: RealtimeEvent) -> usize {
        let name = event.name();
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&name)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(event = %name, "bus: no handler registered");
            return 0;
        }

        for handler in &handlers {
            handler(event.clone()).await;
        }
        handlers.len()
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;
