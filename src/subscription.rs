//! Typed publish/subscribe registry for inbound events.
//!
//! Handlers are keyed by event type and run in subscription order. The same
//! registry serves events from the channel and from the fallback poller, so
//! subscribers never know which transport delivered an event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::stream;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use tokio::sync::mpsc;

use crate::ws::InboundEvent;

/// Callback invoked for every event of the subscribed type.
pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Identifies one registered handler; pass it to `off` to unsubscribe.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    pub event_type: String,
    id: u64,
}

#[derive(Default)]
pub(crate) struct Registry {
    handlers: DashMap<String, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn on(&self, event_type: &str, handler: Handler) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event_type.to_owned())
            .or_default()
            .push((id, handler));

        SubscriptionToken {
            event_type: event_type.to_owned(),
            id,
        }
    }

    pub(crate) fn off(&self, token: &SubscriptionToken) -> bool {
        let Entry::Occupied(mut entry) = self.handlers.entry(token.event_type.clone()) else {
            return false;
        };

        let handlers = entry.get_mut();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != token.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            entry.remove();
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, |entry| entry.len())
    }

    /// Run every handler for the event's type, in subscription order.
    ///
    /// Handlers are cloned out of the map first so they may call `on`/`off`
    /// themselves. A panicking handler is logged and skipped.
    pub(crate) fn dispatch(&self, event: &InboundEvent) -> usize {
        let handlers: Vec<Handler> = self
            .handlers
            .get(&event.event_type)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::trace!(event_type = %event.event_type, handlers = handlers.len(), "Dispatching event");

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!(event_type = %event.event_type, "Event handler panicked");
            }
        }
        handlers.len()
    }
}

/// Removes the stream's handler when the stream is dropped.
struct Unsubscribe {
    registry: Arc<Registry>,
    token: SubscriptionToken,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.registry.off(&self.token);
    }
}

/// Stream of every event of one type, for consumers that do async work per event.
pub(crate) fn event_stream(
    registry: &Arc<Registry>,
    event_type: &str,
) -> impl Stream<Item = InboundEvent> + use<> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = registry.on(
        event_type,
        Arc::new(move |event: &InboundEvent| {
            _ = tx.send(event.clone());
        }),
    );
    let guard = Unsubscribe {
        registry: Arc::clone(registry),
        token,
    };

    stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}
