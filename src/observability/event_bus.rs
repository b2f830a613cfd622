//! Tokio broadcast event bus for store notifications.

use tokio::sync::broadcast;

/// Default number of buffered events per bus.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;

/// Event emitted by a store.
///
/// Background work (the bootstrap gate, the expiry reaper) has no caller to
/// return an error to, so failures there are published here instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Schema bootstrap completed.
    Bootstrapped {
        /// Backend name.
        backend: &'static str,
        /// Table, collection or bucket name.
        table: String,
    },
    /// An operation failed.
    Error {
        /// Backend name.
        backend: &'static str,
        /// Operation label.
        operation: &'static str,
        /// Error message.
        message: String,
    },
    /// Expired entries were removed.
    Reaped {
        /// Backend name.
        backend: &'static str,
        /// Number of entries removed.
        removed: u64,
    },
    /// The store was disconnected.
    Disconnected {
        /// Backend name.
        backend: &'static str,
    },
}

impl StoreEvent {
    /// Returns a short label for the event type.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Bootstrapped { .. } => "bootstrapped",
            Self::Error { .. } => "error",
            Self::Reaped { .. } => "reaped",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// Broadcast bus carrying [`StoreEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

/// Filtered receiver that yields events matching a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<StoreEvent>,
    predicate: F,
}

impl EventBus {
    /// Creates a new event bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers (best effort).
    pub fn publish(&self, event: StoreEvent) {
        metrics::counter!("store_events_published_total", "event" => event.event_type())
            .increment(1);
        if self.sender.send(event).is_err() {
            // No subscribers.
            metrics::counter!("store_events_dropped_total").increment(1);
        }
    }

    /// Subscribes to the event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Subscribes with a predicate to filter events.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&StoreEvent) -> bool,
    {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            predicate,
        }
    }

    /// Subscribes to events of one type (see [`StoreEvent::event_type`]).
    #[must_use]
    pub fn subscribe_event_type(
        &self,
        event_type: &'static str,
    ) -> FilteredReceiver<impl Fn(&StoreEvent) -> bool> {
        self.subscribe_filtered(move |event| event.event_type() == event_type)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&StoreEvent) -> bool,
{
    /// Receives the next event that matches the predicate.
    pub async fn recv(&mut self) -> Result<StoreEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Ok(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("store_events_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }
}
