//! Change notifications for applied push events.

use perch_engine::{Identity, Record};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Something that publishes events to any number of listeners.
pub trait Emits {
    type Event: Clone + Send + 'static;

    /// Publish an event. Returns the number of listeners reached.
    fn emit(&self, event: Self::Event) -> usize;

    /// Subscribe to future events.
    fn listen(&self) -> broadcast::Receiver<Self::Event>;
}

/// A change applied to a service's cache by a push event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Added(Record),
    Updated(Record),
    Removed(Identity),
}

impl ModelEvent {
    pub fn record(&self) -> Option<&Record> {
        match self {
            ModelEvent::Added(record) | ModelEvent::Updated(record) => Some(record),
            ModelEvent::Removed(_) => None,
        }
    }
}

/// Broadcast-backed [`Emits`] implementation.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<ModelEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Emits for Notifier {
    type Event = ModelEvent;

    fn emit(&self, event: ModelEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    fn listen(&self) -> broadcast::Receiver<ModelEvent> {
        self.sender.subscribe()
    }
}
