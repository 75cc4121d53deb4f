//! Observation lifecycle event bus.
//!
//! A broadcast channel with non-blocking sends: slow subscribers lag and drop
//! events rather than back-pressuring the pipeline. Events fire only after
//! the corresponding row is durable.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationEvent {
    Created { id: String, session_id: String },
    Revised { id: String, revision_of: String },
    Dropped { session_id: String, reason: String },
    Tombstoned { id: String },
}

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObservationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget emit; an error just means nobody is listening.
    pub fn emit(&self, event: ObservationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
