//! Fan-out channel for loop events.
//!
//! Every durable state mutation ends with an emit here, and anything that
//! wants to observe loops (the CLI, a UI, a log mirror) subscribes for its
//! own receiver. Delivery is best-effort by design: a reader that stops
//! draining only hurts itself, never a running loop.

use drover_core::event::{LoopEvent, LoopEventKind};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events buffered per subscriber before a slow reader starts losing the
/// oldest ones. Agent output can burst, so this errs on the large side.
const EVENT_BUFFER: usize = 1024;

/// Publisher half of the loop event stream.
///
/// Cheap to clone; every clone emits into and subscribes to the same
/// underlying channel, so the engine can hand copies to whoever needs
/// to publish without any coordination.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<LoopEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Hand out an independent receiver.
    ///
    /// A receiver that falls more than the buffer size behind gets a
    /// `RecvError::Lagged` on its next read and loses the oldest events;
    /// the publisher side never waits.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    /// How many receivers are currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stamp and publish an event.
    ///
    /// An emit with nobody listening simply vanishes, which is the normal
    /// state for headless runs.
    pub fn emit(&self, kind: LoopEventKind) {
        let _ = self.tx.send(LoopEvent::new(kind));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
