//! In-process publish/subscribe for the `task`, `delegation`, `completion`,
//! `activity`, and `eviction` topics. A `completion` is only ever published
//! after the corresponding database write is durable — callers publish
//! after awaiting the write, never before.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{Eviction, LogEntry, Task};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum WaahEvent {
    Task(Task),
    Delegation { task_id: String, agent_id: String },
    Completion(Task),
    Activity(LogEntry),
    Eviction(Eviction),
}

impl WaahEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            WaahEvent::Task(_) => "task",
            WaahEvent::Delegation { .. } => "delegation",
            WaahEvent::Completion(_) => "completion",
            WaahEvent::Activity(_) => "activity",
            WaahEvent::Eviction(_) => "eviction",
        }
    }
}

/// Publishing is synchronous and in order; a slow or absent subscriber
/// never blocks the publisher or other subscribers (broadcast semantics).
pub trait EventBus: Send + Sync {
    fn publish(&self, event: WaahEvent);
    fn subscribe(&self) -> broadcast::Receiver<WaahEvent>;
}

#[derive(Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<WaahEvent>>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: WaahEvent) {
        // A publish with zero subscribers is not an error; ignore the result.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<WaahEvent> {
        self.tx.subscribe()
    }
}
