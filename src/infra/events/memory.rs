//! In-memory event bus.
//!
//! Keeps a bounded history of dispatched events and streams each one to
//! subscribers over unbounded crossbeam channels.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::core::{AppResult, EventSink};
use crate::util::clock::now_ms;

/// One dispatched event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Topic the event was published under.
    pub topic: String,
    /// Event payload.
    pub payload: Value,
    /// Dispatch time, ms since epoch.
    pub created_at_ms: u64,
}

/// Bounded in-memory bus for development and testing.
pub struct InMemoryEventBus {
    events: Mutex<VecDeque<EventRecord>>,
    subscribers: Mutex<Vec<Sender<EventRecord>>>,
    max_events: usize,
}

impl InMemoryEventBus {
    /// Create a bus retaining at most `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(4096))),
            subscribers: Mutex::new(Vec::new()),
            max_events,
        }
    }

    /// Stream every event dispatched from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().iter().cloned().collect()
    }

    /// Retained events published under `topic`.
    #[must_use]
    pub fn events_for(&self, topic: &str) -> Vec<EventRecord> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Retained events whose payload `id` equals `task_id`.
    #[must_use]
    pub fn events_for_task(&self, task_id: u64) -> Vec<EventRecord> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.payload.get("id").and_then(Value::as_u64) == Some(task_id))
            .cloned()
            .collect()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop retained history.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl EventSink for InMemoryEventBus {
    fn dispatch_event(&self, topic: &str, payload: Value) -> AppResult<()> {
        let record = EventRecord {
            event_id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload,
            created_at_ms: now_ms(),
        };

        {
            let mut events = self.events.lock();
            if self.max_events > 0 {
                if events.len() >= self.max_events {
                    events.pop_front();
                }
                events.push_back(record.clone());
            }
        }

        self.subscribers
            .lock()
            .retain(|tx| tx.send(record.clone()).is_ok());
        Ok(())
    }
}
