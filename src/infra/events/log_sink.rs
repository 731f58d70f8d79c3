//! Tracing-backed and fan-out event sinks.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, trace};

use crate::core::events::is_nolog;
use crate::core::{AppResult, EventSink};

/// Writes events to the `tracing` log, skipping payloads marked `nolog`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn dispatch_event(&self, topic: &str, payload: Value) -> AppResult<()> {
        if is_nolog(&payload) {
            trace!(topic = topic, "suppressed nolog event");
            return Ok(());
        }
        info!(topic = topic, payload = %payload, "event");
        Ok(())
    }
}

/// Dispatches every event to each inner sink in order.
///
/// Stops at the first failing sink and returns its error.
#[derive(Clone, Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no inner sinks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for CompositeEventSink {
    fn dispatch_event(&self, topic: &str, payload: Value) -> AppResult<()> {
        for sink in &self.sinks {
            sink.dispatch_event(topic, payload.clone())?;
        }
        Ok(())
    }
}
