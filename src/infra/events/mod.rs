//! Event sink backends.

pub mod log_sink;
pub mod memory;

pub use log_sink::{CompositeEventSink, TracingEventSink};
pub use memory::{EventRecord, InMemoryEventBus};
