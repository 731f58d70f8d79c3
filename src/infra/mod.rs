//! Infrastructure adapters for the event bus and the persistent store.

pub mod datastore;
pub mod events;

pub use datastore::InMemoryDatastore;
pub use events::{CompositeEventSink, EventRecord, InMemoryEventBus, TracingEventSink};
