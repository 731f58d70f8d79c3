//! Datastore backends.

pub mod memory;

pub use memory::InMemoryDatastore;
