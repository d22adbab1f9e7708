//! Infrastructure layer: event store, durable queues, processors, process
//! manager persistence.

pub mod event_store;
pub mod handlers;
pub mod payments;
pub mod process;
pub mod processor;
pub mod queue;
pub mod repository;

#[cfg(test)]
mod integration_tests;

pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, InMemorySnapshotStore, PostgresEventStore,
    PostgresSnapshotStore, SnapshotRecord, SnapshotStore, StoredEvent, UncommittedEvent,
};
pub use processor::{MessageProcessor, ProcessorConfig, ProcessorHandle};
pub use queue::PostgresMessageQueue;
pub use repository::{AggregateRepository, DispatchError};
