pub mod in_memory;
pub mod postgres;
pub mod snapshots;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, PostgresSnapshotStore};
pub use snapshots::{InMemorySnapshotStore, SnapshotRecord, SnapshotStore};
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
