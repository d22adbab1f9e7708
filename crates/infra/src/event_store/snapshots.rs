//! Snapshot persistence for event-sourced aggregates.
//!
//! A snapshot is an opaque serialized memento of an aggregate at a given
//! stream version. Repositories use it to replay only the event tail instead
//! of the full history; losing every snapshot is always safe.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use confreg_core::AggregateId;

use super::r#trait::EventStoreError;

/// Latest snapshot of one aggregate instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Stream version the state was captured at.
    pub version: u64,
    pub state: JsonValue,
}

/// Keyed like event streams: `(aggregate_id, aggregate_type)`. Only the most
/// recent snapshot per aggregate is retained.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: SnapshotRecord) -> Result<(), EventStoreError>;

    fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<SnapshotRecord>, EventStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(AggregateId, String), SnapshotRecord>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: SnapshotRecord) -> Result<(), EventStoreError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        snapshots.insert(
            (snapshot.aggregate_id, snapshot.aggregate_type.clone()),
            snapshot,
        );
        Ok(())
    }

    fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<SnapshotRecord>, EventStoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(snapshots
            .get(&(aggregate_id, aggregate_type.to_string()))
            .cloned())
    }
}
