use std::collections::HashMap;
use std::sync::RwLock;

use confreg_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    aggregate_id: AggregateId,
    aggregate_type: String,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        // All events must target the same stream.
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let key = StreamKey {
            aggregate_id,
            aggregate_type,
        };

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let stream = streams.entry(key).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        // Assign sequence numbers and append (append-only).
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                schema_version: e.schema_version,
                occurred_at: e.occurred_at,
                correlation_id: e.correlation_id,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.load_stream_from(aggregate_id, aggregate_type, 0)
    }

    fn load_stream_from(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams
            .get(&key)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence_number > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn uncommitted(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "tests.happened".to_string(),
            schema_version: 1,
            occurred_at: Utc::now(),
            correlation_id: None,
            payload: json!({}),
        }
    }

    #[test]
    fn sequence_numbers_are_gapless_from_one() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let first = store
            .append(
                vec![uncommitted(id, "tests.thing"), uncommitted(id, "tests.thing")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        let second = store
            .append(vec![uncommitted(id, "tests.thing")], ExpectedVersion::Exact(2))
            .unwrap();

        let seqs: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "tests.thing")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![uncommitted(id, "tests.thing")], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn streams_are_keyed_by_id_and_type() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "tests.a")], ExpectedVersion::Exact(0))
            .unwrap();
        store
            .append(vec![uncommitted(id, "tests.b")], ExpectedVersion::Exact(0))
            .unwrap();

        assert_eq!(store.load_stream(id, "tests.a").unwrap().len(), 1);
        assert_eq!(store.load_stream(id, "tests.b").unwrap().len(), 1);
    }

    #[test]
    fn load_stream_from_returns_only_the_tail() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(
                vec![
                    uncommitted(id, "tests.thing"),
                    uncommitted(id, "tests.thing"),
                    uncommitted(id, "tests.thing"),
                ],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let tail = store.load_stream_from(id, "tests.thing", 2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence_number, 3);
    }

    #[test]
    fn mixed_stream_batches_are_rejected() {
        let store = InMemoryEventStore::new();

        let err = store
            .append(
                vec![
                    uncommitted(AggregateId::new(), "tests.thing"),
                    uncommitted(AggregateId::new(), "tests.thing"),
                ],
                ExpectedVersion::Any,
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }
}
