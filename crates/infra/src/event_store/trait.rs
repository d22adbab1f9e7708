use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use confreg_core::{AggregateId, ExpectedVersion};

/// An event ready to be appended to a stream (not yet assigned a sequence
/// number).
///
/// Domain modules build this from their typed events via
/// [`UncommittedEvent::from_typed`], which serializes the payload and captures
/// the event metadata needed for later deserialization. The event store
/// assigns sequence numbers during append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,

    /// Id of the command that produced this event, if any. Carried into the
    /// published envelope so responders can be matched to requests.
    pub correlation_id: Option<String>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the event store during append:
/// monotonically increasing per stream, gapless, starting at 1. The stream
/// key is `(aggregate_id, aggregate_type)`, so two aggregates of different
/// kinds may share a UUID without their histories mixing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub correlation_id: Option<String>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an event envelope for publication.
    pub fn to_envelope(&self) -> confreg_messaging::EventEnvelope<JsonValue> {
        confreg_messaging::EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.sequence_number,
            self.correlation_id.clone(),
            self.payload.clone(),
        )
    }
}

/// Event store operation error (infrastructure, not domain).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store storage error: {0}")]
    Storage(String),
}

/// Append-only event store.
///
/// Events are organized into streams, one per aggregate instance, keyed by
/// `(aggregate_id, aggregate_type)`. Within a stream, sequence numbers are
/// gapless ascending from 1.
///
/// `append` must:
/// - validate that all events in the batch target the same stream
/// - check optimistic concurrency against the current stream version
/// - assign sequence numbers starting at `current_version + 1`
/// - persist the batch atomically (all or nothing)
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream (append-only).
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an aggregate, in sequence number order.
    ///
    /// Returns an empty vector if the stream does not exist yet.
    fn load_stream(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the stream tail after `after_version` (exclusive). Used for
    /// snapshot + tail rehydration.
    fn load_stream_from(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id, aggregate_type)
    }

    fn load_stream_from(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream_from(aggregate_id, aggregate_type, after_version)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Keeps infra decoupled from business, while still capturing the event
    /// metadata needed for future deserialization.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        correlation_id: Option<String>,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: confreg_messaging::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            occurred_at: event.occurred_at(),
            correlation_id,
            payload,
        })
    }
}
