//! Aggregate repository (application-level orchestration).
//!
//! Implements the command pipeline for event-sourced aggregates: load the
//! stream, rehydrate, handle the command, append with an optimistic version
//! check, publish the committed events to the events queue.
//!
//! Aggregates are short-lived: one is constructed per call and dropped when
//! the call returns; there is no identity map and no long-lived aggregate
//! cache. The stream itself is the source of truth.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use confreg_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, Snapshotting};
use confreg_messaging::{MessageQueue, OutgoingMessage, QueueError};

use crate::event_store::{
    EventStore, EventStoreError, SnapshotRecord, SnapshotStore, StoredEvent, UncommittedEvent,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Domain invariant failure (deterministic).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Domain-level not found.
    #[error("not found")]
    NotFound,
    /// Failed to deserialize historical event payloads into the aggregate
    /// event type. Fatal: replaying an undecodable event is never skipped.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; the
    /// events are durable, a retry may duplicate them on the queue).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Repository over an event store and the *events* queue.
///
/// ## Execution guarantees
///
/// - Events are appended before publication; if the append fails nothing is
///   published.
/// - Each command operates on a single aggregate instance with
///   `ExpectedVersion::Exact`; a concurrent writer surfaces as
///   [`DispatchError::Concurrency`] and the caller may retry by re-executing.
/// - Published envelopes carry the caller's correlation id, so a responder's
///   events can be matched back to the command that caused them.
#[derive(Debug)]
pub struct AggregateRepository<S, Q> {
    store: S,
    events_queue: Q,
    snapshot_every: u64,
}

const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

impl<S, Q> AggregateRepository<S, Q> {
    pub fn new(store: S, events_queue: Q) -> Self {
        Self {
            store,
            events_queue,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
        }
    }

    /// Override the snapshot cadence used by `execute_snapshotted`.
    pub fn with_snapshot_every(mut self, snapshot_every: u64) -> Self {
        self.snapshot_every = snapshot_every.max(1);
        self
    }
}

impl<S, Q> AggregateRepository<S, Q>
where
    S: EventStore,
    Q: MessageQueue,
{
    /// Execute a command through the full pipeline and return the committed
    /// events. A command that decides zero events is a successful no-op.
    pub fn execute<A>(
        &self,
        id: A::Id,
        aggregate_type: &str,
        command: &A::Command,
        services: &A::Services,
        correlation_id: Option<&str>,
        make_aggregate: impl FnOnce(A::Id) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Id: Copy + Into<Uuid>,
        A::Event: confreg_messaging::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = AggregateId::from_uuid(id.into());
        let history = self.store.load_stream(aggregate_id, aggregate_type)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(id);
        apply_history(&mut aggregate, &history)?;

        let decided = aggregate
            .handle(command, services)
            .map_err(DispatchError::from)?;

        self.commit(aggregate_id, aggregate_type, expected, correlation_id, decided)
    }

    /// Rehydrate an aggregate without executing a command.
    pub fn load<A>(
        &self,
        id: A::Id,
        aggregate_type: &str,
        make_aggregate: impl FnOnce(A::Id) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Id: Copy + Into<Uuid>,
        A::Event: DeserializeOwned,
    {
        let aggregate_id = AggregateId::from_uuid(id.into());
        let history = self.store.load_stream(aggregate_id, aggregate_type)?;
        let mut aggregate = make_aggregate(id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Like `execute`, but restores from the latest snapshot plus the stream
    /// tail, and refreshes the snapshot once it lags the stream by at least
    /// `snapshot_every` events.
    pub fn execute_snapshotted<A, SN>(
        &self,
        snapshots: &SN,
        id: A::Id,
        aggregate_type: &str,
        command: &A::Command,
        services: &A::Services,
        correlation_id: Option<&str>,
        make_aggregate: impl FnOnce(A::Id) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Snapshotting<Error = DomainError>,
        A::Id: Copy + Into<Uuid>,
        A::Event: confreg_messaging::Event + Serialize + DeserializeOwned,
        A::Memento: Serialize + DeserializeOwned,
        SN: SnapshotStore,
    {
        let aggregate_id = AggregateId::from_uuid(id.into());

        let snapshot = snapshots.load(aggregate_id, aggregate_type)?;
        let (mut aggregate, snapshot_version) = match snapshot {
            Some(record) => {
                let memento: A::Memento = serde_json::from_value(record.state)
                    .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
                (A::from_memento(id, record.version, memento), record.version)
            }
            None => (make_aggregate(id), 0),
        };

        let tail = self
            .store
            .load_stream_from(aggregate_id, aggregate_type, snapshot_version)?;
        let expected = ExpectedVersion::Exact(
            tail.last()
                .map(|e| e.sequence_number)
                .unwrap_or(snapshot_version),
        );
        apply_history(&mut aggregate, &tail)?;

        let decided = aggregate
            .handle(command, services)
            .map_err(DispatchError::from)?;
        let committed =
            self.commit(aggregate_id, aggregate_type, expected, correlation_id, decided)?;

        // Refresh the snapshot from the post-command state once enough events
        // have accumulated since the last one.
        for stored in &committed {
            let event: A::Event = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            aggregate.apply(&event);
        }
        let current_version = committed
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or_else(|| aggregate.version());
        if current_version.saturating_sub(snapshot_version) >= self.snapshot_every {
            let state = serde_json::to_value(aggregate.to_memento())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            snapshots.save(SnapshotRecord {
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                version: current_version,
                state,
            })?;
        }

        Ok(committed)
    }

    fn commit<E>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected: ExpectedVersion,
        correlation_id: Option<&str>,
        decided: Vec<E>,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        E: confreg_messaging::Event + Serialize,
    {
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let uncommitted = decided
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(
                    aggregate_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    correlation_id.map(str::to_string),
                    event,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        let messages = committed
            .iter()
            .map(|stored| {
                let envelope = stored.to_envelope();
                let body = serde_json::to_string(&envelope)
                    .map_err(|e| DispatchError::Publish(e.to_string()))?;
                let mut message = OutgoingMessage::new(body);
                if let Some(correlation_id) = stored.correlation_id.clone() {
                    message = message.with_correlation_id(correlation_id);
                }
                Ok(message)
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        self.events_queue
            .send(messages)
            .map_err(|e: QueueError| DispatchError::Publish(e.to_string()))?;

        Ok(committed)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let event: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryEventStore, InMemorySnapshotStore};
    use chrono::Utc;
    use confreg_messaging::InMemoryMessageQueue;
    use confreg_registration::{
        AddSeats, AvailabilityCommand, MakeReservation, SeatsAvailability,
    };
    use confreg_core::{ConferenceId, ReservationId, SeatQuantity, SeatTypeId};
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    const AVAILABILITY: &str = "registration.seats_availability";

    fn add_seats(conference_id: ConferenceId, seat_type: SeatTypeId, quantity: i32) -> AvailabilityCommand {
        AvailabilityCommand::AddSeats(AddSeats {
            conference_id,
            seat_type,
            quantity,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn execute_appends_and_publishes_with_correlation() {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let repo = AggregateRepository::new(store.clone(), queue.clone());

        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();

        let committed = repo
            .execute::<SeatsAvailability>(
                conference_id,
                AVAILABILITY,
                &add_seats(conference_id, seat_type, 10),
                &(),
                Some("cmd-1"),
                SeatsAvailability::empty,
            )
            .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[0].correlation_id.as_deref(), Some("cmd-1"));

        // The published envelope carries the same correlation id.
        queue
            .receive(&|msg| {
                let envelope: confreg_messaging::EventEnvelope<JsonValue> =
                    serde_json::from_str(&msg.body)?;
                assert_eq!(envelope.correlation_id(), Some("cmd-1"));
                assert_eq!(envelope.event_type(), "registration.available_seats_changed");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn load_rehydrates_from_history() {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let repo = AggregateRepository::new(store, queue);

        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();

        repo.execute::<SeatsAvailability>(
            conference_id,
            AVAILABILITY,
            &add_seats(conference_id, seat_type, 10),
            &(),
            None,
            SeatsAvailability::empty,
        )
        .unwrap();

        let availability = repo
            .load(conference_id, AVAILABILITY, SeatsAvailability::empty)
            .unwrap();
        assert_eq!(availability.remaining_for(seat_type), 10);
    }

    #[test]
    fn no_op_command_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let repo = AggregateRepository::new(store, queue.clone());

        let conference_id = ConferenceId::new();
        let command = AvailabilityCommand::CancelReservation(confreg_registration::CancelReservation {
            conference_id,
            reservation_id: ReservationId::new(),
            occurred_at: Utc::now(),
        });

        let committed = repo
            .execute::<SeatsAvailability>(
                conference_id,
                AVAILABILITY,
                &command,
                &(),
                None,
                SeatsAvailability::empty,
            )
            .unwrap();
        assert!(committed.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn snapshotted_execute_writes_and_restores_from_snapshots() {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let snapshots = InMemorySnapshotStore::new();
        let repo = AggregateRepository::new(store, queue).with_snapshot_every(2);

        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();
        let aggregate_id = AggregateId::from_uuid(conference_id.into());

        for _ in 0..2 {
            repo.execute_snapshotted::<SeatsAvailability, _>(
                &snapshots,
                conference_id,
                AVAILABILITY,
                &add_seats(conference_id, seat_type, 5),
                &(),
                None,
                SeatsAvailability::empty,
            )
            .unwrap();
        }

        let record = snapshots.load(aggregate_id, AVAILABILITY).unwrap().unwrap();
        assert_eq!(record.version, 2);

        // A later command rehydrates from the snapshot plus the empty tail.
        let committed = repo
            .execute_snapshotted::<SeatsAvailability, _>(
                &snapshots,
                conference_id,
                AVAILABILITY,
                &AvailabilityCommand::MakeReservation(MakeReservation {
                    conference_id,
                    reservation_id: ReservationId::new(),
                    seats: vec![SeatQuantity::new(seat_type, 12)],
                    occurred_at: Utc::now(),
                }),
                &(),
                None,
                SeatsAvailability::empty,
            )
            .unwrap();
        assert_eq!(committed.len(), 1);

        let availability = repo
            .load(conference_id, AVAILABILITY, SeatsAvailability::empty)
            .unwrap();
        // 10 in stock, 12 wanted: clamped to 10.
        assert_eq!(availability.remaining_for(seat_type), 0);
    }

    #[test]
    fn conference_mismatch_is_an_invariant_violation() {
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let repo = AggregateRepository::new(store, queue);

        let conference_id = ConferenceId::new();
        let err = repo
            .execute::<SeatsAvailability>(
                conference_id,
                AVAILABILITY,
                &add_seats(ConferenceId::new(), SeatTypeId::new(), 1),
                &(),
                None,
                SeatsAvailability::empty,
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }
}
