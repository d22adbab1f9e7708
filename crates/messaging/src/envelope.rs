use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use confreg_core::AggregateId;

use crate::command::Command;
use crate::event::Event;

/// Envelope for a published event, containing stream metadata.
///
/// This is the unit that crosses the events queue after an append.
///
/// Notes:
/// - **Append-only**: `sequence_number` is monotonically increasing per
///   stream (gapless, starting at 1 or at snapshot version + 1).
/// - `correlation_id` links the event back to the command that produced it,
///   so request/response consumers (the process manager) can reject stale or
///   duplicated responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Stable event type tag used for dispatch.
    event_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    correlation_id: Option<String>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        sequence_number: u64,
        correlation_id: Option<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            sequence_number,
            correlation_id,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Deserialize the payload into a typed event.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Envelope for a command travelling over the commands queue.
///
/// The envelope `id` doubles as the correlation key: a responder stamps it on
/// the events it publishes so the requester can match the response to its
/// outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: Uuid,

    /// Stable command type tag used for dispatch.
    pub command_type: String,

    pub payload: JsonValue,

    /// Earliest delivery time (delayed message). `None` delivers immediately.
    pub deliver_after: Option<DateTime<Utc>>,

    /// Do-not-bother-processing-after hint (an optimization, not a
    /// correctness mechanism; consumers may still see expired commands).
    pub expires_at: Option<DateTime<Utc>>,

    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    /// Wrap a typed command, serializing its payload.
    pub fn from_typed<C>(id: Uuid, command: &C) -> Result<Self, serde_json::Error>
    where
        C: Command + Serialize,
    {
        Ok(Self {
            id,
            command_type: command.command_type().to_string(),
            payload: serde_json::to_value(command)?,
            deliver_after: None,
            expires_at: None,
            correlation_id: None,
        })
    }

    /// Delay delivery by `delay` from now.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.deliver_after = Some(Utc::now() + delay);
        self
    }

    /// Mark the command as stale after `ttl` from now.
    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Deserialize the payload into a typed command.
    pub fn decode<C: Command + DeserializeOwned>(&self) -> Result<C, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
