//! Durable message queue contract.
//!
//! The queue is the transport between the write side (repositories, the
//! process manager's outbox) and the long-running processors. The contract is
//! deliberately narrow:
//!
//! - **Transactional sends**: `send` appends a batch of rows atomically; all
//!   messages become visible together or not at all. Callers that enlist the
//!   send in a wider transaction (the Postgres implementation) get "nothing
//!   was sent" semantics on rollback.
//! - **Lock-and-delete receive**: `receive` claims the oldest eligible row
//!   (delivery date unset or due, skipping rows claimed by a concurrent
//!   receiver), runs the subscriber synchronously while the claim is held,
//!   and deletes the row only if the subscriber succeeds. A failing
//!   subscriber releases the claim and the message stays for a later retry.
//! - **At-least-once**: a crash between subscriber success and delete
//!   redelivers; consumers must be idempotent.
//!
//! Row order is FIFO by insertion id, not by logical event order across
//! aggregates. Cross-aggregate ordering is the process manager's problem
//! (correlation ids), not the queue's.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// A message ready to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Serialized envelope (opaque to the queue).
    pub body: String,
    /// Earliest delivery time; `None` delivers immediately.
    pub deliver_after: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            deliver_after: None,
            correlation_id: None,
        }
    }

    pub fn delivered_after(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_after = Some(at);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message as seen by a subscriber during `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Insertion-ordered row id (FIFO key).
    pub id: u64,
    pub body: String,
    pub correlation_id: Option<String>,
}

/// Queue operation error (infrastructure, not subscriber failures).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Outcome of a single `receive` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A message was delivered and deleted.
    Handled,
    /// A message was delivered but the subscriber failed; the message was
    /// released for a future retry.
    Abandoned,
    /// No eligible message.
    Empty,
}

/// Table-backed, transactional, lock-and-delete message queue.
pub trait MessageQueue: Send + Sync {
    /// Append a batch of messages atomically.
    fn send(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError>;

    /// Claim and deliver at most one eligible message to `subscriber`.
    ///
    /// The subscriber runs synchronously while the row is claimed, so its
    /// work should be short. Success deletes the row; failure releases it.
    fn receive(
        &self,
        subscriber: &dyn Fn(&QueuedMessage) -> anyhow::Result<()>,
    ) -> Result<ReceiveOutcome, QueueError>;
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn send(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError> {
        (**self).send(messages)
    }

    fn receive(
        &self,
        subscriber: &dyn Fn(&QueuedMessage) -> anyhow::Result<()>,
    ) -> Result<ReceiveOutcome, QueueError> {
        (**self).receive(subscriber)
    }
}
