//! `confreg-messaging` — domain-agnostic messaging mechanics.
//!
//! Commands and events are serializable records with a stable string type tag
//! used for dispatch. This crate owns the envelopes, the durable queue
//! contract (at-least-once, transactional lock-and-delete), and the handler
//! registries; it makes no storage assumptions beyond those contracts.

pub mod command;
pub mod dispatch;
pub mod envelope;
pub mod event;
pub mod in_memory_queue;
pub mod queue;

pub use command::Command;
pub use dispatch::{
    CommandHandlerRegistry, DuplicateHandler, EventHandlerRegistry, MessageDispatch,
};
pub use envelope::{CommandEnvelope, EventEnvelope};
pub use event::Event;
pub use in_memory_queue::InMemoryMessageQueue;
pub use queue::{MessageQueue, OutgoingMessage, QueueError, QueuedMessage, ReceiveOutcome};
