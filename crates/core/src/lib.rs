//! `confreg-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod seats;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, Snapshotting};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ConferenceId, OrderId, ProcessId, ReservationId, SeatTypeId};
pub use seats::SeatQuantity;
