//! Registration domain module (event-sourced).
//!
//! This crate contains the seat-inventory business rules, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage).

pub mod availability;

pub use availability::{
    AddSeats, AvailabilityCommand, AvailabilityEvent, AvailabilityMemento, AvailableSeatsChanged,
    CancelReservation, CommitReservation, MakeReservation, PendingReservation, RemoveSeats,
    ReservationCancelled, ReservationCommitted, SeatsAvailability, SeatsReserved,
};
