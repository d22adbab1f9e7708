//! Ordering domain module (event-sourced).
//!
//! Registration orders, their seat assignments, and the pricing collaborator
//! contract. Pure domain logic; pricing data comes in through the
//! [`PricingService`] seam.

pub mod assignments;
pub mod order;
pub mod pricing;

pub use assignments::{
    AssignSeat, Attendee, CreateSeatAssignments, SeatAssigned, SeatAssignmentUpdated,
    SeatAssignments, SeatAssignmentsCommand, SeatAssignmentsCreated, SeatAssignmentsEvent,
    SeatUnassigned, UnassignSeat,
};
pub use order::{
    ConfirmOrder, ExpireOrder, MarkAsReserved, Order, OrderCommand, OrderConfirmed, OrderEvent,
    OrderExpired, OrderPartiallyReserved, OrderPlaced, OrderReservationCompleted,
    OrderTotalsCalculated, OrderUpdated, PlaceOrder, UpdateSeats,
};
pub use pricing::{CatalogPricingService, OrderLineTotal, OrderTotal, PricingError, PricingService};
