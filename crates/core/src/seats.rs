//! Seat quantity value type shared by ordering and inventory.

use serde::{Deserialize, Serialize};

use crate::id::SeatTypeId;

/// A number of seats of one seat type.
///
/// Quantities are signed so the same shape can express stock adjustments
/// (negative deltas) as well as requested amounts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatQuantity {
    pub seat_type: SeatTypeId,
    pub quantity: i32,
}

impl SeatQuantity {
    pub fn new(seat_type: SeatTypeId, quantity: i32) -> Self {
        Self {
            seat_type,
            quantity,
        }
    }
}
