//! Pricing collaborator for order totals.
//!
//! The order aggregate never owns price data. Totals are calculated through
//! this read-only seam so the seat catalog can live wherever it likes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use confreg_core::{ConferenceId, SeatQuantity, SeatTypeId};

/// One priced line of an order (amounts in cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineTotal {
    pub seat_type: SeatTypeId,
    pub quantity: i32,
    pub line_total: u64,
}

/// Priced order (amounts in cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotal {
    pub lines: Vec<OrderLineTotal>,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("no price defined for seat type {0}")]
    InvalidSeatType(SeatTypeId),
}

/// Calculates order totals for a conference's seat types.
pub trait PricingService: Send + Sync {
    fn calculate_total(
        &self,
        conference_id: ConferenceId,
        seats: &[SeatQuantity],
    ) -> Result<OrderTotal, PricingError>;
}

/// [`PricingService`] backed by an in-memory price catalog, used for wiring
/// and tests.
#[derive(Default)]
pub struct CatalogPricingService {
    prices: HashMap<(ConferenceId, SeatTypeId), u64>,
}

impl CatalogPricingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the unit price (cents) for a seat type of a conference.
    pub fn with_price(
        mut self,
        conference_id: ConferenceId,
        seat_type: SeatTypeId,
        unit_price: u64,
    ) -> Self {
        self.prices.insert((conference_id, seat_type), unit_price);
        self
    }
}

impl PricingService for CatalogPricingService {
    fn calculate_total(
        &self,
        conference_id: ConferenceId,
        seats: &[SeatQuantity],
    ) -> Result<OrderTotal, PricingError> {
        let mut lines = Vec::with_capacity(seats.len());
        let mut total: u64 = 0;
        for seat in seats {
            let unit_price = self
                .prices
                .get(&(conference_id, seat.seat_type))
                .copied()
                .ok_or(PricingError::InvalidSeatType(seat.seat_type))?;
            let line_total = unit_price * seat.quantity.max(0) as u64;
            total += line_total;
            lines.push(OrderLineTotal {
                seat_type: seat.seat_type,
                quantity: seat.quantity,
                line_total,
            });
        }
        Ok(OrderTotal { lines, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_summed_per_line() {
        let conference_id = ConferenceId::new();
        let full = SeatTypeId::new();
        let workshop = SeatTypeId::new();
        let pricing = CatalogPricingService::new()
            .with_price(conference_id, full, 50_00)
            .with_price(conference_id, workshop, 20_00);

        let total = pricing
            .calculate_total(
                conference_id,
                &[SeatQuantity::new(full, 3), SeatQuantity::new(workshop, 2)],
            )
            .unwrap();

        assert_eq!(total.total, 190_00);
        assert_eq!(total.lines.len(), 2);
        assert_eq!(total.lines[0].line_total, 150_00);
        assert_eq!(total.lines[1].line_total, 40_00);
    }

    #[test]
    fn unknown_seat_type_for_the_conference_is_rejected() {
        let conference_id = ConferenceId::new();
        let pricing = CatalogPricingService::new();

        let err = pricing
            .calculate_total(conference_id, &[SeatQuantity::new(SeatTypeId::new(), 1)])
            .unwrap_err();
        assert!(matches!(err, PricingError::InvalidSeatType(_)));
    }
}
