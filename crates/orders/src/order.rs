use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use confreg_core::{
    Aggregate, AggregateRoot, ConferenceId, DomainError, OrderId, SeatQuantity, SeatTypeId,
};
use confreg_messaging::{Command, Event};

use crate::pricing::{OrderLineTotal, PricingService};

/// Aggregate root: Order.
///
/// A registration order for seats at a conference. The order's seat lines are
/// a *request* until a reservation confirms them; confirmation freezes the
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    conference_id: Option<ConferenceId>,
    seats: Vec<SeatQuantity>,
    total: Option<u64>,
    placed: bool,
    confirmed: bool,
    expired: bool,
    version: u64,
}

impl Order {
    /// Create an empty, not-yet-placed aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            conference_id: None,
            seats: Vec::new(),
            total: None,
            placed: false,
            confirmed: false,
            expired: false,
            version: 0,
        }
    }

    pub fn conference_id(&self) -> Option<ConferenceId> {
        self.conference_id
    }

    pub fn seats(&self) -> &[SeatQuantity] {
        &self.seats
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn is_placed(&self) -> bool {
        self.placed
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Expand the confirmed seat lines into individual assignable positions
    /// (5 seats of one type become 5 positions of that type).
    pub fn seat_assignment_positions(&self) -> Result<Vec<SeatTypeId>, DomainError> {
        if !self.confirmed {
            return Err(DomainError::invariant(
                "seat assignments require a confirmed order",
            ));
        }
        let mut positions = Vec::new();
        for line in &self.seats {
            for _ in 0..line.quantity.max(0) {
                positions.push(line.seat_type);
            }
        }
        Ok(positions)
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub conference_id: ConferenceId,
    pub seats: Vec<SeatQuantity>,
    /// End of the window within which the registrant must complete payment.
    pub reservation_auto_expiration: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateSeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSeats {
    pub order_id: OrderId,
    pub seats: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkAsReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAsReserved {
    pub order_id: OrderId,
    /// What the inventory actually granted (may be less than requested).
    pub reserved_seats: Vec<SeatQuantity>,
    pub expiration: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExpireOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    UpdateSeats(UpdateSeats),
    MarkAsReserved(MarkAsReserved),
    ExpireOrder(ExpireOrder),
    ConfirmOrder(ConfirmOrder),
}

impl Command for PlaceOrder {
    fn command_type(&self) -> &'static str {
        "orders.place_order"
    }
}

impl Command for UpdateSeats {
    fn command_type(&self) -> &'static str {
        "orders.update_seats"
    }
}

impl Command for MarkAsReserved {
    fn command_type(&self) -> &'static str {
        "orders.mark_as_reserved"
    }
}

impl Command for ExpireOrder {
    fn command_type(&self) -> &'static str {
        "orders.expire_order"
    }
}

impl Command for ConfirmOrder {
    fn command_type(&self) -> &'static str {
        "orders.confirm_order"
    }
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub conference_id: ConferenceId,
    pub seats: Vec<SeatQuantity>,
    pub reservation_auto_expiration: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderPlaced {
    fn event_type(&self) -> &'static str {
        "orders.order_placed"
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Event: OrderUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdated {
    pub order_id: OrderId,
    pub seats: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderUpdated {
    fn event_type(&self) -> &'static str {
        "orders.order_updated"
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Event: OrderTotalsCalculated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotalsCalculated {
    pub order_id: OrderId,
    pub lines: Vec<OrderLineTotal>,
    pub total: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPartiallyReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPartiallyReserved {
    pub order_id: OrderId,
    pub reserved_seats: Vec<SeatQuantity>,
    pub reservation_expiration: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderReservationCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReservationCompleted {
    pub order_id: OrderId,
    pub reserved_seats: Vec<SeatQuantity>,
    pub reservation_expiration: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderExpired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExpired {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OrderConfirmed {
    fn event_type(&self) -> &'static str {
        "orders.order_confirmed"
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Internally tagged so a stored payload deserializes both as the enum (for
/// rehydration) and as the plain variant struct (for envelope consumers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    OrderUpdated(OrderUpdated),
    OrderTotalsCalculated(OrderTotalsCalculated),
    OrderPartiallyReserved(OrderPartiallyReserved),
    OrderReservationCompleted(OrderReservationCompleted),
    OrderExpired(OrderExpired),
    OrderConfirmed(OrderConfirmed),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "orders.order_placed",
            OrderEvent::OrderUpdated(_) => "orders.order_updated",
            OrderEvent::OrderTotalsCalculated(_) => "orders.order_totals_calculated",
            OrderEvent::OrderPartiallyReserved(_) => "orders.order_partially_reserved",
            OrderEvent::OrderReservationCompleted(_) => "orders.order_reservation_completed",
            OrderEvent::OrderExpired(_) => "orders.order_expired",
            OrderEvent::OrderConfirmed(_) => "orders.order_confirmed",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.occurred_at,
            OrderEvent::OrderUpdated(e) => e.occurred_at,
            OrderEvent::OrderTotalsCalculated(e) => e.occurred_at,
            OrderEvent::OrderPartiallyReserved(e) => e.occurred_at,
            OrderEvent::OrderReservationCompleted(e) => e.occurred_at,
            OrderEvent::OrderExpired(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Services = dyn PricingService;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.conference_id = Some(e.conference_id);
                self.seats = e.seats.clone();
                self.placed = true;
            }
            OrderEvent::OrderUpdated(e) => {
                self.seats = e.seats.clone();
            }
            OrderEvent::OrderTotalsCalculated(e) => {
                self.total = Some(e.total);
            }
            OrderEvent::OrderPartiallyReserved(e) => {
                self.seats = e.reserved_seats.clone();
            }
            OrderEvent::OrderReservationCompleted(e) => {
                self.seats = e.reserved_seats.clone();
            }
            OrderEvent::OrderExpired(_) => {
                self.expired = true;
            }
            OrderEvent::OrderConfirmed(_) => {
                self.confirmed = true;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(
        &self,
        command: &Self::Command,
        pricing: &Self::Services,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd, pricing),
            OrderCommand::UpdateSeats(cmd) => self.handle_update_seats(cmd, pricing),
            OrderCommand::MarkAsReserved(cmd) => self.handle_mark_as_reserved(cmd, pricing),
            OrderCommand::ExpireOrder(cmd) => self.handle_expire(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn calculate_totals(
        &self,
        conference_id: ConferenceId,
        seats: &[SeatQuantity],
        pricing: &dyn PricingService,
        occurred_at: DateTime<Utc>,
    ) -> Result<OrderEvent, DomainError> {
        let priced = pricing
            .calculate_total(conference_id, seats)
            .map_err(|e| DomainError::validation(e.to_string()))?;
        Ok(OrderEvent::OrderTotalsCalculated(OrderTotalsCalculated {
            order_id: self.id,
            lines: priced.lines,
            total: priced.total,
            occurred_at,
        }))
    }

    fn handle_place(
        &self,
        cmd: &PlaceOrder,
        pricing: &dyn PricingService,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        if self.placed {
            return Err(DomainError::conflict("order already placed"));
        }
        if cmd.seats.is_empty() {
            return Err(DomainError::validation("order must contain at least one seat"));
        }

        let placed = OrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            conference_id: cmd.conference_id,
            seats: cmd.seats.clone(),
            reservation_auto_expiration: cmd.reservation_auto_expiration,
            occurred_at: cmd.occurred_at,
        });
        let totals =
            self.calculate_totals(cmd.conference_id, &cmd.seats, pricing, cmd.occurred_at)?;
        Ok(vec![placed, totals])
    }

    fn handle_update_seats(
        &self,
        cmd: &UpdateSeats,
        pricing: &dyn PricingService,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;
        if self.confirmed {
            return Err(DomainError::invariant("cannot update a confirmed order"));
        }
        if cmd.seats.is_empty() {
            return Err(DomainError::validation("order must contain at least one seat"));
        }

        let conference_id = self
            .conference_id
            .ok_or_else(|| DomainError::invariant("placed order has no conference"))?;
        let updated = OrderEvent::OrderUpdated(OrderUpdated {
            order_id: cmd.order_id,
            seats: cmd.seats.clone(),
            occurred_at: cmd.occurred_at,
        });
        let totals = self.calculate_totals(conference_id, &cmd.seats, pricing, cmd.occurred_at)?;
        Ok(vec![updated, totals])
    }

    fn handle_mark_as_reserved(
        &self,
        cmd: &MarkAsReserved,
        pricing: &dyn PricingService,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;
        if self.confirmed {
            return Err(DomainError::invariant(
                "cannot change the reservation of a confirmed order",
            ));
        }

        let is_complete = self.seats.iter().filter(|l| l.quantity > 0).all(|wanted| {
            cmd.reserved_seats
                .iter()
                .any(|got| got.seat_type == wanted.seat_type && got.quantity == wanted.quantity)
        });

        if is_complete {
            return Ok(vec![OrderEvent::OrderReservationCompleted(
                OrderReservationCompleted {
                    order_id: cmd.order_id,
                    reserved_seats: cmd.reserved_seats.clone(),
                    reservation_expiration: cmd.expiration,
                    occurred_at: cmd.occurred_at,
                },
            )]);
        }

        let conference_id = self
            .conference_id
            .ok_or_else(|| DomainError::invariant("placed order has no conference"))?;
        let partial = OrderEvent::OrderPartiallyReserved(OrderPartiallyReserved {
            order_id: cmd.order_id,
            reserved_seats: cmd.reserved_seats.clone(),
            reservation_expiration: cmd.expiration,
            occurred_at: cmd.occurred_at,
        });
        // The registrant only pays for what was actually granted.
        let totals =
            self.calculate_totals(conference_id, &cmd.reserved_seats, pricing, cmd.occurred_at)?;
        Ok(vec![partial, totals])
    }

    fn handle_expire(&self, cmd: &ExpireOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;
        if self.confirmed {
            return Err(DomainError::invariant("cannot expire a confirmed order"));
        }
        if self.expired {
            // Expiration races manual rejection; the second one is a no-op.
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::OrderExpired(OrderExpired {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.placed {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(cmd.order_id)?;
        if self.expired {
            return Err(DomainError::invariant("cannot confirm an expired order"));
        }
        if self.confirmed {
            // At-least-once delivery makes repeats normal.
            return Ok(vec![]);
        }
        Ok(vec![OrderEvent::OrderConfirmed(OrderConfirmed {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::CatalogPricingService;

    struct Fixture {
        conference_id: ConferenceId,
        order_id: OrderId,
        seat_type: SeatTypeId,
        pricing: CatalogPricingService,
    }

    fn fixture() -> Fixture {
        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();
        Fixture {
            conference_id,
            order_id: OrderId::new(),
            seat_type,
            pricing: CatalogPricingService::new().with_price(conference_id, seat_type, 100_00),
        }
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn placed_order(fx: &Fixture, quantity: i32) -> Order {
        let mut order = Order::empty(fx.order_id);
        let events = order
            .handle(
                &OrderCommand::PlaceOrder(PlaceOrder {
                    order_id: fx.order_id,
                    conference_id: fx.conference_id,
                    seats: vec![SeatQuantity::new(fx.seat_type, quantity)],
                    reservation_auto_expiration: test_time() + chrono::Duration::minutes(15),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();
        for event in &events {
            order.apply(event);
        }
        order
    }

    #[test]
    fn placing_emits_order_placed_and_totals() {
        let fx = fixture();
        let order = Order::empty(fx.order_id);

        let events = order
            .handle(
                &OrderCommand::PlaceOrder(PlaceOrder {
                    order_id: fx.order_id,
                    conference_id: fx.conference_id,
                    seats: vec![SeatQuantity::new(fx.seat_type, 3)],
                    reservation_auto_expiration: test_time(),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OrderEvent::OrderPlaced(_)));
        match &events[1] {
            OrderEvent::OrderTotalsCalculated(e) => assert_eq!(e.total, 300_00),
            _ => panic!("Expected OrderTotalsCalculated event"),
        }
    }

    #[test]
    fn placing_twice_is_a_conflict() {
        let fx = fixture();
        let order = placed_order(&fx, 2);

        let err = order
            .handle(
                &OrderCommand::PlaceOrder(PlaceOrder {
                    order_id: fx.order_id,
                    conference_id: fx.conference_id,
                    seats: vec![SeatQuantity::new(fx.seat_type, 1)],
                    reservation_auto_expiration: test_time(),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn unknown_seat_type_fails_pricing() {
        let fx = fixture();
        let order = Order::empty(fx.order_id);

        let err = order
            .handle(
                &OrderCommand::PlaceOrder(PlaceOrder {
                    order_id: fx.order_id,
                    conference_id: fx.conference_id,
                    seats: vec![SeatQuantity::new(SeatTypeId::new(), 1)],
                    reservation_auto_expiration: test_time(),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn updating_seats_recalculates_totals() {
        let fx = fixture();
        let mut order = placed_order(&fx, 2);

        let events = order
            .handle(
                &OrderCommand::UpdateSeats(UpdateSeats {
                    order_id: fx.order_id,
                    seats: vec![SeatQuantity::new(fx.seat_type, 5)],
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();
        for event in &events {
            order.apply(event);
        }

        assert_eq!(order.total(), Some(500_00));
        assert_eq!(order.seats(), &[SeatQuantity::new(fx.seat_type, 5)]);
    }

    #[test]
    fn full_reservation_completes_without_recalculating() {
        let fx = fixture();
        let order = placed_order(&fx, 3);

        let events = order
            .handle(
                &OrderCommand::MarkAsReserved(MarkAsReserved {
                    order_id: fx.order_id,
                    reserved_seats: vec![SeatQuantity::new(fx.seat_type, 3)],
                    expiration: test_time(),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], OrderEvent::OrderReservationCompleted(_)));
    }

    #[test]
    fn partial_reservation_reprices_the_granted_seats() {
        let fx = fixture();
        let mut order = placed_order(&fx, 3);

        let events = order
            .handle(
                &OrderCommand::MarkAsReserved(MarkAsReserved {
                    order_id: fx.order_id,
                    reserved_seats: vec![SeatQuantity::new(fx.seat_type, 2)],
                    expiration: test_time(),
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], OrderEvent::OrderPartiallyReserved(_)));
        match &events[1] {
            OrderEvent::OrderTotalsCalculated(e) => assert_eq!(e.total, 200_00),
            _ => panic!("Expected OrderTotalsCalculated event"),
        }
        for event in &events {
            order.apply(event);
        }
        assert_eq!(order.seats(), &[SeatQuantity::new(fx.seat_type, 2)]);
    }

    #[test]
    fn confirmed_order_is_frozen() {
        let fx = fixture();
        let mut order = placed_order(&fx, 2);
        let events = order
            .handle(
                &OrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id: fx.order_id,
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();
        for event in &events {
            order.apply(event);
        }
        assert!(order.is_confirmed());

        let update = order.handle(
            &OrderCommand::UpdateSeats(UpdateSeats {
                order_id: fx.order_id,
                seats: vec![SeatQuantity::new(fx.seat_type, 1)],
                occurred_at: test_time(),
            }),
            &fx.pricing,
        );
        assert!(update.is_err());

        let expire = order.handle(
            &OrderCommand::ExpireOrder(ExpireOrder {
                order_id: fx.order_id,
                occurred_at: test_time(),
            }),
            &fx.pricing,
        );
        assert!(expire.is_err());
    }

    #[test]
    fn expired_order_cannot_be_confirmed() {
        let fx = fixture();
        let mut order = placed_order(&fx, 2);
        let events = order
            .handle(
                &OrderCommand::ExpireOrder(ExpireOrder {
                    order_id: fx.order_id,
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();
        for event in &events {
            order.apply(event);
        }

        let err = order
            .handle(
                &OrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id: fx.order_id,
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn seat_positions_expand_quantities_after_confirmation() {
        let fx = fixture();
        let mut order = placed_order(&fx, 3);

        assert!(order.seat_assignment_positions().is_err());

        let events = order
            .handle(
                &OrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id: fx.order_id,
                    occurred_at: test_time(),
                }),
                &fx.pricing,
            )
            .unwrap();
        for event in &events {
            order.apply(event);
        }

        let positions = order.seat_assignment_positions().unwrap();
        assert_eq!(positions, vec![fx.seat_type; 3]);
    }
}
