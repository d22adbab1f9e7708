//! Command-handler wiring for the three aggregates.
//!
//! Each handler decodes its typed command from the envelope, runs it through
//! the repository, and stamps the envelope id as the correlation id on
//! whatever events come out. That stamp is what lets the process manager match
//! a `SeatsReserved` back to the reservation request that caused it.

use std::sync::Arc;

use anyhow::Context;

use confreg_core::{ConferenceId, OrderId};
use confreg_messaging::{
    CommandEnvelope, CommandHandlerRegistry, DuplicateHandler, EventHandlerRegistry, MessageQueue,
};
use confreg_orders::{
    AssignSeat, ConfirmOrder, CreateSeatAssignments, ExpireOrder, MarkAsReserved, Order,
    OrderCommand, OrderConfirmed, PlaceOrder, PricingService, SeatAssignments,
    SeatAssignmentsCommand, UnassignSeat, UpdateSeats,
};
use confreg_registration::{
    AddSeats, AvailabilityCommand, CancelReservation, CommitReservation, MakeReservation,
    RemoveSeats, SeatsAvailability,
};

use crate::event_store::{EventStore, SnapshotStore};
use crate::repository::AggregateRepository;

/// Stream type tags. Part of the stream key; never change for stored data.
pub const AVAILABILITY_AGGREGATE: &str = "registration.seats_availability";
pub const ORDER_AGGREGATE: &str = "orders.order";
pub const SEAT_ASSIGNMENTS_AGGREGATE: &str = "orders.seat_assignments";

fn execute_availability<S, Q, SN>(
    repository: &AggregateRepository<S, Q>,
    snapshots: &SN,
    envelope: &CommandEnvelope,
    conference_id: ConferenceId,
    command: AvailabilityCommand,
) -> anyhow::Result<()>
where
    S: EventStore,
    Q: MessageQueue,
    SN: SnapshotStore,
{
    repository.execute_snapshotted::<SeatsAvailability, _>(
        snapshots,
        conference_id,
        AVAILABILITY_AGGREGATE,
        &command,
        &(),
        Some(&envelope.id.to_string()),
        SeatsAvailability::empty,
    )?;
    Ok(())
}

/// Seat availability commands. The availability aggregate is the contended
/// one (every order for a conference funnels into it), so it runs snapshotted.
pub fn register_availability_handlers<S, Q, SN>(
    registry: &mut CommandHandlerRegistry,
    repository: Arc<AggregateRepository<S, Q>>,
    snapshots: Arc<SN>,
) -> Result<(), DuplicateHandler>
where
    S: EventStore + 'static,
    Q: MessageQueue + 'static,
    SN: SnapshotStore + 'static,
{
    let (repo, snaps) = (repository.clone(), snapshots.clone());
    registry.register("registration.add_seats", move |envelope| {
        let cmd: AddSeats = envelope.decode().context("decode add_seats")?;
        execute_availability(
            &repo,
            &*snaps,
            envelope,
            cmd.conference_id,
            AvailabilityCommand::AddSeats(cmd),
        )
    })?;

    let (repo, snaps) = (repository.clone(), snapshots.clone());
    registry.register("registration.remove_seats", move |envelope| {
        let cmd: RemoveSeats = envelope.decode().context("decode remove_seats")?;
        execute_availability(
            &repo,
            &*snaps,
            envelope,
            cmd.conference_id,
            AvailabilityCommand::RemoveSeats(cmd),
        )
    })?;

    let (repo, snaps) = (repository.clone(), snapshots.clone());
    registry.register("registration.make_seat_reservation", move |envelope| {
        let cmd: MakeReservation = envelope.decode().context("decode make_seat_reservation")?;
        execute_availability(
            &repo,
            &*snaps,
            envelope,
            cmd.conference_id,
            AvailabilityCommand::MakeReservation(cmd),
        )
    })?;

    let (repo, snaps) = (repository.clone(), snapshots.clone());
    registry.register("registration.cancel_seat_reservation", move |envelope| {
        let cmd: CancelReservation =
            envelope.decode().context("decode cancel_seat_reservation")?;
        execute_availability(
            &repo,
            &*snaps,
            envelope,
            cmd.conference_id,
            AvailabilityCommand::CancelReservation(cmd),
        )
    })?;

    registry.register("registration.commit_seat_reservation", move |envelope| {
        let cmd: CommitReservation =
            envelope.decode().context("decode commit_seat_reservation")?;
        execute_availability(
            &repository,
            &*snapshots,
            envelope,
            cmd.conference_id,
            AvailabilityCommand::CommitReservation(cmd),
        )
    })
}

fn execute_order<S, Q>(
    repository: &AggregateRepository<S, Q>,
    pricing: &(dyn PricingService + 'static),
    envelope: &CommandEnvelope,
    order_id: OrderId,
    command: OrderCommand,
) -> anyhow::Result<()>
where
    S: EventStore,
    Q: MessageQueue,
{
    repository.execute::<Order>(
        order_id,
        ORDER_AGGREGATE,
        &command,
        pricing,
        Some(&envelope.id.to_string()),
        Order::empty,
    )?;
    Ok(())
}

/// Order commands. Pricing is the order aggregate's injected collaborator.
pub fn register_order_handlers<S, Q>(
    registry: &mut CommandHandlerRegistry,
    repository: Arc<AggregateRepository<S, Q>>,
    pricing: Arc<dyn PricingService>,
) -> Result<(), DuplicateHandler>
where
    S: EventStore + 'static,
    Q: MessageQueue + 'static,
{
    let (repo, prices) = (repository.clone(), pricing.clone());
    registry.register("orders.place_order", move |envelope| {
        let cmd: PlaceOrder = envelope.decode().context("decode place_order")?;
        execute_order(&repo, &*prices, envelope, cmd.order_id, OrderCommand::PlaceOrder(cmd))
    })?;

    let (repo, prices) = (repository.clone(), pricing.clone());
    registry.register("orders.update_seats", move |envelope| {
        let cmd: UpdateSeats = envelope.decode().context("decode update_seats")?;
        execute_order(&repo, &*prices, envelope, cmd.order_id, OrderCommand::UpdateSeats(cmd))
    })?;

    let (repo, prices) = (repository.clone(), pricing.clone());
    registry.register("orders.mark_as_reserved", move |envelope| {
        let cmd: MarkAsReserved = envelope.decode().context("decode mark_as_reserved")?;
        execute_order(
            &repo,
            &*prices,
            envelope,
            cmd.order_id,
            OrderCommand::MarkAsReserved(cmd),
        )
    })?;

    let (repo, prices) = (repository.clone(), pricing.clone());
    registry.register("orders.expire_order", move |envelope| {
        let cmd: ExpireOrder = envelope.decode().context("decode expire_order")?;
        execute_order(&repo, &*prices, envelope, cmd.order_id, OrderCommand::ExpireOrder(cmd))
    })?;

    registry.register("orders.confirm_order", move |envelope| {
        let cmd: ConfirmOrder = envelope.decode().context("decode confirm_order")?;
        execute_order(
            &repository,
            &*pricing,
            envelope,
            cmd.order_id,
            OrderCommand::ConfirmOrder(cmd),
        )
    })
}

fn execute_assignments<S, Q>(
    repository: &AggregateRepository<S, Q>,
    correlation_id: &str,
    order_id: OrderId,
    command: SeatAssignmentsCommand,
) -> anyhow::Result<()>
where
    S: EventStore,
    Q: MessageQueue,
{
    repository.execute::<SeatAssignments>(
        order_id,
        SEAT_ASSIGNMENTS_AGGREGATE,
        &command,
        &(),
        Some(correlation_id),
        SeatAssignments::empty,
    )?;
    Ok(())
}

/// Seat assignment commands.
pub fn register_seat_assignment_handlers<S, Q>(
    registry: &mut CommandHandlerRegistry,
    repository: Arc<AggregateRepository<S, Q>>,
) -> Result<(), DuplicateHandler>
where
    S: EventStore + 'static,
    Q: MessageQueue + 'static,
{
    let repo = repository.clone();
    registry.register("orders.create_seat_assignments", move |envelope| {
        let cmd: CreateSeatAssignments =
            envelope.decode().context("decode create_seat_assignments")?;
        execute_assignments(
            &repo,
            &envelope.id.to_string(),
            cmd.order_id,
            SeatAssignmentsCommand::CreateSeatAssignments(cmd),
        )
    })?;

    let repo = repository.clone();
    registry.register("orders.assign_seat", move |envelope| {
        let cmd: AssignSeat = envelope.decode().context("decode assign_seat")?;
        execute_assignments(
            &repo,
            &envelope.id.to_string(),
            cmd.order_id,
            SeatAssignmentsCommand::AssignSeat(cmd),
        )
    })?;

    registry.register("orders.unassign_seat", move |envelope| {
        let cmd: UnassignSeat = envelope.decode().context("decode unassign_seat")?;
        execute_assignments(
            &repository,
            &envelope.id.to_string(),
            cmd.order_id,
            SeatAssignmentsCommand::UnassignSeat(cmd),
        )
    })
}

/// When an order confirms, spin up its seat assignments aggregate: one
/// position per purchased seat unit, sharing the order's uuid so lookups need
/// no mapping table.
pub fn register_seat_assignments_creation<S, Q>(
    registry: &mut EventHandlerRegistry,
    repository: Arc<AggregateRepository<S, Q>>,
) where
    S: EventStore + 'static,
    Q: MessageQueue + 'static,
{
    registry.register("orders.order_confirmed", move |envelope| {
        let event: OrderConfirmed = envelope.decode().context("decode order_confirmed")?;

        let order = repository.load(event.order_id, ORDER_AGGREGATE, Order::empty)?;
        let seats = order.seat_assignment_positions()?;

        let command = SeatAssignmentsCommand::CreateSeatAssignments(CreateSeatAssignments {
            order_id: event.order_id,
            seats,
            occurred_at: event.occurred_at,
        });
        execute_assignments(
            &repository,
            &envelope.event_id().to_string(),
            event.order_id,
            command,
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{InMemoryEventStore, InMemorySnapshotStore};
    use chrono::{Duration, Utc};
    use confreg_core::{SeatQuantity, SeatTypeId};
    use confreg_messaging::InMemoryMessageQueue;
    use confreg_orders::CatalogPricingService;
    use uuid::Uuid;

    fn repository() -> Arc<AggregateRepository<Arc<InMemoryEventStore>, Arc<InMemoryMessageQueue>>>
    {
        let store = Arc::new(InMemoryEventStore::new());
        let events = Arc::new(InMemoryMessageQueue::new());
        Arc::new(AggregateRepository::new(store, events))
    }

    #[test]
    fn add_seats_command_round_trips_through_the_registry() {
        let repo = repository();
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let mut registry = CommandHandlerRegistry::new();
        register_availability_handlers(&mut registry, repo.clone(), snapshots).unwrap();

        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();
        let envelope = CommandEnvelope::from_typed(
            Uuid::now_v7(),
            &AddSeats {
                conference_id,
                seat_type,
                quantity: 50,
                occurred_at: Utc::now(),
            },
        )
        .unwrap();

        registry.dispatch(&envelope).unwrap();

        let availability = repo
            .load(conference_id, AVAILABILITY_AGGREGATE, SeatsAvailability::empty)
            .unwrap();
        assert_eq!(availability.remaining_for(seat_type), 50);
    }

    #[test]
    fn place_order_command_round_trips_through_the_registry() {
        let repo = repository();
        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();
        let pricing: Arc<dyn PricingService> =
            Arc::new(CatalogPricingService::new().with_price(conference_id, seat_type, 100));

        let mut registry = CommandHandlerRegistry::new();
        register_order_handlers(&mut registry, repo.clone(), pricing).unwrap();

        let order_id = OrderId::new();
        let envelope = CommandEnvelope::from_typed(
            Uuid::now_v7(),
            &PlaceOrder {
                order_id,
                conference_id,
                seats: vec![SeatQuantity::new(seat_type, 2)],
                reservation_auto_expiration: Utc::now() + Duration::minutes(15),
                occurred_at: Utc::now(),
            },
        )
        .unwrap();

        registry.dispatch(&envelope).unwrap();

        let order = repo.load(order_id, ORDER_AGGREGATE, Order::empty).unwrap();
        assert!(order.is_placed());
    }

    #[test]
    fn confirmed_order_triggers_seat_assignments_creation() {
        let repo = repository();
        let conference_id = ConferenceId::new();
        let seat_type = SeatTypeId::new();
        let pricing: Arc<dyn PricingService> =
            Arc::new(CatalogPricingService::new().with_price(conference_id, seat_type, 100));

        let order_id = OrderId::new();
        let place = OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            conference_id,
            seats: vec![SeatQuantity::new(seat_type, 2)],
            reservation_auto_expiration: Utc::now() + Duration::minutes(15),
            occurred_at: Utc::now(),
        });
        repo.execute::<Order>(order_id, ORDER_AGGREGATE, &place, &*pricing, None, Order::empty)
            .unwrap();
        let confirm = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id,
            occurred_at: Utc::now(),
        });
        let confirmed = repo
            .execute::<Order>(
                order_id,
                ORDER_AGGREGATE,
                &confirm,
                &*pricing,
                None,
                Order::empty,
            )
            .unwrap();

        let mut registry = EventHandlerRegistry::new();
        register_seat_assignments_creation(&mut registry, repo.clone());

        let confirmed_envelope = confirmed
            .iter()
            .find(|e| e.event_type == "orders.order_confirmed")
            .unwrap()
            .to_envelope();
        registry.dispatch(&confirmed_envelope).unwrap();

        let assignments = repo
            .load(order_id, SEAT_ASSIGNMENTS_AGGREGATE, SeatAssignments::empty)
            .unwrap();
        assert_eq!(assignments.position_count(), 2);
    }
}
