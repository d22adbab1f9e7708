//! End-to-end wiring tests over the in-memory backends: two queues, two
//! processors, the three aggregates, and the registration process manager.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use confreg_core::{AggregateId, ConferenceId, OrderId, SeatQuantity, SeatTypeId};
use confreg_messaging::{
    Command, CommandEnvelope, CommandHandlerRegistry, EventEnvelope, EventHandlerRegistry,
    InMemoryMessageQueue, MessageQueue, OutgoingMessage, ReceiveOutcome,
};
use confreg_orders::{
    AssignSeat, Attendee, CatalogPricingService, Order, PlaceOrder, PricingService,
    SeatAssignments,
};
use confreg_registration::{AddSeats, SeatsAvailability};

use crate::event_store::{InMemoryEventStore, InMemorySnapshotStore};
use crate::handlers::{
    AVAILABILITY_AGGREGATE, ORDER_AGGREGATE, SEAT_ASSIGNMENTS_AGGREGATE,
    register_availability_handlers, register_order_handlers, register_seat_assignment_handlers,
    register_seat_assignments_creation,
};
use crate::payments::PaymentCompleted;
use crate::process::registration::ExpireRegistrationProcess;
use crate::process::router::RegistrationProcessRouter;
use crate::process::store::{InMemoryProcessStore, ProcessStore};
use crate::processor::MessageProcessor;
use crate::repository::AggregateRepository;

type Queue = Arc<InMemoryMessageQueue>;
type Repo = Arc<AggregateRepository<Arc<InMemoryEventStore>, Queue>>;

struct Harness {
    commands: Queue,
    events: Queue,
    repo: Repo,
    process_store: Arc<InMemoryProcessStore<Queue>>,
    command_processor: MessageProcessor<Queue, CommandHandlerRegistry>,
    event_processor: MessageProcessor<Queue, EventHandlerRegistry>,
}

fn harness(pricing: CatalogPricingService) -> Harness {
    let commands: Queue = Arc::new(InMemoryMessageQueue::new());
    let events: Queue = Arc::new(InMemoryMessageQueue::new());

    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let repo: Repo = Arc::new(AggregateRepository::new(store, events.clone()));

    let process_store = Arc::new(InMemoryProcessStore::new(commands.clone()));
    let router = Arc::new(RegistrationProcessRouter::new(process_store.clone()));

    let pricing: Arc<dyn PricingService> = Arc::new(pricing);

    let mut command_registry = CommandHandlerRegistry::new();
    let mut event_registry = EventHandlerRegistry::new();

    register_availability_handlers(&mut command_registry, repo.clone(), snapshots).unwrap();
    register_order_handlers(&mut command_registry, repo.clone(), pricing).unwrap();
    register_seat_assignment_handlers(&mut command_registry, repo.clone()).unwrap();
    register_seat_assignments_creation(&mut event_registry, repo.clone());
    router.register(&mut event_registry, &mut command_registry).unwrap();

    Harness {
        command_processor: MessageProcessor::new(commands.clone(), command_registry),
        event_processor: MessageProcessor::new(events.clone(), event_registry),
        commands,
        events,
        repo,
        process_store,
    }
}

impl Harness {
    /// Alternate both processors until neither has an eligible message left.
    fn pump(&self) {
        loop {
            let c = self.command_processor.run_once().unwrap();
            let e = self.event_processor.run_once().unwrap();
            if c == ReceiveOutcome::Empty && e == ReceiveOutcome::Empty {
                break;
            }
        }
    }

    fn send_command<C: Command + Serialize>(&self, command: &C) {
        let envelope = CommandEnvelope::from_typed(Uuid::now_v7(), command).unwrap();
        self.send_command_envelope(&envelope);
    }

    fn send_command_envelope(&self, envelope: &CommandEnvelope) {
        let body = serde_json::to_string(envelope).unwrap();
        self.commands.send(vec![OutgoingMessage::new(body)]).unwrap();
    }

    fn publish_payment_completed(&self, order_id: OrderId) {
        let event = PaymentCompleted {
            order_id,
            occurred_at: Utc::now(),
        };
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            AggregateId::from_uuid(*order_id.as_uuid()),
            "payments.payment",
            "payments.payment_completed",
            1,
            None,
            serde_json::to_value(&event).unwrap(),
        );
        let body = serde_json::to_string(&envelope).unwrap();
        self.events.send(vec![OutgoingMessage::new(body)]).unwrap();
    }

    fn availability(&self, conference_id: ConferenceId) -> SeatsAvailability {
        self.repo
            .load(conference_id, AVAILABILITY_AGGREGATE, SeatsAvailability::empty)
            .unwrap()
    }

    fn order(&self, order_id: OrderId) -> Order {
        self.repo.load(order_id, ORDER_AGGREGATE, Order::empty).unwrap()
    }
}

fn add_seats(conference_id: ConferenceId, seat_type: SeatTypeId, quantity: i32) -> AddSeats {
    AddSeats {
        conference_id,
        seat_type,
        quantity,
        occurred_at: Utc::now(),
    }
}

fn place_order(
    order_id: OrderId,
    conference_id: ConferenceId,
    seat_type: SeatTypeId,
    quantity: i32,
) -> PlaceOrder {
    PlaceOrder {
        order_id,
        conference_id,
        seats: vec![SeatQuantity::new(seat_type, quantity)],
        reservation_auto_expiration: Utc::now() + Duration::minutes(15),
        occurred_at: Utc::now(),
    }
}

#[test]
fn full_registration_reaches_confirmation_and_seat_assignments() {
    let conference_id = ConferenceId::new();
    let seat_type = SeatTypeId::new();
    let h = harness(CatalogPricingService::new().with_price(conference_id, seat_type, 250));

    h.send_command(&add_seats(conference_id, seat_type, 100));
    h.pump();

    let order_id = OrderId::new();
    h.send_command(&place_order(order_id, conference_id, seat_type, 3));
    h.pump();

    // Reservation round trip done: seats held, order marked reserved.
    let availability = h.availability(conference_id);
    assert_eq!(availability.remaining_for(seat_type), 97);
    let process = h.process_store.find_by_order_id(order_id).unwrap().unwrap();
    assert!(!process.is_completed());

    h.publish_payment_completed(order_id);
    h.pump();

    let order = h.order(order_id);
    assert!(order.is_confirmed());
    assert_eq!(order.total(), Some(750));

    // Commit removed the pending hold without restocking.
    let availability = h.availability(conference_id);
    assert_eq!(availability.remaining_for(seat_type), 97);
    assert!(
        availability
            .pending_reservation(process.reservation_id().unwrap())
            .is_none()
    );

    let assignments = h
        .repo
        .load(order_id, SEAT_ASSIGNMENTS_AGGREGATE, SeatAssignments::empty)
        .unwrap();
    assert_eq!(assignments.position_count(), 3);

    let process = h.process_store.find_by_order_id(order_id).unwrap().unwrap();
    assert!(process.is_completed());
    assert!(process.expiration_command_id().is_none());

    // The registrant can now put a name on a seat.
    h.send_command(&AssignSeat {
        order_id,
        position: 0,
        attendee: Attendee {
            email: "ada@example.org".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        },
        occurred_at: Utc::now(),
    });
    h.pump();

    let assignments = h
        .repo
        .load(order_id, SEAT_ASSIGNMENTS_AGGREGATE, SeatAssignments::empty)
        .unwrap();
    assert_eq!(
        assignments.attendee_at(0).map(|a| a.email.as_str()),
        Some("ada@example.org")
    );
}

#[test]
fn unpaid_order_expires_and_releases_its_seats() {
    let conference_id = ConferenceId::new();
    let seat_type = SeatTypeId::new();
    let h = harness(CatalogPricingService::new().with_price(conference_id, seat_type, 100));

    h.send_command(&add_seats(conference_id, seat_type, 10));
    h.pump();

    let order_id = OrderId::new();
    h.send_command(&place_order(order_id, conference_id, seat_type, 4));
    h.pump();

    assert_eq!(h.availability(conference_id).remaining_for(seat_type), 6);

    // The real expiration command sits in the queue with a future delivery
    // time; fire an equivalent one now, carrying the id the process expects.
    let process = h.process_store.find_by_order_id(order_id).unwrap().unwrap();
    let expiration_id = process.expiration_command_id().unwrap();
    let command = ExpireRegistrationProcess {
        process_id: process.process_id(),
        occurred_at: Utc::now(),
    };
    h.send_command_envelope(&CommandEnvelope::from_typed(expiration_id, &command).unwrap());
    h.pump();

    let order = h.order(order_id);
    assert!(!order.is_confirmed());

    // Cancellation restocked the held seats.
    let availability = h.availability(conference_id);
    assert_eq!(availability.remaining_for(seat_type), 10);
    assert!(
        availability
            .pending_reservation(process.reservation_id().unwrap())
            .is_none()
    );

    let process = h.process_store.find_by_order_id(order_id).unwrap().unwrap();
    assert!(process.is_completed());
}

#[test]
fn contended_inventory_grants_a_partial_reservation() {
    let conference_id = ConferenceId::new();
    let seat_type = SeatTypeId::new();
    let h = harness(CatalogPricingService::new().with_price(conference_id, seat_type, 100));

    h.send_command(&add_seats(conference_id, seat_type, 6));
    h.pump();

    let first = OrderId::new();
    h.send_command(&place_order(first, conference_id, seat_type, 5));
    h.pump();

    let second = OrderId::new();
    h.send_command(&place_order(second, conference_id, seat_type, 5));
    h.pump();

    // First got everything, second only the leftover seat.
    let availability = h.availability(conference_id);
    assert_eq!(availability.remaining_for(seat_type), 0);

    let first_process = h.process_store.find_by_order_id(first).unwrap().unwrap();
    let second_process = h.process_store.find_by_order_id(second).unwrap().unwrap();
    let first_held: i32 = availability
        .pending_reservation(first_process.reservation_id().unwrap())
        .unwrap()
        .iter()
        .map(|s| s.quantity)
        .sum();
    let second_held: i32 = availability
        .pending_reservation(second_process.reservation_id().unwrap())
        .unwrap()
        .iter()
        .map(|s| s.quantity)
        .sum();
    assert_eq!(first_held, 5);
    assert_eq!(second_held, 1);
}

#[test]
fn malformed_message_is_dropped_and_processing_continues() {
    let conference_id = ConferenceId::new();
    let seat_type = SeatTypeId::new();
    let h = harness(CatalogPricingService::new());

    h.commands
        .send(vec![OutgoingMessage::new("this is not an envelope")])
        .unwrap();
    h.send_command(&add_seats(conference_id, seat_type, 5));
    h.pump();

    assert!(h.commands.is_empty());
    assert_eq!(h.availability(conference_id).remaining_for(seat_type), 5);
}
