use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use confreg_core::{
    Aggregate, AggregateRoot, ConferenceId, DomainError, ReservationId, SeatQuantity, SeatTypeId,
    Snapshotting,
};
use confreg_messaging::{Command, Event};

/// Aggregate root: SeatsAvailability.
///
/// One instance per conference. Tracks remaining stock per seat type and the
/// pending (not yet committed) reservations held against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatsAvailability {
    id: ConferenceId,
    remaining: HashMap<SeatTypeId, i32>,
    pending: HashMap<ReservationId, Vec<SeatQuantity>>,
    version: u64,
}

impl SeatsAvailability {
    /// Create an empty aggregate instance for rehydration.
    pub fn empty(id: ConferenceId) -> Self {
        Self {
            id,
            remaining: HashMap::new(),
            pending: HashMap::new(),
            version: 0,
        }
    }

    pub fn remaining_for(&self, seat_type: SeatTypeId) -> i32 {
        self.remaining.get(&seat_type).copied().unwrap_or(0)
    }

    pub fn pending_reservation(&self, reservation_id: ReservationId) -> Option<&[SeatQuantity]> {
        self.pending.get(&reservation_id).map(Vec::as_slice)
    }
}

impl AggregateRoot for SeatsAvailability {
    type Id = ConferenceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AddSeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSeats {
    pub conference_id: ConferenceId,
    pub seat_type: SeatTypeId,
    pub quantity: i32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveSeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveSeats {
    pub conference_id: ConferenceId,
    pub seat_type: SeatTypeId,
    pub quantity: i32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MakeReservation.
///
/// Replaces any existing reservation with the same id, reserving as many of
/// the wanted seats as the remaining stock allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeReservation {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    pub seats: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReservation {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CommitReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReservation {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityCommand {
    AddSeats(AddSeats),
    RemoveSeats(RemoveSeats),
    MakeReservation(MakeReservation),
    CancelReservation(CancelReservation),
    CommitReservation(CommitReservation),
}

impl Command for AddSeats {
    fn command_type(&self) -> &'static str {
        "registration.add_seats"
    }
}

impl Command for RemoveSeats {
    fn command_type(&self) -> &'static str {
        "registration.remove_seats"
    }
}

impl Command for MakeReservation {
    fn command_type(&self) -> &'static str {
        "registration.make_seat_reservation"
    }
}

impl Command for CancelReservation {
    fn command_type(&self) -> &'static str {
        "registration.cancel_seat_reservation"
    }
}

impl Command for CommitReservation {
    fn command_type(&self) -> &'static str {
        "registration.commit_seat_reservation"
    }
}

/// Event: AvailableSeatsChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableSeatsChanged {
    pub conference_id: ConferenceId,
    /// Signed stock deltas per seat type.
    pub seats: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SeatsReserved.
///
/// `details` is the full post-command content of the reservation (what the
/// requester actually holds); `availability_changes` is the signed effect on
/// remaining stock. Both lists omit zero lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatsReserved {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    pub details: Vec<SeatQuantity>,
    pub availability_changes: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

impl Event for SeatsReserved {
    fn event_type(&self) -> &'static str {
        "registration.seats_reserved"
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Event: ReservationCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCancelled {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    /// Stock restored by the cancellation (positive quantities).
    pub availability_changes: Vec<SeatQuantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationCommitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCommitted {
    pub conference_id: ConferenceId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

/// Internally tagged so a stored payload deserializes both as the enum (for
/// rehydration) and as the plain variant struct (for envelope consumers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AvailabilityEvent {
    AvailableSeatsChanged(AvailableSeatsChanged),
    SeatsReserved(SeatsReserved),
    ReservationCancelled(ReservationCancelled),
    ReservationCommitted(ReservationCommitted),
}

impl Event for AvailabilityEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AvailabilityEvent::AvailableSeatsChanged(_) => {
                "registration.available_seats_changed"
            }
            AvailabilityEvent::SeatsReserved(_) => "registration.seats_reserved",
            AvailabilityEvent::ReservationCancelled(_) => "registration.reservation_cancelled",
            AvailabilityEvent::ReservationCommitted(_) => "registration.reservation_committed",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AvailabilityEvent::AvailableSeatsChanged(e) => e.occurred_at,
            AvailabilityEvent::SeatsReserved(e) => e.occurred_at,
            AvailabilityEvent::ReservationCancelled(e) => e.occurred_at,
            AvailabilityEvent::ReservationCommitted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SeatsAvailability {
    type Command = AvailabilityCommand;
    type Event = AvailabilityEvent;
    type Services = ();
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AvailabilityEvent::AvailableSeatsChanged(e) => {
                for line in &e.seats {
                    *self.remaining.entry(line.seat_type).or_insert(0) += line.quantity;
                }
            }
            AvailabilityEvent::SeatsReserved(e) => {
                for line in &e.availability_changes {
                    *self.remaining.entry(line.seat_type).or_insert(0) += line.quantity;
                }
                // A reservation shrunk to nothing is gone, not held empty.
                if e.details.is_empty() {
                    self.pending.remove(&e.reservation_id);
                } else {
                    self.pending.insert(e.reservation_id, e.details.clone());
                }
            }
            AvailabilityEvent::ReservationCancelled(e) => {
                for line in &e.availability_changes {
                    *self.remaining.entry(line.seat_type).or_insert(0) += line.quantity;
                }
                self.pending.remove(&e.reservation_id);
            }
            AvailabilityEvent::ReservationCommitted(e) => {
                self.pending.remove(&e.reservation_id);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(
        &self,
        command: &Self::Command,
        _services: &Self::Services,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AvailabilityCommand::AddSeats(cmd) => self.handle_add_seats(cmd),
            AvailabilityCommand::RemoveSeats(cmd) => self.handle_remove_seats(cmd),
            AvailabilityCommand::MakeReservation(cmd) => self.handle_make_reservation(cmd),
            AvailabilityCommand::CancelReservation(cmd) => self.handle_cancel_reservation(cmd),
            AvailabilityCommand::CommitReservation(cmd) => self.handle_commit_reservation(cmd),
        }
    }
}

impl SeatsAvailability {
    fn ensure_conference_id(&self, conference_id: ConferenceId) -> Result<(), DomainError> {
        if self.id != conference_id {
            return Err(DomainError::invariant("conference_id mismatch"));
        }
        Ok(())
    }

    fn handle_add_seats(&self, cmd: &AddSeats) -> Result<Vec<AvailabilityEvent>, DomainError> {
        self.ensure_conference_id(cmd.conference_id)?;
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(vec![AvailabilityEvent::AvailableSeatsChanged(
            AvailableSeatsChanged {
                conference_id: cmd.conference_id,
                seats: vec![SeatQuantity::new(cmd.seat_type, cmd.quantity)],
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_remove_seats(&self, cmd: &RemoveSeats) -> Result<Vec<AvailabilityEvent>, DomainError> {
        self.ensure_conference_id(cmd.conference_id)?;
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(vec![AvailabilityEvent::AvailableSeatsChanged(
            AvailableSeatsChanged {
                conference_id: cmd.conference_id,
                seats: vec![SeatQuantity::new(cmd.seat_type, -cmd.quantity)],
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    /// Reservation semantics: a repeated `MakeReservation` with the same id
    /// **replaces** the previous one. We grant, per seat type,
    /// `min(wanted, max(remaining, 0) + already_held)`, so a caller can always
    /// keep (or shrink) what it already holds even when stock has since gone
    /// negative through `RemoveSeats`.
    fn handle_make_reservation(
        &self,
        cmd: &MakeReservation,
    ) -> Result<Vec<AvailabilityEvent>, DomainError> {
        self.ensure_conference_id(cmd.conference_id)?;

        for line in &cmd.seats {
            if line.quantity < 0 {
                return Err(DomainError::validation("requested quantity cannot be negative"));
            }
            if !self.remaining.contains_key(&line.seat_type) {
                return Err(DomainError::validation(format!(
                    "unknown seat type: {}",
                    line.seat_type
                )));
            }
        }

        let existing: HashMap<SeatTypeId, i32> = self
            .pending
            .get(&cmd.reservation_id)
            .map(|lines| lines.iter().map(|l| (l.seat_type, l.quantity)).collect())
            .unwrap_or_default();

        // Touched types: wanted lines in request order, then previously held
        // types the request no longer mentions (those get released).
        let mut touched: Vec<(SeatTypeId, i32)> =
            cmd.seats.iter().map(|l| (l.seat_type, l.quantity)).collect();
        let wanted_types: Vec<SeatTypeId> = touched.iter().map(|(t, _)| *t).collect();
        for seat_type in existing.keys() {
            if !wanted_types.contains(seat_type) {
                touched.push((*seat_type, 0));
            }
        }

        let mut details = Vec::new();
        let mut availability_changes = Vec::new();
        for (seat_type, wanted) in touched {
            let held = existing.get(&seat_type).copied().unwrap_or(0);
            let remaining = self.remaining_for(seat_type);
            let actual = wanted.min(remaining.max(0) + held);
            let delta = actual - held;

            if actual > 0 {
                details.push(SeatQuantity::new(seat_type, actual));
            }
            if delta != 0 {
                availability_changes.push(SeatQuantity::new(seat_type, -delta));
            }
        }

        Ok(vec![AvailabilityEvent::SeatsReserved(SeatsReserved {
            conference_id: cmd.conference_id,
            reservation_id: cmd.reservation_id,
            details,
            availability_changes,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel_reservation(
        &self,
        cmd: &CancelReservation,
    ) -> Result<Vec<AvailabilityEvent>, DomainError> {
        self.ensure_conference_id(cmd.conference_id)?;

        // Cancelling a reservation we never saw (or one already committed or
        // cancelled) is a no-op, not an error: cancellations race expirations.
        let Some(held) = self.pending.get(&cmd.reservation_id) else {
            return Ok(vec![]);
        };

        Ok(vec![AvailabilityEvent::ReservationCancelled(
            ReservationCancelled {
                conference_id: cmd.conference_id,
                reservation_id: cmd.reservation_id,
                availability_changes: held.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_commit_reservation(
        &self,
        cmd: &CommitReservation,
    ) -> Result<Vec<AvailabilityEvent>, DomainError> {
        self.ensure_conference_id(cmd.conference_id)?;

        if !self.pending.contains_key(&cmd.reservation_id) {
            return Ok(vec![]);
        }

        // Committing drops the pending hold without restoring stock.
        Ok(vec![AvailabilityEvent::ReservationCommitted(
            ReservationCommitted {
                conference_id: cmd.conference_id,
                reservation_id: cmd.reservation_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

/// Pending reservation line in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReservation {
    pub reservation_id: ReservationId,
    pub seats: Vec<SeatQuantity>,
}

/// Snapshot of a [`SeatsAvailability`] instance's private state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityMemento {
    pub remaining: Vec<SeatQuantity>,
    pub pending: Vec<PendingReservation>,
}

impl Snapshotting for SeatsAvailability {
    type Memento = AvailabilityMemento;

    fn to_memento(&self) -> Self::Memento {
        AvailabilityMemento {
            remaining: self
                .remaining
                .iter()
                .map(|(seat_type, quantity)| SeatQuantity::new(*seat_type, *quantity))
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|(reservation_id, seats)| PendingReservation {
                    reservation_id: *reservation_id,
                    seats: seats.clone(),
                })
                .collect(),
        }
    }

    fn from_memento(id: Self::Id, version: u64, memento: Self::Memento) -> Self {
        Self {
            id,
            remaining: memento
                .remaining
                .into_iter()
                .map(|line| (line.seat_type, line.quantity))
                .collect(),
            pending: memento
                .pending
                .into_iter()
                .map(|entry| (entry.reservation_id, entry.seats))
                .collect(),
            version,
        }
    }
}
