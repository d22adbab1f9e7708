use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use confreg_core::{Aggregate, AggregateRoot, DomainError, OrderId, SeatTypeId};
use confreg_messaging::{Command, Event};

/// The person a seat is assigned to. Matched by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    seat_type: SeatTypeId,
    attendee: Option<Attendee>,
}

/// Aggregate root: SeatAssignments.
///
/// One instance per confirmed order, identified by the order's id (the two
/// aggregates live in different streams, so the shared UUID never collides).
/// Each purchased seat unit becomes one assignable position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatAssignments {
    id: OrderId,
    positions: Vec<Position>,
    created: bool,
    version: u64,
}

impl SeatAssignments {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            positions: Vec::new(),
            created: false,
            version: 0,
        }
    }

    pub fn attendee_at(&self, position: usize) -> Option<&Attendee> {
        self.positions.get(position)?.attendee.as_ref()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}

impl AggregateRoot for SeatAssignments {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateSeatAssignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSeatAssignments {
    pub order_id: OrderId,
    /// One entry per seat unit, pre-expanded from the order's quantities.
    pub seats: Vec<SeatTypeId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignSeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignSeat {
    pub order_id: OrderId,
    pub position: usize,
    pub attendee: Attendee,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UnassignSeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignSeat {
    pub order_id: OrderId,
    pub position: usize,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatAssignmentsCommand {
    CreateSeatAssignments(CreateSeatAssignments),
    AssignSeat(AssignSeat),
    UnassignSeat(UnassignSeat),
}

impl Command for CreateSeatAssignments {
    fn command_type(&self) -> &'static str {
        "orders.create_seat_assignments"
    }
}

impl Command for AssignSeat {
    fn command_type(&self) -> &'static str {
        "orders.assign_seat"
    }
}

impl Command for UnassignSeat {
    fn command_type(&self) -> &'static str {
        "orders.unassign_seat"
    }
}

/// Event: SeatAssignmentsCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAssignmentsCreated {
    pub order_id: OrderId,
    pub seats: Vec<SeatTypeId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SeatAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAssigned {
    pub order_id: OrderId,
    pub position: usize,
    pub seat_type: SeatTypeId,
    pub attendee: Attendee,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SeatUnassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatUnassigned {
    pub order_id: OrderId,
    pub position: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SeatAssignmentUpdated.
///
/// Same attendee (matched by email), refreshed details. Downstream consumers
/// that notify attendees treat this as a lighter-weight change than a
/// reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAssignmentUpdated {
    pub order_id: OrderId,
    pub position: usize,
    pub attendee: Attendee,
    pub occurred_at: DateTime<Utc>,
}

/// Internally tagged so a stored payload deserializes both as the enum (for
/// rehydration) and as the plain variant struct (for envelope consumers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SeatAssignmentsEvent {
    SeatAssignmentsCreated(SeatAssignmentsCreated),
    SeatAssigned(SeatAssigned),
    SeatUnassigned(SeatUnassigned),
    SeatAssignmentUpdated(SeatAssignmentUpdated),
}

impl Event for SeatAssignmentsEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SeatAssignmentsEvent::SeatAssignmentsCreated(_) => "orders.seat_assignments_created",
            SeatAssignmentsEvent::SeatAssigned(_) => "orders.seat_assigned",
            SeatAssignmentsEvent::SeatUnassigned(_) => "orders.seat_unassigned",
            SeatAssignmentsEvent::SeatAssignmentUpdated(_) => "orders.seat_assignment_updated",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SeatAssignmentsEvent::SeatAssignmentsCreated(e) => e.occurred_at,
            SeatAssignmentsEvent::SeatAssigned(e) => e.occurred_at,
            SeatAssignmentsEvent::SeatUnassigned(e) => e.occurred_at,
            SeatAssignmentsEvent::SeatAssignmentUpdated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SeatAssignments {
    type Command = SeatAssignmentsCommand;
    type Event = SeatAssignmentsEvent;
    type Services = ();
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SeatAssignmentsEvent::SeatAssignmentsCreated(e) => {
                self.id = e.order_id;
                self.positions = e
                    .seats
                    .iter()
                    .map(|seat_type| Position {
                        seat_type: *seat_type,
                        attendee: None,
                    })
                    .collect();
                self.created = true;
            }
            SeatAssignmentsEvent::SeatAssigned(e) => {
                if let Some(slot) = self.positions.get_mut(e.position) {
                    slot.attendee = Some(e.attendee.clone());
                }
            }
            SeatAssignmentsEvent::SeatUnassigned(e) => {
                if let Some(slot) = self.positions.get_mut(e.position) {
                    slot.attendee = None;
                }
            }
            SeatAssignmentsEvent::SeatAssignmentUpdated(e) => {
                if let Some(slot) = self.positions.get_mut(e.position) {
                    slot.attendee = Some(e.attendee.clone());
                }
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
            SeatAssignmentsCommand::CreateSeatAssignments(cmd) => self.handle_create(cmd),
            SeatAssignmentsCommand::AssignSeat(cmd) => self.handle_assign(cmd),
            SeatAssignmentsCommand::UnassignSeat(cmd) => self.handle_unassign(cmd),
        }
    }
}

impl SeatAssignments {
    fn position(&self, index: usize) -> Result<&Position, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.positions
            .get(index)
            .ok_or_else(|| DomainError::validation(format!("no seat at position {index}")))
    }

    fn handle_create(
        &self,
        cmd: &CreateSeatAssignments,
    ) -> Result<Vec<SeatAssignmentsEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("seat assignments already created"));
        }
        if cmd.seats.is_empty() {
            return Err(DomainError::validation("cannot create zero seat positions"));
        }
        Ok(vec![SeatAssignmentsEvent::SeatAssignmentsCreated(
            SeatAssignmentsCreated {
                order_id: cmd.order_id,
                seats: cmd.seats.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_assign(&self, cmd: &AssignSeat) -> Result<Vec<SeatAssignmentsEvent>, DomainError> {
        let slot = self.position(cmd.position)?;
        if cmd.attendee.email.trim().is_empty() {
            return Err(DomainError::validation("attendee email cannot be empty"));
        }

        let assigned = SeatAssignmentsEvent::SeatAssigned(SeatAssigned {
            order_id: self.id,
            position: cmd.position,
            seat_type: slot.seat_type,
            attendee: cmd.attendee.clone(),
            occurred_at: cmd.occurred_at,
        });

        match &slot.attendee {
            None => Ok(vec![assigned]),
            Some(current) if current.email == cmd.attendee.email => Ok(vec![
                SeatAssignmentsEvent::SeatAssignmentUpdated(SeatAssignmentUpdated {
                    order_id: self.id,
                    position: cmd.position,
                    attendee: cmd.attendee.clone(),
                    occurred_at: cmd.occurred_at,
                }),
            ]),
            Some(_) => Ok(vec![
                SeatAssignmentsEvent::SeatUnassigned(SeatUnassigned {
                    order_id: self.id,
                    position: cmd.position,
                    occurred_at: cmd.occurred_at,
                }),
                assigned,
            ]),
        }
    }

    fn handle_unassign(
        &self,
        cmd: &UnassignSeat,
    ) -> Result<Vec<SeatAssignmentsEvent>, DomainError> {
        let slot = self.position(cmd.position)?;
        if slot.attendee.is_none() {
            return Err(DomainError::validation(format!(
                "seat at position {} is not assigned",
                cmd.position
            )));
        }
        Ok(vec![SeatAssignmentsEvent::SeatUnassigned(SeatUnassigned {
            order_id: self.id,
            position: cmd.position,
            occurred_at: cmd.occurred_at,
        })])
    }
}
