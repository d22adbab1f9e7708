//! Registration process manager.
//!
//! Coordinates one order through seat reservation, payment, and confirmation
//! by reacting to events and issuing commands. The process holds no business
//! rules of its own; it only remembers where the workflow stands and which
//! outstanding command it is waiting on.
//!
//! Correlation discipline: every reservation request gets a fresh command id,
//! remembered as the outstanding id. A `SeatsReserved` response is accepted
//! only when its correlation id matches; anything else is a stale answer to a
//! superseded request and is ignored. The scheduled expiration command is
//! guarded the same way by its own remembered id.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use confreg_core::{ConferenceId, OrderId, ProcessId, ReservationId, SeatQuantity};
use confreg_messaging::{Command, CommandEnvelope};
use confreg_orders::{ConfirmOrder, ExpireOrder, MarkAsReserved, OrderPlaced, OrderUpdated};
use confreg_registration::{CancelReservation, CommitReservation, MakeReservation, SeatsReserved};

use crate::payments::PaymentCompleted;

/// Grace added to the reservation TTL so a payment finishing right at the
/// deadline still finds the reservation alive.
const RESERVATION_TTL_BUFFER: i64 = 1;

/// Delay between the registration window closing and the process force-expiring
/// the order, leaving room for an in-flight payment confirmation to land.
const EXPIRATION_DELAY_BUFFER: i64 = 14;

/// Self-addressed command that fires when the registration window has long
/// passed without payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireRegistrationProcess {
    pub process_id: ProcessId,
    pub occurred_at: DateTime<Utc>,
}

impl Command for ExpireRegistrationProcess {
    fn command_type(&self) -> &'static str {
        "registration_process.expire"
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The event cannot be handled in the current state. Deterministic; never
    /// retried.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("command serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationProcessState {
    NotStarted,
    AwaitingReservationConfirmation,
    ReservationConfirmationReceived,
    PaymentConfirmationReceived,
}

/// One process instance per order.
///
/// Commands issued by a handler accumulate in `pending_commands` and are
/// drained by the process store, which persists state and sends them in one
/// logical step (outbox).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationProcess {
    pub(crate) process_id: ProcessId,
    pub(crate) state: RegistrationProcessState,
    pub(crate) completed: bool,

    pub(crate) order_id: Option<OrderId>,
    pub(crate) conference_id: Option<ConferenceId>,
    pub(crate) reservation_id: Option<ReservationId>,

    /// Outstanding reservation request; only a response correlated to this id
    /// is accepted.
    pub(crate) seat_reservation_command_id: Option<Uuid>,
    /// Scheduled expiration command; cleared once the order confirms.
    pub(crate) expiration_command_id: Option<Uuid>,

    pub(crate) reservation_auto_expiration: Option<DateTime<Utc>>,

    pub(crate) version: u64,

    #[serde(skip)]
    pub(crate) pending_commands: Vec<CommandEnvelope>,
}

impl RegistrationProcess {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            state: RegistrationProcessState::NotStarted,
            completed: false,
            order_id: None,
            conference_id: None,
            reservation_id: None,
            seat_reservation_command_id: None,
            expiration_command_id: None,
            reservation_auto_expiration: None,
            version: 0,
            pending_commands: Vec::new(),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> RegistrationProcessState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
    }

    pub fn reservation_id(&self) -> Option<ReservationId> {
        self.reservation_id
    }

    pub fn expiration_command_id(&self) -> Option<Uuid> {
        self.expiration_command_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Drain the commands decided by the handlers since the last save.
    pub fn take_pending_commands(&mut self) -> Vec<CommandEnvelope> {
        std::mem::take(&mut self.pending_commands)
    }

    /// Starts the workflow. Requests a seat reservation and schedules the
    /// eventual expiration; an order placed after its own registration window
    /// is rejected outright.
    pub fn handle_order_placed(&mut self, event: &OrderPlaced) -> Result<(), ProcessError> {
        if self.state != RegistrationProcessState::NotStarted {
            return Err(ProcessError::InvalidStateTransition(format!(
                "OrderPlaced in state {:?} (process {})",
                self.state, self.process_id
            )));
        }

        self.order_id = Some(event.order_id);
        self.conference_id = Some(event.conference_id);
        // The reservation id reuses the order uuid so the inventory side can
        // be correlated back to the order without a lookup.
        self.reservation_id = Some(ReservationId::from_uuid(*event.order_id.as_uuid()));
        self.reservation_auto_expiration = Some(event.reservation_auto_expiration);

        let now = Utc::now();
        if event.reservation_auto_expiration <= now {
            info!(
                process_id = %self.process_id,
                order_id = %event.order_id,
                "order placed after its registration window, rejecting"
            );
            self.push_command(CommandEnvelope::from_typed(
                Uuid::now_v7(),
                &ExpireOrder {
                    order_id: event.order_id,
                    occurred_at: now,
                },
            )?);
            self.completed = true;
            return Ok(());
        }

        self.request_reservation(event.conference_id, event.seats.clone(), event.reservation_auto_expiration)?;

        let expire = ExpireRegistrationProcess {
            process_id: self.process_id,
            occurred_at: now,
        };
        let mut envelope = CommandEnvelope::from_typed(Uuid::now_v7(), &expire)?;
        envelope.deliver_after =
            Some(event.reservation_auto_expiration + Duration::minutes(EXPIRATION_DELAY_BUFFER));
        self.expiration_command_id = Some(envelope.id);
        self.push_command(envelope);

        self.state = RegistrationProcessState::AwaitingReservationConfirmation;
        Ok(())
    }

    /// The registrant changed seats before paying: supersede the outstanding
    /// reservation request with a fresh one.
    pub fn handle_order_updated(&mut self, event: &OrderUpdated) -> Result<(), ProcessError> {
        match self.state {
            RegistrationProcessState::AwaitingReservationConfirmation
            | RegistrationProcessState::ReservationConfirmationReceived => {
                let conference_id = self.conference_id.ok_or_else(|| {
                    ProcessError::InvalidStateTransition("OrderUpdated before OrderPlaced".into())
                })?;
                let expiration = self.reservation_auto_expiration.ok_or_else(|| {
                    ProcessError::InvalidStateTransition("OrderUpdated before OrderPlaced".into())
                })?;
                self.request_reservation(conference_id, event.seats.clone(), expiration)?;
                self.state = RegistrationProcessState::AwaitingReservationConfirmation;
                Ok(())
            }
            state => Err(ProcessError::InvalidStateTransition(format!(
                "OrderUpdated in state {state:?} (process {})",
                self.process_id
            ))),
        }
    }

    /// Inventory answered a reservation request. Accepted only when it
    /// answers the *outstanding* request.
    pub fn handle_seats_reserved(
        &mut self,
        correlation_id: Option<&str>,
        event: &SeatsReserved,
    ) -> Result<(), ProcessError> {
        let outstanding = self.seat_reservation_command_id.map(|id| id.to_string());
        let matches = match (&outstanding, correlation_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        };

        match self.state {
            RegistrationProcessState::AwaitingReservationConfirmation if matches => {
                let order_id = self.order_id.ok_or_else(|| {
                    ProcessError::InvalidStateTransition("SeatsReserved before OrderPlaced".into())
                })?;
                let expiration = self.reservation_auto_expiration.ok_or_else(|| {
                    ProcessError::InvalidStateTransition("SeatsReserved before OrderPlaced".into())
                })?;
                self.push_command(CommandEnvelope::from_typed(
                    Uuid::now_v7(),
                    &MarkAsReserved {
                        order_id,
                        reserved_seats: event.details.clone(),
                        expiration,
                        occurred_at: Utc::now(),
                    },
                )?);
                self.state = RegistrationProcessState::ReservationConfirmationReceived;
                Ok(())
            }
            RegistrationProcessState::AwaitingReservationConfirmation => {
                warn!(
                    process_id = %self.process_id,
                    correlation_id = correlation_id.unwrap_or("<none>"),
                    "ignoring seats_reserved for a superseded reservation request"
                );
                Ok(())
            }
            _ if matches => {
                info!(
                    process_id = %self.process_id,
                    "ignoring duplicate seats_reserved"
                );
                Ok(())
            }
            state => Err(ProcessError::InvalidStateTransition(format!(
                "SeatsReserved in state {state:?} (process {})",
                self.process_id
            ))),
        }
    }

    /// Payment cleared: confirm the order.
    pub fn handle_payment_completed(
        &mut self,
        _event: &PaymentCompleted,
    ) -> Result<(), ProcessError> {
        match self.state {
            RegistrationProcessState::ReservationConfirmationReceived => {
                let order_id = self.order_id.ok_or_else(|| {
                    ProcessError::InvalidStateTransition(
                        "PaymentCompleted before OrderPlaced".into(),
                    )
                })?;
                self.push_command(CommandEnvelope::from_typed(
                    Uuid::now_v7(),
                    &ConfirmOrder {
                        order_id,
                        occurred_at: Utc::now(),
                    },
                )?);
                self.state = RegistrationProcessState::PaymentConfirmationReceived;
                Ok(())
            }
            state => Err(ProcessError::InvalidStateTransition(format!(
                "PaymentCompleted in state {state:?} (process {})",
                self.process_id
            ))),
        }
    }

    /// The order confirmed: commit the reservation permanently and finish.
    /// The scheduled expiration becomes moot and its id is forgotten, so a
    /// late delivery of it no-ops.
    pub fn handle_order_confirmed(&mut self) -> Result<(), ProcessError> {
        if self.completed {
            return Err(ProcessError::InvalidStateTransition(format!(
                "OrderConfirmed on a completed process ({})",
                self.process_id
            )));
        }
        match self.state {
            RegistrationProcessState::ReservationConfirmationReceived
            | RegistrationProcessState::PaymentConfirmationReceived => {
                let conference_id = self.conference_id.ok_or_else(|| {
                    ProcessError::InvalidStateTransition(
                        "OrderConfirmed before OrderPlaced".into(),
                    )
                })?;
                let reservation_id = self.reservation_id.ok_or_else(|| {
                    ProcessError::InvalidStateTransition(
                        "OrderConfirmed before OrderPlaced".into(),
                    )
                })?;
                self.push_command(CommandEnvelope::from_typed(
                    Uuid::now_v7(),
                    &CommitReservation {
                        conference_id,
                        reservation_id,
                        occurred_at: Utc::now(),
                    },
                )?);
                self.expiration_command_id = None;
                self.completed = true;
                Ok(())
            }
            state => Err(ProcessError::InvalidStateTransition(format!(
                "OrderConfirmed in state {state:?} (process {})",
                self.process_id
            ))),
        }
    }

    /// The scheduled expiration fired. Only honored while it is still the
    /// live expiration for this process; a completed process or a superseded
    /// command id makes this a silent no-op.
    pub fn handle_expiration(&mut self, command_id: Uuid) -> Result<(), ProcessError> {
        if self.completed || self.expiration_command_id != Some(command_id) {
            return Ok(());
        }

        let order_id = self.order_id.ok_or_else(|| {
            ProcessError::InvalidStateTransition("expiration before OrderPlaced".into())
        })?;
        let conference_id = self.conference_id.ok_or_else(|| {
            ProcessError::InvalidStateTransition("expiration before OrderPlaced".into())
        })?;
        let reservation_id = self.reservation_id.ok_or_else(|| {
            ProcessError::InvalidStateTransition("expiration before OrderPlaced".into())
        })?;

        let now = Utc::now();
        self.push_command(CommandEnvelope::from_typed(
            Uuid::now_v7(),
            &ExpireOrder {
                order_id,
                occurred_at: now,
            },
        )?);
        self.push_command(CommandEnvelope::from_typed(
            Uuid::now_v7(),
            &CancelReservation {
                conference_id,
                reservation_id,
                occurred_at: now,
            },
        )?);

        self.expiration_command_id = None;
        self.completed = true;
        Ok(())
    }

    fn request_reservation(
        &mut self,
        conference_id: ConferenceId,
        seats: Vec<SeatQuantity>,
        auto_expiration: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        let reservation_id = self.reservation_id.ok_or_else(|| {
            ProcessError::InvalidStateTransition("reservation requested before OrderPlaced".into())
        })?;

        let command = MakeReservation {
            conference_id,
            reservation_id,
            seats,
            occurred_at: Utc::now(),
        };
        let mut envelope = CommandEnvelope::from_typed(Uuid::now_v7(), &command)?;
        // Past the window plus grace the reservation is pointless; let the
        // dispatcher drop it instead of reserving seats nobody can pay for.
        envelope.expires_at = Some(auto_expiration + Duration::minutes(RESERVATION_TTL_BUFFER));
        self.seat_reservation_command_id = Some(envelope.id);
        self.push_command(envelope);
        Ok(())
    }

    fn push_command(&mut self, envelope: CommandEnvelope) {
        self.pending_commands.push(envelope);
    }
}
