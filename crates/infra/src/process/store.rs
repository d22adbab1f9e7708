//! Process state persistence with a command outbox.
//!
//! A process handler mutates state and decides commands in one step, but the
//! state write and the queue send are separate systems. The store closes that
//! gap with an outbox: `save` persists the state together with the undelivered
//! commands, then drains the outbox to the commands queue, removing each
//! command as it is accepted. A crash between the two leaves the commands in
//! the outbox, and the next `save` or `find_*` on that process re-drains them.
//! Commands may therefore be sent twice, never lost; receivers are idempotent.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use confreg_core::{OrderId, ProcessId, ReservationId};
use confreg_messaging::{CommandEnvelope, MessageQueue, OutgoingMessage};

use super::registration::RegistrationProcess;

#[derive(Debug, Error)]
pub enum ProcessStoreError {
    /// Stale process version; reload and retry.
    #[error("process concurrency conflict: {0}")]
    Concurrency(String),

    #[error("process storage error: {0}")]
    Storage(String),

    /// The state was persisted but one or more outbox commands were not
    /// delivered. They remain in the outbox for a later drain.
    #[error("outbox delivery failed: {0}")]
    Send(String),

    #[error("process serialization failed: {0}")]
    Codec(String),
}

/// Durable storage for registration processes.
///
/// Lookups cover the three ways messages address a process: by the order that
/// started it, by the reservation it negotiated, and by its own id (for the
/// self-addressed expiration command).
pub trait ProcessStore: Send + Sync {
    /// Persist the process and drain its pending commands to the commands
    /// queue. Bumps the process version on success.
    fn save(&self, process: &mut RegistrationProcess) -> Result<(), ProcessStoreError>;

    fn find_by_process_id(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError>;

    fn find_by_order_id(
        &self,
        order_id: OrderId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError>;

    fn find_by_reservation_id(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError>;
}

pub(crate) fn outbox_message(envelope: &CommandEnvelope) -> Result<OutgoingMessage, ProcessStoreError> {
    let body = serde_json::to_string(envelope).map_err(|e| ProcessStoreError::Codec(e.to_string()))?;
    let mut message = OutgoingMessage::new(body);
    if let Some(at) = envelope.deliver_after {
        message = message.delivered_after(at);
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        message = message.with_correlation_id(correlation_id.clone());
    }
    Ok(message)
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<ProcessId, JsonValue>,
    versions: HashMap<ProcessId, u64>,
    outbox: HashMap<ProcessId, Vec<CommandEnvelope>>,
}

/// In-memory process store for tests and local development. Mirrors the
/// Postgres implementation's save/drain semantics, including partial outbox
/// delivery.
#[derive(Debug)]
pub struct InMemoryProcessStore<Q> {
    commands_queue: Q,
    inner: Mutex<Inner>,
}

impl<Q> InMemoryProcessStore<Q>
where
    Q: MessageQueue,
{
    pub fn new(commands_queue: Q) -> Self {
        Self {
            commands_queue,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ProcessStoreError> {
        self.inner
            .lock()
            .map_err(|_| ProcessStoreError::Storage("lock poisoned".to_string()))
    }

    /// Send each outbox command in order, shrinking the outbox as deliveries
    /// succeed. A failure leaves the rest queued for the next drain.
    fn drain_outbox(&self, process_id: ProcessId) -> Result<(), ProcessStoreError> {
        loop {
            let next = {
                let inner = self.lock()?;
                inner
                    .outbox
                    .get(&process_id)
                    .and_then(|commands| commands.first().cloned())
            };
            let Some(envelope) = next else {
                let mut inner = self.lock()?;
                inner.outbox.remove(&process_id);
                return Ok(());
            };

            let message = outbox_message(&envelope)?;
            if let Err(err) = self.commands_queue.send(vec![message]) {
                warn!(
                    process_id = %process_id,
                    command_type = %envelope.command_type,
                    error = %err,
                    "outbox delivery failed, command retained for retry"
                );
                return Err(ProcessStoreError::Send(err.to_string()));
            }

            let mut inner = self.lock()?;
            if let Some(commands) = inner.outbox.get_mut(&process_id) {
                commands.retain(|c| c.id != envelope.id);
            }
        }
    }

    fn load(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        // Undelivered commands from an interrupted save go out before the
        // process handles anything new.
        self.drain_outbox(process_id)?;

        let inner = self.lock()?;
        inner
            .rows
            .get(&process_id)
            .map(|row| {
                serde_json::from_value(row.clone())
                    .map_err(|e| ProcessStoreError::Codec(e.to_string()))
            })
            .transpose()
    }

    fn find_process_id(
        &self,
        predicate: impl Fn(&RegistrationProcess) -> bool,
    ) -> Result<Option<ProcessId>, ProcessStoreError> {
        let inner = self.lock()?;
        for row in inner.rows.values() {
            let process: RegistrationProcess = serde_json::from_value(row.clone())
                .map_err(|e| ProcessStoreError::Codec(e.to_string()))?;
            if predicate(&process) {
                return Ok(Some(process.process_id()));
            }
        }
        Ok(None)
    }
}

impl<Q> ProcessStore for InMemoryProcessStore<Q>
where
    Q: MessageQueue,
{
    fn save(&self, process: &mut RegistrationProcess) -> Result<(), ProcessStoreError> {
        let pending = process.take_pending_commands();
        let process_id = process.process_id();

        {
            let mut inner = self.lock()?;
            let current = inner.versions.get(&process_id).copied().unwrap_or(0);
            if process.version != current {
                // Hand the commands back so a reloaded process can redecide.
                process.pending_commands = pending;
                return Err(ProcessStoreError::Concurrency(format!(
                    "expected version {current}, found {} (process {process_id})",
                    process.version
                )));
            }

            process.version += 1;
            let row = serde_json::to_value(&*process)
                .map_err(|e| ProcessStoreError::Codec(e.to_string()))?;
            inner.rows.insert(process_id, row);
            inner.versions.insert(process_id, process.version);
            inner.outbox.entry(process_id).or_default().extend(pending);
        }

        self.drain_outbox(process_id)
    }

    fn find_by_process_id(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        self.load(process_id)
    }

    fn find_by_order_id(
        &self,
        order_id: OrderId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        match self.find_process_id(|p| p.order_id() == Some(order_id))? {
            Some(process_id) => self.load(process_id),
            None => Ok(None),
        }
    }

    fn find_by_reservation_id(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        match self.find_process_id(|p| p.reservation_id() == Some(reservation_id))? {
            Some(process_id) => self.load(process_id),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::registration::RegistrationProcessState;
    use chrono::{Duration, Utc};
    use confreg_core::{ConferenceId, SeatQuantity, SeatTypeId};
    use confreg_messaging::{InMemoryMessageQueue, QueueError, QueuedMessage, ReceiveOutcome};
    use confreg_orders::OrderPlaced;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started_process() -> RegistrationProcess {
        let mut process = RegistrationProcess::new(ProcessId::new());
        process
            .handle_order_placed(&OrderPlaced {
                order_id: OrderId::new(),
                conference_id: ConferenceId::new(),
                seats: vec![SeatQuantity::new(SeatTypeId::new(), 2)],
                reservation_auto_expiration: Utc::now() + Duration::minutes(15),
                occurred_at: Utc::now(),
            })
            .unwrap();
        process
    }

    #[test]
    fn save_persists_state_and_sends_pending_commands() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let store = InMemoryProcessStore::new(queue.clone());

        let mut process = started_process();
        let order_id = process.order_id().unwrap();
        store.save(&mut process).unwrap();

        assert_eq!(process.version(), 1);
        assert_eq!(queue.len(), 2);

        let loaded = store.find_by_order_id(order_id).unwrap().unwrap();
        assert_eq!(
            loaded.state(),
            RegistrationProcessState::AwaitingReservationConfirmation
        );
        assert_eq!(loaded.version(), 1);
    }

    #[test]
    fn stale_save_is_a_concurrency_error_and_keeps_pending_commands() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let store = InMemoryProcessStore::new(queue.clone());

        let mut process = started_process();
        let stale_pending = process.pending_commands.len();
        process.version = 7;

        let err = store.save(&mut process).unwrap_err();
        assert!(matches!(err, ProcessStoreError::Concurrency(_)));
        assert_eq!(process.pending_commands.len(), stale_pending);
        assert!(queue.is_empty());
    }

    #[test]
    fn lookups_by_reservation_and_process_id_agree() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let store = InMemoryProcessStore::new(queue);

        let mut process = started_process();
        store.save(&mut process).unwrap();

        let by_reservation = store
            .find_by_reservation_id(process.reservation_id().unwrap())
            .unwrap()
            .unwrap();
        let by_process = store
            .find_by_process_id(process.process_id())
            .unwrap()
            .unwrap();
        assert_eq!(by_reservation.process_id(), by_process.process_id());
    }

    /// Accepts one send, fails the next `failures`, then accepts again.
    struct FlakyQueue {
        inner: Arc<InMemoryMessageQueue>,
        sends: AtomicUsize,
        fail_from: usize,
        fail_until: usize,
    }

    impl MessageQueue for FlakyQueue {
        fn send(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError> {
            let attempt = self.sends.fetch_add(1, Ordering::SeqCst);
            if attempt >= self.fail_from && attempt < self.fail_until {
                return Err(QueueError::Storage("transient send failure".to_string()));
            }
            self.inner.send(messages)
        }

        fn receive(
            &self,
            subscriber: &dyn Fn(&QueuedMessage) -> anyhow::Result<()>,
        ) -> Result<ReceiveOutcome, QueueError> {
            self.inner.receive(subscriber)
        }
    }

    #[test]
    fn interrupted_outbox_drain_resumes_on_next_lookup() {
        let delivered = Arc::new(InMemoryMessageQueue::new());
        let queue = Arc::new(FlakyQueue {
            inner: delivered.clone(),
            sends: AtomicUsize::new(0),
            fail_from: 1,
            fail_until: 2,
        });
        let store = InMemoryProcessStore::new(queue);

        let mut process = started_process();
        let order_id = process.order_id().unwrap();

        // First command goes out, second fails and stays in the outbox.
        let err = store.save(&mut process).unwrap_err();
        assert!(matches!(err, ProcessStoreError::Send(_)));
        assert_eq!(delivered.len(), 1);

        // State is already persisted; the next lookup drains the remainder.
        let loaded = store.find_by_order_id(order_id).unwrap().unwrap();
        assert_eq!(loaded.version(), 1);
        assert_eq!(delivered.len(), 2);
    }
}
