//! Routing between queued messages and registration process instances.
//!
//! The router owns the lookup-handle-save cycle: find the process a message
//! addresses (creating one for `OrderPlaced`), let it handle the message, and
//! save it, which also flushes its outbox. Routing misses are logged and
//! swallowed; with at-least-once delivery a miss is usually a message that
//! outlived its process.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;
use tracing::{error, info};

use confreg_messaging::{
    CommandEnvelope, CommandHandlerRegistry, DuplicateHandler, EventEnvelope,
    EventHandlerRegistry,
};
use confreg_orders::{OrderConfirmed, OrderPlaced, OrderUpdated};
use confreg_registration::SeatsReserved;

use crate::payments::PaymentCompleted;

use super::registration::{ExpireRegistrationProcess, RegistrationProcess};
use super::store::{ProcessStore, ProcessStoreError};
use confreg_core::ProcessId;

/// Save retries on an optimistic concurrency conflict. Conflicts are rare
/// (two messages for one process racing) and resolve by reload-and-rehandle.
const SAVE_RETRIES: usize = 3;

pub struct RegistrationProcessRouter<S> {
    store: Arc<S>,
}

impl<S> RegistrationProcessRouter<S>
where
    S: ProcessStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Wire the router's handlers into the event and command registries.
    pub fn register(
        self: &Arc<Self>,
        events: &mut EventHandlerRegistry,
        commands: &mut CommandHandlerRegistry,
    ) -> Result<(), DuplicateHandler>
    where
        S: 'static,
    {
        let router = self.clone();
        events.register("orders.order_placed", move |envelope| {
            router.on_order_placed(envelope)
        });

        let router = self.clone();
        events.register("orders.order_updated", move |envelope| {
            router.on_order_updated(envelope)
        });

        let router = self.clone();
        events.register("registration.seats_reserved", move |envelope| {
            router.on_seats_reserved(envelope)
        });

        let router = self.clone();
        events.register("payments.payment_completed", move |envelope| {
            router.on_payment_completed(envelope)
        });

        let router = self.clone();
        events.register("orders.order_confirmed", move |envelope| {
            router.on_order_confirmed(envelope)
        });

        let router = self.clone();
        commands.register("registration_process.expire", move |envelope| {
            router.on_expiration_command(envelope)
        })
    }

    /// Starts a new process, or ignores the event when one already exists for
    /// the order (redelivery).
    pub fn on_order_placed(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        let event: OrderPlaced = envelope.decode().context("decode order_placed")?;

        if self.store.find_by_order_id(event.order_id)?.is_some() {
            info!(order_id = %event.order_id, "process already exists, ignoring order_placed");
            return Ok(());
        }

        let mut process = RegistrationProcess::new(ProcessId::new());
        process.handle_order_placed(&event)?;
        self.store.save(&mut process)?;
        Ok(())
    }

    pub fn on_order_updated(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        let event: OrderUpdated = envelope.decode().context("decode order_updated")?;
        self.with_process(
            |store| store.find_by_order_id(event.order_id),
            |process| process.handle_order_updated(&event).map_err(Into::into),
            "order_updated",
        )
    }

    pub fn on_seats_reserved(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        let event: SeatsReserved = envelope.decode().context("decode seats_reserved")?;
        let correlation_id = envelope.correlation_id().map(str::to_string);
        self.with_process(
            |store| store.find_by_reservation_id(event.reservation_id),
            |process| {
                process
                    .handle_seats_reserved(correlation_id.as_deref(), &event)
                    .map_err(Into::into)
            },
            "seats_reserved",
        )
    }

    pub fn on_payment_completed(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        let event: PaymentCompleted = envelope.decode().context("decode payment_completed")?;
        self.with_process(
            |store| store.find_by_order_id(event.order_id),
            |process| process.handle_payment_completed(&event).map_err(Into::into),
            "payment_completed",
        )
    }

    pub fn on_order_confirmed(&self, envelope: &EventEnvelope<JsonValue>) -> anyhow::Result<()> {
        let event: OrderConfirmed = envelope.decode().context("decode order_confirmed")?;
        self.with_process(
            |store| store.find_by_order_id(event.order_id),
            |process| process.handle_order_confirmed().map_err(Into::into),
            "order_confirmed",
        )
    }

    /// The self-addressed expiration command came due. The envelope id is the
    /// identity the process remembered when it scheduled the command.
    pub fn on_expiration_command(&self, envelope: &CommandEnvelope) -> anyhow::Result<()> {
        let command: ExpireRegistrationProcess =
            envelope.decode().context("decode expire_registration_process")?;
        let command_id = envelope.id;
        self.with_process(
            |store| store.find_by_process_id(command.process_id),
            |process| process.handle_expiration(command_id).map_err(Into::into),
            "expire_registration_process",
        )
    }

    fn with_process(
        &self,
        find: impl Fn(&S) -> Result<Option<RegistrationProcess>, ProcessStoreError>,
        handle: impl Fn(&mut RegistrationProcess) -> anyhow::Result<()>,
        message_kind: &str,
    ) -> anyhow::Result<()> {
        for _ in 0..SAVE_RETRIES {
            let Some(mut process) = find(&self.store)? else {
                error!(message_kind, "no process found for message, dropping");
                return Ok(());
            };

            handle(&mut process)?;

            match self.store.save(&mut process) {
                Ok(()) => return Ok(()),
                Err(ProcessStoreError::Concurrency(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        anyhow::bail!("process save kept conflicting after {SAVE_RETRIES} attempts");
    }
}
