//! Postgres-backed process store.
//!
//! State row and outbox rows are written in one transaction; the outbox is
//! drained to the commands queue afterwards, deleting each row once the queue
//! accepts it. A crash between commit and drain leaves the commands in the
//! outbox table, and the next save or lookup on the process re-drains them.
//!
//! The drain loop is deliberately synchronous: `MessageQueue::send` bridges
//! into the runtime itself, so it must never be called from inside another
//! `block_on`.
//!
//! Expected schema (see `migrations/`):
//!
//! ```sql
//! CREATE TABLE registration_processes (
//!     process_id     UUID PRIMARY KEY,
//!     order_id       UUID,
//!     reservation_id UUID,
//!     version        BIGINT NOT NULL,
//!     state          JSONB NOT NULL
//! );
//!
//! CREATE TABLE process_outbox (
//!     id         BIGSERIAL PRIMARY KEY,
//!     process_id UUID NOT NULL,
//!     envelope   JSONB NOT NULL
//! );
//! ```

use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{instrument, warn};

use confreg_core::{OrderId, ProcessId, ReservationId};
use confreg_messaging::{CommandEnvelope, MessageQueue};

use super::registration::RegistrationProcess;
use super::store::{ProcessStore, ProcessStoreError, outbox_message};

#[derive(Debug, Clone)]
pub struct PostgresProcessStore<Q> {
    pool: Arc<PgPool>,
    commands_queue: Q,
}

impl<Q> PostgresProcessStore<Q>
where
    Q: MessageQueue,
{
    pub fn new(pool: PgPool, commands_queue: Q) -> Self {
        Self {
            pool: Arc::new(pool),
            commands_queue,
        }
    }

    #[instrument(skip(self, process), fields(process_id = %process.process_id()), err)]
    async fn save_state_async(
        &self,
        process: &mut RegistrationProcess,
        pending: &[CommandEnvelope],
    ) -> Result<(), ProcessStoreError> {
        let process_id = process.process_id();
        let expected = process.version();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ProcessStoreError::Storage(format!("begin save: {e}")))?;

        process.version += 1;
        let state = serde_json::to_value(&*process)
            .map_err(|e| ProcessStoreError::Codec(e.to_string()))?;

        let written = if expected == 0 {
            sqlx::query(
                r#"
                INSERT INTO registration_processes (process_id, order_id, reservation_id, version, state)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (process_id) DO NOTHING
                "#,
            )
            .bind(process_id.as_uuid())
            .bind(process.order_id().map(|id| *id.as_uuid()))
            .bind(process.reservation_id().map(|id| *id.as_uuid()))
            .bind(process.version as i64)
            .bind(&state)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE registration_processes
                SET order_id = $2, reservation_id = $3, version = $4, state = $5
                WHERE process_id = $1 AND version = $6
                "#,
            )
            .bind(process_id.as_uuid())
            .bind(process.order_id().map(|id| *id.as_uuid()))
            .bind(process.reservation_id().map(|id| *id.as_uuid()))
            .bind(process.version as i64)
            .bind(&state)
            .bind(expected as i64)
            .execute(&mut *tx)
            .await
        }
        .map_err(|e| ProcessStoreError::Storage(format!("write process: {e}")))?;

        if written.rows_affected() == 0 {
            process.version = expected;
            return Err(ProcessStoreError::Concurrency(format!(
                "expected version {expected} (process {process_id})"
            )));
        }

        for envelope in pending {
            let body = serde_json::to_value(envelope)
                .map_err(|e| ProcessStoreError::Codec(e.to_string()))?;
            sqlx::query("INSERT INTO process_outbox (process_id, envelope) VALUES ($1, $2)")
                .bind(process_id.as_uuid())
                .bind(&body)
                .execute(&mut *tx)
                .await
                .map_err(|e| ProcessStoreError::Storage(format!("write outbox: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| ProcessStoreError::Storage(format!("commit save: {e}")))
    }

    /// Send outbox rows in insertion order, deleting each once the queue
    /// accepts it. A failure leaves the remainder for the next drain.
    fn drain_outbox(&self, process_id: ProcessId) -> Result<(), ProcessStoreError> {
        loop {
            let handle = runtime_handle()?;
            let row = handle
                .block_on(
                    sqlx::query(
                        "SELECT id, envelope FROM process_outbox WHERE process_id = $1 ORDER BY id LIMIT 1",
                    )
                    .bind(process_id.as_uuid())
                    .fetch_optional(&*self.pool),
                )
                .map_err(|e| ProcessStoreError::Storage(format!("read outbox: {e}")))?;

            let Some(row) = row else {
                return Ok(());
            };
            let id: i64 = row
                .try_get("id")
                .map_err(|e| ProcessStoreError::Storage(format!("outbox row: {e}")))?;
            let envelope: serde_json::Value = row
                .try_get("envelope")
                .map_err(|e| ProcessStoreError::Storage(format!("outbox row: {e}")))?;
            let envelope: CommandEnvelope = serde_json::from_value(envelope)
                .map_err(|e| ProcessStoreError::Codec(e.to_string()))?;

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

            handle
                .block_on(
                    sqlx::query("DELETE FROM process_outbox WHERE id = $1")
                        .bind(id)
                        .execute(&*self.pool),
                )
                .map_err(|e| ProcessStoreError::Storage(format!("delete outbox row: {e}")))?;
        }
    }

    async fn load_state_async(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        let row = sqlx::query("SELECT state FROM registration_processes WHERE process_id = $1")
            .bind(process_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| ProcessStoreError::Storage(format!("read process: {e}")))?;

        row.map(|row| {
            let state: serde_json::Value = row
                .try_get("state")
                .map_err(|e| ProcessStoreError::Storage(format!("process row: {e}")))?;
            serde_json::from_value(state).map_err(|e| ProcessStoreError::Codec(e.to_string()))
        })
        .transpose()
    }

    fn load(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        // Undelivered commands from an interrupted save go out before the
        // process handles anything new.
        self.drain_outbox(process_id)?;
        runtime_handle()?.block_on(self.load_state_async(process_id))
    }

    async fn find_process_id(
        &self,
        column: &str,
        value: uuid::Uuid,
    ) -> Result<Option<ProcessId>, ProcessStoreError> {
        let query = format!("SELECT process_id FROM registration_processes WHERE {column} = $1");
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| ProcessStoreError::Storage(format!("find process: {e}")))?;

        row.map(|row| {
            row.try_get::<uuid::Uuid, _>("process_id")
                .map(ProcessId::from_uuid)
                .map_err(|e| ProcessStoreError::Storage(format!("process row: {e}")))
        })
        .transpose()
    }
}

impl<Q> ProcessStore for PostgresProcessStore<Q>
where
    Q: MessageQueue,
{
    fn save(&self, process: &mut RegistrationProcess) -> Result<(), ProcessStoreError> {
        let pending = process.take_pending_commands();
        let saved = runtime_handle()?.block_on(self.save_state_async(process, &pending));
        if let Err(err) = saved {
            // Hand the commands back so a reloaded process can redecide.
            process.pending_commands = pending;
            return Err(err);
        }
        self.drain_outbox(process.process_id())
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
        let found =
            runtime_handle()?.block_on(self.find_process_id("order_id", *order_id.as_uuid()))?;
        match found {
            Some(process_id) => self.load(process_id),
            None => Ok(None),
        }
    }

    fn find_by_reservation_id(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<RegistrationProcess>, ProcessStoreError> {
        let found = runtime_handle()?
            .block_on(self.find_process_id("reservation_id", *reservation_id.as_uuid()))?;
        match found {
            Some(process_id) => self.load(process_id),
            None => Ok(None),
        }
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, ProcessStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        ProcessStoreError::Storage("postgres process store requires a tokio runtime".to_string())
    })
}
