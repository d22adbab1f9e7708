//! Postgres-backed durable message queue.
//!
//! One table per queue (commands and events get separate tables). Claiming
//! uses `FOR UPDATE SKIP LOCKED`, so concurrent receivers never hand the same
//! message to two subscribers: the row lock is the claim, and it lives exactly
//! as long as the receive transaction.
//!
//! Delivery is lock-and-delete: the row is deleted in the same transaction
//! when the subscriber succeeds, and released (rollback) when it fails, which
//! makes redelivery possible and gives at-least-once semantics.
//!
//! The subscriber runs between `block_on` calls, not inside one: subscribers
//! bridge into the runtime themselves (repositories, process stores), and a
//! nested `block_on` panics. The claim transaction stays open across the call,
//! holding the row lock.

use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::instrument;

use confreg_messaging::{
    MessageQueue, OutgoingMessage, QueueError, QueuedMessage, ReceiveOutcome,
};

/// Durable queue over a Postgres table.
///
/// Expected schema (see `migrations/`):
///
/// ```sql
/// CREATE TABLE <name> (
///     id             BIGSERIAL PRIMARY KEY,
///     body           TEXT NOT NULL,
///     deliver_after  TIMESTAMPTZ,
///     correlation_id TEXT,
///     enqueued_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
#[derive(Debug, Clone)]
pub struct PostgresMessageQueue {
    pool: Arc<PgPool>,
    table: String,
}

impl PostgresMessageQueue {
    /// `table` must be a trusted identifier (it is interpolated into SQL).
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            table: table.into(),
        }
    }

    pub fn commands(pool: PgPool) -> Self {
        Self::new(pool, "command_messages")
    }

    pub fn events(pool: PgPool) -> Self {
        Self::new(pool, "event_messages")
    }

    #[instrument(skip(self, messages), fields(table = %self.table, count = messages.len()), err)]
    async fn send_async(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Storage(format!("begin send transaction: {e}")))?;

        let insert = format!(
            "INSERT INTO {} (body, deliver_after, correlation_id) VALUES ($1, $2, $3)",
            self.table
        );
        for message in &messages {
            sqlx::query(&insert)
                .bind(&message.body)
                .bind(message.deliver_after)
                .bind(&message.correlation_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::Storage(format!("insert message: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| QueueError::Storage(format!("commit send transaction: {e}")))
    }
}

impl MessageQueue for PostgresMessageQueue {
    fn send(&self, messages: Vec<OutgoingMessage>) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }
        runtime_handle()?.block_on(self.send_async(messages))
    }

    fn receive(
        &self,
        subscriber: &dyn Fn(&QueuedMessage) -> anyhow::Result<()>,
    ) -> Result<ReceiveOutcome, QueueError> {
        let handle = runtime_handle()?;

        let mut tx = handle
            .block_on(self.pool.begin())
            .map_err(|e| QueueError::Storage(format!("begin receive transaction: {e}")))?;

        // Oldest eligible message first; locked rows belong to a concurrent
        // receiver and are skipped rather than waited on.
        let claim = format!(
            r#"
            SELECT id, body, correlation_id
            FROM {}
            WHERE deliver_after IS NULL OR deliver_after <= NOW()
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        );
        let row = handle
            .block_on(sqlx::query(&claim).fetch_optional(&mut *tx))
            .map_err(|e| QueueError::Storage(format!("claim message: {e}")))?;

        let Some(row) = row else {
            return Ok(ReceiveOutcome::Empty);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| QueueError::Storage(format!("message row: {e}")))?;
        let message = QueuedMessage {
            id: id as u64,
            body: row
                .try_get("body")
                .map_err(|e| QueueError::Storage(format!("message row: {e}")))?,
            correlation_id: row
                .try_get("correlation_id")
                .map_err(|e| QueueError::Storage(format!("message row: {e}")))?,
        };

        match subscriber(&message) {
            Ok(()) => {
                let delete = format!("DELETE FROM {} WHERE id = $1", self.table);
                handle
                    .block_on(async {
                        sqlx::query(&delete).bind(id).execute(&mut *tx).await?;
                        tx.commit().await
                    })
                    .map_err(|e| QueueError::Storage(format!("delete message: {e}")))?;
                Ok(ReceiveOutcome::Handled)
            }
            Err(_) => {
                // Rollback releases the row lock and the message stays queued.
                handle
                    .block_on(tx.rollback())
                    .map_err(|e| QueueError::Storage(format!("rollback receive: {e}")))?;
                Ok(ReceiveOutcome::Abandoned)
            }
        }
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, QueueError> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| QueueError::Storage("postgres queue requires a tokio runtime".to_string()))
}
