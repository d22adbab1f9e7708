//! Postgres-backed event store and snapshot store.
//!
//! Optimistic concurrency is enforced twice: the stream version is checked
//! inside the append transaction, and the unique constraint on
//! `(aggregate_id, aggregate_type, sequence_number)` catches a concurrent
//! append that commits between the check and the insert (both surface as
//! `EventStoreError::Concurrency`).
//!
//! The `EventStore`/`SnapshotStore` traits are synchronous; the async sqlx
//! calls are bridged with `tokio::runtime::Handle::block_on`, so these stores
//! must be used from within a tokio runtime.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;

use confreg_core::{AggregateId, ExpectedVersion};

use super::snapshots::{SnapshotRecord, SnapshotStore};
use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_id.as_uuid(), aggregate_type),
        err
    )]
    async fn load_stream_async(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                schema_version,
                occurred_at,
                correlation_id,
                payload
            FROM events
            WHERE aggregate_id = $1 AND aggregate_type = $2 AND sequence_number > $3
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(aggregate_type)
        .bind(after_version as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::Storage(format!("failed to deserialize event row: {e}"))
            })?;
            stored_events.push(stored.into());
        }
        Ok(stored_events)
    }

    #[instrument(
        skip(self, events),
        fields(event_count = events.len(), expected_version = ?expected_version),
        err
    )]
    async fn append_async(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id || e.aggregate_type != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple streams (index {idx})"
                )));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current_version = stream_version(&mut tx, aggregate_id, &aggregate_type).await?;
        if !expected_version.matches(current_version) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_sequence = current_version + 1;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    schema_version,
                    occurred_at,
                    correlation_id,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.event_id)
            .bind(aggregate_id.as_uuid())
            .bind(&aggregate_type)
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.schema_version as i32)
            .bind(event.occurred_at)
            .bind(&event.correlation_id)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: sequence_number {next_sequence} already exists"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            stored_events.push(StoredEvent {
                event_id: event.event_id,
                aggregate_id,
                aggregate_type: aggregate_type.clone(),
                sequence_number: next_sequence,
                event_type: event.event_type,
                schema_version: event.schema_version,
                occurred_at: event.occurred_at,
                correlation_id: event.correlation_id,
                payload: event.payload,
            });
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_events)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        runtime_handle()?.block_on(self.append_async(events, expected_version))
    }

    fn load_stream(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_stream_async(aggregate_id, aggregate_type, 0))
    }

    fn load_stream_from(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        after_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime_handle()?.block_on(self.load_stream_async(
            aggregate_id,
            aggregate_type,
            after_version,
        ))
    }
}

/// Postgres-backed snapshot store (one row per aggregate, upserted).
#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn save_async(&self, snapshot: SnapshotRecord) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, aggregate_type)
            DO UPDATE SET
                version = EXCLUDED.version,
                state = EXCLUDED.state,
                created_at = NOW()
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version as i64)
        .bind(&snapshot.state)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;
        Ok(())
    }

    async fn load_async(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<SnapshotRecord>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state
            FROM snapshots
            WHERE aggregate_id = $1 AND aggregate_type = $2
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(aggregate_type)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| EventStoreError::Storage(format!("snapshot row: {e}")))?;
                let state: serde_json::Value = row
                    .try_get("state")
                    .map_err(|e| EventStoreError::Storage(format!("snapshot row: {e}")))?;
                Ok(Some(SnapshotRecord {
                    aggregate_id,
                    aggregate_type: aggregate_type.to_string(),
                    version: version as u64,
                    state,
                }))
            }
            None => Ok(None),
        }
    }
}

impl SnapshotStore for PostgresSnapshotStore {
    fn save(&self, snapshot: SnapshotRecord) -> Result<(), EventStoreError> {
        runtime_handle()?.block_on(self.save_async(snapshot))
    }

    fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<SnapshotRecord>, EventStoreError> {
        runtime_handle()?.block_on(self.load_async(aggregate_id, aggregate_type))
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::Storage(
            "postgres stores require a tokio runtime context".to_string(),
        )
    })
}

/// Current stream version inside the append transaction (0 for a new stream).
async fn stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
    aggregate_type: &str,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version
        FROM events
        WHERE aggregate_id = $1 AND aggregate_type = $2
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .bind(aggregate_type)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;
    Ok(current_version as u64)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    schema_version: i32,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<String>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            schema_version: row.try_get("schema_version")?,
            occurred_at: row.try_get("occurred_at")?,
            correlation_id: row.try_get("correlation_id")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            schema_version: row.schema_version as u32,
            occurred_at: row.occurred_at,
            correlation_id: row.correlation_id,
            payload: row.payload,
        }
    }
}
