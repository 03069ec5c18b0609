use async_trait::async_trait;
use futures_util::TryStreamExt;
use scylla::client::session::Session;
use scylla::statement::batch::Batch;
use scylla::value::{CqlValue, Row};
use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event_sourcing::core::{
    AggregateId, ArchiveBehavior, EngineError, EngineResult, Snapshot, StoredEvent,
};
use super::event_store::{resolve_sequence, EventStore};

// ============================================================================
// ScyllaDB Event Store
// ============================================================================
//
// Tables:
// - event_store:          one partition per (aggregate_id, aggregate_type),
//                         clustered by (sequence_number, event_id), with the
//                         stream head in a static column
// - aggregate_snapshots:  one row per stream, upserted
// - event_archive:        events moved out by StoreToArchiveTable
//
// Appends go out as a single-partition conditional batch guarded by
// `IF stream_head = <head the writer read>`. Archival deletes rows but never
// the head, so a writer that read a stale head cannot land in a range that
// was already archived. A guard that does not hold surfaces as
// ConcurrencyConflict.
//
// ============================================================================

const EVENT_COLUMNS: &str = "aggregate_id, aggregate_type, sequence_number, event_id, event_type, \
     event_version, payload, metadata, causation_id, correlation_id, event_time";

type EventRow = (
    String,
    String,
    i64,
    Uuid,
    String,
    i32,
    String,
    Option<String>,
    Option<Uuid>,
    Uuid,
    DateTime<Utc>,
);

// SET columns, stream_head, then primary key, then the guarded head
type AppendValues = (
    String,
    i32,
    String,
    String,
    Option<Uuid>,
    Uuid,
    DateTime<Utc>,
    i64,
    String,
    String,
    i64,
    Uuid,
    Option<i64>,
);

const APPEND_STATEMENT: &str = "UPDATE event_store SET event_type = ?, event_version = ?, payload = ?, \
     metadata = ?, causation_id = ?, correlation_id = ?, event_time = ?, stream_head = ? \
     WHERE aggregate_id = ? AND aggregate_type = ? AND sequence_number = ? AND event_id = ? \
     IF stream_head = ?";

const DELETE_STATEMENT: &str = "DELETE FROM event_store \
     WHERE aggregate_id = ? AND aggregate_type = ? AND sequence_number = ? AND event_id = ?";

type EventValues = (
    String,
    String,
    i64,
    Uuid,
    String,
    i32,
    String,
    String,
    Option<Uuid>,
    Uuid,
    DateTime<Utc>,
);

fn backend<E>(err: E) -> EngineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    EngineError::Backend(anyhow::Error::new(err))
}

fn to_values(event: &StoredEvent, sequence: u64) -> EventValues {
    (
        event.aggregate_id.to_string(),
        event.aggregate_type.clone(),
        sequence as i64,
        event.event_id,
        event.event_type.clone(),
        event.event_version,
        event.payload.clone(),
        event.metadata.clone(),
        event.causation_id,
        event.correlation_id,
        event.timestamp,
    )
}

/// Values for one guarded append. A stream that never recorded a head
/// (new, or written before the head column existed) is guarded on null.
fn append_values(event: &StoredEvent, sequence: u64, new_head: u64, expected_head: Option<u64>) -> AppendValues {
    (
        event.event_type.clone(),
        event.event_version,
        event.payload.clone(),
        event.metadata.clone(),
        event.causation_id,
        event.correlation_id,
        event.timestamp,
        new_head as i64,
        event.aggregate_id.to_string(),
        event.aggregate_type.clone(),
        sequence as i64,
        event.event_id,
        expected_head.map(|h| h as i64),
    )
}

/// Inclusive clustering bound for a read after `from_sequence_exclusive`.
/// A full read starts at 0 so unsequenced rows come back too.
fn stream_lower_bound(from_sequence_exclusive: u64) -> i64 {
    if from_sequence_exclusive == 0 {
        0
    } else {
        from_sequence_exclusive as i64 + 1
    }
}

fn from_row(row: EventRow) -> StoredEvent {
    let (
        aggregate_id,
        aggregate_type,
        sequence_number,
        event_id,
        event_type,
        event_version,
        payload,
        metadata,
        causation_id,
        correlation_id,
        timestamp,
    ) = row;

    StoredEvent {
        event_id,
        aggregate_id: AggregateId::new(aggregate_id),
        aggregate_type,
        sequence_number: sequence_number.max(0) as u64,
        event_type,
        event_version,
        payload,
        metadata: metadata.unwrap_or_default(),
        causation_id,
        correlation_id,
        timestamp,
    }
}

pub struct ScyllaEventStore {
    session: Arc<Session>,
}

impl ScyllaEventStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Create the tables this store reads and writes.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS event_store (
                aggregate_id text, aggregate_type text, sequence_number bigint,
                event_id uuid, event_type text, event_version int,
                payload text, metadata text,
                causation_id uuid, correlation_id uuid, event_time timestamp,
                stream_head bigint static,
                PRIMARY KEY ((aggregate_id, aggregate_type), sequence_number, event_id)
            ) WITH CLUSTERING ORDER BY (sequence_number ASC, event_id ASC)",
            "CREATE TABLE IF NOT EXISTS aggregate_snapshots (
                aggregate_id text, aggregate_type text, sequence_number bigint,
                payload text, behavior_type_tag text, snapshot_time timestamp,
                PRIMARY KEY ((aggregate_id, aggregate_type))
            )",
            "CREATE TABLE IF NOT EXISTS event_archive (
                aggregate_id text, aggregate_type text, sequence_number bigint,
                event_id uuid, event_type text, event_version int,
                payload text, metadata text,
                causation_id uuid, correlation_id uuid, event_time timestamp,
                archived_at timestamp,
                PRIMARY KEY ((aggregate_id, aggregate_type), sequence_number, event_id)
            )",
        ];

        for statement in statements {
            self.session.query_unpaged(statement, &[]).await.map_err(backend)?;
        }

        tracing::info!("Event store schema ready");
        Ok(())
    }

    /// Head recorded by the last guarded append, if any.
    async fn stream_head(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<Option<u64>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT stream_head FROM event_store
                 WHERE aggregate_id = ? AND aggregate_type = ? LIMIT 1",
                (aggregate_id.as_str(), aggregate_type),
            )
            .await
            .map_err(backend)?;

        let row = result
            .into_rows_result()
            .map_err(backend)?
            .maybe_first_row::<(Option<i64>,)>()
            .map_err(backend)?;

        Ok(row.and_then(|(head,)| head).map(|h| h.max(0) as u64))
    }

    async fn highest_stored_sequence(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<u64> {
        let result = self
            .session
            .query_unpaged(
                "SELECT sequence_number FROM event_store
                 WHERE aggregate_id = ? AND aggregate_type = ?
                 ORDER BY sequence_number DESC LIMIT 1",
                (aggregate_id.as_str(), aggregate_type),
            )
            .await
            .map_err(backend)?;

        // A partition holding only the static head yields a null sequence
        let row = result
            .into_rows_result()
            .map_err(backend)?
            .maybe_first_row::<(Option<i64>,)>()
            .map_err(backend)?;

        Ok(row.and_then(|(sequence,)| sequence).map_or(0, |s| s.max(0) as u64))
    }

    /// Stream head given what the head column holds.
    async fn resolve_head(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        recorded: Option<u64>,
    ) -> EngineResult<u64> {
        let stored = match recorded {
            Some(head) => head,
            None => self.highest_stored_sequence(aggregate_id, aggregate_type).await?,
        };
        // Streams written before the head column existed may have had their
        // top rows archived; the snapshot still remembers how far they went.
        let covered = self
            .get_snapshot(aggregate_id, aggregate_type)
            .await?
            .map(|s| s.sequence_number)
            .unwrap_or(0);
        Ok(stored.max(covered))
    }
}

#[async_trait]
impl EventStore for ScyllaEventStore {
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        events: Vec<StoredEvent>,
    ) -> EngineResult<u64> {
        let expected_head = self.stream_head(aggregate_id, aggregate_type).await?;
        let mut head = self.resolve_head(aggregate_id, aggregate_type, expected_head).await?;
        if events.is_empty() {
            return Ok(head);
        }

        let first_sequence = head + 1;
        let mut sequences = Vec::with_capacity(events.len());
        for event in &events {
            head = resolve_sequence(aggregate_id, aggregate_type, head, event.sequence_number)?;
            sequences.push(head);
        }

        let mut batch = Batch::default();
        let mut values: Vec<AppendValues> = Vec::with_capacity(events.len());
        for (event, sequence) in events.iter().zip(sequences) {
            batch.append_statement(APPEND_STATEMENT);
            values.push(append_values(event, sequence, head, expected_head));
        }

        let result = self.session.batch(&batch, values).await.map_err(backend)?;

        let applied = matches!(
            result.into_rows_result().map_err(backend)?.maybe_first_row::<Row>().map_err(backend)?,
            Some(row) if matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true))))
        );

        if !applied {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                aggregate_type = aggregate_type,
                sequence = first_sequence,
                "Conditional append not applied"
            );
            return Err(EngineError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: aggregate_type.to_string(),
                sequence: first_sequence,
            });
        }

        tracing::info!(
            aggregate_id = %aggregate_id,
            aggregate_type = aggregate_type,
            new_version = head,
            event_count = events.len(),
            "Appended events to event store"
        );

        Ok(head)
    }

    async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        from_sequence_exclusive: u64,
    ) -> EngineResult<Vec<StoredEvent>> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM event_store
             WHERE aggregate_id = ? AND aggregate_type = ? AND sequence_number >= ?
             ORDER BY sequence_number ASC"
        );

        let mut rows = self
            .session
            .query_iter(query, (aggregate_id.as_str(), aggregate_type, stream_lower_bound(from_sequence_exclusive)))
            .await
            .map_err(backend)?
            .rows_stream::<EventRow>()
            .map_err(backend)?;

        let mut events = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(backend)? {
            events.push(from_row(row));
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            from_sequence = from_sequence_exclusive,
            "Loaded {} events",
            events.len()
        );
        Ok(events)
    }

    async fn get_snapshot(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
    ) -> EngineResult<Option<Snapshot>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT sequence_number, payload, behavior_type_tag, snapshot_time
                 FROM aggregate_snapshots WHERE aggregate_id = ? AND aggregate_type = ?",
                (aggregate_id.as_str(), aggregate_type),
            )
            .await
            .map_err(backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(None),
        };

        let row = rows_result
            .maybe_first_row::<(i64, String, String, DateTime<Utc>)>()
            .map_err(backend)?;

        Ok(row.map(|(sequence_number, payload, behavior_type_tag, snapshot_time)| Snapshot {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: aggregate_type.to_string(),
            sequence_number: sequence_number.max(0) as u64,
            payload,
            behavior_type_tag,
            snapshot_time,
        }))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> EngineResult<()> {
        // INSERT is an upsert in CQL
        self.session
            .query_unpaged(
                "INSERT INTO aggregate_snapshots (
                    aggregate_id, aggregate_type, sequence_number, payload, behavior_type_tag, snapshot_time
                ) VALUES (?, ?, ?, ?, ?, ?)",
                (
                    snapshot.aggregate_id.as_str(),
                    snapshot.aggregate_type.as_str(),
                    snapshot.sequence_number as i64,
                    snapshot.payload.as_str(),
                    snapshot.behavior_type_tag.as_str(),
                    snapshot.snapshot_time,
                ),
            )
            .await
            .map_err(backend)?;

        tracing::info!(
            aggregate_id = %snapshot.aggregate_id,
            aggregate_type = %snapshot.aggregate_type,
            sequence = snapshot.sequence_number,
            "Saved snapshot"
        );
        Ok(())
    }

    async fn archive_events(&self, events: &[StoredEvent], behavior: ArchiveBehavior) -> EngineResult<usize> {
        if events.is_empty() || behavior == ArchiveBehavior::Keep {
            return Ok(0);
        }

        let mut covered_by_stream: HashMap<(AggregateId, String), u64> = HashMap::new();
        let mut archived = 0;
        for event in events {
            let stream = (event.aggregate_id.clone(), event.aggregate_type.clone());
            let covered = match covered_by_stream.get(&stream) {
                Some(covered) => *covered,
                None => {
                    let covered = self
                        .get_snapshot(&event.aggregate_id, &event.aggregate_type)
                        .await?
                        .map(|s| s.sequence_number)
                        .unwrap_or(0);
                    covered_by_stream.insert(stream, covered);
                    covered
                }
            };
            if event.sequence_number > covered {
                tracing::warn!(
                    aggregate_id = %event.aggregate_id,
                    sequence = event.sequence_number,
                    covered_sequence = covered,
                    "Refusing to archive event not covered by a snapshot"
                );
                continue;
            }

            let mut batch = Batch::default();
            let delete = (
                event.aggregate_id.to_string(),
                event.aggregate_type.clone(),
                event.sequence_number as i64,
                event.event_id,
            );

            if behavior == ArchiveBehavior::StoreToArchiveTable {
                let insert = format!(
                    "INSERT INTO event_archive ({EVENT_COLUMNS}, archived_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                );
                batch.append_statement(insert.as_str());
                batch.append_statement(DELETE_STATEMENT);
                let row = to_values(event, event.sequence_number);
                let archive_values = (
                    row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8, row.9, row.10, Utc::now(),
                );
                self.session
                    .batch(&batch, (archive_values, delete))
                    .await
                    .map_err(backend)?;
            } else {
                batch.append_statement(DELETE_STATEMENT);
                self.session.batch(&batch, (delete,)).await.map_err(backend)?;
            }

            archived += 1;
        }

        tracing::info!(behavior = %behavior, count = archived, "Archived events");
        Ok(archived)
    }

    async fn current_sequence(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<u64> {
        let recorded = self.stream_head(aggregate_id, aggregate_type).await?;
        self.resolve_head(aggregate_id, aggregate_type, recorded).await
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
//
// Statements against a live node are exercised by integration runs; these
// cover the row mapping.
//
