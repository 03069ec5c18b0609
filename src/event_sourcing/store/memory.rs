use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::event_sourcing::core::{AggregateId, ArchiveBehavior, EngineResult, Snapshot, StoredEvent};
use super::event_store::{is_after_cursor, resolve_sequence, EventStore};

// ============================================================================
// In-Memory Event Store
// ============================================================================
//
// Process-local backend. Appends take the write lock for the whole
// check-and-append, so a batch lands entirely or not at all.
//
// ============================================================================

type StreamKey = (AggregateId, String);

#[derive(Default)]
struct Stream {
    events: Vec<StoredEvent>,
    // Head survives deletion of archived events
    head: u64,
}

#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Stream>>,
    snapshots: RwLock<HashMap<StreamKey, Snapshot>>,
    archive: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events moved out by `StoreToArchiveTable`.
    pub fn archived_events(&self) -> Vec<StoredEvent> {
        self.archive.read().clone()
    }

    /// Insert a raw row as-is, bypassing sequence checks. Meant for seeding
    /// legacy or foreign streams.
    pub fn import_raw(&self, event: StoredEvent) {
        let key = (event.aggregate_id.clone(), event.aggregate_type.clone());
        let mut streams = self.streams.write();
        let stream = streams.entry(key).or_default();
        stream.head = stream.head.max(event.sequence_number);
        stream.events.push(event);
        stream.events.sort_by_key(|e| e.sequence_number);
    }
}

fn key(aggregate_id: &AggregateId, aggregate_type: &str) -> StreamKey {
    (aggregate_id.clone(), aggregate_type.to_string())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        events: Vec<StoredEvent>,
    ) -> EngineResult<u64> {
        let mut streams = self.streams.write();
        let stream = streams.entry(key(aggregate_id, aggregate_type)).or_default();

        let mut head = stream.head;
        let mut staged = Vec::with_capacity(events.len());
        for mut event in events {
            head = resolve_sequence(aggregate_id, aggregate_type, head, event.sequence_number)?;
            event.sequence_number = head;
            event.aggregate_id = aggregate_id.clone();
            event.aggregate_type = aggregate_type.to_string();
            staged.push(event);
        }

        let appended = staged.len();
        stream.events.extend(staged);
        stream.head = head;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = aggregate_type,
            new_version = head,
            event_count = appended,
            "Appended events to in-memory store"
        );

        Ok(head)
    }

    async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        from_sequence_exclusive: u64,
    ) -> EngineResult<Vec<StoredEvent>> {
        let streams = self.streams.read();
        Ok(streams
            .get(&key(aggregate_id, aggregate_type))
            .map(|stream| {
                stream
                    .events
                    .iter()
                    .filter(|e| is_after_cursor(e.sequence_number, from_sequence_exclusive))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_snapshot(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
    ) -> EngineResult<Option<Snapshot>> {
        Ok(self.snapshots.read().get(&key(aggregate_id, aggregate_type)).cloned())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> EngineResult<()> {
        let k = key(&snapshot.aggregate_id, &snapshot.aggregate_type);
        self.snapshots.write().insert(k, snapshot);
        Ok(())
    }

    async fn archive_events(&self, events: &[StoredEvent], behavior: ArchiveBehavior) -> EngineResult<usize> {
        if events.is_empty() || behavior == ArchiveBehavior::Keep {
            return Ok(0);
        }

        // Only events the newest snapshot already covers may leave the stream
        let eligible: Vec<&StoredEvent> = {
            let snapshots = self.snapshots.read();
            events
                .iter()
                .filter(|e| {
                    let covered = snapshots
                        .get(&key(&e.aggregate_id, &e.aggregate_type))
                        .map(|s| s.sequence_number)
                        .unwrap_or(0);
                    if e.sequence_number > covered {
                        tracing::warn!(
                            aggregate_id = %e.aggregate_id,
                            sequence = e.sequence_number,
                            covered_sequence = covered,
                            "Refusing to archive event not covered by a snapshot"
                        );
                        return false;
                    }
                    true
                })
                .collect()
        };

        let mut removed = Vec::new();
        {
            let mut streams = self.streams.write();
            for e in eligible {
                if let Some(stream) = streams.get_mut(&key(&e.aggregate_id, &e.aggregate_type)) {
                    if let Some(pos) = stream.events.iter().position(|s| s.event_id == e.event_id) {
                        removed.push(stream.events.remove(pos));
                    }
                }
            }
        }

        let count = removed.len();
        if behavior == ArchiveBehavior::StoreToArchiveTable {
            self.archive.write().extend(removed);
        }

        tracing::debug!(behavior = %behavior, count = count, "Archived events");
        Ok(count)
    }

    async fn current_sequence(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<u64> {
        Ok(self
            .streams
            .read()
            .get(&key(aggregate_id, aggregate_type))
            .map(|s| s.head)
            .unwrap_or(0))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::EngineError;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn row(id: &str, seq: u64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::new(id),
            aggregate_type: "Order".to_string(),
            sequence_number: seq,
            event_type: "Noted".to_string(),
            event_version: 1,
            payload: format!(r#"{{"type":"Noted","data":{seq}}}"#),
            metadata: "{}".to_string(),
            causation_id: None,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    fn snapshot(id: &str, covered: u64) -> Snapshot {
        Snapshot {
            aggregate_id: AggregateId::new(id),
            aggregate_type: "Order".to_string(),
            sequence_number: covered,
            payload: "{}".to_string(),
            behavior_type_tag: "numeric".to_string(),
            snapshot_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_sequences() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");

        let head = store.append_events(&id, "Order", vec![row("o1", 0), row("o1", 0)]).await.unwrap();
        assert_eq!(head, 2);

        let head = store.append_events(&id, "Order", vec![row("o1", 3)]).await.unwrap();
        assert_eq!(head, 3);

        let stream = store.get_event_stream(&id, "Order", 0).await.unwrap();
        let seqs: Vec<u64> = stream.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let tail = store.get_event_stream(&id, "Order", 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(store.aggregate_exists(&id, "Order").await.unwrap());
        assert!(!store.aggregate_exists(&id, "Customer").await.unwrap());
    }

    #[tokio::test]
    async fn test_taken_sequence_is_conflict_and_batch_is_atomic() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        store.append_events(&id, "Order", vec![row("o1", 1), row("o1", 2)]).await.unwrap();

        let err = store
            .append_events(&id, "Order", vec![row("o1", 3), row("o1", 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));

        // nothing from the failed batch leaked in
        assert_eq!(store.current_sequence(&id, "Order").await.unwrap(), 2);
        assert_eq!(store.get_event_stream(&id, "Order", 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gap_is_rejected() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");

        let err = store.append_events(&id, "Order", vec![row("o1", 2)]).await.unwrap_err();
        assert!(matches!(err, EngineError::SequenceGap { expected: 1, found: 2 }));
    }

    #[tokio::test]
    async fn test_concurrent_appends_one_wins() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new("o1");

        let a = {
            let (store, id) = (store.clone(), id.clone());
            tokio::spawn(async move { store.append_events(&id, "Order", vec![row("o1", 1)]).await })
        };
        let b = {
            let (store, id) = (store.clone(), id.clone());
            tokio::spawn(async move { store.append_events(&id, "Order", vec![row("o1", 1)]).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::ConcurrencyConflict { .. })))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(store.get_event_stream(&id, "Order", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_upsert_keeps_latest() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        assert!(store.get_snapshot(&id, "Order").await.unwrap().is_none());

        store.save_snapshot(snapshot("o1", 2)).await.unwrap();
        store.save_snapshot(snapshot("o1", 5)).await.unwrap();

        let latest = store.get_snapshot(&id, "Order").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 5);
    }

    #[tokio::test]
    async fn test_archive_behaviors() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        store
            .append_events(&id, "Order", (1..=4).map(|s| row("o1", s)).collect())
            .await
            .unwrap();
        store.save_snapshot(snapshot("o1", 2)).await.unwrap();

        let stream = store.get_event_stream(&id, "Order", 0).await.unwrap();

        assert_eq!(store.archive_events(&[], ArchiveBehavior::Delete).await.unwrap(), 0);
        assert_eq!(store.archive_events(&stream[..2], ArchiveBehavior::Keep).await.unwrap(), 0);

        // event 3 is past the snapshot and must stay
        let moved = store
            .archive_events(&stream[..3], ArchiveBehavior::StoreToArchiveTable)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(store.archived_events().len(), 2);

        let remaining = store.get_event_stream(&id, "Order", 0).await.unwrap();
        let seqs: Vec<u64> = remaining.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4]);

        // head is unaffected by archival
        assert_eq!(store.current_sequence(&id, "Order").await.unwrap(), 4);
        let next = store.append_events(&id, "Order", vec![row("o1", 5)]).await.unwrap();
        assert_eq!(next, 5);
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts_after_delete_archival() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        store.append_events(&id, "Order", vec![row("o1", 1), row("o1", 2)]).await.unwrap();

        // another writer moves on and archives rows 1..3 away
        store.append_events(&id, "Order", vec![row("o1", 3), row("o1", 4)]).await.unwrap();
        store.save_snapshot(snapshot("o1", 3)).await.unwrap();
        let stream = store.get_event_stream(&id, "Order", 0).await.unwrap();
        assert_eq!(store.archive_events(&stream[..3], ArchiveBehavior::Delete).await.unwrap(), 3);

        // a writer that still believes the head is 2 must not fill the hole
        let err = store.append_events(&id, "Order", vec![row("o1", 3)]).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { sequence: 3, .. }));
        assert_eq!(store.get_event_stream(&id, "Order", 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_read_returns_unsequenced_rows() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        store.import_raw(row("o1", 0));
        store.import_raw(row("o1", 0));
        store.append_events(&id, "Order", vec![row("o1", 1)]).await.unwrap();

        assert_eq!(store.get_event_stream(&id, "Order", 0).await.unwrap().len(), 3);
        assert_eq!(store.get_event_stream(&id, "Order", 1).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delete_without_snapshot_removes_nothing() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("o1");
        store.append_events(&id, "Order", vec![row("o1", 1)]).await.unwrap();
        let stream = store.get_event_stream(&id, "Order", 0).await.unwrap();

        assert_eq!(store.archive_events(&stream, ArchiveBehavior::Delete).await.unwrap(), 0);
        assert_eq!(store.get_event_stream(&id, "Order", 0).await.unwrap().len(), 1);
    }
}
