use async_trait::async_trait;

use crate::event_sourcing::core::{AggregateId, ArchiveBehavior, EngineResult, Snapshot, StoredEvent};

// ============================================================================
// Event Store Port - backend-agnostic storage contract
// ============================================================================
//
// Every backend (ScyllaDB, in-memory, ...) implements this trait.
//
// Guarantees a backend must give:
// 1. Per (aggregate_id, aggregate_type) stream, sequence numbers are unique,
//    strictly increasing and gapless, even across processes
// 2. A taken sequence fails the append with ConcurrencyConflict
// 3. Readers see a stream either before or after an append, never half of it
// 4. At most one live snapshot per stream
// 5. Archiving never removes events past the newest snapshot
//
// ============================================================================

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream.
    ///
    /// Events with sequence 0 are numbered from the current head; sequenced
    /// events must continue the stream exactly. Returns the new head.
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        events: Vec<StoredEvent>,
    ) -> EngineResult<u64>;

    /// Events with sequence strictly greater than `from_sequence_exclusive`,
    /// ascending. A read from 0 also returns unsequenced (sequence 0) rows.
    async fn get_event_stream(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
        from_sequence_exclusive: u64,
    ) -> EngineResult<Vec<StoredEvent>>;

    async fn get_snapshot(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &str,
    ) -> EngineResult<Option<Snapshot>>;

    /// Upsert by (aggregate_id, aggregate_type), replacing an older snapshot.
    async fn save_snapshot(&self, snapshot: Snapshot) -> EngineResult<()>;

    /// Apply `behavior` to events folded into a snapshot. Returns how many
    /// events were moved or removed.
    async fn archive_events(&self, events: &[StoredEvent], behavior: ArchiveBehavior) -> EngineResult<usize>;

    /// Current stream head, 0 for an unknown stream.
    async fn current_sequence(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<u64>;

    /// Check if aggregate exists
    async fn aggregate_exists(&self, aggregate_id: &AggregateId, aggregate_type: &str) -> EngineResult<bool> {
        Ok(self.current_sequence(aggregate_id, aggregate_type).await? > 0)
    }
}

/// Whether a stored sequence belongs to a read starting after `from`.
/// Unsequenced rows carry no position, so only a full read sees them.
pub(crate) fn is_after_cursor(sequence: u64, from_sequence_exclusive: u64) -> bool {
    from_sequence_exclusive == 0 || sequence > from_sequence_exclusive
}

/// Sequence an incoming event ends up with, given the stream head.
/// Shared by all backends.
pub(crate) fn resolve_sequence(
    aggregate_id: &AggregateId,
    aggregate_type: &str,
    head: u64,
    requested: u64,
) -> EngineResult<u64> {
    use crate::event_sourcing::core::EngineError;

    let expected = head + 1;
    match requested {
        0 => Ok(expected),
        s if s == expected => Ok(s),
        s if s <= head => Err(EngineError::ConcurrencyConflict {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            sequence: s,
        }),
        s => Err(EngineError::SequenceGap { expected, found: s }),
    }
}
