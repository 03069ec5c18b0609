use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::aggregate::AggregateState;
use super::errors::{EngineError, EngineResult};
use super::event::{order_for_replay, AggregateId, DomainEvent, EventEnvelope};

// ============================================================================
// Snapshot Record
// ============================================================================

/// Persisted, point-in-time state of one aggregate stream.
///
/// `sequence_number` is the last stream position the state covers; replay
/// resumes strictly after it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub payload: String,
    pub behavior_type_tag: String,
    pub snapshot_time: DateTime<Utc>,
}

// ============================================================================
// Archive Behavior
// ============================================================================

/// What happens to events once a snapshot has folded them in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ArchiveBehavior {
    /// Drop them from the live stream
    Delete,
    /// Move them to the archive table
    StoreToArchiveTable,
    /// Leave them addressable
    #[default]
    Keep,
}

impl ArchiveBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveBehavior::Delete => "delete",
            ArchiveBehavior::StoreToArchiveTable => "store_to_archive_table",
            ArchiveBehavior::Keep => "keep",
        }
    }
}

impl fmt::Display for ArchiveBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveBehavior {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delete" => Ok(ArchiveBehavior::Delete),
            "store_to_archive_table" | "archive" => Ok(ArchiveBehavior::StoreToArchiveTable),
            "keep" => Ok(ArchiveBehavior::Keep),
            other => Err(EngineError::Configuration(format!("unknown archive behavior: {other}"))),
        }
    }
}

// ============================================================================
// Snapshot Behavior Policy
// ============================================================================

/// Result of compaction: the reduced state and the events folded into it.
pub struct SnapshotCut<S, E> {
    pub state: AggregateState<S, E>,
    pub archived: Vec<EventEnvelope<E>>,
}

impl<S, E> SnapshotCut<S, E> {
    /// Last stream position covered by the reduced state.
    pub fn covered_sequence(&self) -> u64 {
        self.archived
            .iter()
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or_default()
    }
}

/// Decides when to snapshot and how to compact.
///
/// `is_snapshot_needed` is advisory. `generate_snapshot` must not perform I/O.
pub trait SnapshotBehavior<S, E>: Send + Sync {
    /// Recorded on every snapshot so later reads can tell which policy built it.
    fn type_tag(&self) -> &'static str;

    fn is_snapshot_needed(&self, event: &EventEnvelope<E>) -> bool;

    fn generate_snapshot(&self, state: &AggregateState<S, E>) -> EngineResult<SnapshotCut<S, E>>;
}

/// Snapshot once every `threshold` events, never on the first one.
///
/// Compaction folds the oldest `threshold` buffered events into a new state
/// built from the live state's seed (a fresh state, or the previous
/// snapshot), so consecutive snapshots build on each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumericSnapshotBehavior {
    threshold: u64,
}

impl NumericSnapshotBehavior {
    pub const TYPE_TAG: &'static str = "numeric";

    pub fn new(threshold: u64) -> EngineResult<Self> {
        if threshold == 0 {
            return Err(EngineError::Configuration(
                "snapshot threshold must be greater than zero".to_string(),
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl<S, E> SnapshotBehavior<S, E> for NumericSnapshotBehavior
where
    S: Clone + 'static,
    E: DomainEvent,
{
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn is_snapshot_needed(&self, event: &EventEnvelope<E>) -> bool {
        event.sequence_number > 1 && (event.sequence_number - 1) % self.threshold == 0
    }

    fn generate_snapshot(&self, state: &AggregateState<S, E>) -> EngineResult<SnapshotCut<S, E>> {
        let selected: Vec<EventEnvelope<E>> = order_for_replay(state.history().to_vec())
            .into_iter()
            .take(self.threshold as usize)
            .collect();

        let mut reduced = state.fork_from_seed();
        reduced.apply_range(selected.iter().cloned())?;

        tracing::debug!(
            selected = selected.len(),
            covered_sequence = reduced.sequence(),
            "Generated numeric snapshot"
        );

        Ok(SnapshotCut { state: reduced, archived: selected })
    }
}

// ============================================================================
// Tests
// ============================================================================
