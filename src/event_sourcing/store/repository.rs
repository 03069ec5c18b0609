use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::event_sourcing::core::{
    order_for_replay, Aggregate, AggregateId, AggregateState, ArchiveBehavior, EngineError,
    EngineResult, EventEnvelope, EventSerializer, JsonEventSerializer, Snapshot, SnapshotBehavior,
    StateFactory, UnhandledEventPolicy,
};
use crate::metrics::Metrics;
use super::event_store::EventStore;

// ============================================================================
// Repository - load and save aggregates through the event store
// ============================================================================
//
// Rehydrate:  newest usable snapshot -> events after it -> ordered replay
// Commit:     envelopes -> atomic append -> apply -> best-effort snapshot
//
// The aggregate state is only touched once the append has been accepted, so
// a failed or cancelled commit leaves it as it was.
//
// ============================================================================

pub struct Repository<A: Aggregate, Ser = JsonEventSerializer> {
    store: Arc<dyn EventStore>,
    serializer: Arc<Ser>,
    factory: StateFactory<A, A::Event>,
    snapshot_behavior: Arc<dyn SnapshotBehavior<A, A::Event>>,
    archive_behavior: ArchiveBehavior,
    metrics: Option<Arc<Metrics>>,
}

impl<A: Aggregate> Repository<A, JsonEventSerializer> {
    pub fn new(
        store: Arc<dyn EventStore>,
        snapshot_behavior: Arc<dyn SnapshotBehavior<A, A::Event>>,
        policy: UnhandledEventPolicy,
    ) -> EngineResult<Self> {
        Self::with_serializer(store, Arc::new(JsonEventSerializer::new()), snapshot_behavior, policy)
    }
}

impl<A, Ser> Repository<A, Ser>
where
    A: Aggregate,
    Ser: EventSerializer,
{
    pub fn with_serializer(
        store: Arc<dyn EventStore>,
        serializer: Arc<Ser>,
        snapshot_behavior: Arc<dyn SnapshotBehavior<A, A::Event>>,
        policy: UnhandledEventPolicy,
    ) -> EngineResult<Self> {
        Ok(Self::with_factory(store, serializer, A::state_factory(policy)?, snapshot_behavior))
    }

    /// Build around a caller-supplied state factory, e.g. one seeded with
    /// non-default initial state or extra handlers.
    pub fn with_factory(
        store: Arc<dyn EventStore>,
        serializer: Arc<Ser>,
        factory: StateFactory<A, A::Event>,
        snapshot_behavior: Arc<dyn SnapshotBehavior<A, A::Event>>,
    ) -> Self {
        Self {
            store,
            serializer,
            factory,
            snapshot_behavior,
            archive_behavior: ArchiveBehavior::default(),
            metrics: None,
        }
    }

    pub fn with_archive_behavior(mut self, behavior: ArchiveBehavior) -> Self {
        self.archive_behavior = behavior;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn serializer(&self) -> &Arc<Ser> {
        &self.serializer
    }

    /// Fresh, empty state for a new aggregate.
    pub fn fresh(&self) -> AggregateState<A, A::Event> {
        self.factory.fresh()
    }

    pub async fn exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        self.store.aggregate_exists(aggregate_id, A::AGGREGATE_TYPE).await
    }

    // ========================================================================
    // Rehydration
    // ========================================================================

    /// Rebuild an aggregate from its newest usable snapshot plus the events
    /// stored after it.
    ///
    /// A snapshot that cannot be read, belongs to another policy or fails to
    /// decode is ignored in favour of a full replay. Stored events whose type
    /// is not known are skipped under either policy, but still move the
    /// sequence cursor, and no later snapshot of this state will cover them.
    pub async fn rehydrate(&self, aggregate_id: &AggregateId) -> EngineResult<AggregateState<A, A::Event>> {
        let started = Instant::now();

        let mut state = match self.load_snapshot(aggregate_id).await {
            Some((seed, sequence)) => self.factory.seeded(seed, sequence),
            None => self.factory.fresh(),
        };

        let rows = self
            .store
            .get_event_stream(aggregate_id, A::AGGREGATE_TYPE, state.sequence())
            .await?;

        let mut highest = state.sequence();
        let mut events: Vec<EventEnvelope<A::Event>> = Vec::with_capacity(rows.len());
        for row in &rows {
            highest = highest.max(row.sequence_number);
            match self.serializer.deserialize::<A::Event>(row) {
                Ok(envelope) => events.push(envelope),
                Err(EngineError::UnknownEventType(event_type)) => {
                    state.mark_unread(row.sequence_number);
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        event_type = %event_type,
                        sequence = row.sequence_number,
                        "Skipping stored event of unknown type"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_unknown_event(&event_type);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let replayed = events.len();
        state.apply_range(order_for_replay(events))?;
        state.observe_sequence(highest);

        if let Some(metrics) = &self.metrics {
            metrics.record_rehydration(A::AGGREGATE_TYPE, started.elapsed().as_secs_f64());
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            from_snapshot = state.seed_sequence(),
            replayed = replayed,
            version = state.sequence(),
            "Rehydrated aggregate"
        );

        Ok(state)
    }

    async fn load_snapshot(&self, aggregate_id: &AggregateId) -> Option<(A, u64)> {
        let snapshot = match self.store.get_snapshot(aggregate_id, A::AGGREGATE_TYPE).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    error = %e,
                    "Snapshot read failed, replaying full stream"
                );
                return None;
            }
        };

        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                stored_type = %snapshot.aggregate_type,
                "Snapshot belongs to another aggregate type, ignoring it"
            );
            return None;
        }

        if snapshot.behavior_type_tag != self.snapshot_behavior.type_tag() {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                stored_tag = %snapshot.behavior_type_tag,
                expected_tag = self.snapshot_behavior.type_tag(),
                "Snapshot built by a different policy, ignoring it"
            );
            return None;
        }

        match self.serializer.deserialize_state::<A>(&snapshot.payload) {
            Ok(seed) => Some((seed, snapshot.sequence_number)),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    error = %e,
                    "Snapshot payload unreadable, replaying full stream"
                );
                None
            }
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Append `events` after the state's current version and apply them.
    ///
    /// Returns the new version. On any error, including a concurrency
    /// conflict, nothing is applied and the caller should rehydrate before
    /// trying again.
    pub async fn commit(
        &self,
        state: &mut AggregateState<A, A::Event>,
        aggregate_id: &AggregateId,
        events: Vec<A::Event>,
        correlation_id: Uuid,
    ) -> EngineResult<u64> {
        if events.is_empty() {
            return Ok(state.sequence());
        }

        for event in &events {
            state.check_handled(event)?;
        }

        let base = state.sequence();
        let envelopes: Vec<EventEnvelope<A::Event>> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| {
                EventEnvelope::new(aggregate_id.clone(), A::AGGREGATE_TYPE, base + 1 + i as u64, event, correlation_id)
            })
            .collect();

        let rows = envelopes
            .iter()
            .map(|envelope| self.serializer.serialize(envelope))
            .collect::<EngineResult<Vec<_>>>()?;

        let count = rows.len();
        let version = match self.store.append_events(aggregate_id, A::AGGREGATE_TYPE, rows).await {
            Ok(version) => version,
            Err(e) => {
                if e.is_concurrency_conflict() {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_conflict(A::AGGREGATE_TYPE);
                    }
                }
                return Err(e);
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_append(A::AGGREGATE_TYPE, count);
        }

        let snapshot_due = envelopes
            .iter()
            .any(|envelope| self.snapshot_behavior.is_snapshot_needed(envelope));

        state.apply_range(envelopes)?;

        if snapshot_due {
            self.take_snapshot(state, aggregate_id).await;
        }

        Ok(version)
    }

    /// Persist a compacted state. Failures are logged and counted, never
    /// returned: the events are already durable.
    async fn take_snapshot(&self, state: &mut AggregateState<A, A::Event>, aggregate_id: &AggregateId) {
        let cut = match self.snapshot_behavior.generate_snapshot(state) {
            Ok(cut) => cut,
            Err(e) => {
                self.snapshot_failed(aggregate_id, "generate", &e);
                return;
            }
        };

        if cut.archived.is_empty() {
            return;
        }

        if let Some(unread) = state.first_unread() {
            if cut.state.sequence() >= unread {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    aggregate_type = A::AGGREGATE_TYPE,
                    covered_sequence = cut.state.sequence(),
                    unread_sequence = unread,
                    "Snapshot would cover an unread event, deferring"
                );
                return;
            }
        }

        let payload = match self.serializer.serialize_state(cut.state.state()) {
            Ok(payload) => payload,
            Err(e) => {
                self.snapshot_failed(aggregate_id, "serialize", &e);
                return;
            }
        };

        let snapshot = Snapshot {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            sequence_number: cut.state.sequence(),
            payload,
            behavior_type_tag: self.snapshot_behavior.type_tag().to_string(),
            snapshot_time: chrono::Utc::now(),
        };

        if let Err(e) = self.store.save_snapshot(snapshot).await {
            self.snapshot_failed(aggregate_id, "save", &e);
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_saved(A::AGGREGATE_TYPE);
        }

        state.compact(&cut.state);

        tracing::info!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            covered_sequence = cut.state.sequence(),
            "Snapshot taken"
        );

        if self.archive_behavior == ArchiveBehavior::Keep {
            return;
        }

        let rows = match cut
            .archived
            .iter()
            .map(|envelope| self.serializer.serialize(envelope))
            .collect::<EngineResult<Vec<_>>>()
        {
            Ok(rows) => rows,
            Err(e) => {
                self.snapshot_failed(aggregate_id, "archive", &e);
                return;
            }
        };

        match self.store.archive_events(&rows, self.archive_behavior).await {
            Ok(count) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_archived(self.archive_behavior.as_str(), count);
                }
            }
            Err(e) => self.snapshot_failed(aggregate_id, "archive", &e),
        }
    }

    fn snapshot_failed(&self, aggregate_id: &AggregateId, stage: &str, error: &EngineError) {
        tracing::warn!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            stage = stage,
            error = %error,
            "Snapshot step failed, events remain authoritative"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_failure(A::AGGREGATE_TYPE, stage);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
