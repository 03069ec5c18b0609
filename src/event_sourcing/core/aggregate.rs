use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::errors::{EngineError, EngineResult};
use super::event::{DomainEvent, EventEnvelope, EventVariant};

// ============================================================================
// Aggregate State Machine - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly)
// 2. Handlers are pure folds: no I/O, no side effects
// 3. Dispatch is by event type tag, one handler per tag
// 4. The sequence cursor records how far the stream has been replayed
//
// ============================================================================

type Handler<S, E> = Arc<dyn Fn(&mut S, &E) + Send + Sync>;

/// What to do with an event whose type has no registered handler.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UnhandledEventPolicy {
    /// Skip it. Old consumers stay compatible with newly added event types.
    #[default]
    Skip,
    /// Refuse it with a configuration error.
    Reject,
}

/// Event type tag -> handler dispatch table.
pub struct HandlerRegistry<S, E> {
    handlers: HashMap<&'static str, Handler<S, E>>,
    policy: UnhandledEventPolicy,
}

impl<S, E> Clone for HandlerRegistry<S, E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
            policy: self.policy,
        }
    }
}

impl<S, E> Default for HandlerRegistry<S, E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            policy: UnhandledEventPolicy::default(),
        }
    }
}

impl<S, E> fmt::Debug for HandlerRegistry<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &tags)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S: 'static, E: 'static> HandlerRegistry<S, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: UnhandledEventPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: UnhandledEventPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> UnhandledEventPolicy {
        self.policy
    }

    /// Register a handler for a raw event type tag.
    pub fn register_handler<F>(&mut self, event_type: &'static str, handler: F) -> EngineResult<()>
    where
        F: Fn(&mut S, &E) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(event_type) {
            return Err(EngineError::Configuration(format!(
                "handler for {event_type} registered twice"
            )));
        }
        self.handlers.insert(event_type, Arc::new(handler));
        Ok(())
    }

    /// Register a handler against one concrete event kind.
    pub fn on<V>(&mut self, handler: fn(&mut S, &V)) -> EngineResult<&mut Self>
    where
        V: EventVariant<E>,
    {
        self.register_handler(V::EVENT_TYPE, move |state: &mut S, event: &E| {
            if let Some(payload) = V::extract(event) {
                handler(state, payload);
            }
        })?;
        Ok(self)
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    fn get(&self, event_type: &str) -> Option<&Handler<S, E>> {
        self.handlers.get(event_type)
    }
}

// ============================================================================
// Aggregate State
// ============================================================================

/// Mutable projection owned by exactly one aggregate instance.
///
/// Besides the folded state it keeps the seed it started from (fresh or a
/// snapshot) and the events applied since then, so a snapshot policy can
/// rebuild a compacted state without touching storage.
pub struct AggregateState<S, E> {
    state: S,
    seed: S,
    seed_sequence: u64,
    sequence: u64,
    handlers: Arc<HandlerRegistry<S, E>>,
    history: Vec<EventEnvelope<E>>,
    // Lowest stored sequence that was seen but could not be read
    first_unread: Option<u64>,
}

impl<S: Clone, E: Clone> Clone for AggregateState<S, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            seed: self.seed.clone(),
            seed_sequence: self.seed_sequence,
            sequence: self.sequence,
            handlers: self.handlers.clone(),
            history: self.history.clone(),
            first_unread: self.first_unread,
        }
    }
}

impl<S: fmt::Debug, E> fmt::Debug for AggregateState<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateState")
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("seed_sequence", &self.seed_sequence)
            .field("buffered_events", &self.history.len())
            .finish()
    }
}

impl<S, E> AggregateState<S, E>
where
    S: Clone + 'static,
    E: DomainEvent,
{
    pub fn new(initial: S, handlers: Arc<HandlerRegistry<S, E>>) -> Self {
        Self::from_seed(initial, 0, handlers)
    }

    /// Start from a state that already covers `sequence` events.
    pub fn from_seed(seed: S, sequence: u64, handlers: Arc<HandlerRegistry<S, E>>) -> Self {
        Self {
            state: seed.clone(),
            seed,
            seed_sequence: sequence,
            sequence,
            handlers,
            history: Vec::new(),
            first_unread: None,
        }
    }

    /// Fresh instance of the same state type starting from this one's seed.
    pub fn fork_from_seed(&self) -> Self {
        Self::from_seed(self.seed.clone(), self.seed_sequence, self.handlers.clone())
    }

    pub fn register_handler<F>(&mut self, event_type: &'static str, handler: F) -> EngineResult<()>
    where
        F: Fn(&mut S, &E) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers).register_handler(event_type, handler)
    }

    /// Fail early when the strict policy would refuse this event.
    pub fn check_handled(&self, event: &E) -> EngineResult<()> {
        let event_type = event.event_type();
        if self.handlers.policy() == UnhandledEventPolicy::Reject && !self.handlers.handles(event_type) {
            return Err(EngineError::Configuration(format!("no handler registered for {event_type}")));
        }
        Ok(())
    }

    /// Apply one event.
    ///
    /// Events without a handler are skipped under the default policy; the
    /// cursor still advances because the event was observed.
    pub fn apply(&mut self, envelope: EventEnvelope<E>) -> EngineResult<()> {
        match self.handlers.get(envelope.event_data.event_type()) {
            Some(handler) => handler(&mut self.state, &envelope.event_data),
            None => {
                self.check_handled(&envelope.event_data)?;
                tracing::debug!(
                    event_type = %envelope.event_type,
                    sequence = envelope.sequence_number,
                    "No handler registered, skipping event"
                );
            }
        }

        self.sequence = self.sequence.max(envelope.sequence_number);
        self.history.push(envelope);
        Ok(())
    }

    /// Apply an ordered batch. Callers sort with `order_for_replay` first.
    pub fn apply_range<I>(&mut self, events: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = EventEnvelope<E>>,
    {
        for envelope in events {
            self.apply(envelope)?;
        }
        Ok(())
    }

    /// Move the cursor to a sequence that was observed but not applied.
    pub fn observe_sequence(&mut self, sequence: u64) {
        self.sequence = self.sequence.max(sequence);
    }

    /// Record a stored event that was observed but not read. Snapshots must
    /// stay below it so a reader that knows its type can still replay it.
    pub fn mark_unread(&mut self, sequence: u64) {
        self.first_unread = Some(self.first_unread.map_or(sequence, |s| s.min(sequence)));
    }

    pub fn first_unread(&self) -> Option<u64> {
        self.first_unread
    }

    /// Adopt a compacted state as the new seed and drop the events it covers.
    pub fn compact(&mut self, compacted: &AggregateState<S, E>) {
        let covered = compacted.sequence;
        self.seed = compacted.state.clone();
        self.seed_sequence = covered;
        let folded: Vec<_> = compacted.history.iter().map(|e| e.event_id).collect();
        self.history.retain(|e| !folded.contains(&e.event_id));
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn seed_sequence(&self) -> u64 {
        self.seed_sequence
    }

    /// Events applied since the seed, in application order.
    pub fn history(&self) -> &[EventEnvelope<E>] {
        &self.history
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry<S, E>> {
        &self.handlers
    }
}

// ============================================================================
// State Factory
// ============================================================================

/// Explicit constructor capability for a state type plus its handlers.
pub struct StateFactory<S, E> {
    create: Arc<dyn Fn() -> S + Send + Sync>,
    handlers: Arc<HandlerRegistry<S, E>>,
}

impl<S, E> Clone for StateFactory<S, E> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            handlers: self.handlers.clone(),
        }
    }
}

impl<S, E> StateFactory<S, E>
where
    S: Clone + 'static,
    E: DomainEvent,
{
    pub fn new<F>(create: F, handlers: HandlerRegistry<S, E>) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            create: Arc::new(create),
            handlers: Arc::new(handlers),
        }
    }

    pub fn fresh(&self) -> AggregateState<S, E> {
        AggregateState::new((self.create)(), self.handlers.clone())
    }

    pub fn seeded(&self, seed: S, sequence: u64) -> AggregateState<S, E> {
        AggregateState::from_seed(seed, sequence, self.handlers.clone())
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry<S, E>> {
        &self.handlers
    }
}

// ============================================================================
// Aggregate Trait - command side of a domain aggregate
// ============================================================================

/// Generic Aggregate trait - all event-sourced aggregates implement this
///
/// Type Parameters:
/// - `Event`: The domain event type for this aggregate
/// - `Command`: The command type for this aggregate
/// - `Error`: The error type for business rule violations
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const AGGREGATE_TYPE: &'static str;

    type Event: DomainEvent;
    type Command;
    type Error;

    /// Wire one handler per event kind.
    fn register_handlers(registry: &mut HandlerRegistry<Self, Self::Event>) -> EngineResult<()>;

    /// Handle command and emit events (business logic)
    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn state_factory(policy: UnhandledEventPolicy) -> EngineResult<StateFactory<Self, Self::Event>> {
        let mut registry = HandlerRegistry::new().with_policy(policy);
        Self::register_handlers(&mut registry)?;
        Ok(StateFactory::new(Self::default, registry))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::event::AggregateId;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    #[serde(tag = "type", content = "data")]
    enum CounterEvent {
        Added(Added),
        Reset,
        Renamed(String),
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Added {
        amount: i64,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Added(_) => "Added",
                CounterEvent::Reset => "Reset",
                CounterEvent::Renamed(_) => "Renamed",
            }
        }

        fn known_event_types() -> &'static [&'static str] {
            &["Added", "Reset", "Renamed"]
        }
    }

    impl EventVariant<CounterEvent> for Added {
        const EVENT_TYPE: &'static str = "Added";

        fn extract(event: &CounterEvent) -> Option<&Self> {
            match event {
                CounterEvent::Added(e) => Some(e),
                _ => None,
            }
        }
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
    struct Counter {
        total: i64,
        applied: u32,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "Counter";
        type Event = CounterEvent;
        type Command = i64;
        type Error = String;

        fn register_handlers(registry: &mut HandlerRegistry<Self, Self::Event>) -> EngineResult<()> {
            registry.on::<Added>(|state, e| state.total += e.amount)?;
            Ok(())
        }

        fn handle_command(&self, amount: &i64) -> Result<Vec<CounterEvent>, String> {
            if *amount == 0 {
                return Err("nothing to add".to_string());
            }
            Ok(vec![CounterEvent::Added(Added { amount: *amount })])
        }
    }

    fn registry(policy: UnhandledEventPolicy) -> HandlerRegistry<Counter, CounterEvent> {
        let mut registry = HandlerRegistry::<Counter, CounterEvent>::new().with_policy(policy);
        registry
            .on::<Added>(|state, e| {
                state.total += e.amount;
                state.applied += 1;
            })
            .unwrap();
        registry
            .register_handler("Reset", |state: &mut Counter, _| {
                state.total = 0;
                state.applied += 1;
            })
            .unwrap();
        registry
    }

    fn envelope(seq: u64, event: CounterEvent) -> EventEnvelope<CounterEvent> {
        EventEnvelope::new(AggregateId::new("c1"), "Counter", seq, event, Uuid::new_v4())
    }

    fn stream() -> Vec<EventEnvelope<CounterEvent>> {
        vec![
            envelope(1, CounterEvent::Added(Added { amount: 5 })),
            envelope(2, CounterEvent::Added(Added { amount: 7 })),
            envelope(3, CounterEvent::Reset),
            envelope(4, CounterEvent::Added(Added { amount: 2 })),
        ]
    }

    #[test]
    fn test_initial_state() {
        let state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Skip)));
        assert_eq!(state.sequence(), 0);
        assert_eq!(state.state(), &Counter::default());
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_apply_range_folds_and_tracks_sequence() {
        let mut state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Skip)));
        state.apply_range(stream()).unwrap();

        assert_eq!(state.state().total, 2);
        assert_eq!(state.state().applied, 4);
        assert_eq!(state.sequence(), 4);
        assert_eq!(state.history().len(), 4);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let handlers = Arc::new(registry(UnhandledEventPolicy::Skip));

        let mut first = AggregateState::new(Counter::default(), handlers.clone());
        first.apply_range(stream()).unwrap();
        drop(first);

        let mut second = AggregateState::new(Counter::default(), handlers.clone());
        second.apply_range(stream()).unwrap();

        let mut once = AggregateState::new(Counter::default(), handlers);
        once.apply_range(stream()).unwrap();

        assert_eq!(
            serde_json::to_string(second.state()).unwrap(),
            serde_json::to_string(once.state()).unwrap()
        );
        assert_eq!(second.sequence(), once.sequence());
    }

    #[test]
    fn test_duplicate_registration_is_configuration_error() {
        let mut registry = registry(UnhandledEventPolicy::Skip);
        let err = registry.on::<Added>(|_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let mut state = AggregateState::new(Counter::default(), Arc::new(registry));
        let err = state.register_handler("Reset", |_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(state.register_handler("Renamed", |_, _| {}).is_ok());
    }

    #[test]
    fn test_unhandled_event_is_skipped_but_observed() {
        let mut state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Skip)));
        state.apply(envelope(1, CounterEvent::Added(Added { amount: 3 }))).unwrap();
        state.apply(envelope(2, CounterEvent::Renamed("x".to_string()))).unwrap();

        assert_eq!(state.state().total, 3);
        assert_eq!(state.state().applied, 1);
        assert_eq!(state.sequence(), 2);
    }

    #[test]
    fn test_strict_policy_rejects_unhandled_event() {
        let mut state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Reject)));
        let err = state.apply(envelope(1, CounterEvent::Renamed("x".to_string()))).unwrap_err();

        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(state.sequence(), 0);
        assert!(state.check_handled(&CounterEvent::Reset).is_ok());
    }

    #[test]
    fn test_sequence_never_moves_backwards() {
        let mut state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Skip)));
        state.apply(envelope(5, CounterEvent::Reset)).unwrap();
        state.apply(envelope(0, CounterEvent::Added(Added { amount: 1 }))).unwrap();
        assert_eq!(state.sequence(), 5);
    }

    #[test]
    fn test_compact_moves_seed_and_trims_history() {
        let handlers = Arc::new(registry(UnhandledEventPolicy::Skip));
        let events = stream();

        let mut live = AggregateState::new(Counter::default(), handlers);
        live.apply_range(events.clone()).unwrap();

        let mut compacted = live.fork_from_seed();
        compacted.apply_range(events[..2].to_vec()).unwrap();
        live.compact(&compacted);

        assert_eq!(live.seed_sequence(), 2);
        assert_eq!(live.history().len(), 2);
        assert_eq!(live.fork_from_seed().state().total, 12);
        assert_eq!(live.state().total, 2);
    }

    #[test]
    fn test_first_unread_keeps_lowest() {
        let mut state = AggregateState::new(Counter::default(), Arc::new(registry(UnhandledEventPolicy::Skip)));
        assert_eq!(state.first_unread(), None);

        state.mark_unread(6);
        state.mark_unread(3);
        state.mark_unread(9);
        assert_eq!(state.first_unread(), Some(3));
        assert_eq!(state.clone().first_unread(), Some(3));
    }

    #[test]
    fn test_state_factory_for_aggregate() {
        let factory = Counter::state_factory(UnhandledEventPolicy::Skip).unwrap();
        let mut state = factory.fresh();
        let events = state.state().handle_command(&4).unwrap();
        for (i, e) in events.into_iter().enumerate() {
            state.apply(envelope(i as u64 + 1, e)).unwrap();
        }

        assert_eq!(state.state().total, 4);
        assert!(factory.handlers().handles("Added"));
        assert!(!factory.handlers().handles("Reset"));
        assert_eq!(factory.seeded(Counter { total: 9, applied: 0 }, 3).sequence(), 3);
    }
}
