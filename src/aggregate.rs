// Copyright 2025 Cowboy AI, LLC.

//! Aggregates and aggregate roots
//!
//! An aggregate's state is never stored directly. It is rebuilt by applying
//! its own event history in local sequence order. [`AggregateRoot`] wraps the
//! application state with the bookkeeping the runtime needs: identity, the
//! local sequence number of the last applied event, the global position
//! through which the state is current, and the events emitted but not yet
//! committed.

use crate::events::{metadata_keys, DomainEvent, EventType};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Local sequence number of a root that has no history
pub const NO_SEQUENCE_NUMBER: i64 = -1;

/// Application state that is rebuilt from events
///
/// # Example
///
/// ```rust
/// use cim_event_sourcing::{Aggregate, AggregateRoot, DomainEvent, EventType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Counter {
///     value: i64,
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct Incremented {
///     by: i64,
/// }
///
/// impl EventType for Incremented {
///     const EVENT_TYPE: &'static str = "Incremented";
/// }
///
/// impl Aggregate for Counter {
///     const AGGREGATE_TYPE: &'static str = "Counter";
///
///     fn apply(&mut self, event: &DomainEvent) -> anyhow::Result<()> {
///         if let Some(e) = event.decode::<Incremented>() {
///             self.value += e?.by;
///         }
///         Ok(())
///     }
/// }
///
/// let mut root = AggregateRoot::<Counter>::new("counter-1");
/// root.emit(&Incremented { by: 2 }).unwrap();
/// assert_eq!(root.state().value, 2);
/// assert_eq!(root.uncommitted_events().len(), 1);
/// ```
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name recorded on emitted events and snapshot entries
    const AGGREGATE_TYPE: &'static str;

    /// Apply one event to the state
    fn apply(&mut self, event: &DomainEvent) -> anyhow::Result<()>;

    /// Creation hook, invoked exactly once when a root with no history is
    /// first created. Events emitted here become the start of its history.
    fn created(root: &mut AggregateRoot<Self>) -> anyhow::Result<()> {
        let _ = root;
        Ok(())
    }
}

/// An aggregate's state plus its event-sourcing bookkeeping
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    current_sequence_number: i64,
    global_sequence_number_cutoff: i64,
    uncommitted: Vec<DomainEvent>,
    state: A,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a root with no history
    pub fn new(id: impl Into<String>) -> Self {
        Self::from_parts(id.into(), NO_SEQUENCE_NUMBER, NO_SEQUENCE_NUMBER, A::default())
    }

    pub(crate) fn from_parts(
        id: String,
        current_sequence_number: i64,
        global_sequence_number_cutoff: i64,
        state: A,
    ) -> Self {
        Self {
            id,
            current_sequence_number,
            global_sequence_number_cutoff,
            uncommitted: Vec::new(),
            state,
        }
    }

    /// Aggregate root id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local sequence number of the last applied committed event
    pub fn current_sequence_number(&self) -> i64 {
        self.current_sequence_number
    }

    /// Global sequence number through which the state reflects committed events
    pub fn global_sequence_number_cutoff(&self) -> i64 {
        self.global_sequence_number_cutoff
    }

    /// Whether any committed event has been applied
    pub fn has_history(&self) -> bool {
        self.current_sequence_number > NO_SEQUENCE_NUMBER
    }

    /// Application state
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Events emitted since the root was loaded
    pub fn uncommitted_events(&self) -> &[DomainEvent] {
        &self.uncommitted
    }

    /// Emit a typed event: apply it to the state and buffer it for commit
    pub fn emit<E: EventType>(&mut self, event: &E) -> anyhow::Result<()> {
        self.emit_event(DomainEvent::from_typed(event)?)
    }

    /// Emit an untyped event
    pub fn emit_event(&mut self, mut event: DomainEvent) -> anyhow::Result<()> {
        let meta = event.meta_mut();
        meta.insert(metadata_keys::AGGREGATE_ROOT_ID, self.id.clone());
        meta.insert(metadata_keys::ROOT_TYPE, A::AGGREGATE_TYPE);

        self.state.apply(&event)?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Apply a committed event during replay
    pub(crate) fn replay(
        &mut self,
        event: &DomainEvent,
        sequence_number: i64,
        global_sequence_number: i64,
    ) -> anyhow::Result<()> {
        self.state.apply(event)?;
        self.current_sequence_number = sequence_number;
        self.global_sequence_number_cutoff = global_sequence_number;
        Ok(())
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.uncommitted)
    }
}
