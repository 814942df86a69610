// Copyright 2025 Cowboy AI, LLC.

//! # CIM Event Sourcing
//!
//! An event-sourcing runtime for the Composable Information Machine.
//!
//! State changes are recorded as an immutable, totally ordered log of domain
//! events. Aggregate state is never stored; it is rebuilt by replaying an
//! aggregate's history, starting from a cached snapshot where possible.
//! Views are kept consistent with the log by ordered catch-up dispatch.
//!
//! - **Event store**: append-only log with atomic batch commits and
//!   storage-level optimistic concurrency ([`EventStore`], [`SaveOutcome`])
//! - **Aggregates**: [`Aggregate`] state wrapped in an [`AggregateRoot`],
//!   loaded through the [`AggregateRepository`]
//! - **Snapshots**: the value-scored [`InMemorySnapshotCache`]
//! - **Commands**: [`Command`] and [`ExecutableCommand`], run by the
//!   [`CommandProcessor`] with bounded retry on conflict
//! - **Views**: [`View`]s held by [`ViewManager`]s and fed by the
//!   [`ViewManagerEventDispatcher`]
//!
//! ## Guarantees
//!
//! 1. Per-aggregate sequence numbers are contiguous from 0
//! 2. Global sequence numbers are unique and strictly increasing
//! 3. A batch commits completely or not at all
//! 4. A view manager's position never moves backward
//! 5. A snapshot looked up for position P never reflects events after P

#![warn(missing_docs)]

pub mod aggregate;
pub mod clock;
pub mod command_processor;
pub mod commands;
pub mod config;
pub mod errors;
pub mod event_hierarchy;
pub mod events;
pub mod infrastructure;
pub mod persistence;
pub mod projections;
pub mod runtime;

pub use aggregate::{Aggregate, AggregateRoot, NO_SEQUENCE_NUMBER};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command_processor::{CommandProcessingResult, CommandProcessor, EventDispatcher};
pub use commands::{Command, ExecutableCommand, UnitOfWork, UnitOfWorkError};
pub use config::{CommandProcessingConfig, ConfigError, RuntimeConfig, SnapshotConfig, ViewConfig};
pub use errors::{CommandFailure, CommandProcessingError};
pub use event_hierarchy::{EventTypeDecl, EventTypeHierarchy, HierarchyError};
pub use events::{metadata_keys, DomainEvent, EventError, EventType, Metadata, ALL_EVENTS, EVENT_BATCH};
pub use infrastructure::{
    validate_batch_integrity, BatchIntegrityError, ConcurrencyConflict, ConflictKind, EventStore,
    EventStoreError, EventStream, InMemoryEventStore, InMemorySnapshotCache, SaveOutcome,
    SnapshotError,
};
pub use persistence::{AggregateRepository, RepositoryError};
pub use projections::{
    ConsistencyMode, GlobalInstanceLocator, HandlerViewLocator, InMemoryViewManager,
    InstancePerAggregateRootLocator, NullProfiler, RecordingProfiler, Subscriptions,
    TypedViewManager, View, ViewContext, ViewDispatchError, ViewInstance, ViewLocator,
    ViewManager, ViewManagerEventDispatcher, ViewManagerProfiler, ViewWaitError, ViewsUpdated,
};
pub use runtime::{EventSourcingRuntime, EventSourcingRuntimeBuilder};
