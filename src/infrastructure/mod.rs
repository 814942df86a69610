// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer
//!
//! This module contains the storage-facing concerns:
//! - The event store contract and its in-memory adapter
//! - Batch integrity validation
//! - The value-scored snapshot cache

/// Pre-commit sequence numbering checks
pub mod batch_validation;
pub mod event_store;
pub mod in_memory_event_store;
pub mod snapshot_cache;

pub use batch_validation::{validate_batch_integrity, BatchIntegrityError};
pub use event_store::{
    ConcurrencyConflict, ConflictKind, EventStore, EventStoreError, EventStream, SaveOutcome,
};
pub use in_memory_event_store::InMemoryEventStore;
pub use snapshot_cache::{InMemorySnapshotCache, SnapshotError};
