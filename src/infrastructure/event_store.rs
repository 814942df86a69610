// Copyright 2025 Cowboy AI, LLC.

//! Event store contract
//!
//! The event store is the durable, append-only, totally ordered log. It is
//! also the single serialization point for writers: uniqueness of
//! `(aggregate_root_id, seq)` and of `global_seq` is enforced here, and a
//! violation is reported as [`SaveOutcome::Conflict`] so callers can retry.

use crate::events::{DomainEvent, EventError};
use crate::infrastructure::batch_validation::BatchIntegrityError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with the event store
///
/// A uniqueness violation is not an error; see [`SaveOutcome::Conflict`].
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Failed to reach the underlying storage
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The batch failed the integrity check
    #[error(transparent)]
    Integrity(#[from] BatchIntegrityError),

    /// Event metadata could not be read
    #[error("Invalid event data: {0}")]
    InvalidEventData(#[from] EventError),

    /// General storage operation failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Which uniqueness constraint a conflicting batch hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// `(aggregate_root_id, seq)` already exists
    AggregateSequence {
        /// The aggregate root
        aggregate_root_id: String,
        /// The taken local sequence number
        sequence_number: i64,
    },
    /// `global_seq` already exists
    GlobalSequence {
        /// The taken global sequence number
        global_sequence_number: i64,
    },
}

/// Details of an optimistic concurrency conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Concurrency conflict saving batch {batch_id}: {kind}")]
pub struct ConcurrencyConflict {
    /// The rejected batch
    pub batch_id: Uuid,
    /// The violated constraint
    pub kind: ConflictKind,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::AggregateSequence {
                aggregate_root_id,
                sequence_number,
            } => write!(
                f,
                "aggregate root {aggregate_root_id} already has sequence number {sequence_number}"
            ),
            ConflictKind::GlobalSequence {
                global_sequence_number,
            } => write!(f, "global sequence number {global_sequence_number} is taken"),
        }
    }
}

/// Result of [`EventStore::save`]
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Every event was committed; carries the events exactly as stored
    Committed(Vec<DomainEvent>),
    /// Nothing was committed because a uniqueness constraint was hit
    Conflict(ConcurrencyConflict),
}

impl SaveOutcome {
    /// Whether the batch was rejected by a uniqueness constraint
    pub fn is_conflict(&self) -> bool {
        matches!(self, SaveOutcome::Conflict(_))
    }
}

/// Ordered stream of stored events
pub type EventStream = BoxStream<'static, Result<DomainEvent, EventStoreError>>;

/// Event store trait for persisting and retrieving events
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    /// Atomically commit a batch. Either every event is stored or none is.
    ///
    /// Implementations allocate the batch's global sequence numbers inside
    /// the same critical section (transaction) as the uniqueness check, stamp
    /// `batch_id`, validate the batch and return the stored events.
    async fn save(
        &self,
        batch_id: Uuid,
        events: Vec<DomainEvent>,
    ) -> Result<SaveOutcome, EventStoreError>;

    /// Events of one aggregate root with local sequence number >= `from_sequence_number`,
    /// in local sequence order
    async fn load(
        &self,
        aggregate_root_id: &str,
        from_sequence_number: i64,
    ) -> Result<EventStream, EventStoreError>;

    /// All events with global sequence number >= `from_global_sequence_number`,
    /// in strictly increasing global order without gaps
    async fn stream(&self, from_global_sequence_number: i64) -> Result<EventStream, EventStoreError>;

    /// The global sequence number the next committed event will receive
    async fn next_global_sequence_number(&self) -> Result<i64, EventStoreError>;
}
