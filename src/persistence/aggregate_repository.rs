// Copyright 2025 Cowboy AI, LLC.

//! Aggregate repository
//!
//! Reconstructs aggregate roots from the event store. The newest eligible
//! snapshot from the [`InMemorySnapshotCache`] is used as a starting point
//! when one exists, and only the events after it are replayed. Roots that
//! needed a long replay are put back into the cache.

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::events::EventError;
use crate::infrastructure::{EventStore, EventStoreError, InMemorySnapshotCache};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No history exists for the requested root
    #[error("Aggregate root not found: {aggregate_type} with id {aggregate_root_id}")]
    AggregateRootNotFound {
        /// Requested aggregate type
        aggregate_type: &'static str,
        /// Requested id
        aggregate_root_id: String,
    },

    /// Error from the underlying event store
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// A stored event lacks required metadata
    #[error("Invalid stored event: {0}")]
    InvalidEvent(#[from] EventError),

    /// Stored history skips or repeats a local sequence number
    #[error(
        "Inconsistent history for aggregate root {aggregate_root_id}: expected sequence number {expected}, found {actual}"
    )]
    InconsistentHistory {
        /// The aggregate root
        aggregate_root_id: String,
        /// Expected sequence number
        expected: i64,
        /// Sequence number found in the store
        actual: i64,
    },

    /// The aggregate refused to apply a stored event
    #[error("Aggregate root {aggregate_root_id} could not apply event {global_sequence_number}")]
    Apply {
        /// The aggregate root
        aggregate_root_id: String,
        /// The event's global sequence number
        global_sequence_number: i64,
        /// The aggregate's error
        #[source]
        source: anyhow::Error,
    },

    /// The creation hook failed
    #[error("Creation hook failed for aggregate root {aggregate_root_id}")]
    CreationHook {
        /// The aggregate root
        aggregate_root_id: String,
        /// The hook's error
        #[source]
        source: anyhow::Error,
    },
}

impl RepositoryError {
    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::AggregateRootNotFound { .. })
    }
}

/// Loads aggregate roots by replaying their history
#[derive(Clone)]
pub struct AggregateRepository {
    event_store: Arc<dyn EventStore>,
    snapshot_cache: Arc<InMemorySnapshotCache>,
    replay_threshold: usize,
}

impl AggregateRepository {
    /// Create a repository; roots whose reconstruction replayed more than
    /// `replay_threshold` events are cached afterwards
    pub fn new(
        event_store: Arc<dyn EventStore>,
        snapshot_cache: Arc<InMemorySnapshotCache>,
        replay_threshold: usize,
    ) -> Self {
        Self {
            event_store,
            snapshot_cache,
            replay_threshold,
        }
    }

    /// The snapshot cache used by this repository
    pub fn snapshot_cache(&self) -> &Arc<InMemorySnapshotCache> {
        &self.snapshot_cache
    }

    /// Load the current state of a root that must exist
    pub async fn get<A: Aggregate>(&self, id: &str) -> Result<AggregateRoot<A>, RepositoryError> {
        self.get_at(id, i64::MAX).await
    }

    /// Load the current state of a root, or `None` if it has no history
    pub async fn try_get<A: Aggregate>(
        &self,
        id: &str,
    ) -> Result<Option<AggregateRoot<A>>, RepositoryError> {
        self.hydrate(id, i64::MAX).await
    }

    /// Load a root as it was after the event at `max_global_sequence_number`
    pub async fn get_at<A: Aggregate>(
        &self,
        id: &str,
        max_global_sequence_number: i64,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        self.hydrate(id, max_global_sequence_number)
            .await?
            .ok_or_else(|| RepositoryError::AggregateRootNotFound {
                aggregate_type: A::AGGREGATE_TYPE,
                aggregate_root_id: id.to_string(),
            })
    }

    /// Point-in-time variant of [`try_get`](Self::try_get)
    pub async fn try_get_at<A: Aggregate>(
        &self,
        id: &str,
        max_global_sequence_number: i64,
    ) -> Result<Option<AggregateRoot<A>>, RepositoryError> {
        self.hydrate(id, max_global_sequence_number).await
    }

    /// Load a root, creating it if it has no history
    ///
    /// A fresh root gets its [`Aggregate::created`] hook invoked; the events
    /// the hook emits become the start of its history once committed, so the
    /// hook never runs again for that id.
    pub async fn load_or_create<A: Aggregate>(
        &self,
        id: &str,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        if let Some(root) = self.hydrate(id, i64::MAX).await? {
            return Ok(root);
        }

        debug!(
            aggregate_root_id = %id,
            aggregate_type = A::AGGREGATE_TYPE,
            "Creating new aggregate root"
        );
        let mut root = AggregateRoot::<A>::new(id);
        A::created(&mut root).map_err(|source| RepositoryError::CreationHook {
            aggregate_root_id: id.to_string(),
            source,
        })?;
        Ok(root)
    }

    /// Whether any event exists for the root
    pub async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        let mut stream = self.event_store.load(id, 0).await?;
        Ok(stream.next().await.transpose()?.is_some())
    }

    async fn hydrate<A: Aggregate>(
        &self,
        id: &str,
        max_global_sequence_number: i64,
    ) -> Result<Option<AggregateRoot<A>>, RepositoryError> {
        let mut root = self
            .snapshot_cache
            .get_clone_from_cache::<A>(id, max_global_sequence_number)
            .unwrap_or_else(|| AggregateRoot::new(id));
        let from_sequence_number = root.current_sequence_number() + 1;

        let mut stream = self.event_store.load(id, from_sequence_number).await?;
        let mut replayed = 0usize;
        while let Some(event) = stream.next().await {
            let event = event?;
            let global_sequence_number = event.global_sequence_number()?;
            if global_sequence_number > max_global_sequence_number {
                break;
            }

            let sequence_number = event.sequence_number()?;
            let expected = root.current_sequence_number() + 1;
            if sequence_number != expected {
                return Err(RepositoryError::InconsistentHistory {
                    aggregate_root_id: id.to_string(),
                    expected,
                    actual: sequence_number,
                });
            }

            root.replay(&event, sequence_number, global_sequence_number)
                .map_err(|source| RepositoryError::Apply {
                    aggregate_root_id: id.to_string(),
                    global_sequence_number,
                    source,
                })?;
            replayed += 1;
        }

        if !root.has_history() {
            return Ok(None);
        }

        trace!(
            aggregate_root_id = %id,
            replayed,
            from_sequence_number,
            "Hydrated aggregate root"
        );

        if replayed > self.replay_threshold {
            self.snapshot_cache.put_clone_to_cache(&root);
        }

        Ok(Some(root))
    }
}

impl fmt::Debug for AggregateRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("event_store", &self.event_store)
            .field("snapshot_cache", &self.snapshot_cache)
            .field("replay_threshold", &self.replay_threshold)
            .finish()
    }
}
