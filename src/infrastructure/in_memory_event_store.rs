// Copyright 2025 Cowboy AI, LLC.

//! In-memory event store
//!
//! Reference adapter for the [`EventStore`] contract. The write lock is the
//! transaction: global sequence allocation, both uniqueness checks and the
//! append happen while it is held, so concurrent writers serialize here.

use crate::events::metadata_keys;
use crate::events::DomainEvent;
use crate::infrastructure::batch_validation::validate_batch_integrity;
use crate::infrastructure::event_store::{
    ConcurrencyConflict, ConflictKind, EventStore, EventStoreError, EventStream, SaveOutcome,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Log {
    /// Index == global sequence number
    events: Vec<DomainEvent>,
    /// Per aggregate: global sequence numbers, index == local sequence number
    by_aggregate: HashMap<String, Vec<usize>>,
}

/// Event store that keeps the whole log in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events
    pub async fn len(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Whether nothing has been committed
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(
        &self,
        batch_id: Uuid,
        mut events: Vec<DomainEvent>,
    ) -> Result<SaveOutcome, EventStoreError> {
        if events.is_empty() {
            return Ok(SaveOutcome::Committed(events));
        }

        let mut log = self.log.write().await;

        let first_global = log.events.len() as i64;
        for (offset, event) in events.iter_mut().enumerate() {
            let meta = event.meta_mut();
            meta.insert(
                metadata_keys::GLOBAL_SEQUENCE_NUMBER,
                (first_global + offset as i64).to_string(),
            );
            meta.insert(metadata_keys::BATCH_ID, batch_id.to_string());
        }

        validate_batch_integrity(batch_id, &events)?;

        let mut next_in_batch: HashMap<&str, i64> = HashMap::new();
        for event in &events {
            let aggregate_root_id = event.aggregate_root_id()?;
            let sequence_number = event.sequence_number()?;
            let stored = log
                .by_aggregate
                .get(aggregate_root_id)
                .map_or(0, |seqs| seqs.len() as i64);
            let expected = *next_in_batch.entry(aggregate_root_id).or_insert(stored);

            if sequence_number < stored {
                debug!(
                    batch_id = %batch_id,
                    aggregate_root_id = %aggregate_root_id,
                    sequence_number,
                    "Rejecting batch: sequence number already taken"
                );
                return Ok(SaveOutcome::Conflict(ConcurrencyConflict {
                    batch_id,
                    kind: ConflictKind::AggregateSequence {
                        aggregate_root_id: aggregate_root_id.to_string(),
                        sequence_number,
                    },
                }));
            }
            if sequence_number != expected {
                return Err(EventStoreError::StorageError(format!(
                    "batch {batch_id} would leave a gap in aggregate root {aggregate_root_id}: \
                     expected sequence number {expected}, got {sequence_number}"
                )));
            }
            next_in_batch.insert(aggregate_root_id, expected + 1);
        }

        for event in &events {
            let aggregate_root_id = event.aggregate_root_id()?.to_string();
            let index = log.events.len();
            log.by_aggregate.entry(aggregate_root_id).or_default().push(index);
            log.events.push(event.clone());
        }

        debug!(
            batch_id = %batch_id,
            first_global_sequence_number = first_global,
            count = events.len(),
            "Committed batch"
        );

        Ok(SaveOutcome::Committed(events))
    }

    async fn load(
        &self,
        aggregate_root_id: &str,
        from_sequence_number: i64,
    ) -> Result<EventStream, EventStoreError> {
        let log = self.log.read().await;
        let from = from_sequence_number.max(0) as usize;
        let events: Vec<DomainEvent> = log
            .by_aggregate
            .get(aggregate_root_id)
            .map(|indexes| {
                indexes
                    .iter()
                    .skip(from)
                    .map(|&i| log.events[i].clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(tokio_stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn stream(&self, from_global_sequence_number: i64) -> Result<EventStream, EventStoreError> {
        let log = self.log.read().await;
        let from = from_global_sequence_number.max(0) as usize;
        let events: Vec<DomainEvent> = log.events.iter().skip(from).cloned().collect();

        Ok(tokio_stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn next_global_sequence_number(&self) -> Result<i64, EventStoreError> {
        Ok(self.log.read().await.events.len() as i64)
    }
}
