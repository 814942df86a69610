// Copyright 2025 Cowboy AI, LLC.

//! Command processing
//!
//! Each invocation runs the same control loop:
//!
//! 1. open a fresh [`UnitOfWork`] and execute the command in it
//! 2. number the emitted events (local sequence numbers continue each root's
//!    history, global ones continue from the store's next position)
//! 3. validate the batch
//! 4. save it
//!
//! A [`SaveOutcome::Conflict`] discards everything and restarts from step 1,
//! up to `max_retries` times. Committed batches are handed to every
//! registered [`EventDispatcher`].

use crate::clock::{Clock, SystemClock};
use crate::commands::{Command, ExecutableCommand, PendingEvents, SingleAggregate, UnitOfWork};
use crate::errors::{CommandFailure, CommandProcessingError};
use crate::events::{metadata_keys, DomainEvent, Metadata};
use crate::infrastructure::{
    validate_batch_integrity, ConcurrencyConflict, EventStore, SaveOutcome,
};
use crate::persistence::AggregateRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Receives every committed batch
#[async_trait]
pub trait EventDispatcher: Send + Sync + fmt::Debug {
    /// Called once per committed batch, in commit order per processor
    async fn dispatch(&self, events: &[DomainEvent]);
}

/// Outcome of a processed command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandProcessingResult {
    /// Id of the committed batch, `None` if the command emitted nothing
    pub batch_id: Option<Uuid>,
    /// Global sequence number of the last committed event
    pub new_position: Option<i64>,
    /// Attempts it took, 1 when there was no conflict
    pub attempts: u32,
    /// The events as stored
    pub events: Vec<DomainEvent>,
}

impl CommandProcessingResult {
    /// Number of committed events
    pub fn events_committed(&self) -> usize {
        self.events.len()
    }
}

enum Attempt {
    Committed(Option<Uuid>, Vec<DomainEvent>),
    Conflict(ConcurrencyConflict),
}

/// Executes commands against aggregates and commits their events
pub struct CommandProcessor {
    repository: AggregateRepository,
    event_store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    dispatchers: Vec<Arc<dyn EventDispatcher>>,
}

impl CommandProcessor {
    /// Create a processor
    pub fn new(
        repository: AggregateRepository,
        event_store: Arc<dyn EventStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            repository,
            event_store,
            clock: Arc::new(SystemClock),
            max_retries,
            dispatchers: Vec::new(),
        }
    }

    /// Use the given clock for the `time_utc` metadata
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a receiver of committed batches
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Maximum number of retries after a conflict
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Process a single-aggregate command
    pub async fn process_command<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        self.process(&SingleAggregate(command), format!("{command:?}"))
            .await
    }

    /// Process a command that may touch several aggregates
    pub async fn process_executable(
        &self,
        command: &dyn ExecutableCommand,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        self.process(command, format!("{command:?}")).await
    }

    async fn process(
        &self,
        command: &dyn ExecutableCommand,
        description: String,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = self.attempt(command).await.map_err(|cause| {
                debug!(command = %description, attempts, error = %cause, "Command failed");
                CommandProcessingError {
                    command: description.clone(),
                    attempts,
                    cause,
                }
            })?;

            match outcome {
                Attempt::Committed(batch_id, events) => {
                    for dispatcher in &self.dispatchers {
                        dispatcher.dispatch(&events).await;
                    }
                    let new_position = events
                        .last()
                        .and_then(|e| e.global_sequence_number().ok());
                    return Ok(CommandProcessingResult {
                        batch_id,
                        new_position,
                        attempts,
                        events,
                    });
                }
                Attempt::Conflict(conflict) if attempts > self.max_retries => {
                    warn!(
                        command = %description,
                        attempts,
                        conflict = %conflict,
                        "Giving up on command after repeated conflicts"
                    );
                    return Err(CommandProcessingError {
                        command: description,
                        attempts,
                        cause: CommandFailure::Conflict(conflict),
                    });
                }
                Attempt::Conflict(conflict) => {
                    debug!(
                        command = %description,
                        attempts,
                        conflict = %conflict,
                        "Retrying command after conflict"
                    );
                }
            }
        }
    }

    async fn attempt(&self, command: &dyn ExecutableCommand) -> Result<Attempt, CommandFailure> {
        let mut unit_of_work = UnitOfWork::new(self.repository.clone());
        command
            .execute_in(&mut unit_of_work)
            .await
            .map_err(CommandFailure::from_execution)?;

        let pending = unit_of_work.take_pending();
        if pending.is_empty() {
            return Ok(Attempt::Committed(None, Vec::new()));
        }

        let batch_id = Uuid::new_v4();
        let next_global = self.event_store.next_global_sequence_number().await?;
        let events = number_batch(
            batch_id,
            pending,
            next_global,
            self.clock.now(),
            &command.meta(),
        );
        validate_batch_integrity(batch_id, &events)?;

        match self.event_store.save(batch_id, events).await? {
            SaveOutcome::Committed(stored) => Ok(Attempt::Committed(Some(batch_id), stored)),
            SaveOutcome::Conflict(conflict) => Ok(Attempt::Conflict(conflict)),
        }
    }
}

impl fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("repository", &self.repository)
            .field("max_retries", &self.max_retries)
            .field("dispatchers", &self.dispatchers)
            .finish()
    }
}

/// Assign sequence numbers and commit metadata to the emitted events
///
/// The global numbers are provisional; the store allocates the final ones
/// when it commits.
pub(crate) fn number_batch(
    batch_id: Uuid,
    pending: Vec<PendingEvents>,
    next_global_sequence_number: i64,
    now: DateTime<Utc>,
    command_meta: &Metadata,
) -> Vec<DomainEvent> {
    let time_utc = now.to_rfc3339();
    let mut global = next_global_sequence_number;
    let mut batch = Vec::new();

    for root in pending {
        for (offset, mut event) in root.events.into_iter().enumerate() {
            let meta = event.meta_mut();
            meta.insert(
                metadata_keys::SEQUENCE_NUMBER,
                (root.current_sequence_number + 1 + offset as i64).to_string(),
            );
            meta.insert(metadata_keys::GLOBAL_SEQUENCE_NUMBER, global.to_string());
            meta.insert(metadata_keys::BATCH_ID, batch_id.to_string());
            meta.insert(metadata_keys::TIME_UTC, time_utc.as_str());
            meta.merge(command_meta);
            global += 1;
            batch.push(event);
        }
    }

    batch
}
