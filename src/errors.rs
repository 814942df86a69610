// Copyright 2025 Cowboy AI, LLC.

//! Error types for command processing

use crate::commands::UnitOfWorkError;
use crate::infrastructure::{BatchIntegrityError, ConcurrencyConflict, EventStoreError};
use crate::persistence::RepositoryError;
use thiserror::Error;

/// Why a command could not be processed
#[derive(Debug, Error)]
pub enum CommandFailure {
    /// The command or an aggregate rejected the change
    #[error("Command execution failed: {0}")]
    Execution(#[source] anyhow::Error),

    /// An aggregate root could not be loaded
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The event store failed
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// The numbered batch is inconsistent; never retried
    #[error("Batch integrity violation: {0}")]
    Integrity(#[from] BatchIntegrityError),

    /// Every attempt hit a concurrency conflict
    #[error("Retries exhausted: {0}")]
    Conflict(#[from] ConcurrencyConflict),
}

impl CommandFailure {
    /// Classify an error returned from command execution
    pub(crate) fn from_execution(err: anyhow::Error) -> Self {
        match err.downcast::<UnitOfWorkError>() {
            Ok(UnitOfWorkError::Repository(e)) => CommandFailure::Repository(e),
            Ok(other) => CommandFailure::Execution(other.into()),
            Err(err) => CommandFailure::Execution(err),
        }
    }
}

/// A command failed for good
#[derive(Debug, Error)]
#[error("Command {command} failed after {attempts} attempt(s): {cause}")]
pub struct CommandProcessingError {
    /// `Debug` rendering of the failed command
    pub command: String,
    /// Number of attempts made
    pub attempts: u32,
    /// The final cause
    #[source]
    pub cause: CommandFailure,
}

impl CommandProcessingError {
    /// Check if retries were exhausted by concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self.cause, CommandFailure::Conflict(_))
    }

    /// Check if the batch failed integrity validation
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self.cause,
            CommandFailure::Integrity(_)
                | CommandFailure::EventStore(EventStoreError::Integrity(_))
        )
    }

    /// Check if a required aggregate root does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(&self.cause, CommandFailure::Repository(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ConflictKind;
    use uuid::Uuid;

    #[test]
    fn test_error_names_command_and_cause() {
        let err = CommandProcessingError {
            command: "Deposit { amount: 5 }".to_string(),
            attempts: 11,
            cause: CommandFailure::Conflict(ConcurrencyConflict {
                batch_id: Uuid::nil(),
                kind: ConflictKind::GlobalSequence {
                    global_sequence_number: 3,
                },
            }),
        };

        let text = err.to_string();
        assert!(text.contains("Deposit { amount: 5 }"));
        assert!(text.contains("11 attempt(s)"));
        assert!(err.is_conflict());
        assert!(!err.is_integrity_violation());
    }

    #[test]
    fn test_repository_errors_are_unwrapped_from_execution() {
        let not_found = RepositoryError::AggregateRootNotFound {
            aggregate_type: "Counter",
            aggregate_root_id: "c".to_string(),
        };
        let err = anyhow::Error::from(UnitOfWorkError::Repository(not_found));

        let failure = CommandFailure::from_execution(err);

        assert!(matches!(failure, CommandFailure::Repository(_)));
    }

    #[test]
    fn test_other_errors_stay_execution_failures() {
        let failure = CommandFailure::from_execution(anyhow::anyhow!("insufficient funds"));

        assert!(matches!(failure, CommandFailure::Execution(_)));
        assert_eq!(
            failure.to_string(),
            "Command execution failed: insufficient funds"
        );
    }
}
