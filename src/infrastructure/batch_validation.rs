// Copyright 2025 Cowboy AI, LLC.

//! Batch integrity validation
//!
//! Checks that a numbered batch is internally consistent before it is
//! committed: global sequence numbers are consecutive in batch order, and
//! each aggregate's local sequence numbers are consecutive starting from the
//! lowest one it has in the batch. A failure here is a bug in sequence
//! assignment and is never retried.

use crate::events::{metadata_keys, DomainEvent};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Integrity violations found in a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchIntegrityError {
    /// An event lacks a required metadata key or has an unparsable value
    #[error("Batch {batch_id} contains event #{index} without a valid '{key}'")]
    MissingMetadata {
        /// The batch
        batch_id: Uuid,
        /// Position of the event in the batch
        index: usize,
        /// The key
        key: &'static str,
    },

    /// Global sequence numbers are not consecutive
    #[error(
        "Batch {batch_id} has non-sequential global sequence numbers: expected {expected}, found {actual} (batch: {sequence:?})"
    )]
    NonSequentialGlobalSequence {
        /// The batch
        batch_id: Uuid,
        /// Expected global sequence number
        expected: i64,
        /// Actual global sequence number
        actual: i64,
        /// All global sequence numbers of the batch, in order
        sequence: Vec<i64>,
    },

    /// An aggregate's local sequence numbers are not consecutive
    #[error(
        "Batch {batch_id} has non-sequential sequence numbers for aggregate root {aggregate_root_id}: expected {expected}, found {actual}"
    )]
    NonSequentialSequence {
        /// The batch
        batch_id: Uuid,
        /// The aggregate root
        aggregate_root_id: String,
        /// Expected local sequence number
        expected: i64,
        /// Actual local sequence number
        actual: i64,
    },
}

struct Numbers<'a> {
    aggregate_root_id: &'a str,
    sequence_number: i64,
    global_sequence_number: i64,
}

/// Validate the sequence numbering of a batch about to be committed
pub fn validate_batch_integrity(
    batch_id: Uuid,
    events: &[DomainEvent],
) -> Result<(), BatchIntegrityError> {
    let numbers = events
        .iter()
        .enumerate()
        .map(|(index, e)| read_numbers(batch_id, index, e))
        .collect::<Result<Vec<_>, _>>()?;

    let Some(first) = numbers.first() else {
        return Ok(());
    };

    let mut expected_sequence: HashMap<&str, i64> = HashMap::new();
    for n in &numbers {
        expected_sequence
            .entry(n.aggregate_root_id)
            .and_modify(|min| *min = (*min).min(n.sequence_number))
            .or_insert(n.sequence_number);
    }

    let mut expected_global = first.global_sequence_number;
    for n in &numbers {
        if n.global_sequence_number != expected_global {
            return Err(BatchIntegrityError::NonSequentialGlobalSequence {
                batch_id,
                expected: expected_global,
                actual: n.global_sequence_number,
                sequence: numbers.iter().map(|n| n.global_sequence_number).collect(),
            });
        }

        let expected = expected_sequence
            .entry(n.aggregate_root_id)
            .or_insert(n.sequence_number);
        if n.sequence_number != *expected {
            return Err(BatchIntegrityError::NonSequentialSequence {
                batch_id,
                aggregate_root_id: n.aggregate_root_id.to_string(),
                expected: *expected,
                actual: n.sequence_number,
            });
        }

        *expected += 1;
        expected_global += 1;
    }

    Ok(())
}

fn read_numbers(
    batch_id: Uuid,
    index: usize,
    event: &DomainEvent,
) -> Result<Numbers<'_>, BatchIntegrityError> {
    let missing = |key| BatchIntegrityError::MissingMetadata {
        batch_id,
        index,
        key,
    };

    Ok(Numbers {
        aggregate_root_id: event
            .aggregate_root_id()
            .map_err(|_| missing(metadata_keys::AGGREGATE_ROOT_ID))?,
        sequence_number: event
            .sequence_number()
            .map_err(|_| missing(metadata_keys::SEQUENCE_NUMBER))?,
        global_sequence_number: event
            .global_sequence_number()
            .map_err(|_| missing(metadata_keys::GLOBAL_SEQUENCE_NUMBER))?,
    })
}
