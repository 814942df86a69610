// Copyright 2025 Cowboy AI, LLC.

//! Domain events and their metadata
//!
//! A [`DomainEvent`] is an immutable fact: an event type tag, a JSON payload
//! and a string-to-string [`Metadata`] map that records which aggregate root
//! emitted it and where it sits in the per-aggregate and global orderings.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Type tag of the universal ancestor shared by every event
pub const ALL_EVENTS: &str = "DomainEvent";

/// Type tag of the composite pseudo-event produced by batch dispatch
pub const EVENT_BATCH: &str = "DomainEventBatch";

/// Well-known metadata keys
pub mod metadata_keys {
    /// Id of the aggregate root that emitted the event
    pub const AGGREGATE_ROOT_ID: &str = "aggregate_root_id";
    /// Local (per-aggregate) sequence number
    pub const SEQUENCE_NUMBER: &str = "seq";
    /// Global sequence number
    pub const GLOBAL_SEQUENCE_NUMBER: &str = "global_seq";
    /// Id of the batch the event was committed in
    pub const BATCH_ID: &str = "batch_id";
    /// Time the event was numbered for commit (RFC 3339)
    pub const TIME_UTC: &str = "time_utc";
    /// Aggregate type of the emitting root
    pub const ROOT_TYPE: &str = "root_type";
}

/// Errors raised when reading or building events
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A required metadata key is absent
    #[error("Event {event_type} has no '{key}' metadata")]
    MissingMetadata {
        /// Type tag of the event
        event_type: String,
        /// The missing key
        key: &'static str,
    },

    /// A metadata value could not be parsed
    #[error("Event {event_type} has invalid '{key}' metadata: {value}")]
    InvalidMetadata {
        /// Type tag of the event
        event_type: String,
        /// The offending key
        key: &'static str,
        /// The raw value
        value: String,
    },

    /// Payload (de)serialization failed
    #[error("Payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Key-value metadata attached to every event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a value, replacing any previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` whose key is not already present
    pub fn merge(&mut self, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over all entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "\"{key}\": \"{value}\"")?;
            first = false;
        }
        Ok(())
    }
}

/// Trait for strongly typed event payloads
pub trait EventType: Serialize + DeserializeOwned {
    /// Type tag stored on the event
    const EVENT_TYPE: &'static str;
}

/// An immutable domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_type: String,
    payload: serde_json::Value,
    meta: Metadata,
}

impl DomainEvent {
    /// Create an event from a type tag and a raw payload
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            meta: Metadata::new(),
        }
    }

    /// Create an event from a typed payload
    pub fn from_typed<E: EventType>(event: &E) -> Result<Self, EventError> {
        Ok(Self::new(E::EVENT_TYPE, serde_json::to_value(event)?))
    }

    /// Build the composite pseudo-event used when a view manager dispatches a
    /// whole batch at once. It carries the metadata of the last event so that
    /// position bookkeeping sees the batch's highest global sequence number.
    pub fn batch(events: &[DomainEvent]) -> Result<Self, EventError> {
        let meta = events.last().map(|e| e.meta.clone()).unwrap_or_default();
        Ok(Self {
            event_type: EVENT_BATCH.to_string(),
            payload: serde_json::to_value(events)?,
            meta,
        })
    }

    /// Unpack the events of a batch pseudo-event
    pub fn batch_events(&self) -> Option<Result<Vec<DomainEvent>, EventError>> {
        if self.event_type != EVENT_BATCH {
            return None;
        }
        Some(serde_json::from_value(self.payload.clone()).map_err(EventError::from))
    }

    /// Attach metadata, builder style
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key, value);
        self
    }

    /// Type tag
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Raw payload
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Metadata
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }

    /// Decode the payload as `E` if the type tag matches
    pub fn decode<E: EventType>(&self) -> Option<Result<E, EventError>> {
        if self.event_type != E::EVENT_TYPE {
            return None;
        }
        Some(serde_json::from_value(self.payload.clone()).map_err(EventError::from))
    }

    /// Id of the emitting aggregate root
    pub fn aggregate_root_id(&self) -> Result<&str, EventError> {
        self.meta
            .get(metadata_keys::AGGREGATE_ROOT_ID)
            .ok_or_else(|| self.missing(metadata_keys::AGGREGATE_ROOT_ID))
    }

    /// Local sequence number
    pub fn sequence_number(&self) -> Result<i64, EventError> {
        self.parse_i64(metadata_keys::SEQUENCE_NUMBER)
    }

    /// Global sequence number
    pub fn global_sequence_number(&self) -> Result<i64, EventError> {
        self.parse_i64(metadata_keys::GLOBAL_SEQUENCE_NUMBER)
    }

    /// Batch id
    pub fn batch_id(&self) -> Result<Uuid, EventError> {
        let raw = self
            .meta
            .get(metadata_keys::BATCH_ID)
            .ok_or_else(|| self.missing(metadata_keys::BATCH_ID))?;
        Uuid::parse_str(raw).map_err(|_| self.invalid(metadata_keys::BATCH_ID, raw))
    }

    /// Time the event was numbered for commit
    pub fn time_utc(&self) -> Result<DateTime<Utc>, EventError> {
        let raw = self
            .meta
            .get(metadata_keys::TIME_UTC)
            .ok_or_else(|| self.missing(metadata_keys::TIME_UTC))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| self.invalid(metadata_keys::TIME_UTC, raw))
    }

    fn parse_i64(&self, key: &'static str) -> Result<i64, EventError> {
        let raw = self.meta.get(key).ok_or_else(|| self.missing(key))?;
        raw.parse().map_err(|_| self.invalid(key, raw))
    }

    fn missing(&self, key: &'static str) -> EventError {
        EventError::MissingMetadata {
            event_type: self.event_type.clone(),
            key,
        }
    }

    fn invalid(&self, key: &'static str, value: &str) -> EventError {
        EventError::InvalidMetadata {
            event_type: self.event_type.clone(),
            key,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meta.get(metadata_keys::GLOBAL_SEQUENCE_NUMBER) {
            Some(seq) => write!(f, "{}({seq})", self.event_type),
            None => write!(f, "{}(?)", self.event_type),
        }
    }
}
