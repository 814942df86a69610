// Copyright 2025 Cowboy AI, LLC.

//! # Persistence Layer
//!
//! Aggregate reconstruction on top of the event store. State is never stored
//! directly; the repository replays history, starting from a cached snapshot
//! when one is available.

pub mod aggregate_repository;

pub use aggregate_repository::{AggregateRepository, RepositoryError};
