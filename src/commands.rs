// Copyright 2025 Cowboy AI, LLC.

//! Commands and the unit of work they execute in
//!
//! A [`Command`] targets one aggregate root and mutates it by emitting
//! events. An [`ExecutableCommand`] is the general form: it runs against a
//! [`UnitOfWork`] and may load several roots, so the batch it produces can
//! span aggregates. The command processor turns every `Command` into an
//! `ExecutableCommand` internally.
//!
//! Roots loaded by a unit of work are owned by it exclusively. A retry after
//! a conflict starts over with a fresh unit of work.

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::events::{DomainEvent, Metadata};
use crate::persistence::{AggregateRepository, RepositoryError};
use async_trait::async_trait;
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// A request to change one aggregate root
pub trait Command: fmt::Debug + Send + Sync {
    /// The aggregate this command targets
    type Aggregate: Aggregate;

    /// Id of the target root; the root is created if it has no history
    fn aggregate_root_id(&self) -> &str;

    /// Mutate the root by emitting events
    fn execute(&self, root: &mut AggregateRoot<Self::Aggregate>) -> anyhow::Result<()>;

    /// Metadata copied onto every event the command emits
    fn meta(&self) -> Metadata {
        Metadata::new()
    }
}

/// A command that may touch several aggregate roots
#[async_trait]
pub trait ExecutableCommand: fmt::Debug + Send + Sync {
    /// Load roots through the unit of work and emit events on them
    async fn execute_in(&self, unit_of_work: &mut UnitOfWork) -> anyhow::Result<()>;

    /// Metadata copied onto every event the command emits
    fn meta(&self) -> Metadata {
        Metadata::new()
    }
}

/// Adapts a single-aggregate [`Command`] to [`ExecutableCommand`]
#[derive(Debug)]
pub(crate) struct SingleAggregate<'a, C>(pub(crate) &'a C);

#[async_trait]
impl<C: Command> ExecutableCommand for SingleAggregate<'_, C> {
    async fn execute_in(&self, unit_of_work: &mut UnitOfWork) -> anyhow::Result<()> {
        let root = unit_of_work
            .load::<C::Aggregate>(self.0.aggregate_root_id())
            .await?;
        self.0.execute(root)
    }

    fn meta(&self) -> Metadata {
        self.0.meta()
    }
}

/// Unit of work errors
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// Loading a root failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A root was loaded twice with different aggregate types
    #[error("Aggregate root {aggregate_root_id} is a {actual}, not a {expected}")]
    TypeMismatch {
        /// The aggregate root
        aggregate_root_id: String,
        /// Requested aggregate type
        expected: &'static str,
        /// Type the root was first loaded as
        actual: &'static str,
    },
}

/// Events emitted on one root, with the sequence number they continue from
#[derive(Debug)]
pub(crate) struct PendingEvents {
    pub(crate) current_sequence_number: i64,
    pub(crate) events: Vec<DomainEvent>,
}

trait LoadedRoot: Any + Send + Sync {
    fn aggregate_type(&self) -> &'static str;
    fn take_pending(&mut self) -> PendingEvents;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: Aggregate> LoadedRoot for AggregateRoot<A> {
    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn take_pending(&mut self) -> PendingEvents {
        PendingEvents {
            current_sequence_number: self.current_sequence_number(),
            events: self.take_uncommitted(),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The roots one command execution works on
pub struct UnitOfWork {
    repository: AggregateRepository,
    roots: IndexMap<String, Box<dyn LoadedRoot>>,
}

impl UnitOfWork {
    /// Start an empty unit of work
    pub fn new(repository: AggregateRepository) -> Self {
        Self {
            repository,
            roots: IndexMap::new(),
        }
    }

    /// Load a root, creating it if it has no history
    ///
    /// Each root is loaded at most once; later calls return the same
    /// in-memory instance, including the events emitted on it so far.
    pub async fn load<A: Aggregate>(
        &mut self,
        id: &str,
    ) -> Result<&mut AggregateRoot<A>, UnitOfWorkError> {
        let loaded = match self.roots.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let root = self.repository.load_or_create::<A>(id).await?;
                entry.insert(Box::new(root) as Box<dyn LoadedRoot>)
            }
        };
        downcast(id, loaded)
    }

    /// Load a root that must already exist
    ///
    /// Fails with [`RepositoryError::AggregateRootNotFound`] when the root
    /// has no history and was not created earlier in this unit of work.
    pub async fn get<A: Aggregate>(
        &mut self,
        id: &str,
    ) -> Result<&mut AggregateRoot<A>, UnitOfWorkError> {
        let loaded = match self.roots.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let root = self.repository.get::<A>(id).await?;
                entry.insert(Box::new(root) as Box<dyn LoadedRoot>)
            }
        };
        downcast(id, loaded)
    }

    /// Load a root if it exists; a missing root is not registered
    pub async fn try_get<A: Aggregate>(
        &mut self,
        id: &str,
    ) -> Result<Option<&mut AggregateRoot<A>>, UnitOfWorkError> {
        let loaded = match self.roots.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.repository.try_get::<A>(id).await? {
                Some(root) => entry.insert(Box::new(root) as Box<dyn LoadedRoot>),
                None => return Ok(None),
            },
        };
        downcast(id, loaded).map(Some)
    }

    /// Number of roots loaded so far
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no root has been loaded
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Drain the emitted events, root by root in first-load order
    pub(crate) fn take_pending(&mut self) -> Vec<PendingEvents> {
        self.roots
            .values_mut()
            .map(|root| root.take_pending())
            .filter(|pending| !pending.events.is_empty())
            .collect()
    }
}

fn downcast<'a, A: Aggregate>(
    id: &str,
    loaded: &'a mut Box<dyn LoadedRoot>,
) -> Result<&'a mut AggregateRoot<A>, UnitOfWorkError> {
    let actual = loaded.aggregate_type();
    loaded
        .as_any_mut()
        .downcast_mut::<AggregateRoot<A>>()
        .ok_or_else(|| UnitOfWorkError::TypeMismatch {
            aggregate_root_id: id.to_string(),
            expected: A::AGGREGATE_TYPE,
            actual,
        })
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .finish()
    }
}
