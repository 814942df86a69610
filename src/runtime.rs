// Copyright 2025 Cowboy AI, LLC.

//! Runtime wiring
//!
//! [`EventSourcingRuntime`] assembles the event store, snapshot cache,
//! repository, command processor and view dispatcher from a
//! [`RuntimeConfig`].

use crate::clock::{Clock, SystemClock};
use crate::command_processor::{CommandProcessingResult, CommandProcessor, EventDispatcher};
use crate::commands::{Command, ExecutableCommand};
use crate::config::{ConfigError, RuntimeConfig};
use crate::errors::CommandProcessingError;
use crate::infrastructure::{EventStore, InMemoryEventStore, InMemorySnapshotCache};
use crate::persistence::AggregateRepository;
use crate::projections::{
    ConsistencyMode, NullProfiler, ViewContext, ViewDispatchError, ViewManager,
    ViewManagerEventDispatcher, ViewManagerProfiler, ViewWaitError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A fully wired event-sourcing runtime
#[derive(Debug)]
pub struct EventSourcingRuntime {
    config: RuntimeConfig,
    event_store: Arc<dyn EventStore>,
    snapshot_cache: Arc<InMemorySnapshotCache>,
    repository: AggregateRepository,
    processor: CommandProcessor,
    views: Arc<ViewManagerEventDispatcher>,
}

impl EventSourcingRuntime {
    /// Start assembling a runtime
    pub fn builder(config: RuntimeConfig) -> EventSourcingRuntimeBuilder {
        EventSourcingRuntimeBuilder {
            config,
            event_store: None,
            clock: None,
            profiler: None,
            context: ViewContext::new(),
            view_managers: Vec::new(),
        }
    }

    /// Catch all view managers up and start background dispatch
    pub async fn start(&self, purge_views: bool) -> Result<(), ViewDispatchError> {
        self.views.initialize(purge_views).await
    }

    /// Process a single-aggregate command
    pub async fn process_command<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        self.processor.process_command(command).await
    }

    /// Process a multi-aggregate command
    pub async fn process_executable(
        &self,
        command: &dyn ExecutableCommand,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        self.processor.process_executable(command).await
    }

    /// Wait until every view manager has seen the command's events
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), ViewWaitError> {
        self.views.wait_until_processed(result, timeout).await
    }

    /// Stop background dispatch
    pub async fn shutdown(&self) {
        self.views.shutdown().await;
    }

    /// The configuration in use
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The event store
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    /// The snapshot cache
    pub fn snapshot_cache(&self) -> &Arc<InMemorySnapshotCache> {
        &self.snapshot_cache
    }

    /// The aggregate repository
    pub fn repository(&self) -> &AggregateRepository {
        &self.repository
    }

    /// The view dispatcher
    pub fn views(&self) -> &Arc<ViewManagerEventDispatcher> {
        &self.views
    }
}

/// Builder for [`EventSourcingRuntime`]
pub struct EventSourcingRuntimeBuilder {
    config: RuntimeConfig,
    event_store: Option<Arc<dyn EventStore>>,
    clock: Option<Arc<dyn Clock>>,
    profiler: Option<Arc<dyn ViewManagerProfiler>>,
    context: ViewContext,
    view_managers: Vec<(Arc<dyn ViewManager>, ConsistencyMode)>,
}

impl EventSourcingRuntimeBuilder {
    /// Use this event store instead of a fresh [`InMemoryEventStore`]
    pub fn event_store(mut self, event_store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(event_store);
        self
    }

    /// Use this clock instead of the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report view dispatch timings to this profiler
    pub fn profiler(mut self, profiler: Arc<dyn ViewManagerProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Context passed to view locators
    pub fn view_context(mut self, context: ViewContext) -> Self {
        self.context = context;
        self
    }

    /// Register a view manager
    pub fn view_manager(mut self, manager: Arc<dyn ViewManager>, mode: ConsistencyMode) -> Self {
        self.view_managers.push((manager, mode));
        self
    }

    /// Validate the configuration and wire everything together
    pub fn build(self) -> Result<EventSourcingRuntime, ConfigError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let event_store = self
            .event_store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let snapshot_cache = Arc::new(InMemorySnapshotCache::with_clock(
            self.config.snapshots.approximate_max_entries,
            clock.clone(),
        ));
        let repository = AggregateRepository::new(
            event_store.clone(),
            snapshot_cache.clone(),
            self.config.snapshots.replay_threshold,
        );

        let mut views = ViewManagerEventDispatcher::new(event_store.clone(), self.config.views.clone())
            .with_context(self.context)
            .with_profiler(self.profiler.unwrap_or_else(|| Arc::new(NullProfiler)));
        for (manager, mode) in self.view_managers {
            views = views.with_view_manager(manager, mode);
        }
        let views = Arc::new(views);

        let processor = CommandProcessor::new(
            repository.clone(),
            event_store.clone(),
            self.config.command_processing.max_retries,
        )
        .with_clock(clock)
        .with_dispatcher(views.clone() as Arc<dyn EventDispatcher>);

        info!(
            max_retries = self.config.command_processing.max_retries,
            snapshot_entries = self.config.snapshots.approximate_max_entries,
            "Event sourcing runtime assembled"
        );

        Ok(EventSourcingRuntime {
            config: self.config,
            event_store,
            snapshot_cache,
            repository,
            processor,
            views,
        })
    }
}
