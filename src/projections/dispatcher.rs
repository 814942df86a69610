// Copyright 2025 Cowboy AI, LLC.

//! Catch-up dispatch
//!
//! [`ViewManagerEventDispatcher`] feeds committed events to its view
//! managers in global order. Each manager is registered with a
//! [`ConsistencyMode`]:
//!
//! - `Immediate` managers are brought up to date before the command that
//!   committed the batch returns.
//! - `Eventual` managers are caught up by one background task each, woken by
//!   local commits and by an idle poll that picks up commits made by other
//!   processes.
//!
//! A batch contiguous with a manager's position is delivered directly;
//! otherwise the manager reads the missing range from the event store.
//! Dispatch per manager is serialized by a per-manager async mutex.

use crate::command_processor::{CommandProcessingResult, EventDispatcher};
use crate::config::ViewConfig;
use crate::events::DomainEvent;
use crate::infrastructure::EventStore;
use crate::projections::locator::ViewContext;
use crate::projections::profiler::{NullProfiler, ViewManagerProfiler};
use crate::projections::view_manager::{ViewDispatchError, ViewManager};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// When a view manager sees committed events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Updated before the committing command returns
    Immediate,
    /// Updated in the background
    Eventual,
}

/// Errors while waiting for views to catch up
#[derive(Debug, Error)]
pub enum ViewWaitError {
    /// No manager with this id is registered
    #[error("Unknown view manager: {0}")]
    UnknownViewManager(String),

    /// The manager stopped before reaching the target
    #[error("View manager {view_manager} stopped at position {position}, before {target}")]
    Stopped {
        /// The view manager
        view_manager: String,
        /// Its position
        position: i64,
        /// The awaited position
        target: i64,
    },

    /// The timeout elapsed
    #[error("Timed out waiting for view manager {view_manager}: at {position}, waiting for {target}")]
    Timeout {
        /// The lagging view manager
        view_manager: String,
        /// Its position
        position: i64,
        /// The awaited position
        target: i64,
    },
}

struct Registration {
    manager: Arc<dyn ViewManager>,
    mode: ConsistencyMode,
    gate: Mutex<()>,
    signal: Notify,
}

struct Shared {
    event_store: Arc<dyn EventStore>,
    context: ViewContext,
    profiler: Arc<dyn ViewManagerProfiler>,
    config: ViewConfig,
}

impl Shared {
    /// Bring a manager up to the end of the log. Caller holds its gate.
    async fn catch_up(&self, manager: &dyn ViewManager) -> Result<(), ViewDispatchError> {
        loop {
            if manager.is_stopped() {
                return Err(ViewDispatchError::Stopped {
                    view_manager: manager.id().to_string(),
                });
            }

            let from = manager.position() + 1;
            let chunk: Vec<DomainEvent> = self
                .event_store
                .stream(from)
                .await?
                .take(self.config.max_items_per_batch)
                .try_collect()
                .await?;
            if chunk.is_empty() {
                return Ok(());
            }

            debug!(
                view_manager = %manager.id(),
                from,
                count = chunk.len(),
                "Catching up view manager"
            );
            let full = chunk.len() == self.config.max_items_per_batch;
            manager
                .dispatch(&self.context, &chunk, self.profiler.as_ref())
                .await?;
            if !full {
                return Ok(());
            }
        }
    }

    /// Deliver a committed batch, falling back to catch-up when it is not
    /// contiguous with the manager's position
    async fn deliver(
        &self,
        registration: &Registration,
        events: &[DomainEvent],
    ) -> Result<(), ViewDispatchError> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(());
        };
        let first = first.global_sequence_number().map_err(|source| {
            ViewDispatchError::InvalidEvent {
                view_manager: registration.manager.id().to_string(),
                source,
            }
        })?;
        let last = last.global_sequence_number().map_err(|source| {
            ViewDispatchError::InvalidEvent {
                view_manager: registration.manager.id().to_string(),
                source,
            }
        })?;

        let _gate = registration.gate.lock().await;
        let manager = registration.manager.as_ref();
        let position = manager.position();
        if position >= last {
            Ok(())
        } else if position + 1 == first {
            manager
                .dispatch(&self.context, events, self.profiler.as_ref())
                .await
        } else {
            self.catch_up(manager).await
        }
    }
}

/// Feeds committed events to view managers
pub struct ViewManagerEventDispatcher {
    shared: Arc<Shared>,
    registrations: Vec<Arc<Registration>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewManagerEventDispatcher {
    /// Create a dispatcher with no view managers
    pub fn new(event_store: Arc<dyn EventStore>, config: ViewConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                event_store,
                context: ViewContext::new(),
                profiler: Arc::new(NullProfiler),
                config,
            }),
            registrations: Vec::new(),
            started: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace shared settings; only possible before the dispatcher is shared
    fn shared_mut(&mut self) -> Option<&mut Shared> {
        Arc::get_mut(&mut self.shared)
    }

    /// Use this context for every dispatch
    pub fn with_context(mut self, context: ViewContext) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.context = context;
        }
        self
    }

    /// Report dispatch timings to this profiler
    pub fn with_profiler(mut self, profiler: Arc<dyn ViewManagerProfiler>) -> Self {
        if let Some(shared) = self.shared_mut() {
            shared.profiler = profiler;
        }
        self
    }

    /// Register a view manager
    pub fn with_view_manager(mut self, manager: Arc<dyn ViewManager>, mode: ConsistencyMode) -> Self {
        self.registrations.push(Arc::new(Registration {
            manager,
            mode,
            gate: Mutex::new(()),
            signal: Notify::new(),
        }));
        self
    }

    /// Registered view managers
    pub fn view_managers(&self) -> impl Iterator<Item = &Arc<dyn ViewManager>> {
        self.registrations.iter().map(|r| &r.manager)
    }

    /// Look up a view manager by id
    pub fn view_manager(&self, id: &str) -> Option<&Arc<dyn ViewManager>> {
        self.registration(id).map(|r| &r.manager)
    }

    fn registration(&self, id: &str) -> Option<&Arc<Registration>> {
        self.registrations.iter().find(|r| r.manager.id() == id)
    }

    /// Catch every manager up from the store, optionally purging first, and
    /// start the background tasks of eventually consistent managers
    ///
    /// A manager that fails here is left stopped; the others are still
    /// initialized and the first error is returned.
    pub async fn initialize(&self, purge: bool) -> Result<(), ViewDispatchError> {
        let mut first_error = None;
        for registration in &self.registrations {
            let _gate = registration.gate.lock().await;
            let manager = registration.manager.as_ref();
            if purge {
                manager.purge().await;
            }
            if let Err(err) = self.shared.catch_up(manager).await {
                warn!(view_manager = %manager.id(), error = %err, "View manager failed to initialize");
                first_error.get_or_insert(err);
            }
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            self.spawn_background_tasks().await;
        }
        info!(view_managers = self.registrations.len(), purge, "View dispatcher initialized");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn spawn_background_tasks(&self) {
        let idle = self.shared.config.idle_poll_interval();
        let mut tasks = self.tasks.lock().await;
        for registration in &self.registrations {
            if registration.mode != ConsistencyMode::Eventual {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let registration = Arc::clone(registration);
            let mut shutdown = self.shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = registration.signal.notified() => {}
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }

                    let manager = registration.manager.as_ref();
                    if manager.is_stopped() {
                        continue;
                    }
                    let _gate = registration.gate.lock().await;
                    if let Err(err) = shared.catch_up(manager).await {
                        warn!(view_manager = %manager.id(), error = %err, "Background catch-up failed");
                    }
                }
                debug!(view_manager = %registration.manager.id(), "Background catch-up stopped");
            }));
        }
    }

    /// Wait until every view manager has processed the command's events
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), ViewWaitError> {
        let Some(target) = result.new_position else {
            return Ok(());
        };
        let managers: Vec<&dyn ViewManager> =
            self.registrations.iter().map(|r| r.manager.as_ref()).collect();
        self.wait_for_position(&managers, target, timeout).await
    }

    /// Wait until one view manager has processed the command's events
    pub async fn wait_for_view(
        &self,
        view_manager_id: &str,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<(), ViewWaitError> {
        let registration = self
            .registration(view_manager_id)
            .ok_or_else(|| ViewWaitError::UnknownViewManager(view_manager_id.to_string()))?;
        let Some(target) = result.new_position else {
            return Ok(());
        };
        self.wait_for_position(&[registration.manager.as_ref()], target, timeout)
            .await
    }

    async fn wait_for_position(
        &self,
        managers: &[&dyn ViewManager],
        target: i64,
        timeout: Duration,
    ) -> Result<(), ViewWaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let lagging = managers.iter().find(|m| m.position() < target);
            let Some(manager) = lagging else {
                return Ok(());
            };

            let position = manager.position();
            if manager.is_stopped() {
                return Err(ViewWaitError::Stopped {
                    view_manager: manager.id().to_string(),
                    position,
                    target,
                });
            }
            if Instant::now() >= deadline {
                return Err(ViewWaitError::Timeout {
                    view_manager: manager.id().to_string(),
                    position,
                    target,
                });
            }
            tokio::time::sleep(self.shared.config.wait_poll_interval()).await;
        }
    }

    /// Operator recovery: purge a manager and rebuild it from the log
    pub async fn purge_and_replay(&self, view_manager_id: &str) -> Result<(), ViewDispatchError> {
        let registration = self.registration(view_manager_id).ok_or_else(|| {
            ViewDispatchError::UnknownViewManager(view_manager_id.to_string())
        })?;
        let _gate = registration.gate.lock().await;
        let manager = registration.manager.as_ref();

        info!(view_manager = %view_manager_id, "Purging and replaying view manager");
        manager.purge().await;
        self.shared.catch_up(manager).await
    }

    /// Stop the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        // Receivers may already be gone
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background catch-up task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl EventDispatcher for ViewManagerEventDispatcher {
    async fn dispatch(&self, events: &[DomainEvent]) {
        for registration in &self.registrations {
            match registration.mode {
                ConsistencyMode::Immediate => {
                    if let Err(err) = self.shared.deliver(registration, events).await {
                        warn!(
                            view_manager = %registration.manager.id(),
                            error = %err,
                            "Immediate view dispatch failed"
                        );
                    }
                }
                ConsistencyMode::Eventual => registration.signal.notify_one(),
            }
        }
    }
}

impl fmt::Debug for ViewManagerEventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let managers: Vec<(&str, ConsistencyMode)> = self
            .registrations
            .iter()
            .map(|r| (r.manager.id(), r.mode))
            .collect();
        f.debug_struct("ViewManagerEventDispatcher")
            .field("view_managers", &managers)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_hierarchy::EventTypeHierarchy;
    use crate::events::metadata_keys;
    use crate::infrastructure::{InMemoryEventStore, SaveOutcome};
    use crate::projections::locator::GlobalInstanceLocator;
    use crate::projections::view_manager::{
        InMemoryViewManager, Subscriptions, TypedViewManager, View,
    };
    use uuid::Uuid;

    #[derive(Debug, Clone, Default)]
    struct Tally {
        count: u32,
    }

    impl View for Tally {
        fn subscriptions(subscriptions: &mut Subscriptions<Self>) {
            subscriptions.on_all(|view: &mut Tally, event| {
                anyhow::ensure!(event.event_type() != "Poison", "poisoned");
                view.count += 1;
                Ok(())
            });
        }
    }

    fn tally(id: &str) -> Arc<InMemoryViewManager<Tally>> {
        Arc::new(InMemoryViewManager::new(
            id,
            Arc::new(GlobalInstanceLocator),
            Arc::new(EventTypeHierarchy::flat()),
        ))
    }

    async fn commit(store: &InMemoryEventStore, event_type: &str, root: &str, seq: i64) -> Vec<DomainEvent> {
        let event = DomainEvent::new(event_type, serde_json::Value::Null)
            .with_meta(metadata_keys::AGGREGATE_ROOT_ID, root)
            .with_meta(metadata_keys::SEQUENCE_NUMBER, seq.to_string());
        match store.save(Uuid::new_v4(), vec![event]).await.unwrap() {
            SaveOutcome::Committed(events) => events,
            SaveOutcome::Conflict(c) => panic!("unexpected conflict: {c}"),
        }
    }

    fn result_at(position: i64) -> CommandProcessingResult {
        CommandProcessingResult {
            batch_id: None,
            new_position: Some(position),
            attempts: 1,
            events: Vec::new(),
        }
    }

    fn config() -> ViewConfig {
        ViewConfig {
            max_items_per_batch: 2,
            wait_poll_interval_ms: 5,
            idle_poll_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_initialize_catches_up_in_chunks() {
        let store = Arc::new(InMemoryEventStore::new());
        for seq in 0..5 {
            commit(&store, "E", "a", seq).await;
        }
        let view = tally("tally");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Immediate);

        dispatcher.initialize(false).await.unwrap();

        assert_eq!(view.position(), 4);
        assert_eq!(view.load("__global__").await.unwrap().state.count, 5);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_immediate_manager_fills_gaps_from_store() {
        let store = Arc::new(InMemoryEventStore::new());
        let view = tally("tally");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Immediate);

        // committed elsewhere, never dispatched locally
        commit(&store, "E", "a", 0).await;
        let local = commit(&store, "E", "a", 1).await;
        dispatcher.dispatch(&local).await;

        assert_eq!(view.position(), 1);
        assert_eq!(view.load("__global__").await.unwrap().state.count, 2);
        dispatcher
            .wait_until_processed(&result_at(1), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_eventual_manager_catches_up_in_background() {
        let store = Arc::new(InMemoryEventStore::new());
        let view = tally("eventual");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Eventual);
        dispatcher.initialize(false).await.unwrap();

        let events = commit(&store, "E", "a", 0).await;
        dispatcher.dispatch(&events).await;

        dispatcher
            .wait_for_view("eventual", &result_at(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(view.load("__global__").await.unwrap().state.count, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiting_reports_timeouts_stops_and_unknown_managers() {
        let store = Arc::new(InMemoryEventStore::new());
        let view = tally("tally");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Immediate);

        let timeout = dispatcher
            .wait_until_processed(&result_at(3), Duration::from_millis(20))
            .await;
        assert!(matches!(timeout, Err(ViewWaitError::Timeout { position: -1, target: 3, .. })));

        let poison = commit(&store, "Poison", "a", 0).await;
        dispatcher.dispatch(&poison).await;
        let stopped = dispatcher
            .wait_until_processed(&result_at(0), Duration::from_millis(20))
            .await;
        assert!(matches!(stopped, Err(ViewWaitError::Stopped { .. })));

        let unknown = dispatcher
            .wait_for_view("nope", &result_at(0), Duration::from_millis(20))
            .await;
        assert!(matches!(unknown, Err(ViewWaitError::UnknownViewManager(_))));
    }

    #[tokio::test]
    async fn test_purge_and_replay_rebuilds_view() {
        let store = Arc::new(InMemoryEventStore::new());
        let view = tally("tally");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Immediate);
        for seq in 0..3 {
            let events = commit(&store, "E", "a", seq).await;
            dispatcher.dispatch(&events).await;
        }
        let before = view.load("__global__").await.unwrap();

        dispatcher.purge_and_replay("tally").await.unwrap();

        let after = view.load("__global__").await.unwrap();
        assert_eq!(after.state.count, before.state.count);
        assert_eq!(after.last_global_sequence_number, before.last_global_sequence_number);
        assert_eq!(view.position(), 2);
    }

    #[tokio::test]
    async fn test_purge_and_replay_rejects_unknown_manager() {
        let store = Arc::new(InMemoryEventStore::new());
        let view = tally("tally");
        let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
            .with_view_manager(view.clone(), ConsistencyMode::Immediate);
        let events = commit(&store, "E", "a", 0).await;
        dispatcher.dispatch(&events).await;

        let err = dispatcher.purge_and_replay("does-not-exist").await.unwrap_err();

        assert!(matches!(err, ViewDispatchError::UnknownViewManager(ref id) if id == "does-not-exist"));
        assert_eq!(view.position(), 0);
    }
}
