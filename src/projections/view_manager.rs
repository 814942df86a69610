// Copyright 2025 Cowboy AI, LLC.

//! View managers
//!
//! A view manager owns the instances of one kind of view and a position
//! watermark: the highest global sequence number it has fully dispatched.
//! Dispatch for one manager must never run concurrently with itself; the
//! [`ViewManagerEventDispatcher`](crate::projections::ViewManagerEventDispatcher)
//! serializes it.
//!
//! Dispatch is transactional. Handlers run on copies of the touched views and
//! the copies replace the stored instances only if every event of the batch
//! was applied. A failing handler stops the manager instead; it stays stopped
//! until it is purged and replayed, because skipping the event would leave
//! the views silently wrong.

use crate::event_hierarchy::EventTypeHierarchy;
use crate::events::{DomainEvent, EventError, EventType, ALL_EVENTS};
use crate::infrastructure::EventStoreError;
use crate::projections::dispatch_table::DispatchTable;
use crate::projections::locator::{ViewContext, ViewLocator};
use crate::projections::profiler::ViewManagerProfiler;
use async_trait::async_trait;
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

/// Position of a view manager that has dispatched nothing
pub const NO_POSITION: i64 = -1;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// View dispatch errors
#[derive(Debug, Error)]
pub enum ViewDispatchError {
    /// The manager stopped after an earlier failure and must be purged
    #[error("View manager {view_manager} is stopped")]
    Stopped {
        /// The view manager
        view_manager: String,
    },

    /// An event lacks the metadata dispatch needs
    #[error("View manager {view_manager} received an invalid event: {source}")]
    InvalidEvent {
        /// The view manager
        view_manager: String,
        /// The metadata problem
        #[source]
        source: EventError,
    },

    /// The locator failed
    #[error("View manager {view_manager} could not locate views for {event}")]
    Locator {
        /// The view manager
        view_manager: String,
        /// The event, as `Type(global_seq)`
        event: String,
        /// The locator's error
        #[source]
        source: anyhow::Error,
    },

    /// A view handler failed
    #[error("View manager {view_manager} failed to apply {event} to view {view_id}")]
    Handler {
        /// The view manager
        view_manager: String,
        /// The view instance
        view_id: String,
        /// The event, as `Type(global_seq)`
        event: String,
        /// The handler's error
        #[source]
        source: anyhow::Error,
    },

    /// No view manager is registered under this id
    #[error("Unknown view manager: {0}")]
    UnknownViewManager(String),

    /// Reading events for catch-up failed
    #[error("Event store error during catch-up: {0}")]
    EventStore(#[from] EventStoreError),
}

/// One view instance with its progress
#[derive(Debug, Clone, PartialEq)]
pub struct ViewInstance<V> {
    /// View id
    pub id: String,
    /// Global sequence number of the last event applied to this instance
    pub last_global_sequence_number: i64,
    /// Projection state
    pub state: V,
}

impl<V: Default> ViewInstance<V> {
    /// A fresh instance with default state
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_global_sequence_number: NO_POSITION,
            state: V::default(),
        }
    }
}

/// Notification sent after a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewsUpdated {
    /// The view manager
    pub view_manager_id: String,
    /// Its position after the dispatch
    pub position: i64,
    /// Ids of the instances that changed, in first-touch order
    pub views: Vec<String>,
}

/// Handler that applies one event to a view's state
pub type ViewHandler<V> = Arc<dyn Fn(&mut V, &DomainEvent) -> anyhow::Result<()> + Send + Sync>;

/// The event subscriptions of a view type
pub struct Subscriptions<V> {
    handlers: Vec<(String, ViewHandler<V>)>,
}

impl<V: 'static> Subscriptions<V> {
    fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Subscribe to a typed event
    ///
    /// The payload is decoded as `E` even when the handler was reached
    /// through a more derived event type.
    pub fn on<E, F>(&mut self, handler: F) -> &mut Self
    where
        E: EventType + 'static,
        F: Fn(&mut V, E, &DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: ViewHandler<V> =
            Arc::new(move |view: &mut V, event: &DomainEvent| -> anyhow::Result<()> {
                let payload: E = serde_json::from_value(event.payload().clone())?;
                handler(view, payload, event)
            });
        self.handlers.push((E::EVENT_TYPE.to_string(), handler));
        self
    }

    /// Subscribe to an event type, interface or ancestor by tag
    pub fn on_type<F>(&mut self, event_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut V, &DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: ViewHandler<V> = Arc::new(handler);
        self.handlers.push((event_type.into(), handler));
        self
    }

    /// Subscribe to every event
    pub fn on_all<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut V, &DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_type(ALL_EVENTS, handler)
    }
}

/// A projection maintained by a view manager
pub trait View: Clone + Default + Send + Sync + 'static {
    /// Declare the events this view handles
    fn subscriptions(subscriptions: &mut Subscriptions<Self>);
}

/// Contract between view managers and whatever feeds them events
#[async_trait]
pub trait ViewManager: Send + Sync + fmt::Debug {
    /// Manager id
    fn id(&self) -> &str;

    /// Highest global sequence number fully dispatched
    fn position(&self) -> i64;

    /// Whether the manager stopped after a failure
    fn is_stopped(&self) -> bool;

    /// Apply a batch of events, ascending in global order
    async fn dispatch(
        &self,
        context: &ViewContext,
        batch: &[DomainEvent],
        profiler: &dyn ViewManagerProfiler,
    ) -> Result<(), ViewDispatchError>;

    /// Drop every view instance and reset the position
    async fn purge(&self);

    /// Drop one view instance; returns whether it existed
    async fn delete(&self, view_id: &str) -> bool;
}

/// Direct read access to a manager's view instances
#[async_trait]
pub trait TypedViewManager<V: View>: ViewManager {
    /// Load a view instance
    async fn load(&self, view_id: &str) -> Option<ViewInstance<V>>;
}

/// View manager keeping its instances in memory
pub struct InMemoryViewManager<V: View> {
    id: String,
    locator: Arc<dyn ViewLocator>,
    handlers: DispatchTable<ViewHandler<V>>,
    batch_mode: bool,
    views: RwLock<HashMap<String, ViewInstance<V>>>,
    position: AtomicI64,
    stopped: AtomicBool,
    updates: broadcast::Sender<ViewsUpdated>,
}

impl<V: View> InMemoryViewManager<V> {
    /// Create a manager for view type `V`
    pub fn new(
        id: impl Into<String>,
        locator: Arc<dyn ViewLocator>,
        hierarchy: Arc<EventTypeHierarchy>,
    ) -> Self {
        let mut subscriptions = Subscriptions::new();
        V::subscriptions(&mut subscriptions);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            id: id.into(),
            locator,
            handlers: DispatchTable::new(hierarchy, subscriptions.handlers),
            batch_mode: false,
            views: RwLock::new(HashMap::new()),
            position: AtomicI64::new(NO_POSITION),
            stopped: AtomicBool::new(false),
            updates,
        }
    }

    /// Coalesce each dispatched batch into one pseudo-event
    pub fn with_batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    /// Receive a [`ViewsUpdated`] after every dispatch that changed views
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ViewsUpdated> {
        self.updates.subscribe()
    }

    /// Ids of all view instances, sorted
    pub async fn view_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.views.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn apply_all(
        &self,
        context: &ViewContext,
        batch: &[DomainEvent],
        profiler: &dyn ViewManagerProfiler,
    ) -> Result<IndexMap<String, ViewInstance<V>>, ViewDispatchError> {
        let pseudo;
        let events: &[DomainEvent] = if self.batch_mode {
            pseudo = [DomainEvent::batch(batch).map_err(|source| self.invalid(source))?];
            &pseudo
        } else {
            batch
        };

        let views = self.views.read().await;
        let mut working: IndexMap<String, (ViewInstance<V>, bool)> = IndexMap::new();

        for event in events {
            let Some(handler) = self.handlers.resolve(event.event_type()) else {
                continue;
            };
            let global_sequence_number = event
                .global_sequence_number()
                .map_err(|source| self.invalid(source))?;
            let view_ids = self
                .locator
                .affected_view_ids(context, event)
                .map_err(|source| ViewDispatchError::Locator {
                    view_manager: self.id.clone(),
                    event: event.to_string(),
                    source,
                })?;

            let started = Instant::now();
            let mut applied = false;
            for view_id in view_ids {
                let (instance, dirty) = match working.entry(view_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let instance = views
                            .get(entry.key())
                            .cloned()
                            .unwrap_or_else(|| ViewInstance::new(entry.key().clone()));
                        entry.insert((instance, false))
                    }
                };
                if global_sequence_number <= instance.last_global_sequence_number {
                    continue;
                }

                handler(&mut instance.state, event).map_err(|source| {
                    ViewDispatchError::Handler {
                        view_manager: self.id.clone(),
                        view_id: instance.id.clone(),
                        event: event.to_string(),
                        source,
                    }
                })?;

                instance.last_global_sequence_number = global_sequence_number;
                *dirty = true;
                applied = true;
            }
            if applied {
                profiler.register_time_spent(&self.id, event, started.elapsed());
            }
        }

        Ok(working
            .into_iter()
            .filter_map(|(id, (instance, dirty))| dirty.then_some((id, instance)))
            .collect())
    }

    fn invalid(&self, source: EventError) -> ViewDispatchError {
        ViewDispatchError::InvalidEvent {
            view_manager: self.id.clone(),
            source,
        }
    }
}

#[async_trait]
impl<V: View> ViewManager for InMemoryViewManager<V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn dispatch(
        &self,
        context: &ViewContext,
        batch: &[DomainEvent],
        profiler: &dyn ViewManagerProfiler,
    ) -> Result<(), ViewDispatchError> {
        if self.is_stopped() {
            return Err(ViewDispatchError::Stopped {
                view_manager: self.id.clone(),
            });
        }
        let Some(last) = batch.last() else {
            return Ok(());
        };

        let applied = match last.global_sequence_number() {
            Ok(position) => self
                .apply_all(context, batch, profiler)
                .await
                .map(|changed| (position, changed)),
            Err(source) => Err(self.invalid(source)),
        };
        let (position, changed) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                self.stopped.store(true, Ordering::SeqCst);
                error!(view_manager = %self.id, error = %err, "View manager stopped");
                return Err(err);
            }
        };

        let updated: Vec<String> = changed.keys().cloned().collect();
        {
            let mut views = self.views.write().await;
            views.extend(changed);
        }
        let position = self.position.fetch_max(position, Ordering::SeqCst).max(position);

        debug!(
            view_manager = %self.id,
            position,
            events = batch.len(),
            updated = updated.len(),
            "Dispatched batch"
        );

        if !updated.is_empty() {
            // No receivers is fine
            let _ = self.updates.send(ViewsUpdated {
                view_manager_id: self.id.clone(),
                position,
                views: updated,
            });
        }
        Ok(())
    }

    async fn purge(&self) {
        self.views.write().await.clear();
        self.position.store(NO_POSITION, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        info!(view_manager = %self.id, "Purged view manager");
    }

    async fn delete(&self, view_id: &str) -> bool {
        self.views.write().await.remove(view_id).is_some()
    }
}

#[async_trait]
impl<V: View> TypedViewManager<V> for InMemoryViewManager<V> {
    async fn load(&self, view_id: &str) -> Option<ViewInstance<V>> {
        self.views.read().await.get(view_id).cloned()
    }
}

impl<V: View> fmt::Debug for InMemoryViewManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryViewManager")
            .field("id", &self.id)
            .field("position", &self.position())
            .field("stopped", &self.is_stopped())
            .field("batch_mode", &self.batch_mode)
            .field("handlers", &self.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::metadata_keys;
    use crate::projections::locator::{GlobalInstanceLocator, InstancePerAggregateRootLocator};
    use crate::projections::profiler::{MockViewManagerProfiler, NullProfiler};
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl EventType for Deposited {
        const EVENT_TYPE: &'static str = "Deposited";
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Balance {
        amount: i64,
        seen: Vec<String>,
    }

    impl View for Balance {
        fn subscriptions(subscriptions: &mut Subscriptions<Self>) {
            subscriptions
                .on(|view: &mut Balance, e: Deposited, _| {
                    anyhow::ensure!(e.amount >= 0, "negative deposit");
                    view.amount += e.amount;
                    Ok(())
                })
                .on_all(|view: &mut Balance, event| {
                    view.seen.push(event.event_type().to_string());
                    Ok(())
                });
        }
    }

    fn event(event_type: &str, root: &str, global: i64, amount: i64) -> DomainEvent {
        DomainEvent::new(event_type, serde_json::json!({ "amount": amount }))
            .with_meta(metadata_keys::AGGREGATE_ROOT_ID, root)
            .with_meta(metadata_keys::GLOBAL_SEQUENCE_NUMBER, global.to_string())
    }

    fn manager(locator: Arc<dyn ViewLocator>) -> InMemoryViewManager<Balance> {
        InMemoryViewManager::new("balances", locator, Arc::new(EventTypeHierarchy::flat()))
    }

    #[tokio::test]
    async fn test_dispatch_routes_and_advances_position() {
        let manager = manager(Arc::new(InstancePerAggregateRootLocator));
        let mut updates = manager.subscribe_updates();
        let batch = vec![
            event("Deposited", "a", 0, 5),
            event("Opened", "b", 1, 0),
            event("Deposited", "a", 2, 7),
        ];

        manager
            .dispatch(&ViewContext::new(), &batch, &NullProfiler)
            .await
            .unwrap();

        let a = manager.load("a").await.unwrap();
        assert_eq!(a.state.amount, 12);
        assert_eq!(a.last_global_sequence_number, 2);
        assert_eq!(manager.load("b").await.unwrap().state.seen, vec!["Opened"]);
        assert_eq!(manager.position(), 2);

        let notification = updates.recv().await.unwrap();
        assert_eq!(notification.position, 2);
        assert_eq!(notification.views, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_redelivered_events_are_not_applied_twice() {
        let manager = manager(Arc::new(GlobalInstanceLocator));
        let batch = vec![event("Deposited", "a", 0, 5), event("Deposited", "a", 1, 1)];

        manager.dispatch(&ViewContext::new(), &batch, &NullProfiler).await.unwrap();
        manager.dispatch(&ViewContext::new(), &batch[1..], &NullProfiler).await.unwrap();

        let view = manager.load("__global__").await.unwrap();
        assert_eq!(view.state.amount, 6);
    }

    #[tokio::test]
    async fn test_failure_stops_manager_without_partial_writes() {
        let manager = manager(Arc::new(GlobalInstanceLocator));
        manager
            .dispatch(&ViewContext::new(), &[event("Deposited", "a", 0, 5)], &NullProfiler)
            .await
            .unwrap();

        let bad = vec![event("Deposited", "a", 1, 3), event("Deposited", "a", 2, -1)];
        let err = manager
            .dispatch(&ViewContext::new(), &bad, &NullProfiler)
            .await
            .unwrap_err();

        assert!(matches!(err, ViewDispatchError::Handler { .. }));
        assert!(manager.is_stopped());
        assert_eq!(manager.position(), 0);
        assert_eq!(manager.load("__global__").await.unwrap().state.amount, 5);

        let again = manager
            .dispatch(&ViewContext::new(), &[event("Deposited", "a", 1, 3)], &NullProfiler)
            .await;
        assert!(matches!(again, Err(ViewDispatchError::Stopped { .. })));

        manager.purge().await;
        assert!(!manager.is_stopped());
        assert_eq!(manager.position(), NO_POSITION);
        assert!(manager.view_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_mode_dispatches_one_pseudo_event() {
        let manager = manager(Arc::new(InstancePerAggregateRootLocator)).with_batch_mode(true);
        let batch = vec![event("Deposited", "a", 3, 5), event("Deposited", "b", 4, 1)];

        manager.dispatch(&ViewContext::new(), &batch, &NullProfiler).await.unwrap();

        let a = manager.load("a").await.unwrap();
        assert_eq!(a.state.seen, vec![crate::events::EVENT_BATCH]);
        assert_eq!(a.state.amount, 0);
        assert_eq!(a.last_global_sequence_number, 4);
        assert!(manager.load("b").await.is_some());
        assert_eq!(manager.position(), 4);
    }

    #[tokio::test]
    async fn test_profiler_sees_every_applied_event() {
        let manager = manager(Arc::new(GlobalInstanceLocator));
        let mut profiler = MockViewManagerProfiler::new();
        profiler
            .expect_register_time_spent()
            .withf(|id, _, _| id.to_string() == "balances")
            .times(2)
            .return_const(());

        manager
            .dispatch(
                &ViewContext::new(),
                &[event("Deposited", "a", 0, 1), event("Deposited", "a", 1, 1)],
                &profiler,
            )
            .await
            .unwrap();
    }

    struct FanOutLocator;

    impl ViewLocator for FanOutLocator {
        fn affected_view_ids(
            &self,
            _context: &ViewContext,
            _event: &DomainEvent,
        ) -> anyhow::Result<Vec<String>> {
            Ok(vec!["left".to_string(), "right".to_string()])
        }
    }

    #[tokio::test]
    async fn test_event_reaching_several_views_is_timed_once() {
        let manager = manager(Arc::new(FanOutLocator));
        let mut profiler = MockViewManagerProfiler::new();
        profiler
            .expect_register_time_spent()
            .withf(|_, event, _| event.global_sequence_number().ok() == Some(0))
            .times(1)
            .return_const(());

        manager
            .dispatch(&ViewContext::new(), &[event("Deposited", "a", 0, 3)], &profiler)
            .await
            .unwrap();

        assert_eq!(manager.load("left").await.unwrap().state.amount, 3);
        assert_eq!(manager.load("right").await.unwrap().state.amount, 3);
    }

    #[tokio::test]
    async fn test_delete_view() {
        let manager = manager(Arc::new(GlobalInstanceLocator));
        manager
            .dispatch(&ViewContext::new(), &[event("Deposited", "a", 0, 1)], &NullProfiler)
            .await
            .unwrap();

        assert!(manager.delete("__global__").await);
        assert!(!manager.delete("__global__").await);
        assert!(manager.load("__global__").await.is_none());
    }
}
