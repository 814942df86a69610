// Copyright 2025 Cowboy AI, LLC.

//! View locators
//!
//! A [`ViewLocator`] decides which view instances an event affects. The
//! answer may depend on the [`ViewContext`] the dispatch runs in.

use crate::event_hierarchy::EventTypeHierarchy;
use crate::events::DomainEvent;
use crate::projections::dispatch_table::DispatchTable;
use indexmap::IndexSet;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// View id used by [`GlobalInstanceLocator`]
pub const GLOBAL_VIEW_ID: &str = "__global__";

/// Ambient values available to locators during a dispatch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewContext {
    items: BTreeMap<String, serde_json::Value>,
}

impl ViewContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item, builder style
    pub fn with_item(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.items.insert(key.into(), value);
        self
    }

    /// Get an item
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.items.get(key)
    }

    /// Set an item
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.items.insert(key.into(), value);
    }
}

/// Resolves the view instances affected by an event
pub trait ViewLocator: Send + Sync {
    /// Ids of the affected view instances, in the order they should be updated
    fn affected_view_ids(
        &self,
        context: &ViewContext,
        event: &DomainEvent,
    ) -> anyhow::Result<Vec<String>>;
}

/// Every event goes to one singleton view
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalInstanceLocator;

impl ViewLocator for GlobalInstanceLocator {
    fn affected_view_ids(
        &self,
        _context: &ViewContext,
        _event: &DomainEvent,
    ) -> anyhow::Result<Vec<String>> {
        Ok(vec![GLOBAL_VIEW_ID.to_string()])
    }
}

/// One view per aggregate root, keyed by the root's id
///
/// A batch pseudo-event affects the view of every root in the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstancePerAggregateRootLocator;

impl ViewLocator for InstancePerAggregateRootLocator {
    fn affected_view_ids(
        &self,
        _context: &ViewContext,
        event: &DomainEvent,
    ) -> anyhow::Result<Vec<String>> {
        match event.batch_events() {
            Some(events) => {
                let mut ids = IndexSet::new();
                for e in events? {
                    ids.insert(e.aggregate_root_id()?.to_string());
                }
                Ok(ids.into_iter().collect())
            }
            None => Ok(vec![event.aggregate_root_id()?.to_string()]),
        }
    }
}

type IdFunction = Arc<dyn Fn(&DomainEvent, &ViewContext) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// Locator with one id function per subscribed event type
///
/// Functions are resolved polymorphically, so one registered for an
/// interface or ancestor covers every event type below it. Events with no
/// matching function affect no view.
pub struct HandlerViewLocator {
    table: DispatchTable<IdFunction>,
}

impl HandlerViewLocator {
    /// Start registering id functions
    pub fn builder(hierarchy: Arc<EventTypeHierarchy>) -> HandlerViewLocatorBuilder {
        HandlerViewLocatorBuilder {
            hierarchy,
            functions: Vec::new(),
        }
    }
}

impl ViewLocator for HandlerViewLocator {
    fn affected_view_ids(
        &self,
        context: &ViewContext,
        event: &DomainEvent,
    ) -> anyhow::Result<Vec<String>> {
        match self.table.resolve(event.event_type()) {
            Some(function) => function(event, context),
            None => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for HandlerViewLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerViewLocator")
            .field("table", &self.table)
            .finish()
    }
}

/// Builder for [`HandlerViewLocator`]
pub struct HandlerViewLocatorBuilder {
    hierarchy: Arc<EventTypeHierarchy>,
    functions: Vec<(String, IdFunction)>,
}

impl HandlerViewLocatorBuilder {
    /// Register an id function for an event type, interface or ancestor
    pub fn on<F>(mut self, event_type: impl Into<String>, function: F) -> Self
    where
        F: Fn(&DomainEvent, &ViewContext) -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        let function: IdFunction = Arc::new(function);
        self.functions.push((event_type.into(), function));
        self
    }

    /// Build the locator
    pub fn build(self) -> HandlerViewLocator {
        HandlerViewLocator {
            table: DispatchTable::new(self.hierarchy, self.functions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_hierarchy::EventTypeDecl;
    use crate::events::metadata_keys;
    use pretty_assertions::assert_eq;

    fn event(event_type: &str, root: &str) -> DomainEvent {
        DomainEvent::new(event_type, serde_json::json!({ "to": "savings" }))
            .with_meta(metadata_keys::AGGREGATE_ROOT_ID, root)
    }

    #[test]
    fn test_per_aggregate_root_locator() {
        let ids = InstancePerAggregateRootLocator
            .affected_view_ids(&ViewContext::new(), &event("E", "acc-1"))
            .unwrap();

        assert_eq!(ids, vec!["acc-1"]);
    }

    #[test]
    fn test_per_aggregate_root_locator_expands_batches() {
        let batch =
            DomainEvent::batch(&[event("E", "a"), event("E", "b"), event("E", "a")]).unwrap();

        let ids = InstancePerAggregateRootLocator
            .affected_view_ids(&ViewContext::new(), &batch)
            .unwrap();

        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_global_locator() {
        let ids = GlobalInstanceLocator
            .affected_view_ids(&ViewContext::new(), &event("E", "x"))
            .unwrap();

        assert_eq!(ids, vec![GLOBAL_VIEW_ID]);
    }

    #[test]
    fn test_handler_locator_resolves_through_ancestors_and_context() {
        let hierarchy = Arc::new(
            EventTypeHierarchy::builder()
                .declare(EventTypeDecl::new("Transferred").extends("AccountEvent"))
                .build()
                .unwrap(),
        );
        let locator = HandlerViewLocator::builder(hierarchy)
            .on("AccountEvent", |event, context| {
                let tenant = context
                    .get("tenant")
                    .and_then(|v| v.as_str())
                    .unwrap_or("default");
                Ok(vec![format!("{tenant}/{}", event.aggregate_root_id()?)])
            })
            .build();
        let context = ViewContext::new().with_item("tenant", serde_json::json!("acme"));

        let ids = locator
            .affected_view_ids(&context, &event("Transferred", "acc-9"))
            .unwrap();
        let none = locator
            .affected_view_ids(&context, &event("Unrelated", "acc-9"))
            .unwrap();

        assert_eq!(ids, vec!["acme/acc-9"]);
        assert!(none.is_empty());
    }
}
