// Copyright 2025 Cowboy AI, LLC.

//! Polymorphic handler resolution
//!
//! A [`DispatchTable`] maps event type tags to handlers. Resolution for a
//! concrete tag takes the first registered candidate in the hierarchy's
//! order (the type, its interfaces, its ancestors, then every event). The
//! answer for each declared type is computed when the table is built;
//! undeclared tags are resolved on first sight and memoized.

use crate::event_hierarchy::EventTypeHierarchy;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handlers keyed by subscribed type tag, with memoized resolution
pub struct DispatchTable<H> {
    hierarchy: Arc<EventTypeHierarchy>,
    handlers: HashMap<String, H>,
    resolved: DashMap<String, Option<H>>,
}

impl<H: Clone> DispatchTable<H> {
    /// Build a table; a later registration for the same tag replaces an
    /// earlier one
    pub fn new(
        hierarchy: Arc<EventTypeHierarchy>,
        handlers: impl IntoIterator<Item = (String, H)>,
    ) -> Self {
        let table = Self {
            hierarchy,
            handlers: handlers.into_iter().collect(),
            resolved: DashMap::new(),
        };

        let known: Vec<String> = table
            .hierarchy
            .declared_types()
            .map(str::to_string)
            .chain(table.handlers.keys().cloned())
            .collect();
        for event_type in known {
            table.resolve(&event_type);
        }

        table
    }

    /// Handler for an event type, if any candidate is subscribed
    pub fn resolve(&self, event_type: &str) -> Option<H> {
        if let Some(hit) = self.resolved.get(event_type) {
            return hit.value().clone();
        }

        let handler = self
            .hierarchy
            .candidates(event_type)
            .iter()
            .find_map(|candidate| self.handlers.get(candidate).cloned());
        self.resolved
            .insert(event_type.to_string(), handler.clone());
        handler
    }

    /// Whether events of this type reach a handler
    pub fn handles(&self, event_type: &str) -> bool {
        self.resolve(event_type).is_some()
    }

    /// Subscribed type tags
    pub fn subscribed_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Whether nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<H> fmt::Debug for DispatchTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("subscribed", &self.handlers.keys().collect::<Vec<_>>())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}
