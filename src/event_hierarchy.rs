// Copyright 2025 Cowboy AI, LLC.

//! Event type hierarchy
//!
//! Declares, once at startup, which ancestor each event type extends and
//! which interfaces it implements. Handler resolution walks the candidate
//! list computed here instead of inspecting types on every dispatch.

use crate::events::ALL_EVENTS;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised while building a hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    /// The same type was declared twice
    #[error("Event type declared more than once: {0}")]
    DuplicateDeclaration(String),

    /// Following `extends` links leads back to the starting type
    #[error("Event type {0} is its own ancestor")]
    Cycle(String),

    /// An event type tried to extend the universal root explicitly
    #[error("Event type {0} cannot declare the universal root as an interface")]
    RootAsInterface(String),
}

/// Declaration of one event type (concrete or abstract)
#[derive(Debug, Clone, Default)]
pub struct EventTypeDecl {
    name: String,
    extends: Option<String>,
    implements: Vec<String>,
}

impl EventTypeDecl {
    /// Declare an event type
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the direct ancestor
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    /// Add an implemented interface
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.implements.push(interface.into());
        self
    }
}

/// Builder for [`EventTypeHierarchy`]
#[derive(Debug, Default)]
pub struct EventTypeHierarchyBuilder {
    decls: Vec<EventTypeDecl>,
}

impl EventTypeHierarchyBuilder {
    /// Add a declaration
    pub fn declare(mut self, decl: EventTypeDecl) -> Self {
        self.decls.push(decl);
        self
    }

    /// Validate declarations and precompute candidate lists
    pub fn build(self) -> Result<EventTypeHierarchy, HierarchyError> {
        let mut decls: HashMap<String, EventTypeDecl> = HashMap::new();
        for decl in self.decls {
            if decl.implements.iter().any(|i| i == ALL_EVENTS) {
                return Err(HierarchyError::RootAsInterface(decl.name));
            }
            if decls.contains_key(&decl.name) {
                return Err(HierarchyError::DuplicateDeclaration(decl.name));
            }
            decls.insert(decl.name.clone(), decl);
        }

        let mut candidates = HashMap::with_capacity(decls.len());
        for name in decls.keys() {
            candidates.insert(name.clone(), compute_candidates(name, &decls)?);
        }

        Ok(EventTypeHierarchy { candidates })
    }
}

fn compute_candidates(
    name: &str,
    decls: &HashMap<String, EventTypeDecl>,
) -> Result<Vec<String>, HierarchyError> {
    // Ancestor chain, most-derived first
    let mut ancestors = Vec::new();
    let mut seen = HashSet::from([name.to_string()]);
    let mut current = decls.get(name).and_then(|d| d.extends.clone());
    while let Some(parent) = current {
        if parent == ALL_EVENTS {
            break;
        }
        if !seen.insert(parent.clone()) {
            return Err(HierarchyError::Cycle(name.to_string()));
        }
        current = decls.get(&parent).and_then(|d| d.extends.clone());
        ancestors.push(parent);
    }

    let mut interfaces: Vec<String> = Vec::new();
    for owner in std::iter::once(name).chain(ancestors.iter().map(String::as_str)) {
        if let Some(decl) = decls.get(owner) {
            for interface in &decl.implements {
                if !interfaces.contains(interface) {
                    interfaces.push(interface.clone());
                }
            }
        }
    }

    let mut result = Vec::with_capacity(2 + interfaces.len() + ancestors.len());
    result.push(name.to_string());
    result.extend(interfaces);
    result.extend(ancestors);
    result.push(ALL_EVENTS.to_string());
    Ok(result)
}

/// Precomputed resolution order per event type
#[derive(Debug, Clone, Default)]
pub struct EventTypeHierarchy {
    candidates: HashMap<String, Vec<String>>,
}

impl EventTypeHierarchy {
    /// Start building a hierarchy
    pub fn builder() -> EventTypeHierarchyBuilder {
        EventTypeHierarchyBuilder::default()
    }

    /// Hierarchy with no declarations; every event only matches itself and the root
    pub fn flat() -> Self {
        Self::default()
    }

    /// Candidate type tags for `event_type` in resolution order: the type
    /// itself, its interfaces, its ancestors, then [`ALL_EVENTS`]
    pub fn candidates(&self, event_type: &str) -> Vec<String> {
        match self.candidates.get(event_type) {
            Some(list) => list.clone(),
            None if event_type == ALL_EVENTS => vec![ALL_EVENTS.to_string()],
            None => vec![event_type.to_string(), ALL_EVENTS.to_string()],
        }
    }

    /// All declared type tags
    pub fn declared_types(&self) -> impl Iterator<Item = &str> {
        self.candidates.keys().map(String::as_str)
    }
}
