// Copyright 2025 Cowboy AI, LLC.

//! Read model projections
//!
//! Views are read-optimized structures built by applying the event log in
//! order. View managers hold view instances and track how far through the
//! log they are; the dispatcher feeds them committed events and lets callers
//! wait for them to catch up.

pub mod dispatch_table;
pub mod dispatcher;
pub mod locator;
pub mod profiler;
pub mod view_manager;

pub use dispatch_table::DispatchTable;
pub use dispatcher::{ConsistencyMode, ViewManagerEventDispatcher, ViewWaitError};
pub use locator::{
    GlobalInstanceLocator, HandlerViewLocator, HandlerViewLocatorBuilder,
    InstancePerAggregateRootLocator, ViewContext, ViewLocator, GLOBAL_VIEW_ID,
};
pub use profiler::{NullProfiler, ProfileSummary, RecordingProfiler, ViewManagerProfiler};
pub use view_manager::{
    InMemoryViewManager, Subscriptions, TypedViewManager, View, ViewDispatchError, ViewHandler,
    ViewInstance, ViewManager, ViewsUpdated, NO_POSITION,
};
