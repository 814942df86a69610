// Copyright 2025 Cowboy AI, LLC.

//! Dispatch profiling
//!
//! View managers report the time spent applying each event to a
//! [`ViewManagerProfiler`]. [`NullProfiler`] discards the measurements,
//! [`RecordingProfiler`] aggregates them per view manager and event type.

use crate::events::DomainEvent;
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;

/// Receives per-event dispatch timings
#[cfg_attr(test, mockall::automock)]
pub trait ViewManagerProfiler: Send + Sync {
    /// Record time spent applying one event in one view manager
    fn register_time_spent(&self, view_manager_id: &str, event: &DomainEvent, duration: Duration);
}

/// Profiler that ignores every measurement
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProfiler;

impl ViewManagerProfiler for NullProfiler {
    fn register_time_spent(&self, _view_manager_id: &str, _event: &DomainEvent, _duration: Duration) {}
}

/// Aggregated timings for one view manager and event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSummary {
    /// The view manager
    pub view_manager_id: String,
    /// The event type
    pub event_type: String,
    /// Number of events applied
    pub count: u64,
    /// Total time spent
    pub total: Duration,
}

impl ProfileSummary {
    /// Mean time per event
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    count: u64,
    total: Duration,
}

/// Profiler that keeps running totals
#[derive(Default)]
pub struct RecordingProfiler {
    totals: DashMap<(String, String), Totals>,
}

impl RecordingProfiler {
    /// Create an empty profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals per (view manager, event type), most expensive first
    pub fn summary(&self) -> Vec<ProfileSummary> {
        let mut summary: Vec<ProfileSummary> = self
            .totals
            .iter()
            .map(|entry| {
                let (view_manager_id, event_type) = entry.key();
                ProfileSummary {
                    view_manager_id: view_manager_id.clone(),
                    event_type: event_type.clone(),
                    count: entry.count,
                    total: entry.total,
                }
            })
            .collect();
        summary.sort_by(|a, b| b.total.cmp(&a.total));
        summary
    }

    /// Forget all measurements
    pub fn reset(&self) {
        self.totals.clear();
    }
}

impl ViewManagerProfiler for RecordingProfiler {
    fn register_time_spent(&self, view_manager_id: &str, event: &DomainEvent, duration: Duration) {
        let mut totals = self
            .totals
            .entry((view_manager_id.to_string(), event.event_type().to_string()))
            .or_default();
        totals.count += 1;
        totals.total += duration;
    }
}

impl fmt::Debug for RecordingProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingProfiler")
            .field("entries", &self.totals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recording_profiler_sums_per_manager_and_type() {
        let profiler = RecordingProfiler::new();
        let a = DomainEvent::new("A", serde_json::Value::Null);
        let b = DomainEvent::new("B", serde_json::Value::Null);

        profiler.register_time_spent("vm", &a, Duration::from_millis(2));
        profiler.register_time_spent("vm", &a, Duration::from_millis(4));
        profiler.register_time_spent("vm", &b, Duration::from_millis(1));

        let summary = profiler.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].event_type, "A");
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[0].average(), Duration::from_millis(3));

        profiler.reset();
        assert!(profiler.summary().is_empty());
    }
}
