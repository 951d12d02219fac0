//! Per-target observation state and transition detection.
//!
//! Recording is unconditional so the audit history stays complete; whether a
//! notification fires is decided by the returned transition flag.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::judge::Availability;

/// Bounded history ring per target; the oldest entry is evicted past this.
pub const HISTORY_CAP: usize = 100;

/// One observation, immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub timestamp: DateTime<Utc>,
    pub availability: Availability,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TargetState {
    /// None until the first determinate observation.
    pub availability: Option<Availability>,
    pub last_changed: Option<DateTime<Utc>>,
    pub history: VecDeque<CheckResult>,
}

/// Holds the last known state per target. `record` is exclusive per target
/// through the map entry, so an on-demand check and the periodic cycle cannot
/// interleave their bookkeeping for the same name.
#[derive(Default)]
pub struct StateTracker {
    states: DashMap<String, TargetState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `result` to the target's history and reports whether the
    /// availability transitioned.
    ///
    /// Indeterminate results never count: the previous known state is kept
    /// unchanged and no transition is reported.
    pub fn record(&self, name: &str, result: &CheckResult) -> bool {
        let mut state = self.states.entry(name.to_string()).or_default();
        state.history.push_back(result.clone());
        while state.history.len() > HISTORY_CAP {
            state.history.pop_front();
        }

        if result.availability == Availability::Indeterminate {
            return false;
        }

        let transitioned = state.availability != Some(result.availability);
        if transitioned {
            state.availability = Some(result.availability);
            state.last_changed = Some(result.timestamp);
        }
        transitioned
    }

    /// Current availability, if any determinate observation exists.
    pub fn current(&self, name: &str) -> Option<Availability> {
        self.states.get(name).and_then(|s| s.availability)
    }

    /// Snapshot of a target's state for trend display by collaborators.
    pub fn get(&self, name: &str) -> Option<TargetState> {
        self.states.get(name).map(|s| s.value().clone())
    }

    /// Drops state for targets that no longer exist in the configuration.
    pub fn prune<F>(&self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        self.states.retain(|name, _| keep(name));
    }
}
