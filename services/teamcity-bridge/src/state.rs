//! Last-known build state per build configuration and notification history

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::builds::{BuildState, BuildTypeRef, Observation};
use crate::notifier::NotificationRecord;

/// Poll bookkeeping for one build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTypeStatus {
    pub build_type: BuildTypeRef,
    /// Whether a baseline exists. `last_build` is meaningful only when set.
    pub observed: bool,
    pub last_build: Option<BuildState>,
    pub last_poll_epoch_ms: u64,
    pub last_change_epoch_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl BuildTypeStatus {
    fn new(build_type: BuildTypeRef) -> Self {
        Self {
            build_type,
            observed: false,
            last_build: None,
            last_poll_epoch_ms: 0,
            last_change_epoch_ms: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Result of recording one successful poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// First observation; nothing to compare against
    Baseline,
    Unchanged,
    /// A new run appeared or the current run changed status
    Changed { previous: Option<BuildState> },
}

/// Shared state accessible by the poller, command handler and HTTP server
#[derive(Debug)]
pub struct SharedState {
    pub build_types: BTreeMap<BuildTypeRef, BuildTypeStatus>,
    pub history: VecDeque<NotificationRecord>,
    pub history_max_size: usize,
    pub started_at: Instant,
    pub sweeps: u64,
    pub last_sweep_epoch_ms: Option<u64>,
    /// Set while TeamCity rejects the configured token
    pub unauthorized: bool,
}

impl SharedState {
    pub fn new(history_max_size: usize) -> Self {
        Self {
            build_types: BTreeMap::new(),
            history: VecDeque::with_capacity(history_max_size),
            history_max_size,
            started_at: Instant::now(),
            sweeps: 0,
            last_sweep_epoch_ms: None,
            unauthorized: false,
        }
    }

    /// Record a successful poll and classify it against the stored baseline.
    ///
    /// The baseline only moves forward: an empty result or an older run than
    /// the one already seen leaves it in place and counts as no change.
    pub fn observe(
        &mut self,
        build_type: &BuildTypeRef,
        observation: Observation,
        now_ms: u64,
    ) -> Observed {
        let status = self
            .build_types
            .entry(build_type.clone())
            .or_insert_with(|| BuildTypeStatus::new(build_type.clone()));
        status.last_poll_epoch_ms = now_ms;
        status.consecutive_failures = 0;
        status.last_error = None;

        if !status.observed {
            status.observed = true;
            status.last_build = observation;
            return Observed::Baseline;
        }

        let changed = match (&status.last_build, &observation) {
            (Some(previous), Some(current)) => {
                if current.precedes(previous) {
                    return Observed::Unchanged;
                }
                current.differs_from(previous)
            }
            (None, Some(_)) => true,
            (Some(_), None) => return Observed::Unchanged,
            (None, None) => false,
        };

        let previous = std::mem::replace(&mut status.last_build, observation);
        if changed {
            status.last_change_epoch_ms = Some(now_ms);
            Observed::Changed { previous }
        } else {
            Observed::Unchanged
        }
    }

    /// Record a failed poll without touching the baseline; returns the
    /// consecutive failure count
    pub fn record_failure(&mut self, build_type: &BuildTypeRef, error: String, now_ms: u64) -> u32 {
        let status = self
            .build_types
            .entry(build_type.clone())
            .or_insert_with(|| BuildTypeStatus::new(build_type.clone()));
        status.last_poll_epoch_ms = now_ms;
        status.consecutive_failures += 1;
        status.last_error = Some(error);
        status.consecutive_failures
    }

    /// Baseline for a build configuration: `None` if never observed
    pub fn baseline(&self, build_type: &BuildTypeRef) -> Option<&Observation> {
        self.build_types
            .get(build_type)
            .filter(|s| s.observed)
            .map(|s| &s.last_build)
    }

    /// Drop entries for build configurations nobody subscribes to any more
    pub fn retain_build_types(&mut self, active: &BTreeSet<BuildTypeRef>) -> usize {
        let before = self.build_types.len();
        self.build_types.retain(|bt, _| active.contains(bt));
        before - self.build_types.len()
    }

    /// Add a notification to history
    pub fn add_notification(&mut self, record: NotificationRecord) {
        if self.history_max_size == 0 {
            return;
        }
        if self.history.len() >= self.history_max_size {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

/// Thread-safe shared state handle
pub type StateHandle = Arc<RwLock<SharedState>>;

pub fn new_state_handle(history_max_size: usize) -> StateHandle {
    Arc::new(RwLock::new(SharedState::new(history_max_size)))
}
