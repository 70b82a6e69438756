//! Poller: periodic sweep over every subscribed build configuration
//!
//! One sweep runs per tick and ticks never overlap: the sweep runs inline in
//! the tick loop and missed ticks are skipped. Within a sweep, fetches run
//! concurrently up to `max_in_flight` and results are handled as they arrive.
//! The poller is the only writer of build baselines in [`SharedState`].
//!
//! [`SharedState`]: crate::state::SharedState

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::builds::{BuildTypeRef, Observation};
use crate::config::PollerConfig;
use crate::notifier::{Dispatcher, NotificationEvent};
use crate::state::{Observed, StateHandle};
use crate::subscriptions::{current_epoch_ms, SubscriptionStore};
use crate::teamcity::CiClient;
use crate::BridgeError;

/// Counters for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub transitions: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub unauthorized: usize,
    pub dispatched: usize,
    pub delivered: usize,
    /// Results that arrived after shutdown began
    pub discarded: usize,
    /// State entries dropped for build types without subscribers
    pub reclaimed: usize,
}

pub struct Poller {
    ci: Arc<dyn CiClient>,
    subscriptions: Arc<SubscriptionStore>,
    state: StateHandle,
    dispatcher: Arc<Dispatcher>,
    config: PollerConfig,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        ci: Arc<dyn CiClient>,
        subscriptions: Arc<SubscriptionStore>,
        state: StateHandle,
        dispatcher: Arc<Dispatcher>,
        config: PollerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ci,
            subscriptions,
            state,
            dispatcher,
            config,
            cancel,
        }
    }

    /// Sweep on every tick until the cancellation token fires
    pub async fn run(&self) {
        let period = Duration::from_secs(self.config.interval_seconds.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Poller started (interval {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Poller cancelled");
                    break;
                }
            }

            let report = self.sweep().await;
            tracing::debug!("Sweep finished: {:?}", report);
        }
    }

    /// Poll every subscribed build configuration once
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let build_types = self.subscriptions.all_build_types().await;
        report.reclaimed = self.state.write().await.retain_build_types(&build_types);

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        for build_type in build_types {
            let ci = Arc::clone(&self.ci);
            let permits = Arc::clone(&permits);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let result = ci.fetch_latest_build(&build_type).await;
                Some((build_type, result))
            });
        }

        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = self.cancel.cancelled() => {
                    report.discarded += tasks.len();
                    tasks.abort_all();
                    break;
                }
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok(Some((build_type, result))) => {
                    if self.cancel.is_cancelled() {
                        report.discarded += 1;
                        continue;
                    }
                    report.polled += 1;
                    self.handle_result(&build_type, result, &mut report).await;
                }
                Ok(None) => report.discarded += 1,
                Err(e) => tracing::warn!("Poll task failed: {}", e),
            }
        }

        self.finish_sweep(&report).await;
        report
    }

    async fn handle_result(
        &self,
        build_type: &BuildTypeRef,
        result: crate::Result<Observation>,
        report: &mut SweepReport,
    ) {
        let now_ms = current_epoch_ms();
        let observation = match result {
            Ok(observation) => observation,
            Err(e) => {
                self.handle_failure(build_type, e, now_ms, report).await;
                return;
            }
        };

        let observed = self
            .state
            .write()
            .await
            .observe(build_type, observation.clone(), now_ms);
        tracing::debug!("Poll {}: {:?}", build_type, observed);

        let (Observed::Changed { previous }, Some(current)) = (observed, observation) else {
            return;
        };
        report.transitions += 1;
        tracing::info!(
            "{} build {} is now {}",
            build_type,
            current.display_number(),
            current.status
        );

        let event = NotificationEvent {
            build_type: build_type.clone(),
            previous,
            current,
        };
        let subscriptions = self.subscriptions.list_by_build_type(build_type).await;
        let summary = self.dispatcher.dispatch_all(&event, &subscriptions).await;
        report.dispatched += summary.attempted;
        report.delivered += summary.delivered;
        report.discarded += summary.discarded;
    }

    async fn handle_failure(
        &self,
        build_type: &BuildTypeRef,
        error: BridgeError,
        now_ms: u64,
        report: &mut SweepReport,
    ) {
        let failures = self
            .state
            .write()
            .await
            .record_failure(build_type, error.to_string(), now_ms);

        match error {
            BridgeError::Unauthorized(_) => {
                report.unauthorized += 1;
                return;
            }
            BridgeError::NotFound(_) => {
                report.not_found += 1;
                tracing::info!(
                    "Build configuration {} not found on TeamCity, skipping",
                    build_type
                );
            }
            e => {
                report.unavailable += 1;
                tracing::debug!("Poll {} failed: {}", build_type, e);
            }
        }

        if failures == self.config.failure_warn_threshold {
            tracing::warn!(
                "Build configuration {} has {} consecutive poll failures",
                build_type,
                failures
            );
        }
    }

    /// Aggregate logging for token problems: one line per sweep at most
    async fn finish_sweep(&self, report: &SweepReport) {
        let mut state = self.state.write().await;
        state.sweeps += 1;
        state.last_sweep_epoch_ms = Some(current_epoch_ms());

        let rejected = report.unauthorized > 0;
        if rejected && !state.unauthorized {
            tracing::error!(
                "TeamCity rejected the configured token; {} build configurations skipped",
                report.unauthorized
            );
        } else if rejected {
            tracing::debug!(
                "TeamCity still rejects the token ({} skipped)",
                report.unauthorized
            );
        } else if state.unauthorized && report.polled > 0 {
            tracing::info!("TeamCity accepts the configured token again");
        }
        if rejected || report.polled > 0 {
            state.unauthorized = rejected;
        }
    }
}
