//! The scheduler and per-target pipeline: fetch, judge, record, and notify
//! on transitions. One engine instance drives both the periodic loop and
//! on-demand checks through the same code path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ConfigStore, MonitorConfig, Target, MIN_FREQUENCY_SECS};
use crate::fetcher::{ContentFetcher, FetchOutcome};
use crate::judge::{self, Availability, Judgement};
use crate::notifications::service::{resolve_channels, DispatchOutcome, NotificationDispatcher};
use crate::state::{CheckResult, StateTracker};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
}

pub struct MonitorEngine {
    config: ConfigStore,
    fetcher: ContentFetcher,
    tracker: StateTracker,
    dispatcher: NotificationDispatcher,
    /// Serializes the pipeline per target so an on-demand check cannot
    /// interleave with the periodic cycle's bookkeeping for the same name.
    check_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Last check instant per target, for per-target interval overrides.
    last_checked: DashMap<String, Instant>,
}

impl MonitorEngine {
    pub fn new(config: ConfigStore) -> Self {
        let snapshot = config.get();
        let resolver_host = if snapshot.config.proxy_host.trim().is_empty() {
            std::env::var("PROXY_HOST").ok()
        } else {
            Some(snapshot.config.proxy_host.clone())
        };
        Self {
            config,
            fetcher: ContentFetcher::new(resolver_host),
            tracker: StateTracker::new(),
            dispatcher: NotificationDispatcher::new(),
            check_locks: DashMap::new(),
            last_checked: DashMap::new(),
        }
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Re-reads the persisted configuration. On failure the previous
    /// snapshot stays authoritative and the error is surfaced to the caller.
    pub fn reload_config(&self) -> Result<(), ConfigError> {
        self.config.reload()
    }

    /// Runs one full check cycle over the currently active targets.
    /// Failures are contained per target; the cycle always completes.
    pub async fn run_cycle_once(&self) {
        let snapshot = self.config.get();
        self.prune_departed(&snapshot);

        let mut checked = 0usize;
        for (name, target) in &snapshot.stock {
            if !target.active {
                continue;
            }
            if !self.is_due(name, target) {
                continue;
            }
            self.check_target(name, target, &snapshot).await;
            checked += 1;
        }
        info!(targets = checked, "check cycle completed");
    }

    /// Runs the pipeline for one target immediately, outside the periodic
    /// schedule. Shares the per-target lock with the cycle path.
    pub async fn check_target_now(&self, name: &str) -> Result<CheckResult, EngineError> {
        let snapshot = self.config.get();
        let target = snapshot
            .stock
            .get(name)
            .ok_or_else(|| EngineError::UnknownTarget(name.to_string()))?;
        Ok(self.check_target(name, target, &snapshot).await)
    }

    /// The periodic loop. Sleeps the configured interval between cycles and
    /// stops when `shutdown` flips to true; the sleep is interruptible so
    /// shutdown never waits out a full interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("monitor loop started");
        loop {
            self.run_cycle_once().await;

            let frequency = self.config.get().config.frequency.max(MIN_FREQUENCY_SECS);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(frequency)) => {}
                changed = shutdown.changed() => {
                    // A closed channel means the handle is gone; stop too.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("monitor loop stopped");
    }

    /// A target with an interval override is only due once that much time
    /// has passed; everything else is checked every cycle.
    fn is_due(&self, name: &str, target: &Target) -> bool {
        let Some(interval) = target.interval_secs else {
            return true;
        };
        match self.last_checked.get(name) {
            Some(last) => last.elapsed() >= Duration::from_secs(interval),
            None => true,
        }
    }

    fn prune_departed(&self, snapshot: &MonitorConfig) {
        self.tracker.prune(|name| snapshot.stock.contains_key(name));
        self.check_locks
            .retain(|name, _| snapshot.stock.contains_key(name));
        self.last_checked
            .retain(|name, _| snapshot.stock.contains_key(name));
    }

    async fn check_target(
        &self,
        name: &str,
        target: &Target,
        snapshot: &MonitorConfig,
    ) -> CheckResult {
        let lock = self
            .check_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        self.last_checked.insert(name.to_string(), Instant::now());

        let started = Instant::now();
        let judgement = match self.fetcher.fetch(&target.url, target.use_fallback).await {
            Ok(FetchOutcome::Content { body, .. }) => judge::judge(
                &body,
                target.check_kind,
                &target.check_pattern,
                target.expected_result.as_deref(),
            ),
            Ok(FetchOutcome::Blocked { detail }) => Judgement {
                availability: Availability::Indeterminate,
                message: format!("no content: {detail}"),
            },
            Ok(FetchOutcome::Denied { status }) => Judgement {
                availability: Availability::Indeterminate,
                message: format!("no content: HTTP {status}"),
            },
            Err(e) => {
                error!(target_name = name, error = %e, "fetch failed");
                Judgement {
                    availability: Availability::Indeterminate,
                    message: format!("fetch failed: {e}"),
                }
            }
        };

        let result = CheckResult {
            timestamp: Utc::now(),
            availability: judgement.availability,
            message: judgement.message,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            target_name = name,
            availability = %result.availability,
            elapsed_ms = result.elapsed_ms,
            detail = %result.message,
            "check completed"
        );

        let previous = self.tracker.current(name);
        let transitioned = self.tracker.record(name, &result);
        if transitioned {
            info!(
                target_name = name,
                from = previous.map(|a| a.label()).unwrap_or("unknown"),
                to = result.availability.label(),
                "availability transition"
            );
            self.notify(name, target, previous, &result, snapshot).await;
            self.persist_observation(name, &result);
        }
        result
    }

    async fn notify(
        &self,
        name: &str,
        target: &Target,
        previous: Option<Availability>,
        result: &CheckResult,
        snapshot: &MonitorConfig,
    ) {
        let channels = resolve_channels(snapshot, name);
        if channels.is_empty() {
            return;
        }
        let cooldown = Duration::from_secs(snapshot.config.cooldown_secs);
        let outcome = self
            .dispatcher
            .dispatch(name, &target.url, previous, result, &channels, cooldown)
            .await;
        if let DispatchOutcome::Sent(deliveries) = outcome {
            let failed = deliveries.iter().filter(|d| d.result.is_err()).count();
            info!(
                target_name = name,
                channels = deliveries.len(),
                failed,
                "notification fan-out finished"
            );
        }
    }

    /// Best-effort write-back of the observed state into the document. A
    /// failed persist leaves the in-memory state correct but not durable.
    fn persist_observation(&self, name: &str, result: &CheckResult) {
        let written = self.config.update(|config| {
            if let Some(entry) = config.stock.get_mut(name) {
                entry.status = Some(result.availability);
                entry.last_changed =
                    Some(result.timestamp.format("%Y-%m-%d %H:%M:%S").to_string());
            }
        });
        if let Err(e) = written {
            warn!(target_name = name, error = %e, "failed to persist state change");
        }
    }
}
