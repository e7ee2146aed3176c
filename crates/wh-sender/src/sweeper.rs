//! Policy Sweeper - periodic cleanup of tracked destinations
//!
//! On every tick:
//! - policies unused for longer than the idle window are dropped
//! - policies still in use but without a success for longer than the failure
//!   window get their destination disabled in the registration store, then
//!   are dropped
//!
//! A run that is still in progress causes later runs to be skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wh_config::SweeperSettings;

use crate::clock::saturating_sub;
use crate::registry::PolicyRegistry;
use crate::sender_metrics;
use crate::store::RegistrationStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Drop policies whose last use is older than this
    pub idle_window: Duration,
    /// Disable destinations whose last success is older than this
    pub failure_window: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            idle_window: Duration::from_secs(86_400),
            failure_window: Duration::from_secs(86_400),
        }
    }
}

impl From<&SweeperSettings> for SweeperConfig {
    fn from(settings: &SweeperSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            idle_window: Duration::from_secs(settings.idle_window_secs),
            failure_window: Duration::from_secs(settings.failure_window_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Policies dropped for being idle
    pub removed_idle: usize,
    /// Policies dropped after their destination was disabled (or found gone/paused)
    pub removed_failing: usize,
    /// `disable_destination` calls that succeeded
    pub disabled: usize,
    /// Disables that failed; those policies are kept for the next run
    pub disable_errors: usize,
    /// Another run was still in progress
    pub skipped: bool,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.removed_idle + self.removed_failing
    }

    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Clears the in-progress flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PolicySweeper {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn RegistrationStore>,
    config: SweeperConfig,
    running: AtomicBool,
}

impl PolicySweeper {
    pub fn new(registry: Arc<PolicyRegistry>, store: Arc<dyn RegistrationStore>, config: SweeperConfig) -> Self {
        Self {
            registry,
            store,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run one sweep now. Returns a skipped report if a sweep is already running.
    pub async fn sweep_once(&self) -> SweepReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous sweep still running, skipping");
            return SweepReport::skipped();
        }
        let _guard = RunGuard(&self.running);

        let now = self.registry.clock().now();
        let idle_cutoff = saturating_sub(now, self.config.idle_window);
        let failure_cutoff = saturating_sub(now, self.config.failure_window);

        let mut idle = Vec::new();
        let mut failing = Vec::new();
        for policy in self.registry.list_all() {
            if policy.last_used_at() < idle_cutoff {
                idle.push(policy.destination_id().to_string());
            } else if policy.last_success_at() < failure_cutoff {
                failing.push(policy.destination_id().to_string());
            }
        }

        let mut report = SweepReport::default();

        for id in &idle {
            if self.registry.remove_if(id, |p| p.last_used_at() < idle_cutoff) {
                debug!(destination_id = %id, "Dropped idle destination policy");
                report.removed_idle += 1;
            }
        }

        if !failing.is_empty() {
            self.disable_failing(&failing, failure_cutoff, &mut report).await;
        }

        sender_metrics::record_sweep(report.removed(), report.disabled);

        if report.removed() > 0 || report.disabled > 0 || report.disable_errors > 0 {
            info!(
                removed_idle = report.removed_idle,
                removed_failing = report.removed_failing,
                disabled = report.disabled,
                disable_errors = report.disable_errors,
                tracked = self.registry.len(),
                "Policy sweep completed"
            );
        } else {
            debug!(tracked = self.registry.len(), "Policy sweep found nothing to do");
        }

        report
    }

    async fn disable_failing(&self, failing: &[String], failure_cutoff: DateTime<Utc>, report: &mut SweepReport) {
        let destinations = match self.store.list_destinations().await {
            Ok(list) => list
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                error!(error = %e, "Failed to list destinations, retrying on next sweep");
                report.disable_errors += failing.len();
                return;
            }
        };

        for id in failing {
            match destinations.get(id) {
                Some(destination) if !destination.is_paused => {
                    info!(destination_id = %id, "Pausing destination without recent successful delivery");
                    if let Err(e) = self.store.disable_destination(id).await {
                        error!(destination_id = %id, error = %e, "Failed to disable destination");
                        report.disable_errors += 1;
                        continue;
                    }
                    report.disabled += 1;
                }
                Some(_) => {
                    debug!(destination_id = %id, "Destination already paused");
                }
                None => {
                    warn!(destination_id = %id, "Failing destination is no longer registered");
                }
            }

            if self.registry.remove_if(id, |p| p.last_success_at() < failure_cutoff) {
                report.removed_failing += 1;
            }
        }
    }

    /// Run sweeps on the configured interval until `shutdown` fires.
    ///
    /// The first sweep runs immediately.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = self.config.interval.as_secs(),
                idle_window_secs = self.config.idle_window.as_secs(),
                failure_window_secs = self.config.failure_window.as_secs(),
                "Policy sweeper running"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = shutdown.cancelled() => {
                        info!("Policy sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
