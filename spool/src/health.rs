//! Health monitor: turns store and coordinator state into a restart verdict.
//!
//! The monitor is driven from outside (the owning session, or whatever
//! schedules it). Each [`HealthMonitor::check`] compares the coordinator's
//! counters with the previous check to get the success ratio of recent
//! commit attempts, looks at whether both halves are running, and asks the
//! sink for its own opinion. The verdict comes with a [`HealthEvent`] of
//! string properties ready for telemetry.
//!
//! A low ratio alone is not enough to restart: it has to stay below
//! [`HealthConfig::min_success_ratio`] for
//! [`HealthConfig::max_low_checks`] consecutive checks. Checks with no commit
//! attempts neither extend nor break the streak.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::{Span, debug, info_span, warn};

use crate::config::HealthConfig;
use crate::local::LocalStore;
use crate::remote::{CommitCounters, RemoteStoreCoordinator};

/// Name of the event attached to every report.
pub const HEALTH_EVENT_NAME: &str = "spool.health";

/// Why a restart was recommended.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartReason {
    /// The local store is not running.
    LocalStopped,
    /// The coordinator is not running.
    CoordinatorStopped,
    /// The success ratio stayed low for too many checks.
    LowSuccessRatio {
        /// Ratio measured by the latest check.
        ratio: f64,
        /// Consecutive low checks, including the latest.
        checks: u32,
    },
    /// The sink asked for a restart.
    SinkRecommended,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalStopped => write!(f, "local store stopped"),
            Self::CoordinatorStopped => write!(f, "remote store coordinator stopped"),
            Self::LowSuccessRatio { ratio, checks } => write!(
                f,
                "commit success ratio {:.1}% low for {checks} checks",
                ratio * 100.0
            ),
            Self::SinkRecommended => write!(f, "sink recommended restart"),
        }
    }
}

/// Structured telemetry record for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// Event name.
    pub name: String,
    /// Key/value properties.
    pub properties: BTreeMap<String, String>,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Whether the owning session should stop and start again.
    pub restart: bool,
    /// Why, when `restart` is set.
    pub reason: Option<RestartReason>,
    /// Telemetry for this check.
    pub event: HealthEvent,
}

#[derive(Debug, Default)]
struct MonitorState {
    last: CommitCounters,
    low_streak: u32,
}

/// Periodic health check over one session's stores.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    state: Mutex<MonitorState>,
    span: Span,
}

impl HealthMonitor {
    /// Creates a monitor for `session_id`.
    pub fn new(config: HealthConfig, session_id: &str) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            span: info_span!("health", session = %session_id),
        }
    }

    /// Checks both stores and the sink.
    pub async fn check(&self, local: &LocalStore, remote: &RemoteStoreCoordinator) -> HealthReport {
        let sink_restart = remote.test_sink_health().await;
        let local_running = local.is_running();
        let remote_running = remote.is_running();
        let counters = remote.counters();
        let stats = local.stats();
        let pending_files = local.pending_files().map(|files| files.len()).ok();

        let (ratio, low_streak) = {
            let mut state = self.state.lock();
            // Counters only go backwards after an explicit reset.
            let base = if counters.attempted < state.last.attempted {
                CommitCounters::default()
            } else {
                state.last
            };
            let attempted = counters.attempted - base.attempted;
            let successes = counters.successes().saturating_sub(base.successes());
            state.last = counters;

            let ratio = (attempted > 0).then(|| successes as f64 / attempted as f64);
            match ratio {
                Some(r) if r < self.config.min_success_ratio => state.low_streak += 1,
                Some(_) => state.low_streak = 0,
                None => {}
            }
            (ratio, state.low_streak)
        };

        let reason = if !local_running {
            Some(RestartReason::LocalStopped)
        } else if !remote_running {
            Some(RestartReason::CoordinatorStopped)
        } else if low_streak >= self.config.max_low_checks {
            Some(RestartReason::LowSuccessRatio {
                ratio: ratio.unwrap_or(0.0),
                checks: low_streak,
            })
        } else if sink_restart {
            Some(RestartReason::SinkRecommended)
        } else {
            None
        };

        let mut properties = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            properties.insert(key.to_string(), value);
        };
        set("local_running", local_running.to_string());
        set("remote_running", remote_running.to_string());
        set(
            "pending_files",
            pending_files.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
        );
        set("active_file_bytes", stats.active_file_bytes.to_string());
        set("records_written", stats.records_written.to_string());
        set("write_failures", stats.write_failures.to_string());
        set("commit_cycles", counters.cycles.to_string());
        set("commit_attempted", counters.attempted.to_string());
        set("commit_committed", counters.committed.to_string());
        set("commit_duplicates", counters.duplicates.to_string());
        set("commit_rejected", counters.rejected.to_string());
        set(
            "success_percent",
            ratio.map_or_else(|| "n/a".to_string(), |r| format!("{:.1}", r * 100.0)),
        );
        set("low_checks", low_streak.to_string());
        set("restart", reason.is_some().to_string());
        if let Some(reason) = &reason {
            set("reason", reason.to_string());
        }

        let _entered = self.span.enter();
        match &reason {
            Some(reason) => warn!(reason = %reason, "health check recommends restart"),
            None => debug!(success_ratio = ?ratio, "health check passed"),
        }

        HealthReport {
            restart: reason.is_some(),
            reason,
            event: HealthEvent {
                name: HEALTH_EVENT_NAME.to_string(),
                properties,
            },
        }
    }

    /// Forgets the low-ratio streak. Called after a restart.
    pub fn reset(&self) {
        self.state.lock().low_streak = 0;
    }
}
