//! # Slack Collector
//!
//! Background task that wakes once a day at the configured UTC hour and
//! collects recent public-channel history for every installed workspace.
//! Workspaces are processed one at a time; a failing workspace is logged and
//! counted without stopping the run.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::CollectorConfig;
use crate::error::ApiError;
use crate::repositories::SlackWorkspaceRepository;
use crate::services::slack::SlackService;

/// Totals for one collector run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectorStats {
    pub workspaces: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub messages: usize,
}

/// First time strictly after `now` at `hour_utc:00:00`.
pub fn next_run_after(now: DateTime<Utc>, hour_utc: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour_utc % 24, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub struct SlackCollector {
    master: DatabaseConnection,
    slack: Arc<SlackService>,
    config: CollectorConfig,
}

impl SlackCollector {
    pub fn new(master: DatabaseConnection, slack: Arc<SlackService>, config: CollectorConfig) -> Self {
        Self {
            master,
            slack,
            config,
        }
    }

    /// Run until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(hour_utc = self.config.hour_utc, "Starting Slack collector");

        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.config.hour_utc);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "Slack collector sleeping");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Slack collector shutdown requested");
                    break;
                }
                _ = sleep(wait) => {
                    if let Err(err) = self.run_once().await {
                        counter!("slack_collector_failures_total").increment(1);
                        error!(error = %err, "Slack collector run failed");
                    }
                }
            }
        }

        info!("Slack collector stopped");
    }

    /// Collects every workspace once.
    pub async fn run_once(&self) -> Result<CollectorStats, ApiError> {
        let started = Instant::now();
        counter!("slack_collector_runs_total").increment(1);

        let workspaces = SlackWorkspaceRepository::new(&self.master).list().await?;
        let mut stats = CollectorStats {
            workspaces: workspaces.len(),
            ..CollectorStats::default()
        };
        info!(workspaces = stats.workspaces, "Slack collection started");

        for workspace in workspaces {
            match self
                .slack
                .process_fetch_messages(
                    &workspace.team_id,
                    workspace.tenant_id,
                    self.config.lookback_days,
                    None,
                )
                .await
            {
                Ok(outcome) => {
                    stats.succeeded += 1;
                    stats.messages += outcome.messages;
                    info!(
                        team_id = %workspace.team_id,
                        messages = outcome.messages,
                        channels = outcome.channels,
                        "Workspace collected"
                    );
                }
                Err(err) => {
                    stats.failed += 1;
                    counter!("slack_collector_failures_total").increment(1);
                    warn!(team_id = %workspace.team_id, error = %err, "Workspace collection failed");
                }
            }
        }

        histogram!("slack_collector_run_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            workspaces = stats.workspaces,
            succeeded = stats.succeeded,
            failed = stats.failed,
            messages = stats.messages,
            "Slack collection completed"
        );
        Ok(stats)
    }
}
