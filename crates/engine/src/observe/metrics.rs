//! Windowed engine metrics, aggregated on demand from the store. Nothing
//! here is coupled to a metrics sink; the HTTP surface serialises the
//! snapshot and scrapers take it from there.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::Serialize;

use fleetrun_core::domain::event::EventKind;
use fleetrun_core::domain::execution::ExecutionStatus;
use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use crate::stores::{store_error, EngineStores};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepDurationStats {
    pub family: StepFamily,
    pub count: usize,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub window_secs: u64,
    pub active_executions: i64,
    pub queued_executions: i64,
    pub awaiting_approval: i64,
    pub succeeded_total: i64,
    pub failed_total: i64,
    pub cancelled_total: i64,
    /// succeeded / (succeeded + failed), over everything terminal.
    pub success_rate: f64,
    pub step_durations: Vec<StepDurationStats>,
    pub queue_depth: i64,
    pub oldest_queue_wait_ms: Option<i64>,
    pub timeouts_in_window: i64,
    pub rbac_violations_in_window: i64,
    pub cancellations_in_window: i64,
    /// Running executions already past their execution budget.
    pub sla_violations: i64,
}

pub struct MetricsService {
    stores: EngineStores,
    window: Duration,
}

impl MetricsService {
    pub fn new(stores: EngineStores) -> Self {
        Self { stores, window: Duration::hours(1) }
    }

    pub fn with_window(stores: EngineStores, window: Duration) -> Self {
        Self { stores, window }
    }

    pub async fn snapshot(&self) -> Result<MetricsSnapshot, EngineError> {
        let now = Utc::now();
        let since = now - self.window;

        let active =
            self.stores.executions.count_by_status(ExecutionStatus::Running).await;
        let queued =
            self.stores.executions.count_by_status(ExecutionStatus::Pending).await;
        let awaiting = self
            .stores
            .executions
            .count_by_status(ExecutionStatus::AwaitingApproval)
            .await;
        let succeeded =
            self.stores.executions.count_by_status(ExecutionStatus::Succeeded).await;
        let failed = self.stores.executions.count_by_status(ExecutionStatus::Failed).await;
        let cancelled =
            self.stores.executions.count_by_status(ExecutionStatus::Cancelled).await;

        let (active, queued, awaiting, succeeded, failed, cancelled) = (
            active.map_err(store_error)?,
            queued.map_err(store_error)?,
            awaiting.map_err(store_error)?,
            succeeded.map_err(store_error)?,
            failed.map_err(store_error)?,
            cancelled.map_err(store_error)?,
        );

        let terminal = succeeded + failed;
        let success_rate =
            if terminal == 0 { 1.0 } else { succeeded as f64 / terminal as f64 };

        let durations =
            self.stores.steps.recent_durations(since).await.map_err(store_error)?;
        let step_durations = duration_stats(&durations);

        let queue_depth = self.stores.queue.depth(now).await.map_err(store_error)?;
        let oldest_queue_wait_ms = self
            .stores
            .queue
            .oldest_available_at(now)
            .await
            .map_err(store_error)?
            .map(|oldest| (now - oldest).num_milliseconds().max(0));

        let timeouts = self
            .stores
            .events
            .count_since(EventKind::Timeout, since)
            .await
            .map_err(store_error)?;
        let rbac_violations = self
            .stores
            .events
            .count_since(EventKind::RbacViolation, since)
            .await
            .map_err(store_error)?;
        let cancellations = self
            .stores
            .events
            .count_since(EventKind::Cancelled, since)
            .await
            .map_err(store_error)?;

        Ok(MetricsSnapshot {
            window_secs: self.window.num_seconds().max(0) as u64,
            active_executions: active,
            queued_executions: queued,
            awaiting_approval: awaiting,
            succeeded_total: succeeded,
            failed_total: failed,
            cancelled_total: cancelled,
            success_rate,
            step_durations,
            queue_depth,
            oldest_queue_wait_ms,
            timeouts_in_window: timeouts,
            rbac_violations_in_window: rbac_violations,
            cancellations_in_window: cancellations,
            sla_violations: self.sla_violations().await?,
        })
    }

    /// Running executions whose elapsed time exceeds their execution budget.
    pub async fn sla_violations(&self) -> Result<i64, EngineError> {
        let now = Utc::now();
        let running = self
            .stores
            .executions
            .list_by_status(ExecutionStatus::Running, 1_000)
            .await
            .map_err(store_error)?;

        let mut violations = 0;
        for execution in running {
            let Some(policy) = self
                .stores
                .policies
                .lookup(execution.sla_class, execution.action_class)
                .await
                .map_err(store_error)?
            else {
                continue;
            };
            let running_for = (now - execution.updated_at).num_milliseconds().max(0) as u64;
            if running_for > policy.execution_timeout_ms {
                violations += 1;
            }
        }
        Ok(violations)
    }
}

fn duration_stats(durations: &[(StepFamily, i64)]) -> Vec<StepDurationStats> {
    let mut by_family: BTreeMap<StepFamily, Vec<i64>> = BTreeMap::new();
    for (family, duration_ms) in durations.iter().copied() {
        by_family.entry(family).or_default().push(duration_ms.max(0));
    }

    by_family
        .into_iter()
        .map(|(family, mut samples)| {
            samples.sort_unstable();
            StepDurationStats {
                family,
                count: samples.len(),
                p50_ms: percentile(&samples, 50),
                p95_ms: percentile(&samples, 95),
                p99_ms: percentile(&samples, 99),
            }
        })
        .collect()
}

/// Nearest-rank percentile over a sorted sample set.
fn percentile(sorted: &[i64], pct: u32) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct as f64 / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
