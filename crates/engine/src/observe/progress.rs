//! Progress snapshots: computed from step state on demand, with completion
//! estimates projected from the last day of per-family step durations.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::Serialize;

use fleetrun_core::domain::execution::{ExecutionId, ExecutionStatus};
use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;
use fleetrun_core::progress::{compute_with_history, ProgressSnapshot};

use crate::stores::{store_error, EngineStores};

const HISTORY_WINDOW_HOURS: i64 = 24;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionProgress {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
}

pub struct ProgressService {
    stores: EngineStores,
}

impl ProgressService {
    pub fn new(stores: EngineStores) -> Self {
        Self { stores }
    }

    pub async fn snapshot(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionProgress, EngineError> {
        let execution = self
            .stores
            .executions
            .find_by_id(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::Validation {
                message: format!("execution `{}` not found", execution_id.0),
            })?;

        let steps =
            self.stores.steps.list_for_execution(execution_id).await.map_err(store_error)?;

        let history = self
            .stores
            .steps
            .recent_durations(Utc::now() - Duration::hours(HISTORY_WINDOW_HOURS))
            .await
            .map_err(store_error)?;
        let averages = average_by_family(&history);

        Ok(ExecutionProgress {
            execution_id: execution_id.clone(),
            status: execution.status,
            snapshot: compute_with_history(&steps, &averages),
        })
    }
}

fn average_by_family(durations: &[(StepFamily, i64)]) -> BTreeMap<StepFamily, u64> {
    let mut sums: BTreeMap<StepFamily, (i64, i64)> = BTreeMap::new();
    for (family, duration_ms) in durations.iter().copied() {
        let entry = sums.entry(family).or_insert((0, 0));
        entry.0 += duration_ms.max(0);
        entry.1 += 1;
    }
    sums.into_iter()
        .filter(|(_, (_, count))| *count > 0)
        .map(|(family, (sum, count))| (family, (sum / count) as u64))
        .collect()
}
