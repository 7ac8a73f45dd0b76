//! Progress computation.
//!
//! Progress is derived from step state on demand, never stored: a running
//! step counts half, finished steps count whole. The optional completion
//! estimate projects historical per-family durations onto the steps still to
//! run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::step::{Step, StepFamily, StepStatus};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    /// `(completed + 0.5 * running) / total`, clamped to [0, 1].
    pub fraction: f64,
    pub estimated_remaining_ms: Option<u64>,
}

pub fn compute(steps: &[Step]) -> ProgressSnapshot {
    compute_with_history(steps, &BTreeMap::new())
}

pub fn compute_with_history(
    steps: &[Step],
    avg_duration_ms_by_family: &BTreeMap<StepFamily, u64>,
) -> ProgressSnapshot {
    let total_steps = steps.len();
    let completed_steps = steps.iter().filter(|step| step.status.is_terminal()).count();
    let running_steps =
        steps.iter().filter(|step| step.status == StepStatus::Running).count();

    let fraction = if total_steps == 0 {
        0.0
    } else {
        ((completed_steps as f64 + 0.5 * running_steps as f64) / total_steps as f64)
            .clamp(0.0, 1.0)
    };

    let estimated_remaining_ms = estimate_remaining_ms(steps, avg_duration_ms_by_family);

    ProgressSnapshot {
        total_steps,
        completed_steps,
        running_steps,
        fraction,
        estimated_remaining_ms,
    }
}

fn estimate_remaining_ms(
    steps: &[Step],
    avg_duration_ms_by_family: &BTreeMap<StepFamily, u64>,
) -> Option<u64> {
    if avg_duration_ms_by_family.is_empty() {
        return None;
    }

    let mut remaining = 0u64;
    for step in steps {
        let weight = match step.status {
            StepStatus::Pending => 1.0,
            StepStatus::Running => 0.5,
            _ => continue,
        };
        let avg = *avg_duration_ms_by_family.get(&step.family)?;
        remaining += (avg as f64 * weight) as u64;
    }
    Some(remaining)
}
