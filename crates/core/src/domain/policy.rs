use serde::{Deserialize, Serialize};

use crate::domain::execution::{ActionClass, SlaClass};

/// One cell of the timeout matrix: budgets for executions of a given SLA and
/// action class. Seeded at install and read-only at runtime. The step budget
/// is always strictly below the execution budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub sla_class: SlaClass,
    pub action_class: ActionClass,
    pub execution_timeout_ms: u64,
    pub step_timeout_ms: u64,
}

/// The seeded matrix: 3 SLA classes x 4 action classes.
pub fn default_matrix() -> Vec<TimeoutPolicy> {
    let cells = [
        (SlaClass::Fast, ActionClass::Information, 10_000, 5_000),
        (SlaClass::Fast, ActionClass::Diagnostic, 15_000, 8_000),
        (SlaClass::Fast, ActionClass::Operational, 20_000, 10_000),
        (SlaClass::Fast, ActionClass::Provisioning, 30_000, 15_000),
        (SlaClass::Medium, ActionClass::Information, 120_000, 30_000),
        (SlaClass::Medium, ActionClass::Diagnostic, 180_000, 60_000),
        (SlaClass::Medium, ActionClass::Operational, 300_000, 120_000),
        (SlaClass::Medium, ActionClass::Provisioning, 600_000, 240_000),
        (SlaClass::Long, ActionClass::Information, 900_000, 300_000),
        (SlaClass::Long, ActionClass::Diagnostic, 1_800_000, 600_000),
        (SlaClass::Long, ActionClass::Operational, 3_600_000, 900_000),
        (SlaClass::Long, ActionClass::Provisioning, 7_200_000, 1_800_000),
    ];

    cells
        .into_iter()
        .map(|(sla_class, action_class, execution_timeout_ms, step_timeout_ms)| TimeoutPolicy {
            sla_class,
            action_class,
            execution_timeout_ms,
            step_timeout_ms,
        })
        .collect()
}

/// Largest execution budget in the default matrix. Cancellation tokens must
/// outlive this.
pub fn max_execution_timeout_ms() -> u64 {
    default_matrix().iter().map(|policy| policy.execution_timeout_ms).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{default_matrix, max_execution_timeout_ms};
    use crate::domain::execution::{ActionClass, SlaClass};

    #[test]
    fn matrix_covers_every_sla_and_action_class() {
        let matrix = default_matrix();
        assert_eq!(matrix.len(), 12);

        for sla in [SlaClass::Fast, SlaClass::Medium, SlaClass::Long] {
            for action in [
                ActionClass::Information,
                ActionClass::Diagnostic,
                ActionClass::Operational,
                ActionClass::Provisioning,
            ] {
                assert!(
                    matrix
                        .iter()
                        .any(|cell| cell.sla_class == sla && cell.action_class == action),
                    "missing matrix cell for {sla:?}/{action:?}"
                );
            }
        }
    }

    #[test]
    fn step_budget_is_strictly_below_execution_budget() {
        for cell in default_matrix() {
            assert!(
                cell.step_timeout_ms < cell.execution_timeout_ms,
                "step budget must be below execution budget for {:?}/{:?}",
                cell.sla_class,
                cell.action_class
            );
        }
    }

    #[test]
    fn max_execution_timeout_is_the_long_provisioning_cell() {
        assert_eq!(max_execution_timeout_ms(), 7_200_000);
    }
}
