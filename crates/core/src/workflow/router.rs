use serde::{Deserialize, Serialize};

use crate::domain::decision::ApproverDecisionLog;
use crate::domain::org::UserId;
use crate::domain::rule::RuleDefinition;
use crate::workflow::{Evaluation, WorkflowEvaluator, WorkflowStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Sequential,
    Parallel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedApprover {
    pub approver_id: UserId,
    pub rank: usize,
    pub required: bool,
}

/// Who should be prompted next for a request. Empty when the workflow is
/// terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub mode: RoutingMode,
    pub status: WorkflowStatus,
    pub approvers: Vec<RoutedApprover>,
}

impl RoutingPlan {
    pub fn approver_ids(&self) -> Vec<UserId> {
        self.approvers.iter().map(|approver| approver.approver_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.approvers.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RequestRouter {
    evaluator: WorkflowEvaluator,
}

impl RequestRouter {
    pub fn new(evaluator: WorkflowEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn route(&self, rule: &RuleDefinition, log: &ApproverDecisionLog) -> RoutingPlan {
        let evaluation = self.evaluator.evaluate(rule, log);
        self.plan(rule, &evaluation)
    }

    /// Projects an evaluation that was already computed for `rule`.
    pub fn plan(&self, rule: &RuleDefinition, evaluation: &Evaluation) -> RoutingPlan {
        let mode = if rule.sequential() { RoutingMode::Sequential } else { RoutingMode::Parallel };
        if evaluation.status.is_terminal() {
            return RoutingPlan { mode, status: evaluation.status, approvers: Vec::new() };
        }

        let mut approvers: Vec<RoutedApprover> = evaluation
            .eligible
            .iter()
            .map(|approver| RoutedApprover {
                approver_id: approver.approver_id.clone(),
                rank: approver.rank,
                required: approver.required,
            })
            .collect();
        approvers.sort_by_key(|approver| approver.rank);
        if mode == RoutingMode::Sequential {
            approvers.truncate(1);
        }

        RoutingPlan { mode, status: evaluation.status, approvers }
    }
}
