use std::path::Path;

use expensa_core::audit::{AuditContext, TracingAuditSink};
use expensa_core::domain::decision::ApproverDecisionLog;
use expensa_core::domain::rule::RuleDefinition;
use expensa_core::workflow::{RequestRouter, WorkflowEvaluator};
use serde_json::json;

use crate::commands::{load_document, CommandResult};

/// Replays every logged decision through the evaluator, so an inconsistent log
/// is reported instead of silently evaluated.
pub fn run(rule_path: &Path, log_path: &Path) -> CommandResult {
    let rule: RuleDefinition = match load_document(rule_path) {
        Ok(rule) => rule,
        Err(error) => {
            return CommandResult::failure("evaluate", "invalid_rule", format!("{error:#}"), 2)
        }
    };
    let stored: ApproverDecisionLog = match load_document(log_path) {
        Ok(log) => log,
        Err(error) => {
            return CommandResult::failure("evaluate", "invalid_log", format!("{error:#}"), 2)
        }
    };

    let evaluator = WorkflowEvaluator::new();
    let audit = AuditContext::new(Some(stored.request_id().clone()), "cli-evaluate", "cli");
    let mut replay =
        ApproverDecisionLog::new(stored.request_id().clone(), stored.rule_id().clone());
    let mut evaluation = evaluator.evaluate(&rule, &replay);

    for (index, entry) in stored.decisions().iter().enumerate() {
        evaluation = match evaluator.append_with_audit(
            &rule,
            &mut replay,
            entry.clone(),
            &TracingAuditSink,
            &audit,
        ) {
            Ok(evaluation) => evaluation,
            Err(error) => {
                return CommandResult::failure(
                    "evaluate",
                    "invalid_decision",
                    format!("decision #{index} by `{}` rejected: {error}", entry.approver_id.0),
                    6,
                );
            }
        };
    }

    let plan = RequestRouter::new(evaluator).plan(&rule, &evaluation);
    let message = format!(
        "request `{}` is {} ({}/{} approvals, {}% required)",
        replay.request_id().0,
        evaluation.status.as_str(),
        evaluation.approved_weight,
        evaluation.total_weight,
        evaluation.min_approval_percentage
    );
    let data = json!({
        "request_id": replay.request_id(),
        "rule_id": rule.rule_id(),
        "status": evaluation.status,
        "resolution": evaluation.resolution,
        "approved_weight": evaluation.approved_weight,
        "total_weight": evaluation.total_weight,
        "min_approval_percentage": evaluation.min_approval_percentage,
        "next_approvers": plan,
    });

    CommandResult::success_with_data("evaluate", message, data)
}
