//! Approval workflow evaluation.
//!
//! [`WorkflowEvaluator::evaluate`] is a pure function of a rule and its decision
//! log. Callers re-run it after every append and diff the result to drive
//! notifications; nothing here holds state between calls.

pub mod router;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::decision::{ApproverDecisionLog, Decision, DecisionEntry, DecisionError};
use crate::domain::org::UserId;
use crate::domain::rule::{EffectiveApprover, RuleDefinition};

pub use router::{RequestRouter, RoutedApprover, RoutingMode, RoutingPlan};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Approved,
    Rejected,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Why a workflow reached a terminal status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    RequiredVeto { approver_id: UserId },
    ThresholdMet,
    ThresholdNotMet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub status: WorkflowStatus,
    pub resolution: Option<Resolution>,
    pub approved_weight: u32,
    pub total_weight: u32,
    pub min_approval_percentage: u32,
    /// Approvers who may decide right now, in rank order. Empty once terminal.
    pub eligible: Vec<EffectiveApprover>,
}

impl Evaluation {
    pub fn eligible_ids(&self) -> Vec<UserId> {
        self.eligible.iter().map(|approver| approver.approver_id.clone()).collect()
    }

    pub fn is_eligible(&self, approver_id: &UserId) -> bool {
        self.eligible.iter().any(|approver| &approver.approver_id == approver_id)
    }

    fn resolved(
        status: WorkflowStatus,
        resolution: Resolution,
        tally: Tally,
        min_approval_percentage: u32,
    ) -> Self {
        Self {
            status,
            resolution: Some(resolution),
            approved_weight: tally.approved,
            total_weight: tally.total,
            min_approval_percentage,
            eligible: Vec::new(),
        }
    }
}

struct Tally {
    approved: u32,
    total: u32,
    undecided: Vec<EffectiveApprover>,
}

/// Counts approvals reachable under the rule's mode. In sequential mode the walk
/// stops at the first undecided rank; a non-required reject counts as zero
/// weight and lets the walk continue.
fn tally(approvers: Vec<EffectiveApprover>, log: &ApproverDecisionLog, sequential: bool) -> Tally {
    let total = approvers.len() as u32;
    let mut approved = 0;
    let mut undecided = Vec::new();

    for approver in approvers {
        match log.decision_for(&approver.approver_id).map(|entry| entry.decision) {
            Some(Decision::Approve) => approved += 1,
            Some(Decision::Reject) => {}
            None => {
                undecided.push(approver);
                if sequential {
                    break;
                }
            }
        }
    }

    Tally { approved, total, undecided }
}

fn threshold_met(approved: u32, total: u32, min_approval_percentage: u32) -> bool {
    total > 0 && u64::from(approved) * 100 >= u64::from(min_approval_percentage) * u64::from(total)
}

#[derive(Clone, Debug, Default)]
pub struct WorkflowEvaluator;

impl WorkflowEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, rule: &RuleDefinition, log: &ApproverDecisionLog) -> Evaluation {
        let approvers = rule.effective_approvers();
        let min_pct = rule.min_approval_percentage();

        let veto = approvers
            .iter()
            .filter(|approver| approver.required)
            .find(|approver| {
                log.decision_for(&approver.approver_id)
                    .is_some_and(|entry| entry.decision == Decision::Reject)
            })
            .map(|approver| approver.approver_id.clone());

        let tally = tally(approvers, log, rule.sequential());

        if let Some(approver_id) = veto {
            return Evaluation::resolved(
                WorkflowStatus::Rejected,
                Resolution::RequiredVeto { approver_id },
                tally,
                min_pct,
            );
        }

        if threshold_met(tally.approved, tally.total, min_pct) {
            return Evaluation::resolved(
                WorkflowStatus::Approved,
                Resolution::ThresholdMet,
                tally,
                min_pct,
            );
        }

        if tally.undecided.is_empty() {
            return Evaluation::resolved(
                WorkflowStatus::Rejected,
                Resolution::ThresholdNotMet,
                tally,
                min_pct,
            );
        }

        Evaluation {
            status: WorkflowStatus::Pending,
            resolution: None,
            approved_weight: tally.approved,
            total_weight: tally.total,
            min_approval_percentage: min_pct,
            eligible: tally.undecided,
        }
    }

    /// Checks whether `entry` may be appended to `log` without mutating it.
    pub fn check_append(
        &self,
        rule: &RuleDefinition,
        log: &ApproverDecisionLog,
        entry: &DecisionEntry,
    ) -> Result<Evaluation, DecisionError> {
        if log.rule_id() != rule.rule_id() {
            return Err(DecisionError::RuleMismatch {
                bound: log.rule_id().clone(),
                offered: rule.rule_id().clone(),
            });
        }

        if rule.effective_approver(&entry.approver_id).is_none() {
            return Err(DecisionError::UnknownApprover { approver_id: entry.approver_id.clone() });
        }

        if log.decision_for(&entry.approver_id).is_some() {
            return Err(DecisionError::DuplicateDecision {
                approver_id: entry.approver_id.clone(),
            });
        }

        let current = self.evaluate(rule, log);
        if current.status.is_terminal() {
            return Err(DecisionError::WorkflowAlreadyResolved { status: current.status });
        }

        if !current.is_eligible(&entry.approver_id) {
            return Err(DecisionError::ApproverNotEligible {
                approver_id: entry.approver_id.clone(),
                awaiting: current.eligible_ids(),
            });
        }

        Ok(current)
    }

    /// Appends a decision and returns the re-evaluated workflow. On error the log
    /// is left untouched.
    pub fn append(
        &self,
        rule: &RuleDefinition,
        log: &mut ApproverDecisionLog,
        entry: DecisionEntry,
    ) -> Result<Evaluation, DecisionError> {
        self.check_append(rule, log, &entry)?;
        debug!(
            event_name = "workflow.decision.accepted",
            request_id = %log.request_id().0,
            approver_id = %entry.approver_id.0,
            decision = entry.decision.as_str(),
            "decision accepted for append"
        );
        log.push(entry);
        Ok(self.evaluate(rule, log))
    }

    pub fn append_with_audit<S>(
        &self,
        rule: &RuleDefinition,
        log: &mut ApproverDecisionLog,
        entry: DecisionEntry,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<Evaluation, DecisionError>
    where
        S: AuditSink,
    {
        let approver_id = entry.approver_id.0.clone();
        let decision = entry.decision.as_str();
        let result = self.append(rule, log, entry);
        match &result {
            Ok(evaluation) => sink.emit(
                AuditEvent::new(
                    Some(log.request_id().clone()),
                    audit.correlation_id.clone(),
                    "workflow.decision_appended",
                    AuditCategory::Decision,
                    audit.actor.clone(),
                    AuditOutcome::Success,
                )
                .with_metadata("approver_id", approver_id)
                .with_metadata("decision", decision)
                .with_metadata("status", evaluation.status.as_str())
                .with_metadata(
                    "approved_weight",
                    format!("{}/{}", evaluation.approved_weight, evaluation.total_weight),
                ),
            ),
            Err(error) => sink.emit(
                AuditEvent::new(
                    Some(log.request_id().clone()),
                    audit.correlation_id.clone(),
                    "workflow.decision_rejected",
                    AuditCategory::Decision,
                    audit.actor.clone(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("approver_id", approver_id)
                .with_metadata("decision", decision)
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Resolution, WorkflowEvaluator, WorkflowStatus};
    use crate::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use crate::domain::decision::{ApproverDecisionLog, Decision, DecisionEntry, DecisionError};
    use crate::domain::expense::RequestId;
    use crate::domain::org::UserId;
    use crate::domain::rule::{ApproverSlot, RuleDefinition, RuleSpec};

    fn rule(
        is_manager_approver: bool,
        approvers: Vec<ApproverSlot>,
        sequential: bool,
        min_approval_percentage: u32,
    ) -> RuleDefinition {
        RuleDefinition::create(RuleSpec {
            subject_user_id: UserId::new("emp"),
            manager_id: UserId::new("mgr"),
            description: String::new(),
            is_manager_approver,
            approvers,
            sequential,
            min_approval_percentage,
        })
        .expect("valid rule")
    }

    fn optional(ids: &[&str]) -> Vec<ApproverSlot> {
        ids.iter().map(|id| ApproverSlot::optional(*id)).collect()
    }

    fn empty_log(rule: &RuleDefinition) -> ApproverDecisionLog {
        ApproverDecisionLog::new(RequestId("EXP-1".to_string()), rule.rule_id().clone())
    }

    fn entry(approver: &str, decision: Decision) -> DecisionEntry {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        DecisionEntry::new(UserId::new(approver), decision, at)
    }

    fn decide(
        rule: &RuleDefinition,
        log: &mut ApproverDecisionLog,
        approver: &str,
        decision: Decision,
    ) -> WorkflowStatus {
        WorkflowEvaluator::new()
            .append(rule, log, entry(approver, decision))
            .expect("append should succeed")
            .status
    }

    #[test]
    fn new_request_is_pending_with_all_parallel_approvers_eligible() {
        let rule = rule(true, optional(&["a", "b"]), false, 100);
        let evaluation = WorkflowEvaluator::new().evaluate(&rule, &empty_log(&rule));

        assert_eq!(evaluation.status, WorkflowStatus::Pending);
        assert_eq!(
            evaluation.eligible_ids(),
            vec![UserId::new("mgr"), UserId::new("a"), UserId::new("b")]
        );
        assert_eq!(evaluation.total_weight, 3);
    }

    #[test]
    fn threshold_of_sixty_percent_over_five_approvers() {
        let rule = rule(false, optional(&["a", "b", "c", "d", "e"]), false, 60);

        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "a", Decision::Approve);
        assert_eq!(decide(&rule, &mut log, "b", Decision::Approve), WorkflowStatus::Pending);
        let evaluation = WorkflowEvaluator::new()
            .append(&rule, &mut log, entry("c", Decision::Approve))
            .expect("append");
        assert_eq!(evaluation.status, WorkflowStatus::Approved);
        assert_eq!(evaluation.resolution, Some(Resolution::ThresholdMet));
        assert!(evaluation.eligible.is_empty());

        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "a", Decision::Approve);
        decide(&rule, &mut log, "b", Decision::Approve);
        decide(&rule, &mut log, "c", Decision::Reject);
        decide(&rule, &mut log, "d", Decision::Reject);
        let evaluation = WorkflowEvaluator::new()
            .append(&rule, &mut log, entry("e", Decision::Reject))
            .expect("append");
        assert_eq!(evaluation.status, WorkflowStatus::Rejected);
        assert_eq!(evaluation.resolution, Some(Resolution::ThresholdNotMet));
        assert_eq!(evaluation.approved_weight, 2);
    }

    #[test]
    fn required_reject_vetoes_regardless_of_percentage() {
        let rule = rule(
            false,
            vec![
                ApproverSlot::optional("a"),
                ApproverSlot::optional("b"),
                ApproverSlot::required("x"),
            ],
            false,
            50,
        );
        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "a", Decision::Approve);

        let evaluation = WorkflowEvaluator::new()
            .append(&rule, &mut log, entry("x", Decision::Reject))
            .expect("append");
        assert_eq!(evaluation.status, WorkflowStatus::Rejected);
        assert_eq!(
            evaluation.resolution,
            Some(Resolution::RequiredVeto { approver_id: UserId::new("x") })
        );
    }

    #[test]
    fn veto_wins_over_an_already_met_threshold_in_a_restored_log() {
        let rule =
            rule(false, vec![ApproverSlot::optional("a"), ApproverSlot::required("x")], false, 50);
        let log = ApproverDecisionLog::restore(
            RequestId("EXP-1".to_string()),
            rule.rule_id().clone(),
            vec![entry("a", Decision::Approve), entry("x", Decision::Reject)],
        )
        .expect("restore");

        let evaluation = WorkflowEvaluator::new().evaluate(&rule, &log);
        assert_eq!(evaluation.status, WorkflowStatus::Rejected);
        assert!(matches!(evaluation.resolution, Some(Resolution::RequiredVeto { .. })));
    }

    #[test]
    fn manager_rejection_is_a_required_veto() {
        let rule = rule(true, optional(&["a"]), true, 50);
        let mut log = empty_log(&rule);

        assert_eq!(decide(&rule, &mut log, "mgr", Decision::Reject), WorkflowStatus::Rejected);
    }

    #[test]
    fn manager_approver_scenario_with_optional_reject_fails_threshold() {
        let rule = rule(
            true,
            vec![ApproverSlot::required("x"), ApproverSlot::optional("y")],
            false,
            100,
        );
        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "mgr", Decision::Approve);
        decide(&rule, &mut log, "x", Decision::Approve);

        let evaluation = WorkflowEvaluator::new()
            .append(&rule, &mut log, entry("y", Decision::Reject))
            .expect("append");
        assert_eq!(evaluation.status, WorkflowStatus::Rejected);
        assert_eq!(evaluation.resolution, Some(Resolution::ThresholdNotMet));
        assert_eq!((evaluation.approved_weight, evaluation.total_weight), (2, 3));
    }

    #[test]
    fn sequential_mode_gates_later_ranks() {
        let rule = rule(false, optional(&["a", "b", "c"]), true, 100);
        let evaluator = WorkflowEvaluator::new();
        let mut log = empty_log(&rule);

        let error = evaluator
            .append(&rule, &mut log, entry("b", Decision::Approve))
            .expect_err("b is not yet eligible");
        assert_eq!(
            error,
            DecisionError::ApproverNotEligible {
                approver_id: UserId::new("b"),
                awaiting: vec![UserId::new("a")],
            }
        );
        assert!(log.is_empty());

        decide(&rule, &mut log, "a", Decision::Approve);
        assert_eq!(evaluator.evaluate(&rule, &log).eligible_ids(), vec![UserId::new("b")]);
    }

    #[test]
    fn sequential_optional_reject_advances_with_zero_weight() {
        let rule = rule(false, optional(&["a", "b", "c"]), true, 60);
        let evaluator = WorkflowEvaluator::new();
        let mut log = empty_log(&rule);

        assert_eq!(decide(&rule, &mut log, "a", Decision::Reject), WorkflowStatus::Pending);
        assert_eq!(evaluator.evaluate(&rule, &log).eligible_ids(), vec![UserId::new("b")]);
        assert_eq!(decide(&rule, &mut log, "b", Decision::Approve), WorkflowStatus::Pending);
        assert_eq!(decide(&rule, &mut log, "c", Decision::Approve), WorkflowStatus::Approved);
    }

    #[test]
    fn sequential_exits_early_once_threshold_is_met() {
        let rule = rule(false, optional(&["a", "b", "c", "d"]), true, 50);
        let mut log = empty_log(&rule);

        decide(&rule, &mut log, "a", Decision::Approve);
        assert_eq!(decide(&rule, &mut log, "b", Decision::Approve), WorkflowStatus::Approved);
    }

    #[test]
    fn sequential_ignores_decisions_beyond_the_frontier() {
        let rule = rule(false, optional(&["a", "b"]), true, 50);
        let log = ApproverDecisionLog::restore(
            RequestId("EXP-1".to_string()),
            rule.rule_id().clone(),
            vec![entry("b", Decision::Approve)],
        )
        .expect("restore");

        let evaluation = WorkflowEvaluator::new().evaluate(&rule, &log);
        assert_eq!(evaluation.status, WorkflowStatus::Pending);
        assert_eq!(evaluation.approved_weight, 0);
        assert_eq!(evaluation.eligible_ids(), vec![UserId::new("a")]);
    }

    #[test]
    fn parallel_order_does_not_change_final_status() {
        let rule = rule(
            true,
            vec![
                ApproverSlot::optional("a"),
                ApproverSlot::optional("b"),
                ApproverSlot::optional("c"),
            ],
            false,
            75,
        );
        let decisions = [
            ("mgr", Decision::Approve),
            ("a", Decision::Reject),
            ("b", Decision::Approve),
            ("c", Decision::Approve),
        ];
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        let evaluator = WorkflowEvaluator::new();
        let outcomes: Vec<WorkflowStatus> = orders
            .iter()
            .map(|order| {
                let mut log = empty_log(&rule);
                let mut status = WorkflowStatus::Pending;
                for index in order {
                    let (approver, decision) = decisions[*index];
                    if status.is_terminal() {
                        break;
                    }
                    status = evaluator
                        .append(&rule, &mut log, entry(approver, decision))
                        .expect("append")
                        .status;
                }
                status
            })
            .collect();

        assert!(outcomes.iter().all(|status| *status == WorkflowStatus::Approved));
    }

    #[test]
    fn duplicate_decision_is_rejected_even_when_it_agrees() {
        let rule = rule(false, optional(&["a", "b"]), false, 100);
        let evaluator = WorkflowEvaluator::new();
        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "a", Decision::Approve);

        for decision in [Decision::Approve, Decision::Reject] {
            let error = evaluator
                .append(&rule, &mut log, entry("a", decision))
                .expect_err("duplicate must fail");
            assert_eq!(error, DecisionError::DuplicateDecision { approver_id: UserId::new("a") });
        }
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn duplicate_check_precedes_terminal_check() {
        let rule = rule(false, optional(&["a", "b"]), false, 50);
        let evaluator = WorkflowEvaluator::new();
        let mut log = empty_log(&rule);
        assert_eq!(decide(&rule, &mut log, "a", Decision::Approve), WorkflowStatus::Approved);

        let duplicate = evaluator.append(&rule, &mut log, entry("a", Decision::Approve));
        assert!(matches!(duplicate, Err(DecisionError::DuplicateDecision { .. })));

        let late = evaluator.append(&rule, &mut log, entry("b", Decision::Reject));
        assert_eq!(
            late,
            Err(DecisionError::WorkflowAlreadyResolved { status: WorkflowStatus::Approved })
        );
        assert_eq!(evaluator.evaluate(&rule, &log).status, WorkflowStatus::Approved);
    }

    #[test]
    fn unknown_approver_is_rejected() {
        let rule = rule(false, optional(&["a"]), false, 100);
        let mut log = empty_log(&rule);

        let error = WorkflowEvaluator::new()
            .append(&rule, &mut log, entry("mgr", Decision::Approve))
            .expect_err("manager is not an approver on this rule");
        assert_eq!(error, DecisionError::UnknownApprover { approver_id: UserId::new("mgr") });
    }

    #[test]
    fn log_bound_to_other_rule_is_rejected() {
        let rule_a = rule(false, optional(&["a"]), false, 100);
        let rule_b = rule(false, optional(&["a"]), false, 100);
        let mut log = empty_log(&rule_a);

        let error = WorkflowEvaluator::new()
            .append(&rule_b, &mut log, entry("a", Decision::Approve))
            .expect_err("mismatched rule");
        assert!(matches!(error, DecisionError::RuleMismatch { .. }));
    }

    #[test]
    fn evaluation_is_deterministic_and_ignores_timestamps() {
        let rule = rule(true, optional(&["a", "b"]), true, 67);
        let mut log = empty_log(&rule);
        decide(&rule, &mut log, "mgr", Decision::Approve);

        let evaluator = WorkflowEvaluator::new();
        let first = evaluator.evaluate(&rule, &log);
        assert_eq!(first, evaluator.evaluate(&rule, &log));

        let shifted: Vec<DecisionEntry> = log
            .decisions()
            .iter()
            .cloned()
            .map(|mut entry| {
                entry.decided_at = entry.decided_at + Duration::days(30);
                entry
            })
            .collect();
        let shifted_log =
            ApproverDecisionLog::restore(log.request_id().clone(), log.rule_id().clone(), shifted)
                .expect("restore");
        assert_eq!(evaluator.evaluate(&rule, &shifted_log), first);
    }

    #[test]
    fn append_with_audit_records_success_and_rejection() {
        let rule = rule(false, optional(&["a"]), false, 100);
        let evaluator = WorkflowEvaluator::new();
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(None, "corr-1", "approver:a");
        let mut log = empty_log(&rule);

        evaluator
            .append_with_audit(&rule, &mut log, entry("a", Decision::Approve), &sink, &audit)
            .expect("append");
        let _ = evaluator.append_with_audit(
            &rule,
            &mut log,
            entry("a", Decision::Approve),
            &sink,
            &audit,
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Success);
        assert_eq!(events[0].metadata.get("status").map(String::as_str), Some("approved"));
        assert_eq!(events[1].outcome, AuditOutcome::Rejected);
        assert_eq!(events[1].correlation_id, "corr-1");
    }
}
