use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use expensa_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use expensa_core::config::WorkflowConfig;
use expensa_core::domain::decision::{ApproverDecisionLog, Decision, DecisionEntry};
use expensa_core::domain::expense::{ExpenseDraft, ExpenseRequest, ExpenseStatus, RequestId};
use expensa_core::domain::org::{Member, UserId};
use expensa_core::domain::rule::{RuleDefinition, RuleId, RuleSpec};
use expensa_core::errors::{ApplicationError, DomainError};
use expensa_core::notify::{Notifier, RoutingNotice};
use expensa_core::workflow::{Evaluation, RequestRouter, RoutingPlan, WorkflowEvaluator};

use crate::repositories::{
    DecisionLogRepository, ExpenseRepository, RepositoryError, RuleRepository,
};

/// Result of submitting an expense: the stored request and who must act first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedExpense {
    pub expense: ExpenseRequest,
    pub evaluation: Evaluation,
    pub plan: RoutingPlan,
}

/// Drives approval workflows over the repositories.
///
/// Every decision goes through a read-evaluate-append loop: the log is read,
/// the candidate decision is validated against it, and the append only lands
/// if the log is still the one that was read. Lost races are retried up to
/// `WorkflowConfig::max_append_attempts` times.
pub struct ApprovalWorkflowService {
    rules: Arc<dyn RuleRepository>,
    logs: Arc<dyn DecisionLogRepository>,
    expenses: Arc<dyn ExpenseRepository>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    config: WorkflowConfig,
    evaluator: WorkflowEvaluator,
    router: RequestRouter,
}

impl ApprovalWorkflowService {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        logs: Arc<dyn DecisionLogRepository>,
        expenses: Arc<dyn ExpenseRepository>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        config: WorkflowConfig,
    ) -> Self {
        let evaluator = WorkflowEvaluator::new();
        Self {
            rules,
            logs,
            expenses,
            notifier,
            audit,
            config,
            router: RequestRouter::new(evaluator.clone()),
            evaluator,
        }
    }

    pub async fn register_rule(
        &self,
        actor: &Member,
        spec: RuleSpec,
    ) -> Result<RuleDefinition, ApplicationError> {
        let correlation_id = self.correlation_id();
        let audit = AuditContext::new(None, &correlation_id, actor.user_id.as_str());

        if !actor.is_admin() {
            self.emit(
                &audit,
                "rule.create_denied",
                AuditCategory::Rule,
                AuditOutcome::Rejected,
                |event| event.with_metadata("role", actor.role.as_str()),
            );
            warn!(
                event_name = "workflow.rule.forbidden",
                correlation_id = %correlation_id,
                actor = %actor.user_id.0,
                role = actor.role.as_str(),
                "non-admin attempted to create an approval rule"
            );
            return Err(ApplicationError::Forbidden(format!(
                "member `{}` may not create approval rules",
                actor.user_id.0
            )));
        }

        let rule = RuleDefinition::create(spec)?;
        self.rules.insert(&rule).await.map_err(map_repository_error)?;

        self.emit(&audit, "rule.created", AuditCategory::Rule, AuditOutcome::Success, |event| {
            event
                .with_metadata("rule_id", rule.rule_id().0.clone())
                .with_metadata("subject_user_id", rule.subject_user_id().0.clone())
                .with_metadata("sequential", rule.sequential().to_string())
        });
        info!(
            event_name = "workflow.rule.created",
            correlation_id = %correlation_id,
            rule_id = %rule.rule_id().0,
            subject_user_id = %rule.subject_user_id().0,
            approvers = rule.total_weight(),
            "approval rule created"
        );
        Ok(rule)
    }

    pub async fn submit(
        &self,
        draft: ExpenseDraft,
        rule_id: &RuleId,
    ) -> Result<SubmittedExpense, ApplicationError> {
        let rule = self.load_rule(rule_id).await?;
        self.submit_under(draft, rule).await
    }

    /// Submits under the newest rule registered for the draft's employee.
    pub async fn submit_with_latest_rule(
        &self,
        draft: ExpenseDraft,
    ) -> Result<SubmittedExpense, ApplicationError> {
        let rule = self
            .rules
            .latest_for_subject(&draft.employee)
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| ApplicationError::NotFound {
                entity: "approval rule for employee",
                id: draft.employee.0.clone(),
            })?;
        self.submit_under(draft, rule).await
    }

    pub async fn record_decision(
        &self,
        request_id: &RequestId,
        approver_id: &UserId,
        decision: Decision,
        decided_at: DateTime<Utc>,
    ) -> Result<Evaluation, ApplicationError> {
        let correlation_id = self.correlation_id();
        let audit =
            AuditContext::new(Some(request_id.clone()), &correlation_id, approver_id.as_str());
        let expense = self.load_expense(request_id).await?;
        let rule = self.load_rule(&expense.rule_id).await?;
        let entry = DecisionEntry::new(approver_id.clone(), decision, decided_at);
        let max_attempts = self.config.max_append_attempts.max(1);

        for attempt in 1..=max_attempts {
            let log = self.load_log(request_id).await?;
            let previous = self.evaluator.evaluate(&rule, &log);

            let mut candidate = log.clone();
            let evaluation = match self.evaluator.append(&rule, &mut candidate, entry.clone()) {
                Ok(evaluation) => evaluation,
                Err(error) => {
                    self.emit(
                        &audit,
                        "workflow.decision_rejected",
                        AuditCategory::Decision,
                        AuditOutcome::Rejected,
                        |event| {
                            event
                                .with_metadata("decision", decision.as_str())
                                .with_metadata("error", error.to_string())
                        },
                    );
                    warn!(
                        event_name = "workflow.decision.rejected",
                        correlation_id = %correlation_id,
                        request_id = %request_id.0,
                        approver_id = %approver_id.0,
                        error = %error,
                        "decision refused"
                    );
                    return Err(error.into());
                }
            };

            match self.logs.append(request_id, log.len(), &entry).await {
                Ok(()) => {
                    self.after_append(&rule, &expense, &previous, &evaluation, &audit, decision)
                        .await;
                    info!(
                        event_name = "workflow.decision.appended",
                        correlation_id = %correlation_id,
                        request_id = %request_id.0,
                        approver_id = %approver_id.0,
                        decision = decision.as_str(),
                        status = evaluation.status.as_str(),
                        attempt,
                        "decision recorded"
                    );
                    return Ok(evaluation);
                }
                Err(RepositoryError::ConcurrentModification { .. }) => {
                    warn!(
                        event_name = "workflow.decision.conflict",
                        correlation_id = %correlation_id,
                        request_id = %request_id.0,
                        approver_id = %approver_id.0,
                        attempt,
                        max_attempts,
                        "decision log changed concurrently; re-reading"
                    );
                }
                Err(error) => return Err(map_repository_error(error)),
            }
        }

        self.emit(
            &audit,
            "workflow.decision_conflicted",
            AuditCategory::Persistence,
            AuditOutcome::Failed,
            |event| event.with_metadata("attempts", max_attempts.to_string()),
        );
        Err(ApplicationError::ConcurrentModification {
            request_id: request_id.0.clone(),
            attempts: max_attempts,
        })
    }

    pub async fn evaluate(&self, request_id: &RequestId) -> Result<Evaluation, ApplicationError> {
        let log = self.load_log(request_id).await?;
        let rule = self.load_rule(log.rule_id()).await?;
        Ok(self.evaluator.evaluate(&rule, &log))
    }

    pub async fn routing_plan(
        &self,
        request_id: &RequestId,
    ) -> Result<RoutingPlan, ApplicationError> {
        let log = self.load_log(request_id).await?;
        let rule = self.load_rule(log.rule_id()).await?;
        Ok(self.router.route(&rule, &log))
    }

    async fn submit_under(
        &self,
        draft: ExpenseDraft,
        rule: RuleDefinition,
    ) -> Result<SubmittedExpense, ApplicationError> {
        if &draft.employee != rule.subject_user_id() {
            return Err(ApplicationError::Domain(DomainError::InvariantViolation(format!(
                "rule `{}` governs `{}`, not `{}`",
                rule.rule_id().0,
                rule.subject_user_id().0,
                draft.employee.0
            ))));
        }

        let expense = ExpenseRequest::submit(draft, rule.rule_id().clone(), Utc::now());
        let log = ApproverDecisionLog::new(expense.id.clone(), rule.rule_id().clone());
        let correlation_id = self.correlation_id();
        self.expenses.save(&expense).await.map_err(map_repository_error)?;
        if let Err(error) = self.logs.create(&log).await {
            // A request without a decision log can never be decided.
            if let Err(cleanup) = self.expenses.delete(&expense.id).await {
                warn!(
                    event_name = "workflow.expense.orphan_cleanup_failed",
                    correlation_id = %correlation_id,
                    request_id = %expense.id.0,
                    error = %cleanup,
                    "could not remove expense after decision log creation failed"
                );
            }
            return Err(map_repository_error(error));
        }

        let evaluation = self.evaluator.evaluate(&rule, &log);
        let plan = self.router.plan(&rule, &evaluation);

        let audit = AuditContext::new(
            Some(expense.id.clone()),
            &correlation_id,
            expense.draft.employee.as_str(),
        );
        self.emit(
            &audit,
            "expense.submitted",
            AuditCategory::Submission,
            AuditOutcome::Success,
            |event| {
                event
                    .with_metadata("rule_id", rule.rule_id().0.clone())
                    .with_metadata("amount", expense.draft.amount.to_string())
                    .with_metadata("currency", expense.draft.currency.clone())
            },
        );
        info!(
            event_name = "workflow.expense.submitted",
            correlation_id = %correlation_id,
            request_id = %expense.id.0,
            rule_id = %rule.rule_id().0,
            next_approvers = plan.approvers.len(),
            "expense submitted for approval"
        );

        self.notifier.notify(RoutingNotice {
            request_id: expense.id.clone(),
            previous: None,
            current: evaluation.status,
            plan: plan.clone(),
        });

        Ok(SubmittedExpense { expense, evaluation, plan })
    }

    async fn after_append(
        &self,
        rule: &RuleDefinition,
        expense: &ExpenseRequest,
        previous: &Evaluation,
        evaluation: &Evaluation,
        audit: &AuditContext,
        decision: Decision,
    ) {
        // Once appended the decision stands; the status column only mirrors the log.
        if evaluation.status.is_terminal() && evaluation.status != previous.status {
            let status = ExpenseStatus::from(evaluation.status);
            if let Err(error) = self.expenses.update_status(&expense.id, status).await {
                self.emit(
                    audit,
                    "expense.status_update_failed",
                    AuditCategory::Persistence,
                    AuditOutcome::Failed,
                    |event| {
                        event
                            .with_metadata("status", status.as_str())
                            .with_metadata("error", error.to_string())
                    },
                );
                warn!(
                    event_name = "workflow.expense.status_update_failed",
                    correlation_id = %audit.correlation_id,
                    request_id = %expense.id.0,
                    status = status.as_str(),
                    error = %error,
                    "decision recorded but expense status was not updated"
                );
            }
        }

        self.emit(
            audit,
            "workflow.decision_appended",
            AuditCategory::Decision,
            AuditOutcome::Success,
            |event| {
                event
                    .with_metadata("decision", decision.as_str())
                    .with_metadata("status", evaluation.status.as_str())
                    .with_metadata(
                        "approved_weight",
                        format!("{}/{}", evaluation.approved_weight, evaluation.total_weight),
                    )
            },
        );

        let previous_plan = self.router.plan(rule, previous);
        let plan = self.router.plan(rule, evaluation);
        if previous.status != evaluation.status || previous_plan.approvers != plan.approvers {
            self.notifier.notify(RoutingNotice {
                request_id: expense.id.clone(),
                previous: Some(previous.status),
                current: evaluation.status,
                plan,
            });
        }
    }

    async fn load_expense(&self, id: &RequestId) -> Result<ExpenseRequest, ApplicationError> {
        self.expenses.find_by_id(id).await.map_err(map_repository_error)?.ok_or_else(|| {
            ApplicationError::NotFound { entity: "expense request", id: id.0.clone() }
        })
    }

    async fn load_rule(&self, id: &RuleId) -> Result<RuleDefinition, ApplicationError> {
        self.rules
            .find_by_id(id)
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| ApplicationError::NotFound { entity: "approval rule", id: id.0.clone() })
    }

    async fn load_log(&self, id: &RequestId) -> Result<ApproverDecisionLog, ApplicationError> {
        self.logs.find_by_request(id).await.map_err(map_repository_error)?.ok_or_else(|| {
            ApplicationError::NotFound { entity: "decision log", id: id.0.clone() }
        })
    }

    fn correlation_id(&self) -> String {
        format!("{}-{}", self.config.correlation_prefix, Uuid::new_v4())
    }

    fn emit(
        &self,
        context: &AuditContext,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        decorate: impl FnOnce(AuditEvent) -> AuditEvent,
    ) {
        let event = AuditEvent::new(
            context.request_id.clone(),
            context.correlation_id.clone(),
            event_type,
            category,
            context.actor.clone(),
            outcome,
        );
        self.audit.emit(decorate(event));
    }
}

fn map_repository_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::NotFound { entity, id } => ApplicationError::NotFound { entity, id },
        RepositoryError::ConcurrentModification { request_id } => {
            ApplicationError::ConcurrentModification { request_id: request_id.0, attempts: 1 }
        }
        other => ApplicationError::Persistence(other.to_string()),
    }
}
