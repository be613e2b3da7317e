use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use expensa_core::domain::decision::{ApproverDecisionLog, DecisionEntry};
use expensa_core::domain::expense::{ExpenseRequest, ExpenseStatus, RequestId};
use expensa_core::domain::org::UserId;
use expensa_core::domain::rule::{RuleDefinition, RuleId};

use super::{
    decode_error, DecisionLogRepository, ExpenseRepository, RepositoryError, RuleRepository,
};

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, RuleDefinition>>,
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn insert(&self, rule: &RuleDefinition) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.rule_id().0) {
            return Err(RepositoryError::AlreadyExists {
                entity: "approval rule",
                id: rule.rule_id().0.clone(),
            });
        }
        rules.insert(rule.rule_id().0.clone(), rule.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<RuleDefinition>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&id.0).cloned())
    }

    async fn latest_for_subject(
        &self,
        subject_user_id: &UserId,
    ) -> Result<Option<RuleDefinition>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules
            .values()
            .filter(|rule| rule.subject_user_id() == subject_user_id)
            .max_by(|a, b| {
                a.created_at().cmp(&b.created_at()).then_with(|| a.rule_id().0.cmp(&b.rule_id().0))
            })
            .cloned())
    }
}

struct StoredLog {
    rule_id: RuleId,
    decisions: Vec<DecisionEntry>,
}

#[derive(Default)]
pub struct InMemoryDecisionLogRepository {
    logs: RwLock<HashMap<String, StoredLog>>,
}

#[async_trait::async_trait]
impl DecisionLogRepository for InMemoryDecisionLogRepository {
    async fn create(&self, log: &ApproverDecisionLog) -> Result<(), RepositoryError> {
        let mut logs = self.logs.write().await;
        if logs.contains_key(&log.request_id().0) {
            return Err(RepositoryError::AlreadyExists {
                entity: "decision log",
                id: log.request_id().0.clone(),
            });
        }
        logs.insert(
            log.request_id().0.clone(),
            StoredLog { rule_id: log.rule_id().clone(), decisions: log.decisions().to_vec() },
        );
        Ok(())
    }

    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<ApproverDecisionLog>, RepositoryError> {
        let logs = self.logs.read().await;
        logs.get(&request_id.0)
            .map(|stored| {
                ApproverDecisionLog::restore(
                    request_id.clone(),
                    stored.rule_id.clone(),
                    stored.decisions.clone(),
                )
                .map_err(decode_error)
            })
            .transpose()
    }

    async fn append(
        &self,
        request_id: &RequestId,
        expected_len: usize,
        entry: &DecisionEntry,
    ) -> Result<(), RepositoryError> {
        let mut logs = self.logs.write().await;
        let stored = logs.get_mut(&request_id.0).ok_or_else(|| RepositoryError::NotFound {
            entity: "decision log",
            id: request_id.0.clone(),
        })?;

        let already_decided =
            stored.decisions.iter().any(|existing| existing.approver_id == entry.approver_id);
        if stored.decisions.len() != expected_len || already_decided {
            return Err(RepositoryError::ConcurrentModification { request_id: request_id.clone() });
        }

        stored.decisions.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: RwLock<HashMap<String, ExpenseRequest>>,
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn save(&self, expense: &ExpenseRequest) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        expenses.insert(expense.id.0.clone(), expense.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ExpenseRequest>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.get(&id.0).cloned())
    }

    async fn update_status(
        &self,
        id: &RequestId,
        status: ExpenseStatus,
    ) -> Result<(), RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let expense = expenses.get_mut(&id.0).ok_or_else(|| RepositoryError::NotFound {
            entity: "expense request",
            id: id.0.clone(),
        })?;
        expense.status = status;
        expense.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ExpenseStatus,
        limit: u32,
    ) -> Result<Vec<ExpenseRequest>, RepositoryError> {
        let expenses = self.expenses.read().await;
        let mut matching: Vec<ExpenseRequest> =
            expenses.values().filter(|expense| expense.status == status).cloned().collect();
        matching.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        matching.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(matching)
    }

    async fn delete(&self, id: &RequestId) -> Result<(), RepositoryError> {
        self.expenses.write().await.remove(&id.0);
        Ok(())
    }
}
