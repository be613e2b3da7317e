use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::expense::RequestId;
use crate::domain::org::UserId;
use crate::domain::rule::RuleId;
use crate::workflow::WorkflowStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub approver_id: UserId,
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl DecisionEntry {
    pub fn new(approver_id: UserId, decision: Decision, decided_at: DateTime<Utc>) -> Self {
        Self { approver_id, decision, decided_at, comment: None }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("approver `{}` is not in the effective approver set", approver_id.0)]
    UnknownApprover { approver_id: UserId },
    #[error("approver `{}` has already decided on this request", approver_id.0)]
    DuplicateDecision { approver_id: UserId },
    #[error("approver `{}` is not yet eligible to decide", approver_id.0)]
    ApproverNotEligible { approver_id: UserId, awaiting: Vec<UserId> },
    #[error("workflow is already resolved as {status:?}")]
    WorkflowAlreadyResolved { status: WorkflowStatus },
    #[error("decision log is bound to rule `{}`, not `{}`", bound.0, offered.0)]
    RuleMismatch { bound: RuleId, offered: RuleId },
}

/// Append-only record of approver decisions for one expense request.
///
/// Entries can only be added through
/// [`WorkflowEvaluator::append`](crate::workflow::WorkflowEvaluator::append),
/// which enforces membership, ordering and terminal-state rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DecisionLogDocument")]
pub struct ApproverDecisionLog {
    request_id: RequestId,
    rule_id: RuleId,
    decisions: Vec<DecisionEntry>,
}

#[derive(Deserialize)]
struct DecisionLogDocument {
    request_id: RequestId,
    rule_id: RuleId,
    #[serde(default)]
    decisions: Vec<DecisionEntry>,
}

impl TryFrom<DecisionLogDocument> for ApproverDecisionLog {
    type Error = DecisionError;

    fn try_from(document: DecisionLogDocument) -> Result<Self, Self::Error> {
        Self::restore(document.request_id, document.rule_id, document.decisions)
    }
}

impl ApproverDecisionLog {
    pub fn new(request_id: RequestId, rule_id: RuleId) -> Self {
        Self { request_id, rule_id, decisions: Vec::new() }
    }

    /// Rebuilds a stored log. Only the one-decision-per-approver invariant is
    /// checked here; membership is checked against the rule on append.
    pub fn restore(
        request_id: RequestId,
        rule_id: RuleId,
        decisions: Vec<DecisionEntry>,
    ) -> Result<Self, DecisionError> {
        let mut log = Self::new(request_id, rule_id);
        for entry in decisions {
            if log.decision_for(&entry.approver_id).is_some() {
                return Err(DecisionError::DuplicateDecision { approver_id: entry.approver_id });
            }
            log.decisions.push(entry);
        }
        Ok(log)
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn rule_id(&self) -> &RuleId {
        &self.rule_id
    }

    pub fn decisions(&self) -> &[DecisionEntry] {
        &self.decisions
    }

    pub fn decision_for(&self, approver_id: &UserId) -> Option<&DecisionEntry> {
        self.decisions.iter().find(|entry| &entry.approver_id == approver_id)
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub(crate) fn push(&mut self, entry: DecisionEntry) {
        self.decisions.push(entry);
    }
}
