use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::org::{Member, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn generate() -> Self {
        Self(format!("RULE-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSlot {
    pub approver_id: UserId,
    #[serde(default)]
    pub required: bool,
}

impl ApproverSlot {
    pub fn required(approver_id: impl Into<String>) -> Self {
        Self { approver_id: UserId::new(approver_id), required: true }
    }

    pub fn optional(approver_id: impl Into<String>) -> Self {
        Self { approver_id: UserId::new(approver_id), required: false }
    }
}

/// Administrator input for a new approval rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub subject_user_id: UserId,
    pub manager_id: UserId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_manager_approver: bool,
    pub approvers: Vec<ApproverSlot>,
    #[serde(default)]
    pub sequential: bool,
    pub min_approval_percentage: u32,
}

impl RuleSpec {
    /// Starts a parallel rule for `subject`, taking the manager from the
    /// member record.
    pub fn for_member(
        subject: &Member,
        approvers: Vec<ApproverSlot>,
        min_approval_percentage: u32,
    ) -> Result<Self, RuleValidationError> {
        let manager_id = subject.manager_id.clone().ok_or_else(|| {
            RuleValidationError::MissingManager { subject_user_id: subject.user_id.clone() }
        })?;
        Ok(Self {
            subject_user_id: subject.user_id.clone(),
            manager_id,
            description: String::new(),
            is_manager_approver: false,
            approvers,
            sequential: false,
            min_approval_percentage,
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleValidationError {
    #[error("approval rule must name at least one approver")]
    EmptyApproverSet,
    #[error("approver `{}` appears more than once in the effective approver set", approver_id.0)]
    DuplicateApprover { approver_id: UserId },
    #[error("minimum approval percentage {value} is outside 1..=100")]
    PercentageOutOfRange { value: u32 },
    #[error("member `{}` has no manager on record", subject_user_id.0)]
    MissingManager { subject_user_id: UserId },
}

/// One member of the effective approver set, in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveApprover {
    pub approver_id: UserId,
    pub required: bool,
    pub rank: usize,
    pub is_manager: bool,
}

/// An immutable, validated approval rule. There is no update path: a changed
/// rule is a new `RuleDefinition` with a new id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleDocument")]
pub struct RuleDefinition {
    rule_id: RuleId,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    spec: RuleSpec,
}

#[derive(Deserialize)]
struct RuleDocument {
    rule_id: RuleId,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    spec: RuleSpec,
}

impl TryFrom<RuleDocument> for RuleDefinition {
    type Error = RuleValidationError;

    fn try_from(document: RuleDocument) -> Result<Self, Self::Error> {
        Self::from_parts(document.rule_id, document.created_at, document.spec)
    }
}

impl RuleDefinition {
    pub fn create(spec: RuleSpec) -> Result<Self, RuleValidationError> {
        Self::from_parts(RuleId::generate(), Utc::now(), spec)
    }

    /// Rebuilds a rule from stored parts, re-running validation.
    pub fn from_parts(
        rule_id: RuleId,
        created_at: DateTime<Utc>,
        spec: RuleSpec,
    ) -> Result<Self, RuleValidationError> {
        validate(&spec)?;
        Ok(Self { rule_id, created_at, spec })
    }

    pub fn rule_id(&self) -> &RuleId {
        &self.rule_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn subject_user_id(&self) -> &UserId {
        &self.spec.subject_user_id
    }

    pub fn manager_id(&self) -> &UserId {
        &self.spec.manager_id
    }

    pub fn is_manager_approver(&self) -> bool {
        self.spec.is_manager_approver
    }

    pub fn approvers(&self) -> &[ApproverSlot] {
        &self.spec.approvers
    }

    pub fn sequential(&self) -> bool {
        self.spec.sequential
    }

    pub fn min_approval_percentage(&self) -> u32 {
        self.spec.min_approval_percentage
    }

    /// The configured approvers, prefixed with the manager at rank 0 when the
    /// manager is an implicit approver. The manager slot is always required.
    pub fn effective_approvers(&self) -> Vec<EffectiveApprover> {
        let manager =
            self.spec.is_manager_approver.then(|| (self.spec.manager_id.clone(), true, true));
        manager
            .into_iter()
            .chain(
                self.spec
                    .approvers
                    .iter()
                    .map(|slot| (slot.approver_id.clone(), slot.required, false)),
            )
            .enumerate()
            .map(|(rank, (approver_id, required, is_manager))| EffectiveApprover {
                approver_id,
                required,
                rank,
                is_manager,
            })
            .collect()
    }

    pub fn effective_approver(&self, approver_id: &UserId) -> Option<EffectiveApprover> {
        self.effective_approvers().into_iter().find(|approver| &approver.approver_id == approver_id)
    }

    pub fn total_weight(&self) -> u32 {
        let manager = u32::from(self.spec.is_manager_approver);
        manager + self.spec.approvers.len() as u32
    }
}

fn validate(spec: &RuleSpec) -> Result<(), RuleValidationError> {
    if spec.approvers.is_empty() {
        return Err(RuleValidationError::EmptyApproverSet);
    }

    let mut seen = HashSet::new();
    if spec.is_manager_approver {
        seen.insert(&spec.manager_id);
    }
    for slot in &spec.approvers {
        if !seen.insert(&slot.approver_id) {
            return Err(RuleValidationError::DuplicateApprover {
                approver_id: slot.approver_id.clone(),
            });
        }
    }

    if !(1..=100).contains(&spec.min_approval_percentage) {
        return Err(RuleValidationError::PercentageOutOfRange {
            value: spec.min_approval_percentage,
        });
    }

    Ok(())
}
