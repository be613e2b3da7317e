use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::org::UserId;
use crate::domain::rule::RuleId;
use crate::workflow::WorkflowStatus;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("EXP-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    Food,
    Travel,
    Accommodation,
    Office,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::Travel => "travel",
            Self::Accommodation => "accommodation",
            Self::Office => "office",
            Self::Other => "other",
        }
    }

    /// Unrecognized categories are filed under `Other`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "food" | "meals" | "meal" => Self::Food,
            "travel" | "transport" => Self::Travel,
            "accommodation" | "lodging" | "hotel" => Self::Accommodation,
            "office" | "supplies" | "office supplies" => Self::Office,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl From<WorkflowStatus> for ExpenseStatus {
    fn from(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Pending => Self::Pending,
            WorkflowStatus::Approved => Self::Approved,
            WorkflowStatus::Rejected => Self::Rejected,
        }
    }
}

/// Expense fields as entered by an employee or seeded from a receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub employee: UserId,
    pub description: String,
    pub expense_date: NaiveDate,
    pub category: ExpenseCategory,
    pub amount: Decimal,
    pub currency: String,
    pub paid_by: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseRequest {
    pub id: RequestId,
    pub rule_id: RuleId,
    pub draft: ExpenseDraft,
    pub status: ExpenseStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExpenseRequest {
    pub fn submit(draft: ExpenseDraft, rule_id: RuleId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::generate(),
            rule_id,
            draft,
            status: ExpenseStatus::Pending,
            submitted_at,
            updated_at: submitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpenseCategory, ExpenseStatus};
    use crate::workflow::WorkflowStatus;

    #[test]
    fn unknown_category_falls_back_to_other() {
        assert_eq!(ExpenseCategory::parse_lenient("Hotel"), ExpenseCategory::Accommodation);
        assert_eq!(ExpenseCategory::parse_lenient("parking"), ExpenseCategory::Other);
    }

    #[test]
    fn expense_status_mirrors_workflow_status() {
        assert_eq!(ExpenseStatus::from(WorkflowStatus::Approved), ExpenseStatus::Approved);
        assert_eq!(
            ExpenseStatus::parse(ExpenseStatus::Rejected.as_str()),
            Some(ExpenseStatus::Rejected)
        );
    }
}
