use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use expensa_core::domain::decision::{ApproverDecisionLog, DecisionEntry};
use expensa_core::domain::expense::{ExpenseRequest, ExpenseStatus, RequestId};
use expensa_core::domain::org::UserId;
use expensa_core::domain::rule::{RuleDefinition, RuleId};

pub mod decision_log;
pub mod expense;
pub mod memory;
pub mod rule;

pub use decision_log::SqlDecisionLogRepository;
pub use expense::SqlExpenseRepository;
pub use memory::{
    InMemoryDecisionLogRepository, InMemoryExpenseRepository, InMemoryRuleRepository,
};
pub use rule::SqlRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("decision log for `{}` changed since it was read", request_id.0)]
    ConcurrentModification { request_id: RequestId },
    #[error("{entity} `{id}` already exists")]
    AlreadyExists { entity: &'static str, id: String },
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
}

/// Storage for approval rules. Rules are immutable once inserted.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn insert(&self, rule: &RuleDefinition) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<RuleDefinition>, RepositoryError>;
    async fn latest_for_subject(
        &self,
        subject_user_id: &UserId,
    ) -> Result<Option<RuleDefinition>, RepositoryError>;
}

#[async_trait]
pub trait DecisionLogRepository: Send + Sync {
    async fn create(&self, log: &ApproverDecisionLog) -> Result<(), RepositoryError>;

    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<ApproverDecisionLog>, RepositoryError>;

    /// Appends `entry` only if the stored log still holds exactly
    /// `expected_len` decisions. Otherwise fails with
    /// [`RepositoryError::ConcurrentModification`] and writes nothing.
    async fn append(
        &self,
        request_id: &RequestId,
        expected_len: usize,
        entry: &DecisionEntry,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn save(&self, expense: &ExpenseRequest) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ExpenseRequest>, RepositoryError>;
    async fn update_status(
        &self,
        id: &RequestId,
        status: ExpenseStatus,
    ) -> Result<(), RepositoryError>;
    async fn list_by_status(
        &self,
        status: ExpenseStatus,
        limit: u32,
    ) -> Result<Vec<ExpenseRequest>, RepositoryError>;
    /// Removes a request that never got a decision log. Missing ids are a no-op.
    async fn delete(&self, id: &RequestId) -> Result<(), RepositoryError>;
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

/// Fixed-width timestamps keep lexical ordering in SQL equal to time ordering.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(decode_error)
}
