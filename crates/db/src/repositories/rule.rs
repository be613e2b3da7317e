use sqlx::Row;

use expensa_core::domain::org::UserId;
use expensa_core::domain::rule::{ApproverSlot, RuleDefinition, RuleId, RuleSpec};

use super::{decode_error, decode_timestamp, encode_timestamp, RepositoryError, RuleRepository};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, subject_user_id, manager_id, description, is_manager_approver,
                            approvers_json, sequential, min_approval_percentage, created_at";

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<RuleDefinition, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let subject_user_id: String = row.try_get("subject_user_id").map_err(decode_error)?;
    let manager_id: String = row.try_get("manager_id").map_err(decode_error)?;
    let description: String = row.try_get("description").map_err(decode_error)?;
    let is_manager_approver: bool = row.try_get("is_manager_approver").map_err(decode_error)?;
    let approvers_json: String = row.try_get("approvers_json").map_err(decode_error)?;
    let sequential: bool = row.try_get("sequential").map_err(decode_error)?;
    let min_approval_percentage: i64 =
        row.try_get("min_approval_percentage").map_err(decode_error)?;
    let created_at_str: String = row.try_get("created_at").map_err(decode_error)?;

    let approvers: Vec<ApproverSlot> =
        serde_json::from_str(&approvers_json).map_err(decode_error)?;
    let created_at = decode_timestamp(&created_at_str)?;
    let min_approval_percentage = u32::try_from(min_approval_percentage).map_err(decode_error)?;

    RuleDefinition::from_parts(
        RuleId(id),
        created_at,
        RuleSpec {
            subject_user_id: UserId(subject_user_id),
            manager_id: UserId(manager_id),
            description,
            is_manager_approver,
            approvers,
            sequential,
            min_approval_percentage,
        },
    )
    .map_err(decode_error)
}

#[async_trait::async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn insert(&self, rule: &RuleDefinition) -> Result<(), RepositoryError> {
        let approvers_json = serde_json::to_string(rule.approvers()).map_err(decode_error)?;

        let result = sqlx::query(
            "INSERT INTO approval_rule (id, subject_user_id, manager_id, description,
                                        is_manager_approver, approvers_json, sequential,
                                        min_approval_percentage, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&rule.rule_id().0)
        .bind(&rule.subject_user_id().0)
        .bind(&rule.manager_id().0)
        .bind(&rule.spec().description)
        .bind(rule.is_manager_approver())
        .bind(approvers_json)
        .bind(rule.sequential())
        .bind(i64::from(rule.min_approval_percentage()))
        .bind(encode_timestamp(rule.created_at()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists {
                entity: "approval rule",
                id: rule.rule_id().0.clone(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<RuleDefinition>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rule WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn latest_for_subject(
        &self,
        subject_user_id: &UserId,
    ) -> Result<Option<RuleDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rule
             WHERE subject_user_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(&subject_user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_rule).transpose()
    }
}
