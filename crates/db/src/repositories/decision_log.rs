use chrono::Utc;
use sqlx::Row;

use expensa_core::domain::decision::{ApproverDecisionLog, Decision, DecisionEntry};
use expensa_core::domain::expense::RequestId;
use expensa_core::domain::org::UserId;
use expensa_core::domain::rule::RuleId;

use super::{
    decode_error, decode_timestamp, encode_timestamp, DecisionLogRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlDecisionLogRepository {
    pool: DbPool,
}

impl SqlDecisionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn log_exists(&self, request_id: &RequestId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 AS present FROM approver_decision_log WHERE request_id = ?")
            .bind(&request_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DecisionEntry, RepositoryError> {
    let approver_id: String = row.try_get("approver_id").map_err(decode_error)?;
    let decision_str: String = row.try_get("decision").map_err(decode_error)?;
    let comment: Option<String> = row.try_get("comment").map_err(decode_error)?;
    let decided_at_str: String = row.try_get("decided_at").map_err(decode_error)?;

    let decision = Decision::parse(&decision_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown decision `{decision_str}`")))?;

    Ok(DecisionEntry {
        approver_id: UserId(approver_id),
        decision,
        decided_at: decode_timestamp(&decided_at_str)?,
        comment,
    })
}

fn sequence_value(position: usize) -> Result<i64, RepositoryError> {
    i64::try_from(position).map_err(decode_error)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl DecisionLogRepository for SqlDecisionLogRepository {
    async fn create(&self, log: &ApproverDecisionLog) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO approver_decision_log (request_id, rule_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(request_id) DO NOTHING",
        )
        .bind(&log.request_id().0)
        .bind(&log.rule_id().0)
        .bind(encode_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists {
                entity: "decision log",
                id: log.request_id().0.clone(),
            });
        }

        for (position, entry) in log.decisions().iter().enumerate() {
            sqlx::query(
                "INSERT INTO approver_decision (request_id, sequence, approver_id, decision,
                                                comment, decided_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&log.request_id().0)
            .bind(sequence_value(position)?)
            .bind(&entry.approver_id.0)
            .bind(entry.decision.as_str())
            .bind(&entry.comment)
            .bind(encode_timestamp(entry.decided_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<ApproverDecisionLog>, RepositoryError> {
        let log_row =
            sqlx::query("SELECT rule_id FROM approver_decision_log WHERE request_id = ?")
                .bind(&request_id.0)
                .fetch_optional(&self.pool)
                .await?;

        let Some(log_row) = log_row else {
            return Ok(None);
        };
        let rule_id: String = log_row.try_get("rule_id").map_err(decode_error)?;

        let rows = sqlx::query(
            "SELECT approver_id, decision, comment, decided_at
             FROM approver_decision
             WHERE request_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;

        let decisions = rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;
        ApproverDecisionLog::restore(request_id.clone(), RuleId(rule_id), decisions)
            .map(Some)
            .map_err(decode_error)
    }

    async fn append(
        &self,
        request_id: &RequestId,
        expected_len: usize,
        entry: &DecisionEntry,
    ) -> Result<(), RepositoryError> {
        let expected = sequence_value(expected_len)?;

        // The row is written only while the stored length still equals the
        // caller's snapshot, so two writers racing on the same snapshot cannot
        // both succeed.
        let result = sqlx::query(
            "INSERT INTO approver_decision (request_id, sequence, approver_id, decision,
                                            comment, decided_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM approver_decision_log WHERE request_id = ?)
               AND (SELECT COUNT(*) FROM approver_decision WHERE request_id = ?) = ?",
        )
        .bind(&request_id.0)
        .bind(expected)
        .bind(&entry.approver_id.0)
        .bind(entry.decision.as_str())
        .bind(&entry.comment)
        .bind(encode_timestamp(entry.decided_at))
        .bind(&request_id.0)
        .bind(&request_id.0)
        .bind(expected)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(error) if is_unique_violation(&error) => {
                return Err(RepositoryError::ConcurrentModification {
                    request_id: request_id.clone(),
                });
            }
            Err(error) => return Err(error.into()),
        };

        if result.rows_affected() == 0 {
            if !self.log_exists(request_id).await? {
                return Err(RepositoryError::NotFound {
                    entity: "decision log",
                    id: request_id.0.clone(),
                });
            }
            tracing::debug!(
                event_name = "db.decision_log.stale_append",
                request_id = %request_id.0,
                expected_len,
                "decision log changed since it was read"
            );
            return Err(RepositoryError::ConcurrentModification { request_id: request_id.clone() });
        }

        Ok(())
    }
}
