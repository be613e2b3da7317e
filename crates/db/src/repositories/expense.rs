use std::str::FromStr;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use expensa_core::domain::expense::{
    ExpenseCategory, ExpenseDraft, ExpenseRequest, ExpenseStatus, RequestId,
};
use expensa_core::domain::org::UserId;
use expensa_core::domain::rule::RuleId;

use super::{decode_error, decode_timestamp, encode_timestamp, ExpenseRepository, RepositoryError};
use crate::DbPool;

const EXPENSE_COLUMNS: &str = "id, rule_id, employee_id, description, expense_date, category,
                               amount, currency, paid_by, remarks, status, submitted_at,
                               updated_at";

pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_expense(row: &sqlx::sqlite::SqliteRow) -> Result<ExpenseRequest, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let rule_id: String = row.try_get("rule_id").map_err(decode_error)?;
    let employee_id: String = row.try_get("employee_id").map_err(decode_error)?;
    let description: String = row.try_get("description").map_err(decode_error)?;
    let expense_date_str: String = row.try_get("expense_date").map_err(decode_error)?;
    let category_str: String = row.try_get("category").map_err(decode_error)?;
    let amount_str: String = row.try_get("amount").map_err(decode_error)?;
    let currency: String = row.try_get("currency").map_err(decode_error)?;
    let paid_by: Option<String> = row.try_get("paid_by").map_err(decode_error)?;
    let remarks: Option<String> = row.try_get("remarks").map_err(decode_error)?;
    let status_str: String = row.try_get("status").map_err(decode_error)?;
    let submitted_at_str: String = row.try_get("submitted_at").map_err(decode_error)?;
    let updated_at_str: String = row.try_get("updated_at").map_err(decode_error)?;

    let expense_date =
        NaiveDate::parse_from_str(&expense_date_str, "%Y-%m-%d").map_err(decode_error)?;
    let amount = Decimal::from_str(&amount_str).map_err(decode_error)?;
    let status = ExpenseStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown expense status `{status_str}`")))?;

    Ok(ExpenseRequest {
        id: RequestId(id),
        rule_id: RuleId(rule_id),
        draft: ExpenseDraft {
            employee: UserId(employee_id),
            description,
            expense_date,
            category: ExpenseCategory::parse_lenient(&category_str),
            amount,
            currency,
            paid_by,
            remarks,
        },
        status,
        submitted_at: decode_timestamp(&submitted_at_str)?,
        updated_at: decode_timestamp(&updated_at_str)?,
    })
}

#[async_trait::async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn save(&self, expense: &ExpenseRequest) -> Result<(), RepositoryError> {
        let draft = &expense.draft;
        sqlx::query(
            "INSERT INTO expense_request (id, rule_id, employee_id, description, expense_date,
                                          category, amount, currency, paid_by, remarks, status,
                                          submitted_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 description = excluded.description,
                 expense_date = excluded.expense_date,
                 category = excluded.category,
                 amount = excluded.amount,
                 currency = excluded.currency,
                 paid_by = excluded.paid_by,
                 remarks = excluded.remarks,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
        )
        .bind(&expense.id.0)
        .bind(&expense.rule_id.0)
        .bind(&draft.employee.0)
        .bind(&draft.description)
        .bind(draft.expense_date.format("%Y-%m-%d").to_string())
        .bind(draft.category.as_str())
        .bind(draft.amount.to_string())
        .bind(&draft.currency)
        .bind(&draft.paid_by)
        .bind(&draft.remarks)
        .bind(expense.status.as_str())
        .bind(encode_timestamp(expense.submitted_at))
        .bind(encode_timestamp(expense.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ExpenseRequest>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expense_request WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.as_ref().map(row_to_expense).transpose()
    }

    async fn update_status(
        &self,
        id: &RequestId,
        status: ExpenseStatus,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE expense_request SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(encode_timestamp(Utc::now()))
                .bind(&id.0)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "expense request", id: id.0.clone() });
        }

        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ExpenseStatus,
        limit: u32,
    ) -> Result<Vec<ExpenseRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expense_request
             WHERE status = ?
             ORDER BY submitted_at ASC
             LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_expense).collect::<Result<Vec<_>, _>>()
    }

    async fn delete(&self, id: &RequestId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM expense_request WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use expensa_core::domain::expense::{
        ExpenseCategory, ExpenseDraft, ExpenseRequest, ExpenseStatus, RequestId,
    };
    use expensa_core::domain::org::UserId;
    use expensa_core::domain::rule::{ApproverSlot, RuleDefinition, RuleSpec};

    use super::SqlExpenseRepository;
    use crate::repositories::{
        ExpenseRepository, RepositoryError, RuleRepository, SqlRuleRepository,
    };
    use crate::{connect_with_settings, migrations};

    pub(crate) async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    /// Inserts a parent rule so that foreign keys are satisfied.
    pub(crate) async fn insert_rule(pool: &sqlx::SqlitePool) -> RuleDefinition {
        let rule = RuleDefinition::create(RuleSpec {
            subject_user_id: UserId::new("u-emp"),
            manager_id: UserId::new("u-mgr"),
            description: String::new(),
            is_manager_approver: false,
            approvers: vec![ApproverSlot::optional("u-a"), ApproverSlot::optional("u-b")],
            sequential: false,
            min_approval_percentage: 100,
        })
        .expect("valid rule");
        SqlRuleRepository::new(pool.clone()).insert(&rule).await.expect("insert rule");
        rule
    }

    pub(crate) fn sample_expense(rule: &RuleDefinition) -> ExpenseRequest {
        ExpenseRequest::submit(
            ExpenseDraft {
                employee: UserId::new("u-emp"),
                description: "Client dinner".to_string(),
                expense_date: NaiveDate::from_ymd_opt(2026, 4, 2).expect("date"),
                category: ExpenseCategory::Food,
                amount: Decimal::new(8_450, 2),
                currency: "USD".to_string(),
                paid_by: Some("corporate card".to_string()),
                remarks: None,
            },
            rule.rule_id().clone(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_and_find_by_id() {
        let pool = setup().await;
        let rule = insert_rule(&pool).await;
        let repo = SqlExpenseRepository::new(pool);
        let expense = sample_expense(&rule);

        repo.save(&expense).await.expect("save");
        let found = repo.find_by_id(&expense.id).await.expect("find").expect("should exist");

        assert_eq!(found, expense);
    }

    #[tokio::test]
    async fn update_status_and_list_by_status() {
        let pool = setup().await;
        let rule = insert_rule(&pool).await;
        let repo = SqlExpenseRepository::new(pool);

        let first = sample_expense(&rule);
        let second = sample_expense(&rule);
        repo.save(&first).await.expect("save first");
        repo.save(&second).await.expect("save second");

        repo.update_status(&first.id, ExpenseStatus::Approved).await.expect("update");

        let pending = repo.list_by_status(ExpenseStatus::Pending, 10).await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        let approved = repo.list_by_status(ExpenseStatus::Approved, 10).await.expect("list");
        assert_eq!(approved[0].status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn delete_removes_the_request_and_ignores_missing_ids() {
        let pool = setup().await;
        let rule = insert_rule(&pool).await;
        let repo = SqlExpenseRepository::new(pool);
        let expense = sample_expense(&rule);
        repo.save(&expense).await.expect("save");

        repo.delete(&expense.id).await.expect("delete");
        repo.delete(&expense.id).await.expect("second delete is a no-op");

        assert!(repo.find_by_id(&expense.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn update_status_of_missing_request_is_not_found() {
        let repo = SqlExpenseRepository::new(setup().await);

        let error = repo
            .update_status(&RequestId("EXP-missing".to_string()), ExpenseStatus::Rejected)
            .await
            .expect_err("missing request");
        assert!(matches!(error, RepositoryError::NotFound { .. }));
    }
}
