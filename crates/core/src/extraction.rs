//! Receipt extraction boundary.
//!
//! The model call itself lives behind [`ReceiptExtractor`]. This module only
//! parses and validates what comes back so that a bad reply turns into an
//! [`ExtractionError`] for the caller, never into a workflow state.

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::expense::{ExpenseCategory, ExpenseDraft};
use crate::domain::org::UserId;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("extraction returned no expense items")]
    Empty,
    #[error("extraction reply is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("item {index} has malformed `{field}`: {reason}")]
    Malformed { index: usize, field: &'static str, reason: String },
    #[error("extraction collaborator failed: {0}")]
    Collaborator(String),
}

/// One line item as returned by the extraction model, before validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedExpense {
    #[serde(default)]
    pub employee: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub remarks: Option<String>,
}

pub trait ReceiptExtractor: Send + Sync {
    fn extract(&self, image: &ReceiptImage) -> Result<Vec<ExtractedExpense>, ExtractionError>;
}

/// Parses a model reply: either a JSON array of items or a single object,
/// optionally wrapped in a fenced code block.
pub fn parse_extraction_payload(raw: &str) -> Result<Vec<ExtractedExpense>, ExtractionError> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|error| ExtractionError::InvalidPayload(error.to_string()))?;

    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(ExtractionError::InvalidPayload(format!(
                "expected an array or object, got `{other}`"
            )))
        }
    };

    if items.is_empty() {
        return Err(ExtractionError::Empty);
    }

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<ExtractedExpense>(item)
                .map_err(|error| ExtractionError::InvalidPayload(error.to_string()))
        })
        .collect()
}

/// Runs the extractor and validates every item into a draft.
pub fn drafts_from_receipt<E>(
    extractor: &E,
    image: &ReceiptImage,
    currency: &str,
) -> Result<Vec<ExpenseDraft>, ExtractionError>
where
    E: ReceiptExtractor + ?Sized,
{
    let items = extractor.extract(image)?;
    if items.is_empty() {
        return Err(ExtractionError::Empty);
    }

    items.into_iter().enumerate().map(|(index, item)| item.into_draft(index, currency)).collect()
}

impl ExtractedExpense {
    pub fn into_draft(self, index: usize, currency: &str) -> Result<ExpenseDraft, ExtractionError> {
        let employee = required_text(self.employee, index, "employee")?;
        let description = required_text(self.description, index, "description")?;
        let date_raw = required_text(self.date, index, "date")?;
        let expense_date = parse_date(&date_raw).ok_or_else(|| ExtractionError::Malformed {
            index,
            field: "date",
            reason: format!("unrecognized date `{date_raw}`"),
        })?;
        let amount = parse_amount(self.amount.as_ref(), index)?;
        let category = self
            .category
            .as_deref()
            .map(ExpenseCategory::parse_lenient)
            .unwrap_or(ExpenseCategory::Other);

        Ok(ExpenseDraft {
            employee: UserId::new(employee),
            description,
            expense_date,
            category,
            amount,
            currency: currency.trim().to_ascii_uppercase(),
            paid_by: None,
            remarks: self.remarks.filter(|remarks| !remarks.trim().is_empty()),
        })
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn required_text(
    value: Option<String>,
    index: usize,
    field: &'static str,
) -> Result<String, ExtractionError> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()).ok_or_else(|| {
        ExtractionError::Malformed { index, field, reason: "missing or empty".to_string() }
    })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS.iter().find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok())
}

fn parse_amount(value: Option<&Value>, index: usize) -> Result<Decimal, ExtractionError> {
    let malformed = |reason: String| ExtractionError::Malformed { index, field: "amount", reason };

    let text = match value {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => numeric_text(text).map_err(malformed)?,
        Some(other) => return Err(malformed(format!("unsupported value `{other}`"))),
        None => return Err(malformed("missing or empty".to_string())),
    };

    let amount = Decimal::from_str(&text).map_err(|error| malformed(error.to_string()))?;
    if amount <= Decimal::ZERO {
        return Err(malformed(format!("amount must be positive, got {amount}")));
    }
    Ok(amount)
}

/// Strips currency symbols and spacing. A `,` is only accepted as a thousands
/// separator ahead of a `.` decimal point; `12,50` or `1,250` are refused.
fn numeric_text(text: &str) -> Result<String, String> {
    let kept: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | ','))
        .collect();
    if !kept.contains(',') {
        return Ok(kept);
    }

    let ambiguous = || format!("ambiguous separator in `{text}`; use `.` for decimals");
    let (integer, fraction) = kept.split_once('.').ok_or_else(ambiguous)?;
    let mut groups = integer.trim_start_matches('-').split(',');
    let leading = groups.next().unwrap_or_default();
    let grouped = (1..=3).contains(&leading.len()) && groups.all(|group| group.len() == 3);
    if !grouped {
        return Err(ambiguous());
    }
    Ok(format!("{}.{fraction}", integer.replace(',', "")))
}
