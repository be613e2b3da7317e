use std::fs;
use std::path::Path;

use anyhow::Context;
use expensa_core::domain::expense::ExpenseDraft;
use expensa_core::extraction::{parse_extraction_payload, ExtractionError};
use serde_json::json;

use crate::commands::CommandResult;

pub fn run(payload_path: &Path, currency: &str) -> CommandResult {
    let raw = match fs::read_to_string(payload_path)
        .with_context(|| format!("failed to read `{}`", payload_path.display()))
    {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure("parse-receipt", "input", format!("{error:#}"), 2)
        }
    };

    match drafts_from_payload(&raw, currency) {
        Ok(drafts) => {
            tracing::info!(
                event_name = "cli.receipt.parsed",
                correlation_id = "cli",
                items = drafts.len(),
                "receipt extraction reply validated"
            );
            let message = format!("parsed {} expense item(s)", drafts.len());
            CommandResult::success_with_data("parse-receipt", message, json!({ "drafts": drafts }))
        }
        Err(error) => {
            let error_class = match error {
                ExtractionError::Empty => "empty_extraction",
                ExtractionError::InvalidPayload(_) => "invalid_payload",
                ExtractionError::Malformed { .. } => "malformed_item",
                ExtractionError::Collaborator(_) => "extraction_failed",
            };
            CommandResult::failure("parse-receipt", error_class, error.to_string(), 6)
        }
    }
}

fn drafts_from_payload(raw: &str, currency: &str) -> Result<Vec<ExpenseDraft>, ExtractionError> {
    parse_extraction_payload(raw)?
        .into_iter()
        .enumerate()
        .map(|(index, item)| item.into_draft(index, currency))
        .collect()
}
