use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use expensa_cli::commands::{config, evaluate, migrate, parse_receipt};
use serde_json::Value;
use tempfile::TempDir;

const RULE_JSON: &str = r#"{
    "rule_id": "RULE-travel",
    "created_at": "2026-01-05T09:00:00Z",
    "subject_user_id": "u-emp",
    "manager_id": "u-mgr",
    "is_manager_approver": true,
    "approvers": [
        { "approver_id": "u-fin", "required": true },
        { "approver_id": "u-cfo" }
    ],
    "sequential": true,
    "min_approval_percentage": 60
}"#;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("EXPENSA_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_attempt_budget() {
    with_env(
        &[
            ("EXPENSA_DATABASE_URL", "sqlite::memory:"),
            ("EXPENSA_WORKFLOW_MAX_APPEND_ATTEMPTS", "0"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn config_reports_env_sources_per_key() {
    with_env(
        &[
            ("EXPENSA_DATABASE_URL", "sqlite::memory:"),
            ("EXPENSA_LOG_LEVEL", "debug"),
        ],
        || {
            let result = config::run();
            assert_eq!(result.exit_code, 0);

            let payload = parse_payload(&result.output);
            let entries = payload["data"].as_array().expect("config entries");
            let url = entries
                .iter()
                .find(|entry| entry["key"] == "database.url")
                .expect("database.url entry");
            assert_eq!(url["source"], "env (EXPENSA_DATABASE_URL)");
            let level = entries
                .iter()
                .find(|entry| entry["key"] == "logging.level")
                .expect("logging.level entry");
            assert_eq!(level["value"], "debug");
            assert_eq!(level["source"], "env (EXPENSA_LOG_LEVEL)");
            let attempts = entries
                .iter()
                .find(|entry| entry["key"] == "workflow.max_append_attempts")
                .expect("attempts entry");
            assert_eq!(attempts["source"], "default");
        },
    );
}

#[test]
fn evaluate_reports_pending_with_next_sequential_approver() {
    let dir = TempDir::new().expect("temp dir");
    let rule = write(&dir, "rule.json", RULE_JSON);
    let log = write(
        &dir,
        "log.json",
        r#"{
            "request_id": "EXP-1",
            "rule_id": "RULE-travel",
            "decisions": [
                { "approver_id": "u-mgr", "decision": "approve", "decided_at": "2026-01-06T10:00:00Z" }
            ]
        }"#,
    );

    let result = evaluate::run(&rule, &log);
    assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["data"]["status"], "pending");
    assert_eq!(payload["data"]["approved_weight"], 1);
    assert_eq!(payload["data"]["total_weight"], 3);
    let next = payload["data"]["next_approvers"]["approvers"].as_array().expect("approvers");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0]["approver_id"], "u-fin");
}

#[test]
fn evaluate_reports_required_veto() {
    let dir = TempDir::new().expect("temp dir");
    let rule = write(&dir, "rule.json", RULE_JSON);
    let log = write(
        &dir,
        "log.json",
        r#"{
            "request_id": "EXP-1",
            "rule_id": "RULE-travel",
            "decisions": [
                { "approver_id": "u-mgr", "decision": "approve", "decided_at": "2026-01-06T10:00:00Z" },
                { "approver_id": "u-fin", "decision": "reject", "decided_at": "2026-01-06T11:00:00Z" }
            ]
        }"#,
    );

    let result = evaluate::run(&rule, &log);
    assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["data"]["status"], "rejected");
    assert_eq!(payload["data"]["resolution"]["kind"], "required_veto");
    assert_eq!(payload["data"]["resolution"]["approver_id"], "u-fin");
}

#[test]
fn evaluate_rejects_out_of_order_decision_in_log() {
    let dir = TempDir::new().expect("temp dir");
    let rule = write(&dir, "rule.json", RULE_JSON);
    let log = write(
        &dir,
        "log.json",
        r#"{
            "request_id": "EXP-1",
            "rule_id": "RULE-travel",
            "decisions": [
                { "approver_id": "u-cfo", "decision": "approve", "decided_at": "2026-01-06T10:00:00Z" }
            ]
        }"#,
    );

    let result = evaluate::run(&rule, &log);
    assert_eq!(result.exit_code, 6);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "invalid_decision");
}

#[test]
fn evaluate_rejects_invalid_rule_document() {
    let dir = TempDir::new().expect("temp dir");
    let rule = write(
        &dir,
        "rule.json",
        r#"{ "rule_id": "RULE-x", "subject_user_id": "u-emp", "manager_id": "u-mgr",
             "approvers": [], "min_approval_percentage": 50 }"#,
    );
    let log = write(&dir, "log.json", r#"{ "request_id": "EXP-1", "rule_id": "RULE-x" }"#);

    let result = evaluate::run(&rule, &log);
    assert_eq!(result.exit_code, 2);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "invalid_rule");
}

#[test]
fn parse_receipt_returns_validated_drafts() {
    let dir = TempDir::new().expect("temp dir");
    let payload = write(
        &dir,
        "reply.txt",
        "```json\n[{\"employee\": \"u-emp\", \"description\": \"Lunch\", \"date\": \"02/03/2026\", \"category\": \"Meals\", \"amount\": \"$18.50\"}]\n```",
    );

    let result = parse_receipt::run(&payload, "eur");
    assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

    let payload = parse_payload(&result.output);
    let drafts = payload["data"]["drafts"].as_array().expect("drafts");
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0]["category"], "food");
    assert_eq!(drafts[0]["currency"], "EUR");
    assert_eq!(drafts[0]["expense_date"], "2026-03-02");
}

#[test]
fn parse_receipt_reports_empty_extraction() {
    let dir = TempDir::new().expect("temp dir");
    let payload = write(&dir, "reply.json", "[]");

    let result = parse_receipt::run(&payload, "USD");
    assert_eq!(result.exit_code, 6);
    let payload = parse_payload(&result.output);
    assert_eq!(payload["error_class"], "empty_extraction");
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "EXPENSA_DATABASE_URL",
        "EXPENSA_DATABASE_MAX_CONNECTIONS",
        "EXPENSA_DATABASE_TIMEOUT_SECS",
        "EXPENSA_WORKFLOW_MAX_APPEND_ATTEMPTS",
        "EXPENSA_WORKFLOW_CORRELATION_PREFIX",
        "EXPENSA_LOGGING_LEVEL",
        "EXPENSA_LOGGING_FORMAT",
        "EXPENSA_LOG_LEVEL",
        "EXPENSA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
