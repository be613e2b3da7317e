use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let entry = |key: &'static str, value: String, env_keys: &[&str]| ConfigEntry {
        key,
        source: field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref()),
        value,
    };

    let entries = vec![
        entry("database.url", config.database.url.clone(), &["EXPENSA_DATABASE_URL"]),
        entry(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["EXPENSA_DATABASE_MAX_CONNECTIONS"],
        ),
        entry(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["EXPENSA_DATABASE_TIMEOUT_SECS"],
        ),
        entry(
            "workflow.max_append_attempts",
            config.workflow.max_append_attempts.to_string(),
            &["EXPENSA_WORKFLOW_MAX_APPEND_ATTEMPTS"],
        ),
        entry(
            "workflow.correlation_prefix",
            config.workflow.correlation_prefix.clone(),
            &["EXPENSA_WORKFLOW_CORRELATION_PREFIX"],
        ),
        entry(
            "logging.level",
            config.logging.level.clone(),
            &["EXPENSA_LOGGING_LEVEL", "EXPENSA_LOG_LEVEL"],
        ),
        entry(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["EXPENSA_LOGGING_FORMAT", "EXPENSA_LOG_FORMAT"],
        ),
    ];

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(entries.iter().map(render_line));

    match serde_json::to_value(&entries) {
        Ok(data) => CommandResult::success_with_data("config", lines.join("\n"), data),
        Err(error) => CommandResult::failure("config", "serialization", error.to_string(), 1),
    }
}

fn detect_config_path() -> Option<PathBuf> {
    ["expensa.toml", "config/expensa.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(entry: &ConfigEntry) -> String {
    format!("- {} = {} (source: {})", entry.key, entry.value, entry.source)
}
