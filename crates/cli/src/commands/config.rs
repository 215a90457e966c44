use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use serde::Serialize;
use toml::Value;
use warden_core::config::AppConfig;

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let entries = effective_values(&config)
        .into_iter()
        .map(|(key, value, env_keys)| ConfigEntry {
            key,
            value,
            source: field_source(
                key,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        })
        .collect::<Vec<_>>();

    CommandResult::success_with_data(
        "config",
        "effective config (source precedence: env > file > default)",
        &entries,
    )
}

/// Key path, rendered value, and the env vars that can set it.
type Field = (&'static str, String, &'static [&'static str]);

fn effective_values(config: &AppConfig) -> Vec<Field> {
    let budgets = config.governance.tier_budgets;
    vec![
        field("database.url", config.database.url.clone(), &["WARDEN_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["WARDEN_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["WARDEN_DATABASE_TIMEOUT_SECS"],
        ),
        field(
            "judge.provider",
            format!("{:?}", config.judge.provider),
            &["WARDEN_JUDGE_PROVIDER"],
        ),
        field("judge.model", config.judge.model.clone(), &["WARDEN_JUDGE_MODEL"]),
        field(
            "judge.base_url",
            config.judge.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["WARDEN_JUDGE_BASE_URL"],
        ),
        field(
            "judge.api_key",
            redact_optional(config.judge.api_key.as_ref().map(|key| key.expose_secret())),
            &["WARDEN_JUDGE_API_KEY"],
        ),
        field(
            "judge.timeout_secs",
            config.judge.timeout_secs.to_string(),
            &["WARDEN_JUDGE_TIMEOUT_SECS"],
        ),
        field(
            "judge.max_retries",
            config.judge.max_retries.to_string(),
            &["WARDEN_JUDGE_MAX_RETRIES"],
        ),
        field(
            "governance.tier_budgets.t1",
            budgets.t1.to_string(),
            &["WARDEN_GOVERNANCE_T1_BUDGET"],
        ),
        field(
            "governance.tier_budgets.t2",
            budgets.t2.to_string(),
            &["WARDEN_GOVERNANCE_T2_BUDGET"],
        ),
        field(
            "governance.tier_budgets.t3",
            budgets.t3.to_string(),
            &["WARDEN_GOVERNANCE_T3_BUDGET"],
        ),
        field("tracer.model", config.tracer.model.clone(), &["WARDEN_TRACER_MODEL"]),
        field(
            "tracer.max_turns_before_flag",
            config.tracer.max_turns_before_flag.to_string(),
            &["WARDEN_TRACER_MAX_TURNS"],
        ),
        field(
            "tracer.max_latency_ms",
            config.tracer.max_latency_ms.to_string(),
            &["WARDEN_TRACER_MAX_LATENCY_MS"],
        ),
        field(
            "evaluation.sampling_rate",
            config.evaluation.sampling_rate.to_string(),
            &["WARDEN_EVALUATION_SAMPLING_RATE"],
        ),
        field(
            "evaluation.batch_size",
            config.evaluation.batch_size.to_string(),
            &["WARDEN_EVALUATION_BATCH_SIZE"],
        ),
        field(
            "evaluation.grace_period_secs",
            config.evaluation.grace_period_secs.to_string(),
            &["WARDEN_EVALUATION_GRACE_PERIOD_SECS"],
        ),
        field(
            "storage.encryption_key",
            redact_optional(Some(config.storage.encryption_key.expose_secret())),
            &["WARDEN_STORAGE_ENCRYPTION_KEY"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["WARDEN_LOGGING_LEVEL", "WARDEN_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["WARDEN_LOGGING_FORMAT", "WARDEN_LOG_FORMAT"],
        ),
    ]
}

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Field {
    (key, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("warden.toml"), PathBuf::from("config/warden.toml")]
        .into_iter()
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

fn redact_optional(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None | Some("") => "<unset>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_optional};

    #[test]
    fn nested_keys_resolve_through_tables() {
        let doc = "[governance.tier_budgets]\nt1 = 12\n".parse::<toml::Value>().expect("toml");
        assert!(contains_path(&doc, "governance.tier_budgets.t1"));
        assert!(!contains_path(&doc, "governance.tier_budgets.t2"));
        assert!(!contains_path(&doc, "judge.model"));
    }

    #[test]
    fn secrets_never_render() {
        assert_eq!(redact_optional(None), "<unset>");
        assert_eq!(redact_optional(Some("  ")), "<unset>");
        assert_eq!(redact_optional(Some("sk-live-abc")), "<redacted>");
    }
}
