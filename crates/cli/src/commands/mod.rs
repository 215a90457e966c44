pub mod calibrate;
pub mod config;
pub mod doctor;
pub mod evaluate;
pub mod migrate;
pub mod queue_stats;

use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use warden_core::config::{AppConfig, LoadOptions};
use warden_core::domain::tenant::TenantId;
use warden_db::{connect_with_settings, migrations, FieldCipher, SqlTraceRepository};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::ok(command, message.into(), None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: &impl Serialize,
    ) -> Self {
        Self::ok(command, message.into(), serde_json::to_value(data).ok())
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::error(command, error_class, message.into(), exit_code, None)
    }

    pub fn failure_with_data(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        data: &impl Serialize,
    ) -> Self {
        let data = serde_json::to_value(data).ok();
        Self::error(command, error_class, message.into(), exit_code, data)
    }

    fn ok(command: &str, message: String, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message,
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    fn error(
        command: &str,
        error_class: &str,
        message: String,
        exit_code: u8,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message,
            data,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Failure carried out of a `block_on` section: error class, message, exit code.
pub(crate) type StepFailure = (&'static str, String, u8);

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

pub(crate) fn parse_tenant(command: &str, raw: &str) -> Result<TenantId, CommandResult> {
    TenantId::parse(raw).map_err(|error| {
        CommandResult::failure(command, "invalid_argument", format!("invalid tenant: {error}"), 8)
    })
}

/// Connects, brings the schema up to date and wires the field cipher.
pub(crate) async fn open_repository(
    config: &AppConfig,
) -> Result<SqlTraceRepository, StepFailure> {
    let cipher = FieldCipher::from_secret(config.storage.encryption_key.expose_secret())
        .map_err(|error| ("storage", format!("encryption key rejected: {error}"), 6u8))?;

    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    Ok(SqlTraceRepository::new(pool, cipher))
}
