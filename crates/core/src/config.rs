use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub judge: JudgeConfig,
    pub governance: GovernanceConfig,
    pub tracer: TracerConfig,
    pub evaluation: EvaluationConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Judge model settings. Read at call time through [`JudgeConfigHandle`].
#[derive(Clone, Debug)]
pub struct JudgeConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolLimit {
    pub max_per_turn: u32,
    pub max_per_session: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudgets {
    pub t1: u32,
    pub t2: u32,
    pub t3: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GovernanceConfig {
    pub tier_budgets: TierBudgets,
    pub default_tool_limit: ToolLimit,
    pub tool_limits: BTreeMap<String, ToolLimit>,
    pub sanitize_max_length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracerConfig {
    /// Model used to price recorded tokens.
    pub model: String,
    pub max_turns_before_flag: u32,
    pub max_latency_ms: u64,
    pub max_messages_bytes: usize,
    pub max_tool_calls_bytes: usize,
    pub retained_messages: usize,
    pub retained_tool_calls: usize,
    pub write_queue_capacity: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationConfig {
    pub sampling_rate: f64,
    pub batch_size: usize,
    pub grace_period_secs: u64,
    pub max_pending_evaluations: usize,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub encryption_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub judge_provider: Option<LlmProvider>,
    pub judge_model: Option<String>,
    pub sampling_rate: Option<f64>,
    pub encryption_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: Some("http://localhost:11434".to_string()),
            model: "llama3.1".to_string(),
            max_tokens: 1500,
            temperature: 0.1,
            timeout_secs: 30,
            max_retries: 1,
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        let consequential = ToolLimit { max_per_turn: 1, max_per_session: 3 };
        let mutating = ToolLimit { max_per_turn: 2, max_per_session: 10 };
        let metadata = ToolLimit { max_per_turn: 10, max_per_session: 100 };

        let tool_limits = [
            ("create_booking", consequential),
            ("cancel_booking", consequential),
            ("process_refund", ToolLimit { max_per_turn: 1, max_per_session: 1 }),
            ("update_pricing", ToolLimit { max_per_turn: 1, max_per_session: 2 }),
            ("update_service", mutating),
            ("reschedule_booking", mutating),
            ("get_business_info", metadata),
            ("list_services", metadata),
            ("check_availability", ToolLimit { max_per_turn: 5, max_per_session: 50 }),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();

        Self {
            tier_budgets: TierBudgets { t1: 10, t2: 3, t3: 1 },
            default_tool_limit: ToolLimit { max_per_turn: 5, max_per_session: 50 },
            tool_limits,
            sanitize_max_length: 2000,
        }
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet".to_string(),
            max_turns_before_flag: 8,
            max_latency_ms: 5000,
            max_messages_bytes: 100_000,
            max_tool_calls_bytes: 50_000,
            retained_messages: 50,
            retained_tool_calls: 30,
            write_queue_capacity: 32,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.1,
            batch_size: 10,
            grace_period_secs: 300,
            max_pending_evaluations: 50,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://warden.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            judge: JudgeConfig::default(),
            governance: GovernanceConfig::default(),
            tracer: TracerConfig::default(),
            evaluation: EvaluationConfig::default(),
            storage: StorageConfig { encryption_key: String::new().into() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl GovernanceConfig {
    pub fn limit_for(&self, tool: &str) -> ToolLimit {
        self.tool_limits.get(tool).copied().unwrap_or(self.default_tool_limit)
    }
}

/// Shared, runtime-updatable judge settings.
///
/// The evaluator takes a snapshot on every call so an operator can change the judge
/// model or timeout without restarting the process.
#[derive(Clone, Debug)]
pub struct JudgeConfigHandle {
    inner: Arc<RwLock<JudgeConfig>>,
}

impl JudgeConfigHandle {
    pub fn new(config: JudgeConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(config)) }
    }

    pub fn snapshot(&self) -> JudgeConfig {
        match self.inner.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut JudgeConfig)) {
        match self.inner.write() {
            Ok(mut config) => apply(&mut config),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("warden.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(judge) = patch.judge {
            if let Some(provider) = judge.provider {
                self.judge.provider = provider;
            }
            if let Some(judge_api_key_value) = judge.api_key {
                self.judge.api_key = Some(secret_value(judge_api_key_value));
            }
            if let Some(base_url) = judge.base_url {
                self.judge.base_url = Some(base_url);
            }
            if let Some(model) = judge.model {
                self.judge.model = model;
            }
            if let Some(max_tokens) = judge.max_tokens {
                self.judge.max_tokens = max_tokens;
            }
            if let Some(temperature) = judge.temperature {
                self.judge.temperature = temperature;
            }
            if let Some(timeout_secs) = judge.timeout_secs {
                self.judge.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = judge.max_retries {
                self.judge.max_retries = max_retries;
            }
        }

        if let Some(governance) = patch.governance {
            if let Some(budgets) = governance.tier_budgets {
                self.governance.tier_budgets = budgets;
            }
            if let Some(limit) = governance.default_tool_limit {
                self.governance.default_tool_limit = limit;
            }
            if let Some(limits) = governance.tool_limits {
                self.governance.tool_limits.extend(limits);
            }
            if let Some(sanitize_max_length) = governance.sanitize_max_length {
                self.governance.sanitize_max_length = sanitize_max_length;
            }
        }

        if let Some(tracer) = patch.tracer {
            if let Some(model) = tracer.model {
                self.tracer.model = model;
            }
            if let Some(value) = tracer.max_turns_before_flag {
                self.tracer.max_turns_before_flag = value;
            }
            if let Some(value) = tracer.max_latency_ms {
                self.tracer.max_latency_ms = value;
            }
            if let Some(value) = tracer.max_messages_bytes {
                self.tracer.max_messages_bytes = value;
            }
            if let Some(value) = tracer.max_tool_calls_bytes {
                self.tracer.max_tool_calls_bytes = value;
            }
            if let Some(value) = tracer.retained_messages {
                self.tracer.retained_messages = value;
            }
            if let Some(value) = tracer.retained_tool_calls {
                self.tracer.retained_tool_calls = value;
            }
            if let Some(value) = tracer.write_queue_capacity {
                self.tracer.write_queue_capacity = value;
            }
        }

        if let Some(evaluation) = patch.evaluation {
            if let Some(sampling_rate) = evaluation.sampling_rate {
                self.evaluation.sampling_rate = sampling_rate;
            }
            if let Some(batch_size) = evaluation.batch_size {
                self.evaluation.batch_size = batch_size;
            }
            if let Some(grace_period_secs) = evaluation.grace_period_secs {
                self.evaluation.grace_period_secs = grace_period_secs;
            }
            if let Some(max_pending) = evaluation.max_pending_evaluations {
                self.evaluation.max_pending_evaluations = max_pending;
            }
        }

        if let Some(storage) = patch.storage {
            if let Some(encryption_key_value) = storage.encryption_key {
                self.storage.encryption_key = secret_value(encryption_key_value);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WARDEN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WARDEN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_num("WARDEN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_num("WARDEN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_JUDGE_PROVIDER") {
            self.judge.provider = value.parse()?;
        }
        if let Some(value) = read_env("WARDEN_JUDGE_API_KEY") {
            self.judge.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("WARDEN_JUDGE_BASE_URL") {
            self.judge.base_url = Some(value);
        }
        if let Some(value) = read_env("WARDEN_JUDGE_MODEL") {
            self.judge.model = value;
        }
        if let Some(value) = read_env("WARDEN_JUDGE_MAX_TOKENS") {
            self.judge.max_tokens = parse_num("WARDEN_JUDGE_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_JUDGE_TEMPERATURE") {
            self.judge.temperature = parse_num("WARDEN_JUDGE_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("WARDEN_JUDGE_TIMEOUT_SECS") {
            self.judge.timeout_secs = parse_num("WARDEN_JUDGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_JUDGE_MAX_RETRIES") {
            self.judge.max_retries = parse_num("WARDEN_JUDGE_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("WARDEN_GOVERNANCE_T1_BUDGET") {
            self.governance.tier_budgets.t1 = parse_num("WARDEN_GOVERNANCE_T1_BUDGET", &value)?;
        }
        if let Some(value) = read_env("WARDEN_GOVERNANCE_T2_BUDGET") {
            self.governance.tier_budgets.t2 = parse_num("WARDEN_GOVERNANCE_T2_BUDGET", &value)?;
        }
        if let Some(value) = read_env("WARDEN_GOVERNANCE_T3_BUDGET") {
            self.governance.tier_budgets.t3 = parse_num("WARDEN_GOVERNANCE_T3_BUDGET", &value)?;
        }

        if let Some(value) = read_env("WARDEN_TRACER_MODEL") {
            self.tracer.model = value;
        }
        if let Some(value) = read_env("WARDEN_TRACER_MAX_TURNS") {
            self.tracer.max_turns_before_flag = parse_num("WARDEN_TRACER_MAX_TURNS", &value)?;
        }
        if let Some(value) = read_env("WARDEN_TRACER_MAX_LATENCY_MS") {
            self.tracer.max_latency_ms = parse_num("WARDEN_TRACER_MAX_LATENCY_MS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_EVALUATION_SAMPLING_RATE") {
            self.evaluation.sampling_rate = parse_num("WARDEN_EVALUATION_SAMPLING_RATE", &value)?;
        }
        if let Some(value) = read_env("WARDEN_EVALUATION_BATCH_SIZE") {
            self.evaluation.batch_size = parse_num("WARDEN_EVALUATION_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("WARDEN_EVALUATION_GRACE_PERIOD_SECS") {
            self.evaluation.grace_period_secs =
                parse_num("WARDEN_EVALUATION_GRACE_PERIOD_SECS", &value)?;
        }

        if let Some(value) = read_env("WARDEN_STORAGE_ENCRYPTION_KEY") {
            self.storage.encryption_key = secret_value(value);
        }

        let log_level = read_env("WARDEN_LOGGING_LEVEL").or_else(|| read_env("WARDEN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WARDEN_LOGGING_FORMAT").or_else(|| read_env("WARDEN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(judge_provider) = overrides.judge_provider {
            self.judge.provider = judge_provider;
        }
        if let Some(judge_model) = overrides.judge_model {
            self.judge.model = judge_model;
        }
        if let Some(sampling_rate) = overrides.sampling_rate {
            self.evaluation.sampling_rate = sampling_rate;
        }
        if let Some(encryption_key) = overrides.encryption_key {
            self.storage.encryption_key = secret_value(encryption_key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_judge(&self.judge)?;
        validate_governance(&self.governance)?;
        validate_tracer(&self.tracer)?;
        validate_evaluation(&self.evaluation)?;
        validate_storage(&self.storage)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("warden.toml"), PathBuf::from("config/warden.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_judge(judge: &JudgeConfig) -> Result<(), ConfigError> {
    if judge.timeout_secs == 0 || judge.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "judge.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if judge.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "judge.max_tokens must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=2.0).contains(&judge.temperature) {
        return Err(ConfigError::Validation(
            "judge.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }
    if judge.model.trim().is_empty() {
        return Err(ConfigError::Validation("judge.model is required".to_string()));
    }

    match judge.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = judge
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "judge.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                judge.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "judge.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &judge.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "judge.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_governance(governance: &GovernanceConfig) -> Result<(), ConfigError> {
    let budgets = governance.tier_budgets;
    if budgets.t1 < budgets.t2 || budgets.t2 < budgets.t3 {
        return Err(ConfigError::Validation(
            "governance.tier_budgets must satisfy t1 >= t2 >= t3".to_string(),
        ));
    }

    let limits = std::iter::once(("default", &governance.default_tool_limit))
        .chain(governance.tool_limits.iter().map(|(name, limit)| (name.as_str(), limit)));
    for (name, limit) in limits {
        if limit.max_per_turn > limit.max_per_session {
            return Err(ConfigError::Validation(format!(
                "governance tool limit `{name}` allows more calls per turn than per session"
            )));
        }
    }

    if governance.sanitize_max_length == 0 {
        return Err(ConfigError::Validation(
            "governance.sanitize_max_length must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_tracer(tracer: &TracerConfig) -> Result<(), ConfigError> {
    if tracer.max_turns_before_flag == 0 || tracer.max_latency_ms == 0 {
        return Err(ConfigError::Validation(
            "tracer auto-flag thresholds must be greater than zero".to_string(),
        ));
    }
    if tracer.retained_messages == 0 || tracer.retained_tool_calls == 0 {
        return Err(ConfigError::Validation(
            "tracer retained counts must be greater than zero".to_string(),
        ));
    }
    if tracer.max_messages_bytes < 1024 || tracer.max_tool_calls_bytes < 1024 {
        return Err(ConfigError::Validation(
            "tracer byte ceilings must be at least 1024".to_string(),
        ));
    }
    if tracer.write_queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "tracer.write_queue_capacity must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_evaluation(evaluation: &EvaluationConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&evaluation.sampling_rate) {
        return Err(ConfigError::Validation(
            "evaluation.sampling_rate must be in range 0.0..=1.0".to_string(),
        ));
    }
    if evaluation.batch_size == 0 || evaluation.max_pending_evaluations == 0 {
        return Err(ConfigError::Validation(
            "evaluation.batch_size and evaluation.max_pending_evaluations must be greater than zero"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_storage(storage: &StorageConfig) -> Result<(), ConfigError> {
    let key = storage.encryption_key.expose_secret();
    if key.trim().is_empty() {
        return Err(ConfigError::Validation(
            "storage.encryption_key is required (set WARDEN_STORAGE_ENCRYPTION_KEY)".to_string(),
        ));
    }
    if key.len() < 32 {
        return Err(ConfigError::Validation(
            "storage.encryption_key must be at least 32 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    judge: Option<JudgePatch>,
    governance: Option<GovernancePatch>,
    tracer: Option<TracerPatch>,
    evaluation: Option<EvaluationPatch>,
    storage: Option<StoragePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct JudgePatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct GovernancePatch {
    tier_budgets: Option<TierBudgets>,
    default_tool_limit: Option<ToolLimit>,
    tool_limits: Option<BTreeMap<String, ToolLimit>>,
    sanitize_max_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct TracerPatch {
    model: Option<String>,
    max_turns_before_flag: Option<u32>,
    max_latency_ms: Option<u64>,
    max_messages_bytes: Option<usize>,
    max_tool_calls_bytes: Option<usize>,
    retained_messages: Option<usize>,
    retained_tool_calls: Option<usize>,
    write_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct EvaluationPatch {
    sampling_rate: Option<f64>,
    batch_size: Option<usize>,
    grace_period_secs: Option<u64>,
    max_pending_evaluations: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StoragePatch {
    encryption_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, JudgeConfig, JudgeConfigHandle, LoadOptions,
        LogFormat, ToolLimit,
    };

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef";

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_WARDEN_KEY", TEST_KEY);

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("warden.toml");
            fs::write(
                &path,
                r#"
[storage]
encryption_key = "${TEST_WARDEN_KEY}"

[governance.tool_limits.create_booking]
max_per_turn = 1
max_per_session = 2
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.storage.encryption_key.expose_secret() == TEST_KEY,
                "encryption key should be interpolated from environment",
            )?;
            ensure(
                config.governance.limit_for("create_booking")
                    == ToolLimit { max_per_turn: 1, max_per_session: 2 },
                "file tool limits should override defaults",
            )?;
            ensure(
                config.governance.tool_limits.contains_key("list_services"),
                "default tool limits should survive a partial file patch",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_WARDEN_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WARDEN_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("WARDEN_EVALUATION_SAMPLING_RATE", "0.5");
        env::set_var("WARDEN_STORAGE_ENCRYPTION_KEY", TEST_KEY);

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("warden.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[evaluation]
sampling_rate = 0.25
batch_size = 4

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                (config.evaluation.sampling_rate - 0.5).abs() < f64::EPSILON,
                "env sampling rate should win over file",
            )?;
            ensure(config.evaluation.batch_size == 4, "file batch size should win over default")?;
            Ok(())
        })();

        clear_vars(&[
            "WARDEN_DATABASE_URL",
            "WARDEN_EVALUATION_SAMPLING_RATE",
            "WARDEN_STORAGE_ENCRYPTION_KEY",
        ]);
        result
    }

    #[test]
    fn missing_encryption_key_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["WARDEN_STORAGE_ENCRYPTION_KEY"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => {
                return Err("expected validation failure but config load succeeded".to_string())
            }
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("storage.encryption_key")
        );
        ensure(has_message, "validation failure should mention storage.encryption_key")
    }

    #[test]
    fn invalid_sampling_rate_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                sampling_rate: Some(1.5),
                encryption_key: Some(TEST_KEY.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("sampling_rate")),
            "sampling rate above 1.0 should fail validation",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("WARDEN_JUDGE_API_KEY", "sk-judge-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions {
                overrides: ConfigOverrides {
                    encryption_key: Some(TEST_KEY.to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-judge-secret-value"), "debug must not contain api key")?;
            ensure(!debug.contains(TEST_KEY), "debug must not contain encryption key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["WARDEN_JUDGE_API_KEY"]);
        result
    }

    #[test]
    fn default_tool_limits_are_tighter_for_consequential_tools() {
        let governance = super::GovernanceConfig::default();
        let booking = governance.limit_for("create_booking");
        let metadata = governance.limit_for("get_business_info");
        let unknown = governance.limit_for("some_new_tool");

        assert!(booking.max_per_turn < metadata.max_per_turn);
        assert!(booking.max_per_session < metadata.max_per_session);
        assert_eq!(unknown, ToolLimit { max_per_turn: 5, max_per_session: 50 });
    }

    #[test]
    fn judge_handle_updates_are_visible_to_later_snapshots() {
        let handle = JudgeConfigHandle::new(JudgeConfig::default());
        let before = handle.snapshot();

        handle.update(|judge| {
            judge.model = "judge-v2".to_string();
            judge.timeout_secs = 5;
        });

        let after = handle.clone().snapshot();
        assert_eq!(before.model, "llama3.1");
        assert_eq!(after.model, "judge-v2");
        assert_eq!(after.timeout_secs, 5);
    }
}
