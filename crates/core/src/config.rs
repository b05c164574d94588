use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditWriterConfig;
use crate::rate_limit::{RateLimit, RateLimitPolicy};
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub audit: AuditConfig,
    pub middleware: MiddlewareConfig,
    pub access: AccessConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub app_token: SecretString,
    pub bot_token: SecretString,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub intent_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSetting {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl LimitSetting {
    fn to_limit(self) -> RateLimit {
        RateLimit::per_window(self.max_requests, Duration::from_secs(self.window_secs))
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Shared across every user.
    pub global: LimitSetting,
    /// Per user across all commands.
    pub per_user: LimitSetting,
    pub default: LimitSetting,
    /// Limits keyed by command identifier, e.g. `/dona-task`.
    pub commands: BTreeMap<String, LimitSetting>,
    pub cleanup_interval_secs: u64,
}

impl RateLimitConfig {
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            enabled: self.enabled,
            global_limit: Some(self.global.to_limit()),
            user_limit: Some(self.per_user.to_limit()),
            default_limit: self.default.to_limit(),
            class_limits: self
                .commands
                .iter()
                .map(|(command, setting)| (command.clone(), setting.to_limit()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub destination: AuditDestination,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub alert_after_failures: u64,
}

impl AuditConfig {
    pub fn writer_config(&self) -> AuditWriterConfig {
        AuditWriterConfig {
            queue_capacity: self.queue_capacity,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay_ms: self.retry_base_delay_ms,
                max_delay_ms: self.retry_base_delay_ms.saturating_mul(16),
            },
            alert_after_failures: self.alert_after_failures,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MiddlewareConfig {
    /// Budget for sending the acknowledgment after an event arrives.
    pub ack_deadline_ms: u64,
    /// Maximum follow-up responses per event.
    pub response_bound: u32,
    pub slow_request_ms: u64,
    /// Rolling window behind `/dona-metrics` and the periodic summary.
    pub metrics_window_secs: u64,
    pub metrics_report_interval_secs: u64,
}

impl MiddlewareConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }

    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }
}

#[derive(Clone, Debug)]
pub struct AccessConfig {
    pub admin_users: Vec<String>,
    pub environment: Environment,
}

impl AccessConfig {
    pub fn is_admin(&self, platform_user_id: &str) -> bool {
        self.admin_users.iter().any(|admin| admin == platform_user_id)
    }

    pub fn metrics_allowed(&self, platform_user_id: &str) -> bool {
        self.environment == Environment::Development || self.is_admin(platform_user_id)
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Groq,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    Disabled,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Groq => Some("https://api.groq.com/openai/v1"),
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::Ollama => Some("http://localhost:11434/v1"),
            Self::Disabled => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDestination {
    Database,
    Log,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub slack_app_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub audit_destination: Option<AuditDestination>,
    pub rate_limit_enabled: Option<bool>,
    pub admin_users: Option<Vec<String>>,
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

impl Default for AppConfig {
    fn default() -> Self {
        let minute = 60;
        let commands = [
            ("/dona-task", 10),
            ("/dona-remind", 20),
            ("/dona-summary", 10),
            ("/dona-metrics", 5),
        ]
        .into_iter()
        .map(|(command, max_requests)| {
            (command.to_string(), LimitSetting { max_requests, window_secs: minute })
        })
        .collect();

        Self {
            database: DatabaseConfig {
                url: "sqlite://dona.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            slack: SlackConfig { app_token: String::new().into(), bot_token: String::new().into() },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                intent_timeout_secs: 15,
                max_retries: 2,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                global: LimitSetting { max_requests: 1_000, window_secs: minute },
                per_user: LimitSetting { max_requests: 60, window_secs: minute },
                default: LimitSetting { max_requests: 30, window_secs: minute },
                commands,
                cleanup_interval_secs: 3_600,
            },
            audit: AuditConfig {
                destination: AuditDestination::Database,
                queue_capacity: 1_024,
                max_retries: 3,
                retry_base_delay_ms: 100,
                alert_after_failures: 5,
            },
            middleware: MiddlewareConfig {
                ack_deadline_ms: 2_500,
                response_bound: 3,
                slow_request_ms: 3_000,
                metrics_window_secs: 300,
                metrics_report_interval_secs: 300,
            },
            access: AccessConfig {
                admin_users: Vec::new(),
                environment: Environment::Production,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
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
            "groq" => Ok(Self::Groq),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected groq|openai|ollama|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for AuditDestination {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(Self::Database),
            "log" => Ok(Self::Log),
            other => Err(ConfigError::Validation(format!(
                "unsupported audit destination `{other}` (expected database|log)"
            ))),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Validation(format!(
                "unsupported environment `{other}` (expected development|production)"
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dona.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Base URL for the LLM provider, falling back to the provider default.
    pub fn llm_base_url(&self) -> Option<String> {
        self.llm
            .base_url
            .clone()
            .or_else(|| self.llm.provider.default_base_url().map(str::to_string))
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

        if let Some(slack) = patch.slack {
            if let Some(app_token) = slack.app_token {
                self.slack.app_token = secret_value(app_token);
            }
            if let Some(bot_token) = slack.bot_token {
                self.slack.bot_token = secret_value(bot_token);
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(intent_timeout_secs) = llm.intent_timeout_secs {
                self.llm.intent_timeout_secs = intent_timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(rate_limit) = patch.rate_limit {
            if let Some(enabled) = rate_limit.enabled {
                self.rate_limit.enabled = enabled;
            }
            if let Some(global) = rate_limit.global {
                self.rate_limit.global = global;
            }
            if let Some(per_user) = rate_limit.per_user {
                self.rate_limit.per_user = per_user;
            }
            if let Some(default) = rate_limit.default {
                self.rate_limit.default = default;
            }
            if let Some(commands) = rate_limit.commands {
                self.rate_limit.commands.extend(commands);
            }
            if let Some(cleanup_interval_secs) = rate_limit.cleanup_interval_secs {
                self.rate_limit.cleanup_interval_secs = cleanup_interval_secs;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(destination) = audit.destination {
                self.audit.destination = destination;
            }
            if let Some(queue_capacity) = audit.queue_capacity {
                self.audit.queue_capacity = queue_capacity;
            }
            if let Some(max_retries) = audit.max_retries {
                self.audit.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = audit.retry_base_delay_ms {
                self.audit.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(alert_after_failures) = audit.alert_after_failures {
                self.audit.alert_after_failures = alert_after_failures;
            }
        }

        if let Some(middleware) = patch.middleware {
            if let Some(ack_deadline_ms) = middleware.ack_deadline_ms {
                self.middleware.ack_deadline_ms = ack_deadline_ms;
            }
            if let Some(response_bound) = middleware.response_bound {
                self.middleware.response_bound = response_bound;
            }
            if let Some(slow_request_ms) = middleware.slow_request_ms {
                self.middleware.slow_request_ms = slow_request_ms;
            }
            if let Some(metrics_window_secs) = middleware.metrics_window_secs {
                self.middleware.metrics_window_secs = metrics_window_secs;
            }
            if let Some(interval) = middleware.metrics_report_interval_secs {
                self.middleware.metrics_report_interval_secs = interval;
            }
        }

        if let Some(access) = patch.access {
            if let Some(admin_users) = access.admin_users {
                self.access.admin_users = admin_users;
            }
            if let Some(environment) = access.environment {
                self.access.environment = environment;
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
        if let Some(value) = read_env("DONA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DONA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("DONA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DONA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DONA_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DONA_SLACK_APP_TOKEN") {
            self.slack.app_token = secret_value(value);
        }
        if let Some(value) = read_env("DONA_SLACK_BOT_TOKEN") {
            self.slack.bot_token = secret_value(value);
        }

        if let Some(value) = read_env("DONA_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("DONA_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DONA_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("DONA_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("DONA_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DONA_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DONA_LLM_INTENT_TIMEOUT_SECS") {
            self.llm.intent_timeout_secs = parse_u64("DONA_LLM_INTENT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DONA_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("DONA_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("DONA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DONA_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("DONA_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("DONA_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DONA_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("DONA_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse_bool("DONA_RATE_LIMIT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_GLOBAL") {
            self.rate_limit.global = parse_limit("DONA_RATE_LIMIT_GLOBAL", &value)?;
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_PER_USER") {
            self.rate_limit.per_user = parse_limit("DONA_RATE_LIMIT_PER_USER", &value)?;
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_DEFAULT_MAX_REQUESTS") {
            self.rate_limit.default.max_requests =
                parse_u32("DONA_RATE_LIMIT_DEFAULT_MAX_REQUESTS", &value)?;
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_DEFAULT_WINDOW_SECS") {
            self.rate_limit.default.window_secs =
                parse_u64("DONA_RATE_LIMIT_DEFAULT_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_COMMANDS") {
            let commands = parse_command_limits("DONA_RATE_LIMIT_COMMANDS", &value)?;
            self.rate_limit.commands.extend(commands);
        }
        if let Some(value) = read_env("DONA_RATE_LIMIT_CLEANUP_INTERVAL_SECS") {
            self.rate_limit.cleanup_interval_secs =
                parse_u64("DONA_RATE_LIMIT_CLEANUP_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("DONA_AUDIT_DESTINATION") {
            self.audit.destination = value.parse()?;
        }
        if let Some(value) = read_env("DONA_AUDIT_QUEUE_CAPACITY") {
            self.audit.queue_capacity = parse_u32("DONA_AUDIT_QUEUE_CAPACITY", &value)? as usize;
        }
        if let Some(value) = read_env("DONA_AUDIT_ALERT_AFTER_FAILURES") {
            self.audit.alert_after_failures =
                parse_u64("DONA_AUDIT_ALERT_AFTER_FAILURES", &value)?;
        }

        if let Some(value) = read_env("DONA_MIDDLEWARE_ACK_DEADLINE_MS") {
            self.middleware.ack_deadline_ms = parse_u64("DONA_MIDDLEWARE_ACK_DEADLINE_MS", &value)?;
        }
        if let Some(value) = read_env("DONA_MIDDLEWARE_SLOW_REQUEST_MS") {
            self.middleware.slow_request_ms = parse_u64("DONA_MIDDLEWARE_SLOW_REQUEST_MS", &value)?;
        }
        if let Some(value) = read_env("DONA_METRICS_WINDOW_SECS") {
            self.middleware.metrics_window_secs = parse_u64("DONA_METRICS_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("DONA_METRICS_REPORT_INTERVAL_SECS") {
            self.middleware.metrics_report_interval_secs =
                parse_u64("DONA_METRICS_REPORT_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("DONA_ADMIN_USERS") {
            self.access.admin_users = split_list(&value);
        }
        let environment = read_env("DONA_ENVIRONMENT").or_else(|| read_env("DONA_ENV"));
        if let Some(value) = environment {
            self.access.environment = value.parse()?;
        }

        let log_level = read_env("DONA_LOGGING_LEVEL").or_else(|| read_env("DONA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("DONA_LOGGING_FORMAT").or_else(|| read_env("DONA_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(slack_app_token) = overrides.slack_app_token {
            self.slack.app_token = secret_value(slack_app_token);
        }
        if let Some(slack_bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = secret_value(slack_bot_token);
        }
        if let Some(destination) = overrides.audit_destination {
            self.audit.destination = destination;
        }
        if let Some(enabled) = overrides.rate_limit_enabled {
            self.rate_limit.enabled = enabled;
        }
        if let Some(admin_users) = overrides.admin_users {
            self.access.admin_users = admin_users;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_slack(&self.slack)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_rate_limit(&self.rate_limit)?;
        validate_audit(&self.audit)?;
        validate_middleware(&self.middleware)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dona.toml"), PathBuf::from("config/dona.toml")]
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

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let app_token = slack.app_token.expose_secret();
    if app_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.app_token is required (Slack app settings > Basic Information > App-Level Tokens)"
                .to_string(),
        ));
    }
    if !app_token.starts_with("xapp-") {
        let hint = if app_token.starts_with("xoxb-") {
            " (hint: you may have used the bot token instead of the app token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.app_token must start with `xapp-`{hint}"
        )));
    }

    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required (Slack app settings > OAuth & Permissions > Bot User OAuth Token)"
                .to_string(),
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xapp-") {
            " (hint: you may have used the app token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-`{hint}"
        )));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if llm.intent_timeout_secs == 0 || llm.intent_timeout_secs > llm.timeout_secs {
        return Err(ConfigError::Validation(
            "llm.intent_timeout_secs must be in range 1..=llm.timeout_secs".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::Groq | LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for groq/openai providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama | LlmProvider::Disabled => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

/// Longest accepted rate limit window, one day.
const MAX_WINDOW_SECS: u64 = 86_400;

fn validate_rate_limit(rate_limit: &RateLimitConfig) -> Result<(), ConfigError> {
    let settings = [
        ("global", &rate_limit.global),
        ("per_user", &rate_limit.per_user),
        ("default", &rate_limit.default),
    ]
    .into_iter()
    .chain(rate_limit.commands.iter().map(|(command, setting)| (command.as_str(), setting)));

    for (name, setting) in settings {
        if setting.max_requests == 0 || setting.window_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "rate_limit `{name}` needs max_requests > 0 and window_secs > 0"
            )));
        }
        if setting.window_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::Validation(format!(
                "rate_limit `{name}` window_secs must not exceed {MAX_WINDOW_SECS}"
            )));
        }
    }

    if rate_limit.cleanup_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "rate_limit.cleanup_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    if audit.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "audit.queue_capacity must be greater than zero".to_string(),
        ));
    }
    if audit.alert_after_failures == 0 {
        return Err(ConfigError::Validation(
            "audit.alert_after_failures must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_middleware(middleware: &MiddlewareConfig) -> Result<(), ConfigError> {
    if middleware.ack_deadline_ms == 0 || middleware.ack_deadline_ms > 3_000 {
        return Err(ConfigError::Validation(
            "middleware.ack_deadline_ms must be in range 1..=3000 (platform deadline is 3s)"
                .to_string(),
        ));
    }
    if middleware.response_bound == 0 {
        return Err(ConfigError::Validation(
            "middleware.response_bound must be greater than zero".to_string(),
        ));
    }
    if middleware.metrics_window_secs == 0 || middleware.metrics_report_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "middleware.metrics_window_secs and metrics_report_interval_secs must be greater than zero"
                .to_string(),
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

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string).collect()
}

/// Parses `"/dona-task=10/60,/dona-metrics=5/60"`.
fn parse_command_limits(
    key: &str,
    value: &str,
) -> Result<BTreeMap<String, LimitSetting>, ConfigError> {
    let invalid = || ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() };

    split_list(value)
        .into_iter()
        .map(|item| {
            let (command, limit) = item.split_once('=').ok_or_else(invalid)?;
            Ok((command.trim().to_string(), parse_limit(key, limit)?))
        })
        .collect()
}

/// Parses `max/window_secs`, e.g. `60/60`.
fn parse_limit(key: &str, value: &str) -> Result<LimitSetting, ConfigError> {
    let invalid = || ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() };
    let (max_requests, window_secs) = value.split_once('/').ok_or_else(invalid)?;
    Ok(LimitSetting {
        max_requests: max_requests.trim().parse().map_err(|_| invalid())?,
        window_secs: window_secs.trim().parse().map_err(|_| invalid())?,
    })
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    slack: Option<SlackPatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    rate_limit: Option<RateLimitPatch>,
    audit: Option<AuditPatch>,
    middleware: Option<MiddlewarePatch>,
    access: Option<AccessPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    app_token: Option<String>,
    bot_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    intent_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    enabled: Option<bool>,
    global: Option<LimitSetting>,
    per_user: Option<LimitSetting>,
    default: Option<LimitSetting>,
    commands: Option<BTreeMap<String, LimitSetting>>,
    cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    destination: Option<AuditDestination>,
    queue_capacity: Option<usize>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    alert_after_failures: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MiddlewarePatch {
    ack_deadline_ms: Option<u64>,
    response_bound: Option<u32>,
    slow_request_ms: Option<u64>,
    metrics_window_secs: Option<u64>,
    metrics_report_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AccessPatch {
    admin_users: Option<Vec<String>>,
    environment: Option<Environment>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
