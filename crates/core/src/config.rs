use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub commerce: CommerceConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub guardrails: GuardrailConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct CommerceConfig {
    pub base_url: String,
    pub site_id: String,
    pub api_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct GuardrailConfig {
    pub max_message_chars: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_messages: u32,
    pub max_conversations_per_user: usize,
    pub safe_email_domain: String,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_messages: usize,
    pub max_conversations: usize,
    pub context_window: usize,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: u32,
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
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
    pub commerce_base_url: Option<String>,
    pub commerce_api_token: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
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
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            commerce: CommerceConfig {
                base_url: "http://localhost:9002".to_string(),
                site_id: "electronics".to_string(),
                api_token: None,
                timeout_secs: 10,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            guardrails: GuardrailConfig {
                max_message_chars: 2000,
                rate_limit_window_secs: 60,
                rate_limit_max_messages: 20,
                max_conversations_per_user: 10,
                safe_email_domain: "example-shop.com".to_string(),
            },
            session: SessionConfig { max_messages: 50, max_conversations: 1000, context_window: 10 },
            cache: CacheConfig { ttl_secs: 300, capacity: 256 },
            retry: RetryConfig {
                max_retries: 3,
                initial_delay_ms: 250,
                max_delay_ms: 5000,
                backoff_factor: 2,
            },
            health: HealthConfig { check_interval_secs: 60 },
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("cartwheel.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(commerce) = patch.commerce {
            if let Some(base_url) = commerce.base_url {
                self.commerce.base_url = base_url;
            }
            if let Some(site_id) = commerce.site_id {
                self.commerce.site_id = site_id;
            }
            if let Some(commerce_api_token_value) = commerce.api_token {
                self.commerce.api_token = Some(secret_value(commerce_api_token_value));
            }
            if let Some(timeout_secs) = commerce.timeout_secs {
                self.commerce.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
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
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(max_message_chars) = guardrails.max_message_chars {
                self.guardrails.max_message_chars = max_message_chars;
            }
            if let Some(rate_limit_window_secs) = guardrails.rate_limit_window_secs {
                self.guardrails.rate_limit_window_secs = rate_limit_window_secs;
            }
            if let Some(rate_limit_max_messages) = guardrails.rate_limit_max_messages {
                self.guardrails.rate_limit_max_messages = rate_limit_max_messages;
            }
            if let Some(max_conversations_per_user) = guardrails.max_conversations_per_user {
                self.guardrails.max_conversations_per_user = max_conversations_per_user;
            }
            if let Some(safe_email_domain) = guardrails.safe_email_domain {
                self.guardrails.safe_email_domain = safe_email_domain;
            }
        }

        if let Some(session) = patch.session {
            if let Some(max_messages) = session.max_messages {
                self.session.max_messages = max_messages;
            }
            if let Some(max_conversations) = session.max_conversations {
                self.session.max_conversations = max_conversations;
            }
            if let Some(context_window) = session.context_window {
                self.session.context_window = context_window;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(ttl_secs) = cache.ttl_secs {
                self.cache.ttl_secs = ttl_secs;
            }
            if let Some(capacity) = cache.capacity {
                self.cache.capacity = capacity;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(max_retries) = retry.max_retries {
                self.retry.max_retries = max_retries;
            }
            if let Some(initial_delay_ms) = retry.initial_delay_ms {
                self.retry.initial_delay_ms = initial_delay_ms;
            }
            if let Some(max_delay_ms) = retry.max_delay_ms {
                self.retry.max_delay_ms = max_delay_ms;
            }
            if let Some(backoff_factor) = retry.backoff_factor {
                self.retry.backoff_factor = backoff_factor;
            }
        }

        if let Some(health) = patch.health {
            if let Some(check_interval_secs) = health.check_interval_secs {
                self.health.check_interval_secs = check_interval_secs;
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
        if let Some(value) = read_env("CARTWHEEL_COMMERCE_BASE_URL") {
            self.commerce.base_url = value;
        }
        if let Some(value) = read_env("CARTWHEEL_COMMERCE_SITE_ID") {
            self.commerce.site_id = value;
        }
        if let Some(value) = read_env("CARTWHEEL_COMMERCE_API_TOKEN") {
            self.commerce.api_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARTWHEEL_COMMERCE_TIMEOUT_SECS") {
            self.commerce.timeout_secs = parse_u64("CARTWHEEL_COMMERCE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CARTWHEEL_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CARTWHEEL_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CARTWHEEL_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CARTWHEEL_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CARTWHEEL_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CARTWHEEL_SERVER_PORT") {
            self.server.port = parse_u16("CARTWHEEL_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CARTWHEEL_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CARTWHEEL_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_GUARDRAILS_MAX_MESSAGE_CHARS") {
            self.guardrails.max_message_chars =
                parse_usize("CARTWHEEL_GUARDRAILS_MAX_MESSAGE_CHARS", &value)?;
        }
        if let Some(value) = read_env("CARTWHEEL_GUARDRAILS_RATE_LIMIT_MAX_MESSAGES") {
            self.guardrails.rate_limit_max_messages =
                parse_u32("CARTWHEEL_GUARDRAILS_RATE_LIMIT_MAX_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("CARTWHEEL_GUARDRAILS_MAX_CONVERSATIONS_PER_USER") {
            self.guardrails.max_conversations_per_user =
                parse_usize("CARTWHEEL_GUARDRAILS_MAX_CONVERSATIONS_PER_USER", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_u64("CARTWHEEL_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CARTWHEEL_CACHE_CAPACITY") {
            self.cache.capacity = parse_usize("CARTWHEEL_CACHE_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_RETRY_MAX_RETRIES") {
            self.retry.max_retries = parse_u32("CARTWHEEL_RETRY_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CARTWHEEL_HEALTH_CHECK_INTERVAL_SECS") {
            self.health.check_interval_secs =
                parse_u64("CARTWHEEL_HEALTH_CHECK_INTERVAL_SECS", &value)?;
        }

        let log_level =
            read_env("CARTWHEEL_LOGGING_LEVEL").or_else(|| read_env("CARTWHEEL_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CARTWHEEL_LOGGING_FORMAT").or_else(|| read_env("CARTWHEEL_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(commerce_base_url) = overrides.commerce_base_url {
            self.commerce.base_url = commerce_base_url;
        }
        if let Some(commerce_api_token) = overrides.commerce_api_token {
            self.commerce.api_token = Some(secret_value(commerce_api_token));
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.commerce.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("commerce.base_url must not be empty".into()));
        }
        if !self.commerce.base_url.starts_with("http://")
            && !self.commerce.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "commerce.base_url must be an http(s) url, got `{}`",
                self.commerce.base_url
            )));
        }
        if self.commerce.site_id.trim().is_empty() {
            return Err(ConfigError::Validation("commerce.site_id must not be empty".into()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".into()));
        }
        if self.guardrails.max_message_chars == 0 {
            return Err(ConfigError::Validation(
                "guardrails.max_message_chars must be positive".into(),
            ));
        }
        if self.guardrails.rate_limit_max_messages == 0 {
            return Err(ConfigError::Validation(
                "guardrails.rate_limit_max_messages must be positive".into(),
            ));
        }
        if self.session.max_messages == 0 || self.session.context_window == 0 {
            return Err(ConfigError::Validation(
                "session.max_messages and session.context_window must be positive".into(),
            ));
        }
        if self.session.context_window > self.session.max_messages {
            return Err(ConfigError::Validation(
                "session.context_window must not exceed session.max_messages".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Validation("cache.capacity must be positive".into()));
        }
        if self.retry.backoff_factor == 0 {
            return Err(ConfigError::Validation("retry.backoff_factor must be positive".into()));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.health.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "health.check_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    commerce: Option<CommercePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    guardrails: Option<GuardrailPatch>,
    session: Option<SessionPatch>,
    cache: Option<CachePatch>,
    retry: Option<RetryPatch>,
    health: Option<HealthPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Deserialize)]
struct CommercePatch {
    base_url: Option<String>,
    site_id: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GuardrailPatch {
    max_message_chars: Option<usize>,
    rate_limit_window_secs: Option<u64>,
    rate_limit_max_messages: Option<u32>,
    max_conversations_per_user: Option<usize>,
    safe_email_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPatch {
    max_messages: Option<usize>,
    max_conversations: Option<usize>,
    context_window: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CachePatch {
    ttl_secs: Option<u64>,
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RetryPatch {
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_factor: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HealthPatch {
    check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

fn resolve_config_path(requested: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = requested {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("cartwheel.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.into(), value: value.into() })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.into(), value: value.into() })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.into(), value: value.into() })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.into(), value: value.into() })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::load(LoadOptions::default()).expect("defaults should load");
        assert_eq!(config.session.max_messages, 50);
        assert_eq!(config.session.max_conversations, 1000);
        assert_eq!(config.guardrails.rate_limit_max_messages, 20);
        assert_eq!(config.guardrails.max_conversations_per_user, 10);
        assert_eq!(config.health.check_interval_secs, 60);
    }

    #[test]
    fn file_patch_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[commerce]
base_url = "https://shop.internal"
site_id = "apparel"

[llm]
provider = "open_ai"
model = "gpt-4o-mini"

[logging]
format = "json"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            ..LoadOptions::default()
        })
        .expect("config should load");

        assert_eq!(config.commerce.base_url, "https://shop.internal");
        assert_eq!(config.commerce.site_id, "apparel");
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some(PathBuf::from("/nonexistent/cartwheel.toml")),
            require_file: true,
            ..LoadOptions::default()
        });

        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn programmatic_overrides_win_over_defaults() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                commerce_base_url: Some("https://override.example".to_string()),
                llm_provider: Some(LlmProvider::Anthropic),
                server_port: Some(9999),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config should load");

        assert_eq!(config.commerce.base_url, "https://override.example");
        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn validation_rejects_non_http_commerce_url() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                commerce_base_url: Some("ftp://shop".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<LlmProvider>().ok(), Some(LlmProvider::OpenAi));
        assert_eq!("ollama".parse::<LlmProvider>().ok(), Some(LlmProvider::Ollama));
        assert!("palm".parse::<LlmProvider>().is_err());
    }
}
