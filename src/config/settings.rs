use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const BOT_TOKEN_VAR: &str = "TELEGRAM_BOT_TOKEN";
pub const API_KEY_VAR: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LLMConfig,
    pub persona: PersonaConfig,
    pub memory: MemoryConfig,
    pub telegram: TelegramConfig,
    pub replies: RepliesConfig,
    pub system: SystemConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub model: String,
    pub base_url: String,
    /// Sends `"reasoning": {"enabled": true}` with every request.
    pub reasoning: bool,
    /// Sent as `X-Title` so the provider can attribute traffic.
    pub app_name: Option<String>,
    /// Sent as `HTTP-Referer`.
    pub app_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "deepseek/deepseek-r1:free".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            reasoning: true,
            app_name: Some("chatrelay".to_string()),
            app_url: None,
            timeout_secs: 60,
        }
    }
}

impl LLMConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub system_prompt: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: "Ты дерзкий и язвительный собеседник. \
                            Отвечай коротко, с сарказмом и без лишней вежливости. \
                            Отвечай на том языке, на котором тебе пишут."
                .to_string(),
        }
    }
}

/// What happens to the recorded user turn when its completion fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// The unanswered user turn stays in history.
    #[default]
    Keep,
    /// The user turn is removed again.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_turns: usize,
    pub max_users: usize,
    /// Zero disables idle expiry.
    pub idle_ttl_secs: u64,
    pub prune_interval_secs: u64,
    pub on_failure: FailurePolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_users: 10_000,
            idle_ttl_secs: 0,
            prune_interval_secs: 300,
            on_failure: FailurePolicy::Keep,
        }
    }
}

impl MemoryConfig {
    pub fn idle_ttl(&self) -> Option<Duration> {
        (self.idle_ttl_secs > 0).then(|| Duration::from_secs(self.idle_ttl_secs))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_base: String,
    pub polling_timeout_secs: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            polling_timeout_secs: 30,
        }
    }
}

/// Fixed user-facing texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepliesConfig {
    pub rate_limited: String,
    pub failure: String,
    pub greeting: String,
    pub reset: String,
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            rate_limited: "Слишком много запросов к API, подождите немного и попробуйте снова."
                .to_string(),
            failure: "Произошла ошибка при обработке запроса.".to_string(),
            greeting: "Ну, пиши, чего хотел.".to_string(),
            reset: "История диалога очищена.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub channel_buffer_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Config::builder()
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn bot_token() -> Result<String> {
        required_env(BOT_TOKEN_VAR)
    }

    pub fn api_key() -> Result<String> {
        required_env(API_KEY_VAR)
    }
}

fn required_env(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{} environment variable not set", name))
}
