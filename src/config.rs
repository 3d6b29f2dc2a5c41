//! Runtime configuration: defaults, optional TOML overlay, env overrides.
//!
//! | Env Var | Default | Purpose |
//! |---------|---------|---------|
//! | `SCREENER_CONFIG` | (none) | Path to a TOML config file |
//! | `SCREENER_DATA_DIR` | `~/.screener/data` | Parquet market-data directory |
//! | `SCREENER_DB_PATH` | `~/.screener/screener.db` | Strategy store sqlite file |
//! | `SCREENER_USER_ID` | `1` | Principal the server binds to |
//! | `RESULT_TTL_SECS` | `86400` | Backtest result cache TTL |
//! | `MODEL_ENDPOINT` | OpenAI chat completions | Model endpoint URL |
//! | `MODEL_API_KEY` | (none) | Bearer token for the model endpoint |
//! | `MODEL_NAME` | `gpt-4o-mini` | Model identifier |
//! | `MODEL_TIMEOUT_SECS` | `60` | Per-turn request timeout |
//! | `SYNTH_MAX_ATTEMPTS` | `3` | Self-repair attempt budget |
//! | `ALERT_TICK_MS` | `1000` | Alert scheduler tick interval |
//! | `TELEGRAM_BOT_TOKEN` | (none) | Telegram transport credential |
//! | `TELEGRAM_CHAT_ID` | (none) | Telegram destination chat |

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub default_user_id: i64,
    pub result_ttl_secs: u64,
    pub model: ModelConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_attempts: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub tick_ms: u64,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: home().join(".screener").join("data"),
            db_path: home().join(".screener").join("screener.db"),
            default_user_id: 1,
            result_ttl_secs: 24 * 60 * 60,
            model: ModelConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            max_attempts: 3,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SCREENER_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    PipelineError::Transport(format!("config file {path}: {e}"))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| PipelineError::Transport(format!("config file {path}: {e}")))?
            }
            Err(_) => Config::default(),
        };

        if let Ok(value) = std::env::var("SCREENER_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SCREENER_DB_PATH") {
            config.db_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("SCREENER_USER_ID") {
            config.default_user_id = parse(&value, "SCREENER_USER_ID")?;
        }
        if let Ok(value) = std::env::var("RESULT_TTL_SECS") {
            config.result_ttl_secs = parse(&value, "RESULT_TTL_SECS")?;
        }
        if let Ok(value) = std::env::var("MODEL_ENDPOINT") {
            config.model.endpoint = value;
        }
        if let Ok(value) = std::env::var("MODEL_API_KEY") {
            config.model.api_key = value;
        }
        if let Ok(value) = std::env::var("MODEL_NAME") {
            config.model.model = value;
        }
        if let Ok(value) = std::env::var("MODEL_TIMEOUT_SECS") {
            config.model.timeout_secs = parse(&value, "MODEL_TIMEOUT_SECS")?;
        }
        if let Ok(value) = std::env::var("SYNTH_MAX_ATTEMPTS") {
            config.model.max_attempts = parse(&value, "SYNTH_MAX_ATTEMPTS")?;
        }
        if let Ok(value) = std::env::var("ALERT_TICK_MS") {
            config.alerts.tick_ms = parse(&value, "ALERT_TICK_MS")?;
        }
        if let Ok(value) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.alerts.telegram_bot_token = Some(value);
        }
        if let Ok(value) = std::env::var("TELEGRAM_CHAT_ID") {
            config.alerts.telegram_chat_id = Some(value);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, var: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PipelineError::Transport(format!("{var}: cannot parse {value:?}")))
}

fn home() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
}
