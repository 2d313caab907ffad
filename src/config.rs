//! Configuration management.
//!
//! Configuration is read from environment variables, optionally seeded from a
//! `.env` file by the binary:
//! - `ARMIS_API_KEY` - Required. Bearer token for the MCP endpoint.
//! - `ARMIS_MCP_URL` - Required. MCP endpoint URL.
//! - `OLLAMA_MODEL` - Optional. Model name. Defaults to `mistral`.
//! - `OLLAMA_HOST` - Optional. Ollama base URL. Defaults to `http://127.0.0.1:11434`.
//! - `CONTEXT_DIR` - Optional. Directory holding `Role.md`, `Rules.md`,
//!   `Prompts.md` and `prompts/`. Defaults to `context`.
//! - `HISTORY_DIR` - Optional. Run history directory. Defaults to `<CONTEXT_DIR>/history`.
//! - `MAX_ROUNDS` - Optional. Model/tool round cap. Defaults to `10`.
//! - `TOOL_RETRIES`, `MODEL_RETRIES` - Optional. Retry budgets. Default to `1`.
//! - `RETRY_DELAY_MS` - Optional. Fixed delay between retries. Defaults to `500`.
//! - `TOOL_TIMEOUT_SECS` - Optional. Per tool call. Defaults to `120`.
//! - `MODEL_TIMEOUT_SECS` - Optional. Per model call. Defaults to `600`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8501`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::agent::LoopPolicy;
use crate::llm::ollama::DEFAULT_HOST;

pub const DEFAULT_MODEL: &str = "mistral";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable(s): {}", .0.join(", "))]
    MissingEnvVar(Vec<String>),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the MCP endpoint
    pub api_key: String,

    pub mcp_url: String,

    pub ollama_host: String,

    /// Model used when a run does not name one
    pub default_model: String,

    pub context_dir: PathBuf,

    pub history_dir: PathBuf,

    pub host: String,

    pub port: u16,

    pub max_rounds: usize,
    pub tool_retries: u32,
    pub model_retries: u32,
    pub retry_delay: Duration,
    pub tool_timeout: Duration,
    pub model_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` naming every required variable
    /// that is unset or blank, and `ConfigError::InvalidValue` for values
    /// that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = non_blank("ARMIS_API_KEY");
        let mcp_url = non_blank("ARMIS_MCP_URL");

        let missing: Vec<String> = [("ARMIS_API_KEY", &api_key), ("ARMIS_MCP_URL", &mcp_url)]
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.to_string())
            .collect();
        let (Some(api_key), Some(mcp_url)) = (api_key, mcp_url) else {
            return Err(ConfigError::MissingEnvVar(missing));
        };

        url::Url::parse(&mcp_url)
            .map_err(|e| ConfigError::InvalidValue("ARMIS_MCP_URL".to_string(), e.to_string()))?;

        let default_model = non_blank("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let ollama_host = non_blank("OLLAMA_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());

        let context_dir = non_blank("CONTEXT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("context"));
        let history_dir = non_blank("HISTORY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| context_dir.join("history"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("PORT", 8501)?;

        let max_rounds: usize = parse_env("MAX_ROUNDS", 10)?;
        if max_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_ROUNDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            mcp_url,
            ollama_host,
            default_model,
            context_dir,
            history_dir,
            host,
            port,
            max_rounds,
            tool_retries: parse_env("TOOL_RETRIES", 1)?,
            model_retries: parse_env("MODEL_RETRIES", 1)?,
            retry_delay: Duration::from_millis(parse_env("RETRY_DELAY_MS", 500)?),
            tool_timeout: Duration::from_secs(parse_env("TOOL_TIMEOUT_SECS", 120)?),
            model_timeout: Duration::from_secs(parse_env("MODEL_TIMEOUT_SECS", 600)?),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, mcp_url: String, context_dir: PathBuf) -> Self {
        Self {
            api_key,
            mcp_url,
            ollama_host: DEFAULT_HOST.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            history_dir: context_dir.join("history"),
            context_dir,
            host: "127.0.0.1".to_string(),
            port: 8501,
            max_rounds: 10,
            tool_retries: 1,
            model_retries: 1,
            retry_delay: Duration::from_millis(500),
            tool_timeout: Duration::from_secs(120),
            model_timeout: Duration::from_secs(600),
        }
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        LoopPolicy {
            max_rounds: self.max_rounds,
            tool_retries: self.tool_retries,
            model_retries: self.model_retries,
            retry_delay: self.retry_delay,
            tool_timeout: self.tool_timeout,
            model_timeout: self.model_timeout,
        }
    }
}

fn non_blank(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_blank(name) {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}
