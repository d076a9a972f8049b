use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::completion::{OpenAiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};

pub const DEFAULT_RATE_LIMIT: u32 = 10;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 3600;
pub const DEFAULT_PORT: u16 = 4000;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Clone)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Shared store for counters and history; in-memory stores when unset.
    pub redis_url: Option<String>,
    pub store_timeout: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub openai: OpenAiConfig,
    pub model: String,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
    pub max_request_bytes: Option<usize>,
    pub port: u16,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("rate_limit", &self.rate_limit)
            .field("rate_window", &self.rate_window)
            .field("model", &self.model)
            .field("openai_base_url", &self.openai.base_url)
            .field("openai_key_set", &self.openai.api_key.is_some())
            .field("log_file", &self.log_file)
            .field("max_request_bytes", &self.max_request_bytes)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!("JWT_SECRET must be set"),
        };

        let redis_url = non_empty("REDIS_URL");
        let store_timeout =
            Duration::from_millis(parse_optional_u64("PARLEY_STORE_TIMEOUT_MS")?.unwrap_or(2000));

        let rate_limit = match parse_optional_u64("CHATBOT_RATE_LIMIT")? {
            Some(v) => u32::try_from(v)
                .map_err(|_| anyhow!("CHATBOT_RATE_LIMIT is too large (max {})", u32::MAX))?,
            None => DEFAULT_RATE_LIMIT,
        };
        let window_secs =
            parse_optional_u64("CHATBOT_RATE_WINDOW_SECS")?.unwrap_or(DEFAULT_RATE_WINDOW_SECS);
        if window_secs == 0 {
            bail!("CHATBOT_RATE_WINDOW_SECS must be greater than zero");
        }

        let openai = OpenAiConfig {
            api_key: non_empty("OPENAI_API_KEY"),
            base_url: non_empty("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_millis(parse_optional_u64("OPENAI_TIMEOUT_MS")?.unwrap_or(30_000)),
        };
        if openai.api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; askQuestion will fail with an upstream error");
        }
        let model = non_empty("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be between 0 and 65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            jwt_secret,
            redis_url,
            store_timeout,
            rate_limit,
            rate_window: Duration::from_secs(window_secs),
            openai,
            model,
            log_file: non_empty("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("PARLEY_LOG_STDOUT")?.unwrap_or(false),
            log_sample_n: parse_optional_u64("PARLEY_LOG_SAMPLE_N")?.filter(|n| *n > 1),
            max_request_bytes: parse_optional_u64("PARLEY_MAX_REQUEST_BYTES")?.map(|v| v as usize),
            port,
        })
    }

    /// Configuration for tests and embedding: in-memory stores, defaults
    /// everywhere else.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: secret.into(),
            redis_url: None,
            store_timeout: Duration::from_secs(2),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: Duration::from_secs(DEFAULT_RATE_WINDOW_SECS),
            openai: OpenAiConfig::default(),
            model: DEFAULT_MODEL.to_string(),
            log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
            log_sample_n: None,
            max_request_bytes: None,
            port: DEFAULT_PORT,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
