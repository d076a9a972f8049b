//! Language-model completion client.
//!
//! The pipeline only depends on [`CompletionClient`]; the OpenAI
//! implementation posts to the `chat/completions` endpoint with a fixed
//! system prompt.  Errors keep full provider detail so the pipeline can log
//! it before replacing it with a generic message.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";
/// Returned when the provider answers without any usable text.
pub const FALLBACK_ANSWER: &str = "Sorry, I could not generate a response.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant for a portfolio website. Provide concise, helpful responses about web development, projects, and technologies. Avoid giving any personal opinions or making claims about specific individuals. Do not generate code unless explicitly asked.";
const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("completion provider is not configured")]
    NotConfigured,

    #[error("request to provider failed: {0}")]
    Transport(String),

    #[error("provider responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider response could not be decoded: {0}")]
    Decode(String),

    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, UpstreamError>;
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(cfg: OpenAiConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(format!("failed to build http client: {}", e)))?;
        let base = if cfg.base_url.ends_with('/') {
            cfg.base_url
        } else {
            format!("{}/", cfg.base_url)
        };
        Ok(Self {
            client,
            api_key: cfg.api_key.filter(|k| !k.trim().is_empty()),
            endpoint: format!("{}chat/completions", base),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// First non-empty choice text, or the fallback answer.
fn extract_answer(completion: ChatCompletion) -> String {
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_ANSWER.to_string())
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String, UpstreamError> {
        let api_key = self.api_key.as_deref().ok_or(UpstreamError::NotConfigured)?;
        let body = ChatRequest {
            model,
            messages: [
                WireMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                WireMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let completion: ChatCompletion =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(extract_answer(completion))
    }
}
