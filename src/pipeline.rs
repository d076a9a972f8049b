//! The ask-a-question pipeline.
//!
//! Requests reach [`ChatPipeline::ask`] only after the permission table has
//! authenticated the caller and validated the question.  From there the
//! pipeline consumes quota, asks the completion provider, persists the
//! answer and assembles the response.  Any rejection ends the run; a
//! rate-limited request never reaches the provider.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::Identity;
use crate::completion::{CompletionClient, UpstreamError};
use crate::conversation::{ChatMessage, ConversationStore, NewChatMessage};
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::ratelimit::{RateDecision, RateLimiter};

/// Per-request progress through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authorized,
    Validated,
    RateChecked,
    Completed,
    Persisted,
    Responded,
    RejectedAuth,
    RejectedValidation,
    RejectedRateLimit,
    FailedUpstream,
    FailedInternal,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Authorized => "authorized",
            Stage::Validated => "validated",
            Stage::RateChecked => "rate_checked",
            Stage::Completed => "completed",
            Stage::Persisted => "persisted",
            Stage::Responded => "responded",
            Stage::RejectedAuth => "rejected_auth",
            Stage::RejectedValidation => "rejected_validation",
            Stage::RejectedRateLimit => "rejected_rate_limit",
            Stage::FailedUpstream => "failed_upstream",
            Stage::FailedInternal => "failed_internal",
        }
    }

    /// Terminal stage reached when a run ends with `err`.
    pub fn for_error(err: &AppError) -> Stage {
        match err {
            AppError::Unauthenticated | AppError::Forbidden => Stage::RejectedAuth,
            AppError::BadUserInput { .. } | AppError::PayloadTooLarge { .. } => {
                Stage::RejectedValidation
            }
            AppError::RateLimited { .. } => Stage::RejectedRateLimit,
            AppError::Upstream(_) => Stage::FailedUpstream,
            AppError::Internal(_) => Stage::FailedInternal,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

impl From<&RateDecision> for RateLimitInfo {
    fn from(d: &RateDecision) -> Self {
        Self {
            limit: d.limit,
            remaining: d.remaining,
            reset_time: d.reset_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub rate_limit_info: RateLimitInfo,
}

#[derive(Clone)]
pub struct ChatPipeline {
    limiter: RateLimiter,
    completion: Arc<dyn CompletionClient>,
    conversations: Arc<dyn ConversationStore>,
    model: String,
    upstream_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ChatPipeline {
    pub fn new(
        limiter: RateLimiter,
        completion: Arc<dyn CompletionClient>,
        conversations: Arc<dyn ConversationStore>,
        model: impl Into<String>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            completion,
            conversations,
            model: model.into(),
            upstream_timeout,
            metrics: None,
        }
    }

    /// Record provider latency and answered questions into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Answer `question` for an already authorized caller.
    pub async fn ask(&self, identity: &Identity, question: &str) -> Result<ChatResponse, AppError> {
        let subject = identity.subject_id.as_str();
        tracing::debug!(subject, stage = %Stage::Validated, chars = question.chars().count());

        let decision = self.limiter.check_and_increment(subject).await?;
        if !decision.allowed {
            return Err(AppError::RateLimited {
                limit: decision.limit,
                reset_at: decision.reset_at,
            });
        }
        tracing::debug!(subject, stage = %Stage::RateChecked, remaining = decision.remaining);

        let answer = self.complete(question).await.map_err(|err| {
            tracing::warn!(subject, stage = %Stage::FailedUpstream, error = %err, "completion failed");
            AppError::Upstream(err.to_string())
        })?;
        tracing::debug!(subject, stage = %Stage::Completed, answer_chars = answer.chars().count());

        let message = self
            .conversations
            .insert(NewChatMessage {
                question: question.to_string(),
                answer,
                model_used: self.model.clone(),
                author_id: subject.to_string(),
            })
            .await
            .map_err(|err| {
                tracing::error!(subject, stage = %Stage::FailedInternal, error = %err, "failed to persist chat message");
                AppError::from(err)
            })?;
        tracing::debug!(subject, stage = %Stage::Persisted, message_id = %message.id);
        if let Some(m) = &self.metrics {
            m.record_answer();
        }

        Ok(ChatResponse {
            message,
            rate_limit_info: RateLimitInfo::from(&decision),
        })
    }

    async fn complete(&self, question: &str) -> Result<String, UpstreamError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.upstream_timeout,
            self.completion.complete(question, &self.model),
        )
        .await
        .unwrap_or(Err(UpstreamError::Timeout(self.upstream_timeout)));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.observe_upstream(elapsed_ms);
        }
        tracing::debug!(elapsed_ms, ok = result.is_ok(), "completion call finished");
        result
    }

    /// The caller's own messages, newest first.
    pub async fn history(
        &self,
        identity: &Identity,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, AppError> {
        Ok(self
            .conversations
            .history(&identity.subject_id, limit, offset)
            .await?)
    }

    pub async fn quota(&self, identity: &Identity) -> Result<RateLimitInfo, AppError> {
        let decision = self.limiter.status(&identity.subject_id).await?;
        Ok(RateLimitInfo::from(&decision))
    }
}
