//! Delivery of step and completion events to whoever owns the navigation.
//!
//! Emission is best effort from the agent's point of view: the orchestrator
//! logs an [`EmitError`] and carries on.

use crate::agent::{NavigationResult, NavigationStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("event delivery to {url} failed after {attempts} attempt(s): {message}")]
    Exhausted {
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `[emitter]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Linear backoff unit: the wait after attempt `n` is `backoff_ms * n`.
    pub backoff_ms: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'static str,
    sent_at: DateTime<Utc>,
    #[serde(flatten)]
    data: &'a T,
}

#[async_trait]
pub trait StepEmitter: Send + Sync {
    async fn emit_step(&self, step: &NavigationStep) -> Result<(), EmitError>;

    async fn emit_completion(&self, result: &NavigationResult) -> Result<(), EmitError>;
}

#[async_trait]
impl<T: StepEmitter + ?Sized> StepEmitter for std::sync::Arc<T> {
    async fn emit_step(&self, step: &NavigationStep) -> Result<(), EmitError> {
        (**self).emit_step(step).await
    }

    async fn emit_completion(&self, result: &NavigationResult) -> Result<(), EmitError> {
        (**self).emit_completion(result).await
    }
}

/// POSTs JSON events to a callback URL.
pub struct HttpStepEmitter {
    url: String,
    config: EmitterConfig,
    http: reqwest::Client,
}

impl HttpStepEmitter {
    pub fn new(url: impl Into<String>, config: EmitterConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            config,
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post<T: Serialize + Sync>(&self, event: &'static str, data: &T) -> Result<(), EmitError> {
        let body = serde_json::to_vec(&Envelope {
            event,
            sent_at: Utc::now(),
            data,
        })?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let response = self
                .http
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_error = format!("HTTP {}", resp.status().as_u16()),
                Err(err) => last_error = err.to_string(),
            }

            if attempt < attempts {
                let wait = self.config.backoff_ms.saturating_mul(u64::from(attempt));
                tracing::warn!(
                    event,
                    attempt,
                    backoff_ms = wait,
                    error = %last_error,
                    "Event delivery failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
        }

        Err(EmitError::Exhausted {
            url: self.url.clone(),
            attempts,
            message: last_error,
        })
    }
}

#[async_trait]
impl StepEmitter for HttpStepEmitter {
    async fn emit_step(&self, step: &NavigationStep) -> Result<(), EmitError> {
        self.post("step", step).await
    }

    async fn emit_completion(&self, result: &NavigationResult) -> Result<(), EmitError> {
        self.post("completion", result).await
    }
}

/// Logs events instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

#[async_trait]
impl StepEmitter for TracingEmitter {
    async fn emit_step(&self, step: &NavigationStep) -> Result<(), EmitError> {
        let action = step
            .action
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        tracing::info!(
            navigation_id = %step.navigation_id,
            step = step.step,
            action = %action,
            url = %step.url,
            tokens = step.tokens_used,
            error = step.error.as_deref().unwrap_or(""),
            "{}",
            crate::util::truncate_with_ellipsis(step.reasoning.trim(), 160)
        );
        Ok(())
    }

    async fn emit_completion(&self, result: &NavigationResult) -> Result<(), EmitError> {
        tracing::info!(
            navigation_id = %result.navigation_id,
            status = %result.status,
            steps = result.total_steps,
            tokens = result.total_tokens,
            duration_ms = result.duration_ms,
            "Navigation finished"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    steps: Mutex<Vec<NavigationStep>>,
    completions: Mutex<Vec<NavigationResult>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<NavigationStep> {
        self.steps.lock().clone()
    }

    pub fn completions(&self) -> Vec<NavigationResult> {
        self.completions.lock().clone()
    }
}

#[async_trait]
impl StepEmitter for CollectingEmitter {
    async fn emit_step(&self, step: &NavigationStep) -> Result<(), EmitError> {
        self.steps.lock().push(step.clone());
        Ok(())
    }

    async fn emit_completion(&self, result: &NavigationResult) -> Result<(), EmitError> {
        self.completions.lock().push(result.clone());
        Ok(())
    }
}
