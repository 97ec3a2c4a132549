//! Navigation records and the shared control handle.

use crate::actions::Action;
use crate::browser::{EffectContext, ElementLabel};
use crate::providers::{ImagePayload, TokenUsage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a navigation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationStatus {
    Completed,
    Failed,
    Aborted,
    MaxStepsReached,
    LoopDetected,
    AwaitingHuman,
}

impl NavigationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::MaxStepsReached => "max_steps_reached",
            Self::LoopDetected => "loop_detected",
            Self::AwaitingHuman => "awaiting_human",
        }
    }
}

impl fmt::Display for NavigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a navigation is doing right now, as reported by status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationPhase {
    #[default]
    Idle,
    Navigating,
    AwaitingHuman,
}

/// Immutable description of one accepted navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationSession {
    pub navigation_id: String,
    pub target_id: String,
    pub goal: String,
    pub model_id: String,
    pub max_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NavigationSession {
    pub fn new(
        target_id: impl Into<String>,
        goal: impl Into<String>,
        model_id: impl Into<String>,
        max_steps: u32,
    ) -> Self {
        Self {
            navigation_id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.into(),
            goal: goal.into(),
            model_id: model_id.into(),
            max_steps,
            start_url: None,
            callback_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

/// Record of one loop iteration. Built once, emitted, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationStep {
    pub navigation_id: String,
    pub step: u32,
    /// Absent when the model call itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub reasoning: String,
    pub confidence: f32,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<ImagePayload>,
    pub elements: Vec<ElementLabel>,
    pub usage: TokenUsage,
    pub tokens_used: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<EffectContext>,
    pub goal_achieved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationResult {
    pub navigation_id: String,
    pub status: NavigationStatus,
    pub goal_achieved: bool,
    pub total_steps: u32,
    pub total_tokens: u64,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub navigation_id: String,
    pub phase: NavigationPhase,
    pub is_navigating: bool,
    pub is_paused: bool,
    pub step: u32,
    pub tokens_used: u64,
}

#[derive(Debug, Default)]
struct Progress {
    phase: NavigationPhase,
    step: u32,
    tokens_used: u64,
}

/// Shared between a running orchestrator and whoever accepted it. Abort and
/// resume only signal; the loop reacts at its next step boundary.
#[derive(Debug, Default)]
pub struct NavigationControl {
    cancel: CancellationToken,
    resume: Notify,
    progress: Mutex<Progress>,
}

impl NavigationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wake a paused navigation. Returns `false` (and does nothing) when it
    /// is not waiting for a human.
    pub fn resume(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.phase != NavigationPhase::AwaitingHuman {
            return false;
        }
        progress.phase = NavigationPhase::Navigating;
        self.resume.notify_one();
        true
    }

    pub(crate) async fn resumed(&self) {
        self.resume.notified().await;
    }

    pub fn phase(&self) -> NavigationPhase {
        self.progress.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: NavigationPhase) {
        self.progress.lock().phase = phase;
    }

    pub(crate) fn record_step(&self, step: u32, tokens_used: u64) {
        let mut progress = self.progress.lock();
        progress.step = step;
        progress.tokens_used = tokens_used;
    }

    pub fn report(&self, navigation_id: &str) -> StatusReport {
        let progress = self.progress.lock();
        StatusReport {
            navigation_id: navigation_id.to_string(),
            phase: progress.phase,
            is_navigating: progress.phase == NavigationPhase::Navigating,
            is_paused: progress.phase == NavigationPhase::AwaitingHuman,
            step: progress.step,
            tokens_used: progress.tokens_used,
        }
    }
}
