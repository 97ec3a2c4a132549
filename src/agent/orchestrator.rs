//! The observe → decide → act loop.

use super::history::ConversationHistory;
use super::loop_detector::{LoopDetectionConfig, LoopDetector};
use super::prompt;
use super::session::{
    NavigationControl, NavigationPhase, NavigationResult, NavigationSession, NavigationStatus,
    NavigationStep,
};
use crate::actions::Action;
use crate::browser::observation::{self, Observation, ObservationConfig};
use crate::browser::{bounded, ActionExecutor, BrowserPage, ExecutionOutcome};
use crate::emitter::StepEmitter;
use crate::providers::{AnalyzeRequest, TokenUsage, VisionClient, VisionDecision};
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `[agent]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default step budget when a request does not set one.
    pub max_steps: u32,
    pub max_history_messages: usize,
    /// Pause after each executed action so the page can react.
    pub settle_delay_ms: u64,
    /// How long a `request_human` pause waits for `resume`. Zero ends the
    /// navigation as `awaiting_human` right away.
    pub human_wait_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_history_messages: 20,
            settle_delay_ms: 500,
            human_wait_timeout_ms: 0,
        }
    }
}

/// Everything one navigation needs, injected by the caller.
pub struct Orchestrator {
    client: Arc<dyn VisionClient>,
    page: Arc<dyn BrowserPage>,
    emitter: Arc<dyn StepEmitter>,
    executor: ActionExecutor,
    loop_detector: LoopDetector,
    observation: ObservationConfig,
    config: AgentConfig,
    control: Arc<NavigationControl>,
}

struct Termination {
    status: NavigationStatus,
    goal_achieved: bool,
    summary: Option<String>,
    error: Option<String>,
}

impl Termination {
    fn status(status: NavigationStatus) -> Self {
        Self {
            status,
            goal_achieved: false,
            summary: None,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(NavigationStatus::Failed)
        }
    }
}

/// Running totals kept across steps.
#[derive(Default)]
struct Totals {
    steps: u32,
    usage: TokenUsage,
    last_url: Option<String>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn VisionClient>,
        page: Arc<dyn BrowserPage>,
        emitter: Arc<dyn StepEmitter>,
    ) -> Self {
        Self {
            client,
            page,
            emitter,
            executor: ActionExecutor::default(),
            loop_detector: LoopDetector::default(),
            observation: ObservationConfig::default(),
            config: AgentConfig::default(),
            control: Arc::new(NavigationControl::new()),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executor(mut self, executor: ActionExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_loop_detection(mut self, config: LoopDetectionConfig) -> Self {
        self.loop_detector = LoopDetector::new(config);
        self
    }

    pub fn with_observation(mut self, config: ObservationConfig) -> Self {
        self.observation = config;
        self
    }

    pub fn with_control(mut self, control: Arc<NavigationControl>) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> Arc<NavigationControl> {
        Arc::clone(&self.control)
    }

    /// Drive the navigation to a terminal status. Never fails: anything
    /// unexpected ends up as a `failed` result.
    pub async fn run(mut self, session: &NavigationSession) -> NavigationResult {
        let started = Instant::now();
        tracing::info!(
            navigation_id = %session.navigation_id,
            model = %session.model_id,
            max_steps = session.max_steps,
            "Navigation started"
        );
        self.control.set_phase(NavigationPhase::Navigating);

        let mut totals = Totals::default();
        let termination = match self.drive(session, &mut totals).await {
            Ok(termination) => termination,
            Err(err) => {
                tracing::error!(
                    navigation_id = %session.navigation_id,
                    error = %format!("{err:#}"),
                    "Navigation loop failed"
                );
                Termination::failed(format!("{err:#}"))
            }
        };

        if totals.last_url.is_none() {
            let limit = Duration::from_millis(self.observation.action_timeout_ms);
            totals.last_url = bounded(limit, "URL read", self.page.current_url())
                .await
                .ok();
        }
        let spec = self.client.model_spec();
        let result = NavigationResult {
            navigation_id: session.navigation_id.clone(),
            status: termination.status,
            goal_achieved: termination.goal_achieved,
            total_steps: totals.steps,
            total_tokens: totals.usage.total(),
            usage: totals.usage,
            duration_ms: crate::util::elapsed_ms(started),
            final_url: totals.last_url,
            cost_usd: (spec.input_cost_per_mtok > 0.0 || spec.output_cost_per_mtok > 0.0)
                .then(|| spec.cost_usd(totals.usage)),
            summary: termination.summary,
            error: termination.error,
        };

        self.control.set_phase(if result.status == NavigationStatus::AwaitingHuman {
            NavigationPhase::AwaitingHuman
        } else {
            NavigationPhase::Idle
        });
        if let Err(err) = self.emitter.emit_completion(&result).await {
            tracing::warn!(
                navigation_id = %session.navigation_id,
                error = %err,
                "Completion event was not delivered"
            );
        }
        tracing::info!(
            navigation_id = %session.navigation_id,
            status = %result.status,
            steps = result.total_steps,
            tokens = result.total_tokens,
            duration_ms = result.duration_ms,
            "Navigation finished"
        );
        result
    }

    async fn drive(
        &mut self,
        session: &NavigationSession,
        totals: &mut Totals,
    ) -> anyhow::Result<Termination> {
        let computer_use = self.client.model_spec().supports_computer_use;
        let mut history = ConversationHistory::new(self.config.max_history_messages);

        if let Some(url) = &session.start_url {
            let outcome = self
                .executor
                .execute(self.page.as_ref(), &Action::Navigate { url: url.clone() }, &[])
                .await;
            if let Some(error) = outcome.error {
                anyhow::bail!("could not open start URL {url}: {error}");
            }
        }

        loop {
            if self.control.is_aborted() {
                return Ok(Termination::status(NavigationStatus::Aborted));
            }
            if totals.steps >= session.max_steps {
                return Ok(Termination::status(NavigationStatus::MaxStepsReached));
            }

            totals.steps += 1;
            let step_number = totals.steps;
            let step_started = Instant::now();

            let observation = observation::capture(self.page.as_ref(), &self.observation)
                .await
                .context("failed to observe the page")?;
            totals.last_url = Some(observation.url.clone());

            if step_number == 1 {
                history.start(prompt::system_prompt(computer_use), prompt::goal_message(&session.goal));
            }
            history.push_user(prompt::state_message(step_number, session.max_steps, &observation));
            let trimmed = history.trim();
            if trimmed > 0 {
                tracing::debug!(navigation_id = %session.navigation_id, trimmed, "History trimmed");
            }

            let request = AnalyzeRequest {
                messages: history.messages(),
                screenshot: observation.screenshot.as_ref(),
                element_count: observation.elements.len(),
            };
            let decision = match self.client.analyze(&request).await {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::warn!(
                        navigation_id = %session.navigation_id,
                        step = step_number,
                        code = err.code(),
                        error = %err,
                        "Vision call failed"
                    );
                    let step = self.failed_step(session, step_number, &observation, err.to_string(), step_started);
                    self.emit_step(&step).await;
                    return Ok(Termination::failed(err.to_string()));
                }
            };
            totals.usage.input_tokens += decision.usage.input_tokens;
            totals.usage.output_tokens += decision.usage.output_tokens;
            self.control.record_step(step_number, totals.usage.total());
            history.push_assistant(prompt::decision_message(&decision.reasoning, &decision.action));

            tracing::debug!(
                navigation_id = %session.navigation_id,
                step = step_number,
                action = %decision.action,
                confidence = decision.confidence,
                "Decision received"
            );

            if let Action::Done { success, summary } = &decision.action {
                let step = self.step(session, step_number, &observation, &decision, None, step_started);
                self.emit_step(&NavigationStep {
                    goal_achieved: *success,
                    ..step
                })
                .await;
                return Ok(Termination {
                    status: NavigationStatus::Completed,
                    goal_achieved: *success,
                    summary: summary.clone().or_else(|| non_empty(&decision.reasoning)),
                    error: None,
                });
            }
            if decision.goal_achieved {
                let step = self.step(session, step_number, &observation, &decision, None, step_started);
                self.emit_step(&NavigationStep {
                    goal_achieved: true,
                    ..step
                })
                .await;
                return Ok(Termination {
                    status: NavigationStatus::Completed,
                    goal_achieved: true,
                    summary: non_empty(&decision.reasoning),
                    error: None,
                });
            }

            if let Action::RequestHuman { reason } = &decision.action {
                let step = self.step(session, step_number, &observation, &decision, None, step_started);
                self.emit_step(&step).await;
                if let Some(termination) = self.await_human(session, reason).await {
                    return Ok(termination);
                }
                history.push_user(prompt::human_resumed_message(reason));
                self.loop_detector.reset();
                continue;
            }

            let outcome = self
                .executor
                .execute_scaled(
                    self.page.as_ref(),
                    &decision.action,
                    &observation.elements,
                    observation.image_scale,
                )
                .await;
            if let Some(url) = &outcome.new_url {
                totals.last_url = Some(url.clone());
            }
            if let Some(error) = &outcome.error {
                history.push_user(prompt::failure_message(&decision.action, error));
            }

            let verdict = self.loop_detector.record(&decision.action, &outcome);
            let step = self.step(
                session,
                step_number,
                &observation,
                &decision,
                Some(&outcome),
                step_started,
            );
            self.emit_step(&step).await;

            if let Some(verdict) = verdict {
                tracing::warn!(
                    navigation_id = %session.navigation_id,
                    step = step_number,
                    family = %verdict.family,
                    repetitions = verdict.repetitions,
                    "Loop detected"
                );
                return Ok(Termination {
                    error: Some(format!("loop detected: {verdict}")),
                    ..Termination::status(NavigationStatus::LoopDetected)
                });
            }

            if self.config.settle_delay_ms > 0 {
                tokio::select! {
                    () = self.control.cancellation().cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)) => {}
                }
            }
        }
    }

    /// Pause for a person. `None` means resumed; otherwise how the
    /// navigation ends.
    async fn await_human(&self, session: &NavigationSession, reason: &str) -> Option<Termination> {
        self.control.set_phase(NavigationPhase::AwaitingHuman);
        tracing::info!(navigation_id = %session.navigation_id, reason, "Waiting for human");

        let paused = Termination {
            summary: Some(reason.to_string()),
            ..Termination::status(NavigationStatus::AwaitingHuman)
        };
        if self.config.human_wait_timeout_ms == 0 {
            return Some(paused);
        }

        tokio::select! {
            () = self.control.cancellation().cancelled() => {
                Some(Termination::status(NavigationStatus::Aborted))
            }
            () = self.control.resumed() => {
                tracing::info!(navigation_id = %session.navigation_id, "Navigation resumed");
                self.control.set_phase(NavigationPhase::Navigating);
                None
            }
            () = tokio::time::sleep(Duration::from_millis(self.config.human_wait_timeout_ms)) => {
                Some(paused)
            }
        }
    }

    async fn emit_step(&self, step: &NavigationStep) {
        if let Err(err) = self.emitter.emit_step(step).await {
            tracing::warn!(
                navigation_id = %step.navigation_id,
                step = step.step,
                error = %err,
                "Step event was not delivered"
            );
        }
    }

    fn step(
        &self,
        session: &NavigationSession,
        step_number: u32,
        observation: &Observation,
        decision: &VisionDecision,
        outcome: Option<&ExecutionOutcome>,
        started: Instant,
    ) -> NavigationStep {
        NavigationStep {
            navigation_id: session.navigation_id.clone(),
            step: step_number,
            action: Some(decision.action.clone()),
            reasoning: decision.reasoning.clone(),
            confidence: decision.confidence,
            url: outcome
                .and_then(|o| o.new_url.clone())
                .unwrap_or_else(|| observation.url.clone()),
            screenshot: observation.screenshot.clone(),
            elements: observation.elements.clone(),
            usage: decision.usage,
            tokens_used: decision.tokens_used,
            duration_ms: crate::util::elapsed_ms(started),
            effect: outcome.map(|o| o.effect.clone()),
            goal_achieved: false,
            error: outcome.and_then(|o| o.error.clone()),
            timestamp: Utc::now(),
        }
    }

    fn failed_step(
        &self,
        session: &NavigationSession,
        step_number: u32,
        observation: &Observation,
        error: String,
        started: Instant,
    ) -> NavigationStep {
        NavigationStep {
            navigation_id: session.navigation_id.clone(),
            step: step_number,
            action: None,
            reasoning: String::new(),
            confidence: 0.0,
            url: observation.url.clone(),
            screenshot: observation.screenshot.clone(),
            elements: observation.elements.clone(),
            usage: TokenUsage::default(),
            tokens_used: 0,
            duration_ms: crate::util::elapsed_ms(started),
            effect: None,
            goal_achieved: false,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ClickButton, ScrollDirection, Target};
    use crate::browser::{ElementLabel, MockPage};
    use crate::emitter::CollectingEmitter;
    use crate::providers::MockVisionClient;

    struct Harness {
        client: Arc<MockVisionClient>,
        page: Arc<MockPage>,
        emitter: Arc<CollectingEmitter>,
    }

    impl Harness {
        fn new(client: MockVisionClient, page: MockPage) -> Self {
            Self {
                client: Arc::new(client),
                page: Arc::new(page),
                emitter: Arc::new(CollectingEmitter::new()),
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(self.client.clone(), self.page.clone(), self.emitter.clone())
                .with_config(AgentConfig {
                    settle_delay_ms: 0,
                    ..AgentConfig::default()
                })
        }
    }

    fn session(max_steps: u32) -> NavigationSession {
        NavigationSession::new("tab-1", "find the docs", "mock", max_steps)
    }

    #[tokio::test]
    async fn goal_flag_without_done_completes_without_executing() {
        let mut decision = MockVisionClient::decision(
            Action::Click {
                target: Target::Element(1),
                button: ClickButton::Left,
            },
            "Already there.",
        );
        decision.goal_achieved = true;
        let client = MockVisionClient::new();
        client.push_decision(decision);
        let harness = Harness::new(
            client,
            MockPage::new("https://example.com").with_elements(vec![ElementLabel::new(1, "a")]),
        );

        let result = harness.orchestrator().run(&session(5)).await;
        assert_eq!(result.status, NavigationStatus::Completed);
        assert!(result.goal_achieved);
        assert!(harness.page.calls().is_empty());
        assert!(harness.emitter.steps()[0].goal_achieved);
    }

    #[tokio::test]
    async fn execution_failure_feeds_back_and_continues() {
        let client = MockVisionClient::with_actions([
            Action::Click {
                target: Target::Element(2),
                button: ClickButton::Left,
            },
            Action::Done {
                success: true,
                summary: Some("ok".into()),
            },
        ]);
        let page = MockPage::new("https://example.com");
        page.hide("[data-webpilot-label=\"2\"]");
        let harness = Harness::new(client, page);

        let result = harness.orchestrator().run(&session(5)).await;
        assert_eq!(result.status, NavigationStatus::Completed);
        let steps = harness.emitter.steps();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].error.as_deref().unwrap().contains("not visible"));

        let second_call = &harness.client.requests()[1];
        assert!(second_call
            .iter()
            .any(|m| m.role == "user" && m.content.contains("failed")));
    }

    #[tokio::test]
    async fn history_stays_bounded_and_pinned() {
        let client = MockVisionClient::new().with_fallback(Action::Scroll {
            direction: ScrollDirection::Down,
            amount: Some(100),
        });
        let harness = Harness::new(client, MockPage::new("https://example.com").with_page_height(1.0e6));
        let orchestrator = harness.orchestrator().with_config(AgentConfig {
            max_history_messages: 6,
            settle_delay_ms: 0,
            ..AgentConfig::default()
        });
        orchestrator.run(&session(8)).await;

        for request in harness.client.requests() {
            assert!(request.len() <= 6);
            assert_eq!(request[0].role, "system");
            assert!(request[1].content.contains("find the docs"));
        }
    }

    #[tokio::test]
    async fn request_human_without_timeout_pauses_terminally() {
        let client = MockVisionClient::with_actions([Action::RequestHuman {
            reason: "captcha".into(),
        }]);
        let harness = Harness::new(client, MockPage::new("https://example.com"));
        let orchestrator = harness.orchestrator();
        let control = orchestrator.control();

        let result = orchestrator.run(&session(5)).await;
        assert_eq!(result.status, NavigationStatus::AwaitingHuman);
        assert_eq!(result.summary.as_deref(), Some("captcha"));
        assert_eq!(control.phase(), NavigationPhase::AwaitingHuman);
        assert_eq!(harness.emitter.steps().len(), 1);
    }

    #[tokio::test]
    async fn request_human_resumes() {
        let client = MockVisionClient::with_actions([
            Action::RequestHuman {
                reason: "2fa".into(),
            },
            Action::Done {
                success: true,
                summary: None,
            },
        ]);
        let harness = Harness::new(client, MockPage::new("https://example.com"));
        let orchestrator = harness.orchestrator().with_config(AgentConfig {
            settle_delay_ms: 0,
            human_wait_timeout_ms: 10_000,
            ..AgentConfig::default()
        });
        let control = orchestrator.control();
        let sess = session(5);
        let task = tokio::spawn(async move { orchestrator.run(&sess).await });

        for _ in 0..200 {
            if control.resume() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = task.await.unwrap();
        assert_eq!(result.status, NavigationStatus::Completed);
        assert_eq!(result.total_steps, 2);
        let last_call = harness.client.requests().pop().unwrap();
        assert!(last_call.iter().any(|m| m.content.contains("A person has handled")));
    }

    #[tokio::test]
    async fn start_url_is_opened_first() {
        let client = MockVisionClient::with_actions([Action::Done {
            success: true,
            summary: None,
        }]);
        let harness = Harness::new(client, MockPage::new("about:blank"));
        let result = harness
            .orchestrator()
            .run(&session(3).with_start_url("https://example.com/"))
            .await;
        assert_eq!(harness.page.calls(), vec!["navigate https://example.com/".to_string()]);
        assert_eq!(result.final_url.as_deref(), Some("https://example.com/"));
    }
}
