//! Deterministic vision client for tests and offline runs.

use super::error::ProviderError;
use super::registry::{ModelSpec, ProviderKind};
use super::traits::{AnalyzeRequest, ChatMessage, TokenUsage, VisionClient, VisionDecision};
use crate::actions::Action;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

const MOCK_TOKENS: TokenUsage = TokenUsage {
    input_tokens: 100,
    output_tokens: 20,
};

/// Replays queued decisions (or errors) in FIFO order. When the queue runs
/// dry it answers with the fallback action, a short wait unless configured.
pub struct MockVisionClient {
    spec: ModelSpec,
    queue: Mutex<VecDeque<Result<VisionDecision, ProviderError>>>,
    fallback: Mutex<Action>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockVisionClient {
    pub fn new() -> Self {
        Self {
            spec: ModelSpec {
                id: "mock".into(),
                api_model: "mock".into(),
                provider: ProviderKind::Other("mock".into()),
                input_cost_per_mtok: 0.0,
                output_cost_per_mtok: 0.0,
                max_context_tokens: 128_000,
                supports_computer_use: false,
                supports_element_labels: true,
                base_url: None,
            },
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Action::wait_ms(100)),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the given actions, each with a canned reasoning line.
    pub fn with_actions(actions: impl IntoIterator<Item = Action>) -> Self {
        let mock = Self::new();
        for action in actions {
            mock.push_action(action);
        }
        mock
    }

    /// Answer every call with `action` once the queue is empty.
    pub fn with_fallback(self, action: Action) -> Self {
        *self.fallback.lock() = action;
        self
    }

    pub fn push_action(&self, action: Action) {
        let reasoning = format!("Mock decision: {action}");
        self.push_decision(Self::decision(action, reasoning));
    }

    pub fn push_decision(&self, decision: VisionDecision) {
        self.queue.lock().push_back(Ok(decision));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.queue.lock().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists seen by each call, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }

    pub fn decision(action: Action, reasoning: impl Into<String>) -> VisionDecision {
        let raw = format!("ACTION: {action}");
        VisionDecision::from_action(action, reasoning.into(), MOCK_TOKENS, raw)
    }
}

impl Default for MockVisionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionClient for MockVisionClient {
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.messages.to_vec());

        let next = self.queue.lock().pop_front();
        match next {
            Some(result) => result,
            None => {
                let action = self.fallback.lock().clone();
                Ok(Self::decision(action, "Mock fallback decision"))
            }
        }
    }

    fn model_spec(&self) -> &ModelSpec {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ScrollDirection;

    fn request(messages: &[ChatMessage]) -> AnalyzeRequest<'_> {
        AnalyzeRequest {
            messages,
            screenshot: None,
            element_count: 0,
        }
    }

    #[tokio::test]
    async fn replays_queue_then_fallback() {
        let scroll = Action::Scroll {
            direction: ScrollDirection::Down,
            amount: None,
        };
        let mock = MockVisionClient::with_actions([Action::wait_ms(5)]).with_fallback(scroll.clone());
        let messages = vec![ChatMessage::user("hi")];

        let first = mock.analyze(&request(&messages)).await.unwrap();
        assert_eq!(first.action, Action::wait_ms(5));
        let second = mock.analyze(&request(&messages)).await.unwrap();
        assert_eq!(second.action, scroll);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn queued_errors_surface() {
        let mock = MockVisionClient::new();
        mock.push_error(ProviderError::Network {
            provider: "mock".into(),
            message: "offline".into(),
        });
        let messages = vec![ChatMessage::user("hi")];
        assert!(mock.analyze(&request(&messages)).await.is_err());
    }
}
