use super::error::ProviderError;
use super::registry::ModelSpec;
use crate::actions::Action;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Encoded image sent alongside the latest user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub media_type: String,
    pub data_base64: String,
    pub width: u32,
    pub height: u32,
}

impl ImagePayload {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_base64)
    }
}

/// Raw token counts reported by (or estimated for) a provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Everything a client needs for one decision.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzeRequest<'a> {
    /// Conversation so far; system messages first.
    pub messages: &'a [ChatMessage],
    /// Current screenshot, attached to the last user message.
    pub screenshot: Option<&'a ImagePayload>,
    /// Number of labeled elements described in the last user message.
    pub element_count: usize,
}

/// A client's answer for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionDecision {
    pub action: Action,
    pub reasoning: String,
    pub goal_achieved: bool,
    pub confidence: f32,
    pub tokens_used: u64,
    pub usage: TokenUsage,
    pub raw_response: String,
}

impl VisionDecision {
    /// Assemble a decision, deriving confidence and completion from the action.
    pub fn from_action(
        action: Action,
        reasoning: String,
        usage: TokenUsage,
        raw_response: String,
    ) -> Self {
        let goal_achieved = matches!(action, Action::Done { success: true, .. });
        let confidence = super::confidence::derived_confidence(&action, &reasoning);
        Self {
            action,
            reasoning,
            goal_achieved,
            confidence,
            tokens_used: usage.total(),
            usage,
            raw_response,
        }
    }
}

/// Provider-neutral vision model client.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Decide the next action for the given page state.
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError>;

    /// Capability and cost metadata for the model behind this client.
    fn model_spec(&self) -> &ModelSpec;
}

#[async_trait]
impl<T: VisionClient + ?Sized> VisionClient for std::sync::Arc<T> {
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError> {
        (**self).analyze(request).await
    }

    fn model_spec(&self) -> &ModelSpec {
        (**self).model_spec()
    }
}

const SYSTEM_PROMPT_TOKENS: u64 = 800;
const IMAGE_TOKENS: u64 = 1_500;
const TOKENS_PER_ELEMENT: u64 = 20;
const CHARS_PER_TOKEN: u64 = 4;

/// Rough prompt size for a screenshot-bearing request: system prompt, one
/// image, the element listing and the message text.
pub fn estimate_tokens(messages: &[ChatMessage], element_count: usize) -> u64 {
    let text_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    SYSTEM_PROMPT_TOKENS
        + IMAGE_TOKENS
        + TOKENS_PER_ELEMENT * element_count as u64
        + text_chars as u64 / CHARS_PER_TOKEN
}

/// Input-token estimate for providers that omit usage.
pub fn estimate_input_tokens(request: &AnalyzeRequest<'_>) -> u64 {
    let estimate = estimate_tokens(request.messages, request.element_count);
    if request.screenshot.is_some() {
        estimate
    } else {
        estimate - IMAGE_TOKENS
    }
}

pub fn estimate_output_tokens(response: &str) -> u64 {
    (response.len() as u64 / CHARS_PER_TOKEN).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
        assert!(ChatMessage::system("s").is_system());
    }

    #[test]
    fn estimate_counts_image_elements_and_text() {
        let messages = vec![ChatMessage::user("x".repeat(400))];
        let image = ImagePayload {
            media_type: "image/png".into(),
            data_base64: String::new(),
            width: 1,
            height: 1,
        };
        let request = AnalyzeRequest {
            messages: &messages,
            screenshot: Some(&image),
            element_count: 10,
        };
        assert_eq!(estimate_input_tokens(&request), 800 + 1_500 + 200 + 100);

        let blind = AnalyzeRequest {
            screenshot: None,
            ..request
        };
        assert_eq!(estimate_input_tokens(&blind), 800 + 200 + 100);
    }

    #[test]
    fn done_success_marks_goal_achieved() {
        let decision = VisionDecision::from_action(
            Action::Done {
                success: true,
                summary: None,
            },
            String::new(),
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            String::new(),
        );
        assert!(decision.goal_achieved);
        assert_eq!(decision.tokens_used, 15);
    }

    #[test]
    fn data_uri_format() {
        let image = ImagePayload {
            media_type: "image/jpeg".into(),
            data_base64: "AAAA".into(),
            width: 2,
            height: 2,
        };
        assert_eq!(image.data_uri(), "data:image/jpeg;base64,AAAA");
    }
}
