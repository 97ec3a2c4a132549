//! Chat-completions client for OpenAI and the providers that speak its wire
//! format (OpenRouter, Gemini's OpenAI endpoint). The model answers in text
//! and the action parser does the rest.

use super::error::ProviderError;
use super::registry::{ModelSpec, ProviderKind};
use super::traits::{AnalyzeRequest, ChatMessage, ImagePayload, TokenUsage, VisionClient, VisionDecision};
use super::ClientOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub struct CompatibleVisionClient {
    spec: ModelSpec,
    base_url: String,
    api_key: String,
    temperature: f64,
    max_tokens: u32,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning models may put their whole answer here.
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ResponseMessage {
    fn effective_content(&self) -> String {
        match &self.content {
            Some(c) if !c.trim().is_empty() => c.clone(),
            _ => self.reasoning_content.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

impl CompatibleVisionClient {
    pub fn new(spec: ModelSpec, options: &ClientOptions, base_url: Option<&str>) -> Self {
        let default_base = match spec.provider {
            ProviderKind::OpenRouter => OPENROUTER_BASE_URL,
            ProviderKind::Gemini => GEMINI_BASE_URL,
            _ => OPENAI_BASE_URL,
        };
        Self {
            base_url: base_url
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            api_key: options.api_key.clone(),
            temperature: options.temperature,
            max_tokens: options.max_output_tokens,
            http: super::http_client(options.request_timeout_secs),
            spec,
        }
    }

    fn provider_name(&self) -> &str {
        self.spec.provider.as_str()
    }

    /// Attach the screenshot to the last user message; all other messages
    /// stay plain text.
    fn convert_messages(messages: &[ChatMessage], screenshot: Option<&ImagePayload>) -> Vec<Message> {
        let last_user = messages.iter().rposition(|m| m.role == "user");
        messages
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                let content = match (screenshot, Some(idx) == last_user) {
                    (Some(image), true) => MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: m.content.clone(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: image.data_uri(),
                                detail: "high",
                            },
                        },
                    ]),
                    _ => MessageContent::Text(m.content.clone()),
                };
                Message {
                    role: m.role.clone(),
                    content,
                }
            })
            .collect()
    }
}

#[async_trait]
impl VisionClient for CompatibleVisionClient {
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::InvalidApiKey {
                provider: self.provider_name().to_string(),
                message: "API key not set".into(),
            });
        }

        let body = ChatRequest {
            model: self.spec.api_model.clone(),
            messages: Self::convert_messages(request.messages, request.screenshot),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(self.provider_name(), &e))?;

        if !response.status().is_success() {
            return Err(super::api_error(self.provider_name(), response).await);
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_transport(self.provider_name(), &e))?;

        let usage = chat.usage.and_then(|u| match (u.prompt_tokens, u.completion_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
            }),
        });
        let text = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.effective_content())
            .ok_or_else(|| ProviderError::Unknown {
                provider: self.provider_name().to_string(),
                status: None,
                message: "response contained no choices".into(),
            })?;

        tracing::debug!(
            model = %self.spec.id,
            chars = text.len(),
            "Received text decision"
        );
        super::text_decision(&text, usage, request)
    }

    fn model_spec(&self) -> &ModelSpec {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ModelRegistry;

    fn spec(id: &str) -> ModelSpec {
        ModelRegistry::builtin().get(id).unwrap().clone()
    }

    #[test]
    fn picks_default_base_url_per_provider() {
        let options = ClientOptions::default();
        let openai = CompatibleVisionClient::new(spec("gpt-4o"), &options, None);
        assert_eq!(openai.base_url, OPENAI_BASE_URL);
        let gemini = CompatibleVisionClient::new(spec("gemini-2.0-flash"), &options, None);
        assert_eq!(gemini.base_url, GEMINI_BASE_URL);
        let custom =
            CompatibleVisionClient::new(spec("gpt-4o"), &options, Some("http://localhost:9/v1/"));
        assert_eq!(custom.base_url, "http://localhost:9/v1");
    }

    #[test]
    fn image_goes_on_last_user_message_only() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("goal"),
            ChatMessage::assistant("ACTION: wait(100)"),
            ChatMessage::user("state"),
        ];
        let image = ImagePayload {
            media_type: "image/png".into(),
            data_base64: "AAAA".into(),
            width: 1,
            height: 1,
        };
        let converted = CompatibleVisionClient::convert_messages(&messages, Some(&image));
        let json = serde_json::to_value(&converted).unwrap();
        assert_eq!(json[1]["content"], "goal");
        assert_eq!(json[3]["content"][0]["type"], "text");
        assert_eq!(json[3]["content"][1]["type"], "image_url");
        assert_eq!(
            json[3]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn reasoning_content_fallback() {
        let msg: ResponseMessage =
            serde_json::from_str(r#"{"content": "", "reasoning_content": "ACTION: click(2)"}"#)
                .unwrap();
        assert_eq!(msg.effective_content(), "ACTION: click(2)");
    }

    #[tokio::test]
    async fn missing_key_is_invalid_api_key() {
        let client =
            CompatibleVisionClient::new(spec("gpt-4o"), &ClientOptions::default(), None);
        let messages = vec![ChatMessage::user("go")];
        let err = client
            .analyze(&AnalyzeRequest {
                messages: &messages,
                screenshot: None,
                element_count: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidApiKey { .. }));
    }
}
