//! Anthropic Messages API client.
//!
//! Models flagged `supports_computer_use` get the native `computer` tool and
//! their `tool_use` blocks map straight onto [`Action`]. Other models answer
//! in text and go through the action parser.

use super::error::ProviderError;
use super::registry::ModelSpec;
use super::traits::{AnalyzeRequest, ChatMessage, ImagePayload, TokenUsage, VisionClient, VisionDecision};
use super::ClientOptions;
use crate::actions::{Action, RawAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const COMPUTER_USE_BETA: &str = "computer-use-2025-01-24";
const COMPUTER_TOOL_TYPE: &str = "computer_20250124";
const DEFAULT_DISPLAY: (u32, u32) = (1280, 800);
/// Pixels per scroll "click" reported by the computer tool.
const SCROLL_CLICK_PX: u32 = 100;
const FALLBACK_WAIT_MS: u64 = 1_000;
const SCREENSHOT_WAIT_MS: u64 = 500;

const COMPLETION_HINTS: [&str; 8] = [
    "task is complete",
    "task complete",
    "task has been completed",
    "goal achieved",
    "goal has been achieved",
    "successfully completed",
    "i have completed",
    "is now complete",
];

pub struct AnthropicVisionClient {
    spec: ModelSpec,
    base_url: String,
    api_key: String,
    temperature: f64,
    max_tokens: u32,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct NativeChatRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    messages: Vec<NativeMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ComputerToolSpec>>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    cache_type: &'static str,
}

#[derive(Debug, Serialize)]
struct NativeMessage {
    role: String,
    content: Vec<NativeContentOut>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeContentOut {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct ComputerToolSpec {
    #[serde(rename = "type")]
    tool_type: &'static str,
    name: &'static str,
    display_width_px: u32,
    display_height_px: u32,
}

#[derive(Debug, Deserialize)]
struct NativeChatResponse {
    #[serde(default)]
    content: Vec<NativeContentIn>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct NativeContentIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl AnthropicVisionClient {
    pub fn new(spec: ModelSpec, options: &ClientOptions, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: options.api_key.clone(),
            temperature: options.temperature,
            max_tokens: options.max_output_tokens,
            http: super::http_client(options.request_timeout_secs),
            spec,
        }
    }

    fn computer_use(&self) -> bool {
        self.spec.supports_computer_use
    }

    /// System messages become the cached system prompt; consecutive turns of
    /// the same role are merged because the API requires alternation.
    fn convert_messages(
        messages: &[ChatMessage],
        screenshot: Option<&ImagePayload>,
    ) -> (Option<Vec<SystemBlock>>, Vec<NativeMessage>) {
        let system_text = messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = (!system_text.is_empty()).then(|| {
            vec![SystemBlock {
                block_type: "text",
                text: system_text,
                cache_control: Some(CacheControl {
                    cache_type: "ephemeral",
                }),
            }]
        });

        let mut native: Vec<NativeMessage> = Vec::new();
        for m in messages.iter().filter(|m| !m.is_system()) {
            let block = NativeContentOut::Text {
                text: m.content.clone(),
            };
            match native.last_mut() {
                Some(last) if last.role == m.role => last.content.push(block),
                _ => native.push(NativeMessage {
                    role: m.role.clone(),
                    content: vec![block],
                }),
            }
        }

        if let Some(image) = screenshot {
            if let Some(last_user) = native.iter_mut().rev().find(|m| m.role == "user") {
                last_user.content.push(NativeContentOut::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type: image.media_type.clone(),
                        data: image.data_base64.clone(),
                    },
                });
            }
        }

        (system, native)
    }

    fn computer_tool(screenshot: Option<&ImagePayload>) -> ComputerToolSpec {
        let (width, height) = screenshot
            .filter(|s| s.width > 0 && s.height > 0)
            .map_or(DEFAULT_DISPLAY, |s| (s.width, s.height));
        ComputerToolSpec {
            tool_type: COMPUTER_TOOL_TYPE,
            name: "computer",
            display_width_px: width,
            display_height_px: height,
        }
    }

    fn decision_from_response(
        &self,
        response: NativeChatResponse,
        request: &AnalyzeRequest<'_>,
    ) -> Result<VisionDecision, ProviderError> {
        let text = response
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let reported = response.usage.and_then(|u| match (u.input_tokens, u.output_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
            }),
        });

        if !self.computer_use() {
            return super::text_decision(&text, reported, request);
        }

        let tool_input = response
            .content
            .iter()
            .find(|b| b.kind == "tool_use" && b.name.as_deref() == Some("computer"))
            .and_then(|b| b.input.clone());
        let raw_response = match &tool_input {
            Some(input) => format!("{text}\n{input}").trim().to_string(),
            None => text.clone(),
        };
        let usage = reported.unwrap_or_else(|| TokenUsage {
            input_tokens: super::traits::estimate_input_tokens(request),
            output_tokens: super::traits::estimate_output_tokens(&raw_response),
        });

        let action = match tool_input.as_ref().and_then(map_computer_call) {
            Some(action) => action,
            None => {
                tracing::debug!(
                    model = %self.spec.id,
                    had_tool_call = tool_input.is_some(),
                    "No mappable computer call, inferring from text"
                );
                infer_from_text(&text)
            }
        };
        Ok(VisionDecision::from_action(
            action,
            text.trim().to_string(),
            usage,
            raw_response,
        ))
    }
}

/// Map a `computer` tool invocation onto the action union.
pub fn map_computer_call(input: &Value) -> Option<Action> {
    let name = input.get("action")?.as_str()?;
    let coordinate = input.get("coordinate").cloned();
    let mut raw = serde_json::Map::new();
    if let Some(coordinate) = coordinate {
        raw.insert("coordinate".into(), coordinate);
    }

    match name {
        "left_click" | "right_click" | "double_click" | "middle_click" | "triple_click" => {
            let button = match name {
                "right_click" => "right",
                "double_click" | "triple_click" => "double",
                _ => "left",
            };
            raw.insert("type".into(), "click".into());
            raw.insert("button".into(), button.into());
        }
        "type" => {
            raw.insert("type".into(), "type".into());
            raw.insert("text".into(), input.get("text")?.clone());
        }
        "key" => {
            raw.insert("type".into(), "keypress".into());
            raw.insert("key".into(), input.get("text")?.clone());
        }
        "scroll" => {
            raw.insert("type".into(), "scroll".into());
            raw.insert("direction".into(), input.get("scroll_direction")?.clone());
            raw.remove("coordinate");
            if let Some(clicks) = input.get("scroll_amount").and_then(Value::as_u64) {
                let clicks = u32::try_from(clicks).unwrap_or(u32::MAX / SCROLL_CLICK_PX);
                raw.insert(
                    "amount".into(),
                    clicks.saturating_mul(SCROLL_CLICK_PX).into(),
                );
            }
        }
        "mouse_move" => {
            raw.insert("type".into(), "hover".into());
        }
        "wait" => {
            let secs = input.get("duration").and_then(Value::as_f64).unwrap_or(1.0);
            return Some(Action::wait_ms((secs.max(0.0) * 1_000.0).round() as u64));
        }
        "screenshot" | "cursor_position" => return Some(Action::wait_ms(SCREENSHOT_WAIT_MS)),
        _ => return None,
    }

    let raw: RawAction = serde_json::from_value(Value::Object(raw)).ok()?;
    Action::try_from(raw).ok()
}

/// No usable tool call: either the model thinks it is finished or we give
/// the page a moment and ask again.
fn infer_from_text(text: &str) -> Action {
    let lower = text.to_lowercase();
    if COMPLETION_HINTS.iter().any(|hint| lower.contains(hint)) {
        let summary = crate::util::truncate_with_ellipsis(text.trim(), 300);
        return Action::Done {
            success: true,
            summary: (!summary.is_empty()).then_some(summary),
        };
    }
    Action::wait_ms(FALLBACK_WAIT_MS)
}

#[async_trait]
impl VisionClient for AnthropicVisionClient {
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::InvalidApiKey {
                provider: "anthropic".into(),
                message: "API key not set".into(),
            });
        }

        let (system, messages) = Self::convert_messages(request.messages, request.screenshot);
        let body = NativeChatRequest {
            model: self.spec.api_model.clone(),
            max_tokens: self.max_tokens,
            system,
            messages,
            temperature: self.temperature,
            tools: self
                .computer_use()
                .then(|| vec![Self::computer_tool(request.screenshot)]),
        };

        let mut builder = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        if self.computer_use() {
            builder = builder.header("anthropic-beta", COMPUTER_USE_BETA);
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("anthropic", &e))?;
        if !response.status().is_success() {
            return Err(super::api_error("anthropic", response).await);
        }

        let native: NativeChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::from_transport("anthropic", &e))?;
        self.decision_from_response(native, request)
    }

    fn model_spec(&self) -> &ModelSpec {
        &self.spec
    }
}
