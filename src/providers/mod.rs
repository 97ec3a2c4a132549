//! Vision model clients.
//!
//! Every client implements [`VisionClient`] from [`traits`]. The factory
//! [`create_client`] picks a concrete type from the registry entry's
//! provider field and wraps it in [`ReliableVisionClient`] for retries:
//!
//! - `openai`, `openrouter`, `gemini` → [`compatible::CompatibleVisionClient`]
//!   (chat-completions wire format, text action parsing)
//! - `anthropic` → [`anthropic::AnthropicVisionClient`] (native computer-use
//!   tool when the model supports it, text parsing otherwise)
//!
//! Anything else is rejected with [`ProviderError::UnsupportedProvider`].

pub mod anthropic;
pub mod compatible;
pub mod confidence;
pub mod error;
pub mod mock;
pub mod registry;
pub mod reliable;
pub mod traits;

pub use error::ProviderError;
pub use mock::MockVisionClient;
pub use registry::{ModelRegistry, ModelSpec, ProviderKind};
pub use reliable::ReliableVisionClient;
pub use traits::{
    AnalyzeRequest, ChatMessage, ImagePayload, TokenUsage, VisionClient, VisionDecision,
};

use std::fmt;
use std::time::Duration;

const MAX_API_ERROR_CHARS: usize = 200;

/// Per-client settings that do not come from the registry entry.
#[derive(Clone)]
pub struct ClientOptions {
    pub api_key: String,
    /// Overrides both the registry entry and the provider default.
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_output_tokens: u32,
    pub temperature: f64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            request_timeout_secs: 60,
            max_retries: 2,
            base_backoff_ms: 1_000,
            max_output_tokens: 1_024,
            temperature: 0.1,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("base_backoff_ms", &self.base_backoff_ms)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Build the client for `spec`, wrapped with retries.
pub fn create_client(
    spec: &ModelSpec,
    options: &ClientOptions,
) -> Result<Box<dyn VisionClient>, ProviderError> {
    let base_url = options.base_url.clone().or_else(|| spec.base_url.clone());
    let inner: Box<dyn VisionClient> = match &spec.provider {
        ProviderKind::OpenAi | ProviderKind::OpenRouter | ProviderKind::Gemini => Box::new(
            compatible::CompatibleVisionClient::new(spec.clone(), options, base_url.as_deref()),
        ),
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicVisionClient::new(
            spec.clone(),
            options,
            base_url.as_deref(),
        )),
        ProviderKind::Other(name) => {
            return Err(ProviderError::UnsupportedProvider {
                provider: name.clone(),
            })
        }
    };

    tracing::debug!(
        model = %spec.id,
        provider = %spec.provider,
        computer_use = spec.supports_computer_use,
        "Created vision client"
    );
    Ok(Box::new(ReliableVisionClient::new(
        inner,
        options.max_retries,
        options.base_backoff_ms,
    )))
}

/// Turn a text completion into a decision via the action parser, estimating
/// usage when the provider did not report it.
pub(crate) fn text_decision(
    text: &str,
    usage: Option<TokenUsage>,
    request: &AnalyzeRequest<'_>,
) -> Result<VisionDecision, ProviderError> {
    let (action, reasoning) = crate::actions::parse_with_reasoning(text)?;
    let usage = usage.unwrap_or_else(|| TokenUsage {
        input_tokens: traits::estimate_input_tokens(request),
        output_tokens: traits::estimate_output_tokens(text),
    });
    Ok(VisionDecision::from_action(
        action,
        reasoning,
        usage,
        text.to_string(),
    ))
}

pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Redact key-like tokens (`sk-…`, `AIza…`, bearer tokens, `"api_key":"…"`)
/// from provider error text.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [(&str, usize); 9] = [
        ("sk-ant-", 1),
        ("sk-", 1),
        ("AIza", 1),
        ("\"api_key\":\"", 8),
        ("\"x-api-key\":\"", 8),
        ("api_key=", 8),
        ("key=", 8),
        ("Bearer ", 16),
        ("bearer ", 16),
    ];

    let mut scrubbed = input.to_string();
    for (prefix, min_len) in PREFIXES {
        let mut search_from = 0;
        while let Some(rel) = scrubbed[search_from..].find(prefix) {
            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            // A bare prefix ("sk-" in prose) is not a secret.
            if end.saturating_sub(content_start) < min_len {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }
    scrubbed
}

/// Scrub secrets and cap length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);
    crate::util::truncate_with_ellipsis(&scrubbed, MAX_API_ERROR_CHARS)
}

/// Classify a failed HTTP response into the shared taxonomy.
pub(crate) async fn api_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| u64::try_from(Duration::from_secs_f64(secs).as_millis()).ok());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    ProviderError::from_status(provider, status, retry_after_ms, &sanitize_api_error(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_openai_style_keys() {
        let out = scrub_secret_patterns("Incorrect API key provided: sk-proj-abc123XYZ.");
        assert!(!out.contains("abc123"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn leaves_bare_prefix_alone() {
        assert_eq!(scrub_secret_patterns("use sk- keys"), "use sk- keys");
    }

    #[test]
    fn sanitize_truncates() {
        let long = "x".repeat(500);
        let out = sanitize_api_error(&long);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= MAX_API_ERROR_CHARS + 3);
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let mut spec = ModelRegistry::builtin().get("gpt-4o").unwrap().clone();
        spec.provider = ProviderKind::Other("bedrock".into());
        let err = create_client(&spec, &ClientOptions::default()).err().unwrap();
        assert!(matches!(err, ProviderError::UnsupportedProvider { ref provider } if provider == "bedrock"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn factory_builds_known_providers() {
        let registry = ModelRegistry::builtin();
        for id in ["gpt-4o", "claude-sonnet-4", "gemini-2.0-flash", "qwen2.5-vl-72b"] {
            let spec = registry.get(id).unwrap();
            let client = create_client(spec, &ClientOptions::default()).unwrap();
            assert_eq!(client.model_spec().id, id);
        }
    }

    #[test]
    fn options_debug_hides_key() {
        let options = ClientOptions {
            api_key: "sk-secret".into(),
            ..ClientOptions::default()
        };
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
