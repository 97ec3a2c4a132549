//! Model registry: identifier → provider, API name, cost and capabilities.

use super::traits::TokenUsage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider family. Unknown names survive deserialization so the factory can
/// reject them with a typed error instead of failing config parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    OpenRouter,
    Gemini,
    Other(String),
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Gemini => "gemini",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for ProviderKind {
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Self::Anthropic,
            "openai" => Self::OpenAi,
            "openrouter" => Self::OpenRouter,
            "gemini" | "google" => Self::Gemini,
            _ => Self::Other(name),
        }
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier used in requests and config.
    pub id: String,
    /// Name sent to the provider API.
    pub api_model: String,
    pub provider: ProviderKind,
    /// USD per million input tokens.
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    pub output_cost_per_mtok: f64,
    pub max_context_tokens: u32,
    /// Native pointer/keyboard tool instead of text action parsing.
    #[serde(default)]
    pub supports_computer_use: bool,
    #[serde(default = "default_true")]
    pub supports_element_labels: bool,
    /// Endpoint override, e.g. a proxy or a self-hosted gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ModelSpec {
    pub fn cost_usd(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_cost_per_mtok
            + usage.output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

fn builtin(
    id: &str,
    api_model: &str,
    provider: ProviderKind,
    input_cost: f64,
    output_cost: f64,
    max_context_tokens: u32,
    computer_use: bool,
) -> ModelSpec {
    ModelSpec {
        id: id.to_string(),
        api_model: api_model.to_string(),
        provider,
        input_cost_per_mtok: input_cost,
        output_cost_per_mtok: output_cost,
        max_context_tokens,
        supports_computer_use: computer_use,
        supports_element_labels: true,
        base_url: None,
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        use ProviderKind::{Anthropic, Gemini, OpenAi, OpenRouter};
        Self {
            models: vec![
                builtin("claude-sonnet-4", "claude-sonnet-4-20250514", Anthropic, 3.0, 15.0, 200_000, true),
                builtin("claude-3-7-sonnet", "claude-3-7-sonnet-20250219", Anthropic, 3.0, 15.0, 200_000, true),
                builtin("claude-3-5-haiku", "claude-3-5-haiku-20241022", Anthropic, 0.8, 4.0, 200_000, false),
                builtin("gpt-4o", "gpt-4o", OpenAi, 2.5, 10.0, 128_000, false),
                builtin("gpt-4o-mini", "gpt-4o-mini", OpenAi, 0.15, 0.6, 128_000, false),
                builtin("gpt-4.1", "gpt-4.1", OpenAi, 2.0, 8.0, 1_000_000, false),
                builtin("gemini-2.0-flash", "gemini-2.0-flash", Gemini, 0.1, 0.4, 1_000_000, false),
                builtin("gemini-2.5-pro", "gemini-2.5-pro", Gemini, 1.25, 10.0, 1_000_000, false),
                builtin("qwen2.5-vl-72b", "qwen/qwen2.5-vl-72b-instruct", OpenRouter, 0.25, 0.75, 32_000, false),
            ],
        }
    }

    /// Empty registry, for tests and fully custom setups.
    pub fn empty() -> Self {
        Self { models: Vec::new() }
    }

    /// Add or replace an entry by id.
    pub fn register(&mut self, spec: ModelSpec) {
        match self
            .models
            .iter_mut()
            .find(|m| m.id.eq_ignore_ascii_case(&spec.id))
        {
            Some(existing) => *existing = spec,
            None => self.models.push(spec),
        }
    }

    pub fn with_models(mut self, extra: impl IntoIterator<Item = ModelSpec>) -> Self {
        for spec in extra {
            self.register(spec);
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        let id = id.trim();
        self.models.iter().find(|m| m.id.eq_ignore_ascii_case(id))
    }

    pub fn list(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn estimate_cost(&self, id: &str, usage: TokenUsage) -> Option<f64> {
        self.get(id).map(|spec| spec.cost_usd(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_is_case_insensitive() {
        let registry = ModelRegistry::builtin();
        let spec = registry.get("GPT-4o").unwrap();
        assert_eq!(spec.provider, ProviderKind::OpenAi);
        assert!(!spec.supports_computer_use);
        assert!(registry.get("claude-sonnet-4").unwrap().supports_computer_use);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn register_replaces_existing_id() {
        let mut registry = ModelRegistry::builtin();
        let before = registry.list().len();
        let mut custom = registry.get("gpt-4o").unwrap().clone();
        custom.base_url = Some("http://localhost:8080/v1".into());
        registry.register(custom);
        assert_eq!(registry.list().len(), before);
        assert_eq!(
            registry.get("gpt-4o").unwrap().base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );
    }

    #[test]
    fn cost_uses_per_million_pricing() {
        let registry = ModelRegistry::builtin();
        let cost = registry
            .estimate_cost(
                "gpt-4o",
                TokenUsage {
                    input_tokens: 1_000_000,
                    output_tokens: 100_000,
                },
            )
            .unwrap();
        assert!((cost - 3.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_provider_survives_deserialization() {
        let spec: ModelSpec = toml::from_str(
            r#"
            id = "titan"
            api_model = "amazon.titan"
            provider = "bedrock"
            input_cost_per_mtok = 1.0
            output_cost_per_mtok = 2.0
            max_context_tokens = 8000
            "#,
        )
        .unwrap();
        assert_eq!(spec.provider, ProviderKind::Other("bedrock".into()));
        assert!(spec.supports_element_labels);
    }
}
