//! Provider error taxonomy shared by every vision client.
//!
//! Each variant is tagged retryable or not; [`super::reliable`] retries only
//! the retryable ones. HTTP failures are classified from status code and a
//! few well-known body phrases.

use crate::actions::ParseError;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: invalid API key ({message})")]
    InvalidApiKey { provider: String, message: String },
    #[error("{provider}: rate limited ({message})")]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
        message: String,
    },
    #[error("{provider}: quota exceeded ({message})")]
    QuotaExceeded { provider: String, message: String },
    #[error("{provider}: model unavailable ({message})")]
    ModelUnavailable { provider: String, message: String },
    #[error("{provider}: context too long ({message})")]
    ContextTooLong { provider: String, message: String },
    #[error("could not parse model response: {0}")]
    Parse(#[from] ParseError),
    #[error("{provider}: network error ({message})")]
    Network { provider: String, message: String },
    #[error("unsupported provider '{provider}'")]
    UnsupportedProvider { provider: String },
    #[error("{provider}: API error{} ({message})", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Unknown {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

const CONTEXT_WINDOW_HINTS: [&str; 8] = [
    "exceeds the context window",
    "context window of this model",
    "maximum context length",
    "context length exceeded",
    "context_length_exceeded",
    "too many tokens",
    "prompt is too long",
    "input is too long",
];

const QUOTA_HINTS: [&str; 9] = [
    "insufficient_quota",
    "insufficient quota",
    "insufficient balance",
    "quota exhausted",
    "exceeded your current quota",
    "out of credits",
    "credit balance is too low",
    "billing",
    "plan does not include",
];

const AUTH_HINTS: [&str; 6] = [
    "invalid api key",
    "incorrect api key",
    "invalid x-api-key",
    "authentication",
    "unauthorized",
    "permission denied",
];

fn contains_any(haystack: &str, hints: &[&str]) -> bool {
    hints.iter().any(|hint| haystack.contains(hint))
}

impl ProviderError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::ModelUnavailable { .. } | Self::Network { .. } => true,
            Self::Unknown { status, .. } => status.is_some_and(|s| s >= 500),
            Self::InvalidApiKey { .. }
            | Self::QuotaExceeded { .. }
            | Self::ContextTooLong { .. }
            | Self::Parse(_)
            | Self::UnsupportedProvider { .. } => false,
        }
    }

    /// Stable machine-readable code for events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidApiKey { .. } => "invalid_api_key",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::ContextTooLong { .. } => "context_too_long",
            Self::Parse(_) => "parse_error",
            Self::Network { .. } => "network_error",
            Self::UnsupportedProvider { .. } => "unsupported_provider",
            Self::Unknown { .. } => "unknown",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Classify a non-success HTTP response. `body` should already be
    /// sanitized.
    pub fn from_status(
        provider: &str,
        status: u16,
        retry_after_ms: Option<u64>,
        body: &str,
    ) -> Self {
        let provider = provider.to_string();
        let message = body.to_string();
        let lower = body.to_lowercase();

        if contains_any(&lower, &CONTEXT_WINDOW_HINTS) {
            return Self::ContextTooLong { provider, message };
        }

        match status {
            401 | 403 => Self::InvalidApiKey { provider, message },
            402 => Self::QuotaExceeded { provider, message },
            429 if contains_any(&lower, &QUOTA_HINTS) => Self::QuotaExceeded { provider, message },
            429 => Self::RateLimited {
                provider,
                retry_after_ms: retry_after_ms.or_else(|| parse_retry_after_ms(body)),
                message,
            },
            404 if lower.contains("model") => Self::ModelUnavailable { provider, message },
            413 => Self::ContextTooLong { provider, message },
            408 => Self::Network { provider, message },
            // Anthropic reports overload as 529.
            503 | 529 => Self::ModelUnavailable { provider, message },
            400..=499 if contains_any(&lower, &AUTH_HINTS) => {
                Self::InvalidApiKey { provider, message }
            }
            _ => Self::Unknown {
                provider,
                status: Some(status),
                message,
            },
        }
    }

    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        let message = super::sanitize_api_error(&err.to_string());
        if let Some(status) = err.status() {
            return Self::from_status(provider, status.as_u16(), None, &message);
        }
        if err.is_decode() {
            return Self::Unknown {
                provider: provider.to_string(),
                status: None,
                message: format!("unreadable response body: {message}"),
            };
        }
        Self::Network {
            provider: provider.to_string(),
            message,
        }
    }
}

/// Pull a `retry-after: <seconds>` hint out of an error body.
pub fn parse_retry_after_ms(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    for prefix in ["retry-after:", "retry_after:", "retry after ", "\"retry_after\":"] {
        let Some(pos) = lower.find(prefix) else {
            continue;
        };
        let number: String = lower[pos + prefix.len()..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(secs) = number.parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                return u64::try_from(Duration::from_secs_f64(secs).as_millis()).ok();
            }
        }
    }
    None
}
