use super::error::ProviderError;
use super::registry::ModelSpec;
use super::traits::{AnalyzeRequest, VisionClient, VisionDecision};
use async_trait::async_trait;
use std::time::Duration;

/// Hard ceiling on a single backoff interval.
const MAX_BACKOFF_MS: u64 = 10_000;
/// Ceiling applied to provider-supplied Retry-After hints.
const MAX_RETRY_AFTER_MS: u64 = 30_000;

/// Retry wrapper around a concrete client.
///
/// Attempts `max_retries + 1` calls in total. Retryable failures sleep
/// `base × 2^attempt` (capped) before the next attempt; a rate limit that
/// carries a Retry-After hint waits at least that long. Non-retryable
/// failures are returned immediately.
pub struct ReliableVisionClient {
    inner: Box<dyn VisionClient>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl ReliableVisionClient {
    pub fn new(inner: Box<dyn VisionClient>, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms,
        }
    }

    fn compute_backoff(&self, attempt: u32, err: &ProviderError) -> u64 {
        let exponential = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(MAX_BACKOFF_MS);
        match err.retry_after() {
            Some(hint) => {
                let hint = u64::try_from(hint.as_millis()).unwrap_or(MAX_RETRY_AFTER_MS);
                hint.min(MAX_RETRY_AFTER_MS).max(exponential)
            }
            None => exponential,
        }
    }
}

#[async_trait]
impl VisionClient for ReliableVisionClient {
    async fn analyze(&self, request: &AnalyzeRequest<'_>) -> Result<VisionDecision, ProviderError> {
        let model = self.inner.model_spec().id.clone();
        let mut attempt = 0u32;
        loop {
            match self.inner.analyze(request).await {
                Ok(decision) => {
                    if attempt > 0 {
                        tracing::info!(model = %model, attempt, "Provider recovered after retry");
                    }
                    return Ok(decision);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        tracing::warn!(
                            model = %model,
                            attempt,
                            code = err.code(),
                            error = %err,
                            "Non-retryable provider error"
                        );
                        return Err(err);
                    }
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            model = %model,
                            attempts = attempt + 1,
                            code = err.code(),
                            error = %err,
                            "Provider retries exhausted"
                        );
                        return Err(err);
                    }

                    let wait = self.compute_backoff(attempt, &err);
                    tracing::warn!(
                        model = %model,
                        attempt,
                        backoff_ms = wait,
                        code = err.code(),
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn model_spec(&self) -> &ModelSpec {
        self.inner.model_spec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::providers::mock::MockVisionClient;
    use crate::providers::traits::ChatMessage;

    fn server_error() -> ProviderError {
        ProviderError::Unknown {
            provider: "mock".into(),
            status: Some(500),
            message: "boom".into(),
        }
    }

    fn request(messages: &[ChatMessage]) -> AnalyzeRequest<'_> {
        AnalyzeRequest {
            messages,
            screenshot: None,
            element_count: 0,
        }
    }

    fn wrap(mock: &std::sync::Arc<MockVisionClient>, retries: u32) -> ReliableVisionClient {
        ReliableVisionClient::new(Box::new(mock.clone()), retries, 1)
    }

    #[tokio::test]
    async fn retries_retryable_then_succeeds() {
        let mock = std::sync::Arc::new(MockVisionClient::new());
        mock.push_error(server_error());
        mock.push_action(Action::wait_ms(100));

        let client = wrap(&mock, 2);
        let messages = vec![ChatMessage::user("go")];
        let decision = client.analyze(&request(&messages)).await.unwrap();
        assert_eq!(decision.action, Action::wait_ms(100));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let mock = std::sync::Arc::new(MockVisionClient::new());
        mock.push_error(ProviderError::InvalidApiKey {
            provider: "mock".into(),
            message: "nope".into(),
        });

        let client = wrap(&mock, 5);
        let messages = vec![ChatMessage::user("go")];
        let err = client.analyze(&request(&messages)).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidApiKey { .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let mock = std::sync::Arc::new(MockVisionClient::new());
        for _ in 0..4 {
            mock.push_error(server_error());
        }

        let client = wrap(&mock, 2);
        let messages = vec![ChatMessage::user("go")];
        assert!(client.analyze(&request(&messages)).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let client = ReliableVisionClient::new(Box::new(MockVisionClient::new()), 3, 500);
        let err = server_error();
        assert_eq!(client.compute_backoff(0, &err), 500);
        assert_eq!(client.compute_backoff(1, &err), 1_000);
        assert_eq!(client.compute_backoff(2, &err), 2_000);
        assert_eq!(client.compute_backoff(10, &err), MAX_BACKOFF_MS);
    }

    #[test]
    fn backoff_honours_retry_after() {
        let client = ReliableVisionClient::new(Box::new(MockVisionClient::new()), 3, 500);
        let limited = ProviderError::RateLimited {
            provider: "mock".into(),
            retry_after_ms: Some(3_000),
            message: String::new(),
        };
        assert_eq!(client.compute_backoff(0, &limited), 3_000);

        let huge = ProviderError::RateLimited {
            provider: "mock".into(),
            retry_after_ms: Some(120_000),
            message: String::new(),
        };
        assert_eq!(client.compute_backoff(0, &huge), MAX_RETRY_AFTER_MS);
    }
}
