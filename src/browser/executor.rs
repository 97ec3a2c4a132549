//! Maps typed actions onto [`BrowserPage`] primitives.
//!
//! `execute` never returns an error: every primitive failure is folded into
//! an [`ExecutionOutcome`] so the agent loop can feed it back to the model.

use super::{bounded, BrowserPage, ElementLabel, PageTarget, ScrollPosition};
use crate::actions::{Action, ScrollDirection, Target, DEFAULT_WAIT_MS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub visibility_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    /// Upper bound on any other single page primitive.
    pub action_timeout_ms: u64,
    /// Share of the viewport a scroll without an amount covers.
    pub scroll_fraction: f64,
    pub max_wait_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 5_000,
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 10_000,
            scroll_fraction: 0.8,
            max_wait_ms: 30_000,
        }
    }
}

/// Page state around one execution, consumed by the loop detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_before: Option<ScrollPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_after: Option<ScrollPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_before: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_after: Option<u64>,
}

impl EffectContext {
    /// `None` when either side is unknown.
    pub fn url_changed(&self) -> Option<bool> {
        Some(self.url_before.as_ref()? != self.url_after.as_ref()?)
    }

    pub fn scroll_changed(&self) -> Option<bool> {
        let (before, after) = (self.scroll_before?, self.scroll_after?);
        Some((before.x - after.x).abs() >= 1.0 || (before.y - after.y).abs() >= 1.0)
    }

    pub fn signature_changed(&self) -> Option<bool> {
        Some(self.signature_before? != self.signature_after?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_url: Option<String>,
    pub duration_ms: u64,
    pub effect: EffectContext,
}

#[derive(Debug, Clone, Default)]
pub struct ActionExecutor {
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn limit(&self) -> Duration {
        Duration::from_millis(self.config.action_timeout_ms)
    }

    /// Visibility polls get their own timeout plus the primitive bound, so a
    /// stalled transport still returns.
    async fn wait_visible(
        &self,
        page: &dyn BrowserPage,
        selector: &str,
        timeout: Duration,
    ) -> Result<()> {
        bounded(
            timeout + self.limit(),
            "visibility wait",
            page.wait_for_visible(selector, timeout),
        )
        .await
    }

    pub async fn execute(
        &self,
        page: &dyn BrowserPage,
        action: &Action,
        labels: &[ElementLabel],
    ) -> ExecutionOutcome {
        self.execute_scaled(page, action, labels, 1.0).await
    }

    /// Like [`execute`](Self::execute), for coordinates given in a screenshot
    /// that was captured at `image_scale` times the page size.
    pub async fn execute_scaled(
        &self,
        page: &dyn BrowserPage,
        action: &Action,
        labels: &[ElementLabel],
        image_scale: f64,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let is_scroll = matches!(action, Action::Scroll { .. });

        let limit = self.limit();
        let mut effect = EffectContext {
            url_before: bounded(limit, "URL read", page.current_url()).await.ok(),
            signature_before: bounded(limit, "signature read", page.content_signature())
                .await
                .ok(),
            ..EffectContext::default()
        };
        if is_scroll {
            effect.scroll_before = bounded(limit, "scroll read", page.scroll_position())
                .await
                .ok();
        }

        let result = self.dispatch(page, action, labels, image_scale).await;

        effect.url_after = bounded(limit, "URL read", page.current_url()).await.ok();
        effect.signature_after = bounded(limit, "signature read", page.content_signature())
            .await
            .ok();
        if is_scroll {
            effect.scroll_after = bounded(limit, "scroll read", page.scroll_position())
                .await
                .ok();
        }

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(action = %action.kind(), error = %format!("{err:#}"), "Action failed");
                Some(format!("{err:#}"))
            }
        };
        ExecutionOutcome {
            success: error.is_none(),
            error,
            new_url: effect.url_after.clone(),
            duration_ms: crate::util::elapsed_ms(started),
            effect,
        }
    }

    async fn dispatch(
        &self,
        page: &dyn BrowserPage,
        action: &Action,
        labels: &[ElementLabel],
        image_scale: f64,
    ) -> Result<()> {
        let limit = self.limit();
        match action {
            Action::Click { target, button } => {
                let target = self.ready_target(page, *target, labels, image_scale).await?;
                bounded(limit, "click", page.click(&target, *button)).await
            }
            Action::Type {
                target,
                text,
                clear_first,
            } => {
                let target = match target {
                    Some(target) => Some(self.ready_target(page, *target, labels, image_scale).await?),
                    None => None,
                };
                bounded(limit, "typing", page.type_text(target.as_ref(), text, *clear_first)).await
            }
            Action::Scroll { direction, amount } => {
                let distance = match amount {
                    Some(amount) => i64::from(*amount),
                    None => self.default_scroll_distance(page, *direction).await?,
                };
                let (dx, dy) = match direction {
                    ScrollDirection::Up => (0, -distance),
                    ScrollDirection::Down => (0, distance),
                    ScrollDirection::Left => (-distance, 0),
                    ScrollDirection::Right => (distance, 0),
                };
                bounded(limit, "scroll", page.scroll_by(dx, dy)).await
            }
            Action::Navigate { url } => {
                let timeout = Duration::from_millis(self.config.navigation_timeout_ms);
                tokio::time::timeout(timeout, page.navigate(url, timeout))
                    .await
                    .with_context(|| {
                        format!(
                            "navigation to {url} timed out after {}ms",
                            self.config.navigation_timeout_ms
                        )
                    })?
            }
            Action::Hover { target } => {
                let target = self.ready_target(page, *target, labels, image_scale).await?;
                bounded(limit, "hover", page.hover(&target)).await
            }
            Action::Select { target, value } => {
                let target = self.ready_target(page, *target, labels, image_scale).await?;
                bounded(limit, "select", page.select_option(&target, value)).await
            }
            Action::Wait {
                duration_ms,
                selector,
            } => {
                match selector {
                    Some(selector) => {
                        let ms = duration_ms
                            .unwrap_or(self.config.visibility_timeout_ms)
                            .min(self.config.max_wait_ms);
                        self.wait_visible(page, selector, Duration::from_millis(ms))
                            .await
                            .with_context(|| format!("'{selector}' did not become visible"))
                    }
                    None => {
                        let ms = duration_ms
                            .unwrap_or(DEFAULT_WAIT_MS)
                            .min(self.config.max_wait_ms);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(())
                    }
                }
            }
            Action::Keypress { key, modifiers } => {
                bounded(limit, "key press", page.press_key(key, modifiers)).await
            }
            // Terminal and pause actions are handled by the agent loop.
            Action::Done { .. } | Action::RequestHuman { .. } => Ok(()),
        }
    }

    /// Resolve and, for element targets, wait until visible.
    async fn ready_target(
        &self,
        page: &dyn BrowserPage,
        target: Target,
        labels: &[ElementLabel],
        image_scale: f64,
    ) -> Result<PageTarget> {
        let resolved = resolve_target(target, labels, image_scale);
        if let PageTarget::Selector(selector) = &resolved {
            self.wait_visible(
                page,
                selector,
                Duration::from_millis(self.config.visibility_timeout_ms),
            )
            .await
            .with_context(|| match target {
                Target::Element(id) => format!("element {id} ({selector}) is not visible"),
                Target::Point { .. } => format!("'{selector}' is not visible"),
            })?;
        }
        Ok(resolved)
    }

    async fn default_scroll_distance(
        &self,
        page: &dyn BrowserPage,
        direction: ScrollDirection,
    ) -> Result<i64> {
        let viewport = bounded(self.limit(), "viewport read", page.viewport())
            .await
            .context("failed to read viewport")?;
        let extent = if direction.is_vertical() {
            viewport.height
        } else {
            viewport.width
        };
        let distance = (f64::from(extent) * self.config.scroll_fraction).round() as i64;
        if distance <= 0 {
            bail!("viewport has no {} extent to scroll", direction.as_str());
        }
        Ok(distance)
    }
}

/// Element ids resolve through the observation's labels, falling back to the
/// synthetic label attribute; points are mapped back from screenshot space.
pub fn resolve_target(target: Target, labels: &[ElementLabel], image_scale: f64) -> PageTarget {
    match target {
        Target::Element(id) => PageTarget::Selector(
            labels
                .iter()
                .find(|label| label.id == id)
                .map_or_else(|| super::label_selector(id), ElementLabel::locator),
        ),
        Target::Point { x, y } => {
            if image_scale > 0.0 && (image_scale - 1.0).abs() > f64::EPSILON {
                PageTarget::Point {
                    x: (f64::from(x) / image_scale).round() as i32,
                    y: (f64::from(y) / image_scale).round() as i32,
                }
            } else {
                PageTarget::Point { x, y }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ClickButton;
    use crate::browser::MockPage;

    fn labels() -> Vec<ElementLabel> {
        vec![
            ElementLabel::new(1, "button").with_selector("#login"),
            ElementLabel::new(2, "input").with_selector(""),
        ]
    }

    #[test]
    fn resolves_labels_and_fallbacks() {
        let labels = labels();
        assert_eq!(
            resolve_target(Target::Element(1), &labels, 1.0),
            PageTarget::Selector("#login".into())
        );
        assert_eq!(
            resolve_target(Target::Element(2), &labels, 1.0),
            PageTarget::Selector("[data-webpilot-label=\"2\"]".into())
        );
        assert_eq!(
            resolve_target(Target::Element(9), &labels, 1.0),
            PageTarget::Selector("[data-webpilot-label=\"9\"]".into())
        );
        assert_eq!(
            resolve_target(Target::Point { x: 100, y: 50 }, &labels, 0.5),
            PageTarget::Point { x: 200, y: 100 }
        );
    }

    #[tokio::test]
    async fn click_waits_for_visibility_then_clicks() {
        let page = MockPage::new("https://example.com").with_elements(labels());
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Click {
                    target: Target::Element(1),
                    button: ClickButton::Left,
                },
                &labels(),
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.new_url.as_deref(), Some("https://example.com"));
        assert_eq!(page.calls(), vec!["click #login left".to_string()]);
    }

    #[tokio::test]
    async fn hidden_element_is_a_structured_failure() {
        let page = MockPage::new("https://example.com");
        page.hide("#login");
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Hover {
                    target: Target::Element(1),
                },
                &labels(),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("element 1"));
        assert!(page.calls().is_empty());
    }

    #[tokio::test]
    async fn scroll_defaults_to_viewport_fraction_and_records_positions() {
        let page = MockPage::new("https://example.com").with_page_height(5_000.0);
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Scroll {
                    direction: ScrollDirection::Down,
                    amount: None,
                },
                &[],
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.effect.scroll_before.unwrap().y, 0.0);
        assert_eq!(outcome.effect.scroll_after.unwrap().y, 640.0);
        assert_eq!(outcome.effect.scroll_changed(), Some(true));
    }

    #[tokio::test]
    async fn scroll_at_bottom_has_no_effect() {
        let page = MockPage::new("https://example.com").with_page_height(800.0);
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Scroll {
                    direction: ScrollDirection::Down,
                    amount: Some(300),
                },
                &[],
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.effect.scroll_changed(), Some(false));
    }

    #[tokio::test]
    async fn navigate_updates_url() {
        let page = MockPage::new("about:blank");
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Navigate {
                    url: "https://example.org/".into(),
                },
                &[],
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.effect.url_changed(), Some(true));
        assert_eq!(outcome.new_url.as_deref(), Some("https://example.org/"));
    }

    #[tokio::test]
    async fn wait_is_clamped() {
        let page = MockPage::new("about:blank");
        let executor = ActionExecutor::new(ExecutorConfig {
            max_wait_ms: 50,
            ..ExecutorConfig::default()
        });
        let outcome = executor.execute(&page, &Action::wait_ms(10_000), &[]).await;
        assert!(outcome.success);
        assert!(outcome.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn stalled_click_times_out_as_a_failure() {
        let page = MockPage::new("https://example.com");
        page.stall("click");
        let executor = ActionExecutor::new(ExecutorConfig {
            action_timeout_ms: 50,
            ..ExecutorConfig::default()
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(
                &page,
                &Action::Click {
                    target: Target::Element(1),
                    button: ClickButton::Left,
                },
                &labels(),
            ),
        )
        .await
        .expect("executor must return once the click times out");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("click timed out after 50ms"));
        assert_eq!(outcome.new_url.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn selector_wait_defaults_to_visibility_timeout() {
        let page = MockPage::new("https://example.com");
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Wait {
                    duration_ms: None,
                    selector: Some("#results".into()),
                },
                &[],
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(
            page.visibility_waits(),
            vec![("#results".to_string(), Duration::from_millis(5_000))]
        );
    }

    #[tokio::test]
    async fn selector_wait_keeps_an_explicit_duration() {
        let page = MockPage::new("https://example.com");
        ActionExecutor::default()
            .execute(
                &page,
                &Action::Wait {
                    duration_ms: Some(2_500),
                    selector: Some("#results".into()),
                },
                &[],
            )
            .await;
        assert_eq!(page.visibility_waits()[0].1, Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn hidden_selector_wait_is_a_structured_failure() {
        let page = MockPage::new("https://example.com");
        page.hide("#spinner-done");
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Wait {
                    duration_ms: None,
                    selector: Some("#spinner-done".into()),
                },
                &[],
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome
            .error
            .unwrap()
            .contains("'#spinner-done' did not become visible"));
    }

    #[tokio::test]
    async fn failing_primitive_is_caught() {
        let page = MockPage::new("about:blank");
        page.fail_next("keyboard detached");
        let outcome = ActionExecutor::default()
            .execute(
                &page,
                &Action::Keypress {
                    key: "Enter".into(),
                    modifiers: vec![],
                },
                &[],
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("keyboard detached"));
    }
}
