//! Browser collaborator interface.
//!
//! The agent never talks to a browser directly. It goes through
//! [`BrowserPage`], a small set of primitives against one addressable page.
//! [`mock::MockPage`] backs tests; [`native::WebDriverPage`] (feature
//! `browser-native`) drives a real browser over WebDriver.

pub mod executor;
pub mod mock;
#[cfg(feature = "browser-native")]
pub mod native;
pub mod observation;

pub use executor::{ActionExecutor, EffectContext, ExecutionOutcome, ExecutorConfig};
pub use mock::MockPage;
pub use observation::{Observation, ObservationConfig};

use crate::actions::{ClickButton, KeyModifier};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Attribute the labeling pass stamps on every element it reports.
pub const LABEL_ATTRIBUTE: &str = "data-webpilot-label";

/// Selector that finds a labeled element when it has no better one.
pub fn label_selector(id: u32) -> String {
    format!("[{LABEL_ATTRIBUTE}=\"{id}\"]")
}

/// Run one page primitive under `limit`. A primitive that outlives it
/// becomes an ordinary error naming `what`.
pub async fn bounded<T>(
    limit: Duration,
    what: &str,
    primitive: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, primitive)
        .await
        .with_context(|| format!("{what} timed out after {}ms", limit.as_millis()))?
}

/// Where a primitive should act.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageTarget {
    Selector(String),
    /// Viewport coordinates in CSS pixels.
    Point { x: i32, y: i32 },
}

impl fmt::Display for PageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector(selector) => f.write_str(selector),
            Self::Point { x, y } => write!(f, "({x}, {y})"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// One labeled interactive element. Ids are 1-based in page order and only
/// mean something within the observation that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementLabel {
    pub id: u32,
    #[serde(default)]
    pub selector: String,
    pub tag: String,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
}

impl ElementLabel {
    pub fn new(id: u32, tag: impl Into<String>) -> Self {
        Self {
            id,
            selector: label_selector(id),
            tag: tag.into(),
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            },
            text: None,
            role: None,
            placeholder: None,
            aria_label: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }

    /// Selector recorded for this label, or the synthetic attribute one.
    pub fn locator(&self) -> String {
        if self.selector.trim().is_empty() {
            label_selector(self.id)
        } else {
            self.selector.clone()
        }
    }

    /// One-line description for the model, e.g. `[3] input "Email" placeholder="you@x"`.
    pub fn describe(&self) -> String {
        let mut line = format!("[{}] {}", self.id, self.tag);
        if let Some(role) = &self.role {
            line.push_str(&format!(" role={role}"));
        }
        if let Some(text) = &self.text {
            line.push_str(&format!(" \"{text}\""));
        }
        if let Some(aria) = &self.aria_label {
            line.push_str(&format!(" aria-label=\"{aria}\""));
        }
        if let Some(placeholder) = &self.placeholder {
            line.push_str(&format!(" placeholder=\"{placeholder}\""));
        }
        line
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Primitives the executor and observation capture need from a page.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// PNG bytes of the visible viewport.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Label up to `limit` visible interactive elements.
    async fn query_elements(&self, limit: usize) -> Result<Vec<ElementLabel>>;

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()>;

    async fn click(&self, target: &PageTarget, button: ClickButton) -> Result<()>;

    /// Type into `target`, or into the focused element when `None`.
    async fn type_text(&self, target: Option<&PageTarget>, text: &str, clear_first: bool)
        -> Result<()>;

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<()>;

    async fn scroll_position(&self) -> Result<ScrollPosition>;

    async fn viewport(&self) -> Result<Viewport>;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn hover(&self, target: &PageTarget) -> Result<()>;

    async fn select_option(&self, target: &PageTarget, value: &str) -> Result<()>;

    async fn press_key(&self, key: &str, modifiers: &[KeyModifier]) -> Result<()>;

    /// Cheap fingerprint of the page content; changes when the DOM does.
    async fn content_signature(&self) -> Result<u64>;
}

#[async_trait]
impl<T: BrowserPage + ?Sized> BrowserPage for std::sync::Arc<T> {
    async fn current_url(&self) -> Result<String> {
        (**self).current_url().await
    }

    async fn title(&self) -> Result<String> {
        (**self).title().await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        (**self).screenshot().await
    }

    async fn query_elements(&self, limit: usize) -> Result<Vec<ElementLabel>> {
        (**self).query_elements(limit).await
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        (**self).wait_for_visible(selector, timeout).await
    }

    async fn click(&self, target: &PageTarget, button: ClickButton) -> Result<()> {
        (**self).click(target, button).await
    }

    async fn type_text(
        &self,
        target: Option<&PageTarget>,
        text: &str,
        clear_first: bool,
    ) -> Result<()> {
        (**self).type_text(target, text, clear_first).await
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<()> {
        (**self).scroll_by(dx, dy).await
    }

    async fn scroll_position(&self) -> Result<ScrollPosition> {
        (**self).scroll_position().await
    }

    async fn viewport(&self) -> Result<Viewport> {
        (**self).viewport().await
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        (**self).navigate(url, timeout).await
    }

    async fn hover(&self, target: &PageTarget) -> Result<()> {
        (**self).hover(target).await
    }

    async fn select_option(&self, target: &PageTarget, value: &str) -> Result<()> {
        (**self).select_option(target, value).await
    }

    async fn press_key(&self, key: &str, modifiers: &[KeyModifier]) -> Result<()> {
        (**self).press_key(key, modifiers).await
    }

    async fn content_signature(&self) -> Result<u64> {
        (**self).content_signature().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_falls_back_to_label_attribute() {
        let label = ElementLabel::new(7, "button").with_selector("");
        assert_eq!(label.locator(), "[data-webpilot-label=\"7\"]");
        let custom = ElementLabel::new(7, "button").with_selector("#submit");
        assert_eq!(custom.locator(), "#submit");
    }

    #[test]
    fn describe_includes_metadata() {
        let mut label = ElementLabel::new(3, "input").with_text("Email");
        label.placeholder = Some("you@example.com".into());
        assert_eq!(
            label.describe(),
            "[3] input \"Email\" placeholder=\"you@example.com\""
        );
    }

    #[tokio::test]
    async fn bounded_turns_a_stalled_primitive_into_an_error() {
        let stalled = std::future::pending::<Result<()>>();
        let err = bounded(Duration::from_millis(20), "click", stalled)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "click timed out after 20ms");

        let value = bounded(Duration::from_millis(20), "title", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn element_label_json_shape() {
        let label: ElementLabel = serde_json::from_value(serde_json::json!({
            "id": 2,
            "tag": "a",
            "bbox": {"x": 1.0, "y": 2.0, "width": 30.0, "height": 12.0},
            "text": "Docs"
        }))
        .unwrap();
        assert_eq!(label.selector, "");
        assert_eq!(label.locator(), label_selector(2));
        assert!(!label.bbox.is_empty());
    }
}
