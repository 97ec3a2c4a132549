//! Scripted in-memory page for tests and dry runs.

use super::{BrowserPage, ElementLabel, PageTarget, ScrollPosition, Viewport};
use crate::actions::{ClickButton, KeyModifier};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::time::Duration;

struct MockState {
    url: String,
    title: String,
    elements: Vec<ElementLabel>,
    viewport: Viewport,
    page_height: f64,
    scroll: ScrollPosition,
    signature: u64,
    hidden: HashSet<String>,
    links: HashMap<String, String>,
    fail_next: Option<String>,
    stalled: HashSet<&'static str>,
    calls: Vec<String>,
    visibility_waits: Vec<(String, Duration)>,
    screenshot: Vec<u8>,
}

/// A page whose behaviour is set up by the test: clicking a linked selector
/// navigates, hidden selectors never become visible, scrolling clamps to the
/// page height. Every primitive that acts on the page is recorded.
pub struct MockPage {
    state: Mutex<MockState>,
}

impl MockPage {
    pub fn new(url: impl Into<String>) -> Self {
        let viewport = Viewport::default();
        Self {
            state: Mutex::new(MockState {
                url: url.into(),
                title: "Mock page".into(),
                elements: Vec::new(),
                viewport,
                page_height: f64::from(viewport.height),
                scroll: ScrollPosition::default(),
                signature: 1,
                hidden: HashSet::new(),
                links: HashMap::new(),
                fail_next: None,
                stalled: HashSet::new(),
                calls: Vec::new(),
                visibility_waits: Vec::new(),
                screenshot: blank_png(64, 40),
            }),
        }
    }

    pub fn with_elements(self, elements: Vec<ElementLabel>) -> Self {
        self.state.lock().elements = elements;
        self
    }

    pub fn with_page_height(self, height: f64) -> Self {
        self.state.lock().page_height = height;
        self
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.state.lock().title = title.into();
        self
    }

    pub fn with_screenshot(self, png: Vec<u8>) -> Self {
        self.state.lock().screenshot = png;
        self
    }

    /// Clicking `selector` navigates to `url`.
    pub fn link(&self, selector: impl Into<String>, url: impl Into<String>) {
        self.state.lock().links.insert(selector.into(), url.into());
    }

    pub fn hide(&self, selector: impl Into<String>) {
        self.state.lock().hidden.insert(selector.into());
    }

    /// Make the next acting primitive fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().fail_next = Some(message.into());
    }

    /// Make `primitive` (`"click"` or `"screenshot"`) never resolve, like a
    /// WebDriver that stopped answering.
    pub fn stall(&self, primitive: &'static str) {
        self.state.lock().stalled.insert(primitive);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Every `wait_for_visible` call with the timeout it was given.
    pub fn visibility_waits(&self) -> Vec<(String, Duration)> {
        self.state.lock().visibility_waits.clone()
    }

    async fn stall_if_set(&self, primitive: &'static str) {
        let stalled = self.state.lock().stalled.contains(primitive);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn act(&self, call: String) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            bail!("{message}");
        }
        state.calls.push(call);
        Ok(())
    }

    fn touch(&self) {
        self.state.lock().signature += 1;
    }
}

/// Solid white PNG of the given size.
pub fn blank_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    match image.write_to(&mut out, image::ImageFormat::Png) {
        Ok(()) => out.into_inner(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl BrowserPage for MockPage {
    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().url.clone())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.state.lock().title.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.stall_if_set("screenshot").await;
        Ok(self.state.lock().screenshot.clone())
    }

    async fn query_elements(&self, limit: usize) -> Result<Vec<ElementLabel>> {
        Ok(self.state.lock().elements.iter().take(limit).cloned().collect())
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.visibility_waits.push((selector.to_string(), timeout));
        if state.hidden.contains(selector) {
            bail!("timed out waiting for '{selector}'");
        }
        Ok(())
    }

    async fn click(&self, target: &PageTarget, button: ClickButton) -> Result<()> {
        self.stall_if_set("click").await;
        self.act(format!("click {target} {}", button.as_str()))?;
        let destination = match target {
            PageTarget::Selector(selector) => self.state.lock().links.get(selector).cloned(),
            PageTarget::Point { .. } => None,
        };
        if let Some(url) = destination {
            let mut state = self.state.lock();
            state.url = url;
            state.scroll = ScrollPosition::default();
        }
        self.touch();
        Ok(())
    }

    async fn type_text(
        &self,
        target: Option<&PageTarget>,
        text: &str,
        clear_first: bool,
    ) -> Result<()> {
        let target = target.map_or_else(|| "focused".to_string(), ToString::to_string);
        let mode = if clear_first { "replace" } else { "append" };
        self.act(format!("type {target} {text:?} {mode}"))?;
        self.touch();
        Ok(())
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<()> {
        self.act(format!("scroll {dx} {dy}"))?;
        let mut state = self.state.lock();
        let max_y = (state.page_height - f64::from(state.viewport.height)).max(0.0);
        state.scroll.x = (state.scroll.x + dx as f64).max(0.0);
        state.scroll.y = (state.scroll.y + dy as f64).clamp(0.0, max_y);
        Ok(())
    }

    async fn scroll_position(&self) -> Result<ScrollPosition> {
        Ok(self.state.lock().scroll)
    }

    async fn viewport(&self) -> Result<Viewport> {
        Ok(self.state.lock().viewport)
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.act(format!("navigate {url}"))?;
        {
            let mut state = self.state.lock();
            state.url = url.to_string();
            state.scroll = ScrollPosition::default();
        }
        self.touch();
        Ok(())
    }

    async fn hover(&self, target: &PageTarget) -> Result<()> {
        self.act(format!("hover {target}"))
    }

    async fn select_option(&self, target: &PageTarget, value: &str) -> Result<()> {
        self.act(format!("select {target} {value:?}"))?;
        self.touch();
        Ok(())
    }

    async fn press_key(&self, key: &str, modifiers: &[KeyModifier]) -> Result<()> {
        let mut combo: Vec<&str> = modifiers.iter().map(|m| m.as_str()).collect();
        combo.push(key);
        self.act(format!("key {}", combo.join("+")))?;
        self.touch();
        Ok(())
    }

    async fn content_signature(&self) -> Result<u64> {
        Ok(self.state.lock().signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linked_click_navigates() {
        let page = MockPage::new("https://example.com/login");
        page.link("#submit", "https://example.com/home");
        page.click(&PageTarget::Selector("#submit".into()), ClickButton::Left)
            .await
            .unwrap();
        assert_eq!(page.current_url().await.unwrap(), "https://example.com/home");
    }

    #[tokio::test]
    async fn scroll_clamps_to_page() {
        let page = MockPage::new("about:blank").with_page_height(1_000.0);
        page.scroll_by(0, 500).await.unwrap();
        assert_eq!(page.scroll_position().await.unwrap().y, 200.0);
        page.scroll_by(0, -900).await.unwrap();
        assert_eq!(page.scroll_position().await.unwrap().y, 0.0);
    }

    #[tokio::test]
    async fn fail_next_fails_once() {
        let page = MockPage::new("about:blank");
        page.fail_next("boom");
        assert!(page.hover(&PageTarget::Point { x: 1, y: 1 }).await.is_err());
        assert!(page.hover(&PageTarget::Point { x: 1, y: 1 }).await.is_ok());
        assert_eq!(page.calls(), vec!["hover (1, 1)".to_string()]);
    }

    #[tokio::test]
    async fn stalled_click_never_resolves() {
        let page = MockPage::new("about:blank");
        page.stall("click");
        let click = page.click(&PageTarget::Point { x: 1, y: 1 }, ClickButton::Left);
        assert!(tokio::time::timeout(Duration::from_millis(20), click)
            .await
            .is_err());
        assert!(page.calls().is_empty());
    }

    #[test]
    fn blank_png_decodes() {
        let png = blank_png(4, 3);
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }
}
