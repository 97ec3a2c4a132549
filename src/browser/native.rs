//! WebDriver-backed page built on fantoccini.

use super::{BrowserPage, ElementLabel, PageTarget, ScrollPosition, Viewport, LABEL_ATTRIBUTE};
use crate::actions::{ClickButton, KeyModifier};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fantoccini::actions::{InputSource, MouseActions, PointerAction};
use fantoccini::elements::Element;
use fantoccini::key::Key;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

const VISIBILITY_POLL: Duration = Duration::from_millis(100);

/// One WebDriver session driving one page.
pub struct WebDriverPage {
    client: Client,
}

impl WebDriverPage {
    /// Open a session against a running chromedriver/geckodriver.
    pub async fn connect(webdriver_url: &str, headless: bool) -> Result<Self> {
        let mut capabilities: Map<String, Value> = Map::new();
        if headless {
            capabilities.insert(
                "goog:chromeOptions".to_string(),
                json!({ "args": ["--headless=new", "--disable-gpu", "--window-size=1280,800"] }),
            );
            capabilities.insert(
                "moz:firefoxOptions".to_string(),
                json!({ "args": ["-headless"] }),
            );
        }

        let mut builder =
            ClientBuilder::rustls().context("Failed to initialize rustls connector")?;
        builder.capabilities(capabilities);
        let client = builder.connect(webdriver_url).await.with_context(|| {
            format!(
                "Failed to connect to WebDriver at {webdriver_url}. Start chromedriver/geckodriver first"
            )
        })?;
        tracing::info!(webdriver_url, headless, "WebDriver session started");
        Ok(Self { client })
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .close()
            .await
            .context("Failed to close WebDriver session")
    }

    async fn find(&self, selector: &str) -> Result<Element> {
        self.client
            .find(Locator::Css(selector))
            .await
            .with_context(|| format!("Failed to find element by CSS '{selector}'"))
    }

    async fn script(&self, source: &str, args: Vec<Value>) -> Result<Value> {
        self.client
            .execute(source, args)
            .await
            .context("Failed to evaluate page script")
    }

    /// Dispatch synthetic mouse events at a selector or viewport point.
    async fn dispatch_mouse(&self, target: &PageTarget, events: &[&str]) -> Result<()> {
        let (selector, x, y) = match target {
            PageTarget::Selector(selector) => (Value::String(selector.clone()), json!(null), json!(null)),
            PageTarget::Point { x, y } => (Value::Null, json!(x), json!(y)),
        };
        let found = self
            .script(MOUSE_EVENT_SCRIPT, vec![selector, x, y, json!(events)])
            .await?;
        if found != Value::Bool(true) {
            bail!("no element at {target}");
        }
        Ok(())
    }

    async fn focus_point(&self, x: i32, y: i32) -> Result<()> {
        let found = self
            .script(
                "const el = document.elementFromPoint(arguments[0], arguments[1]); \
                 if (!el) return false; el.focus(); el.click(); return true;",
                vec![json!(x), json!(y)],
            )
            .await?;
        if found != Value::Bool(true) {
            bail!("no element at ({x}, {y})");
        }
        Ok(())
    }

    /// Releasing only resets input state; the action already succeeded.
    async fn release_actions(&self) {
        if let Err(err) = self.client.release_actions().await {
            tracing::debug!(error = %err, "Failed to release input actions");
        }
    }

    async fn focused_or_body(&self) -> Result<Element> {
        match self.client.active_element().await {
            Ok(element) => Ok(element),
            Err(_) => self.find("body").await,
        }
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn current_url(&self) -> Result<String> {
        let url = self
            .client
            .current_url()
            .await
            .context("Failed to read current URL")?;
        Ok(url.to_string())
    }

    async fn title(&self) -> Result<String> {
        self.client.title().await.context("Failed to read page title")
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.client
            .screenshot()
            .await
            .context("Failed to capture screenshot")
    }

    async fn query_elements(&self, limit: usize) -> Result<Vec<ElementLabel>> {
        let raw = self
            .script(&label_script(), vec![json!(limit)])
            .await
            .context("Failed to label interactive elements")?;
        serde_json::from_value(raw).context("Labeling script returned an unexpected shape")
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(element) = self.client.find(Locator::Css(selector)).await {
                if element.is_displayed().await.unwrap_or(false) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "Timed out after {}ms waiting for '{selector}' to be visible",
                    timeout.as_millis()
                );
            }
            tokio::time::sleep(VISIBILITY_POLL).await;
        }
    }

    async fn click(&self, target: &PageTarget, button: ClickButton) -> Result<()> {
        match (target, button) {
            (PageTarget::Selector(selector), ClickButton::Left) => {
                self.find(selector).await?.click().await?;
                Ok(())
            }
            (_, ClickButton::Left) => {
                self.dispatch_mouse(target, &["mousedown", "mouseup", "click"])
                    .await
            }
            (_, ClickButton::Double) => {
                self.dispatch_mouse(
                    target,
                    &["mousedown", "mouseup", "click", "mousedown", "mouseup", "click", "dblclick"],
                )
                .await
            }
            (_, ClickButton::Right) => {
                self.dispatch_mouse(target, &["mousedown", "mouseup", "contextmenu"])
                    .await
            }
        }
    }

    async fn type_text(
        &self,
        target: Option<&PageTarget>,
        text: &str,
        clear_first: bool,
    ) -> Result<()> {
        let element = match target {
            Some(PageTarget::Selector(selector)) => self.find(selector).await?,
            Some(PageTarget::Point { x, y }) => {
                self.focus_point(*x, *y).await?;
                self.focused_or_body().await?
            }
            None => self.focused_or_body().await?,
        };
        // Not a form control when clear fails; select everything and type over it.
        if clear_first && element.clear().await.is_err() {
            let select_all = format!("{}a{}", Key::Control, Key::Null);
            element.send_keys(&select_all).await?;
        }
        element.send_keys(text).await?;
        Ok(())
    }

    async fn scroll_by(&self, dx: i64, dy: i64) -> Result<()> {
        self.script(
            "window.scrollBy(arguments[0], arguments[1]);",
            vec![json!(dx), json!(dy)],
        )
        .await
        .context("Failed to execute scroll script")?;
        Ok(())
    }

    async fn scroll_position(&self) -> Result<ScrollPosition> {
        let raw = self
            .script("return { x: window.scrollX, y: window.scrollY };", vec![])
            .await?;
        serde_json::from_value(raw).context("Unexpected scroll position shape")
    }

    async fn viewport(&self) -> Result<Viewport> {
        let raw = self
            .script(
                "return { width: window.innerWidth, height: window.innerHeight };",
                vec![],
            )
            .await?;
        serde_json::from_value(raw).context("Unexpected viewport shape")
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.client.goto(url))
            .await
            .with_context(|| format!("Timed out opening {url}"))?
            .with_context(|| format!("Failed to open URL: {url}"))
    }

    async fn hover(&self, target: &PageTarget) -> Result<()> {
        match target {
            PageTarget::Selector(selector) => {
                let element = self.find(selector).await?;
                let actions =
                    MouseActions::new("mouse".to_string()).then(PointerAction::MoveToElement {
                        element,
                        duration: Some(Duration::from_millis(150)),
                        x: 0.0,
                        y: 0.0,
                    });
                self.client
                    .perform_actions(actions)
                    .await
                    .context("Failed to perform hover action")?;
                self.release_actions().await;
                Ok(())
            }
            PageTarget::Point { .. } => {
                self.dispatch_mouse(target, &["mouseover", "mouseenter", "mousemove"])
                    .await
            }
        }
    }

    async fn select_option(&self, target: &PageTarget, value: &str) -> Result<()> {
        let PageTarget::Selector(selector) = target else {
            bail!("select needs an element, not coordinates");
        };
        let result = self
            .script(SELECT_SCRIPT, vec![json!(selector), json!(value)])
            .await?;
        match result.as_str() {
            Some("ok") => Ok(()),
            Some("not_select") => bail!("'{selector}' is not a <select> element"),
            Some("no_option") => bail!("'{selector}' has no option matching '{value}'"),
            _ => bail!("'{selector}' was not found"),
        }
    }

    async fn press_key(&self, key: &str, modifiers: &[KeyModifier]) -> Result<()> {
        let mut sequence = String::new();
        for modifier in modifiers {
            sequence.push_str(&modifier_key(*modifier).to_string());
        }
        sequence.push_str(&webdriver_key(key));
        if !modifiers.is_empty() {
            sequence.push_str(&Key::Null.to_string());
        }
        self.focused_or_body().await?.send_keys(&sequence).await?;
        Ok(())
    }

    async fn content_signature(&self) -> Result<u64> {
        let raw = self.script(SIGNATURE_SCRIPT, vec![]).await?;
        raw.as_u64()
            .or_else(|| raw.as_f64().map(|v| v as u64))
            .context("Signature script returned a non-number")
    }
}

fn modifier_key(modifier: KeyModifier) -> Key {
    match modifier {
        KeyModifier::Control => Key::Control,
        KeyModifier::Shift => Key::Shift,
        KeyModifier::Alt => Key::Alt,
        KeyModifier::Meta => Key::Meta,
    }
}

fn webdriver_key(key: &str) -> String {
    let named = match key.trim().to_ascii_lowercase().as_str() {
        "enter" => Some(Key::Enter),
        "return" => Some(Key::Return),
        "tab" => Some(Key::Tab),
        "escape" | "esc" => Some(Key::Escape),
        "backspace" => Some(Key::Backspace),
        "delete" => Some(Key::Delete),
        "space" => Some(Key::Space),
        "arrowup" | "up" => Some(Key::Up),
        "arrowdown" | "down" => Some(Key::Down),
        "arrowleft" | "left" => Some(Key::Left),
        "arrowright" | "right" => Some(Key::Right),
        "home" => Some(Key::Home),
        "end" => Some(Key::End),
        "pageup" => Some(Key::PageUp),
        "pagedown" => Some(Key::PageDown),
        _ => None,
    };
    named.map_or_else(|| key.to_string(), |k| k.to_string())
}

const MOUSE_EVENT_SCRIPT: &str = r"
const [selector, x, y, events] = arguments;
const el = selector !== null ? document.querySelector(selector) : document.elementFromPoint(x, y);
if (!el) return false;
const rect = el.getBoundingClientRect();
const cx = x !== null ? x : rect.left + rect.width / 2;
const cy = y !== null ? y : rect.top + rect.height / 2;
for (const type of events) {
  const button = type === 'contextmenu' ? 2 : 0;
  el.dispatchEvent(new MouseEvent(type, { bubbles: true, cancelable: true, view: window, clientX: cx, clientY: cy, button, detail: type === 'dblclick' ? 2 : 1 }));
}
return true;
";

const SELECT_SCRIPT: &str = r"
const [selector, wanted] = arguments;
const el = document.querySelector(selector);
if (!el) return 'missing';
if (el.tagName.toLowerCase() !== 'select') return 'not_select';
const needle = String(wanted).trim().toLowerCase();
const option = Array.from(el.options).find(o => o.value === wanted)
  || Array.from(el.options).find(o => o.text.trim().toLowerCase() === needle);
if (!option) return 'no_option';
el.value = option.value;
el.dispatchEvent(new Event('input', { bubbles: true }));
el.dispatchEvent(new Event('change', { bubbles: true }));
return 'ok';
";

const SIGNATURE_SCRIPT: &str = r"
const text = location.href + '|' + document.title + '|' + document.getElementsByTagName('*').length + '|' + (document.body ? document.body.innerText : '');
let hash = 5381;
for (let i = 0; i < text.length; i++) { hash = ((hash * 33) ^ text.charCodeAt(i)) >>> 0; }
return hash;
";

/// Stamp visible interactive elements with 1-based labels and describe them.
fn label_script() -> String {
    format!(
        r#"
const limit = arguments[0];
const attr = '{LABEL_ATTRIBUTE}';
document.querySelectorAll('[' + attr + ']').forEach(el => el.removeAttribute(attr));

const isVisible = (el) => {{
  const style = window.getComputedStyle(el);
  if (style.display === 'none' || style.visibility === 'hidden' || Number(style.opacity || 1) === 0) return false;
  const rect = el.getBoundingClientRect();
  return rect.width > 0 && rect.height > 0 && rect.bottom > 0 && rect.right > 0
    && rect.top < window.innerHeight && rect.left < window.innerWidth;
}};
const interactive = 'a[href],button,input:not([type=hidden]),select,textarea,summary,[role=button],[role=link],[role=checkbox],[role=tab],[role=menuitem],[contenteditable=true],[tabindex]:not([tabindex="-1"])';
const attrOrNull = (el, name) => {{ const v = el.getAttribute(name); return v && v.trim() ? v.trim() : null; }};

const out = [];
for (const el of document.querySelectorAll(interactive)) {{
  if (out.length >= limit) break;
  if (!isVisible(el)) continue;
  const id = out.length + 1;
  el.setAttribute(attr, String(id));
  const rect = el.getBoundingClientRect();
  const text = (el.innerText || el.value || '').trim().replace(/\s+/g, ' ').slice(0, 200);
  out.push({{
    id,
    selector: el.id && document.querySelectorAll('#' + CSS.escape(el.id)).length === 1
      ? '#' + CSS.escape(el.id)
      : '[' + attr + '="' + id + '"]',
    tag: el.tagName.toLowerCase(),
    bbox: {{ x: rect.left, y: rect.top, width: rect.width, height: rect.height }},
    text: text || null,
    role: attrOrNull(el, 'role'),
    placeholder: attrOrNull(el, 'placeholder'),
    aria_label: attrOrNull(el, 'aria-label'),
  }});
}}
return out;
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_map_to_webdriver_codes() {
        assert_eq!(webdriver_key("Enter"), Key::Enter.to_string());
        assert_eq!(webdriver_key("esc"), Key::Escape.to_string());
        assert_eq!(webdriver_key("a"), "a");
    }

    #[test]
    fn label_script_uses_label_attribute() {
        let script = label_script();
        assert!(script.contains("const attr = 'data-webpilot-label';"));
        assert!(script.contains("return out;"));
    }

    #[tokio::test]
    async fn failed_input_release_is_not_an_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {"sessionId": "s1", "capabilities": {}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1/actions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": {
                    "error": "unknown error",
                    "message": "input source detached",
                    "stacktrace": ""
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = WebDriverPage::connect(&server.uri(), false).await.unwrap();
        page.release_actions().await;
    }
}
