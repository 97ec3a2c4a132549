//! Flat wire shape for actions and the validation pass that turns it into a
//! typed [`Action`].
//!
//! Models are sloppy about JSON: ids arrive as `"5"`, coordinates as `412.5`
//! or `[412, 88]`, field names in camelCase. [`RawAction`] absorbs all of
//! that, and [`TryFrom<RawAction>`] enforces per-variant required fields.

use super::{Action, ActionKind, ClickButton, KeyModifier, ScrollDirection, Target};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Default for a `wait` with neither duration nor selector.
pub const DEFAULT_WAIT_MS: u64 = 1_000;
/// Upper bound on a single model-requested wait.
pub const MAX_WAIT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown action type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} action: {reason}")]
    Invalid { kind: ActionKind, reason: String },
}

fn invalid(kind: ActionKind, reason: impl Into<String>) -> ValidationError {
    ValidationError::Invalid {
        kind,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type", alias = "action")]
    pub kind: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_u32",
        alias = "element",
        alias = "elementId",
        alias = "element_ref",
        alias = "label",
        alias = "ref",
        alias = "index"
    )]
    pub element_id: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_i32"
    )]
    pub x: Option<i32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_i32"
    )]
    pub y: Option<i32>,
    #[serde(
        default,
        skip_serializing,
        deserialize_with = "lenient_point",
        alias = "coordinates"
    )]
    pub coordinate: Option<(i32, i32)>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "click_type",
        alias = "variant"
    )]
    pub button: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "option")]
    pub value: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "clear",
        alias = "clearFirst"
    )]
    pub clear_first: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_u32",
        alias = "pixels",
        alias = "distance"
    )]
    pub amount: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_u64",
        alias = "duration",
        alias = "durationMs",
        alias = "ms",
        alias = "timeout_ms"
    )]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "keys")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "message",
        alias = "result"
    )]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RawAction {
    fn target(&self) -> Option<Target> {
        if let Some(id) = self.element_id {
            return Some(Target::Element(id));
        }
        if let Some((x, y)) = self.coordinate {
            return Some(Target::Point { x, y });
        }
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Target::Point { x, y }),
            _ => None,
        }
    }

    fn set_target(&mut self, target: Target) {
        match target {
            Target::Element(id) => self.element_id = Some(id),
            Target::Point { x, y } => {
                self.x = Some(x);
                self.y = Some(y);
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Prefix `https://` when the model hands over a bare host.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    let has_scheme = trimmed.contains("://")
        || ["about:", "data:", "file:", "javascript:"]
            .iter()
            .any(|scheme| lower.starts_with(scheme));
    if has_scheme {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Split `"Control+Shift+a"` into modifiers and the final key.
fn split_key_combo(combo: &str) -> Result<(Vec<KeyModifier>, String), String> {
    let combo = combo.trim();
    if combo == "+" {
        return Ok((Vec::new(), "+".to_string()));
    }
    let (prefix, key) = if let Some(prefix) = combo.strip_suffix("++") {
        (prefix, "+".to_string())
    } else {
        match combo.rsplit_once('+') {
            Some((prefix, key)) => (prefix, key.trim().to_string()),
            None => ("", combo.to_string()),
        }
    };

    let mut modifiers = Vec::new();
    for token in prefix.split('+').filter(|t| !t.trim().is_empty()) {
        let modifier =
            KeyModifier::from_name(token).ok_or_else(|| format!("unknown modifier '{token}'"))?;
        if !modifiers.contains(&modifier) {
            modifiers.push(modifier);
        }
    }
    if key.is_empty() {
        return Err("key combination has no key".into());
    }
    Ok((modifiers, key))
}

impl TryFrom<RawAction> for Action {
    type Error = ValidationError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let kind = ActionKind::from_name(&raw.kind)
            .ok_or_else(|| ValidationError::UnknownType(raw.kind.trim().to_string()))?;

        let action = match kind {
            ActionKind::Click => {
                let target = raw
                    .target()
                    .ok_or_else(|| invalid(kind, "needs an element_id or x/y coordinates"))?;
                let button = match raw.button.as_deref() {
                    Some(name) => ClickButton::from_name(name)
                        .ok_or_else(|| invalid(kind, format!("unknown button '{name}'")))?,
                    None => ClickButton::Left,
                };
                Action::Click { target, button }
            }
            ActionKind::Type => {
                let target = raw.target();
                let text = match (raw.text, raw.value) {
                    (Some(text), None) | (None, Some(text)) => text,
                    (Some(text), Some(value)) if text == value => text,
                    (Some(_), Some(_)) => {
                        return Err(invalid(kind, "provide exactly one of text or value"))
                    }
                    (None, None) => return Err(invalid(kind, "needs text")),
                };
                if text.is_empty() {
                    return Err(invalid(kind, "text must not be empty"));
                }
                Action::Type {
                    target,
                    text,
                    clear_first: raw.clear_first.unwrap_or(false),
                }
            }
            ActionKind::Scroll => {
                let name = raw
                    .direction
                    .ok_or_else(|| invalid(kind, "needs a direction"))?;
                let direction = ScrollDirection::from_name(&name)
                    .ok_or_else(|| invalid(kind, format!("unknown direction '{name}'")))?;
                Action::Scroll {
                    direction,
                    amount: raw.amount.filter(|amount| *amount > 0),
                }
            }
            ActionKind::Navigate => {
                let url = non_empty(raw.url).ok_or_else(|| invalid(kind, "needs a url"))?;
                Action::Navigate {
                    url: normalize_url(&url),
                }
            }
            ActionKind::Hover => {
                let target = raw
                    .target()
                    .ok_or_else(|| invalid(kind, "needs an element_id or x/y coordinates"))?;
                Action::Hover { target }
            }
            ActionKind::Select => {
                let target = raw
                    .target()
                    .ok_or_else(|| invalid(kind, "needs an element_id or x/y coordinates"))?;
                let value = raw
                    .value
                    .or(raw.text)
                    .ok_or_else(|| invalid(kind, "needs an option value"))?;
                Action::Select { target, value }
            }
            ActionKind::Wait => {
                let selector = non_empty(raw.selector);
                let duration_ms = match (raw.duration_ms, &selector) {
                    (Some(ms), _) => Some(ms.min(MAX_WAIT_MS)),
                    (None, Some(_)) => None,
                    (None, None) => Some(DEFAULT_WAIT_MS),
                };
                Action::Wait {
                    duration_ms,
                    selector,
                }
            }
            ActionKind::Keypress => {
                let combo = non_empty(raw.key)
                    .or_else(|| non_empty(raw.text))
                    .ok_or_else(|| invalid(kind, "needs a key"))?;
                let (mut modifiers, key) =
                    split_key_combo(&combo).map_err(|reason| invalid(kind, reason))?;
                for name in raw.modifiers.unwrap_or_default() {
                    let modifier = KeyModifier::from_name(&name)
                        .ok_or_else(|| invalid(kind, format!("unknown modifier '{name}'")))?;
                    if !modifiers.contains(&modifier) {
                        modifiers.push(modifier);
                    }
                }
                Action::Keypress { key, modifiers }
            }
            ActionKind::Done => Action::Done {
                success: raw.success.unwrap_or(true),
                summary: non_empty(raw.summary).or_else(|| non_empty(raw.text)),
            },
            ActionKind::RequestHuman => Action::RequestHuman {
                reason: non_empty(raw.reason)
                    .or_else(|| non_empty(raw.text))
                    .unwrap_or_else(|| "Human assistance requested".to_string()),
            },
        };
        Ok(action)
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        let mut raw = RawAction {
            kind: action.kind().as_str().to_string(),
            ..RawAction::default()
        };
        match action {
            Action::Click { target, button } => {
                raw.set_target(target);
                if button != ClickButton::Left {
                    raw.button = Some(button.as_str().to_string());
                }
            }
            Action::Type {
                target,
                text,
                clear_first,
            } => {
                if let Some(target) = target {
                    raw.set_target(target);
                }
                raw.text = Some(text);
                raw.clear_first = clear_first.then_some(true);
            }
            Action::Scroll { direction, amount } => {
                raw.direction = Some(direction.as_str().to_string());
                raw.amount = amount;
            }
            Action::Navigate { url } => raw.url = Some(url),
            Action::Hover { target } => raw.set_target(target),
            Action::Select { target, value } => {
                raw.set_target(target);
                raw.value = Some(value);
            }
            Action::Wait {
                duration_ms,
                selector,
            } => {
                raw.duration_ms = duration_ms;
                raw.selector = selector;
            }
            Action::Keypress { key, modifiers } => {
                raw.key = Some(key);
                if !modifiers.is_empty() {
                    raw.modifiers = Some(
                        modifiers
                            .iter()
                            .map(|m| m.as_str().to_string())
                            .collect(),
                    );
                }
            }
            Action::Done { success, summary } => {
                raw.success = Some(success);
                raw.summary = summary;
            }
            Action::RequestHuman { reason } => raw.reason = Some(reason),
        }
        raw
    }
}

// ── Lenient number handling ──────────────────────────────────────────────

/// Accept integers, floats (rounded) and numeric strings such as `"5"`,
/// `"@e5"` or `"[5]"`.
pub(crate) fn lenient_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.round() as i64)
        }),
        Value::String(s) => {
            let cleaned = s
                .trim()
                .trim_start_matches(['@', '#', '['])
                .trim_start_matches('e')
                .trim_end_matches(']');
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(lenient_number)
        .and_then(|n| u32::try_from(n).ok()))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(lenient_number)
        .and_then(|n| u64::try_from(n).ok()))
}

fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(lenient_number)
        .and_then(|n| i32::try_from(n).ok()))
}

fn lenient_point<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<(i32, i32)>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let Some(Value::Array(items)) = value else {
        return Ok(None);
    };
    if items.len() != 2 {
        return Ok(None);
    }
    let x = lenient_number(&items[0]).and_then(|n| i32::try_from(n).ok());
    let y = lenient_number(&items[1]).and_then(|n| i32::try_from(n).ok());
    Ok(x.zip(y))
}
