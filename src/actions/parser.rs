//! Turn free-form model output into a typed [`Action`].
//!
//! Strategies run in a fixed order and the first structural match wins:
//!
//! 1. `ACTION: name(args…)` call grammar ([`super::grammar`]).
//! 2. A fenced code block holding a JSON object.
//! 3. A wrapper tag (`<action>`, `<tool_call>`, `<function_call>`) holding a
//!    JSON object.
//! 4. The first inline JSON object carrying a `"type"` key.
//!
//! Whatever matched is then validated; a validation failure is reported as
//! such and does not fall through to later strategies.

use super::grammar;
use super::validate::{RawAction, ValidationError};
use super::{Action, ActionKind};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

static FENCED_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_-]*[ \t]*\n?(.*?)```").unwrap());

static WRAPPER_TAG_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["action", "tool_call", "function_call"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).unwrap())
        .collect()
});

static REASONING_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:\*\*)?(?:reasoning|thought|thinking|analysis)(?:\*\*)?\s*:\s*(?:\*\*)?")
        .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CallGrammar,
    FencedJson,
    WrapperTag,
    InlineJson,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CallGrammar => "call",
            Self::FencedJson => "fenced JSON",
            Self::WrapperTag => "tagged JSON",
            Self::InlineJson => "inline JSON",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("no action found in model response")]
    NoAction,
    #[error("malformed {strategy} action: {message}")]
    Malformed { strategy: String, message: String },
    #[error("unknown action type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} action: {reason}")]
    Invalid { kind: ActionKind, reason: String },
}

/// Parse failure with the offending response attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub raw: String,
}

impl ParseError {
    fn new(kind: ParseErrorKind, raw: &str) -> Self {
        Self {
            kind,
            raw: raw.to_string(),
        }
    }

    fn malformed(strategy: Strategy, message: impl Into<String>, raw: &str) -> Self {
        Self::new(
            ParseErrorKind::Malformed {
                strategy: strategy.to_string(),
                message: message.into(),
            },
            raw,
        )
    }
}

impl From<ValidationError> for ParseErrorKind {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::UnknownType(kind) => Self::UnknownType(kind),
            ValidationError::Invalid { kind, reason } => Self::Invalid { kind, reason },
        }
    }
}

/// A structural match: where it sits in the text and what it decoded to.
struct Located {
    strategy: Strategy,
    span: Range<usize>,
    object: Result<Map<String, Value>, String>,
    /// Reasoning embedded in a JSON payload (`{"reasoning": ..., "action": ...}`).
    embedded_reasoning: Option<String>,
}

pub fn parse(text: &str) -> Result<Action, ParseError> {
    parse_with_reasoning(text).map(|(action, _)| action)
}

/// Parse the action and extract the reasoning around it in one pass.
pub fn parse_with_reasoning(text: &str) -> Result<(Action, String), ParseError> {
    let Some(located) = locate(text) else {
        return Err(ParseError::new(ParseErrorKind::NoAction, text));
    };

    let object = located
        .object
        .map_err(|message| ParseError::malformed(located.strategy, message, text))?;
    let raw: RawAction = serde_json::from_value(Value::Object(object))
        .map_err(|e| ParseError::malformed(located.strategy, e.to_string(), text))?;
    let action = Action::try_from(raw).map_err(|e| ParseError::new(e.into(), text))?;

    let reasoning = match located.embedded_reasoning {
        Some(reasoning) if !reasoning.trim().is_empty() => reasoning.trim().to_string(),
        _ => reasoning_around(text, located.strategy, &located.span),
    };
    Ok((action, reasoning))
}

/// Prose preceding the action marker, or surrounding any recognized action
/// block. Falls back to the whole response when nothing is recognized.
pub fn extract_reasoning(text: &str) -> String {
    match locate(text) {
        Some(located) => match located.embedded_reasoning {
            Some(reasoning) if !reasoning.trim().is_empty() => reasoning.trim().to_string(),
            _ => reasoning_around(text, located.strategy, &located.span),
        },
        None => strip_label(text),
    }
}

fn reasoning_around(text: &str, strategy: Strategy, span: &Range<usize>) -> String {
    let before = strip_label(&text[..span.start]);
    if strategy == Strategy::CallGrammar && !before.is_empty() {
        return before;
    }
    let after = strip_label(&text[span.end..]);
    match (before.is_empty(), after.is_empty()) {
        (false, false) => format!("{before}\n{after}"),
        (false, true) => before,
        (true, _) => after,
    }
}

fn strip_label(text: &str) -> String {
    REASONING_LABEL_RE.replace(text.trim(), "").trim().to_string()
}

fn locate(text: &str) -> Option<Located> {
    if let Some(call) = grammar::find_call(text) {
        return Some(match call {
            Ok(call) => Located {
                strategy: Strategy::CallGrammar,
                span: call.span.clone(),
                object: grammar::call_to_object(&call),
                embedded_reasoning: None,
            },
            Err(message) => {
                let start = text.to_ascii_lowercase().find("action").unwrap_or(0);
                Located {
                    strategy: Strategy::CallGrammar,
                    span: start..text.len(),
                    object: Err(message),
                    embedded_reasoning: None,
                }
            }
        });
    }

    for caps in FENCED_BLOCK_RE.captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Some((object, reasoning)) = action_object(body.as_str().trim()) {
            return Some(Located {
                strategy: Strategy::FencedJson,
                span: whole.range(),
                object: Ok(object),
                embedded_reasoning: reasoning,
            });
        }
    }

    let mut tagged: Option<Located> = None;
    for re in WRAPPER_TAG_RES.iter() {
        for caps in re.captures_iter(text) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if tagged.as_ref().is_some_and(|t| t.span.start < whole.start()) {
                break;
            }
            if let Some((object, reasoning)) = action_object(body.as_str().trim()) {
                tagged = Some(Located {
                    strategy: Strategy::WrapperTag,
                    span: whole.range(),
                    object: Ok(object),
                    embedded_reasoning: reasoning,
                });
                break;
            }
        }
    }
    if tagged.is_some() {
        return tagged;
    }

    scan_inline_json(text)
}

/// Decode `body` as a JSON object that describes an action.
fn action_object(body: &str) -> Option<(Map<String, Value>, Option<String>)> {
    let value: Value = serde_json::from_str(body).ok()?;
    normalize_action_value(value)
}

/// Accepts the flat form, `{"action": {...}}` envelopes and
/// `{"name": ..., "arguments": {...}}` tool-call shapes.
fn normalize_action_value(value: Value) -> Option<(Map<String, Value>, Option<String>)> {
    let Value::Object(mut obj) = value else {
        return None;
    };
    let reasoning = ["reasoning", "thought", "thinking"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str).map(str::to_string));

    if obj.get("action").is_some_and(Value::is_object) {
        let Some(Value::Object(mut inner)) = obj.remove("action") else {
            return None;
        };
        if !inner.contains_key("type") {
            if let Some(name) = inner.remove("name") {
                inner.insert("type".into(), name);
            }
        }
        return inner
            .get("type")
            .is_some_and(Value::is_string)
            .then_some((inner, reasoning));
    }

    if let (Some(Value::String(name)), Some(arguments)) =
        (obj.get("name").cloned(), obj.get("arguments").cloned())
    {
        let arguments = match arguments {
            Value::String(encoded) => serde_json::from_str::<Value>(&encoded).ok()?,
            other => other,
        };
        let Value::Object(mut args) = arguments else {
            return None;
        };
        args.insert("type".into(), Value::String(name));
        return Some((args, reasoning));
    }

    for key in ["reasoning", "thought", "thinking"] {
        obj.remove(key);
    }
    if obj.get("type").is_some_and(Value::is_string) {
        obj.remove("action");
        return Some((obj, reasoning));
    }
    if let Some(name) = obj.remove("action").filter(Value::is_string) {
        obj.insert("type".into(), name);
        return Some((obj, reasoning));
    }
    None
}

fn scan_inline_json(text: &str) -> Option<Located> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find('{') {
        let start = search_from + rel;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let end = start + stream.byte_offset();
            if let Some((object, reasoning)) = normalize_action_value(value) {
                if object.get("type").is_some_and(Value::is_string) {
                    return Some(Located {
                        strategy: Strategy::InlineJson,
                        span: start..end,
                        object: Ok(object),
                        embedded_reasoning: reasoning,
                    });
                }
            }
        }
        search_from = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ClickButton, ScrollDirection, Target};

    #[test]
    fn call_grammar_with_reasoning() {
        let text = "The login button is labeled 5.\nACTION: click(5)";
        let (action, reasoning) = parse_with_reasoning(text).unwrap();
        assert_eq!(
            action,
            Action::Click {
                target: Target::Element(5),
                button: ClickButton::Left,
            }
        );
        assert_eq!(reasoning, "The login button is labeled 5.");
    }

    #[test]
    fn reasoning_label_is_stripped() {
        let text = "REASONING: Need to reveal more results.\nACTION: scroll(\"down\")";
        assert_eq!(extract_reasoning(text), "Need to reveal more results.");
    }

    #[test]
    fn fenced_json_block() {
        let text = "Typing the email now.\n```json\n{\"type\": \"type\", \"element_id\": 3, \"text\": \"a@b.c\"}\n```\nThen submit.";
        let (action, reasoning) = parse_with_reasoning(text).unwrap();
        assert_eq!(
            action,
            Action::Type {
                target: Some(Target::Element(3)),
                text: "a@b.c".into(),
                clear_first: false,
            }
        );
        assert_eq!(reasoning, "Typing the email now.\nThen submit.");
    }

    #[test]
    fn fenced_block_without_json_is_skipped() {
        let text = "```\nnot json\n```\n<action>{\"type\": \"scroll\", \"direction\": \"up\"}</action>";
        assert_eq!(
            parse(text).unwrap(),
            Action::Scroll {
                direction: ScrollDirection::Up,
                amount: None,
            }
        );
    }

    #[test]
    fn wrapper_tag_with_tool_call_shape() {
        let text = r#"<tool_call>{"name": "navigate", "arguments": {"url": "example.org"}}</tool_call>"#;
        assert_eq!(
            parse(text).unwrap(),
            Action::Navigate {
                url: "https://example.org".into()
            }
        );
    }

    #[test]
    fn inline_json_last_resort() {
        let text = r#"Page is done loading {"note": 1} so {"type": "done", "success": true, "summary": "ok"}"#;
        assert_eq!(
            parse(text).unwrap(),
            Action::Done {
                success: true,
                summary: Some("ok".into()),
            }
        );
    }

    #[test]
    fn envelope_reasoning_is_used() {
        let text = r#"{"reasoning": "Field 2 is the search box", "action": {"type": "click", "element_id": 2}}"#;
        let (action, reasoning) = parse_with_reasoning(text).unwrap();
        assert_eq!(action.target(), Some(Target::Element(2)));
        assert_eq!(reasoning, "Field 2 is the search box");
    }

    #[test]
    fn call_grammar_wins_over_json() {
        let text = "ACTION: hover(9)\n```json\n{\"type\": \"click\", \"element_id\": 1}\n```";
        assert_eq!(
            parse(text).unwrap(),
            Action::Hover {
                target: Target::Element(9)
            }
        );
    }

    #[test]
    fn no_action_keeps_raw_text() {
        let err = parse("I am not sure what to do here.").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NoAction);
        assert_eq!(err.raw, "I am not sure what to do here.");
    }

    #[test]
    fn unknown_type_does_not_fall_through() {
        let text = "ACTION: teleport(1)\n{\"type\": \"click\", \"element_id\": 1}";
        let err = parse(text).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownType("teleport".into()));
    }

    #[test]
    fn validation_failure_reports_kind() {
        let err = parse("ACTION: click()").unwrap_err();
        assert!(matches!(
            err.kind,
            ParseErrorKind::Invalid {
                kind: ActionKind::Click,
                ..
            }
        ));
    }

    #[test]
    fn broken_call_is_malformed() {
        let err = parse("ACTION: type(3, \"unterminated)").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::Malformed { .. }));
    }
}
