//! Browser action vocabulary.
//!
//! [`Action`] is the closed set of instructions the agent can issue against a
//! page. Every producer (text parser, native tool-call mapping, mocks) and
//! every consumer (executor, loop detector, prompt rendering) matches on it
//! exhaustively, so adding a variant is a compile error until each of them
//! handles it.
//!
//! The JSON form is flat (`{"type": "click", "element_id": 5}`) and goes
//! through the same validation as model output, see [`RawAction`].

pub mod grammar;
pub mod parser;
pub mod validate;

pub use parser::{extract_reasoning, parse, parse_with_reasoning, ParseError, ParseErrorKind};
pub use validate::{RawAction, DEFAULT_WAIT_MS, MAX_WAIT_MS};

use serde::{Deserialize, Serialize};
use std::fmt;

/// What an action points at: a labeled element from the current observation
/// or raw viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Element(u32),
    Point { x: i32, y: i32 },
}

impl Target {
    pub fn element_id(self) -> Option<u32> {
        match self {
            Self::Element(id) => Some(id),
            Self::Point { .. } => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Element(id) => write!(f, "{id}"),
            Self::Point { x, y } => write!(f, "{x}, {y}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickButton {
    #[default]
    Left,
    Right,
    Double,
}

impl ClickButton {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Double => "double",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" | "left_click" => Some(Self::Left),
            "right" | "right_click" | "context" => Some(Self::Right),
            "double" | "double_click" | "dblclick" => Some(Self::Double),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyModifier {
    Control,
    Shift,
    Alt,
    Meta,
}

impl KeyModifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "Control",
            Self::Shift => "Shift",
            Self::Alt => "Alt",
            Self::Meta => "Meta",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Some(Self::Control),
            "shift" => Some(Self::Shift),
            "alt" | "option" => Some(Self::Alt),
            "meta" | "cmd" | "command" | "super" | "win" => Some(Self::Meta),
            _ => None,
        }
    }
}

/// Discriminant of [`Action`], used for names, thresholds and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    Hover,
    Select,
    Wait,
    Keypress,
    Done,
    RequestHuman,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        Self::Click,
        Self::Type,
        Self::Scroll,
        Self::Navigate,
        Self::Hover,
        Self::Select,
        Self::Wait,
        Self::Keypress,
        Self::Done,
        Self::RequestHuman,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Navigate => "navigate",
            Self::Hover => "hover",
            Self::Select => "select",
            Self::Wait => "wait",
            Self::Keypress => "keypress",
            Self::Done => "done",
            Self::RequestHuman => "request_human",
        }
    }

    /// Resolve a canonical name or a common alias models tend to emit.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "click" | "tap" => Some(Self::Click),
            "type" | "type_text" | "fill" | "input" => Some(Self::Type),
            "scroll" => Some(Self::Scroll),
            "navigate" | "goto" | "go_to" | "open" | "open_url" => Some(Self::Navigate),
            "hover" | "mouse_move" => Some(Self::Hover),
            "select" | "select_option" => Some(Self::Select),
            "wait" | "sleep" => Some(Self::Wait),
            "keypress" | "key" | "press" | "press_key" => Some(Self::Keypress),
            "done" | "finish" | "complete" => Some(Self::Done),
            "request_human" | "ask_human" | "human" => Some(Self::RequestHuman),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validated browser instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum Action {
    Click {
        target: Target,
        button: ClickButton,
    },
    /// `target: None` types into whatever element currently has focus.
    Type {
        target: Option<Target>,
        text: String,
        clear_first: bool,
    },
    /// `amount: None` lets the executor pick a viewport-relative distance.
    Scroll {
        direction: ScrollDirection,
        amount: Option<u32>,
    },
    Navigate {
        url: String,
    },
    Hover {
        target: Target,
    },
    Select {
        target: Target,
        value: String,
    },
    /// With a selector, waits until it is visible (bounded by `duration_ms`
    /// when set); without one, sleeps for `duration_ms`.
    Wait {
        duration_ms: Option<u64>,
        selector: Option<String>,
    },
    Keypress {
        key: String,
        modifiers: Vec<KeyModifier>,
    },
    Done {
        success: bool,
        summary: Option<String>,
    },
    RequestHuman {
        reason: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::Type { .. } => ActionKind::Type,
            Self::Scroll { .. } => ActionKind::Scroll,
            Self::Navigate { .. } => ActionKind::Navigate,
            Self::Hover { .. } => ActionKind::Hover,
            Self::Select { .. } => ActionKind::Select,
            Self::Wait { .. } => ActionKind::Wait,
            Self::Keypress { .. } => ActionKind::Keypress,
            Self::Done { .. } => ActionKind::Done,
            Self::RequestHuman { .. } => ActionKind::RequestHuman,
        }
    }

    pub fn target(&self) -> Option<Target> {
        match self {
            Self::Click { target, .. } | Self::Hover { target } | Self::Select { target, .. } => {
                Some(*target)
            }
            Self::Type { target, .. } => *target,
            Self::Scroll { .. }
            | Self::Navigate { .. }
            | Self::Wait { .. }
            | Self::Keypress { .. }
            | Self::Done { .. }
            | Self::RequestHuman { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn wait_ms(duration_ms: u64) -> Self {
        Self::Wait {
            duration_ms: Some(duration_ms),
            selector: None,
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in value.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}

/// Renders the compact call form understood by [`parse`], e.g.
/// `type(3, "user@example.com", true)`.
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind())?;
        match self {
            Self::Click { target, button } => {
                write!(f, "{target}")?;
                if *button != ClickButton::Left {
                    f.write_str(", ")?;
                    write_quoted(f, button.as_str())?;
                }
            }
            Self::Type {
                target,
                text,
                clear_first,
            } => {
                if let Some(target) = target {
                    write!(f, "{target}, ")?;
                }
                write_quoted(f, text)?;
                if *clear_first {
                    f.write_str(", true")?;
                }
            }
            Self::Scroll { direction, amount } => {
                write_quoted(f, direction.as_str())?;
                if let Some(amount) = amount {
                    write!(f, ", {amount}")?;
                }
            }
            Self::Navigate { url } => write_quoted(f, url)?,
            Self::Hover { target } => write!(f, "{target}")?,
            Self::Select { target, value } => {
                write!(f, "{target}, ")?;
                write_quoted(f, value)?;
            }
            Self::Wait {
                duration_ms,
                selector,
            } => match (selector, duration_ms) {
                (Some(selector), Some(ms)) => {
                    write_quoted(f, selector)?;
                    write!(f, ", {ms}")?;
                }
                (Some(selector), None) => write_quoted(f, selector)?,
                (None, Some(ms)) => write!(f, "{ms}")?,
                (None, None) => {}
            },
            Self::Keypress { key, modifiers } => {
                let mut combo = modifiers
                    .iter()
                    .map(|m| m.as_str().to_string())
                    .collect::<Vec<_>>();
                combo.push(key.clone());
                write_quoted(f, &combo.join("+"))?;
            }
            Self::Done { success, summary } => {
                write!(f, "{success}")?;
                if let Some(summary) = summary {
                    f.write_str(", ")?;
                    write_quoted(f, summary)?;
                }
            }
            Self::RequestHuman { reason } => write_quoted(f, reason)?,
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_resolve_back_to_kind() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(ActionKind::from_name("goto"), Some(ActionKind::Navigate));
        assert_eq!(ActionKind::from_name("Type-Text"), Some(ActionKind::Type));
        assert_eq!(ActionKind::from_name("finish"), Some(ActionKind::Done));
        assert_eq!(ActionKind::from_name("teleport"), None);
    }

    #[test]
    fn display_uses_call_syntax() {
        let click = Action::Click {
            target: Target::Element(5),
            button: ClickButton::Left,
        };
        assert_eq!(click.to_string(), "click(5)");

        let typed = Action::Type {
            target: Some(Target::Element(3)),
            text: "say \"hi\"".into(),
            clear_first: true,
        };
        assert_eq!(typed.to_string(), r#"type(3, "say \"hi\"", true)"#);

        let key = Action::Keypress {
            key: "a".into(),
            modifiers: vec![KeyModifier::Control, KeyModifier::Shift],
        };
        assert_eq!(key.to_string(), r#"keypress("Control+Shift+a")"#);
    }

    #[test]
    fn target_accessor_covers_optional_type_target() {
        let focused = Action::Type {
            target: None,
            text: "x".into(),
            clear_first: false,
        };
        assert_eq!(focused.target(), None);

        let hover = Action::Hover {
            target: Target::Point { x: 4, y: 9 },
        };
        assert_eq!(hover.target(), Some(Target::Point { x: 4, y: 9 }));
    }

    #[test]
    fn serializes_flat_json() {
        let action = Action::Click {
            target: Target::Point { x: 10, y: 20 },
            button: ClickButton::Double,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "click");
        assert_eq!(value["x"], 10);
        assert_eq!(value["y"], 20);
        assert_eq!(value["button"], "double");

        let back: Action = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }
}
