//! Effect-based loop detection.
//!
//! Repeating an action is fine as long as it keeps changing something. Only
//! consecutive repeats of the same action with no observable effect count
//! toward a stall, and each action family has its own threshold.

use crate::actions::Action;
use crate::browser::ExecutionOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFamily {
    Click,
    Type,
    Scroll,
    Navigate,
    Hover,
    Select,
    Wait,
    Keypress,
}

impl ActionFamily {
    /// `None` for actions the loop never executes repeatedly (done, request_human).
    pub fn of(action: &Action) -> Option<Self> {
        match action {
            Action::Click { .. } => Some(Self::Click),
            Action::Type { .. } => Some(Self::Type),
            Action::Scroll { .. } => Some(Self::Scroll),
            Action::Navigate { .. } => Some(Self::Navigate),
            Action::Hover { .. } => Some(Self::Hover),
            Action::Select { .. } => Some(Self::Select),
            Action::Wait { .. } => Some(Self::Wait),
            Action::Keypress { .. } => Some(Self::Keypress),
            Action::Done { .. } | Action::RequestHuman { .. } => None,
        }
    }

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
        }
    }
}

impl fmt::Display for ActionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[loop_detection]` thresholds: consecutive no-effect repeats tolerated
/// per family before the navigation is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    pub click_threshold: u32,
    pub type_threshold: u32,
    pub scroll_threshold: u32,
    pub navigate_threshold: u32,
    pub hover_threshold: u32,
    pub select_threshold: u32,
    pub wait_threshold: u32,
    pub keypress_threshold: u32,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            click_threshold: 3,
            type_threshold: 3,
            scroll_threshold: 3,
            navigate_threshold: 3,
            hover_threshold: 4,
            select_threshold: 3,
            wait_threshold: 5,
            keypress_threshold: 4,
        }
    }
}

impl LoopDetectionConfig {
    pub fn threshold(&self, family: ActionFamily) -> u32 {
        let value = match family {
            ActionFamily::Click => self.click_threshold,
            ActionFamily::Type => self.type_threshold,
            ActionFamily::Scroll => self.scroll_threshold,
            ActionFamily::Navigate => self.navigate_threshold,
            ActionFamily::Hover => self.hover_threshold,
            ActionFamily::Select => self.select_threshold,
            ActionFamily::Wait => self.wait_threshold,
            ActionFamily::Keypress => self.keypress_threshold,
        };
        value.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVerdict {
    pub family: ActionFamily,
    pub action: String,
    pub repetitions: u32,
    pub threshold: u32,
}

impl fmt::Display for LoopVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} repeated {} times without effect (threshold {}): {}",
            self.family, self.repetitions, self.threshold, self.action
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    config: LoopDetectionConfig,
    last_key: Option<String>,
    streak: u32,
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig) -> Self {
        Self {
            config,
            last_key: None,
            streak: 0,
        }
    }

    /// Record one executed action. Returns a verdict once the same action has
    /// gone without effect `threshold` times in a row.
    pub fn record(&mut self, action: &Action, outcome: &ExecutionOutcome) -> Option<LoopVerdict> {
        let Some(family) = ActionFamily::of(action) else {
            self.reset();
            return None;
        };
        if !self.config.enabled {
            return None;
        }

        if had_effect(family, outcome) {
            self.reset();
            return None;
        }

        let key = repeat_key(action);
        if self.last_key.as_deref() == Some(key.as_str()) {
            self.streak += 1;
        } else {
            self.last_key = Some(key);
            self.streak = 1;
        }

        let threshold = self.config.threshold(family);
        tracing::debug!(%family, streak = self.streak, threshold, "No-effect action");
        (self.streak >= threshold).then(|| LoopVerdict {
            family,
            action: action.to_string(),
            repetitions: self.streak,
            threshold,
        })
    }

    pub fn reset(&mut self) {
        self.last_key = None;
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// Scrolls repeat by direction regardless of distance; everything else by
/// its full rendering.
fn repeat_key(action: &Action) -> String {
    match action {
        Action::Scroll { direction, .. } => format!("scroll:{}", direction.as_str()),
        other => other.to_string(),
    }
}

/// Failed executions never count as effective. Unknown before/after data
/// gives the benefit of the doubt.
fn had_effect(family: ActionFamily, outcome: &ExecutionOutcome) -> bool {
    if !outcome.success {
        return false;
    }
    let effect = &outcome.effect;
    let page_changed = || match (effect.url_changed(), effect.signature_changed()) {
        (None, None) => true,
        (url, signature) => url.unwrap_or(false) || signature.unwrap_or(false),
    };
    match family {
        ActionFamily::Scroll => effect.scroll_changed().unwrap_or(true),
        ActionFamily::Navigate => effect.url_changed().unwrap_or(true) || page_changed(),
        ActionFamily::Click
        | ActionFamily::Type
        | ActionFamily::Hover
        | ActionFamily::Select
        | ActionFamily::Wait
        | ActionFamily::Keypress => page_changed(),
    }
}
