//! Derived confidence for a decision.
//!
//! Providers do not report calibrated confidence, so the score is a baseline
//! per action type nudged by reasoning length: very short reasoning reads as
//! a guess, a moderate explanation as deliberate, a rambling one as unsure.

use crate::actions::Action;

const SHORT_REASONING_CHARS: usize = 20;
const MODERATE_REASONING_CHARS: usize = 60;
const LONG_REASONING_CHARS: usize = 600;

fn baseline(action: &Action) -> f32 {
    match action {
        Action::Click { .. } => 0.9,
        Action::Type { target: Some(_), .. } => 0.9,
        Action::Type { target: None, .. } => 0.8,
        Action::Select { .. } => 0.85,
        Action::Navigate { .. } => 0.85,
        Action::Hover { .. } => 0.75,
        Action::Keypress { .. } => 0.8,
        Action::Scroll { .. } => 0.65,
        Action::Wait { .. } => 0.6,
        Action::Done { success: true, .. } => 0.95,
        Action::Done { success: false, .. } => 0.8,
        Action::RequestHuman { .. } => 0.5,
    }
}

pub fn derived_confidence(action: &Action, reasoning: &str) -> f32 {
    let chars = reasoning.trim().chars().count();
    let factor = if chars < SHORT_REASONING_CHARS {
        0.9
    } else if chars > LONG_REASONING_CHARS {
        0.95
    } else if chars >= MODERATE_REASONING_CHARS {
        1.05
    } else {
        1.0
    };
    (baseline(action) * factor).clamp(0.05, 0.99)
}
