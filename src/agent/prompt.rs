use crate::actions::Action;
use crate::browser::Observation;
use chrono::Utc;
use std::fmt::Write;

const TEXT_PROTOCOL: &str = "\
## Actions

End every reply with exactly one line of the form `ACTION: name(args)`.
Put your reasoning before it. Available actions:

- click(element_id) | click(x, y) | click(element_id, \"right\"|\"double\")
- type(element_id, \"text\") | type(element_id, \"text\", true) to replace the current value | type(\"text\") for the focused field
- scroll(\"up\"|\"down\"|\"left\"|\"right\") | scroll(\"down\", pixels)
- navigate(\"https://...\")
- hover(element_id) | hover(x, y)
- select(element_id, \"option value or label\")
- wait(ms) | wait(\"css selector\", ms)
- keypress(\"Enter\") | keypress(\"Control+a\")
- done(true, \"summary\") when the goal is achieved, done(false, \"reason\") when it cannot be
- request_human(\"reason\") when a person must step in (captcha, 2FA, payment confirmation)

Element ids come from the numbered list in the latest page state and are
only valid for that state. Prefer element ids over coordinates.";

const TOOL_PROTOCOL: &str = "\
## Actions

Use the `computer` tool for every page interaction. Coordinates are pixels in
the latest screenshot. When the goal is achieved, say that the task is
complete and summarise the result instead of calling the tool.";

const RULES: &str = "\
## Rules

- One action per reply. Look at the result in the next page state before deciding again.
- If an action failed, do not repeat it unchanged; try another element, scroll, or a different approach.
- If scrolling no longer moves the page you have reached its end.
- Never invent credentials or personal data that the goal does not provide.";

/// System prompt for a navigation. Computer-use models get the tool protocol
/// instead of the text action grammar.
pub fn system_prompt(computer_use: bool) -> String {
    let mut out = String::from(
        "You are a web navigation agent controlling a real browser. Each turn you \
         receive a screenshot of the page plus a list of labeled interactive \
         elements, and you choose the single next action that moves toward the \
         user's goal.\n\n",
    );
    out.push_str(if computer_use { TOOL_PROTOCOL } else { TEXT_PROTOCOL });
    out.push_str("\n\n");
    out.push_str(RULES);
    let _ = write!(out, "\n\nCurrent date (UTC): {}", Utc::now().format("%Y-%m-%d"));
    out
}

pub fn goal_message(goal: &str) -> String {
    format!("## Goal\n\n{}", goal.trim())
}

/// Per-step user turn describing the page.
pub fn state_message(step: u32, max_steps: u32, observation: &Observation) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Page state (step {step} of {max_steps})");
    let _ = writeln!(out, "URL: {}", observation.url);
    if !observation.title.trim().is_empty() {
        let _ = writeln!(out, "Title: {}", observation.title.trim());
    }
    if let Some(scroll) = observation.scroll {
        let _ = writeln!(out, "Scroll position: x={:.0} y={:.0}", scroll.x, scroll.y);
    }
    if observation.screenshot.is_none() {
        let _ = writeln!(out, "Screenshot unavailable this step; rely on the element list.");
    }

    if observation.elements.is_empty() {
        let _ = writeln!(out, "\nNo labeled interactive elements are visible.");
    } else {
        let _ = writeln!(out, "\nInteractive elements:");
        for element in &observation.elements {
            let _ = writeln!(out, "{}", element.describe());
        }
    }
    out.trim_end().to_string()
}

/// Assistant turn recorded for a decision, in the same grammar the model
/// is asked to answer in.
pub fn decision_message(reasoning: &str, action: &Action) -> String {
    let reasoning = reasoning.trim();
    if reasoning.is_empty() {
        format!("ACTION: {action}")
    } else {
        format!("{reasoning}\nACTION: {action}")
    }
}

/// Feedback after a failed execution so the next decision can adapt.
pub fn failure_message(action: &Action, error: &str) -> String {
    format!(
        "The last action `{action}` failed: {error}\n\
         Choose a different action; element ids may have changed."
    )
}

pub fn human_resumed_message(reason: &str) -> String {
    format!(
        "A person has handled the request (\"{reason}\"). Continue toward the goal from the current page."
    )
}
