//! Parser properties over the whole action vocabulary: every action renders
//! to a call the parser reads back unchanged, and parsing is stable under
//! re-rendering.

use webpilot::actions::{
    parse, parse_with_reasoning, Action, ClickButton, KeyModifier, ParseErrorKind,
    ScrollDirection, Target,
};

fn vocabulary() -> Vec<Action> {
    vec![
        Action::Click {
            target: Target::Element(12),
            button: ClickButton::Left,
        },
        Action::Click {
            target: Target::Point { x: 320, y: 48 },
            button: ClickButton::Double,
        },
        Action::Click {
            target: Target::Element(2),
            button: ClickButton::Right,
        },
        Action::Type {
            target: Some(Target::Element(3)),
            text: "user@example.com".into(),
            clear_first: false,
        },
        Action::Type {
            target: Some(Target::Element(7)),
            text: "He said \"hi\", then left.".into(),
            clear_first: true,
        },
        Action::Type {
            target: None,
            text: "rust async".into(),
            clear_first: false,
        },
        Action::Scroll {
            direction: ScrollDirection::Down,
            amount: None,
        },
        Action::Scroll {
            direction: ScrollDirection::Left,
            amount: Some(300),
        },
        Action::Navigate {
            url: "https://example.com/search?q=a,b".into(),
        },
        Action::Hover {
            target: Target::Element(9),
        },
        Action::Hover {
            target: Target::Point { x: 10, y: 700 },
        },
        Action::Select {
            target: Target::Element(4),
            value: "Germany".into(),
        },
        Action::Wait {
            duration_ms: Some(2_500),
            selector: None,
        },
        Action::Wait {
            duration_ms: Some(4_000),
            selector: Some("#results .item".into()),
        },
        Action::Keypress {
            key: "Enter".into(),
            modifiers: vec![],
        },
        Action::Keypress {
            key: "a".into(),
            modifiers: vec![KeyModifier::Control],
        },
        Action::Done {
            success: true,
            summary: Some("Found the pricing page".into()),
        },
        Action::Done {
            success: false,
            summary: None,
        },
        Action::RequestHuman {
            reason: "Captcha blocks the form".into(),
        },
    ]
}

#[test]
fn every_action_round_trips_through_the_call_grammar() {
    for action in vocabulary() {
        let response = format!("I will do this next.\nACTION: {action}");
        let parsed = parse(&response).unwrap_or_else(|e| panic!("{action}: {e}"));
        assert_eq!(parsed, action, "rendered as {action}");
    }
}

#[test]
fn parsing_is_idempotent() {
    for action in vocabulary() {
        let once = parse(&format!("ACTION: {action}")).unwrap();
        let twice = parse(&format!("ACTION: {once}")).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_string(), twice.to_string());
    }
}

#[test]
fn every_action_round_trips_through_json() {
    for action in vocabulary() {
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action, "json was {json}");
    }
}

#[test]
fn reasoning_is_the_text_before_the_action() {
    let (action, reasoning) = parse_with_reasoning(
        "The login button is labeled 5 and is visible.\n\nACTION: click(5)",
    )
    .unwrap();
    assert_eq!(action.target(), Some(Target::Element(5)));
    assert_eq!(reasoning, "The login button is labeled 5 and is visible.");
}

#[test]
fn json_block_is_accepted() {
    let response = "Typing the query.\n```json\n{\"type\": \"type\", \"element_id\": 2, \"text\": \"webpilot\"}\n```";
    assert_eq!(
        parse(response).unwrap(),
        Action::Type {
            target: Some(Target::Element(2)),
            text: "webpilot".into(),
            clear_first: false,
        }
    );
}

#[test]
fn failures_are_classified() {
    let err = parse("I am not sure what to do.").unwrap_err();
    assert_eq!(err.kind, ParseErrorKind::NoAction);
    assert_eq!(err.raw, "I am not sure what to do.");

    let err = parse("ACTION: teleport(3)").unwrap_err();
    assert!(matches!(err.kind, ParseErrorKind::UnknownType(_)));

    let err = parse("ACTION: click()").unwrap_err();
    assert!(matches!(err.kind, ParseErrorKind::Invalid { .. }));
}
