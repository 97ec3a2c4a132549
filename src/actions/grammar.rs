//! Compact call grammar: `ACTION: name(arg, arg, ...)`.
//!
//! Arguments are positional numbers, quoted strings (single or double quotes,
//! backslash escapes), booleans, or `name=value` pairs. Positional arguments
//! are bucketed by type and assigned per action kind, so `scroll("down", 400)`
//! and `scroll(400, "down")` mean the same thing.

use super::ActionKind;
use regex::Regex;
use serde_json::{Map, Value};
use std::ops::Range;
use std::sync::LazyLock;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\baction\s*:[\s*`]*([a-z_][a-z0-9_\-]*)\s*\(").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Arg {
    fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Float(f) => Value::from(*f),
            Self::Str(s) => Value::String(s.clone()),
            Self::Bool(b) => Value::Bool(*b),
            Self::Null => Value::Null,
        }
    }
}

/// One `name(args)` occurrence located after an `ACTION:` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub positional: Vec<Arg>,
    pub named: Vec<(String, Arg)>,
    /// Byte span from the start of the marker to the closing parenthesis.
    pub span: Range<usize>,
}

/// Locate the first marked call. `None` means no marker is present at all;
/// `Some(Err)` means a marker was found but its argument list is broken.
pub fn find_call(text: &str) -> Option<Result<Call, String>> {
    let caps = MARKER_RE.captures(text)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();
    let args_start = whole.end();

    let Some(args_end) = find_closing_paren(&text[args_start..]) else {
        return Some(Err(format!("unterminated argument list for '{name}'")));
    };
    let inner = &text[args_start..args_start + args_end];
    let span = whole.start()..args_start + args_end + 1;

    Some(parse_args(inner).map(|(positional, named)| Call {
        name,
        positional,
        named,
        span,
    }))
}

/// Offset of the `)` that closes an already-opened argument list.
fn find_closing_paren(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' if depth == 0 => return Some(idx),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

type ParsedArgs = (Vec<Arg>, Vec<(String, Arg)>);

pub fn parse_args(src: &str) -> Result<ParsedArgs, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut positional = Vec::new();
    let mut named = Vec::new();
    let mut i = 0;

    loop {
        skip_ws(&chars, &mut i);
        if i >= chars.len() {
            break;
        }

        let name = read_arg_name(&chars, &mut i);
        skip_ws(&chars, &mut i);
        let arg = if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            read_quoted(&chars, &mut i)?
        } else {
            read_bare(&chars, &mut i)
        };

        match name {
            Some(name) => named.push((name, arg)),
            None => positional.push(arg),
        }

        skip_ws(&chars, &mut i);
        if i >= chars.len() {
            break;
        }
        if chars[i] != ',' {
            return Err(format!(
                "expected ',' between arguments, found '{}'",
                chars[i]
            ));
        }
        i += 1;
    }

    Ok((positional, named))
}

fn skip_ws(chars: &[char], i: &mut usize) {
    while *i < chars.len() && chars[*i].is_whitespace() {
        *i += 1;
    }
}

/// Consume `ident=` if present and return the identifier.
fn read_arg_name(chars: &[char], i: &mut usize) -> Option<String> {
    let start = *i;
    let mut j = start;
    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    if j == start || !chars[start].is_ascii_alphabetic() {
        return None;
    }
    let ident_end = j;
    while j < chars.len() && chars[j].is_whitespace() {
        j += 1;
    }
    if j < chars.len() && chars[j] == '=' {
        *i = j + 1;
        Some(chars[start..ident_end].iter().collect())
    } else {
        None
    }
}

fn read_quoted(chars: &[char], i: &mut usize) -> Result<Arg, String> {
    let quote = chars[*i];
    *i += 1;
    let mut out = String::new();
    while *i < chars.len() {
        let c = chars[*i];
        *i += 1;
        if c == quote {
            return Ok(Arg::Str(out));
        }
        if c == '\\' && *i < chars.len() {
            let escaped = chars[*i];
            *i += 1;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
        } else {
            out.push(c);
        }
    }
    Err("unterminated string literal".into())
}

fn read_bare(chars: &[char], i: &mut usize) -> Arg {
    let start = *i;
    while *i < chars.len() && chars[*i] != ',' {
        *i += 1;
    }
    let token: String = chars[start..*i].iter().collect();
    classify_bare(token.trim())
}

fn classify_bare(token: &str) -> Arg {
    match token.to_ascii_lowercase().as_str() {
        "true" => return Arg::Bool(true),
        "false" => return Arg::Bool(false),
        "null" | "none" => return Arg::Null,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Arg::Int(n);
    }
    if let Ok(f) = token.parse::<f64>() {
        if f.is_finite() {
            return Arg::Float(f);
        }
    }
    Arg::Str(token.to_string())
}

fn is_numeric_str(s: &str) -> bool {
    !s.is_empty() && s.trim().parse::<u32>().is_ok()
}

/// Build the flat JSON object for a call. Named arguments win over
/// positional ones. The result still has to pass validation.
pub fn call_to_object(call: &Call) -> Result<Map<String, Value>, String> {
    let mut nums: Vec<Value> = Vec::new();
    let mut strs: Vec<String> = Vec::new();
    let mut bools: Vec<bool> = Vec::new();
    for arg in &call.positional {
        match arg {
            Arg::Int(_) | Arg::Float(_) => nums.push(arg.to_value()),
            Arg::Str(s) => strs.push(s.clone()),
            Arg::Bool(b) => bools.push(*b),
            Arg::Null => {}
        }
    }

    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(call.name.clone()));

    let kind = ActionKind::from_name(&call.name);
    let takes_target = matches!(
        kind,
        Some(ActionKind::Click | ActionKind::Hover | ActionKind::Select | ActionKind::Type)
    );
    // click("5") and select("4", "Blue") carry quoted ids.
    if takes_target
        && nums.is_empty()
        && strs.first().is_some_and(|s| is_numeric_str(s))
        && !(kind == Some(ActionKind::Type) && strs.len() < 2)
    {
        let id = strs.remove(0);
        nums.push(Value::String(id));
    }

    let mut put = |key: &str, value: Value| {
        obj.entry(key.to_string()).or_insert(value);
    };

    for (name, arg) in &call.named {
        put(name, arg.to_value());
    }

    match kind {
        Some(kind @ (ActionKind::Click | ActionKind::Hover | ActionKind::Select | ActionKind::Type)) => {
            match nums.len() {
                0 => {}
                1 => put("element_id", nums[0].clone()),
                2 => {
                    put("x", nums[0].clone());
                    put("y", nums[1].clone());
                }
                n => return Err(format!("{kind} takes at most 2 numeric arguments, got {n}")),
            }
            match kind {
                ActionKind::Click => {
                    if let Some(button) = strs.first() {
                        put("button", Value::String(button.clone()));
                    }
                }
                ActionKind::Select => {
                    if let Some(value) = strs.first() {
                        put("value", Value::String(value.clone()));
                    }
                }
                ActionKind::Type => {
                    if let Some(text) = strs.first() {
                        put("text", Value::String(text.clone()));
                    }
                    if let Some(extra) = strs.get(1) {
                        put("value", Value::String(extra.clone()));
                    }
                    if let Some(clear) = bools.first() {
                        put("clear_first", Value::Bool(*clear));
                    }
                }
                _ => {}
            }
        }
        Some(ActionKind::Scroll) => {
            if let Some(direction) = strs.first() {
                put("direction", Value::String(direction.clone()));
            }
            if let Some(amount) = nums.first() {
                put("amount", amount.clone());
            }
        }
        Some(ActionKind::Navigate) => {
            if let Some(url) = strs.first() {
                put("url", Value::String(url.clone()));
            }
        }
        Some(ActionKind::Wait) => {
            if let Some(selector) = strs.first() {
                put("selector", Value::String(selector.clone()));
            }
            if let Some(ms) = nums.first() {
                put("duration_ms", ms.clone());
            }
        }
        Some(ActionKind::Keypress) => {
            if let Some(key) = strs.first() {
                put("key", Value::String(key.clone()));
            }
            if strs.len() > 1 {
                put(
                    "modifiers",
                    Value::Array(strs[1..].iter().cloned().map(Value::String).collect()),
                );
            }
        }
        Some(ActionKind::Done) => {
            if let Some(success) = bools.first() {
                put("success", Value::Bool(*success));
            }
            if let Some(summary) = strs.first() {
                put("summary", Value::String(summary.clone()));
            }
        }
        Some(ActionKind::RequestHuman) => {
            if let Some(reason) = strs.first() {
                put("reason", Value::String(reason.clone()));
            }
        }
        // Unknown names fall through to validation, which names the type.
        None => {}
    }

    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_marker_case_insensitively() {
        let call = find_call("I'll sign in.\naction: Click(5)").unwrap().unwrap();
        assert_eq!(call.name, "Click");
        assert_eq!(call.positional, vec![Arg::Int(5)]);
    }

    #[test]
    fn tolerates_markdown_around_marker() {
        let call = find_call("**ACTION:** `scroll(\"down\")`").unwrap().unwrap();
        assert_eq!(call.name, "scroll");
    }

    #[test]
    fn no_marker_means_none() {
        assert!(find_call("click(5)").is_none());
        assert!(find_call("Next action: click the blue button").is_none());
    }

    #[test]
    fn commas_and_parens_inside_strings() {
        let call = find_call(r#"ACTION: type(3, "Smith, John (Jr.)", true)"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            call.positional,
            vec![
                Arg::Int(3),
                Arg::Str("Smith, John (Jr.)".into()),
                Arg::Bool(true)
            ]
        );
    }

    #[test]
    fn escaped_quotes() {
        let (args, _) = parse_args(r#""say \"hi\"", 'it\'s'"#).unwrap();
        assert_eq!(
            args,
            vec![Arg::Str("say \"hi\"".into()), Arg::Str("it's".into())]
        );
    }

    #[test]
    fn named_arguments() {
        let (positional, named) = parse_args(r#"element_id=4, text = "x""#).unwrap();
        assert!(positional.is_empty());
        assert_eq!(
            named,
            vec![
                ("element_id".into(), Arg::Int(4)),
                ("text".into(), Arg::Str("x".into()))
            ]
        );
    }

    #[test]
    fn unterminated_input_is_an_error() {
        assert!(find_call("ACTION: click(5").unwrap().is_err());
        assert!(parse_args(r#""open"#).is_err());
        assert!(parse_args(r#""a" "b""#).is_err());
    }

    #[test]
    fn quoted_numeric_id_becomes_target() {
        let call = find_call(r#"ACTION: select("4", "Blue")"#).unwrap().unwrap();
        let obj = call_to_object(&call).unwrap();
        assert_eq!(obj["element_id"], Value::String("4".into()));
        assert_eq!(obj["value"], Value::String("Blue".into()));
    }

    #[test]
    fn too_many_numbers_rejected() {
        let call = find_call("ACTION: click(1, 2, 3)").unwrap().unwrap();
        assert!(call_to_object(&call).is_err());
    }
}
