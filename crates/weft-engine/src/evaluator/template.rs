use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::expression;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static pattern"))
}

/// Result of rendering a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    /// Placeholder bodies that did not resolve; left verbatim in `text`.
    pub unresolved: Vec<String>,
}

/// Resolve an expression; `None` when it does not parse or resolve.
pub fn lookup(expr: &str, scope: &Value) -> Option<Value> {
    expression::parse(expr).ok()?.eval(scope)
}

/// Replace every `{{expr}}` in `template`.
pub fn render(template: &str, scope: &Value) -> Rendered {
    let mut unresolved = Vec::new();
    let text = placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let body = caps[1].trim();
            match lookup(body, scope) {
                Some(value) => expression::stringify(&value),
                None => {
                    unresolved.push(body.to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    Rendered { text, unresolved }
}

/// If `template` is exactly one placeholder, the raw value it names.
///
/// Returns `None` when `template` is not a lone placeholder, and
/// `Some(None)` when it is one but does not resolve.
pub fn lone_placeholder(template: &str, scope: &Value) -> Option<Option<Value>> {
    let caps = placeholder_re().captures(template.trim())?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != template.trim().len() {
        return None;
    }
    Some(lookup(caps[1].trim(), scope))
}

/// Whether `text` contains any `{{...}}` placeholder.
pub fn has_placeholders(text: &str) -> bool {
    placeholder_re().is_match(text)
}

/// Render every string leaf of a JSON value. A string leaf that is a lone
/// placeholder is replaced by the raw value it names.
pub fn render_value(value: &Value, scope: &Value, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(Some(raw)) = lone_placeholder(s, scope) {
                return raw;
            }
            let rendered = render(s, scope);
            unresolved.extend(rendered.unresolved);
            Value::String(rendered.text)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, scope, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}
