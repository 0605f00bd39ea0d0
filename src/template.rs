//! Parameter substitution and payload flattening
//!
//! Loader rules and index state entries share one placeholder syntax:
//! `$name` resolves a named value (an item field or a named capture group)
//! and `$N` resolves an indexed capture group. A placeholder with no
//! corresponding value is left verbatim so a broken rule stays visible in
//! the output instead of silently collapsing.

use indexmap::IndexMap;
use regex::Captures;
use serde_json::Value;

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replaces every `$placeholder` in `input` for which `lookup` produces a
/// value. `$` not followed by a placeholder character is passed through.
pub fn substitute<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let start = idx + c.len_utf8();
        let mut end = start;
        while let Some((i, nc)) = chars.peek().copied() {
            if is_placeholder_char(nc) {
                end = i + nc.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if end == start {
            out.push('$');
            continue;
        }
        let name = &input[start..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(name);
            }
        }
    }
    out
}

/// Substitutes `$field` placeholders from a flattened item map.
pub fn substitute_params(input: &str, params: &IndexMap<String, String>) -> String {
    substitute(input, |name| params.get(name).cloned())
}

/// Substitutes placeholders from regex capture groups: named groups first,
/// then an all-digits placeholder falls back to the indexed group.
pub fn substitute_captures(input: &str, caps: &Captures<'_>) -> String {
    substitute(input, |name| {
        if let Some(m) = caps.name(name) {
            return Some(m.as_str().to_string());
        }
        if name.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(idx) = name.parse::<usize>() {
                return caps.get(idx).map(|m| m.as_str().to_string());
            }
        }
        None
    })
}

/// Selects a value inside `payload` by dotted path. An empty path returns
/// the payload itself.
pub fn select_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(payload);
    }
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Flattens the primitive fields of a JSON object to strings.
///
/// Strings, numbers and booleans are kept; nested arrays, objects and null
/// are skipped. Non-object payloads flatten to an empty map.
pub fn flatten_primitives(item: &Value) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    let Some(object) = item.as_object() else {
        return out;
    };
    for (key, value) in object {
        match value {
            Value::String(s) => {
                out.insert(key.clone(), s.clone());
            }
            Value::Number(n) => {
                out.insert(key.clone(), n.to_string());
            }
            Value::Bool(b) => {
                out.insert(key.clone(), b.to_string());
            }
            _ => {}
        }
    }
    out
}
