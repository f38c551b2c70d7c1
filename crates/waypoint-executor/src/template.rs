//! `{{placeholder}}` references between consecutive steps.
//!
//! A step's string params may reference fields of the previous step's result
//! as `{{field}}`, `{{prev.field}}` or `{{previous.a.b}}`.

use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
        .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
});

const PREVIOUS_PREFIXES: &[&str] = &["prev.", "previous.", "result."];

/// Field paths referenced by placeholders anywhere in `params`.
#[must_use]
pub fn placeholders(params: &serde_json::Value) -> Vec<String> {
    let mut found = Vec::new();
    collect(params, &mut found);
    found.dedup();
    found
}

fn collect(value: &serde_json::Value, found: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                let path = strip_previous_prefix(&caps[1]).to_string();
                if !found.contains(&path) {
                    found.push(path);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

fn strip_previous_prefix(path: &str) -> &str {
    PREVIOUS_PREFIXES
        .iter()
        .find_map(|p| path.strip_prefix(p))
        .unwrap_or(path)
}

/// Look up a dotted field path in a JSON value.
#[must_use]
pub fn lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Substitute placeholders in `params` from `source`.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its JSON type; placeholders inside longer strings are replaced by the
/// value's text. Unresolvable placeholders are left untouched.
#[must_use]
pub fn resolve(params: &serde_json::Value, source: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::String(s) => resolve_string(s, source),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve(v, source)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, source)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, source: &serde_json::Value) -> serde_json::Value {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if caps.get(0).is_some_and(|m| m.as_str() == s.trim()) {
            if let Some(value) = lookup(source, strip_previous_prefix(&caps[1])) {
                return value.clone();
            }
        }
    }

    let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures<'_>| {
        lookup(source, strip_previous_prefix(&caps[1])).map_or_else(
            || caps[0].to_string(),
            |value| match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        )
    });
    serde_json::Value::String(replaced.into_owned())
}
