//! Placeholder interpolation
//!
//! `{path}` tokens in action configs and condition values are substituted
//! from the StateObject. A path is `attr`, `previous.attr`, or
//! `alias.attr`; a bare name resolves to the triggering attribute first and
//! falls back to a configured alias's address. Substituted text is never
//! re-scanned.

use std::sync::OnceLock;

use dashmap::DashSet;
use thiserror::Error;
use tracing::warn;

use sb_core::{AttrValue, StateObject};

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("unresolvable placeholder '{{{0}}}'")]
    Unresolved(String),
}

/// Resolve one placeholder path against the state object.
pub fn resolve_path(path: &str, state: &StateObject) -> Option<AttrValue> {
    if let Some(rest) = path.strip_prefix("previous.") {
        return state.previous_attribute(rest).cloned();
    }

    if let Some((head, rest)) = path.split_once('.') {
        if state.has_alias(head) {
            return state.alias_attribute(head, rest);
        }
        // Dotted keys that are not alias references may still name an
        // attribute verbatim (MQTT payload keys can contain dots).
        return state.attribute(path).cloned();
    }

    // Triggering attribute takes precedence over an alias of the same name.
    if let Some(value) = state.attribute(path) {
        return Some(value.clone());
    }
    state
        .alias_id(path)
        .map(|address| AttrValue::Str(address.to_string()))
}

/// Format a template, failing on the first unresolvable placeholder.
///
/// Used for condition right-hand sides, where an unresolvable reference
/// makes the whole condition false.
pub fn try_format(template: &str, state: &StateObject) -> Result<String, FormatError> {
    render(template, state, &mut |path| {
        Err(FormatError::Unresolved(path.to_string()))
    })
}

/// Format a template, replacing unresolvable placeholders with the empty
/// string. One warning is logged per distinct path.
pub fn format_str(template: &str, state: &StateObject) -> String {
    render(template, state, &mut |path| {
        warn_once(path);
        Ok(String::new())
    })
    .unwrap_or_default()
}

/// Recursively format every string leaf of a structured payload.
///
/// Map keys are left untouched; only values are formatted.
pub fn format_json(value: &serde_json::Value, state: &StateObject) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(format_str(s, state)),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), format_json(v, state)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| format_json(v, state)).collect())
        }
        other => other.clone(),
    }
}

fn render(
    template: &str,
    state: &StateObject,
    on_missing: &mut dyn FnMut(&str) -> Result<String, FormatError>,
) -> Result<String, FormatError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                match resolve_path(path, state) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => out.push_str(&on_missing(path)?),
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unmatched brace: keep the remainder literally.
                out.push_str(&rest[start..]);
                return Ok(out);
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn warn_once(path: &str) {
    static WARNED: OnceLock<DashSet<String>> = OnceLock::new();
    let warned = WARNED.get_or_init(DashSet::new);
    if warned.insert(path.to_string()) {
        warn!(placeholder = path, "Unresolvable placeholder, substituting empty string");
    }
}
