//! `${...}` placeholder resolution over parameter trees.
//!
//! A step's parameters are an arbitrarily nested JSON tree. String leaves
//! that consist *entirely* of a `${name}` or `${name.field[.field...]}`
//! placeholder are substituted from the execution context; everything else
//! passes through untouched. Partial interpolation inside a longer string is
//! deliberately unsupported -- upgrading to it would change matching
//! semantics for existing templates.
//!
//! Unresolvable placeholders (missing root, dotted path dead-ending in a
//! non-object, absent key) are returned verbatim rather than erroring, so a
//! step can carry forward a reference that a later run context may satisfy.

use serde_json::{Map, Value};

/// Resolve every placeholder in a parameter tree against a context mapping.
///
/// Dicts and lists are walked recursively; non-string leaves (numbers,
/// booleans, null) pass through unchanged. Substituting with the looked-up
/// value directly means a placeholder may expand to any JSON type, not just
/// a string.
pub fn resolve_params(params: &Value, context: &Map<String, Value>) -> Value {
    match params {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_params(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), resolve_params(value, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a single string leaf.
///
/// Only a whole-string match is treated as a placeholder; anything else
/// (including embedded `${...}` fragments) is returned as-is.
fn resolve_string(s: &str, context: &Map<String, Value>) -> Value {
    let Some(segments) = parse_placeholder(s) else {
        return Value::String(s.to_string());
    };

    match lookup_path(&segments, context) {
        Some(value) => value.clone(),
        None => Value::String(s.to_string()),
    }
}

/// Parse `${name}` / `${name.field.field}` into path segments.
///
/// Returns `None` unless the *entire* string is one well-formed placeholder
/// with non-empty identifier segments.
fn parse_placeholder(s: &str) -> Option<Vec<&str>> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() {
        return None;
    }

    let segments: Vec<&str> = inner.split('.').collect();
    for segment in &segments {
        if segment.is_empty() || !segment.chars().all(is_identifier_char) {
            return None;
        }
    }
    Some(segments)
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// Walk a dotted path: the first segment is looked up in the context, the
/// rest descend into nested objects. Any miss yields `None`.
fn lookup_path<'a>(segments: &[&str], context: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut current = context.get(segments[0])?;
    for segment in &segments[1..] {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
