//! `${namespace.field}` references and `{key}` placeholders.

use flowx_types::{Chunk, FlowError, Result};
use serde_json::{Map, Value};

/// Inner token of a value that is entirely `${...}`, with no whitespace
/// inside. Anything else is plain text.
pub fn extract_reference(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.chars().any(char::is_whitespace) {
        return None;
    }
    Some(inner)
}

/// A decoded reference token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference<'a> {
    pub namespace: &'a str,
    pub field: Option<&'a str>,
}

impl<'a> Reference<'a> {
    /// The field part, required whenever the reference is resolved.
    pub fn field(&self) -> Result<&'a str> {
        self.field.ok_or_else(|| {
            FlowError::config(format!("reference `${{{}}}` names no field", self.namespace))
        })
    }
}

/// Split a token on its first `.`.
pub fn decompose(token: &str) -> Reference<'_> {
    match token.split_once('.') {
        Some((namespace, field)) => Reference {
            namespace,
            field: Some(field),
        },
        None => Reference {
            namespace: token,
            field: None,
        },
    }
}

/// [`extract_reference`] followed by [`decompose`].
pub fn parse_reference(raw: &str) -> Option<Reference<'_>> {
    extract_reference(raw).map(decompose)
}

/// Text form of a resolved value when it is spliced into a prompt.
///
/// Strings are used as-is, chunk lists contribute their contents separated
/// by blank lines, null is empty, anything else is compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) if !items.is_empty() => match Chunk::list_from_value(value) {
            Some(chunks) => chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Replace every `{key}` whose key appears in `inputs` or `entry` (inputs
/// win). Replacement is a single left-to-right pass: inserted text is never
/// scanned again. `{{ ... }}` regions are copied through untouched.
pub fn substitute_placeholders(
    text: &str,
    inputs: &Map<String, Value>,
    entry: &Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        if tail.starts_with("{{") {
            let end = tail.find("}}").map(|i| i + 2).unwrap_or(tail.len());
            out.push_str(&tail[..end]);
            rest = &tail[end..];
            continue;
        }

        let key_end = tail[1..].find(|c: char| c == '}' || c == '{' || c.is_whitespace());
        match key_end {
            Some(i) if tail[1..].as_bytes()[i] == b'}' && i > 0 => {
                let key = &tail[1..=i];
                match inputs.get(key).or_else(|| entry.get(key)) {
                    Some(value) => out.push_str(&render_value(value)),
                    None => out.push_str(&tail[..i + 2]),
                }
                rest = &tail[i + 2..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
