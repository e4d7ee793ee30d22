use std::path::Path;

use serde_json::Value;

pub fn redact_path(path: &Path) -> String {
    redact_home(&path.display().to_string())
}

/// Replaces the current user's home directory with `~`.
pub fn redact_home(text: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if home.len() > 1 => text.replace(&home, "~"),
        _ => text.to_string(),
    }
}

/// Applies [`redact_home`] to every string inside a JSON value.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_home(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), redact_value(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}
