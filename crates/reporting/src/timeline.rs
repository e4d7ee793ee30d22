use serde_json::Value;

use crate::redact::redact_value;
use crate::ReportEvent;

/// One line per check: sequence, action, type, parameters and findings.
pub fn timeline(events: &[ReportEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            let mut line = format!(
                "#{:<4} {:<5} {:<15} {}",
                event.sequence,
                event.decision.action.as_str(),
                event.check_type.as_str(),
                summarize_params(&redact_value(&event.params)),
            );
            if let Some(rule) = &event.decision.rule_name {
                line.push_str(&format!(" [{rule}]"));
            }
            for message in &event.decision.messages {
                line.push_str(&format!(" - {message}"));
            }
            if let Some(diagnostic) = &event.decision.diagnostic {
                line.push_str(&format!(" (fail-open: {diagnostic})"));
            }
            line
        })
        .collect()
}

fn summarize_params(params: &Value) -> String {
    match params.as_object() {
        Some(fields) => fields
            .iter()
            .filter(|(name, _)| name.as_str() != "stack")
            .map(|(name, value)| match value {
                Value::String(text) => format!("{name}={text}"),
                other => format!("{name}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => params.to_string(),
    }
}
