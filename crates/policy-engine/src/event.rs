use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use rasp_core::ids::{AgentId, EventId};
use rasp_core::types::{AgentMetadata, CheckParameter, CheckType};

use crate::decision::{Action, Decision};

/// Structured record of one finished check, shaped for the telemetry backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: EventId,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    pub check_type: CheckType,
    pub params: Value,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
    pub host_name: String,
    pub agent_id: AgentId,
    pub app_id: String,
}

impl TelemetryEvent {
    pub fn from_decision(
        param: &CheckParameter,
        decision: &Decision,
        cache_hit: bool,
        agent: &AgentMetadata,
    ) -> Self {
        let mut params = param.to_value();
        if let Value::Object(fields) = &mut params {
            fields.remove("stack");
        }
        Self {
            event_id: EventId::new(),
            timestamp: now_millis(),
            check_type: param.check_type(),
            params,
            action: decision.action,
            policy_id: decision.policy_id.clone(),
            rule_name: decision.rule_name.clone(),
            messages: decision.messages.clone(),
            diagnostic: decision.diagnostic.clone(),
            cache_hit,
            stack: param.stack.clone(),
            host_name: agent.host_name.clone(),
            agent_id: agent.agent_id,
            app_id: agent.app_id.clone(),
        }
    }

    /// Event for a check that failed before parameters could be built.
    pub fn malformed(check_type: CheckType, decision: &Decision, agent: &AgentMetadata) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: now_millis(),
            check_type,
            params: Value::Object(Default::default()),
            action: decision.action,
            policy_id: None,
            rule_name: None,
            messages: Vec::new(),
            diagnostic: decision.diagnostic.clone(),
            cache_hit: false,
            stack: Vec::new(),
            host_name: agent.host_name.clone(),
            agent_id: agent.agent_id,
            app_id: agent.app_id.clone(),
        }
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Fire-and-forget delivery of telemetry events.
///
/// Implementations must return promptly and must not panic; delivery
/// failures are theirs to log.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: TelemetryEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasp_core::types::CheckKind;

    fn agent() -> AgentMetadata {
        AgentMetadata {
            host_name: "web-1".to_string(),
            agent_id: AgentId::new(),
            app_id: "shop".to_string(),
        }
    }

    #[test]
    fn test_event_splits_stack_from_params() {
        let param = CheckParameter::new(CheckKind::Command {
            command: "id".to_string(),
        })
        .with_stack(vec!["Main.run".to_string()]);
        let decision = Decision::fail_open("pool_exhausted: busy");
        let event = TelemetryEvent::from_decision(&param, &decision, false, &agent());

        assert_eq!(event.params["command"], "id");
        assert!(event.params.get("stack").is_none());
        assert_eq!(event.stack, vec!["Main.run"]);
        assert_eq!(event.diagnostic.as_deref(), Some("pool_exhausted: busy"));
    }

    #[test]
    fn test_event_serializes_timestamp_field() {
        let param = CheckParameter::new(CheckKind::Xxe {
            entity: "file:///etc/passwd".to_string(),
        });
        let event = TelemetryEvent::from_decision(&param, &Decision::allow(), true, &agent());
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["@timestamp"].as_i64().unwrap() > 1_600_000_000_000);
        assert_eq!(json["check_type"], "xxe");
        assert_eq!(json["action"], "allow");
        assert_eq!(json["host_name"], "web-1");
        assert!(json.get("policy_id").is_none());

        let back: TelemetryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
