use serde_json::Value;

use crate::error::ScriptError;
use crate::rules::script::RuleScript;
use crate::runtime::{Deadline, PolicyScript, Sandbox, SandboxFactory};

/// Sandbox backed by a compiled [`RuleScript`].
///
/// Each instance owns its compiled copy; nothing is shared between
/// contexts, so a reload in one cannot be observed by another mid-check.
#[derive(Debug, Default)]
pub struct RuleSandbox {
    script: Option<RuleScript>,
}

impl Sandbox for RuleSandbox {
    fn load(&mut self, script: &PolicyScript) -> Result<(), ScriptError> {
        let compiled = RuleScript::compile(&script.source)
            .map_err(|e| ScriptError::Load(format!("{}: {e}", script.name)))?;
        tracing::debug!(
            policy_id = %compiled.id,
            rules = compiled.rules.len(),
            digest = %script.digest,
            "rule script loaded"
        );
        self.script = Some(compiled);
        Ok(())
    }

    fn invoke(&mut self, entry: &str, input: &Value, deadline: &Deadline) -> Result<Value, ScriptError> {
        let script = self
            .script
            .as_ref()
            .ok_or_else(|| ScriptError::Runtime("no policy script loaded".to_string()))?;
        let verdicts = script.evaluate(entry, input, deadline)?;
        serde_json::to_value(verdicts).map_err(|e| ScriptError::Runtime(e.to_string()))
    }

    fn policy_id(&self) -> &str {
        self.script.as_ref().map(|script| script.id.as_str()).unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleSandboxFactory;

impl SandboxFactory for RuleSandboxFactory {
    fn create(&self) -> Result<Box<dyn Sandbox>, ScriptError> {
        Ok(Box::new(RuleSandbox::default()))
    }
}
