//! Rule script parsing, validation and evaluation.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use rasp_core::types::CheckType;

use crate::decision::{Action, Verdict};
use crate::error::{PolicyLoadError, ScriptError};
use crate::rules::pattern::Pattern;
use crate::runtime::Deadline;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleScriptFile {
    id: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    name: String,
    on: String,
    action: Action,
    #[serde(default)]
    message: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    when: Vec<ConditionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionSpec {
    field: String,
    matches: Option<String>,
    contains: Option<String>,
    equals: Option<String>,
    #[serde(default)]
    negate: bool,
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Any,
    Type(CheckType),
}

impl RuleTarget {
    fn applies_to(&self, entry: &str) -> bool {
        match self {
            RuleTarget::Any => true,
            RuleTarget::Type(check_type) => check_type.as_str() == entry,
        }
    }
}

#[derive(Debug, Clone)]
enum Operation {
    Matches(Pattern),
    Contains(String),
    Equals(String),
}

#[derive(Debug, Clone)]
struct Condition {
    path: Vec<String>,
    operation: Operation,
    negate: bool,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub target: RuleTarget,
    pub action: Action,
    pub message: String,
    conditions: Vec<Condition>,
}

/// A compiled rule script.
#[derive(Debug, Clone)]
pub struct RuleScript {
    pub id: String,
    pub rules: Vec<Rule>,
}

impl RuleScript {
    pub fn compile(source: &str) -> Result<Self, PolicyLoadError> {
        let file: RuleScriptFile = toml::from_str(source)?;
        if file.version != SUPPORTED_VERSION {
            return Err(PolicyLoadError::UnsupportedVersion(file.version));
        }

        let mut names = HashSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());
        for spec in file.rules {
            if !names.insert(spec.name.clone()) {
                return Err(invalid(&spec.name, "duplicate rule name"));
            }
            if spec.enabled {
                rules.push(compile_rule(spec)?);
            }
        }

        Ok(Self { id: file.id, rules })
    }

    /// Runs every rule registered for `entry` and collects the findings.
    pub fn evaluate(&self, entry: &str, input: &Value, deadline: &Deadline) -> Result<Vec<Verdict>, ScriptError> {
        if !input.is_object() {
            return Err(ScriptError::Runtime(format!(
                "entry '{entry}' expects an object argument"
            )));
        }

        let mut verdicts = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.target.applies_to(entry)) {
            if deadline.expired() {
                return Err(ScriptError::Interrupted);
            }
            if rule.conditions.iter().all(|condition| condition.holds(input)) {
                verdicts.push(Verdict {
                    action: rule.action,
                    message: render_message(&rule.message, input),
                    name: Some(rule.name.clone()),
                    policy_id: Some(self.id.clone()),
                });
            }
        }
        Ok(verdicts)
    }

    pub fn rules_for(&self, check_type: CheckType) -> usize {
        self.rules
            .iter()
            .filter(|rule| rule.target.applies_to(check_type.as_str()))
            .count()
    }
}

fn compile_rule(spec: RuleSpec) -> Result<Rule, PolicyLoadError> {
    if spec.name.trim().is_empty() {
        return Err(invalid("<unnamed>", "rule name must not be empty"));
    }
    let target = if spec.on == "*" {
        RuleTarget::Any
    } else {
        RuleTarget::Type(
            spec.on
                .parse::<CheckType>()
                .map_err(|err| invalid(&spec.name, &err.to_string()))?,
        )
    };

    let mut conditions = Vec::with_capacity(spec.when.len());
    for condition in spec.when {
        conditions.push(compile_condition(&spec.name, condition)?);
    }

    Ok(Rule {
        name: spec.name,
        target,
        action: spec.action,
        message: spec.message,
        conditions,
    })
}

fn compile_condition(rule: &str, spec: ConditionSpec) -> Result<Condition, PolicyLoadError> {
    let path: Vec<String> = spec.field.split('.').map(str::to_string).collect();
    if path.iter().any(|segment| segment.is_empty()) {
        return Err(invalid(rule, &format!("invalid field '{}'", spec.field)));
    }

    let operation = match (spec.matches, spec.contains, spec.equals) {
        (Some(pattern), None, None) => Operation::Matches(Pattern::compile(&pattern)?),
        (None, Some(needle), None) => Operation::Contains(needle),
        (None, None, Some(expected)) => Operation::Equals(expected),
        _ => {
            return Err(invalid(
                rule,
                "each condition needs exactly one of matches, contains, equals",
            ))
        }
    };

    Ok(Condition {
        path,
        operation,
        negate: spec.negate,
    })
}

fn invalid(rule: &str, reason: &str) -> PolicyLoadError {
    PolicyLoadError::InvalidRule {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

impl Condition {
    /// Array fields hold when any element does; missing fields never match.
    fn holds(&self, input: &Value) -> bool {
        let matched = match lookup(input, &self.path) {
            Some(Value::Array(items)) => items.iter().any(|item| self.matches_scalar(item)),
            Some(value) => self.matches_scalar(value),
            None => false,
        };
        matched != self.negate
    }

    fn matches_scalar(&self, value: &Value) -> bool {
        let text = match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => return false,
        };
        match &self.operation {
            Operation::Matches(pattern) => pattern.matches(&text),
            Operation::Contains(needle) => text.contains(needle.as_str()),
            Operation::Equals(expected) => text == *expected,
        }
    }
}

fn lookup<'a>(input: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(input, |value, segment| value.get(segment.as_str()))
        .filter(|value| !value.is_null())
}

/// Substitutes `{field}` placeholders with top-level string fields.
///
/// Single pass over the template: substituted values are never rescanned,
/// and unknown placeholders are left as written.
fn render_message(template: &str, input: &Value) -> String {
    let mut message = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        message.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };
        let name = &after[..close];
        match input.get(name) {
            Some(Value::String(text)) => message.push_str(text),
            _ => {
                message.push('{');
                message.push_str(name);
                message.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    message.push_str(rest);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const SCRIPT: &str = r#"
id = "test-policy"
version = 1

[[rules]]
name = "shell_exec"
on = "command"
action = "block"
message = "shell command execution detected"
when = [
  { field = "command", matches = 'regex:(?:^|/)(?:ba|z|da|k)?sh\s+-c(?:\s|$)' },
]

[[rules]]
name = "reflected_exec"
on = "command"
action = "log"
message = "command spawned via reflection: {command}"
when = [
  { field = "stack", matches = "*reflect*" },
]

[[rules]]
name = "ssh_keys"
on = "readFile"
action = "block"
message = "reading ssh material"
when = [
  { field = "path", contains = "/.ssh/" },
]

[[rules]]
name = "disabled_rule"
on = "*"
action = "block"
enabled = false
"#;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn test_compile_skips_disabled_rules() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        assert_eq!(script.id, "test-policy");
        assert_eq!(script.rules.len(), 3);
        assert_eq!(script.rules_for(CheckType::Command), 2);
        assert_eq!(script.rules_for(CheckType::Sql), 0);
    }

    #[test]
    fn test_shell_rule_blocks() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        let input = json!({ "command": "/bin/sh -c id", "stack": [] });
        let verdicts = script.evaluate("command", &input, &deadline()).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].action, Action::Block);
        assert_eq!(verdicts[0].message, "shell command execution detected");
        assert_eq!(verdicts[0].name.as_deref(), Some("shell_exec"));
        assert_eq!(verdicts[0].policy_id.as_deref(), Some("test-policy"));
    }

    #[test]
    fn test_array_field_matches_any_element() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        let input = json!({
            "command": "whoami",
            "stack": ["app.Main.run", "java.lang.reflect.Method.invoke"],
        });
        let verdicts = script.evaluate("command", &input, &deadline()).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].message, "command spawned via reflection: whoami");
    }

    #[test]
    fn test_entry_selects_rules() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        let input = json!({ "path": "/home/app/.ssh/id_rsa" });
        assert_eq!(script.evaluate("readFile", &input, &deadline()).unwrap().len(), 1);
        assert!(script.evaluate("writeFile", &input, &deadline()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_field_does_not_match_unless_negated() {
        let source = r#"
id = "p"
[[rules]]
name = "no_realpath"
on = "readFile"
action = "log"
when = [{ field = "realpath", equals = "/etc/passwd", negate = true }]
"#;
        let script = RuleScript::compile(source).unwrap();
        let verdicts = script
            .evaluate("readFile", &json!({ "path": "x" }), &deadline())
            .unwrap();
        assert_eq!(verdicts.len(), 1);
    }

    #[test]
    fn test_nested_field_lookup() {
        let source = r#"
id = "p"
[[rules]]
name = "nested"
on = "*"
action = "log"
when = [{ field = "meta.origin", equals = "upload" }]
"#;
        let script = RuleScript::compile(source).unwrap();
        let input = json!({ "meta": { "origin": "upload" } });
        assert_eq!(script.evaluate("sql", &input, &deadline()).unwrap().len(), 1);
    }

    #[test]
    fn test_expired_deadline_interrupts() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        let expired = Deadline::after(Duration::ZERO);
        let err = script
            .evaluate("command", &json!({ "command": "id" }), &expired)
            .unwrap_err();
        assert_eq!(err, ScriptError::Interrupted);
    }

    #[test]
    fn test_non_object_input_is_runtime_error() {
        let script = RuleScript::compile(SCRIPT).unwrap();
        let err = script.evaluate("command", &json!("id"), &deadline()).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
    }

    #[test]
    fn test_rejects_bad_scripts() {
        let wrong_version = "id = \"p\"\nversion = 2\n";
        assert!(matches!(
            RuleScript::compile(wrong_version),
            Err(PolicyLoadError::UnsupportedVersion(2))
        ));

        let unknown_type = "id = \"p\"\n[[rules]]\nname = \"r\"\non = \"exec\"\naction = \"block\"\n";
        assert!(matches!(
            RuleScript::compile(unknown_type),
            Err(PolicyLoadError::InvalidRule { .. })
        ));

        let two_ops = r#"
id = "p"
[[rules]]
name = "r"
on = "sql"
action = "log"
when = [{ field = "query", contains = "a", equals = "b" }]
"#;
        assert!(matches!(
            RuleScript::compile(two_ops),
            Err(PolicyLoadError::InvalidRule { .. })
        ));

        let duplicate = "id = \"p\"\n[[rules]]\nname = \"r\"\non = \"sql\"\naction = \"log\"\n[[rules]]\nname = \"r\"\non = \"sql\"\naction = \"log\"\n";
        assert!(RuleScript::compile(duplicate).is_err());

        assert!(matches!(
            RuleScript::compile("not toml ["),
            Err(PolicyLoadError::Toml(_))
        ));
    }

    #[test]
    fn test_render_message_does_not_expand_field_values() {
        let input = json!({ "source": "/etc/shadow", "dest": "{source}" });
        assert_eq!(
            render_message("moving {source} to {dest}", &input),
            "moving /etc/shadow to {source}"
        );
        assert_eq!(render_message("{missing} {dest", &input), "{missing} {dest");
    }
}
