use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Enforcement recommendation, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Log,
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Log => "log",
            Action::Block => "block",
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "allow" | "ignore" => Ok(Action::Allow),
            "log" => Ok(Action::Log),
            "block" => Ok(Action::Block),
            _ => Err(format!("unknown action: {value}")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One finding reported by a policy script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

/// Final outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    /// Set only when the engine failed and allowed the operation by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
            messages: Vec::new(),
            policy_id: None,
            rule_name: None,
            diagnostic: None,
        }
    }

    pub fn fail_open(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: Some(diagnostic.into()),
            ..Self::allow()
        }
    }

    /// Merges verdicts; the most severe action wins and names the rule.
    ///
    /// Messages of every non-allow verdict are kept in emission order.
    pub fn from_verdicts(verdicts: &[Verdict], default_policy_id: &str) -> Self {
        let action = verdicts
            .iter()
            .map(|verdict| verdict.action)
            .max()
            .unwrap_or(Action::Allow);
        if action == Action::Allow {
            return Self::allow();
        }

        let winner = verdicts.iter().find(|verdict| verdict.action == action);
        let messages = verdicts
            .iter()
            .filter(|verdict| verdict.action != Action::Allow && !verdict.message.is_empty())
            .map(|verdict| verdict.message.clone())
            .collect();

        Self {
            action,
            messages,
            policy_id: Some(
                winner
                    .and_then(|verdict| verdict.policy_id.clone())
                    .unwrap_or_else(|| default_policy_id.to_string()),
            ),
            rule_name: winner.and_then(|verdict| verdict.name.clone()),
            diagnostic: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.action == Action::Block
    }

    pub fn is_fail_open(&self) -> bool {
        self.diagnostic.is_some()
    }
}
