use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RaspError;
use crate::ids::AgentId;

/// Category of a security-sensitive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckType {
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "readFile")]
    ReadFile,
    #[serde(rename = "writeFile")]
    WriteFile,
    #[serde(rename = "rename")]
    Rename,
    #[serde(rename = "include")]
    Include,
    #[serde(rename = "sql")]
    Sql,
    #[serde(rename = "mongodb")]
    Mongo,
    #[serde(rename = "ssrf")]
    Ssrf,
    #[serde(rename = "xxe")]
    Xxe,
    #[serde(rename = "deserialization")]
    Deserialization,
}

impl CheckType {
    pub const ALL: [CheckType; 11] = [
        CheckType::Command,
        CheckType::Directory,
        CheckType::ReadFile,
        CheckType::WriteFile,
        CheckType::Rename,
        CheckType::Include,
        CheckType::Sql,
        CheckType::Mongo,
        CheckType::Ssrf,
        CheckType::Xxe,
        CheckType::Deserialization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Command => "command",
            CheckType::Directory => "directory",
            CheckType::ReadFile => "readFile",
            CheckType::WriteFile => "writeFile",
            CheckType::Rename => "rename",
            CheckType::Include => "include",
            CheckType::Sql => "sql",
            CheckType::Mongo => "mongodb",
            CheckType::Ssrf => "ssrf",
            CheckType::Xxe => "xxe",
            CheckType::Deserialization => "deserialization",
        }
    }

    /// Whether checks of this type carry the caller's stack.
    pub fn supports_stack(&self) -> bool {
        matches!(
            self,
            CheckType::Command
                | CheckType::Sql
                | CheckType::Ssrf
                | CheckType::Xxe
                | CheckType::Deserialization
        )
    }
}

impl FromStr for CheckType {
    type Err = RaspError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CheckType::ALL
            .iter()
            .copied()
            .find(|check_type| check_type.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| RaspError::UnknownCheckType(value.to_string()))
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One argument of an intercepted call, borrowed from the host.
///
/// Everything the builder keeps is copied out, so a `CheckParameter` never
/// outlives host-owned memory.
#[derive(Debug, Clone, Copy)]
pub enum RawArg<'a> {
    Null,
    Str(&'a str),
    Bytes(&'a [u8]),
    List(&'a [String]),
}

impl<'a> RawArg<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            RawArg::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawArg::Null)
    }
}

/// Strongly-typed fields of each check type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckKind {
    #[serde(rename = "command")]
    Command { command: String },
    #[serde(rename = "directory")]
    Directory {
        path: String,
        realpath: Option<String>,
    },
    #[serde(rename = "readFile")]
    ReadFile {
        path: String,
        realpath: Option<String>,
    },
    #[serde(rename = "writeFile")]
    WriteFile {
        path: String,
        realpath: Option<String>,
    },
    #[serde(rename = "rename")]
    Rename { source: String, dest: String },
    #[serde(rename = "include")]
    Include {
        path: String,
        realpath: Option<String>,
    },
    #[serde(rename = "sql")]
    Sql { server: String, query: String },
    #[serde(rename = "mongodb")]
    Mongo {
        server: String,
        query: String,
        class_name: String,
        method: String,
    },
    #[serde(rename = "ssrf")]
    Ssrf { url: String, hostname: String },
    #[serde(rename = "xxe")]
    Xxe { entity: String },
    #[serde(rename = "deserialization")]
    Deserialization { class_name: String },
}

impl CheckKind {
    pub fn check_type(&self) -> CheckType {
        match self {
            CheckKind::Command { .. } => CheckType::Command,
            CheckKind::Directory { .. } => CheckType::Directory,
            CheckKind::ReadFile { .. } => CheckType::ReadFile,
            CheckKind::WriteFile { .. } => CheckType::WriteFile,
            CheckKind::Rename { .. } => CheckType::Rename,
            CheckKind::Include { .. } => CheckType::Include,
            CheckKind::Sql { .. } => CheckType::Sql,
            CheckKind::Mongo { .. } => CheckType::Mongo,
            CheckKind::Ssrf { .. } => CheckType::Ssrf,
            CheckKind::Xxe { .. } => CheckType::Xxe,
            CheckKind::Deserialization { .. } => CheckType::Deserialization,
        }
    }

    /// Fields that identify the operation, in a fixed order.
    ///
    /// Derived values such as `realpath` are left out: they describe the
    /// environment at call time rather than the requested operation.
    pub fn salient_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            CheckKind::Command { command } => vec![("command", command.as_str())],
            CheckKind::Directory { path, .. }
            | CheckKind::ReadFile { path, .. }
            | CheckKind::WriteFile { path, .. }
            | CheckKind::Include { path, .. } => vec![("path", path.as_str())],
            CheckKind::Rename { source, dest } => vec![("source", source.as_str()), ("dest", dest.as_str())],
            CheckKind::Sql { server, query } => vec![("server", server.as_str()), ("query", query.as_str())],
            CheckKind::Mongo {
                server,
                query,
                class_name,
                method,
            } => vec![
                ("server", server.as_str()),
                ("query", query.as_str()),
                ("class_name", class_name.as_str()),
                ("method", method.as_str()),
            ],
            CheckKind::Ssrf { url, .. } => vec![("url", url.as_str())],
            CheckKind::Xxe { entity } => vec![("entity", entity.as_str())],
            CheckKind::Deserialization { class_name } => vec![("class_name", class_name.as_str())],
        }
    }
}

/// Normalized parameters of one intercepted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckParameter {
    #[serde(flatten)]
    pub kind: CheckKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

impl CheckParameter {
    pub fn new(kind: CheckKind) -> Self {
        Self {
            kind,
            stack: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn check_type(&self) -> CheckType {
        self.kind.check_type()
    }

    /// Renders the parameter as the object handed to a policy script.
    pub fn to_value(&self) -> Value {
        let mut fields = match serde_json::to_value(&self.kind) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.remove("type");
        fields.retain(|_, value| !value.is_null());
        if self.check_type().supports_stack() {
            fields.insert("stack".to_string(), json!(self.stack));
        }
        Value::Object(fields)
    }
}

/// Identity attached to every telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub host_name: String,
    pub agent_id: AgentId,
    pub app_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_type_parse_and_display() {
        assert_eq!("command".parse::<CheckType>().unwrap(), CheckType::Command);
        assert_eq!("readFile".parse::<CheckType>().unwrap(), CheckType::ReadFile);
        assert_eq!("READFILE".parse::<CheckType>().unwrap(), CheckType::ReadFile);
        assert_eq!(CheckType::Mongo.to_string(), "mongodb");
        assert_eq!(
            "exec".parse::<CheckType>(),
            Err(RaspError::UnknownCheckType("exec".to_string()))
        );
    }

    #[test]
    fn test_command_value_includes_stack() {
        let param = CheckParameter::new(CheckKind::Command {
            command: "/bin/sh -c id".to_string(),
        })
        .with_stack(vec!["frame_a".to_string()]);

        let value = param.to_value();
        assert_eq!(value["command"], "/bin/sh -c id");
        assert_eq!(value["stack"][0], "frame_a");
        assert!(value.get("type").is_none());
    }

    #[test]
    fn test_file_value_skips_stack_and_missing_realpath() {
        let param = CheckParameter::new(CheckKind::ReadFile {
            path: "/etc/passwd".to_string(),
            realpath: None,
        });

        let value = param.to_value();
        assert_eq!(value["path"], "/etc/passwd");
        assert!(value.get("realpath").is_none());
        assert!(value.get("stack").is_none());
    }

    #[test]
    fn test_mongo_fields_use_snake_case() {
        let param = CheckParameter::new(CheckKind::Mongo {
            server: "mongo:27017".to_string(),
            query: "{\"$where\": \"1\"}".to_string(),
            class_name: "MongoCollection".to_string(),
            method: "find".to_string(),
        });
        let value = param.to_value();
        assert_eq!(value["class_name"], "MongoCollection");
        assert_eq!(value["method"], "find");
    }

    #[test]
    fn test_parameter_serializes_with_type_tag() {
        let param = CheckParameter::new(CheckKind::Xxe {
            entity: "file:///etc/passwd".to_string(),
        });
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json["type"], "xxe");
        let back: CheckParameter = serde_json::from_value(json).unwrap();
        assert_eq!(back, param);
    }
}
