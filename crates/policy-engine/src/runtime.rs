//! Capability boundary between the engine and the embedded script runtime.
//!
//! The pool and engine only see these traits, so the scripting technology
//! behind a [`Sandbox`] can be swapped without touching either.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ScriptError;

/// Operator-supplied policy source plus a content digest for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyScript {
    pub name: String,
    pub source: String,
    pub digest: String,
}

impl PolicyScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        Self {
            name: name.into(),
            source,
            digest,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("read policy script {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), source))
    }
}

/// Wall-clock bound for one script execution.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

/// One isolated script execution environment.
pub trait Sandbox: Send {
    /// Loads (or replaces) the policy script.
    fn load(&mut self, script: &PolicyScript) -> Result<(), ScriptError>;

    /// Calls `entry` with `input` and returns the raw result.
    ///
    /// Implementations should poll `deadline` and return
    /// [`ScriptError::Interrupted`] once it has passed.
    fn invoke(&mut self, entry: &str, input: &Value, deadline: &Deadline) -> Result<Value, ScriptError>;

    /// Identifier of the loaded policy, used when a verdict names none.
    fn policy_id(&self) -> &str;

    /// False once the environment can no longer be reused.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Creates fresh sandboxes for the interpreter pool.
pub trait SandboxFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Sandbox>, ScriptError>;
}
