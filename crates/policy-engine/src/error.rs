use thiserror::Error;

/// Per-check failures. All of them end in a fail-open decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("interpreter pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("policy script failed to load: {0}")]
    ScriptLoad(String),
    #[error("check timed out: {0}")]
    CheckTimeout(String),
    #[error("policy script error: {0}")]
    ScriptRuntime(String),
}

impl CheckError {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::MalformedInput(_) => "malformed_input",
            CheckError::PoolExhausted(_) => "pool_exhausted",
            CheckError::ScriptLoad(_) => "script_load",
            CheckError::CheckTimeout(_) => "check_timeout",
            CheckError::ScriptRuntime(_) => "script_runtime",
        }
    }
}

/// Failures reported by a sandbox.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("load failed: {0}")]
    Load(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    /// Execution stopped because its deadline passed.
    #[error("execution interrupted")]
    Interrupted,
    /// The sandbox can no longer be trusted and must be discarded.
    #[error("sandbox corrupted: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no interpreter available within {waited_ms}ms")]
    Exhausted { waited_ms: u128 },
    #[error("interpreter initialization failed: {0}")]
    ScriptLoad(String),
    /// The sandbox runtime cannot create any context; fatal at startup.
    #[error("sandbox runtime unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("interpreter pool is shut down")]
    ShutDown,
}

impl From<PoolError> for CheckError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } | PoolError::ShutDown => {
                CheckError::PoolExhausted(err.to_string())
            }
            PoolError::ScriptLoad(message) | PoolError::SandboxUnavailable(message) => {
                CheckError::ScriptLoad(message)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("failed to parse policy TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported policy version: {0} (supported: 1)")]
    UnsupportedVersion(u32),
    #[error("rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
}
