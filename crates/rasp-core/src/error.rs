use thiserror::Error;

/// Failures raised while reading agent settings or host-supplied names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaspError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown check type: {0}")]
    UnknownCheckType(String),
}
