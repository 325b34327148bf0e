//! Error types for Luna

use thiserror::Error;

/// Error type for registry, balancer and gateway operations
#[derive(Error, Debug)]
pub enum LunaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate instance: {0}")]
    DuplicateInstance(String),

    #[error("Not registered: {0}")]
    NotRegistered(String),

    #[error("No instances: {0}")]
    NoInstances(String),

    #[error("Config structure error: {0}")]
    ConfigStructure(String),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for Luna operations
pub type LunaResult<T> = Result<T, LunaError>;

impl From<std::io::Error> for LunaError {
    fn from(err: std::io::Error) -> Self {
        LunaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LunaError {
    fn from(err: serde_json::Error) -> Self {
        LunaError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for LunaError {
    fn from(err: reqwest::Error) -> Self {
        LunaError::Proxy(err.to_string())
    }
}
