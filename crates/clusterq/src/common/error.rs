use thiserror::Error;

use crate::common::error::ClusterqError::GenericError;

#[derive(Debug, Error)]
pub enum ClusterqError {
    /// The caller violated a construction contract (e.g. a job with both a tool and a script).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Transport error: {0}")]
    TransportError(String),
    /// The selected backend does not provide the requested capability.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for ClusterqError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<toml::de::Error> for ClusterqError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<derive_builder::UninitializedFieldError> for ClusterqError {
    fn from(error: derive_builder::UninitializedFieldError) -> Self {
        Self::ConfigurationError(error.to_string())
    }
}

impl From<String> for ClusterqError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn configuration_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(ClusterqError::ConfigurationError(message.into()))
}

pub fn unsupported<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(ClusterqError::UnsupportedOperation(message.into()))
}
