use thiserror::Error;

/// Failure classes of the data facade.
///
/// Only `Validation` is meant to reach the user. Transport and serialization
/// failures are absorbed at the repository boundary and turned into a local
/// fallback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FacadeError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
}

impl FacadeError {
    pub fn transport(message: impl Into<String>) -> Self {
        FacadeError::Transport(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        FacadeError::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        FacadeError::Validation {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FacadeError::Transport(_) => "transport",
            FacadeError::Serialization(_) => "serialization",
            FacadeError::Validation { .. } => "validation",
        }
    }
}
