//! Error taxonomy shared by every component.
//!
//! Component failures never cross the request boundary as faults: each one
//! is converted into a [`ResponseEnvelope`](crate::envelope::ResponseEnvelope)
//! carrying a 500 status and the error's display text.

use std::io;

/// Errors produced by the service components.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Missing or malformed request parameters.
    #[error("{0}")]
    Validation(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Directory does not exist: {0}")]
    DirectoryNotFound(String),

    #[error("script not found for action: {0}")]
    ScriptNotFound(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("Command is running")]
    AlreadyRunning,

    #[error("Unsupported operating system")]
    UnsupportedOs,

    #[error("path escapes sandbox: {0}")]
    SandboxEscape(String),

    #[error("Server busy, maximum users reached.")]
    Busy,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wrap an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
