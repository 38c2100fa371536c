use std::path::PathBuf;
use thiserror::Error;

/// Error enum for policy evaluation.
///
/// None of these reach a filesystem caller: the adapter turns every one of
/// them into an undecided (hidden) entry and logs it. Timeouts are not
/// errors either; they become `Decision::Undecided`.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to launch policy engine '{command}': {source}")]
    EngineLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("policy engine failed: {0}")]
    EngineFailed(String),

    #[error("malformed decision document: {0}")]
    MalformedDecision(String),

    #[error("policy document {} unreadable: {source}", path.display())]
    SidecarUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        PolicyError::SerializationError(e.to_string())
    }
}

impl From<veil_core::CoreError> for PolicyError {
    fn from(e: veil_core::CoreError) -> Self {
        PolicyError::SerializationError(e.to_string())
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
