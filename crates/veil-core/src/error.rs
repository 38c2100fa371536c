use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
