use std::path::PathBuf;
use thiserror::Error;

/// Error type for key handling, token signing and token verification.
///
/// Verification failures are deliberately coarse (`SignatureInvalid`
/// carries no detail) so a caller probing tokens learns nothing about
/// which check failed beyond the category.
#[derive(Debug, Error)]
pub enum CredError {
    #[error("key file for issuer '{issuer}' not found: {}", path.display())]
    KeyFileMissing { issuer: String, path: PathBuf },

    #[error("key file for issuer '{issuer}' unreadable: {}: {source}", path.display())]
    KeyFileUnreadable {
        issuer: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    #[error("public key does not match private key")]
    KeyMismatch,

    #[error("new keypair failed its sign/verify self-test")]
    KeygenSelfTestFailed,

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("signing failed")]
    SigningFailed,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("signature algorithm not allowed: {0}")]
    AlgorithmNotAllowed(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("token expired at {exp} (now {now})")]
    TokenExpired { exp: i64, now: i64 },

    #[error("token not valid before {nbf} (now {now})")]
    TokenNotYetValid { nbf: i64, now: i64 },

    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    #[error("invalid issuer name: {0:?}")]
    InvalidIssuerName(String),
}

impl CredError {
    /// True for failures caused by the presented token rather than by local
    /// key material or I/O.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CredError::AlgorithmNotAllowed(_)
                | CredError::SignatureInvalid
                | CredError::TokenExpired { .. }
                | CredError::TokenNotYetValid { .. }
        )
    }
}

impl From<veil_core::CoreError> for CredError {
    fn from(e: veil_core::CoreError) -> Self {
        CredError::InvalidClaims(e.to_string())
    }
}

pub type CredResult<T> = Result<T, CredError>;
