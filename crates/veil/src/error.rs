use thiserror::Error;

/// Error type for the veil binary, aggregating errors from the subsystem
/// crates.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("credential error: {0}")]
    Credential(#[from] veil_cred::CredError),

    #[error("policy error: {0}")]
    Policy(#[from] veil_policy::PolicyError),

    #[error("directory stream error: {0}")]
    Stream(#[from] veil_fs::StreamError),

    #[error("claims error: {0}")]
    Core(#[from] veil_core::CoreError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

pub type RootResult<T> = Result<T, RootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_error_display() {
        let err = RootError::Internal("something broke".into());
        assert_eq!(err.to_string(), "internal error: something broke");
    }

    #[test]
    fn test_root_error_config() {
        let err = RootError::Config("bad bind".into());
        assert_eq!(err.to_string(), "configuration error: bad bind");
    }

    #[test]
    fn test_root_error_from_cred() {
        let root_err: RootError = veil_cred::CredError::SignatureInvalid.into();
        assert_eq!(
            root_err.to_string(),
            "credential error: signature verification failed"
        );
    }

    #[test]
    fn test_root_error_from_policy() {
        let policy_err = veil_policy::PolicyError::EngineFailed("engine down".into());
        let root_err: RootError = policy_err.into();
        assert!(root_err.to_string().contains("engine down"));
    }

    #[test]
    fn test_root_error_from_stream() {
        let stream_err = veil_fs::StreamError::Read(std::io::Error::from_raw_os_error(5));
        let root_err: RootError = stream_err.into();
        assert!(matches!(root_err, RootError::Stream(_)));
    }

    #[test]
    fn test_root_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let root_err: RootError = json_err.into();
        assert!(matches!(root_err, RootError::Serialization(_)));
    }

    #[test]
    fn test_root_error_from_toml() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let root_err: RootError = toml_err.into();
        assert!(matches!(root_err, RootError::Config(_)));
    }
}
