use thiserror::Error;

use harvest_client::ClientError;
use harvest_store::StoreError;

/// Errors from the acquisition engines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] harvest_core::CoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// The process exit code this error maps to: 1 for configuration
    /// problems, 2 for cancellation, 3 for unrecoverable server errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 2,
            Self::Configuration(_) | Self::Core(_) => 1,
            Self::Store(StoreError::ParamsMismatch { .. })
            | Self::Store(StoreError::WorkspaceLocked(_)) => 1,
            Self::Client(ClientError::Configuration(_)) => 1,
            Self::Client(_) | Self::ExportFailed(_) => 3,
            Self::Store(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::configuration("x").exit_code(), 1);
        assert_eq!(EngineError::Cancelled.exit_code(), 2);
        assert_eq!(EngineError::ExportFailed("x".into()).exit_code(), 3);
        assert_eq!(
            EngineError::Client(ClientError::Configuration("x".into())).exit_code(),
            1
        );
        assert_eq!(
            EngineError::Client(ClientError::NotFound { url: "u".into() }).exit_code(),
            3
        );
    }
}
