use thiserror::Error;

/// Errors from talking to a FHIR server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Resource not found: {url}")]
    NotFound { url: String },

    #[error("Export expired on the server (HTTP 410): {url}")]
    ExportExpired { url: String },

    #[error("Server rejected request (HTTP {status}): {diagnostics}")]
    Rejected { status: u16, diagnostics: String },

    #[error("Server error persisted after {attempts} attempts (HTTP {status}): {diagnostics}")]
    Exhausted {
        status: u16,
        attempts: u32,
        diagnostics: String,
    },

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// A 404 that callers may want to treat as a soft miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a retry of the whole phase might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => !err.is_builder(),
            Self::Exhausted { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
