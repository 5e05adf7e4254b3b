//! Error types for the indexer engine.

use thiserror::Error;

/// Result type alias for indexer operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Errors that can occur while loading definitions or running indexers.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// A definition or query is malformed.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// No definition exists for the key.
    #[error("Definition '{0}' not found")]
    NotFound(String),

    /// The login workflow failed.
    #[error("Login failed: {0}")]
    Auth(String),

    /// A response showed the session is no longer logged in.
    #[error("Session is logged out")]
    SessionExpired,

    /// Network-level failure that is not a reqwest error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The site answered with a non-success status.
    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Request or member timeout exceeded.
    #[error("Request timeout exceeded")]
    Timeout,

    /// A response did not match the definition's extraction rules.
    #[error("Extraction failed for {site} ({rule}): {message}")]
    Extraction {
        site: String,
        rule: String,
        message: String,
    },

    /// The definition does not declare the operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Replay transport has no recorded entry for a request.
    #[error("No recorded response for {method} {url}")]
    ReplayMismatch { method: String, url: String },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML document.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed JSON document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl IndexerError {
    /// Builds a validation error for the named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Builds an extraction error for a rule of a site definition.
    pub fn extraction(
        site: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Extraction {
            site: site.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Whether the error must abort a whole test run rather than one case.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReplayMismatch { .. })
    }

    /// Whether the error comes from the network layer, which drops the
    /// session back to logged out.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Http(_) | Self::Status { .. } | Self::Timeout
        )
    }
}
