use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure kinds for a generation run. A run aborts at the first error; none
/// of these are retried automatically.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No API key is configured for a provider family the run would call.
    /// Raised by the entry guard before any network traffic.
    #[error("{provider} API key not configured (set {env_hint})")]
    MissingCredential {
        provider: &'static str,
        env_hint: &'static str,
    },

    /// The attached sketch path does not resolve to an existing file.
    #[error("image not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A remote call failed: transport error, non-2xx status, or an
    /// unreadable response body. `detail` carries the status code and a
    /// truncated body excerpt when available.
    #[error("{provider} request failed: {detail}")]
    RequestError {
        provider: &'static str,
        detail: String,
    },

    /// Startup-time misconfiguration, e.g. empty documentation text. Never a
    /// mid-pipeline failure.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The requested model identifier is not in the registry, or lacks the
    /// capability the run needs it for.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Neither a description nor a sketch was supplied.
    #[error("nothing to generate: provide a description or attach a sketch")]
    EmptyRequest,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("event stream write failed: {0}")]
    EventStream(String),
}

impl PipelineError {
    pub fn request(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::RequestError {
            provider,
            detail: detail.into(),
        }
    }
}
