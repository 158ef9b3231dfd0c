use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Required site option missing or malformed; the target is never started.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection, DNS, or timeout failure before a status was received.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("server rejected post with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("record is {age_secs}s old (stale threshold {threshold_secs}s)")]
    StaleData { age_secs: i64, threshold_secs: u64 },

    #[error("failed to build post: {0}")]
    Build(String),
}

impl UploadError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Transport and rejection failures are retried up to `max_tries`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Rejected { .. })
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Build(err.to_string())
    }
}

impl From<url::ParseError> for UploadError {
    fn from(err: url::ParseError) -> Self {
        Self::Build(err.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
