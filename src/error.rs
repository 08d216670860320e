use thiserror::Error;

/// Errors that cross component boundaries. Everything else is absorbed at
/// the nearest poller or dispatcher and retried on its next tick.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("client session is not connected")]
    NotConnected,

    #[error("rate limited after {attempts} attempts (retry-after {retry_after_secs}s)")]
    RateLimited {
        attempts: u32,
        retry_after_secs: u64,
    },

    #[error("api credentials expired or revoked")]
    CredentialExpired,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}
