use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("rate limited after {0} attempts")]
    RateLimited(usize),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("credential refresh failed: {0}")]
    Refresh(String),
    #[error("no credential stored for account {0}")]
    MissingCredential(Uuid),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl ProviderError {
    /// Worth re-enqueueing: the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Auth(_) | Self::Refresh(_) | Self::MissingCredential(_) | Self::Endpoint(_) => {
                false
            }
        }
    }
}
