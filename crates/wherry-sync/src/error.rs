use thiserror::Error;
use wherry_core::SyncErrorKind;
use wherry_provider::ProviderError;
use wherry_storage::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("credential expired: {0}")]
    AuthExpired(String),
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Collapse to the coarse taxonomy recorded on a failed task; raw
    /// internals never cross the task-status boundary.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::AuthExpired(_) => SyncErrorKind::AuthExpired,
            Self::Cancelled => SyncErrorKind::Cancelled,
            Self::Provider(err) if !err.is_transient() => match err {
                ProviderError::Auth(_)
                | ProviderError::Refresh(_)
                | ProviderError::MissingCredential(_) => SyncErrorKind::AuthExpired,
                _ => SyncErrorKind::Transient,
            },
            Self::Provider(_) | Self::Storage(_) => SyncErrorKind::Transient,
        }
    }
}
