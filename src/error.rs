use crate::model::{DownloadStatus, FailureKind};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Transfer failed: {0}")]
    Transport(String),
    #[error("Partial data does not match its checkpoint: {0}")]
    Integrity(String),
    #[error("Unable to write download: {0}")]
    Capacity(String),
    #[error("Cannot {action} download {id} while it is {status}")]
    InvalidState {
        id: String,
        status: DownloadStatus,
        action: &'static str,
    },
    #[error("Download not found: {0}")]
    NotFound(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Download coordinator is unavailable: {0}")]
    Unavailable(String),
}

impl DownloadError {
    /// The failure kind recorded on a download that ends with this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DownloadError::Integrity(_) => FailureKind::Integrity,
            DownloadError::Capacity(_) => FailureKind::Capacity,
            _ => FailureKind::Transport,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(value: reqwest::Error) -> Self {
        DownloadError::Transport(value.to_string())
    }
}

/// Local file errors are disk full, permission denied and the like, which are
/// all capacity problems from the point of view of a transfer.
impl From<std::io::Error> for DownloadError {
    fn from(value: std::io::Error) -> Self {
        DownloadError::Capacity(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
