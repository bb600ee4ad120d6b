//! Error taxonomy surfaced by the download coordinator.

use thiserror::Error;

/// Every failure a caller of [`crate::coordinator::DownloadCoordinator`] can
/// observe. A fetch that is merely slow is not an error; it is reported as
/// [`crate::coordinator::Obtained::StillProcessing`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The identifier failed shape validation. Raised before any filesystem
    /// access or process launch.
    #[error("invalid content id {0:?}")]
    InvalidIdentifier(String),

    /// Every credential bundle was tried and none produced a valid artifact.
    #[error("all {attempts} fetch attempts for {id} failed")]
    FetchExhausted { id: String, attempts: usize },

    /// Serve-only lookup found nothing on disk.
    #[error("no cached artifact for {0}")]
    ArtifactNotFound(String),

    /// The background fetch ended without publishing a result (panicked
    /// worker or shutdown).
    #[error("fetch for {0} was interrupted")]
    FetchInterrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
