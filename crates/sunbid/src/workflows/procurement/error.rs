use serde::Serialize;

use super::clock::TimerError;
use super::repository::RepositoryError;

/// Failure taxonomy shared by every procurement operation.
///
/// Validation failures are returned synchronously and never retried by the engine. Callers
/// should re-read state after `Conflict` rather than retrying blindly.
#[derive(Debug, thiserror::Error)]
pub enum ProcurementError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("auction closed: {0}")]
    AuctionClosed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Repository(RepositoryError),
    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl ProcurementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcurementError::NotFound(_) => ErrorKind::NotFound,
            ProcurementError::Unauthorized(_) => ErrorKind::Unauthorized,
            ProcurementError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            ProcurementError::AuctionClosed(_) => ErrorKind::AuctionClosed,
            ProcurementError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProcurementError::Conflict(_) => ErrorKind::Conflict,
            ProcurementError::Repository(_) | ProcurementError::Timer(_) => {
                ErrorKind::Unavailable
            }
        }
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

impl From<RepositoryError> for ProcurementError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict => {
                Self::Conflict("record changed concurrently; re-read and retry".to_string())
            }
            RepositoryError::NotFound => Self::NotFound("record".to_string()),
            other => Self::Repository(other),
        }
    }
}

/// Stable, serializable classification of a [`ProcurementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    InvalidTransition,
    AuctionClosed,
    InvalidInput,
    Conflict,
    Unavailable,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::AuctionClosed => "auction_closed",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}
