/// Error taxonomy shared by the counter store, the issuer, the advancer
/// and the reset scheduler.
///
/// The HTTP layer maps each kind onto a status code; nothing below it
/// knows about HTTP.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn hospital_not_found(id: impl std::fmt::Display) -> Self {
        QueueError::NotFound(format!("hospital {}", id))
    }

    pub fn patient_not_found(what: impl std::fmt::Display) -> Self {
        QueueError::NotFound(format!("patient {}", what))
    }

    pub fn appointment_not_found(id: impl std::fmt::Display) -> Self {
        QueueError::NotFound(format!("appointment {}", id))
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::NotFound(_) => "not_found",
            QueueError::InvalidInput(_) => "invalid_input",
            QueueError::Conflict(_) => "conflict",
            QueueError::Internal(_) => "internal",
        }
    }
}

impl From<sled::Error> for QueueError {
    fn from(err: sled::Error) -> Self {
        QueueError::Internal(format!("storage: {}", err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Internal(format!("record encoding: {}", err))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
