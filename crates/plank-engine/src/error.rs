use plank_core::errors::OrderingError;
use plank_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ordering(OrderingError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Ordering(OrderingError::Conflict(detail.into()))
    }

    pub fn invalid_target(detail: impl Into<String>) -> Self {
        Self::Ordering(OrderingError::InvalidMoveTarget(detail.into()))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Ordering(OrderingError::Conflict(_)))
    }

    pub fn as_ordering(&self) -> Option<&OrderingError> {
        match self {
            Self::Ordering(e) => Some(e),
            _ => None,
        }
    }
}

/// Store failures are classified at the boundary: a version race is an
/// ordering conflict, a busy database is retryable unavailability, a missing
/// record is a bad target. Everything else stays a store error.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict { entity, expected } => {
                Self::Ordering(OrderingError::Conflict(format!(
                    "{entity} moved past version {expected}"
                )))
            }
            StoreError::Unavailable(detail) => {
                Self::Ordering(OrderingError::PersistenceUnavailable(detail))
            }
            StoreError::NotFound(what) => Self::Ordering(OrderingError::InvalidMoveTarget(what)),
            other => Self::Store(other),
        }
    }
}
