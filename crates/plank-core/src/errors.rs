/// Typed error hierarchy for ordering commits.
/// Classifies failures as recoverable-by-retry or surfaced-to-the-user.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OrderingError {
    /// Another move already changed the affected neighborhood. The caller
    /// must re-read the current order and retry against live neighbors,
    /// never against its stale assumptions.
    #[error("ordering conflict: {0}")]
    Conflict(String),

    /// The durable store could not be reached. Retryable with backoff;
    /// distinct from an ordering conflict.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The move names an entity that does not exist (e.g. a deleted column).
    /// Not retryable; surfaced as a rejected action.
    #[error("invalid move target: {0}")]
    InvalidMoveTarget(String),
}

impl OrderingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::PersistenceUnavailable(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidMoveTarget(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::PersistenceUnavailable(_) => "persistence_unavailable",
            Self::InvalidMoveTarget(_) => "invalid_move_target",
        }
    }
}
