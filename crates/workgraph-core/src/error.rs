use thiserror::Error;

/// Engine-level error: invalid graphs, invalid calls, contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Graph validation failed at construction
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step id was used that is not part of the graph
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Operation is not valid for the instance's current status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A completion arrived that the engine never issued, or arrived twice
    #[error("engine contract violation: {0}")]
    ContractViolation(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

/// Error returned by a step action's backend operation.
///
/// The engine never interprets these directly; it hands them to the
/// workflow's [`ErrorClassifier`](crate::application::classifier::ErrorClassifier)
/// which decides whether the error is a business outcome, a transient
/// connectivity loss, or fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The referenced object does not exist on the backend
    #[error("not found: {0}")]
    NotFound(String),

    /// The transport is offline or the connection was lost mid-operation
    #[error("connectivity lost: {0}")]
    Offline(String),

    /// The backend rejected the operation for lack of permission
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A quota or limit was reached
    #[error("limit reached: {0}")]
    LimitReached(String),

    /// Backend storage is exhausted
    #[error("storage exhausted: {0}")]
    StorageFull(String),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Discriminant of [`ActionError`], used as the match key in classifier
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionErrorKind {
    /// [`ActionError::NotFound`]
    NotFound,
    /// [`ActionError::Offline`]
    Offline,
    /// [`ActionError::PermissionDenied`]
    PermissionDenied,
    /// [`ActionError::LimitReached`]
    LimitReached,
    /// [`ActionError::StorageFull`]
    StorageFull,
    /// [`ActionError::Backend`]
    Backend,
}

impl ActionError {
    /// The kind of this error, for classifier lookup
    pub fn kind(&self) -> ActionErrorKind {
        match self {
            ActionError::NotFound(_) => ActionErrorKind::NotFound,
            ActionError::Offline(_) => ActionErrorKind::Offline,
            ActionError::PermissionDenied(_) => ActionErrorKind::PermissionDenied,
            ActionError::LimitReached(_) => ActionErrorKind::LimitReached,
            ActionError::StorageFull(_) => ActionErrorKind::StorageFull,
            ActionError::Backend(_) => ActionErrorKind::Backend,
        }
    }
}
