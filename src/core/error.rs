use super::types::{HandleKind, NativeHandle, ThreadSupportLevel, TrackedId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("Native handle {0} is already registered")]
    DuplicateHandle(NativeHandle),

    #[error("Handle {0} is not live")]
    StaleHandle(TrackedId),

    #[error("Handle {0} was already released")]
    AlreadyReleased(TrackedId),

    #[error("Runtime is already initialized")]
    AlreadyInitialized,

    #[error("Runtime is not initialized")]
    NotInitialized,

    #[error("{count} non-blocking operation(s) still pending")]
    PendingOperationsRemain { count: usize },

    #[error("Request {0} is not tracked")]
    UnknownRequest(TrackedId),

    #[error("Request {0} was already completed")]
    AlreadyCompleted(TrackedId),

    #[error("Request {0} did not complete before the deadline")]
    Timeout(TrackedId),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Handle {0} is predefined and cannot be released")]
    PredefinedHandle(TrackedId),

    #[error("Handle {id} is a {found}, expected a {expected}")]
    KindMismatch {
        id: TrackedId,
        expected: HandleKind,
        found: HandleKind,
    },

    #[error("Request {0} is still in flight")]
    RequestInFlight(TrackedId),

    #[error("Thread support level '{level}' forbids this call: {reason}")]
    ThreadLevelViolation {
        level: ThreadSupportLevel,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl BindingError {
    /// The caller may retry (or cancel) after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BindingError::Timeout(_))
    }

    /// The session cannot be used after this error
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BindingError::InitFailed(_) | BindingError::AlreadyInitialized
        )
    }
}

pub type Result<T> = std::result::Result<T, BindingError>;

impl<T> From<std::sync::PoisonError<T>> for BindingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
