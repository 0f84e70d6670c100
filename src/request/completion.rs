use crate::core::BufferToken;
use serde::Serialize;
use std::fmt;

/// How a tracked operation ended
///
/// Together with `BindingError::Timeout` this covers every outcome of
/// waiting on a request. Either way the buffer comes back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed(BufferToken),
    Cancelled(BufferToken),
}

impl Completion {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled(_))
    }

    pub fn token(&self) -> &BufferToken {
        match self {
            Completion::Completed(token) | Completion::Cancelled(token) => token,
        }
    }

    pub fn into_token(self) -> BufferToken {
        match self {
            Completion::Completed(token) | Completion::Cancelled(token) => token,
        }
    }
}

/// Direction of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    Send,
    Receive,
    /// Issued by the caller outside this crate and handed in through `track`
    External,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Send => write!(f, "send"),
            OperationKind::Receive => write!(f, "receive"),
            OperationKind::External => write!(f, "external"),
        }
    }
}
