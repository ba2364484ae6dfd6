use ulid::Ulid;

use crate::model::Window;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidParent(Ulid),
    InvalidWindow(Window),
    Conflict { interval_id: Ulid, window: Window },
    InUse { resource_id: Ulid, active: usize },
    LimitExceeded(&'static str),
    /// Committed state broke the non-overlap invariant. A bug, not a business error.
    InvariantViolation(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidParent(id) => write!(f, "resource {id} cannot be its own parent"),
            EngineError::InvalidWindow(w) => {
                write!(f, "invalid window [{}, {}): start must be before end", w.start, w.end)
            }
            EngineError::Conflict { interval_id, window } => write!(
                f,
                "conflict with interval {interval_id} on [{}, {})",
                window.start, window.end
            ),
            EngineError::InUse { resource_id, active } => write!(
                f,
                "resource {resource_id} still has {active} active or future interval(s)"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
