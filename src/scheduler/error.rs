use serde::Serialize;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Window;
use crate::policy::{Action, ResourceClass, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    Forbidden {
        role: Role,
        class: ResourceClass,
        action: Action,
    },
    InvalidWindow(Window),
    ResourceConflict {
        assignment_id: Ulid,
        flight_id: Option<Ulid>,
        window: Window,
    },
    ResourceInUse {
        resource_id: Ulid,
        active: usize,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidParent(Ulid),
    ClassMismatch {
        resource_id: Ulid,
        expected: ResourceClass,
        actual: ResourceClass,
    },
    NotSchedulable(ResourceClass),
    FlightAlreadyAssigned {
        flight_id: Ulid,
        class: ResourceClass,
        assignment_id: Ulid,
    },
    LimitExceeded(&'static str),
    /// The downstream write failed; the in-memory change was rolled back.
    Persistence(String),
    /// Internal invariant violation. Never a caller mistake.
    Internal(String),
}

/// Closed set of error kinds exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Forbidden,
    InvalidWindow,
    ResourceConflict,
    ResourceInUse,
    NotFound,
    AlreadyExists,
    InvalidRequest,
    FlightAlreadyAssigned,
    LimitExceeded,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidWindow => "invalid_window",
            ErrorKind::ResourceConflict => "resource_conflict",
            ErrorKind::ResourceInUse => "resource_in_use",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::FlightAlreadyAssigned => "flight_already_assigned",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Forbidden { .. } => ErrorKind::Forbidden,
            SchedulerError::InvalidWindow(_) => ErrorKind::InvalidWindow,
            SchedulerError::ResourceConflict { .. } => ErrorKind::ResourceConflict,
            SchedulerError::ResourceInUse { .. } => ErrorKind::ResourceInUse,
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SchedulerError::InvalidParent(_)
            | SchedulerError::ClassMismatch { .. }
            | SchedulerError::NotSchedulable(_) => ErrorKind::InvalidRequest,
            SchedulerError::FlightAlreadyAssigned { .. } => ErrorKind::FlightAlreadyAssigned,
            SchedulerError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            SchedulerError::Persistence(_) => ErrorKind::Persistence,
            SchedulerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only a failed downstream write may succeed on an identical retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Persistence(_))
    }
}

impl From<EngineError> for SchedulerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => SchedulerError::NotFound(id),
            EngineError::AlreadyExists(id) => SchedulerError::AlreadyExists(id),
            EngineError::InvalidParent(id) => SchedulerError::InvalidParent(id),
            EngineError::InvalidWindow(w) => SchedulerError::InvalidWindow(w),
            EngineError::Conflict { interval_id, window } => SchedulerError::ResourceConflict {
                assignment_id: interval_id,
                flight_id: None,
                window,
            },
            EngineError::InUse { resource_id, active } => {
                SchedulerError::ResourceInUse { resource_id, active }
            }
            EngineError::LimitExceeded(msg) => SchedulerError::LimitExceeded(msg),
            EngineError::InvariantViolation(msg) => SchedulerError::Internal(msg),
        }
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Forbidden { role, class, action } => {
                write!(f, "forbidden: role {role} may not {action} {class}")
            }
            SchedulerError::InvalidWindow(w) => {
                write!(f, "invalid window [{}, {}): start must be before end", w.start, w.end)
            }
            SchedulerError::ResourceConflict { assignment_id, flight_id, window } => {
                write!(f, "window taken by assignment {assignment_id}")?;
                if let Some(flight) = flight_id {
                    write!(f, " (flight {flight})")?;
                }
                write!(f, " on [{}, {})", window.start, window.end)
            }
            SchedulerError::ResourceInUse { resource_id, active } => write!(
                f,
                "resource {resource_id} still has {active} current or future assignment(s)"
            ),
            SchedulerError::NotFound(id) => write!(f, "not found: {id}"),
            SchedulerError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            SchedulerError::InvalidParent(id) => write!(f, "resource {id} cannot be its own parent"),
            SchedulerError::ClassMismatch { resource_id, expected, actual } => write!(
                f,
                "resource {resource_id} is a {actual}, not a {expected}"
            ),
            SchedulerError::NotSchedulable(class) => {
                write!(f, "{class} resources are not scheduled in time windows")
            }
            SchedulerError::FlightAlreadyAssigned { flight_id, class, assignment_id } => write!(
                f,
                "flight {flight_id} already holds {class} assignment {assignment_id}"
            ),
            SchedulerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SchedulerError::Persistence(msg) => write!(f, "persistence failed: {msg}"),
            SchedulerError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}
