//! Line-protocol requests.
//!
//! One JSON object per line, discriminated by `op`. Every scheduler call names
//! the acting `subject` and its `role`; nothing carries over between requests.

use std::fmt;

use serde::Deserialize;
use ulid::Ulid;

use crate::limits::MAX_SUBJECT_LEN;
use crate::model::{Ms, Window};
use crate::policy::{ResourceClass, Role};
use crate::scheduler::{Actor, ErrorKind};
use crate::timestamp::{parse_range, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Authorize {
        role: String,
        class: String,
        action: String,
    },
    RegisterResource {
        subject: String,
        role: String,
        class: String,
        id: Option<Ulid>,
        parent_id: Option<Ulid>,
        name: Option<String>,
    },
    Create {
        subject: String,
        role: String,
        flight_id: Ulid,
        class: String,
        resource_id: Ulid,
        window: WindowSpec,
    },
    Reschedule {
        subject: String,
        role: String,
        assignment_id: Ulid,
        window: WindowSpec,
    },
    Reassign {
        subject: String,
        role: String,
        assignment_id: Ulid,
        resource_id: Ulid,
        window: Option<WindowSpec>,
    },
    Cancel {
        subject: String,
        role: String,
        assignment_id: Ulid,
    },
    DeleteResource {
        subject: String,
        role: String,
        class: String,
        resource_id: Ulid,
    },
    Conflicts {
        subject: String,
        role: String,
        resource_id: Ulid,
        window: WindowSpec,
    },
    GetAssignment {
        subject: String,
        role: String,
        assignment_id: Ulid,
    },
    ListAssignments {
        subject: String,
        role: String,
        resource_id: Ulid,
    },
    FlightAssignments {
        subject: String,
        role: String,
        flight_id: Ulid,
    },
    ListResources {
        subject: String,
        role: String,
        class: Option<String>,
    },
    Subscribe {
        subject: String,
        role: String,
        resource_id: Ulid,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))
    }

    /// The calling subject and role, for every op except `authorize`.
    pub fn caller(&self) -> Option<(&str, &str)> {
        match self {
            Command::Authorize { .. } => None,
            Command::RegisterResource { subject, role, .. }
            | Command::Create { subject, role, .. }
            | Command::Reschedule { subject, role, .. }
            | Command::Reassign { subject, role, .. }
            | Command::Cancel { subject, role, .. }
            | Command::DeleteResource { subject, role, .. }
            | Command::Conflicts { subject, role, .. }
            | Command::GetAssignment { subject, role, .. }
            | Command::ListAssignments { subject, role, .. }
            | Command::FlightAssignments { subject, role, .. }
            | Command::ListResources { subject, role, .. }
            | Command::Subscribe { subject, role, .. } => Some((subject, role)),
        }
    }
}

/// A timestamp as either Unix milliseconds or text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(Ms),
    Text(String),
}

impl TimeValue {
    pub fn resolve(&self) -> Result<Ms, CommandError> {
        match self {
            TimeValue::Millis(ms) => Ok(*ms),
            TimeValue::Text(text) => {
                parse_timestamp(text).map_err(|e| CommandError::InvalidWindow(e.to_string()))
            }
        }
    }
}

/// A window as a range literal (`["2024-01-01 10:00","2024-01-01 11:00")`)
/// or as explicit bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Range(String),
    Bounds { start: TimeValue, end: TimeValue },
}

impl WindowSpec {
    pub fn resolve(&self) -> Result<Window, CommandError> {
        match self {
            WindowSpec::Range(text) => {
                parse_range(text).map_err(|e| CommandError::InvalidWindow(e.to_string()))
            }
            WindowSpec::Bounds { start, end } => {
                let (start, end) = (start.resolve()?, end.resolve()?);
                Window::checked(start, end).ok_or_else(|| {
                    CommandError::InvalidWindow(format!("start {start} is not before end {end}"))
                })
            }
        }
    }
}

/// Resolve the caller. An unknown role can hold no grant.
pub fn actor(subject: &str, role: &str) -> Result<Actor, CommandError> {
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(CommandError::SubjectTooLong);
    }
    let role: Role = role
        .parse()
        .map_err(|_| CommandError::UnknownRole(role.to_string()))?;
    Ok(Actor::new(subject, role))
}

pub fn resource_class(class: &str) -> Result<ResourceClass, CommandError> {
    class
        .parse()
        .map_err(|_| CommandError::UnknownClass(class.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Malformed(String),
    InvalidWindow(String),
    UnknownRole(String),
    UnknownClass(String),
    SubjectTooLong,
}

impl CommandError {
    /// Unknown roles and classes fail closed, the same as a policy denial.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Malformed(_) => ErrorKind::InvalidRequest,
            CommandError::InvalidWindow(_) => ErrorKind::InvalidWindow,
            CommandError::UnknownRole(_) | CommandError::UnknownClass(_) => ErrorKind::Forbidden,
            CommandError::SubjectTooLong => ErrorKind::LimitExceeded,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Malformed(msg) => write!(f, "malformed request: {msg}"),
            CommandError::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
            CommandError::UnknownRole(role) => write!(f, "forbidden: unknown role '{role}'"),
            CommandError::UnknownClass(class) => {
                write!(f, "forbidden: unknown resource class '{class}'")
            }
            CommandError::SubjectTooLong => write!(f, "subject too long"),
        }
    }
}

impl std::error::Error for CommandError {}
