//! Newline-delimited JSON transport for the scheduler.
//!
//! Each request line gets exactly one response line, in order. Events from
//! `subscribe` are interleaved between responses as `{"event": ...}` lines.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::command::{actor, resource_class, Command, CommandError};
use crate::limits::MAX_LINE_LEN;
use crate::notify::{Feed, FeedSet};
use crate::observability::{command_label, OPERATIONS_TOTAL, OPERATION_DURATION_SECONDS};
use crate::scheduler::{Assignment, ConflictInfo, ErrorKind, Scheduler, SchedulerError};
use crate::timestamp::{format_range, format_timestamp};

const PUSH_CAPACITY: usize = 1024;

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, scheduler: Arc<Scheduler>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (mut feeds, mut pushes) = FeedSet::new(PUSH_CAPACITY);

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&scheduler, &line, &mut feeds).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The codec stream ends after a decode error.
                        let reply = error_reply(ErrorKind::LimitExceeded, "request line too long", None);
                        framed.send(reply.to_string()).await.map_err(codec_io)?;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                framed.send(reply.to_string()).await.map_err(codec_io)?;
            }
            Some(push) = pushes.recv() => {
                let line = match push {
                    Feed::Event(event) => json!({ "event": event }),
                    Feed::Lagged { resource_id, missed } => {
                        json!({ "lagged": { "resource_id": resource_id, "missed": missed } })
                    }
                };
                framed.send(line.to_string()).await.map_err(codec_io)?;
            }
        }
    }
    Ok(())
}

async fn handle_line(scheduler: &Scheduler, line: &str, feeds: &mut FeedSet) -> Value {
    let cmd = match Command::parse(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::debug!("bad request: {e}");
            return WireError::from(e).reply();
        }
    };
    let op = command_label(&cmd);
    if let Some((subject, role)) = cmd.caller() {
        tracing::debug!(op, subject, role, "request");
    }
    let started = Instant::now();

    let (status, reply) = match execute(scheduler, cmd, feeds).await {
        Ok(result) => ("ok", json!({ "ok": true, "result": result })),
        Err(e) => {
            tracing::debug!(op, "request failed: {e}");
            (e.kind().as_str(), e.reply())
        }
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    reply
}

async fn execute(
    s: &Scheduler,
    cmd: Command,
    feeds: &mut FeedSet,
) -> Result<Value, WireError> {
    match cmd {
        Command::Authorize { role, class, action } => Ok(json!({
            "allowed": s.policy().authorize_str(&role, &class, &action)
        })),
        Command::RegisterResource {
            subject,
            role,
            class,
            id,
            parent_id,
            name,
        } => {
            let actor = actor(&subject, &role)?;
            let class = resource_class(&class)?;
            let id = s
                .register_resource(&actor, id.unwrap_or_else(Ulid::new), class, parent_id, name)
                .await?;
            Ok(json!({ "id": id }))
        }
        Command::Create {
            subject,
            role,
            flight_id,
            class,
            resource_id,
            window,
        } => {
            let actor = actor(&subject, &role)?;
            let class = resource_class(&class)?;
            let window = window.resolve()?;
            let id = s.create(&actor, flight_id, class, resource_id, window).await?;
            Ok(json!({ "id": id }))
        }
        Command::Reschedule {
            subject,
            role,
            assignment_id,
            window,
        } => {
            let actor = actor(&subject, &role)?;
            s.reschedule(&actor, assignment_id, window.resolve()?).await?;
            Ok(assignment_json(&s.assignment(&actor, assignment_id)?))
        }
        Command::Reassign {
            subject,
            role,
            assignment_id,
            resource_id,
            window,
        } => {
            let actor = actor(&subject, &role)?;
            let window = window.map(|w| w.resolve()).transpose()?;
            s.reassign(&actor, assignment_id, resource_id, window).await?;
            Ok(assignment_json(&s.assignment(&actor, assignment_id)?))
        }
        Command::Cancel {
            subject,
            role,
            assignment_id,
        } => {
            let actor = actor(&subject, &role)?;
            let cancelled = s.cancel(&actor, assignment_id).await?;
            Ok(json!({ "cancelled": cancelled }))
        }
        Command::DeleteResource {
            subject,
            role,
            class,
            resource_id,
        } => {
            let actor = actor(&subject, &role)?;
            let class = resource_class(&class)?;
            s.delete_resource(&actor, class, resource_id).await?;
            Ok(json!({ "deleted": resource_id }))
        }
        Command::Conflicts {
            subject,
            role,
            resource_id,
            window,
        } => {
            let actor = actor(&subject, &role)?;
            let hits = s.conflicts(&actor, resource_id, window.resolve()?).await?;
            Ok(Value::Array(hits.iter().map(conflict_json).collect()))
        }
        Command::GetAssignment {
            subject,
            role,
            assignment_id,
        } => {
            let actor = actor(&subject, &role)?;
            Ok(assignment_json(&s.assignment(&actor, assignment_id)?))
        }
        Command::ListAssignments {
            subject,
            role,
            resource_id,
        } => {
            let actor = actor(&subject, &role)?;
            let list = s.assignments_for_resource(&actor, resource_id).await?;
            Ok(Value::Array(list.iter().map(assignment_json).collect()))
        }
        Command::FlightAssignments {
            subject,
            role,
            flight_id,
        } => {
            let actor = actor(&subject, &role)?;
            let list = s.assignments_for_flight(&actor, flight_id)?;
            Ok(Value::Array(list.iter().map(assignment_json).collect()))
        }
        Command::ListResources {
            subject,
            role,
            class,
        } => {
            let actor = actor(&subject, &role)?;
            let class = class.as_deref().map(resource_class).transpose()?;
            let list = s.list_resources(&actor, class).await?;
            Ok(json!(list))
        }
        Command::Subscribe {
            subject,
            role,
            resource_id,
        } => {
            let actor = actor(&subject, &role)?;
            // Authorized on every call; a repeat only skips the second pump.
            let rx = s.subscribe(&actor, resource_id).await?;
            if !feeds.attach(resource_id, rx) {
                tracing::debug!(%resource_id, "already subscribed");
            }
            Ok(json!({ "subscribed": resource_id }))
        }
    }
}

fn assignment_json(a: &Assignment) -> Value {
    json!({
        "id": a.id,
        "flight_id": a.flight_id,
        "resource_id": a.resource_id,
        "class": a.class,
        "start": format_timestamp(a.window.start),
        "end": format_timestamp(a.window.end),
        "window": format_range(&a.window),
        "status": a.status,
    })
}

fn conflict_json(c: &ConflictInfo) -> Value {
    json!({
        "assignment_id": c.assignment_id,
        "flight_id": c.flight_id,
        "start": format_timestamp(c.window.start),
        "end": format_timestamp(c.window.end),
        "window": format_range(&c.window),
    })
}

fn error_reply(kind: ErrorKind, message: &str, conflict: Option<Value>) -> Value {
    let mut error = json!({ "kind": kind, "message": message });
    if let Some(conflict) = conflict {
        error["conflict"] = conflict;
    }
    json!({ "ok": false, "error": error })
}

fn codec_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[derive(Debug)]
enum WireError {
    Command(CommandError),
    Scheduler(SchedulerError),
}

impl WireError {
    fn kind(&self) -> ErrorKind {
        match self {
            WireError::Command(e) => e.kind(),
            WireError::Scheduler(e) => e.kind(),
        }
    }

    fn reply(&self) -> Value {
        let conflict = match self {
            WireError::Scheduler(SchedulerError::ResourceConflict {
                assignment_id,
                flight_id,
                window,
            }) => Some(conflict_json(&ConflictInfo {
                assignment_id: *assignment_id,
                flight_id: *flight_id,
                window: *window,
            })),
            _ => None,
        };
        error_reply(self.kind(), &self.to_string(), conflict)
    }
}

impl From<CommandError> for WireError {
    fn from(e: CommandError) -> Self {
        WireError::Command(e)
    }
}

impl From<SchedulerError> for WireError {
    fn from(e: SchedulerError) -> Self {
        WireError::Scheduler(e)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Command(e) => e.fmt(f),
            WireError::Scheduler(e) => e.fmt(f),
        }
    }
}
