//! Assignment scheduler: the only writer of gate and runway assignments.
//!
//! Every call carries the acting subject and role. The scheduler asks the
//! policy first, then reserves against the interval store while holding the
//! resource lock, hands the resulting event to the [`AssignmentSink`] and only
//! then releases the lock. A failed sink write rolls the reservation back, so a
//! slot is never held by a record that was not persisted.

mod error;
#[cfg(test)]
mod tests;

pub use error::{ErrorKind, SchedulerError};

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{now_ms, validate_window, EngineError, IntervalStore, ResourceGuard};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{
    ASSIGNMENTS_ACTIVE, ASSIGNMENTS_PRUNED_TOTAL, CONFLICTS_TOTAL, INVARIANT_VIOLATIONS_TOTAL,
    PERSISTENCE_FAILURES_TOTAL, POLICY_DENIALS_TOTAL,
};
use crate::policy::{Action, Policy, ResourceClass, Role};

/// Who is calling. Resolved by the identity provider, passed on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub subject: String,
    pub role: Role,
}

impl Actor {
    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Committed,
    Cancelled,
}

/// One flight bound to one gate or runway for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub id: Ulid,
    pub flight_id: Ulid,
    pub resource_id: Ulid,
    pub class: ResourceClass,
    pub window: Window,
    pub status: AssignmentStatus,
}

/// An existing assignment overlapping a queried window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub assignment_id: Ulid,
    pub flight_id: Option<Ulid>,
    pub window: Window,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Reject a second active assignment of the same flight in the same class.
    pub one_active_per_flight: bool,
}

/// Durable destination for committed events.
#[async_trait]
pub trait AssignmentSink: Send + Sync {
    async fn persist(&self, event: &Event) -> io::Result<()>;
}

/// Keeps nothing. For tests and embedders that persist elsewhere.
pub struct NullSink;

#[async_trait]
impl AssignmentSink for NullSink {
    async fn persist(&self, _event: &Event) -> io::Result<()> {
        Ok(())
    }
}

pub struct Scheduler {
    policy: Policy,
    options: SchedulerOptions,
    store: IntervalStore,
    assignments: DashMap<Ulid, Assignment>,
    /// (flight, class) → holder. Only maintained with `one_active_per_flight`.
    flight_slots: DashMap<(Ulid, ResourceClass), Ulid>,
    sink: Arc<dyn AssignmentSink>,
    notify: Arc<NotifyHub>,
    /// Mutations hold this shared; journal compaction takes it exclusively.
    compaction: RwLock<()>,
}

impl Scheduler {
    pub fn new(
        policy: Policy,
        options: SchedulerOptions,
        sink: Arc<dyn AssignmentSink>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            policy,
            options,
            store: IntervalStore::new(),
            assignments: DashMap::new(),
            flight_slots: DashMap::new(),
            sink,
            notify,
            compaction: RwLock::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Policy::default(),
            SchedulerOptions::default(),
            Arc::new(NullSink),
            Arc::new(NotifyHub::new()),
        )
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    pub fn store(&self) -> &IntervalStore {
        &self.store
    }

    pub fn authorize(&self, role: Role, class: ResourceClass, action: Action) -> bool {
        self.policy.authorize(role, class, action)
    }

    // ── Mutations ────────────────────────────────────────────────

    pub async fn register_resource(
        &self,
        actor: &Actor,
        id: Ulid,
        class: ResourceClass,
        parent_id: Option<Ulid>,
        name: Option<String>,
    ) -> Result<Ulid, SchedulerError> {
        self.check(actor, class, Action::Create)?;
        if !class.is_schedulable() {
            return Err(SchedulerError::NotSchedulable(class));
        }

        let _pause = self.compaction.read().await;
        let guard = self.store.register_resource(id, class, parent_id, name.clone())?;
        let event = Event::ResourceRegistered {
            id,
            class,
            parent_id,
            name,
        };
        if let Err(e) = self.persist(&event).await {
            guard.remove();
            return Err(e);
        }
        drop(guard);

        info!(%id, %class, subject = %actor.subject, "resource registered");
        self.publish(&event);
        Ok(id)
    }

    /// Book `resource_id` for `flight_id` over `window`. Returns the new assignment id.
    pub async fn create(
        &self,
        actor: &Actor,
        flight_id: Ulid,
        class: ResourceClass,
        resource_id: Ulid,
        window: Window,
    ) -> Result<Ulid, SchedulerError> {
        self.check(actor, class, Action::Create)?;
        validate_window(&window)?;
        if !class.is_schedulable() {
            return Err(SchedulerError::NotSchedulable(class));
        }

        let _pause = self.compaction.read().await;
        let mut guard = self.store.lock(resource_id).await?;
        ensure_class(&guard, class)?;

        let id = Ulid::new();
        self.claim_flight_slot(flight_id, class, id)?;
        if let Err(e) = guard.try_reserve(id, window) {
            self.release_flight_slot(flight_id, class, id);
            return Err(self.engine_error(e, class));
        }

        let event = Event::AssignmentCommitted {
            id,
            resource_id,
            flight_id,
            window,
        };
        if let Err(e) = self.persist(&event).await {
            guard.release(id);
            self.release_flight_slot(flight_id, class, id);
            return Err(e);
        }
        self.assignments.insert(
            id,
            Assignment {
                id,
                flight_id,
                resource_id,
                class,
                window,
                status: AssignmentStatus::Committed,
            },
        );
        drop(guard);

        metrics::gauge!(ASSIGNMENTS_ACTIVE).increment(1.0);
        info!(%id, %flight_id, %resource_id, subject = %actor.subject, "assignment committed");
        self.publish(&event);
        Ok(id)
    }

    /// Move an assignment to a new window on the same resource. Its own current
    /// window is excluded from the conflict check.
    pub async fn reschedule(
        &self,
        actor: &Actor,
        assignment_id: Ulid,
        window: Window,
    ) -> Result<(), SchedulerError> {
        let class = self.record_class(assignment_id)?;
        self.check(actor, class, Action::Update)?;
        validate_window(&window)?;

        let _pause = self.compaction.read().await;
        let (mut guard, record) = self.lock_assignment(assignment_id).await?;
        if record.status == AssignmentStatus::Cancelled {
            return Err(SchedulerError::NotFound(assignment_id));
        }
        let event = self.replace_locked(&mut guard, &record, window).await?;
        drop(guard);

        info!(id = %assignment_id, subject = %actor.subject, "assignment rescheduled");
        self.publish(&event);
        Ok(())
    }

    /// Move an assignment to another resource of the same class, optionally
    /// with a new window. Both resources stay locked until the move is durable.
    pub async fn reassign(
        &self,
        actor: &Actor,
        assignment_id: Ulid,
        resource_id: Ulid,
        window: Option<Window>,
    ) -> Result<(), SchedulerError> {
        let class = self.record_class(assignment_id)?;
        self.check(actor, class, Action::Update)?;
        if let Some(w) = &window {
            validate_window(w)?;
        }

        let _pause = self.compaction.read().await;
        loop {
            let current = self.resource_of(assignment_id)?;
            if current == resource_id {
                let mut guard = self.store.lock(current).await?;
                let Some(record) = self.record_on(assignment_id, current)? else {
                    continue;
                };
                let record = committed(record)?;
                let window = window.unwrap_or(record.window);
                let event = self.replace_locked(&mut guard, &record, window).await?;
                drop(guard);
                self.publish(&event);
                return Ok(());
            }

            let (mut from, mut to) = self.store.lock_pair(current, resource_id).await?;
            let Some(record) = self.record_on(assignment_id, current)? else {
                continue;
            };
            let record = committed(record)?;
            ensure_class(&to, record.class)?;
            let window = window.unwrap_or(record.window);

            let previous = to
                .transfer_from(&mut from, assignment_id, window)
                .map_err(|e| self.engine_error(e, record.class))?;
            let event = Event::AssignmentMoved {
                id: assignment_id,
                from_resource_id: current,
                resource_id,
                window,
            };
            if let Err(e) = self.persist(&event).await {
                if let Err(undo) = from.transfer_from(&mut to, assignment_id, previous) {
                    self.rollback_failed(assignment_id, undo);
                }
                return Err(e);
            }
            if let Some(mut a) = self.assignments.get_mut(&assignment_id) {
                a.resource_id = resource_id;
                a.window = window;
            }
            drop(from);
            drop(to);

            info!(id = %assignment_id, from = %current, to = %resource_id, subject = %actor.subject, "assignment reassigned");
            self.notify.send(current, &event);
            self.publish(&event);
            return Ok(());
        }
    }

    /// Release an assignment. Returns `false` when it was already cancelled.
    pub async fn cancel(&self, actor: &Actor, assignment_id: Ulid) -> Result<bool, SchedulerError> {
        let class = self.record_class(assignment_id)?;
        self.check(actor, class, Action::Delete)?;

        let _pause = self.compaction.read().await;
        let (mut guard, record) = self.lock_assignment(assignment_id).await?;
        if record.status == AssignmentStatus::Cancelled {
            return Ok(false);
        }

        let released = guard.release(assignment_id);
        let event = Event::AssignmentCancelled {
            id: assignment_id,
            resource_id: record.resource_id,
            flight_id: record.flight_id,
            window: record.window,
        };
        if let Err(e) = self.persist(&event).await {
            if let Some(interval) = released
                && let Err(undo) = guard.try_reserve(assignment_id, interval.window)
            {
                self.rollback_failed(assignment_id, undo);
            }
            return Err(e);
        }
        if let Some(mut a) = self.assignments.get_mut(&assignment_id) {
            a.status = AssignmentStatus::Cancelled;
        }
        self.release_flight_slot(record.flight_id, record.class, assignment_id);
        drop(guard);

        metrics::gauge!(ASSIGNMENTS_ACTIVE).decrement(1.0);
        info!(id = %assignment_id, subject = %actor.subject, "assignment cancelled");
        self.publish(&event);
        Ok(true)
    }

    /// Remove a gate or runway. Refused while any of its assignments ends after now;
    /// past assignments are dropped with it.
    pub async fn delete_resource(
        &self,
        actor: &Actor,
        class: ResourceClass,
        resource_id: Ulid,
    ) -> Result<(), SchedulerError> {
        self.check(actor, class, Action::Delete)?;

        let _pause = self.compaction.read().await;
        let guard = self.store.lock(resource_id).await?;
        ensure_class(&guard, class)?;
        if let Err(e) = guard.ensure_idle(now_ms()) {
            debug!(%resource_id, "delete refused: {e}");
            return Err(e.into());
        }

        let event = Event::ResourceRemoved { id: resource_id };
        self.persist(&event).await?;
        let history = guard.remove();
        let dropped = self.drop_records(resource_id);

        info!(%resource_id, subject = %actor.subject, past = history.len(), records = dropped, "resource deleted");
        self.notify.send(resource_id, &event);
        self.notify.remove(&resource_id);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Committed assignments on `resource_id` overlapping `window`, in start order.
    pub async fn conflicts(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        window: Window,
    ) -> Result<Vec<ConflictInfo>, SchedulerError> {
        if !window.is_valid() {
            return Err(SchedulerError::InvalidWindow(window));
        }
        let class = self.resource_class(resource_id).await?;
        self.check(actor, class, Action::View)?;

        let intervals = self.store.conflicts(resource_id, window).await?;
        Ok(intervals
            .into_iter()
            .map(|i| ConflictInfo {
                assignment_id: i.id,
                flight_id: self.assignments.get(&i.id).map(|a| a.flight_id),
                window: i.window,
            })
            .collect())
    }

    /// Any known assignment, including cancelled ones not yet pruned.
    pub fn assignment(&self, actor: &Actor, assignment_id: Ulid) -> Result<Assignment, SchedulerError> {
        let record = self
            .assignments
            .get(&assignment_id)
            .map(|a| a.clone())
            .ok_or(SchedulerError::NotFound(assignment_id))?;
        self.check(actor, record.class, Action::View)?;
        Ok(record)
    }

    /// Committed assignments on one resource, in start order.
    pub async fn assignments_for_resource(
        &self,
        actor: &Actor,
        resource_id: Ulid,
    ) -> Result<Vec<Assignment>, SchedulerError> {
        let class = self.resource_class(resource_id).await?;
        self.check(actor, class, Action::View)?;
        Ok(self.committed_where(|a| a.resource_id == resource_id))
    }

    /// Committed assignments of one flight that the caller may see.
    pub fn assignments_for_flight(
        &self,
        actor: &Actor,
        flight_id: Ulid,
    ) -> Result<Vec<Assignment>, SchedulerError> {
        self.check(actor, ResourceClass::Flight, Action::View)?;
        Ok(self.committed_where(|a| {
            a.flight_id == flight_id && self.policy.authorize(actor.role, a.class, Action::View)
        }))
    }

    /// Resources the caller may view, optionally narrowed to one class.
    pub async fn list_resources(
        &self,
        actor: &Actor,
        class: Option<ResourceClass>,
    ) -> Result<Vec<ResourceInfo>, SchedulerError> {
        if let Some(class) = class {
            self.check(actor, class, Action::View)?;
        }
        let mut out = self.store.list_resources().await;
        out.retain(|r| {
            class.is_none_or(|c| c == r.class) && self.policy.authorize(actor.role, r.class, Action::View)
        });
        Ok(out)
    }

    /// Committed events on one resource, as they happen.
    pub async fn subscribe(
        &self,
        actor: &Actor,
        resource_id: Ulid,
    ) -> Result<broadcast::Receiver<Event>, SchedulerError> {
        let class = self.resource_class(resource_id).await?;
        self.check(actor, class, Action::View)?;
        Ok(self.notify.subscribe(resource_id))
    }

    // ── Recovery and housekeeping ────────────────────────────────

    /// Rebuild state from journal events without persisting anything.
    /// Returns how many events applied cleanly.
    pub async fn replay(&self, events: impl IntoIterator<Item = Event>) -> usize {
        let mut applied = 0;
        for event in events {
            match self.apply(&event).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("replay: skipping {event:?}: {e}"),
            }
        }
        let active = self
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Committed)
            .count();
        metrics::gauge!(ASSIGNMENTS_ACTIVE).set(active as f64);
        applied
    }

    /// Minimal event list that recreates the current state.
    /// Call under [`Scheduler::pause_mutations`] for a consistent cut.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .store
            .list_resources()
            .await
            .into_iter()
            .map(|r| Event::ResourceRegistered {
                id: r.id,
                class: r.class,
                parent_id: r.parent_id,
                name: r.name,
            })
            .collect();
        let mut records: Vec<Assignment> = self.assignments.iter().map(|a| a.clone()).collect();
        records.sort_by_key(|a| a.id);
        events.extend(records.into_iter().map(|a| match a.status {
            AssignmentStatus::Committed => Event::AssignmentCommitted {
                id: a.id,
                resource_id: a.resource_id,
                flight_id: a.flight_id,
                window: a.window,
            },
            AssignmentStatus::Cancelled => Event::AssignmentCancelled {
                id: a.id,
                resource_id: a.resource_id,
                flight_id: a.flight_id,
                window: a.window,
            },
        }));
        events
    }

    /// Block every mutation until the guard is dropped.
    pub async fn pause_mutations(&self) -> RwLockWriteGuard<'_, ()> {
        self.compaction.write().await
    }

    /// Assignments (committed or cancelled) whose window ended at or before `cutoff`.
    pub fn expired_assignments(&self, cutoff: Ms) -> Vec<Ulid> {
        self.assignments
            .iter()
            .filter(|a| a.window.is_past(cutoff))
            .map(|a| a.id)
            .collect()
    }

    /// Drop history that ended at or before `cutoff`, tombstones included. Each
    /// drop is journalled so a restart does not bring the record back.
    pub async fn prune_history(&self, cutoff: Ms) -> usize {
        let mut pruned = 0;
        for id in self.expired_assignments(cutoff) {
            match self.prune_one(id, cutoff).await {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => debug!("prune skip {id}: {e}"),
            }
        }
        if pruned > 0 {
            metrics::counter!(ASSIGNMENTS_PRUNED_TOTAL).increment(pruned as u64);
        }
        pruned
    }

    async fn prune_one(&self, id: Ulid, cutoff: Ms) -> Result<bool, SchedulerError> {
        let _pause = self.compaction.read().await;
        let (mut guard, record) = self.lock_assignment(id).await?;
        if !record.window.is_past(cutoff) {
            return Ok(false);
        }
        let released = guard.release(id);
        let event = Event::AssignmentReleased {
            id,
            resource_id: record.resource_id,
        };
        if let Err(e) = self.persist(&event).await {
            if let Some(interval) = released
                && let Err(undo) = guard.try_reserve(id, interval.window)
            {
                self.rollback_failed(id, undo);
            }
            return Err(e);
        }
        if record.status == AssignmentStatus::Committed {
            self.release_flight_slot(record.flight_id, record.class, id);
            metrics::gauge!(ASSIGNMENTS_ACTIVE).decrement(1.0);
        }
        self.assignments.remove(&id);
        Ok(true)
    }

    async fn apply(&self, event: &Event) -> Result<(), SchedulerError> {
        match event {
            Event::ResourceRegistered {
                id,
                class,
                parent_id,
                name,
            } => {
                self.store
                    .register_resource(*id, *class, *parent_id, name.clone())?;
            }
            Event::ResourceRemoved { id } => {
                let guard = self.store.lock(*id).await?;
                guard.remove();
                self.drop_records(*id);
            }
            Event::AssignmentCommitted {
                id,
                resource_id,
                flight_id,
                window,
            } => {
                let mut guard = self.store.lock(*resource_id).await?;
                guard.try_reserve(*id, *window)?;
                let class = guard.class();
                if self.options.one_active_per_flight {
                    self.flight_slots.insert((*flight_id, class), *id);
                }
                self.assignments.insert(
                    *id,
                    Assignment {
                        id: *id,
                        flight_id: *flight_id,
                        resource_id: *resource_id,
                        class,
                        window: *window,
                        status: AssignmentStatus::Committed,
                    },
                );
            }
            Event::AssignmentMoved {
                id,
                from_resource_id,
                resource_id,
                window,
            } => {
                if from_resource_id == resource_id {
                    let mut guard = self.store.lock(*resource_id).await?;
                    guard.replace(*id, *window)?;
                } else {
                    let (mut from, mut to) = self.store.lock_pair(*from_resource_id, *resource_id).await?;
                    to.transfer_from(&mut from, *id, *window)?;
                }
                if let Some(mut a) = self.assignments.get_mut(id) {
                    a.resource_id = *resource_id;
                    a.window = *window;
                }
            }
            Event::AssignmentCancelled {
                id,
                resource_id,
                flight_id,
                window,
            } => {
                let class = match self.assignments.get(id).map(|a| a.class) {
                    Some(class) => {
                        self.store.release(*resource_id, *id).await;
                        class
                    }
                    None => self.resource_class(*resource_id).await?,
                };
                self.release_flight_slot(*flight_id, class, *id);
                self.assignments.insert(
                    *id,
                    Assignment {
                        id: *id,
                        flight_id: *flight_id,
                        resource_id: *resource_id,
                        class,
                        window: *window,
                        status: AssignmentStatus::Cancelled,
                    },
                );
            }
            Event::AssignmentReleased { id, resource_id } => {
                self.store.release(*resource_id, *id).await;
                if let Some((_, a)) = self.assignments.remove(id) {
                    self.release_flight_slot(a.flight_id, a.class, a.id);
                }
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────

    fn check(&self, actor: &Actor, class: ResourceClass, action: Action) -> Result<(), SchedulerError> {
        if self.policy.authorize(actor.role, class, action) {
            return Ok(());
        }
        metrics::counter!(
            POLICY_DENIALS_TOTAL,
            "role" => actor.role.as_str(),
            "class" => class.as_str(),
            "action" => action.as_str()
        )
        .increment(1);
        warn!(subject = %actor.subject, role = %actor.role, %class, %action, "policy denied");
        Err(SchedulerError::Forbidden {
            role: actor.role,
            class,
            action,
        })
    }

    async fn persist(&self, event: &Event) -> Result<(), SchedulerError> {
        self.sink.persist(event).await.map_err(|e| {
            metrics::counter!(PERSISTENCE_FAILURES_TOTAL).increment(1);
            tracing::error!("journal write failed, rolling back: {e}");
            SchedulerError::Persistence(e.to_string())
        })
    }

    fn publish(&self, event: &Event) {
        self.notify.send(event.resource_id(), event);
    }

    /// Turn a store error into the caller-facing one, naming the flight on conflict.
    fn engine_error(&self, e: EngineError, class: ResourceClass) -> SchedulerError {
        match e {
            EngineError::Conflict { interval_id, window } => {
                metrics::counter!(CONFLICTS_TOTAL, "class" => class.as_str()).increment(1);
                let flight_id = self.assignments.get(&interval_id).map(|a| a.flight_id);
                debug!(%interval_id, start = window.start, end = window.end, "window taken");
                SchedulerError::ResourceConflict {
                    assignment_id: interval_id,
                    flight_id,
                    window,
                }
            }
            EngineError::InvariantViolation(msg) => {
                metrics::counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
                SchedulerError::Internal(msg)
            }
            other => other.into(),
        }
    }

    fn rollback_failed(&self, assignment_id: Ulid, e: EngineError) {
        metrics::counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
        tracing::error!(%assignment_id, "rollback after failed journal write did not apply: {e}");
    }

    async fn replace_locked(
        &self,
        guard: &mut ResourceGuard<'_>,
        record: &Assignment,
        window: Window,
    ) -> Result<Event, SchedulerError> {
        let previous = guard
            .replace(record.id, window)
            .map_err(|e| self.engine_error(e, record.class))?;
        let event = Event::AssignmentMoved {
            id: record.id,
            from_resource_id: record.resource_id,
            resource_id: record.resource_id,
            window,
        };
        if let Err(e) = self.persist(&event).await {
            if let Err(undo) = guard.replace(record.id, previous) {
                self.rollback_failed(record.id, undo);
            }
            return Err(e);
        }
        if let Some(mut a) = self.assignments.get_mut(&record.id) {
            a.window = window;
        }
        Ok(event)
    }

    /// Lock the resource currently holding `assignment_id`. Retries when a
    /// concurrent reassign moved it between lookup and lock.
    async fn lock_assignment(&self, assignment_id: Ulid) -> Result<(ResourceGuard<'_>, Assignment), SchedulerError> {
        loop {
            let resource_id = self.resource_of(assignment_id)?;
            let guard = match self.store.lock(resource_id).await {
                Ok(guard) => guard,
                Err(EngineError::NotFound(_)) => return Err(SchedulerError::NotFound(assignment_id)),
                Err(e) => return Err(e.into()),
            };
            if let Some(record) = self.record_on(assignment_id, resource_id)? {
                return Ok((guard, record));
            }
        }
    }

    fn resource_of(&self, assignment_id: Ulid) -> Result<Ulid, SchedulerError> {
        self.assignments
            .get(&assignment_id)
            .map(|a| a.resource_id)
            .ok_or(SchedulerError::NotFound(assignment_id))
    }

    fn record_class(&self, assignment_id: Ulid) -> Result<ResourceClass, SchedulerError> {
        self.assignments
            .get(&assignment_id)
            .map(|a| a.class)
            .ok_or(SchedulerError::NotFound(assignment_id))
    }

    /// The record, if it still lives on `resource_id`. `None` means it moved.
    fn record_on(&self, assignment_id: Ulid, resource_id: Ulid) -> Result<Option<Assignment>, SchedulerError> {
        match self.assignments.get(&assignment_id) {
            Some(a) if a.resource_id == resource_id => Ok(Some(a.clone())),
            Some(_) => Ok(None),
            None => Err(SchedulerError::NotFound(assignment_id)),
        }
    }

    async fn resource_class(&self, resource_id: Ulid) -> Result<ResourceClass, SchedulerError> {
        self.store
            .resource_info(resource_id)
            .await
            .map(|r| r.class)
            .ok_or(SchedulerError::NotFound(resource_id))
    }

    fn committed_where(&self, pred: impl Fn(&Assignment) -> bool) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Committed && pred(a.value()))
            .map(|a| a.clone())
            .collect();
        out.sort_by_key(|a| (a.window.start, a.id));
        out
    }

    /// Forget every record on a removed resource. Returns how many went.
    fn drop_records(&self, resource_id: Ulid) -> usize {
        let ids: Vec<Ulid> = self
            .assignments
            .iter()
            .filter(|a| a.resource_id == resource_id)
            .map(|a| a.id)
            .collect();
        for id in &ids {
            if let Some((_, a)) = self.assignments.remove(id) {
                self.release_flight_slot(a.flight_id, a.class, a.id);
                if a.status == AssignmentStatus::Committed {
                    metrics::gauge!(ASSIGNMENTS_ACTIVE).decrement(1.0);
                }
            }
        }
        ids.len()
    }

    fn claim_flight_slot(&self, flight_id: Ulid, class: ResourceClass, assignment_id: Ulid) -> Result<(), SchedulerError> {
        if !self.options.one_active_per_flight {
            return Ok(());
        }
        let now = now_ms();
        match self.flight_slots.entry((flight_id, class)) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let holder = *slot.get();
                // A holder without a record is an in-flight create.
                let active = self
                    .assignments
                    .get(&holder)
                    .is_none_or(|a| a.status == AssignmentStatus::Committed && !a.window.is_past(now));
                if active {
                    return Err(SchedulerError::FlightAlreadyAssigned {
                        flight_id,
                        class,
                        assignment_id: holder,
                    });
                }
                slot.insert(assignment_id);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(assignment_id);
            }
        }
        Ok(())
    }

    fn release_flight_slot(&self, flight_id: Ulid, class: ResourceClass, assignment_id: Ulid) {
        if self.options.one_active_per_flight {
            self.flight_slots
                .remove_if(&(flight_id, class), |_, holder| *holder == assignment_id);
        }
    }
}

fn ensure_class(guard: &ResourceGuard<'_>, expected: ResourceClass) -> Result<(), SchedulerError> {
    if guard.class() == expected {
        Ok(())
    } else {
        Err(SchedulerError::ClassMismatch {
            resource_id: guard.id(),
            expected,
            actual: guard.class(),
        })
    }
}

fn committed(record: Assignment) -> Result<Assignment, SchedulerError> {
    match record.status {
        AssignmentStatus::Committed => Ok(record),
        AssignmentStatus::Cancelled => Err(SchedulerError::NotFound(record.id)),
    }
}
