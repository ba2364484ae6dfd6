use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy::ResourceClass;

use super::conflict::{check_no_conflict, validate_window, verify_neighbours};
use super::{EngineError, IntervalStore};

/// Exclusive hold on one resource. Check-and-commit sequences run entirely
/// under this guard; dropping it publishes the result.
pub struct ResourceGuard<'a> {
    store: &'a IntervalStore,
    state: OwnedRwLockWriteGuard<ResourceState>,
}

impl<'a> ResourceGuard<'a> {
    pub(super) fn new(store: &'a IntervalStore, state: OwnedRwLockWriteGuard<ResourceState>) -> Self {
        Self { store, state }
    }

    pub fn id(&self) -> Ulid {
        self.state.id
    }

    pub fn class(&self) -> ResourceClass {
        self.state.class
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    /// Insert `window` iff it overlaps nothing on this resource.
    pub fn try_reserve(&mut self, interval_id: Ulid, window: Window) -> Result<(), EngineError> {
        validate_window(&window)?;
        self.ensure_room()?;
        if self.store.resource_for_interval(&interval_id).is_some() {
            return Err(EngineError::AlreadyExists(interval_id));
        }
        check_no_conflict(&self.state, &window, None)?;
        self.commit(Interval { id: interval_id, window })
    }

    /// Move an existing interval to `window`, ignoring its own current slot.
    /// Returns the previous window.
    pub fn replace(&mut self, interval_id: Ulid, window: Window) -> Result<Window, EngineError> {
        validate_window(&window)?;
        let previous = self
            .state
            .get_interval(interval_id)
            .map(|i| i.window)
            .ok_or(EngineError::NotFound(interval_id))?;
        check_no_conflict(&self.state, &window, Some(interval_id))?;

        self.state.remove_interval(interval_id);
        if let Err(e) = self.commit(Interval { id: interval_id, window }) {
            self.state.insert_interval(Interval { id: interval_id, window: previous });
            return Err(e);
        }
        Ok(previous)
    }

    /// Unconditional removal. `None` when the interval is not here.
    pub fn release(&mut self, interval_id: Ulid) -> Option<Interval> {
        let removed = self.state.remove_interval(interval_id)?;
        self.store.unmap_interval(&interval_id);
        Some(removed)
    }

    /// Move an interval from `from` onto this resource at `window`.
    /// Both guards are held, so the old slot is never visible as free while the
    /// new one is still unclaimed. Returns the previous window on `from`.
    pub fn transfer_from(
        &mut self,
        from: &mut ResourceGuard<'_>,
        interval_id: Ulid,
        window: Window,
    ) -> Result<Window, EngineError> {
        validate_window(&window)?;
        self.ensure_room()?;
        let previous = from
            .state
            .get_interval(interval_id)
            .map(|i| i.window)
            .ok_or(EngineError::NotFound(interval_id))?;
        check_no_conflict(&self.state, &window, None)?;

        from.state.remove_interval(interval_id);
        if let Err(e) = self.commit(Interval { id: interval_id, window }) {
            from.state.insert_interval(Interval { id: interval_id, window: previous });
            return Err(e);
        }
        Ok(previous)
    }

    /// Fails with `InUse` if any interval ends after `now`.
    pub fn ensure_idle(&self, now: Ms) -> Result<(), EngineError> {
        match self.state.active_count(now) {
            0 => Ok(()),
            active => Err(EngineError::InUse {
                resource_id: self.state.id,
                active,
            }),
        }
    }

    /// Drop the resource from the store, returning the intervals it still held.
    /// Tasks queued on the lock observe `removed` and fail with `NotFound`.
    pub fn remove(mut self) -> Vec<Interval> {
        self.state.removed = true;
        let id = self.state.id;
        let intervals = std::mem::take(&mut self.state.intervals);
        for interval in &intervals {
            self.store.unmap_interval(&interval.id);
        }
        self.store.resources.remove(&id);
        intervals
    }

    fn ensure_room(&self) -> Result<(), EngineError> {
        if self.state.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        Ok(())
    }

    fn commit(&mut self, interval: Interval) -> Result<(), EngineError> {
        let pos = self.state.insert_interval(interval);
        if let Err(e) = verify_neighbours(&self.state, pos) {
            self.state.intervals.remove(pos);
            tracing::error!(resource_id = %self.state.id, "{e}");
            return Err(e);
        }
        self.store.map_interval(interval.id, self.state.id);
        Ok(())
    }
}

impl IntervalStore {
    /// Add a resource and hand back its lock, so the caller can finish
    /// persisting before anyone else reserves on it.
    pub fn register_resource(
        &self,
        id: Ulid,
        class: ResourceClass,
        parent_id: Option<Ulid>,
        name: Option<String>,
    ) -> Result<ResourceGuard<'_>, EngineError> {
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
        if parent_id == Some(id) {
            return Err(EngineError::InvalidParent(id));
        }

        let rs = Arc::new(RwLock::new(ResourceState::new(id, class, parent_id, name)));
        let state = rs
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::InvariantViolation(format!("fresh resource {id} already locked")))?;

        match self.resources.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(rs);
                Ok(ResourceGuard::new(self, state))
            }
        }
    }

    pub async fn try_reserve(
        &self,
        resource_id: Ulid,
        interval_id: Ulid,
        window: Window,
    ) -> Result<(), EngineError> {
        validate_window(&window)?;
        let mut guard = self.lock(resource_id).await?;
        guard.try_reserve(interval_id, window)
    }

    pub async fn replace(
        &self,
        resource_id: Ulid,
        interval_id: Ulid,
        window: Window,
    ) -> Result<Window, EngineError> {
        validate_window(&window)?;
        let mut guard = self.lock(resource_id).await?;
        guard.replace(interval_id, window)
    }

    /// Always succeeds; unknown resource or interval is a no-op.
    pub async fn release(&self, resource_id: Ulid, interval_id: Ulid) -> Option<Interval> {
        let mut guard = self.lock(resource_id).await.ok()?;
        guard.release(interval_id)
    }

    /// Remove a resource that holds no interval ending after `now`.
    pub async fn remove_resource(&self, resource_id: Ulid, now: Ms) -> Result<Vec<Interval>, EngineError> {
        let guard = self.lock(resource_id).await?;
        guard.ensure_idle(now)?;
        Ok(guard.remove())
    }
}
