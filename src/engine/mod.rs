//! Per-resource interval index with enforced non-overlap.
//!
//! Every gate or runway owns a sorted `Vec<Interval>` behind its own
//! `tokio::sync::RwLock`. Mutations hold the write lock across check and commit,
//! so concurrent reservations on one resource serialize while different
//! resources proceed independently. Reads take the read lock and therefore see
//! either the state before or after any in-flight commit, never a torn one.

mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::now_ms;
pub(crate) use conflict::validate_window;
pub use error::EngineError;
pub use mutations::ResourceGuard;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

#[derive(Default)]
pub struct IntervalStore {
    resources: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookup: interval id → resource id
    interval_to_resource: DashMap<Ulid, Ulid>,
}

impl IntervalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_interval(&self, interval_id: &Ulid) -> Option<Ulid> {
        self.interval_to_resource.get(interval_id).map(|e| *e.value())
    }

    pub fn resource_ids(&self) -> Vec<Ulid> {
        self.resources.iter().map(|e| *e.key()).collect()
    }

    /// Acquire the exclusive lock for one resource.
    pub async fn lock(&self, resource_id: Ulid) -> Result<ResourceGuard<'_>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let state = rs.write_owned().await;
        if state.removed {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(ResourceGuard::new(self, state))
    }

    /// Lock two distinct resources in id order so opposite-direction moves cannot deadlock.
    /// Returns the guards in argument order.
    pub async fn lock_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> Result<(ResourceGuard<'_>, ResourceGuard<'_>), EngineError> {
        if a == b {
            return Err(EngineError::InvariantViolation(format!(
                "lock_pair called twice on resource {a}"
            )));
        }
        if a < b {
            let ga = self.lock(a).await?;
            let gb = self.lock(b).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock(b).await?;
            let ga = self.lock(a).await?;
            Ok((ga, gb))
        }
    }

    fn map_interval(&self, interval_id: Ulid, resource_id: Ulid) {
        self.interval_to_resource.insert(interval_id, resource_id);
    }

    fn unmap_interval(&self, interval_id: &Ulid) {
        self.interval_to_resource.remove(interval_id);
    }
}
