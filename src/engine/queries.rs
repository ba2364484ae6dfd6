use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, IntervalStore};

impl IntervalStore {
    /// Every interval on `resource_id` overlapping `window`, in start order.
    /// Read-only; runs under the shared lock.
    pub async fn conflicts(&self, resource_id: Ulid, window: Window) -> Result<Vec<Interval>, EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidWindow(window));
        }
        if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.removed {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard.overlapping(&window).copied().collect())
    }

    pub async fn intervals(&self, resource_id: Ulid) -> Result<Vec<Interval>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.intervals.clone())
    }

    /// Intervals on `resource_id` that end after `now`.
    pub async fn active_count(&self, resource_id: Ulid, now: Ms) -> Result<usize, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.active_count(now))
    }

    pub async fn resource_info(&self, resource_id: Ulid) -> Option<ResourceInfo> {
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        (!guard.removed).then(|| guard.info())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.resource_count());
        for id in self.resource_ids() {
            if let Some(info) = self.resource_info(id).await {
                out.push(info);
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
