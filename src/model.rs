use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::ResourceClass;

/// Unix milliseconds (UTC). Every internal timestamp uses this type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// `None` for zero-length or inverted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Saturates instead of overflowing on extreme bounds.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Ended at or before `now`.
    pub fn is_past(&self, now: Ms) -> bool {
        self.end <= now
    }
}

/// One booked window on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub window: Window,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub class: ResourceClass,
    /// Terminal for a gate, airport for a runway.
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
    /// Set once the resource is deleted; guards still held by waiters see it.
    pub removed: bool,
    /// Sorted by `window.start`, pairwise non-overlapping.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(id: Ulid, class: ResourceClass, parent_id: Option<Ulid>, name: Option<String>) -> Self {
        Self {
            id,
            class,
            parent_id,
            name,
            removed: false,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by window.start. Returns the index.
    pub fn insert_interval(&mut self, interval: Interval) -> usize {
        let pos = self
            .intervals
            .partition_point(|i| i.window.start <= interval.window.start);
        self.intervals.insert(pos, interval);
        pos
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn get_interval(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Return only intervals whose window overlaps the query.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.window.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.window.end > query.start)
    }

    /// Intervals still running or starting after `now`.
    pub fn active_count(&self, now: Ms) -> usize {
        self.intervals.iter().filter(|i| !i.window.is_past(now)).count()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            class: self.class,
            parent_id: self.parent_id,
            name: self.name.clone(),
            intervals: self.intervals.len(),
        }
    }
}

/// Journal record. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        class: ResourceClass,
        parent_id: Option<Ulid>,
        name: Option<String>,
    },
    ResourceRemoved {
        id: Ulid,
    },
    AssignmentCommitted {
        id: Ulid,
        resource_id: Ulid,
        flight_id: Ulid,
        window: Window,
    },
    AssignmentMoved {
        id: Ulid,
        from_resource_id: Ulid,
        resource_id: Ulid,
        window: Window,
    },
    /// Carries the whole record so a compacted journal can restore the tombstone.
    AssignmentCancelled {
        id: Ulid,
        resource_id: Ulid,
        flight_id: Ulid,
        window: Window,
    },
    AssignmentReleased {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// Resource whose subscribers should see this event.
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceRegistered { id, .. } | Event::ResourceRemoved { id } => *id,
            Event::AssignmentCommitted { resource_id, .. }
            | Event::AssignmentMoved { resource_id, .. }
            | Event::AssignmentCancelled { resource_id, .. }
            | Event::AssignmentReleased { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub class: ResourceClass,
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
    pub intervals: usize,
}
