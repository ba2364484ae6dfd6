use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape check done before any lookup.
pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    use crate::limits::*;
    if !window.is_valid() {
        return Err(EngineError::InvalidWindow(*window));
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// First interval overlapping `window`, ignoring `exclude` (the interval being moved).
pub(crate) fn first_conflict<'a>(
    rs: &'a ResourceState,
    window: &Window,
    exclude: Option<ulid::Ulid>,
) -> Option<&'a Interval> {
    rs.overlapping(window).find(|i| Some(i.id) != exclude)
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    window: &Window,
    exclude: Option<ulid::Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(rs, window, exclude) {
        Some(existing) => Err(EngineError::Conflict {
            interval_id: existing.id,
            window: existing.window,
        }),
        None => Ok(()),
    }
}

/// Re-check the neighbours of a freshly inserted interval. Sorted order means an
/// overlap, if any, must involve the immediate predecessor or successor.
pub(crate) fn verify_neighbours(rs: &ResourceState, pos: usize) -> Result<(), EngineError> {
    let inserted = &rs.intervals[pos];
    let prev = pos.checked_sub(1).map(|p| &rs.intervals[p]);
    let next = rs.intervals.get(pos + 1);
    for other in prev.into_iter().chain(next) {
        if other.window.overlaps(&inserted.window) {
            return Err(EngineError::InvariantViolation(format!(
                "resource {}: interval {} [{}, {}) overlaps committed interval {} [{}, {})",
                rs.id,
                inserted.id,
                inserted.window.start,
                inserted.window.end,
                other.id,
                other.window.start,
                other.window.end,
            )));
        }
    }
    Ok(())
}
