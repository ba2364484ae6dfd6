use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single assignment may hold a resource for at most 7 days.
pub const MAX_WINDOW_DURATION_MS: Ms = 7 * 24 * 3_600_000;
/// Diagnostic conflict queries may look at most 1 year ahead.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SUBJECT_LEN: usize = 256;

pub const MAX_LINE_LEN: usize = 64 * 1024;
