//! Hard limits enforced by the engine regardless of configuration.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not last longer than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Widest window accepted by availability and listing queries (~13 months).
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * 24 * 3_600_000;

pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_BATCH_SIZE: usize = 64;
pub const MAX_WINDOWS_PER_WEEK: usize = 7 * 8;
