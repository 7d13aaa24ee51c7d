//! Hard caps validated at the boundary. Everything here exists to keep a
//! single bad client from wedging the whole portal.

use crate::model::Ms;

/// Timestamps before the epoch are rejected outright.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 2100-01-01T00:00:00Z. Anything later is a typo, not a booking.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not run longer than 7 days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 86_400_000;

/// Availability queries are capped at ~3 months.
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * 86_400_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 320;
/// company / department / phone / location fields.
pub const MAX_FIELD_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MAX_PURPOSE_LEN: usize = 500;

pub const MAX_MEMBERS: usize = 100_000;
pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 50_000;

/// Business hours used for utilization reporting, minutes since local
/// midnight: 09:00 to 17:00.
pub const WORK_DAY_START_MIN: u16 = 9 * 60;
pub const WORK_DAY_END_MIN: u16 = 17 * 60;
