use crate::model::{DAY, Ms};

/// 2000-01-01T00:00:00Z. Anything earlier is a client bug, not a booking.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single window never spans more than one day.
pub const MAX_WINDOW_SPAN_MS: Ms = DAY;
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Upper bound on the date range of one materialization call.
pub const MAX_MATERIALIZE_DAYS: i64 = 366;

pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_PAYMENT_REFERENCE_LEN: usize = 256;
pub const MAX_REVIEW_COMMENT_LEN: usize = 4096;

/// Prices are stored with cents precision and capped well below Decimal overflow.
pub const MAX_PRICE_SCALE: u32 = 2;
pub const MAX_PRICE_UNITS: i64 = 1_000_000_000;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// A booking row can move between windows under a reschedule; lock acquisition
/// re-reads its window this many times before giving up.
pub const MAX_LOCK_RETRIES: usize = 8;
