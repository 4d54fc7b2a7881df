use chrono::FixedOffset;

use crate::calendar::weekday_index;
use crate::model::*;

use super::WindowConstraint;

/// Check that `[start, start + duration)` is a bookable interval of `window`
/// at time `now` and return it.
///
/// Pattern-derived windows also require `start` to fall on the pattern's
/// weekday in the business offset. Length is checked before placement so an
/// over-long request reports `DurationExceedsWindow` rather than `OutsideWindow`.
pub fn resolve(
    window: &AvailabilityWindow,
    start: Ms,
    duration_ms: Ms,
    now: Ms,
    offset: FixedOffset,
) -> Result<Span, WindowConstraint> {
    if duration_ms <= 0 {
        return Err(WindowConstraint::ZeroDuration);
    }
    if !window.is_active() {
        return Err(WindowConstraint::WindowDisabled);
    }
    if start <= now {
        return Err(WindowConstraint::StartInPast);
    }
    if let Some(origin) = &window.origin
        && weekday_index(start, offset) != Some(origin.weekday)
    {
        return Err(WindowConstraint::WeekdayMismatch);
    }
    if duration_ms > window.span.duration_ms() {
        return Err(WindowConstraint::DurationExceedsWindow);
    }
    let requested = Span::new(start, start + duration_ms);
    if !window.span.contains_span(&requested) {
        return Err(WindowConstraint::OutsideWindow);
    }
    Ok(requested)
}
