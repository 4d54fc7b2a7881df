use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Which window constraint a requested booking violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WindowConstraint {
    #[error("window is disabled")]
    WindowDisabled,
    #[error("start falls on a different weekday than the window's pattern")]
    WeekdayMismatch,
    #[error("booking does not fit inside the window")]
    OutsideWindow,
    #[error("duration exceeds the window length")]
    DurationExceedsWindow,
    #[error("start is not in the future")]
    StartInPast,
    #[error("duration must be positive")]
    ZeroDuration,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("window {0} is unavailable")]
    WindowUnavailable(Ulid),
    #[error("window mismatch: {0}")]
    WindowMismatch(WindowConstraint),
    #[error("window {0} is already booked")]
    SlotAlreadyBooked(Ulid),
    #[error("already booked with expert {expert_id} on {date}")]
    DuplicateSameDayBooking { expert_id: Ulid, date: NaiveDate },
    #[error("active booking limit of {limit} reached")]
    ActiveBookingLimitExceeded { limit: usize },
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("{0} may not perform this action")]
    Forbidden(Ulid),
    #[error("users cannot book their own windows")]
    SelfBooking,
    #[error("overlaps window {0}")]
    WindowOverlap(Ulid),
    #[error("reschedule not allowed: {0}")]
    RescheduleNotAllowed(&'static str),
    #[error("review not allowed: {0}")]
    ReviewNotAllowed(&'static str),
    #[error("booking {0} has already been reviewed")]
    AlreadyReviewed(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("messaging error: {0}")]
    Messaging(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::WindowUnavailable(_) => "window_unavailable",
            EngineError::WindowMismatch(_) => "window_mismatch",
            EngineError::SlotAlreadyBooked(_) => "slot_already_booked",
            EngineError::DuplicateSameDayBooking { .. } => "duplicate_same_day_booking",
            EngineError::ActiveBookingLimitExceeded { .. } => "active_booking_limit_exceeded",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::SelfBooking => "self_booking",
            EngineError::WindowOverlap(_) => "window_overlap",
            EngineError::RescheduleNotAllowed(_) => "reschedule_not_allowed",
            EngineError::ReviewNotAllowed(_) => "review_not_allowed",
            EngineError::AlreadyReviewed(_) => "already_reviewed",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Messaging(_) => "messaging",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

impl From<WindowConstraint> for EngineError {
    fn from(c: WindowConstraint) -> Self {
        EngineError::WindowMismatch(c)
    }
}
