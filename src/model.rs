use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::rooms::RoomRef;

/// Unix milliseconds. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingApproval,
    AwaitingPayment,
    Paid,
    Confirmed,
    Completed,
    Declined,
    Cancelled,
    Expired,
    Failed,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 9] = [
        BookingStatus::PendingApproval,
        BookingStatus::AwaitingPayment,
        BookingStatus::Paid,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Declined,
        BookingStatus::Cancelled,
        BookingStatus::Expired,
        BookingStatus::Failed,
    ];

    /// A binding booking still occupies its window.
    pub fn is_binding(self) -> bool {
        matches!(
            self,
            BookingStatus::PendingApproval
                | BookingStatus::AwaitingPayment
                | BookingStatus::Paid
                | BookingStatus::Confirmed
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_binding()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::PendingApproval => "pending_approval",
            BookingStatus::AwaitingPayment => "awaiting_payment",
            BookingStatus::Paid => "paid",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
            BookingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a booking a party is looking from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    User,
    Expert,
}

// ── Availability ─────────────────────────────────────────────────

/// Recurring weekly availability rule owned by an expert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPattern {
    pub id: Ulid,
    pub expert_id: Ulid,
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active_from: NaiveDate,
    pub active_until: Option<NaiveDate>,
    pub enabled: bool,
    pub created_at: Ms,
}

impl AvailabilityPattern {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        date >= self.active_from && self.active_until.is_none_or(|until| date <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Active,
    Disabled,
}

/// Where a materialized window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOrigin {
    pub pattern_id: Ulid,
    pub weekday: u8,
    pub date: NaiveDate,
}

/// A concrete, capacity-1 bookable interval for one expert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub expert_id: Ulid,
    pub span: Span,
    pub price: Decimal,
    pub requires_approval: bool,
    pub status: WindowStatus,
    pub origin: Option<WindowOrigin>,
    pub created_at: Ms,
}

impl AvailabilityWindow {
    pub fn is_active(&self) -> bool {
        self.status == WindowStatus::Active
    }
}

// ── Booking ──────────────────────────────────────────────────────

/// The reservation record. Snapshot fields (times, price, fees) are copied
/// from the window once at creation and never recomputed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub window_id: Ulid,
    pub status: BookingStatus,

    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    pub price: Decimal,
    pub platform_fee_percent: Decimal,
    pub platform_fee_amount: Decimal,
    pub expert_earning_amount: Decimal,
    pub requires_approval: bool,

    pub created_at: Ms,
    pub approved_at: Option<Ms>,
    pub paid_at: Option<Ms>,
    pub confirmed_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub declined_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub expired_at: Option<Ms>,
    pub failed_at: Option<Ms>,

    /// Why the booking reached its terminal state, if anyone said.
    pub reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub payment_reference: Option<String>,
    pub chat_room: Option<RoomRef>,

    pub reschedule_count: u32,
    pub rescheduled_from: Option<Ms>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_binding(&self) -> bool {
        self.status.is_binding()
    }

    pub fn is_participant(&self, party: Ulid) -> bool {
        party == self.user_id || party == self.expert_id
    }

    /// The other participant, or `None` if `party` is not on this booking.
    pub fn counterpart(&self, party: Ulid) -> Option<Ulid> {
        if party == self.user_id {
            Some(self.expert_id)
        } else if party == self.expert_id {
            Some(self.user_id)
        } else {
            None
        }
    }
}

// ── Review ───────────────────────────────────────────────────────

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// The user's rating of a completed session. At most one per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingReview {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: Ms,
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat record types persisted to the WAL. Booking records carry the full
/// row image so replay never re-derives state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PatternCreated { pattern: AvailabilityPattern },
    PatternToggled { id: Ulid, enabled: bool },
    WindowCreated { window: AvailabilityWindow },
    WindowStatusChanged { id: Ulid, status: WindowStatus },
    BookingCreated { booking: Booking },
    BookingUpdated { booking: Booking },
    ReviewCreated { review: BookingReview },
}
