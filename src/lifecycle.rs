//! Booking status transition table.
//!
//! ```text
//! PendingApproval -> AwaitingPayment | Declined | Cancelled | Expired | Failed
//! AwaitingPayment -> Paid | Cancelled | Expired | Failed
//! Paid            -> Confirmed | Cancelled | Failed
//! Confirmed       -> Completed | Cancelled
//! ```
//! Everything else, including every edge out of a terminal status, is illegal.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Booking, BookingStatus, Ms};

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (PendingApproval, AwaitingPayment | Declined | Cancelled | Expired | Failed)
            | (AwaitingPayment, Paid | Cancelled | Expired | Failed)
            | (Paid, Confirmed | Cancelled | Failed)
            | (Confirmed, Completed | Cancelled)
    )
}

pub fn valid_transitions(from: BookingStatus) -> Vec<BookingStatus> {
    BookingStatus::ALL
        .into_iter()
        .filter(|to| can_transition(from, *to))
        .collect()
}

/// Side data recorded alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    pub at: Ms,
    pub reason: Option<String>,
    pub actor: Option<Ulid>,
    pub payment_reference: Option<String>,
}

impl TransitionMeta {
    pub fn at(at: Ms) -> Self {
        Self {
            at,
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_actor(mut self, actor: Ulid) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_payment_reference(mut self, reference: Option<String>) -> Self {
        self.payment_reference = reference;
        self
    }
}

/// Move `booking` to `to`, stamping the matching timestamp. Leaves the
/// booking untouched when the edge is not in the table.
pub fn apply_transition(
    booking: &mut Booking,
    to: BookingStatus,
    meta: TransitionMeta,
) -> Result<(), EngineError> {
    let from = booking.status;
    if !can_transition(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    match to {
        BookingStatus::PendingApproval => {}
        BookingStatus::AwaitingPayment => booking.approved_at = Some(meta.at),
        BookingStatus::Paid => {
            booking.paid_at = Some(meta.at);
            if meta.payment_reference.is_some() {
                booking.payment_reference = meta.payment_reference;
            }
        }
        BookingStatus::Confirmed => booking.confirmed_at = Some(meta.at),
        BookingStatus::Completed => booking.completed_at = Some(meta.at),
        BookingStatus::Declined => {
            booking.declined_at = Some(meta.at);
            booking.reason = meta.reason;
        }
        BookingStatus::Cancelled => {
            booking.cancelled_at = Some(meta.at);
            booking.cancelled_by = meta.actor;
            booking.reason = meta.reason;
        }
        BookingStatus::Expired => {
            booking.expired_at = Some(meta.at);
            booking.reason = meta.reason;
        }
        BookingStatus::Failed => {
            booking.failed_at = Some(meta.at);
            booking.reason = meta.reason;
        }
    }
    booking.status = to;
    Ok(())
}
