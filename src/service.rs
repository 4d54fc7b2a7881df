//! Caller-facing API over the engine: request arguments in, serializable
//! views or an [`ApiError`] out.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::calendar::{date_weekday_index, local_date};
use crate::engine::{Engine, EngineError, MaterializeRequest, NewPattern, NewWindow, ReserveRequest};
use crate::lifecycle::can_transition;
use crate::model::*;

/// Error surfaced to callers: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_input",
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Decline,
}

/// A booking plus what its participants may still do with it.
#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub can_cancel: bool,
    pub can_reschedule: bool,
    /// Completed and not reviewed yet.
    pub can_review: bool,
}

/// Every review of one expert with the mean rating, rounded to cents.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertReviews {
    pub expert_id: Ulid,
    pub count: usize,
    pub average_rating: Option<Decimal>,
    pub reviews: Vec<BookingReview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowView {
    #[serde(flatten)]
    pub window: AvailabilityWindow,
    /// Active, not yet over, and not held by a binding booking.
    pub bookable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternView {
    #[serde(flatten)]
    pub pattern: AvailabilityPattern,
    /// The next business date, today included, the pattern applies to.
    pub next_date: Option<NaiveDate>,
}

pub struct BookingService {
    engine: Arc<Engine>,
}

impl BookingService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn booking_view(&self, booking: Booking) -> BookingView {
        let now = self.engine.now();
        let policy = self.engine.policy();
        let can_cancel = can_transition(booking.status, BookingStatus::Cancelled);
        let can_reschedule = booking.is_binding()
            && booking.reschedule_count < policy.max_reschedules
            && booking.start - now >= policy.reschedule_cutoff;
        let can_review = booking.status == BookingStatus::Completed
            && self.engine.get_review(booking.id).is_none();
        BookingView {
            booking,
            can_cancel,
            can_reschedule,
            can_review,
        }
    }

    fn window_view(&self, window: AvailabilityWindow) -> WindowView {
        let bookable = window.is_active()
            && window.span.end > self.engine.now()
            && self.engine.window_holder(&window.id).is_none();
        WindowView { window, bookable }
    }

    fn pattern_view(&self, pattern: AvailabilityPattern) -> PatternView {
        let today = local_date(self.engine.now(), self.engine.policy().utc_offset);
        let next_date = today.and_then(|today| {
            let first = today.max(pattern.active_from);
            first
                .iter_days()
                .take(7)
                .find(|d| date_weekday_index(*d) == pattern.weekday)
                .filter(|d| pattern.enabled && pattern.is_active_on(*d))
        });
        PatternView { pattern, next_date }
    }

    // ── Bookings ─────────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        user_id: Ulid,
        window_id: Ulid,
        start: Ms,
        duration_minutes: u32,
        price_override: Option<Decimal>,
    ) -> Result<BookingView, ApiError> {
        let booking = self
            .engine
            .reserve(ReserveRequest {
                user_id,
                window_id,
                start,
                duration_minutes,
                price_override,
            })
            .await
            .inspect_err(|e| debug!("reserve on window {window_id} by {user_id} rejected: {e}"))?;
        Ok(self.booking_view(booking))
    }

    pub async fn approve_booking(
        &self,
        booking_id: Ulid,
        expert_id: Ulid,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<BookingView, ApiError> {
        let booking = match decision {
            ApprovalDecision::Approve => self.engine.approve(booking_id, expert_id).await?,
            ApprovalDecision::Decline => self.engine.decline(booking_id, expert_id, note).await?,
        };
        Ok(self.booking_view(booking))
    }

    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<BookingView, ApiError> {
        let booking = self.engine.cancel(booking_id, actor, reason).await?;
        Ok(self.booking_view(booking))
    }

    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        window_id: Ulid,
        start: Ms,
    ) -> Result<BookingView, ApiError> {
        let booking = self
            .engine
            .reschedule(booking_id, actor, window_id, start)
            .await
            .inspect_err(|e| debug!("reschedule of {booking_id} rejected: {e}"))?;
        Ok(self.booking_view(booking))
    }

    /// Only the booking's participants may read it.
    pub async fn get_booking(&self, booking_id: Ulid, party: Ulid) -> Result<BookingView, ApiError> {
        let booking = self.engine.get_booking(booking_id).await?;
        if !booking.is_participant(party) {
            return Err(EngineError::Forbidden(party).into());
        }
        Ok(self.booking_view(booking))
    }

    pub async fn list_bookings(&self, party: Ulid, role: PartyRole) -> Vec<BookingView> {
        self.engine
            .list_bookings(party, role)
            .await
            .into_iter()
            .map(|b| self.booking_view(b))
            .collect()
    }

    // ── Collaborator callbacks ───────────────────────────────────

    pub async fn confirm_payment(
        &self,
        booking_id: Ulid,
        payment_reference: Option<String>,
    ) -> Result<BookingView, ApiError> {
        let booking = self.engine.confirm_payment(booking_id, payment_reference).await?;
        Ok(self.booking_view(booking))
    }

    pub async fn fail_payment(
        &self,
        booking_id: Ulid,
        reason: Option<String>,
    ) -> Result<BookingView, ApiError> {
        let booking = self.engine.fail(booking_id, reason).await?;
        Ok(self.booking_view(booking))
    }

    pub async fn complete_booking(&self, booking_id: Ulid) -> Result<BookingView, ApiError> {
        let booking = self.engine.complete(booking_id).await?;
        Ok(self.booking_view(booking))
    }

    pub async fn expire_booking(&self, booking_id: Ulid) -> Result<BookingView, ApiError> {
        let booking = self.engine.expire(booking_id).await?;
        Ok(self.booking_view(booking))
    }

    // ── Reviews ──────────────────────────────────────────────────

    pub async fn review_booking(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        rating: u8,
        comment: Option<String>,
    ) -> Result<BookingReview, ApiError> {
        Ok(self.engine.review(booking_id, user_id, rating, comment).await?)
    }

    pub fn list_reviews(&self, expert_id: Ulid) -> ExpertReviews {
        let reviews = self.engine.list_reviews(expert_id);
        let average_rating = (!reviews.is_empty()).then(|| {
            let total: Decimal = reviews.iter().map(|r| Decimal::from(r.rating)).sum();
            (total / Decimal::from(reviews.len())).round_dp(2)
        });
        ExpertReviews {
            expert_id,
            count: reviews.len(),
            average_rating,
            reviews,
        }
    }

    // ── Catalog ──────────────────────────────────────────────────

    pub async fn create_window(&self, new: NewWindow) -> Result<WindowView, ApiError> {
        let window = self.engine.create_window(new).await?;
        Ok(self.window_view(window))
    }

    pub async fn set_window_status(
        &self,
        window_id: Ulid,
        expert_id: Ulid,
        enabled: bool,
    ) -> Result<WindowView, ApiError> {
        let status = if enabled {
            WindowStatus::Active
        } else {
            WindowStatus::Disabled
        };
        let window = self.engine.set_window_status(window_id, expert_id, status).await?;
        Ok(self.window_view(window))
    }

    /// Public availability: an expert's active windows that have not ended yet.
    pub async fn list_windows(&self, expert_id: Ulid) -> Vec<WindowView> {
        let now = self.engine.now();
        self.engine
            .list_windows(expert_id, Some(now), false)
            .await
            .into_iter()
            .map(|w| self.window_view(w))
            .collect()
    }

    pub async fn create_pattern(&self, new: NewPattern) -> Result<PatternView, ApiError> {
        let pattern = self.engine.create_pattern(new).await?;
        Ok(self.pattern_view(pattern))
    }

    pub async fn set_pattern_enabled(
        &self,
        pattern_id: Ulid,
        expert_id: Ulid,
        enabled: bool,
    ) -> Result<PatternView, ApiError> {
        let pattern = self
            .engine
            .set_pattern_enabled(pattern_id, expert_id, enabled)
            .await?;
        Ok(self.pattern_view(pattern))
    }

    pub async fn list_patterns(&self, expert_id: Ulid) -> Vec<PatternView> {
        self.engine
            .list_patterns(expert_id)
            .await
            .into_iter()
            .map(|p| self.pattern_view(p))
            .collect()
    }

    pub async fn materialize_pattern(
        &self,
        req: MaterializeRequest,
    ) -> Result<Vec<WindowView>, ApiError> {
        let windows = self.engine.materialize_pattern(req).await?;
        Ok(windows.into_iter().map(|w| self.window_view(w)).collect())
    }
}
