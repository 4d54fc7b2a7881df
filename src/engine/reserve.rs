use std::time::Instant;

use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::local_date;
use crate::fees;
use crate::limits::MAX_DURATION_MINUTES;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS, UNIQUE_INDEX_REJECTIONS_TOTAL};

use super::checks::{validate_price, validate_timestamp};
use super::store::UserLedger;
use super::{Engine, EngineError, WindowConstraint, resolve};

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub user_id: Ulid,
    pub window_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    /// Only honoured when the policy allows price overrides.
    pub price_override: Option<Decimal>,
}

impl Engine {
    /// Atomically check every booking rule and create a booking, or fail
    /// without side effects.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn reserve_inner(&self, req: ReserveRequest) -> Result<Booking, EngineError> {
        let now = self.now();
        if req.duration_minutes == 0 {
            return Err(WindowConstraint::ZeroDuration.into());
        }
        if req.duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("duration too long"));
        }
        validate_timestamp(req.start)?;
        let price_override = match req.price_override {
            Some(_) if !self.policy.allow_price_override => {
                return Err(EngineError::invalid("price override is not allowed"));
            }
            Some(price) => {
                validate_price(price)?;
                Some(price)
            }
            None => None,
        };

        let window = self
            .store
            .window(&req.window_id)
            .ok_or(EngineError::WindowUnavailable(req.window_id))?
            .lock_owned()
            .await;
        if !window.is_active() {
            return Err(EngineError::WindowUnavailable(window.id));
        }
        if window.expert_id == req.user_id {
            return Err(EngineError::SelfBooking);
        }
        let duration_ms = Ms::from(req.duration_minutes) * MINUTE;
        let span = resolve(&window, req.start, duration_ms, now, self.policy.utc_offset)?;

        let _rows = self.lock_conflict_scope(&window, &span, None).await?;

        let ledger = self.store.ledger(req.user_id);
        let mut ledger = ledger.lock().await;
        self.check_user_policy(&ledger, window.expert_id, span.start, None)?;

        let price = price_override.unwrap_or(window.price);
        let split = fees::split(price, self.policy.platform_fee_percent);
        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            expert_id: window.expert_id,
            window_id: window.id,
            status: if window.requires_approval {
                BookingStatus::PendingApproval
            } else {
                BookingStatus::AwaitingPayment
            },
            start: span.start,
            end: span.end,
            duration_minutes: req.duration_minutes,
            price,
            platform_fee_percent: self.policy.platform_fee_percent,
            platform_fee_amount: split.platform_fee,
            expert_earning_amount: split.expert_earning,
            requires_approval: window.requires_approval,
            created_at: now,
            approved_at: None,
            paid_at: None,
            confirmed_at: None,
            completed_at: None,
            declined_at: None,
            cancelled_at: None,
            expired_at: None,
            failed_at: None,
            reason: None,
            cancelled_by: None,
            payment_reference: None,
            chat_room: None,
            reschedule_count: 0,
            rescheduled_from: None,
        };

        if let Err(violation) = self
            .store
            .unique
            .claim(booking.id, booking.user_id, booking.window_id)
        {
            metrics::counter!(UNIQUE_INDEX_REJECTIONS_TOTAL).increment(1);
            warn!("unique index rejected booking on window {}: {violation:?}", window.id);
            return Err(EngineError::SlotAlreadyBooked(window.id));
        }
        if let Err(e) = self
            .wal_append(&Event::BookingCreated {
                booking: booking.clone(),
            })
            .await
        {
            self.store
                .unique
                .release(booking.id, booking.user_id, booking.window_id);
            return Err(e);
        }
        self.store.insert_booking(booking.clone(), &mut ledger).await;

        info!(
            "booking {} created: user {} window {} status {}",
            booking.id, booking.user_id, booking.window_id, booking.status
        );
        self.publish(NotificationKind::BookingCreated, booking.expert_id, &booking, now);
        Ok(booking)
    }

    /// Lock every booking row that could collide with `span` on `window`, in
    /// id order, and fail if any of them is binding and either overlaps
    /// `span` or already sits in the same window.
    pub(super) async fn lock_conflict_scope(
        &self,
        window: &AvailabilityWindow,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<OwnedMutexGuard<Booking>>, EngineError> {
        let search = Span::new(
            span.start.min(window.span.start),
            span.end.max(window.span.end),
        );
        let mut ids: Vec<Ulid> = {
            let calendar = self.store.calendar(window.expert_id);
            let calendar = calendar.read().await;
            calendar
                .overlapping(&search)
                .map(|e| e.booking_id)
                .filter(|id| Some(*id) != exclude)
                .collect()
        };
        ids.sort();
        ids.dedup();

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = self.store.booking(&id) else {
                continue;
            };
            let other = row.lock_owned().await;
            if other.is_binding() && (other.window_id == window.id || other.span().overlaps(span)) {
                return Err(EngineError::SlotAlreadyBooked(window.id));
            }
            rows.push(other);
        }
        Ok(rows)
    }

    /// Same-day guard, then the active-booking cap. `exclude` leaves one of
    /// the user's own bookings out of both counts.
    pub(super) fn check_user_policy(
        &self,
        ledger: &UserLedger,
        expert_id: Ulid,
        start: Ms,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let offset = self.policy.utc_offset;
        if self.policy.same_day_guard {
            let date = local_date(start, offset)
                .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
            if ledger
                .others(exclude)
                .any(|e| e.expert_id == expert_id && local_date(e.start, offset) == Some(date))
            {
                return Err(EngineError::DuplicateSameDayBooking { expert_id, date });
            }
        }
        if let Some(limit) = self.policy.max_active_bookings
            && ledger.others(exclude).count() >= limit
        {
            return Err(EngineError::ActiveBookingLimitExceeded { limit });
        }
        Ok(())
    }
}
