use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::lifecycle::{TransitionMeta, apply_transition};
use crate::limits::{MAX_LOCK_RETRIES, MAX_PAYMENT_REFERENCE_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{TRANSITIONS_TOTAL, UNIQUE_INDEX_REJECTIONS_TOTAL};

use super::checks::{clean_text, validate_timestamp};
use super::{Engine, EngineError, resolve};

type WindowGuard = OwnedMutexGuard<AvailabilityWindow>;
type BookingGuard = OwnedMutexGuard<Booking>;

impl Engine {
    /// Lock a booking and the window it currently sits in, window first.
    /// Retries if a reschedule moved the booking in between.
    async fn lock_booking(&self, booking_id: Ulid) -> Result<(WindowGuard, BookingGuard), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let row = self
                .store
                .booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            let window_id = row.lock().await.window_id;
            let window = self
                .store
                .window(&window_id)
                .ok_or(EngineError::NotFound(window_id))?
                .lock_owned()
                .await;
            let booking = row.lock_owned().await;
            if booking.window_id == window_id {
                return Ok((window, booking));
            }
        }
        Err(EngineError::LimitExceeded("booking kept moving while locking"))
    }

    /// Lock the booking's current window and the reschedule target in id
    /// order. `None` for the target means both are the same window.
    async fn lock_window_pair(
        &self,
        current: Ulid,
        target: Ulid,
    ) -> Result<(WindowGuard, Option<WindowGuard>), EngineError> {
        let current_row = self
            .store
            .window(&current)
            .ok_or(EngineError::NotFound(current))?;
        if current == target {
            return Ok((current_row.lock_owned().await, None));
        }
        let target_row = self
            .store
            .window(&target)
            .ok_or(EngineError::WindowUnavailable(target))?;
        if current < target {
            let c = current_row.lock_owned().await;
            let t = target_row.lock_owned().await;
            Ok((c, Some(t)))
        } else {
            let t = target_row.lock_owned().await;
            let c = current_row.lock_owned().await;
            Ok((c, Some(t)))
        }
    }

    /// Persist `next` as the new image of `booking`. When the booking stops
    /// being binding its calendar, ledger and unique-index entries go with it.
    /// Caller holds the window and booking locks.
    async fn commit_update(&self, booking: &mut Booking, next: Booking) -> Result<(), EngineError> {
        self.wal_append(&Event::BookingUpdated {
            booking: next.clone(),
        })
        .await?;
        metrics::counter!(
            TRANSITIONS_TOTAL,
            "from" => booking.status.as_str(),
            "to" => next.status.as_str()
        )
        .increment(1);
        let released = booking.is_binding() && !next.is_binding();
        *booking = next;
        if released {
            let ledger = self.store.ledger(booking.user_id);
            let mut ledger = ledger.lock().await;
            self.store.release_binding(booking, &mut ledger).await;
        }
        Ok(())
    }

    /// No other binding booking may hold `window` or overlap `booking`.
    async fn ensure_sole_claim(&self, window: &AvailabilityWindow, booking: &Booking) -> Result<(), EngineError> {
        if let Some(holder) = self.store.unique.window_holder(&window.id)
            && holder != booking.id
        {
            return Err(EngineError::SlotAlreadyBooked(window.id));
        }
        let span = booking.span();
        let calendar = self.store.calendar(window.expert_id);
        let calendar = calendar.read().await;
        let contested = calendar
            .overlapping(&window.span)
            .any(|e| e.booking_id != booking.id && (e.window_id == window.id || e.span.overlaps(&span)));
        if contested {
            return Err(EngineError::SlotAlreadyBooked(window.id));
        }
        Ok(())
    }

    /// Expert accepts a pending booking; it moves on to await payment.
    pub async fn approve(&self, booking_id: Ulid, expert_id: Ulid) -> Result<Booking, EngineError> {
        let now = self.now();
        let (window, mut booking) = self.lock_booking(booking_id).await?;
        if booking.expert_id != expert_id {
            return Err(EngineError::Forbidden(expert_id));
        }
        let mut next = booking.clone();
        apply_transition(&mut next, BookingStatus::AwaitingPayment, TransitionMeta::at(now))?;
        self.ensure_sole_claim(&window, &booking).await?;
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} approved by {expert_id}");
        self.publish(NotificationKind::BookingApproved, booking.user_id, &booking, now);
        Ok(booking.clone())
    }

    pub async fn decline(
        &self,
        booking_id: Ulid,
        expert_id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason too long")?
            .unwrap_or_else(|| "Declined by expert".into());
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        if booking.expert_id != expert_id {
            return Err(EngineError::Forbidden(expert_id));
        }
        let mut next = booking.clone();
        apply_transition(
            &mut next,
            BookingStatus::Declined,
            TransitionMeta::at(now).with_actor(expert_id).with_reason(reason),
        )?;
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} declined by {expert_id}");
        self.publish(NotificationKind::BookingDeclined, booking.user_id, &booking, now);
        Ok(booking.clone())
    }

    /// Payment success. Moves AwaitingPayment through Paid to Confirmed and
    /// attaches the pair's chat room in the same commit. Any other status is
    /// a no-op that returns the booking as it stands, so redelivered
    /// confirmations are harmless.
    pub async fn confirm_payment(
        &self,
        booking_id: Ulid,
        payment_reference: Option<String>,
    ) -> Result<Booking, EngineError> {
        let reference = clean_text(
            payment_reference,
            MAX_PAYMENT_REFERENCE_LEN,
            "payment reference too long",
        )?;
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        if booking.status != BookingStatus::AwaitingPayment {
            info!(
                "payment confirmation for booking {booking_id} ignored in status {}",
                booking.status
            );
            return Ok(booking.clone());
        }

        let room = self
            .rooms
            .get_or_create_room(booking.user_id, booking.expert_id)
            .await
            .map_err(|e| EngineError::Messaging(e.to_string()))?;

        let mut next = booking.clone();
        apply_transition(
            &mut next,
            BookingStatus::Paid,
            TransitionMeta::at(now).with_payment_reference(reference),
        )?;
        apply_transition(&mut next, BookingStatus::Confirmed, TransitionMeta::at(now))?;
        next.chat_room.get_or_insert(room);
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} confirmed, room {room}");
        self.publish(NotificationKind::BookingConfirmed, booking.user_id, &booking, now);
        self.publish(NotificationKind::BookingConfirmed, booking.expert_id, &booking, now);
        Ok(booking.clone())
    }

    /// Payment failure. Idempotent once the booking is already failed.
    pub async fn fail(&self, booking_id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason too long")?
            .unwrap_or_else(|| "Payment failed".into());
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        if booking.status == BookingStatus::Failed {
            return Ok(booking.clone());
        }
        let mut next = booking.clone();
        apply_transition(
            &mut next,
            BookingStatus::Failed,
            TransitionMeta::at(now).with_reason(reason),
        )?;
        self.commit_update(&mut booking, next).await?;

        warn!("booking {booking_id} failed: {:?}", booking.reason);
        self.publish(NotificationKind::BookingFailed, booking.user_id, &booking, now);
        Ok(booking.clone())
    }

    /// Either participant may cancel a binding booking; the other side is told.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason too long")?;
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        let Some(counterpart) = booking.counterpart(actor) else {
            return Err(EngineError::Forbidden(actor));
        };
        let reason = reason.unwrap_or_else(|| {
            if actor == booking.user_id {
                "Cancelled by user".into()
            } else {
                "Cancelled by expert".into()
            }
        });
        let mut next = booking.clone();
        apply_transition(
            &mut next,
            BookingStatus::Cancelled,
            TransitionMeta::at(now).with_actor(actor).with_reason(reason),
        )?;
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} cancelled by {actor}");
        self.publish(NotificationKind::BookingCancelled, counterpart, &booking, now);
        Ok(booking.clone())
    }

    pub async fn complete(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        let mut next = booking.clone();
        apply_transition(&mut next, BookingStatus::Completed, TransitionMeta::at(now))?;
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} completed");
        self.publish(NotificationKind::BookingCompleted, booking.user_id, &booking, now);
        self.publish(NotificationKind::BookingCompleted, booking.expert_id, &booking, now);
        Ok(booking.clone())
    }

    /// Deadline passed before approval or payment.
    pub async fn expire(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let now = self.now();
        let (_window, mut booking) = self.lock_booking(booking_id).await?;
        let reason = match booking.status {
            BookingStatus::PendingApproval => "Expired awaiting approval",
            _ => "Expired awaiting payment",
        };
        let mut next = booking.clone();
        apply_transition(
            &mut next,
            BookingStatus::Expired,
            TransitionMeta::at(now).with_reason(reason),
        )?;
        self.commit_update(&mut booking, next).await?;

        info!("booking {booking_id} expired");
        self.publish(NotificationKind::BookingExpired, booking.user_id, &booking, now);
        Ok(booking.clone())
    }

    /// Move a binding booking to a new start, in the same window or another
    /// window of the same expert. Price and fee snapshots are kept; the
    /// status does not change. Limited by the policy's reschedule count and
    /// cutoff before the current start.
    pub async fn reschedule(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        window_id: Ulid,
        start: Ms,
    ) -> Result<Booking, EngineError> {
        validate_timestamp(start)?;
        let now = self.now();

        for _ in 0..MAX_LOCK_RETRIES {
            let row = self
                .store
                .booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            let current_window_id = row.lock().await.window_id;
            let (current_window, target_window) =
                self.lock_window_pair(current_window_id, window_id).await?;
            let mut booking = row.lock_owned().await;
            if booking.window_id != current_window_id {
                continue;
            }
            let target: &AvailabilityWindow = target_window.as_deref().unwrap_or(&current_window);

            if booking.user_id != actor {
                return Err(EngineError::Forbidden(actor));
            }
            if !booking.is_binding() {
                return Err(EngineError::RescheduleNotAllowed("booking is no longer active"));
            }
            if booking.reschedule_count >= self.policy.max_reschedules {
                return Err(EngineError::RescheduleNotAllowed("reschedule limit reached"));
            }
            if booking.start - now < self.policy.reschedule_cutoff {
                return Err(EngineError::RescheduleNotAllowed("too close to the session start"));
            }
            if !target.is_active() {
                return Err(EngineError::WindowUnavailable(target.id));
            }
            if target.expert_id != booking.expert_id {
                return Err(EngineError::invalid("target window belongs to another expert"));
            }

            let span = resolve(
                target,
                start,
                booking.end - booking.start,
                now,
                self.policy.utc_offset,
            )?;
            let _rows = self.lock_conflict_scope(target, &span, Some(booking.id)).await?;
            let ledger = self.store.ledger(booking.user_id);
            let mut ledger = ledger.lock().await;
            self.check_user_policy(&ledger, booking.expert_id, span.start, Some(booking.id))?;

            let moved = target.id != booking.window_id;
            if moved
                && let Err(violation) = self.store.unique.claim(booking.id, booking.user_id, target.id)
            {
                metrics::counter!(UNIQUE_INDEX_REJECTIONS_TOTAL).increment(1);
                warn!("unique index rejected reschedule onto window {}: {violation:?}", target.id);
                return Err(EngineError::SlotAlreadyBooked(target.id));
            }

            let mut next = booking.clone();
            next.rescheduled_from = Some(booking.start);
            next.start = span.start;
            next.end = span.end;
            next.window_id = target.id;
            next.reschedule_count += 1;

            if let Err(e) = self
                .wal_append(&Event::BookingUpdated {
                    booking: next.clone(),
                })
                .await
            {
                if moved {
                    self.store.unique.release(booking.id, booking.user_id, target.id);
                }
                return Err(e);
            }
            self.store.move_binding(&booking, &next, &mut ledger).await;
            *booking = next;

            info!(
                "booking {booking_id} rescheduled to window {} at {}",
                booking.window_id, booking.start
            );
            self.publish(NotificationKind::BookingRescheduled, booking.expert_id, &booking, now);
            return Ok(booking.clone());
        }
        Err(EngineError::LimitExceeded("booking kept moving while locking"))
    }
}
