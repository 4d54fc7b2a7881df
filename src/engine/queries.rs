use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let row = self.store.booking(&id).ok_or(EngineError::NotFound(id))?;
        let booking = row.lock().await;
        Ok(booking.clone())
    }

    pub async fn get_window(&self, id: Ulid) -> Result<AvailabilityWindow, EngineError> {
        let row = self.store.window(&id).ok_or(EngineError::NotFound(id))?;
        let window = row.lock().await;
        Ok(window.clone())
    }

    pub async fn get_pattern(&self, id: Ulid) -> Result<AvailabilityPattern, EngineError> {
        let row = self.store.pattern(&id).ok_or(EngineError::NotFound(id))?;
        let pattern = row.lock().await;
        Ok(pattern.clone())
    }

    /// Every booking the party takes part in from the given side, newest first.
    pub async fn list_bookings(&self, party: Ulid, role: PartyRole) -> Vec<Booking> {
        let ids = self.store.booking_ids_of(&party, role);
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.store.booking(&id) {
                bookings.push(row.lock().await.clone());
            }
        }
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookings
    }

    /// An expert's windows ordered by start. `from` drops windows that end
    /// at or before it; disabled windows are left out unless asked for.
    pub async fn list_windows(
        &self,
        expert_id: Ulid,
        from: Option<Ms>,
        include_disabled: bool,
    ) -> Vec<AvailabilityWindow> {
        let ids = {
            let catalog = self.store.catalog(expert_id);
            let catalog = catalog.lock().await;
            catalog.window_ids()
        };
        let mut windows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = self.store.window(&id) else {
                continue;
            };
            let window = row.lock().await;
            if (include_disabled || window.is_active()) && from.is_none_or(|from| window.span.end > from) {
                windows.push(window.clone());
            }
        }
        windows.sort_by_key(|w| w.span.start);
        windows
    }

    pub async fn list_patterns(&self, expert_id: Ulid) -> Vec<AvailabilityPattern> {
        let mut patterns = Vec::new();
        for id in self.store.pattern_ids_of(&expert_id) {
            if let Some(row) = self.store.pattern(&id) {
                patterns.push(row.lock().await.clone());
            }
        }
        patterns
    }

    /// The booking currently holding `window_id`, if any.
    pub fn window_holder(&self, window_id: &Ulid) -> Option<Ulid> {
        self.store.unique.window_holder(window_id)
    }

    /// Bookings still waiting on approval or payment whose deadline, or
    /// whose session start, has passed. Rows locked by an in-flight
    /// transaction are skipped and picked up on a later sweep.
    pub fn collect_overdue(&self, now: Ms, approval_ttl: Ms, payment_ttl: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for row in self.store.booking_rows() {
            let Ok(booking) = row.try_lock() else {
                continue;
            };
            let deadline = match booking.status {
                BookingStatus::PendingApproval => booking.created_at + approval_ttl,
                BookingStatus::AwaitingPayment => {
                    booking.approved_at.unwrap_or(booking.created_at) + payment_ttl
                }
                _ => continue,
            };
            if deadline.min(booking.start) <= now {
                due.push(booking.id);
            }
        }
        due
    }
}
