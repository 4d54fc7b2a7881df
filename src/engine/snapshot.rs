use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// Latest image of every row, folded from WAL events. Replay builds the
/// store from one of these; the WAL writer keeps one current so compaction
/// can rewrite the log without touching live locks.
#[derive(Debug, Default, Clone)]
pub(crate) struct Snapshot {
    patterns: HashMap<Ulid, AvailabilityPattern>,
    windows: HashMap<Ulid, AvailabilityWindow>,
    bookings: HashMap<Ulid, Booking>,
    /// Keyed by booking id.
    reviews: HashMap<Ulid, BookingReview>,
}

impl Snapshot {
    pub fn from_events(events: &[Event]) -> Self {
        let mut snapshot = Self::default();
        for event in events {
            snapshot.fold(event);
        }
        snapshot
    }

    pub fn fold(&mut self, event: &Event) {
        match event {
            Event::PatternCreated { pattern } => {
                self.patterns.insert(pattern.id, pattern.clone());
            }
            Event::PatternToggled { id, enabled } => {
                if let Some(p) = self.patterns.get_mut(id) {
                    p.enabled = *enabled;
                }
            }
            Event::WindowCreated { window } => {
                self.windows.insert(window.id, window.clone());
            }
            Event::WindowStatusChanged { id, status } => {
                if let Some(w) = self.windows.get_mut(id) {
                    w.status = *status;
                }
            }
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::ReviewCreated { review } => {
                self.reviews
                    .entry(review.booking_id)
                    .or_insert_with(|| review.clone());
            }
        }
    }

    pub fn patterns(&self) -> Vec<&AvailabilityPattern> {
        sorted_by_id(self.patterns.values(), |p| p.id)
    }

    pub fn windows(&self) -> Vec<&AvailabilityWindow> {
        sorted_by_id(self.windows.values(), |w| w.id)
    }

    pub fn bookings(&self) -> Vec<&Booking> {
        sorted_by_id(self.bookings.values(), |b| b.id)
    }

    pub fn reviews(&self) -> Vec<&BookingReview> {
        sorted_by_id(self.reviews.values(), |r| r.id)
    }

    /// Minimal event sequence that recreates this snapshot.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.len());
        events.extend(self.patterns().into_iter().map(|p| Event::PatternCreated {
            pattern: p.clone(),
        }));
        events.extend(self.windows().into_iter().map(|w| Event::WindowCreated {
            window: w.clone(),
        }));
        events.extend(self.bookings().into_iter().map(|b| Event::BookingCreated {
            booking: b.clone(),
        }));
        events.extend(self.reviews().into_iter().map(|r| Event::ReviewCreated {
            review: r.clone(),
        }));
        events
    }

    pub fn len(&self) -> usize {
        self.patterns.len() + self.windows.len() + self.bookings.len() + self.reviews.len()
    }
}

// Ulids sort by creation time, which keeps replayed indexes in creation order.
fn sorted_by_id<'a, T>(rows: impl Iterator<Item = &'a T>, id: impl Fn(&T) -> Ulid) -> Vec<&'a T> {
    let mut rows: Vec<&T> = rows.collect();
    rows.sort_by_key(|r| id(r));
    rows
}
