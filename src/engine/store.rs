use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::snapshot::Snapshot;

pub(crate) type PatternRow = Arc<Mutex<AvailabilityPattern>>;
pub(crate) type WindowRow = Arc<Mutex<AvailabilityWindow>>;
pub(crate) type BookingRow = Arc<Mutex<Booking>>;

// ── Expert calendar ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalendarEntry {
    pub booking_id: Ulid,
    pub window_id: Ulid,
    pub span: Span,
}

impl CalendarEntry {
    pub fn of(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            window_id: booking.window_id,
            span: booking.span(),
        }
    }
}

/// Binding bookings of one expert, sorted by start.
#[derive(Debug, Default)]
pub(crate) struct ExpertCalendar {
    entries: Vec<CalendarEntry>,
}

impl ExpertCalendar {
    pub fn insert(&mut self, entry: CalendarEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Option<CalendarEntry> {
        let pos = self.entries.iter().position(|e| e.booking_id == booking_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &CalendarEntry> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Expert catalog ───────────────────────────────────────────────

/// Mirror of an expert's windows used for overlap checks. Mutated only
/// while the catalog lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CatalogEntry {
    pub window_id: Ulid,
    pub span: Span,
    pub active: bool,
    pub origin: Option<(Ulid, NaiveDate)>,
}

impl CatalogEntry {
    pub fn of(window: &AvailabilityWindow) -> Self {
        Self {
            window_id: window.id,
            span: window.span,
            active: window.is_active(),
            origin: window.origin.map(|o| (o.pattern_id, o.date)),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ExpertCatalog {
    windows: Vec<CatalogEntry>,
}

impl ExpertCatalog {
    pub fn insert(&mut self, entry: CatalogEntry) {
        let pos = self
            .windows
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, entry);
    }

    pub fn set_active(&mut self, window_id: Ulid, active: bool) {
        if let Some(entry) = self.windows.iter_mut().find(|e| e.window_id == window_id) {
            entry.active = active;
        }
    }

    pub fn window_ids(&self) -> Vec<Ulid> {
        self.windows.iter().map(|e| e.window_id).collect()
    }

    pub fn has_origin(&self, pattern_id: Ulid, date: NaiveDate) -> bool {
        self.windows
            .iter()
            .any(|e| e.origin == Some((pattern_id, date)))
    }

    /// First window overlapping `span` that still claims its time: active,
    /// or disabled while a binding booking sits in it.
    pub fn conflicting_window(
        &self,
        span: &Span,
        exclude: Option<Ulid>,
        unique: &UniqueIndex,
    ) -> Option<Ulid> {
        let right_bound = self.windows.partition_point(|e| e.span.start < span.end);
        self.windows[..right_bound]
            .iter()
            .filter(|e| e.span.end > span.start)
            .filter(|e| Some(e.window_id) != exclude)
            .find(|e| e.active || unique.window_holder(&e.window_id).is_some())
            .map(|e| e.window_id)
    }
}

// ── User ledger ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LedgerEntry {
    pub booking_id: Ulid,
    pub expert_id: Ulid,
    pub start: Ms,
}

/// Binding bookings of one user. Its lock serializes the per-user policy
/// checks (same-day guard, active cap) against concurrent reservations.
#[derive(Debug, Default)]
pub(crate) struct UserLedger {
    entries: Vec<LedgerEntry>,
}

impl UserLedger {
    pub fn push(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, booking_id: Ulid) {
        self.entries.retain(|e| e.booking_id != booking_id);
    }

    pub fn update_start(&mut self, booking_id: Ulid, start: Ms) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.booking_id == booking_id) {
            e.start = start;
        }
    }

    pub fn others(&self, exclude: Option<Ulid>) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(move |e| Some(e.booking_id) != exclude)
    }
}

// ── Unique index ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniqueViolation {
    Window(Ulid),
    UserWindow(Ulid),
}

/// Storage-level uniqueness over binding bookings, independent of the
/// lock-based conflict check: one per window and one per (user, window).
#[derive(Debug, Default)]
pub(crate) struct UniqueIndex {
    by_window: DashMap<Ulid, Ulid>,
    by_user_window: DashMap<(Ulid, Ulid), Ulid>,
}

impl UniqueIndex {
    pub fn claim(&self, booking_id: Ulid, user_id: Ulid, window_id: Ulid) -> Result<(), UniqueViolation> {
        match self.by_window.entry(window_id) {
            Entry::Occupied(e) if *e.get() != booking_id => {
                return Err(UniqueViolation::Window(*e.get()));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(v) => {
                v.insert(booking_id);
            }
        }
        match self.by_user_window.entry((user_id, window_id)) {
            Entry::Occupied(e) if *e.get() != booking_id => {
                let holder = *e.get();
                drop(e);
                self.by_window.remove_if(&window_id, |_, b| *b == booking_id);
                Err(UniqueViolation::UserWindow(holder))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(booking_id);
                Ok(())
            }
        }
    }

    pub fn release(&self, booking_id: Ulid, user_id: Ulid, window_id: Ulid) {
        self.by_window.remove_if(&window_id, |_, b| *b == booking_id);
        self.by_user_window
            .remove_if(&(user_id, window_id), |_, b| *b == booking_id);
    }

    pub fn window_holder(&self, window_id: &Ulid) -> Option<Ulid> {
        self.by_window.get(window_id).map(|e| *e.value())
    }
}

// ── Store ────────────────────────────────────────────────────────

/// All rows and derived indexes. Lock order for any transaction:
/// expert catalog, window rows (by id), booking rows (by id), user ledger.
/// Expert calendars are leaves: nothing else is acquired while one is held.
#[derive(Default)]
pub(crate) struct InMemoryStore {
    patterns: DashMap<Ulid, PatternRow>,
    windows: DashMap<Ulid, WindowRow>,
    bookings: DashMap<Ulid, BookingRow>,
    catalogs: DashMap<Ulid, Arc<Mutex<ExpertCatalog>>>,
    calendars: DashMap<Ulid, Arc<RwLock<ExpertCalendar>>>,
    ledgers: DashMap<Ulid, Arc<Mutex<UserLedger>>>,
    patterns_by_expert: DashMap<Ulid, Vec<Ulid>>,
    bookings_by_user: DashMap<Ulid, Vec<Ulid>>,
    bookings_by_expert: DashMap<Ulid, Vec<Ulid>>,
    /// Keyed by booking id.
    reviews: DashMap<Ulid, BookingReview>,
    reviewed_by_expert: DashMap<Ulid, Vec<Ulid>>,
    pub(crate) unique: UniqueIndex,
}

impl InMemoryStore {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let store = Self::default();
        let mut catalogs: HashMap<Ulid, ExpertCatalog> = HashMap::new();
        let mut calendars: HashMap<Ulid, ExpertCalendar> = HashMap::new();
        let mut ledgers: HashMap<Ulid, UserLedger> = HashMap::new();

        for pattern in snapshot.patterns() {
            store
                .patterns_by_expert
                .entry(pattern.expert_id)
                .or_default()
                .push(pattern.id);
            store
                .patterns
                .insert(pattern.id, Arc::new(Mutex::new(pattern.clone())));
        }
        for window in snapshot.windows() {
            catalogs
                .entry(window.expert_id)
                .or_default()
                .insert(CatalogEntry::of(window));
            store
                .windows
                .insert(window.id, Arc::new(Mutex::new(window.clone())));
        }
        for booking in snapshot.bookings() {
            store.index_booking(booking);
            if booking.is_binding() {
                if let Err(v) = store
                    .unique
                    .claim(booking.id, booking.user_id, booking.window_id)
                {
                    tracing::warn!("replay: booking {} collides with {v:?}", booking.id);
                }
                calendars
                    .entry(booking.expert_id)
                    .or_default()
                    .insert(CalendarEntry::of(booking));
                ledgers.entry(booking.user_id).or_default().push(LedgerEntry {
                    booking_id: booking.id,
                    expert_id: booking.expert_id,
                    start: booking.start,
                });
            }
            store
                .bookings
                .insert(booking.id, Arc::new(Mutex::new(booking.clone())));
        }

        for review in snapshot.reviews() {
            store.insert_review(review.clone());
        }

        for (id, catalog) in catalogs {
            store.catalogs.insert(id, Arc::new(Mutex::new(catalog)));
        }
        for (id, calendar) in calendars {
            store.calendars.insert(id, Arc::new(RwLock::new(calendar)));
        }
        for (id, ledger) in ledgers {
            store.ledgers.insert(id, Arc::new(Mutex::new(ledger)));
        }
        store
    }

    // ── Row lookup ───────────────────────────────────────────

    pub fn pattern(&self, id: &Ulid) -> Option<PatternRow> {
        self.patterns.get(id).map(|e| e.value().clone())
    }

    pub fn window(&self, id: &Ulid) -> Option<WindowRow> {
        self.windows.get(id).map(|e| e.value().clone())
    }

    pub fn booking(&self, id: &Ulid) -> Option<BookingRow> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn catalog(&self, expert_id: Ulid) -> Arc<Mutex<ExpertCatalog>> {
        self.catalogs.entry(expert_id).or_default().value().clone()
    }

    pub fn calendar(&self, expert_id: Ulid) -> Arc<RwLock<ExpertCalendar>> {
        self.calendars.entry(expert_id).or_default().value().clone()
    }

    pub fn ledger(&self, user_id: Ulid) -> Arc<Mutex<UserLedger>> {
        self.ledgers.entry(user_id).or_default().value().clone()
    }

    pub fn pattern_ids_of(&self, expert_id: &Ulid) -> Vec<Ulid> {
        self.patterns_by_expert
            .get(expert_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn booking_ids_of(&self, party: &Ulid, role: PartyRole) -> Vec<Ulid> {
        let index = match role {
            PartyRole::User => &self.bookings_by_user,
            PartyRole::Expert => &self.bookings_by_expert,
        };
        index
            .get(party)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn review(&self, booking_id: &Ulid) -> Option<BookingReview> {
        self.reviews.get(booking_id).map(|e| e.value().clone())
    }

    /// Reviews of an expert's sessions in the order they were left.
    pub fn reviews_of(&self, expert_id: &Ulid) -> Vec<BookingReview> {
        let ids = self
            .reviewed_by_expert
            .get(expert_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.review(id)).collect()
    }

    pub fn booking_rows(&self) -> Vec<BookingRow> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }

    // ── Mutation (caller holds the locks named in each doc) ──

    pub fn insert_pattern(&self, pattern: AvailabilityPattern) {
        self.patterns_by_expert
            .entry(pattern.expert_id)
            .or_default()
            .push(pattern.id);
        self.patterns
            .insert(pattern.id, Arc::new(Mutex::new(pattern)));
    }

    /// Caller holds the reviewed booking's row lock.
    pub fn insert_review(&self, review: BookingReview) {
        self.reviewed_by_expert
            .entry(review.expert_id)
            .or_default()
            .push(review.booking_id);
        self.reviews.insert(review.booking_id, review);
    }

    /// Caller holds the expert's catalog lock.
    pub fn insert_window(&self, window: AvailabilityWindow, catalog: &mut ExpertCatalog) {
        catalog.insert(CatalogEntry::of(&window));
        self.windows.insert(window.id, Arc::new(Mutex::new(window)));
    }

    /// Caller holds the window lock and the user's ledger. The unique index
    /// claim has already been taken.
    pub async fn insert_booking(&self, booking: Booking, ledger: &mut UserLedger) {
        self.calendar(booking.expert_id)
            .write()
            .await
            .insert(CalendarEntry::of(&booking));
        ledger.push(LedgerEntry {
            booking_id: booking.id,
            expert_id: booking.expert_id,
            start: booking.start,
        });
        self.index_booking(&booking);
        self.bookings
            .insert(booking.id, Arc::new(Mutex::new(booking)));
    }

    /// Drop a booking that just became terminal from every binding index.
    pub async fn release_binding(&self, booking: &Booking, ledger: &mut UserLedger) {
        self.calendar(booking.expert_id)
            .write()
            .await
            .remove(booking.id);
        ledger.remove(booking.id);
        self.unique
            .release(booking.id, booking.user_id, booking.window_id);
    }

    /// Re-point the binding indexes of a rescheduled booking. The claim on
    /// the new window has already been taken.
    pub async fn move_binding(&self, before: &Booking, after: &Booking, ledger: &mut UserLedger) {
        {
            let calendar = self.calendar(after.expert_id);
            let mut calendar = calendar.write().await;
            calendar.remove(before.id);
            calendar.insert(CalendarEntry::of(after));
        }
        ledger.update_start(after.id, after.start);
        if before.window_id != after.window_id {
            self.unique
                .release(before.id, before.user_id, before.window_id);
        }
    }

    fn index_booking(&self, booking: &Booking) {
        self.bookings_by_user
            .entry(booking.user_id)
            .or_default()
            .push(booking.id);
        self.bookings_by_expert
            .entry(booking.expert_id)
            .or_default()
            .push(booking.id);
    }
}
