use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::{date_weekday_index, instant_at};
use crate::limits::MAX_MATERIALIZE_DAYS;
use crate::model::*;

use super::checks::{validate_price, validate_timestamp, validate_window_span};
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewPattern {
    pub expert_id: Ulid,
    pub weekday: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active_from: NaiveDate,
    pub active_until: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewWindow {
    pub expert_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub price: Decimal,
    pub requires_approval: bool,
}

/// Expand a pattern into concrete windows for every matching date in
/// `[from, to]`.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub pattern_id: Ulid,
    pub expert_id: Ulid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub price: Decimal,
    pub requires_approval: bool,
}

impl Engine {
    pub async fn create_pattern(&self, new: NewPattern) -> Result<AvailabilityPattern, EngineError> {
        if new.weekday > 6 {
            return Err(EngineError::invalid("weekday must be 0 (Monday) through 6 (Sunday)"));
        }
        if new.end_time <= new.start_time {
            return Err(EngineError::invalid("pattern end_time must be after start_time"));
        }
        if let Some(until) = new.active_until
            && until < new.active_from
        {
            return Err(EngineError::invalid("active_until is before active_from"));
        }

        let pattern = AvailabilityPattern {
            id: Ulid::new(),
            expert_id: new.expert_id,
            weekday: new.weekday,
            start_time: new.start_time,
            end_time: new.end_time,
            active_from: new.active_from,
            active_until: new.active_until,
            enabled: true,
            created_at: self.now(),
        };
        self.wal_append(&Event::PatternCreated {
            pattern: pattern.clone(),
        })
        .await?;
        self.store.insert_pattern(pattern.clone());
        info!(
            "pattern {} created for expert {} (weekday {})",
            pattern.id, pattern.expert_id, pattern.weekday
        );
        Ok(pattern)
    }

    pub async fn set_pattern_enabled(
        &self,
        pattern_id: Ulid,
        expert_id: Ulid,
        enabled: bool,
    ) -> Result<AvailabilityPattern, EngineError> {
        let row = self
            .store
            .pattern(&pattern_id)
            .ok_or(EngineError::NotFound(pattern_id))?;
        let mut pattern = row.lock().await;
        if pattern.expert_id != expert_id {
            return Err(EngineError::Forbidden(expert_id));
        }
        if pattern.enabled == enabled {
            return Ok(pattern.clone());
        }
        self.wal_append(&Event::PatternToggled {
            id: pattern_id,
            enabled,
        })
        .await?;
        pattern.enabled = enabled;
        info!("pattern {pattern_id} enabled={enabled}");
        Ok(pattern.clone())
    }

    /// Create the windows a pattern implies over a date range. Dates that
    /// already have a window from this pattern, dates whose start has passed,
    /// and dates that would overlap another window are skipped, so repeated
    /// calls are idempotent. A disabled pattern materializes nothing.
    pub async fn materialize_pattern(
        &self,
        req: MaterializeRequest,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        if req.to < req.from {
            return Err(EngineError::invalid("materialization range ends before it starts"));
        }
        if (req.to - req.from).num_days() >= MAX_MATERIALIZE_DAYS {
            return Err(EngineError::LimitExceeded("materialization range too long"));
        }
        validate_price(req.price)?;

        let row = self
            .store
            .pattern(&req.pattern_id)
            .ok_or(EngineError::NotFound(req.pattern_id))?;
        // Held throughout so concurrent materializations of one pattern serialize.
        let pattern = row.lock().await;
        if pattern.expert_id != req.expert_id {
            return Err(EngineError::Forbidden(req.expert_id));
        }
        if !pattern.enabled {
            debug!("pattern {} is disabled, nothing to materialize", pattern.id);
            return Ok(Vec::new());
        }

        let now = self.now();
        let offset = self.policy.utc_offset;
        let catalog = self.store.catalog(pattern.expert_id);
        let mut catalog = catalog.lock().await;
        let mut created = Vec::new();

        for date in req.from.iter_days().take_while(|d| *d <= req.to) {
            if date_weekday_index(date) != pattern.weekday
                || !pattern.is_active_on(date)
                || catalog.has_origin(pattern.id, date)
            {
                continue;
            }
            let (Some(start), Some(end)) = (
                instant_at(date, pattern.start_time, offset),
                instant_at(date, pattern.end_time, offset),
            ) else {
                continue;
            };
            if start <= now || validate_timestamp(end).is_err() {
                continue;
            }
            let span = Span::new(start, end);
            if let Some(existing) = catalog.conflicting_window(&span, None, &self.store.unique) {
                debug!(
                    "pattern {} on {date}: overlaps window {existing}, skipped",
                    pattern.id
                );
                continue;
            }

            let window = AvailabilityWindow {
                id: Ulid::new(),
                expert_id: pattern.expert_id,
                span,
                price: req.price,
                requires_approval: req.requires_approval,
                status: WindowStatus::Active,
                origin: Some(WindowOrigin {
                    pattern_id: pattern.id,
                    weekday: pattern.weekday,
                    date,
                }),
                created_at: now,
            };
            self.wal_append(&Event::WindowCreated {
                window: window.clone(),
            })
            .await?;
            self.store.insert_window(window.clone(), &mut catalog);
            created.push(window);
        }

        info!(
            "pattern {} materialized {} windows for {}..={}",
            pattern.id,
            created.len(),
            req.from,
            req.to
        );
        Ok(created)
    }

    pub async fn create_window(&self, new: NewWindow) -> Result<AvailabilityWindow, EngineError> {
        let span = validate_window_span(new.start, new.end)?;
        validate_price(new.price)?;
        let now = self.now();
        if span.start <= now {
            return Err(EngineError::invalid("window must start in the future"));
        }

        let catalog = self.store.catalog(new.expert_id);
        let mut catalog = catalog.lock().await;
        if let Some(existing) = catalog.conflicting_window(&span, None, &self.store.unique) {
            return Err(EngineError::WindowOverlap(existing));
        }

        let window = AvailabilityWindow {
            id: Ulid::new(),
            expert_id: new.expert_id,
            span,
            price: new.price,
            requires_approval: new.requires_approval,
            status: WindowStatus::Active,
            origin: None,
            created_at: now,
        };
        self.wal_append(&Event::WindowCreated {
            window: window.clone(),
        })
        .await?;
        self.store.insert_window(window.clone(), &mut catalog);
        info!("window {} created for expert {}", window.id, window.expert_id);
        Ok(window)
    }

    /// Enable or disable a window. Disabling never touches existing
    /// bookings; re-enabling re-checks overlap against the expert's other
    /// windows.
    pub async fn set_window_status(
        &self,
        window_id: Ulid,
        expert_id: Ulid,
        status: WindowStatus,
    ) -> Result<AvailabilityWindow, EngineError> {
        let row = self
            .store
            .window(&window_id)
            .ok_or(EngineError::NotFound(window_id))?;
        let owner = row.lock().await.expert_id;
        if owner != expert_id {
            return Err(EngineError::Forbidden(expert_id));
        }

        let catalog = self.store.catalog(owner);
        let mut catalog = catalog.lock().await;
        let mut window = row.lock().await;
        if window.status == status {
            return Ok(window.clone());
        }
        if status == WindowStatus::Active
            && let Some(existing) =
                catalog.conflicting_window(&window.span, Some(window_id), &self.store.unique)
        {
            return Err(EngineError::WindowOverlap(existing));
        }

        self.wal_append(&Event::WindowStatusChanged {
            id: window_id,
            status,
        })
        .await?;
        window.status = status;
        catalog.set_active(window_id, status == WindowStatus::Active);
        info!("window {window_id} is now {status:?}");
        Ok(window.clone())
    }
}
