//! Newline-delimited JSON framing: one [`Request`] per line in, one
//! [`Response`] per line out.
//!
//! ```text
//! > {"op":"create_booking","user_id":"01J…","window_id":"01J…","start":1717495200000,"duration_minutes":60}
//! < {"ok":true,"data":{"id":"01J…","status":"awaiting_payment",…}}
//! < {"ok":false,"error":{"code":"slot_already_booked","message":"…"}}
//! ```
//!
//! Prices travel as decimal strings (`"49.90"`), instants as Unix
//! milliseconds, dates as `YYYY-MM-DD` and times of day as `HH:MM:SS`.

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodecError;
use ulid::Ulid;

use crate::model::{Ms, PartyRole};
use crate::notify::Notification;
use crate::service::{ApiError, ApprovalDecision};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    CreateBooking {
        user_id: Ulid,
        window_id: Ulid,
        start: Ms,
        duration_minutes: u32,
        #[serde(default)]
        price_override: Option<Decimal>,
    },
    ApproveBooking {
        booking_id: Ulid,
        expert_id: Ulid,
        decision: ApprovalDecision,
        #[serde(default)]
        note: Option<String>,
    },
    CancelBooking {
        booking_id: Ulid,
        actor: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    RescheduleBooking {
        booking_id: Ulid,
        actor: Ulid,
        window_id: Ulid,
        start: Ms,
    },
    GetBooking {
        booking_id: Ulid,
        party: Ulid,
    },
    ListBookings {
        party: Ulid,
        role: PartyRole,
    },
    ConfirmPayment {
        booking_id: Ulid,
        #[serde(default)]
        payment_reference: Option<String>,
    },
    FailPayment {
        booking_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    CompleteBooking {
        booking_id: Ulid,
    },
    ReviewBooking {
        booking_id: Ulid,
        user_id: Ulid,
        rating: u8,
        #[serde(default)]
        comment: Option<String>,
    },
    ListReviews {
        expert_id: Ulid,
    },
    ExpireBooking {
        booking_id: Ulid,
    },
    CreateWindow {
        expert_id: Ulid,
        start: Ms,
        end: Ms,
        price: Decimal,
        #[serde(default)]
        requires_approval: bool,
    },
    SetWindowStatus {
        window_id: Ulid,
        expert_id: Ulid,
        enabled: bool,
    },
    ListWindows {
        expert_id: Ulid,
    },
    CreatePattern {
        expert_id: Ulid,
        weekday: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        active_from: NaiveDate,
        #[serde(default)]
        active_until: Option<NaiveDate>,
    },
    SetPatternEnabled {
        pattern_id: Ulid,
        expert_id: Ulid,
        enabled: bool,
    },
    ListPatterns {
        expert_id: Ulid,
    },
    MaterializePattern {
        pattern_id: Ulid,
        expert_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        price: Decimal,
        #[serde(default)]
        requires_approval: bool,
    },
    /// Push every later notification addressed to `recipient` onto this
    /// connection.
    Subscribe {
        recipient: Ulid,
    },
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ApiError> {
        serde_json::from_str(line).map_err(|e| ApiError::invalid_input(format!("bad request: {e}")))
    }
}

/// Metric label for a request.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Ping => "ping",
        Request::CreateBooking { .. } => "create_booking",
        Request::ApproveBooking { .. } => "approve_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::RescheduleBooking { .. } => "reschedule_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::ConfirmPayment { .. } => "confirm_payment",
        Request::FailPayment { .. } => "fail_payment",
        Request::CompleteBooking { .. } => "complete_booking",
        Request::ExpireBooking { .. } => "expire_booking",
        Request::CreateWindow { .. } => "create_window",
        Request::SetWindowStatus { .. } => "set_window_status",
        Request::ListWindows { .. } => "list_windows",
        Request::CreatePattern { .. } => "create_pattern",
        Request::SetPatternEnabled { .. } => "set_pattern_enabled",
        Request::ListPatterns { .. } => "list_patterns",
        Request::MaterializePattern { .. } => "materialize_pattern",
        Request::ReviewBooking { .. } => "review_booking",
        Request::ListReviews { .. } => "list_reviews",
        Request::Subscribe { .. } => "subscribe",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ApiError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn from_result(result: Result<Value, ApiError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(e),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server-initiated line carrying a notification for a subscribed recipient.
#[derive(Debug, Serialize)]
pub struct Push<'a> {
    pub event: &'static str,
    pub data: &'a Notification,
}

impl<'a> Push<'a> {
    pub fn notification(data: &'a Notification) -> Self {
        Self {
            event: "notification",
            data,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
}
