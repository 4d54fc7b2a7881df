use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    BookingApproved,
    BookingDeclined,
    BookingConfirmed,
    BookingCancelled,
    BookingCompleted,
    BookingExpired,
    BookingFailed,
    BookingRescheduled,
    BookingReviewed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "booking_created",
            NotificationKind::BookingApproved => "booking_approved",
            NotificationKind::BookingDeclined => "booking_declined",
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::BookingCompleted => "booking_completed",
            NotificationKind::BookingExpired => "booking_expired",
            NotificationKind::BookingFailed => "booking_failed",
            NotificationKind::BookingRescheduled => "booking_rescheduled",
            NotificationKind::BookingReviewed => "booking_reviewed",
        }
    }
}

/// One message for one recipient about one booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Ulid,
    /// The other participant of the booking.
    pub counterpart: Ulid,
    pub booking_id: Ulid,
    pub start: Ms,
    pub at: Ms,
    pub reason: Option<String>,
}

impl Notification {
    pub fn about(kind: NotificationKind, recipient: Ulid, booking: &Booking, at: Ms) -> Self {
        let counterpart = if recipient == booking.user_id {
            booking.expert_id
        } else {
            booking.user_id
        };
        Self {
            kind,
            recipient,
            counterpart,
            booking_id: booking.id,
            start: booking.start,
            at,
            reason: booking.reason.clone(),
        }
    }
}

/// Fire-and-forget fan-out of booking notifications. Publishing never blocks
/// and never fails; slow or absent receivers simply miss messages.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications addressed to `recipient`. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every notification regardless of recipient.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        metrics::counter!(
            crate::observability::NOTIFICATIONS_PUBLISHED_TOTAL,
            "kind" => notification.kind.as_str()
        )
        .increment(1);
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }

    /// Drop a recipient's channel once nobody listens on it.
    pub fn remove_idle(&self, recipient: &Ulid) {
        self.channels
            .remove_if(recipient, |_, sender| sender.receiver_count() == 0);
    }
}
