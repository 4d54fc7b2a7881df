use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{MaterializeRequest, NewPattern, NewWindow};
use crate::limits::MAX_LINE_LEN;
use crate::notify::Notification;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::protocol::{ProtocolError, Push, Request, Response, op_label};
use crate::service::{ApiError, BookingService};

/// What a connection should do after answering a request.
enum Followup {
    None,
    Subscribe(Ulid),
}

/// Serve one client until it hangs up. Requests on a connection are handled
/// in order; after `subscribe`, notifications for that recipient are
/// interleaved with responses.
pub async fn process_connection<S>(
    socket: S,
    service: Arc<BookingService>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    // Declared before the receiver so it drops after it, on every exit path.
    let mut channel = ChannelRelease {
        service: service.clone(),
        recipient: None,
    };
    let mut subscription: Option<broadcast::Receiver<Notification>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = match line {
                    Ok(line) => line,
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        // The codec stream ends after a framing error.
                        let err = ApiError {
                            code: "limit_exceeded",
                            message: format!("request line longer than {MAX_LINE_LEN} bytes"),
                        };
                        framed.send(Response::failure(err).encode()?).await?;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (response, followup) = handle_line(&service, &line).await;
                // Subscribed before the ack goes out, so nothing published after it is missed.
                if let Followup::Subscribe(recipient) = followup {
                    subscription = Some(service.engine().notify_hub().subscribe(recipient));
                    if let Some(previous) = channel.recipient.replace(recipient) {
                        service.engine().notify_hub().remove_idle(&previous);
                    }
                }
                framed.send(response.encode()?).await?;
            }
            notification = next_notification(&mut subscription) => {
                if let Some(n) = notification {
                    framed.send(Push::notification(&n).encode()?).await?;
                }
            }
        }
    }
    Ok(())
}

/// Drops the subscribed recipient's channel from the hub once this
/// connection was its last listener.
struct ChannelRelease {
    service: Arc<BookingService>,
    recipient: Option<Ulid>,
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        if let Some(recipient) = self.recipient {
            self.service.engine().notify_hub().remove_idle(&recipient);
        }
    }
}

/// Resolves with the next notification, or never when not subscribed.
async fn next_notification(
    subscription: &mut Option<broadcast::Receiver<Notification>>,
) -> Option<Notification> {
    let Some(rx) = subscription.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(n) => Some(n),
        Err(RecvError::Lagged(missed)) => {
            warn!("subscriber lagged, {missed} notifications dropped");
            None
        }
        Err(RecvError::Closed) => {
            *subscription = None;
            None
        }
    }
}

async fn handle_line(service: &BookingService, line: &str) -> (Response, Followup) {
    let started = Instant::now();
    let req = match Request::parse(line) {
        Ok(req) => req,
        Err(e) => {
            debug!("rejected request line: {e}");
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "error").increment(1);
            return (Response::failure(e), Followup::None);
        }
    };
    let op = op_label(&req);
    let followup = match &req {
        Request::Subscribe { recipient } => Followup::Subscribe(*recipient),
        _ => Followup::None,
    };
    let result = execute(service, req).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    let followup = if result.is_ok() { followup } else { Followup::None };
    (Response::from_result(result), followup)
}

fn to_data<T: Serialize>(value: T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError {
        code: "storage",
        message: format!("failed to encode response: {e}"),
    })
}

async fn execute(service: &BookingService, req: Request) -> Result<Value, ApiError> {
    match req {
        Request::Ping => to_data("pong"),
        Request::CreateBooking {
            user_id,
            window_id,
            start,
            duration_minutes,
            price_override,
        } => to_data(
            service
                .create_booking(user_id, window_id, start, duration_minutes, price_override)
                .await?,
        ),
        Request::ApproveBooking {
            booking_id,
            expert_id,
            decision,
            note,
        } => to_data(
            service
                .approve_booking(booking_id, expert_id, decision, note)
                .await?,
        ),
        Request::CancelBooking {
            booking_id,
            actor,
            reason,
        } => to_data(service.cancel_booking(booking_id, actor, reason).await?),
        Request::RescheduleBooking {
            booking_id,
            actor,
            window_id,
            start,
        } => to_data(
            service
                .reschedule_booking(booking_id, actor, window_id, start)
                .await?,
        ),
        Request::GetBooking { booking_id, party } => {
            to_data(service.get_booking(booking_id, party).await?)
        }
        Request::ListBookings { party, role } => to_data(service.list_bookings(party, role).await),
        Request::ConfirmPayment {
            booking_id,
            payment_reference,
        } => to_data(service.confirm_payment(booking_id, payment_reference).await?),
        Request::FailPayment { booking_id, reason } => {
            to_data(service.fail_payment(booking_id, reason).await?)
        }
        Request::CompleteBooking { booking_id } => {
            to_data(service.complete_booking(booking_id).await?)
        }
        Request::ExpireBooking { booking_id } => to_data(service.expire_booking(booking_id).await?),
        Request::CreateWindow {
            expert_id,
            start,
            end,
            price,
            requires_approval,
        } => to_data(
            service
                .create_window(NewWindow {
                    expert_id,
                    start,
                    end,
                    price,
                    requires_approval,
                })
                .await?,
        ),
        Request::SetWindowStatus {
            window_id,
            expert_id,
            enabled,
        } => to_data(service.set_window_status(window_id, expert_id, enabled).await?),
        Request::ListWindows { expert_id } => to_data(service.list_windows(expert_id).await),
        Request::CreatePattern {
            expert_id,
            weekday,
            start_time,
            end_time,
            active_from,
            active_until,
        } => to_data(
            service
                .create_pattern(NewPattern {
                    expert_id,
                    weekday,
                    start_time,
                    end_time,
                    active_from,
                    active_until,
                })
                .await?,
        ),
        Request::SetPatternEnabled {
            pattern_id,
            expert_id,
            enabled,
        } => to_data(
            service
                .set_pattern_enabled(pattern_id, expert_id, enabled)
                .await?,
        ),
        Request::ListPatterns { expert_id } => to_data(service.list_patterns(expert_id).await),
        Request::MaterializePattern {
            pattern_id,
            expert_id,
            from,
            to,
            price,
            requires_approval,
        } => to_data(
            service
                .materialize_pattern(MaterializeRequest {
                    pattern_id,
                    expert_id,
                    from,
                    to,
                    price,
                    requires_approval,
                })
                .await?,
        ),
        Request::ReviewBooking {
            booking_id,
            user_id,
            rating,
            comment,
        } => to_data(
            service
                .review_booking(booking_id, user_id, rating, comment)
                .await?,
        ),
        Request::ListReviews { expert_id } => to_data(service.list_reviews(expert_id)),
        Request::Subscribe { recipient } => to_data(SubscribeAck {
            subscribed: recipient,
        }),
    }
}

#[derive(Serialize)]
struct SubscribeAck {
    subscribed: Ulid,
}
