use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_REVIEW_COMMENT_LEN;
use crate::model::*;
use crate::notify::NotificationKind;

use super::checks::clean_text;
use super::{Engine, EngineError};

impl Engine {
    /// The booking's user rates a completed session, once.
    pub async fn review(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        rating: u8,
        comment: Option<String>,
    ) -> Result<BookingReview, EngineError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(EngineError::invalid(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}"
            )));
        }
        let comment = clean_text(comment, MAX_REVIEW_COMMENT_LEN, "review comment too long")?;
        let now = self.now();

        let row = self
            .store
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        // Serializes competing reviews of the same booking.
        let booking = row.lock().await;
        if booking.user_id != user_id {
            return Err(EngineError::Forbidden(user_id));
        }
        if booking.status != BookingStatus::Completed {
            return Err(EngineError::ReviewNotAllowed("only completed sessions can be reviewed"));
        }
        if self.store.review(&booking_id).is_some() {
            return Err(EngineError::AlreadyReviewed(booking_id));
        }

        let review = BookingReview {
            id: Ulid::new(),
            booking_id,
            user_id,
            expert_id: booking.expert_id,
            rating,
            comment,
            created_at: now,
        };
        self.wal_append(&Event::ReviewCreated {
            review: review.clone(),
        })
        .await?;
        self.store.insert_review(review.clone());

        info!("booking {booking_id} reviewed: {rating}/{MAX_RATING}");
        self.publish(NotificationKind::BookingReviewed, booking.expert_id, &booking, now);
        Ok(review)
    }

    pub fn get_review(&self, booking_id: Ulid) -> Option<BookingReview> {
        self.store.review(&booking_id)
    }

    pub fn list_reviews(&self, expert_id: Ulid) -> Vec<BookingReview> {
        self.store.reviews_of(&expert_id)
    }
}
