use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable reference to a chat room between one user and one expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomRef(pub Ulid);

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room directory unavailable: {0}")]
    Unavailable(String),
}

/// External chat collaborator. Implementations must be idempotent: repeated
/// calls for the same pair return the same room.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn get_or_create_room(&self, user_id: Ulid, expert_id: Ulid) -> Result<RoomRef, RoomError>;
}

/// Process-local directory keyed by (user, expert).
#[derive(Default)]
pub struct InMemoryRooms {
    rooms: DashMap<(Ulid, Ulid), RoomRef>,
}

impl InMemoryRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl RoomDirectory for InMemoryRooms {
    async fn get_or_create_room(&self, user_id: Ulid, expert_id: Ulid) -> Result<RoomRef, RoomError> {
        let room = *self
            .rooms
            .entry((user_id, expert_id))
            .or_insert_with(|| RoomRef(Ulid::new()));
        Ok(room)
    }
}
