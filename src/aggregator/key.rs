use crate::matrix::{MessageEvent, RoomId, UserId};
use std::fmt;

/// Composite (room, sender) key. At most one text entry is pending per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    /// Room the messages were sent to
    pub room: RoomId,
    /// Sender of the messages
    pub sender: UserId,
}

impl AggregationKey {
    /// Create a key from its parts.
    #[must_use]
    pub fn new(room: impl Into<RoomId>, sender: impl Into<UserId>) -> Self {
        Self {
            room: room.into(),
            sender: sender.into(),
        }
    }

    /// Key under which `event` aggregates.
    #[must_use]
    pub fn for_event(event: &MessageEvent) -> Self {
        Self {
            room: event.room_id.clone(),
            sender: event.sender.clone(),
        }
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.room, self.sender)
    }
}
