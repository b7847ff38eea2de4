//! Matrix message event model
//!
//! The Matrix client (sync, encryption, membership) lives outside this crate.
//! It hands over already-parsed room message events in the shape below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }
    };
}

string_id!(
    /// Room identifier, e.g. `!abc:example.org`.
    RoomId
);
string_id!(
    /// User identifier, e.g. `@alice:example.org`.
    UserId
);
string_id!(
    /// Unique event identifier, e.g. `$evt:example.org`.
    EventId
);

/// Attachment metadata carried by image and file messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Content URI (`mxc://...`) of the uploaded media
    pub url: String,
    /// MIME type reported by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Message payload, tagged by the Matrix `msgtype`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgtype")]
pub enum MessageContent {
    /// Plain text message
    #[serde(rename = "m.text")]
    Text {
        /// Message text
        body: String,
    },
    /// Image upload
    #[serde(rename = "m.image")]
    Image {
        /// Fallback body, usually the file name
        body: String,
        /// Attachment metadata
        info: MediaInfo,
    },
    /// Generic file upload
    #[serde(rename = "m.file")]
    File {
        /// Fallback body, usually the file name
        body: String,
        /// Attachment metadata
        info: MediaInfo,
    },
}

/// Coarse message kind used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `m.text`
    Text,
    /// `m.image`
    Image,
    /// `m.file`
    File,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Image => f.write_str("image"),
            Self::File => f.write_str("file"),
        }
    }
}

/// A room message event as delivered by the Matrix client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Unique event ID
    pub event_id: EventId,
    /// Room the message was sent to
    pub room_id: RoomId,
    /// Sender of the message
    pub sender: UserId,
    /// Server timestamp
    #[serde(default = "Utc::now")]
    pub origin_server_ts: DateTime<Utc>,
    /// Message payload
    pub content: MessageContent,
}

impl MessageEvent {
    /// Build a text message event stamped with the current time.
    #[must_use]
    pub fn text(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(event_id),
            room_id: RoomId::new(room_id),
            sender: UserId::new(sender),
            origin_server_ts: Utc::now(),
            content: MessageContent::Text { body: body.into() },
        }
    }

    /// Build an image message event stamped with the current time.
    #[must_use]
    pub fn image(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        info: MediaInfo,
    ) -> Self {
        let body = info.file_name.clone().unwrap_or_else(|| "image".to_string());
        Self {
            event_id: EventId::new(event_id),
            room_id: RoomId::new(room_id),
            sender: UserId::new(sender),
            origin_server_ts: Utc::now(),
            content: MessageContent::Image { body, info },
        }
    }

    /// Build a file message event stamped with the current time.
    #[must_use]
    pub fn file(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        info: MediaInfo,
    ) -> Self {
        let body = info.file_name.clone().unwrap_or_else(|| "file".to_string());
        Self {
            event_id: EventId::new(event_id),
            room_id: RoomId::new(room_id),
            sender: UserId::new(sender),
            origin_server_ts: Utc::now(),
            content: MessageContent::File { body, info },
        }
    }

    /// Kind of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self.content {
            MessageContent::Text { .. } => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
            MessageContent::File { .. } => MessageKind::File,
        }
    }

    /// Text body for `m.text` messages.
    #[must_use]
    pub fn text_body(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { body } => Some(body),
            _ => None,
        }
    }

    /// Attachment metadata for image and file messages.
    #[must_use]
    pub fn media(&self) -> Option<&MediaInfo> {
        match &self.content {
            MessageContent::Image { info, .. } | MessageContent::File { info, .. } => Some(info),
            MessageContent::Text { .. } => None,
        }
    }
}
